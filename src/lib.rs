mod app;
pub mod db;
pub mod dispatch;
pub mod export;
pub mod link;
pub mod protocol;
pub mod response;
pub mod sequencer;
pub mod settings;
pub mod sim;
pub mod telemetry;
mod utils;

use std::{str::FromStr, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{info, warn};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub use app::DynoApp;

use response::ResponseTest;
use sequencer::{GridSweepParams, SequencerEvent, SpeedSweepParams};
use settings::SettingsStore;

const USAGE: &str = "usage: dynobench [ports | monitor | ping [N] | step RPM SECS | \
sweep START END STEPS STEP_S | grid RPM_START RPM_END RPM_STEPS AMP_START AMP_END AMP_STEPS STEP_S]";

pub fn run() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(run_command(args))
}

async fn run_command(args: Vec<String>) -> Result<()> {
    let command = args.first().map(String::as_str).unwrap_or("monitor");
    if command == "ports" {
        for port in link::list_ports()? {
            println!("{port}");
        }
        return Ok(());
    }

    let settings = SettingsStore::from_env()?;
    info!("Dyno bench starting (settings: {})", settings.path().display());
    let app = Arc::new(DynoApp::new(settings)?);
    if let Err(err) = app.purge_old_data().await {
        warn!("Startup retention purge failed: {err:#}");
    }

    app.connect().await?;
    let shutdown = CancellationToken::new();
    let retention = app.spawn_retention(shutdown.clone());

    let result = match command {
        "monitor" => monitor(&app).await,
        "ping" => {
            let iterations = optional_arg(&args, 1, "N")?.unwrap_or(10);
            response_test(
                &app,
                ResponseTest::Ping {
                    iterations,
                    delay: Duration::from_millis(100),
                },
            )
            .await
        }
        "step" => {
            let test = ResponseTest::Step {
                target_rpm: arg(&args, 1, "RPM")?,
                duration: Duration::from_secs_f64(arg(&args, 2, "SECS")?),
                sample_rate_hz: 100.0,
            };
            response_test(&app, test).await
        }
        "sweep" => {
            let params = SpeedSweepParams {
                start_rpm: arg(&args, 1, "START")?,
                end_rpm: arg(&args, 2, "END")?,
                steps: arg(&args, 3, "STEPS")?,
                step_duration_s: arg(&args, 4, "STEP_S")?,
            };
            app.sequencer().start_speed_sweep(params).await?;
            follow_sequence(&app).await
        }
        "grid" => {
            let params = GridSweepParams {
                rpm_range: (arg(&args, 1, "RPM_START")?, arg(&args, 2, "RPM_END")?),
                rpm_steps: arg(&args, 3, "RPM_STEPS")?,
                amperage_range: (arg(&args, 4, "AMP_START")?, arg(&args, 5, "AMP_END")?),
                amperage_steps: arg(&args, 6, "AMP_STEPS")?,
                step_duration_s: arg(&args, 7, "STEP_S")?,
            };
            app.sequencer().start_grid_sweep(params).await?;
            follow_sequence(&app).await?;
            export_grid(&app).await
        }
        other => Err(anyhow::anyhow!("unknown command '{other}'\n{USAGE}")),
    };

    shutdown.cancel();
    if let Err(err) = retention.await {
        warn!("Retention task failed: {err}");
    }
    app.disconnect().await?;
    result
}

/// Prints a one-line status every second until Ctrl-C.
async fn monitor(app: &DynoApp) -> Result<()> {
    let mut ticker = time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !app.telemetry().has_data() {
                    continue;
                }
                let s = app.telemetry().current();
                println!(
                    "drive {:>6.0} rpm {:>5.1} A | brake {:>5.1} A | power {:>6.1} W | fet {:>4.1} C",
                    s.drive.rpm,
                    s.drive.current,
                    s.brake.current,
                    s.dyno.mechanical_power,
                    s.max_temp_fet()
                );
            }
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                return Ok(());
            }
        }
    }
}

async fn response_test(app: &DynoApp, test: ResponseTest) -> Result<()> {
    let outcome = tokio::select! {
        outcome = app.run_response_test(test) => outcome,
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            app.cancel_response_test();
            bail!("response test interrupted");
        }
    };
    println!("{}", outcome.summary());
    Ok(())
}

/// Streams sequencer progress until the run finishes; Ctrl-C stops it.
async fn follow_sequence(app: &DynoApp) -> Result<()> {
    let mut events = app.sequencer().subscribe();
    let finished = async {
        loop {
            match events.recv().await {
                Ok(SequencerEvent::Status(snapshot)) => {
                    if let Some(message) = snapshot.message {
                        println!("{message}");
                    }
                }
                Ok(SequencerEvent::DataPoint(point)) => println!(
                    "  point {}: {:.0} rpm, {:.2} A, {:.1} W",
                    point.step_number, point.actual_rpm, point.actual_amperage, point.mechanical_power
                ),
                Ok(SequencerEvent::Finished(snapshot)) => return Some(snapshot),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    };

    tokio::select! {
        snapshot = finished => {
            if let Some(snapshot) = snapshot {
                println!("Sequence finished: {:?}", snapshot.status);
            }
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            app.sequencer().stop().await;
        }
    }
    app.sequencer().wait().await;
    Ok(())
}

async fn export_grid(app: &DynoApp) -> Result<()> {
    let points = app.sequencer().sweep_data().await;
    if points.is_empty() {
        println!("No sweep data to export");
        return Ok(());
    }
    let path = std::path::PathBuf::from(export::default_filename("dyno_test_results"));
    export::export_to_file(&path, |writer| {
        export::write_sweep_csv(writer, &points, Utc::now())
    })?;
    println!("Sweep results exported to {}", path.display());
    Ok(())
}

fn arg<T>(args: &[String], index: usize, name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_arg(args, index, name)? {
        Some(value) => Ok(value),
        None => bail!("missing {name}\n{USAGE}"),
    }
}

fn optional_arg<T>(args: &[String], index: usize, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    args.get(index)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|err| anyhow::anyhow!("invalid {name} '{raw}': {err}"))
        })
        .transpose()
}
