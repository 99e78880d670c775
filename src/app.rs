use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex as StdMutex, MutexGuard,
};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::dispatch::{Dispatcher, LinkEvent, EVENT_CAPACITY};
use crate::link::{open_serial, CommandInterface, LineSink, LineSource, LinkReader};
use crate::response::{PingTracker, ResponseOutcome, ResponseTest, ResponseTester};
use crate::sequencer::TestSequencer;
use crate::settings::{SerialSettings, SettingsStore};
use crate::sim::{Scenario, SimulatedDyno};
use crate::telemetry::TelemetryHandle;

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

struct Connection {
    port: String,
    reader: LinkReader,
    dispatcher: JoinHandle<()>,
    cancel: CancellationToken,
    sim: Option<SimulatedDyno>,
}

struct ActiveTest {
    id: u64,
    cancel: CancellationToken,
}

/// Everything a front end needs: one link, one telemetry model, one store.
///
/// The command interface, telemetry model and ping tracker outlive
/// individual connections, so the sequencer and tester built on them keep
/// working across reconnects.
pub struct DynoApp {
    settings: SettingsStore,
    db: Database,
    telemetry: TelemetryHandle,
    pings: PingTracker,
    commands: CommandInterface,
    sequencer: TestSequencer,
    tester: ResponseTester,
    link_events: broadcast::Sender<LinkEvent>,
    connection: Mutex<Option<Connection>>,
    active_test: StdMutex<Option<ActiveTest>>,
    next_test_id: AtomicU64,
}

impl DynoApp {
    pub fn new(settings: SettingsStore) -> Result<Self> {
        let storage = settings.storage();
        let db = Database::new(storage.database_path.clone()).with_context(|| {
            format!(
                "failed to open session store at {}",
                storage.database_path.display()
            )
        })?;

        let telemetry = TelemetryHandle::new(settings.telemetry().history_capacity);
        let pings = PingTracker::new();
        let commands = CommandInterface::detached();
        let sequencer = TestSequencer::new(commands.clone(), telemetry.clone());
        let tester = ResponseTester::new(commands.clone(), telemetry.clone(), pings.clone());
        let (link_events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            settings,
            db,
            telemetry,
            pings,
            commands,
            sequencer,
            tester,
            link_events,
            connection: Mutex::new(None),
            active_test: StdMutex::new(None),
            next_test_id: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    pub fn commands(&self) -> &CommandInterface {
        &self.commands
    }

    pub fn sequencer(&self) -> &TestSequencer {
        &self.sequencer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_events.subscribe()
    }

    /// Opens the port named in the settings (`"sim"` for the simulator).
    pub async fn connect(&self) -> Result<()> {
        let serial = self.settings.serial();
        if serial.is_simulated() {
            let scenario: Scenario = serial.sim_scenario.parse()?;
            self.connect_simulator(SimulatedDyno::new(scenario), &serial)
                .await
        } else {
            let (source, sink) = open_serial(
                &serial.port,
                serial.baud_rate,
                Duration::from_millis(serial.read_timeout_ms),
            )?;
            self.attach(serial.port.clone(), Box::new(source), Box::new(sink), None)
                .await
        }
    }

    pub async fn connect_simulator(
        &self,
        dyno: SimulatedDyno,
        serial: &SerialSettings,
    ) -> Result<()> {
        let (source, sink) = dyno.transport(Duration::from_millis(serial.read_timeout_ms));
        let port = format!("sim:{}", dyno.scenario());
        self.attach(port, Box::new(source), Box::new(sink), Some(dyno))
            .await
    }

    async fn attach(
        &self,
        port: String,
        source: Box<dyn LineSource>,
        sink: Box<dyn LineSink>,
        sim: Option<SimulatedDyno>,
    ) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if let Some(existing) = connection.as_ref() {
            bail!("already connected to {}", existing.port);
        }

        let (reader, device_events) = LinkReader::spawn(source)?;
        self.commands.attach(sink);

        let storage = self.settings.storage();
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(self.telemetry.clone(), self.pings.clone())
            .with_store(self.db.clone(), storage.clear_session_on_restart)
            .with_events(self.link_events.clone())
            .spawn(device_events, cancel.clone());

        info!("Connected to {port}");
        *connection = Some(Connection {
            port,
            reader,
            dispatcher,
            cancel,
            sim,
        });
        Ok(())
    }

    /// Stops any sweep and waits for its safety reset, then tears the link
    /// down. `false` when not connected.
    pub async fn disconnect(&self) -> Result<bool> {
        // A stop may already be in flight; wait for its reset either way.
        self.sequencer.stop().await;
        self.sequencer.wait().await;
        self.cancel_response_test();

        let Some(connection) = self.connection.lock().await.take() else {
            return Ok(false);
        };

        self.commands.detach();
        connection.cancel.cancel();
        let reader = connection.reader;
        tokio::task::spawn_blocking(move || reader.stop())
            .await
            .context("link reader shutdown panicked")?;
        if let Err(err) = connection.dispatcher.await {
            error!("Dispatcher task failed: {err}");
        }

        info!("Disconnected from {}", connection.port);
        Ok(true)
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    pub async fn port(&self) -> Option<String> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.port.clone())
    }

    /// The simulator behind the current link, if any.
    pub async fn simulator(&self) -> Option<SimulatedDyno> {
        self.connection
            .lock()
            .await
            .as_ref()
            .and_then(|c| c.sim.clone())
    }

    /// Cancels any sweep or response test, then sends `estop`.
    pub async fn emergency_stop(&self) -> bool {
        self.cancel_response_test();
        self.sequencer.stop().await;
        let sent = self.commands.emergency_stop();
        if !sent {
            warn!("Emergency stop could not be sent");
        }
        sent
    }

    /// Runs one response-time test; [`DynoApp::cancel_response_test`]
    /// aborts it. A test started while another runs cancels the older one.
    pub async fn run_response_test(&self, test: ResponseTest) -> ResponseOutcome {
        let id = self.next_test_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let replaced = self.lock_active_test().replace(ActiveTest {
            id,
            cancel: cancel.clone(),
        });
        if let Some(previous) = replaced {
            info!("Response test {} replaced by {id}", previous.id);
            previous.cancel.cancel();
        }

        let outcome = self.tester.run(test, &cancel).await;

        let mut active = self.lock_active_test();
        if active.as_ref().is_some_and(|current| current.id == id) {
            active.take();
        }
        outcome
    }

    pub fn cancel_response_test(&self) -> bool {
        match self.lock_active_test().take() {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn purge_old_data(&self) -> Result<usize> {
        let days = self.settings.storage().retention_days;
        let removed = self.db.purge_older_than(days).await?;
        if removed > 0 {
            info!("Purged {removed} samples older than {days} days");
        }
        Ok(removed)
    }

    /// Hourly retention purge until `cancel` fires.
    pub fn spawn_retention(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let app = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(RETENTION_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = app.purge_old_data().await {
                            error!("Retention purge failed: {err:#}");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    fn lock_active_test(&self) -> MutexGuard<'_, Option<ActiveTest>> {
        match self.active_test.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::{SequencerStatus, SpeedSweepParams};
    use crate::settings::DynoSettings;
    use tempfile::tempdir;

    fn app_in(dir: &std::path::Path) -> DynoApp {
        let settings = SettingsStore::new(dir.join("settings.json")).unwrap();
        let mut values = DynoSettings::default();
        values.storage.database_path = dir.join("dyno.db");
        values.serial.read_timeout_ms = 20;
        settings.update(values).unwrap();
        DynoApp::new(settings).unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn simulator_telemetry_reaches_model_and_store() {
        let dir = tempdir().unwrap();
        let app = app_in(dir.path());
        app.connect().await.unwrap();
        assert!(app.is_connected().await);
        assert!(app.connect().await.is_err());

        let telemetry = app.telemetry().clone();
        wait_for(|| telemetry.plot_data().len() >= 3).await;

        assert!(app.disconnect().await.unwrap());
        assert!(!app.is_connected().await);
        assert!(!app.disconnect().await.unwrap());
        assert!(!app.commands().is_attached());

        let session = app.telemetry().session_start().unwrap();
        let rows = app.db().get_session_samples(session, None).await.unwrap();
        assert!(rows.len() >= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ping_test_against_simulator_reports_latency() {
        let dir = tempdir().unwrap();
        let app = app_in(dir.path());
        app.connect().await.unwrap();

        let outcome = app
            .run_response_test(ResponseTest::Ping {
                iterations: 3,
                delay: Duration::from_millis(20),
            })
            .await;
        let ResponseOutcome::Ping(stats) = outcome else {
            panic!("expected ping stats, got {outcome:?}");
        };
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.received, 3);

        app.disconnect().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_stops_a_running_sweep() {
        let dir = tempdir().unwrap();
        let app = app_in(dir.path());
        app.connect().await.unwrap();
        let sim = app.simulator().await.unwrap();
        assert_eq!(sim.scenario(), Scenario::Idle);

        app.sequencer()
            .start_speed_sweep(SpeedSweepParams {
                start_rpm: 500.0,
                end_rpm: 1500.0,
                steps: 3,
                step_duration_s: 5.0,
            })
            .await
            .unwrap();
        assert!(app.sequencer().is_running().await);

        app.disconnect().await.unwrap();
        assert_eq!(
            app.sequencer().snapshot().await.status,
            SequencerStatus::Stopped
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_after_stop_still_delivers_the_reset() {
        let dir = tempdir().unwrap();
        let app = app_in(dir.path());
        app.connect().await.unwrap();
        let mut audit = app.commands().subscribe();

        app.sequencer()
            .start_speed_sweep(SpeedSweepParams {
                start_rpm: 500.0,
                end_rpm: 1500.0,
                steps: 3,
                step_duration_s: 5.0,
            })
            .await
            .unwrap();
        assert!(app.sequencer().stop().await);
        // The stop above is still in flight; disconnect must not race it.
        assert!(app.disconnect().await.unwrap());

        let mut sent = Vec::new();
        while let Ok(command) = audit.try_recv() {
            sent.push((command.line, command.delivered));
        }
        assert!(sent.len() >= 2, "{sent:?}");
        assert_eq!(
            &sent[sent.len() - 2..],
            [("speed 0".to_string(), true), ("load 0.0".to_string(), true)]
        );
        assert_eq!(
            app.sequencer().snapshot().await.status,
            SequencerStatus::Stopped
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replacing_a_response_test_keeps_the_new_one_cancellable() {
        let dir = tempdir().unwrap();
        let app = Arc::new(app_in(dir.path()));
        app.connect().await.unwrap();

        let step = ResponseTest::Step {
            target_rpm: 500,
            duration: Duration::from_secs(5),
            sample_rate_hz: 50.0,
        };
        let first = tokio::spawn({
            let app = Arc::clone(&app);
            let test = step.clone();
            async move { app.run_response_test(test).await }
        });
        time::sleep(Duration::from_millis(300)).await;
        let second = tokio::spawn({
            let app = Arc::clone(&app);
            async move { app.run_response_test(step).await }
        });

        let outcome = first.await.unwrap();
        assert!(matches!(outcome, ResponseOutcome::Cancelled), "{outcome:?}");

        // The replaced run must not clear the slot of the one that replaced it.
        assert!(app.cancel_response_test());
        let outcome = second.await.unwrap();
        assert!(matches!(outcome, ResponseOutcome::Cancelled), "{outcome:?}");
        assert!(!app.cancel_response_test());

        app.disconnect().await.unwrap();
    }
}
