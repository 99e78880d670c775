use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::link::CommandInterface;
use crate::protocol::DynoCommand;
use crate::telemetry::TelemetryHandle;
use crate::utils::wait::sleep_or_cancel;

use super::{
    state::{SequenceKind, SequencerSnapshot, SequencerStatus},
    sweep::{
        grid_plan, speed_setpoints, stabilization_time, GridStep, SampleAccumulator,
        SweepDataPoint, SAMPLES_PER_POINT, SAMPLE_INTERVAL,
    },
    validation::{GridSweepParams, SpeedSweepParams, ValidationErrors},
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("sequence already running")]
    AlreadyRunning,
    #[error("invalid sweep parameters: {0}")]
    Invalid(#[from] ValidationErrors),
}

#[derive(Debug, Clone, Serialize)]
pub enum SequencerEvent {
    Status(SequencerSnapshot),
    DataPoint(SweepDataPoint),
    /// Sent after the safety reset.
    Finished(SequencerSnapshot),
}

enum Plan {
    Speed {
        setpoints: Vec<i32>,
        step_duration: Duration,
    },
    Grid {
        steps: Vec<GridStep>,
        stabilization: Duration,
    },
}

impl Plan {
    fn len(&self) -> usize {
        match self {
            Plan::Speed { setpoints, .. } => setpoints.len(),
            Plan::Grid { steps, .. } => steps.len(),
        }
    }
}

/// Why a run left its step loop early.
enum Interrupt {
    Cancelled,
    SendFailed(String),
}

#[derive(Default)]
struct SequencerState {
    snapshot: SequencerSnapshot,
    cancel: Option<CancellationToken>,
    supervisor: Option<JoinHandle<()>>,
}

/// Runs one sweep at a time against the dyno.
///
/// Each run is a worker task under a supervisor task. The supervisor always
/// sends `speed 0` and `load 0.0` once the worker ends, whether it finished,
/// was stopped, lost the link or panicked, and only then publishes the final
/// status.
#[derive(Clone)]
pub struct TestSequencer {
    commands: CommandInterface,
    telemetry: TelemetryHandle,
    state: Arc<Mutex<SequencerState>>,
    data: Arc<Mutex<Vec<SweepDataPoint>>>,
    events: broadcast::Sender<SequencerEvent>,
}

impl TestSequencer {
    pub fn new(commands: CommandInterface, telemetry: TelemetryHandle) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            commands,
            telemetry,
            state: Arc::new(Mutex::new(SequencerState::default())),
            data: Arc::new(Mutex::new(Vec::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequencerEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> SequencerSnapshot {
        self.state.lock().await.snapshot.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.snapshot.status.is_active()
    }

    pub async fn sweep_data(&self) -> Vec<SweepDataPoint> {
        self.data.lock().await.clone()
    }

    pub async fn clear_sweep_data(&self) {
        self.data.lock().await.clear();
    }

    pub async fn start_speed_sweep(&self, params: SpeedSweepParams) -> Result<Uuid, SequenceError> {
        self.launch(SequenceKind::SpeedSweep, || {
            params.validate()?;
            Ok(Plan::Speed {
                setpoints: speed_setpoints(&params),
                step_duration: Duration::from_secs_f64(params.step_duration_s),
            })
        })
        .await
    }

    pub async fn start_grid_sweep(&self, params: GridSweepParams) -> Result<Uuid, SequenceError> {
        self.launch(SequenceKind::GridSweep, || {
            params.validate()?;
            Ok(Plan::Grid {
                steps: grid_plan(&params),
                stabilization: stabilization_time(params.step_duration_s),
            })
        })
        .await
    }

    /// Requests cancellation. `false` when nothing is running (or a stop is
    /// already in progress).
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.snapshot.status != SequencerStatus::Running {
            return false;
        }

        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }
        state.snapshot.status = SequencerStatus::Stopping;
        let _ = self
            .events
            .send(SequencerEvent::Status(state.snapshot.clone()));
        info!("Stop requested for sequence {:?}", state.snapshot.run_id);
        true
    }

    /// Waits until the current run (if any) has sent its safety reset and
    /// published its final status.
    ///
    /// Several callers may wait on the same run; only one of them joins the
    /// supervisor, the others follow the `Finished` event.
    pub async fn wait(&self) {
        let (supervisor, mut events) = {
            let mut state = self.state.lock().await;
            let events = self.events.subscribe();
            match state.supervisor.take() {
                Some(handle) => (Some(handle), events),
                None if state.snapshot.status.is_active() => (None, events),
                None => return,
            }
        };

        if let Some(handle) = supervisor {
            if let Err(err) = handle.await {
                error!("Sequence supervisor failed: {err}");
            }
            return;
        }

        loop {
            match events.recv().await {
                Ok(SequencerEvent::Finished(_)) | Err(broadcast::error::RecvError::Closed) => {
                    return
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    }

    async fn launch<F>(&self, kind: SequenceKind, build: F) -> Result<Uuid, SequenceError>
    where
        F: FnOnce() -> Result<Plan, ValidationErrors>,
    {
        let mut state = self.state.lock().await;
        if state.snapshot.status.is_active() {
            return Err(SequenceError::AlreadyRunning);
        }

        let run_id = Uuid::new_v4();
        state.snapshot = SequencerSnapshot::begin(kind, run_id, 0);
        let _ = self
            .events
            .send(SequencerEvent::Status(state.snapshot.clone()));

        let plan = match build() {
            Ok(plan) => plan,
            Err(errors) => {
                warn!("Rejected {kind:?}: {errors}");
                state.snapshot = SequencerSnapshot {
                    message: Some(errors.to_string()),
                    ..SequencerSnapshot::default()
                };
                let _ = self
                    .events
                    .send(SequencerEvent::Status(state.snapshot.clone()));
                return Err(errors.into());
            }
        };

        if kind == SequenceKind::GridSweep {
            self.data.lock().await.clear();
        }

        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());
        state.snapshot.total_steps = plan.len();
        state.snapshot.status = SequencerStatus::Running;
        let _ = self
            .events
            .send(SequencerEvent::Status(state.snapshot.clone()));

        let run = RunContext {
            run_id,
            commands: self.commands.clone(),
            telemetry: self.telemetry.clone(),
            state: Arc::clone(&self.state),
            data: Arc::clone(&self.data),
            events: self.events.clone(),
            cancel,
        };
        state.supervisor = Some(tokio::spawn(supervise(run, plan)));

        info!(
            "Started {kind:?} {run_id} with {} steps",
            state.snapshot.total_steps
        );
        Ok(run_id)
    }
}

#[derive(Clone)]
struct RunContext {
    run_id: Uuid,
    commands: CommandInterface,
    telemetry: TelemetryHandle,
    state: Arc<Mutex<SequencerState>>,
    data: Arc<Mutex<Vec<SweepDataPoint>>>,
    events: broadcast::Sender<SequencerEvent>,
    cancel: CancellationToken,
}

impl RunContext {
    fn ensure_running(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<(), Interrupt> {
        if sleep_or_cancel(duration, &self.cancel).await {
            Ok(())
        } else {
            Err(Interrupt::Cancelled)
        }
    }

    fn send(&self, command: DynoCommand) -> Result<(), Interrupt> {
        if self.commands.send(&command) {
            Ok(())
        } else {
            Err(Interrupt::SendFailed(command.to_string()))
        }
    }

    async fn progress(&self, step: usize, message: String) {
        let mut state = self.state.lock().await;
        state.snapshot.current_step = step;
        state.snapshot.message = Some(message);
        let _ = self
            .events
            .send(SequencerEvent::Status(state.snapshot.clone()));
    }
}

async fn supervise(run: RunContext, plan: Plan) {
    let worker = tokio::spawn(run_plan(run.clone(), plan));
    let result = worker.await;

    run.commands.set_drive_speed(0);
    run.commands.set_brake_load(0.0);

    let (status, message) = match result {
        Ok(Ok(())) if run.cancel.is_cancelled() => (SequencerStatus::Stopped, None),
        Ok(Ok(())) => (SequencerStatus::Completed, None),
        Ok(Err(Interrupt::Cancelled)) => (SequencerStatus::Stopped, None),
        Ok(Err(Interrupt::SendFailed(line))) => (
            SequencerStatus::Failed,
            Some(format!("communication failure: could not send '{line}'")),
        ),
        Err(join_err) => (
            SequencerStatus::Failed,
            Some(format!("sequence task aborted: {join_err}")),
        ),
    };

    let snapshot = {
        let mut state = run.state.lock().await;
        state.snapshot.status = status;
        state.snapshot.message = message;
        state.cancel = None;
        state.snapshot.clone()
    };

    match status {
        SequencerStatus::Failed => error!(
            "Sequence {} failed: {}",
            run.run_id,
            snapshot.message.as_deref().unwrap_or("unknown error")
        ),
        _ => info!("Sequence {} finished: {status:?}", run.run_id),
    }
    let _ = run.events.send(SequencerEvent::Finished(snapshot));
}

async fn run_plan(run: RunContext, plan: Plan) -> Result<(), Interrupt> {
    match plan {
        Plan::Speed {
            setpoints,
            step_duration,
        } => {
            let total = setpoints.len();
            for (i, rpm) in setpoints.into_iter().enumerate() {
                run.ensure_running()?;
                run.progress(i + 1, format!("Step {}/{total}: {rpm} RPM", i + 1))
                    .await;
                run.send(DynoCommand::Speed(rpm))?;
                run.sleep(step_duration).await?;
            }
        }
        Plan::Grid {
            steps,
            stabilization,
        } => {
            let total = steps.len();
            for step in steps {
                run.ensure_running()?;
                if step.new_rpm {
                    run.send(DynoCommand::Speed(step.target_rpm as i32))?;
                }
                run.progress(
                    step.step_number,
                    format!(
                        "Step {}/{total}: {:.0} RPM, {:.2} A",
                        step.step_number, step.target_rpm, step.target_amperage
                    ),
                )
                .await;
                run.send(DynoCommand::Load(step.target_amperage))?;
                run.sleep(stabilization).await?;

                let mut samples = SampleAccumulator::default();
                for i in 0..SAMPLES_PER_POINT {
                    samples.push(&run.telemetry.current());
                    if i + 1 < SAMPLES_PER_POINT {
                        run.sleep(SAMPLE_INTERVAL).await?;
                    }
                }

                if let Some(point) = samples.finish(run.run_id, &step) {
                    run.data.lock().await.push(point.clone());
                    let _ = run.events.send(SequencerEvent::DataPoint(point));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testing::RecordingSink;
    use crate::protocol::{MotorFrame, TelemetryFrame};
    use tokio::time::{self, Instant};

    fn rig() -> (RecordingSink, TestSequencer, TelemetryHandle) {
        let sink = RecordingSink::default();
        let commands = CommandInterface::new(Box::new(sink.clone()));
        let telemetry = TelemetryHandle::default();
        let sequencer = TestSequencer::new(commands, telemetry.clone());
        (sink, sequencer, telemetry)
    }

    fn grid(step_duration_s: f64) -> GridSweepParams {
        GridSweepParams {
            rpm_range: (0.0, 1000.0),
            amperage_range: (0.0, 10.0),
            rpm_steps: 2,
            amperage_steps: 2,
            step_duration_s,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn speed_sweep_sends_setpoints_then_safety_reset() {
        let (sink, sequencer, _telemetry) = rig();
        let mut events = sequencer.subscribe();
        let started = Instant::now();

        sequencer
            .start_speed_sweep(SpeedSweepParams {
                start_rpm: 0.0,
                end_rpm: 1000.0,
                steps: 5,
                step_duration_s: 2.0,
            })
            .await
            .unwrap();
        sequencer.wait().await;

        assert_eq!(
            sink.lines(),
            vec![
                "speed 0", "speed 250", "speed 500", "speed 750", "speed 1000", "speed 0",
                "load 0.0"
            ]
        );
        assert!(started.elapsed() >= Duration::from_secs(10));

        let snapshot = sequencer.snapshot().await;
        assert_eq!(snapshot.status, SequencerStatus::Completed);
        assert_eq!(snapshot.current_step, 5);
        assert_eq!(snapshot.total_steps, 5);

        let mut finished = None;
        while let Ok(event) = events.try_recv() {
            if let SequencerEvent::Finished(snapshot) = event {
                finished = Some(snapshot.status);
            }
        }
        assert_eq!(finished, Some(SequencerStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn grid_sweep_orders_load_descending_and_averages_each_point() {
        let (sink, sequencer, telemetry) = rig();
        telemetry.ingest(&TelemetryFrame {
            drive: Some(MotorFrame {
                rpm: Some(512.0),
                temp_fet: Some(40.0),
                ..Default::default()
            }),
            brake: Some(MotorFrame {
                current: Some(4.5),
                temp_fet: Some(45.0),
                ..Default::default()
            }),
            ..Default::default()
        });

        let run_id = sequencer.start_grid_sweep(grid(3.0)).await.unwrap();
        sequencer.wait().await;

        assert_eq!(
            sink.lines(),
            vec![
                "speed 0", "load 10.0", "load 0.0", "speed 1000", "load 10.0", "load 0.0",
                "speed 0", "load 0.0"
            ]
        );

        let data = sequencer.sweep_data().await;
        let targets: Vec<(f64, f64)> = data
            .iter()
            .map(|p| (p.target_rpm, p.target_amperage))
            .collect();
        assert_eq!(
            targets,
            vec![(0.0, 10.0), (0.0, 0.0), (1000.0, 10.0), (1000.0, 0.0)]
        );
        for point in &data {
            assert_eq!(point.run_id, run_id);
            assert_eq!(point.sample_count, SAMPLES_PER_POINT);
            assert_eq!(point.actual_rpm, 512.0);
            assert_eq!(point.actual_amperage, 4.5);
            assert_eq!(point.max_temp_fet, 45.0);
            assert_eq!(point.actual_rpm_std, 0.0);
        }
        assert_eq!(data[2].step_number, 3);

        sequencer.clear_sweep_data().await;
        assert!(sequencer.sweep_data().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_grid_is_rejected_before_any_command() {
        let mut params = grid(5.0);
        params.rpm_steps = 50;
        params.amperage_steps = 50;
        let (sink, sequencer, _telemetry) = rig();

        let err = sequencer.start_grid_sweep(params).await.unwrap_err();
        let SequenceError::Invalid(errors) = err else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.messages().len(), 1);
        assert!(sink.lines().is_empty());
        assert_eq!(sequencer.snapshot().await.status, SequencerStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_while_running_is_rejected() {
        let (_sink, sequencer, _telemetry) = rig();
        sequencer.start_grid_sweep(grid(5.0)).await.unwrap();

        let err = sequencer
            .start_speed_sweep(SpeedSweepParams {
                start_rpm: 0.0,
                end_rpm: 100.0,
                steps: 2,
                step_duration_s: 1.0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SequenceError::AlreadyRunning));
        assert_eq!(err.to_string(), "sequence already running");

        assert!(sequencer.stop().await);
        sequencer.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_sample_window_is_prompt_and_drops_the_point() {
        let (sink, sequencer, _telemetry) = rig();
        assert!(!sequencer.stop().await);

        sequencer.start_grid_sweep(grid(3.0)).await.unwrap();
        // Stabilization is 1 s; this lands inside the first sampling window.
        time::sleep(Duration::from_millis(1_500)).await;

        let requested = Instant::now();
        assert!(sequencer.stop().await);
        assert_eq!(sequencer.snapshot().await.status, SequencerStatus::Stopping);
        sequencer.wait().await;
        assert!(requested.elapsed() < SAMPLE_INTERVAL);

        assert_eq!(sequencer.snapshot().await.status, SequencerStatus::Stopped);
        assert!(sequencer.sweep_data().await.is_empty());
        assert_eq!(sink.lines(), vec!["speed 0", "load 10.0", "speed 0", "load 0.0"]);

        // Idempotent once stopped.
        assert!(!sequencer.stop().await);
        assert!(!sequencer.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn every_waiter_returns_after_the_safety_reset() {
        let (sink, sequencer, _telemetry) = rig();
        sequencer.start_grid_sweep(grid(5.0)).await.unwrap();
        time::sleep(Duration::from_millis(500)).await;

        let first = tokio::spawn({
            let sequencer = sequencer.clone();
            async move { sequencer.wait().await }
        });
        tokio::task::yield_now().await;
        assert!(sequencer.stop().await);
        // The supervisor handle already belongs to the first waiter.
        sequencer.wait().await;

        assert_eq!(sequencer.snapshot().await.status, SequencerStatus::Stopped);
        let lines = sink.lines();
        assert_eq!(&lines[lines.len() - 2..], ["speed 0", "load 0.0"]);
        first.await.unwrap();

        // Nothing to wait for once idle.
        sequencer.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn link_failure_fails_the_run_but_still_attempts_reset() {
        let (sink, sequencer, _telemetry) = rig();
        let mut audit = sequencer.commands.subscribe();
        sink.set_failing(true);

        sequencer
            .start_speed_sweep(SpeedSweepParams {
                start_rpm: 100.0,
                end_rpm: 200.0,
                steps: 2,
                step_duration_s: 1.0,
            })
            .await
            .unwrap();
        sequencer.wait().await;

        let snapshot = sequencer.snapshot().await;
        assert_eq!(snapshot.status, SequencerStatus::Failed);
        assert_eq!(
            snapshot.message.as_deref(),
            Some("communication failure: could not send 'speed 100'")
        );

        let mut attempted = Vec::new();
        while let Ok(sent) = audit.try_recv() {
            assert!(!sent.delivered);
            attempted.push(sent.line);
        }
        assert_eq!(attempted, vec!["speed 100", "speed 0", "load 0.0"]);

        // A new run can start after a failure.
        sink.set_failing(false);
        assert!(sequencer.start_grid_sweep(grid(1.0)).await.is_ok());
        assert!(sequencer.stop().await);
        sequencer.wait().await;
    }
}
