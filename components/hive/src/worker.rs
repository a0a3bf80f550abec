use crate::UnitFactory;
use judge::ProgramHandle;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) enum WorkerCommand {
    Upload {
        prog_id: String,
        code: Arc<[u8]>,
        reply: Option<oneshot::Sender<Result<(), String>>>,
    },
    Unload {
        prog_id: String,
    },
    Execute {
        prog_id: String,
        task_id: String,
        args: Vec<Value>,
        started: oneshot::Sender<()>,
        reply: oneshot::Sender<Result<Value, WorkerFault>>,
    },
}

#[derive(Debug)]
pub(crate) enum WorkerFault {
    ProgramNotFound(String),
    Execution(String),
}

/// The pool's side of one worker thread.
///
/// Dropping the handle closes the command queue; `terminate` additionally
/// tells the thread to abandon whatever is still queued. A thread stuck
/// inside an invocation cannot be interrupted and is simply abandoned.
pub(crate) struct WorkerHandle {
    pub id: usize,
    pub generation: u64,
    pub meter: Arc<UsageMeter>,
    pub terminated: CancellationToken,
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    pub fn spawn(
        id: usize,
        generation: u64,
        factory: UnitFactory,
        report_window: Duration,
    ) -> std::io::Result<Self> {
        let (commands, rx) = mpsc::unbounded_channel();
        let meter = Arc::new(UsageMeter::new(report_window));
        let terminated = CancellationToken::new();

        let thread_meter = meter.clone();
        let thread_token = terminated.clone();
        thread::Builder::new()
            .name(format!("hive-worker-{id}.{generation}"))
            .spawn(move || run(id, factory, rx, thread_meter, thread_token))?;

        debug!(worker = id, generation, "worker spawned");
        Ok(Self {
            id,
            generation,
            meter,
            terminated,
            commands,
        })
    }

    pub fn send(&self, command: WorkerCommand) -> Result<(), WorkerCommand> {
        self.commands.send(command).map_err(|e| e.0)
    }

    pub fn terminate(&self) {
        self.terminated.cancel();
    }
}

fn run(
    id: usize,
    factory: UnitFactory,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    meter: Arc<UsageMeter>,
    terminated: CancellationToken,
) {
    let mut unit = factory();
    let mut programs: HashMap<String, ProgramHandle> = HashMap::new();

    while let Some(command) = commands.blocking_recv() {
        if terminated.is_cancelled() {
            break;
        }

        match command {
            WorkerCommand::Upload { prog_id, code, reply } => {
                let loaded = panic::catch_unwind(AssertUnwindSafe(|| unit.load(&code)));
                let outcome = match loaded {
                    Ok(Ok(handle)) => {
                        programs.insert(prog_id, handle);
                        Ok(())
                    }
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(payload) => Err(panic_message(payload)),
                };
                match reply {
                    Some(reply) => {
                        let _ = reply.send(outcome);
                    }
                    None => {
                        if let Err(reason) = outcome {
                            warn!(worker = id, %reason, "program replay failed");
                        }
                    }
                }
            }
            WorkerCommand::Unload { prog_id } => {
                programs.remove(&prog_id);
            }
            WorkerCommand::Execute {
                prog_id,
                task_id,
                args,
                started,
                reply,
            } => {
                let _ = started.send(());
                let Some(&handle) = programs.get(&prog_id) else {
                    let _ = reply.send(Err(WorkerFault::ProgramNotFound(prog_id)));
                    continue;
                };

                debug!(worker = id, task = %task_id, program = %prog_id, "executing");
                meter.begin();
                let invoked = panic::catch_unwind(AssertUnwindSafe(|| unit.invoke(handle, &args)));
                meter.end();

                if terminated.is_cancelled() {
                    break;
                }

                let outcome = match invoked {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(WorkerFault::Execution(e.to_string())),
                    Err(payload) => Err(WorkerFault::Execution(panic_message(payload))),
                };
                let _ = reply.send(outcome);
            }
        }
    }

    debug!(worker = id, "worker thread exiting");
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("worker panicked: {msg}")
    } else {
        "worker panicked".to_string()
    }
}

/// Wall-clock time spent inside entry points, per fixed window.
///
/// `busy_fraction` reports the last completed window, clamped to `[0, 1]`.
#[derive(Debug)]
pub(crate) struct UsageMeter {
    window: Duration,
    state: Mutex<MeterState>,
}

#[derive(Debug)]
struct MeterState {
    window_start: Instant,
    busy: Duration,
    running_since: Option<Instant>,
    last: f64,
}

impl MeterState {
    fn roll(&mut self, now: Instant, window: Duration) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < window || elapsed.is_zero() {
            return;
        }

        let mut busy = self.busy;
        if let Some(since) = self.running_since {
            busy += now.saturating_duration_since(since.max(self.window_start));
            self.running_since = Some(now);
        }

        self.last = (busy.as_secs_f64() / elapsed.as_secs_f64()).clamp(0.0, 1.0);
        self.window_start = now;
        self.busy = Duration::ZERO;
    }
}

impl UsageMeter {
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    fn starting_at(window: Duration, now: Instant) -> Self {
        Self {
            window,
            state: Mutex::new(MeterState {
                window_start: now,
                busy: Duration::ZERO,
                running_since: None,
                last: 0.0,
            }),
        }
    }

    pub fn begin(&self) {
        self.begin_at(Instant::now());
    }

    pub fn end(&self) {
        self.end_at(Instant::now());
    }

    pub fn busy_fraction(&self) -> f64 {
        self.fraction_at(Instant::now())
    }

    fn begin_at(&self, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.roll(now, self.window);
        state.running_since = Some(now);
    }

    fn end_at(&self, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.roll(now, self.window);
        if let Some(since) = state.running_since.take() {
            state.busy += now.saturating_duration_since(since);
        }
    }

    fn fraction_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.roll(now, self.window);
        state.last
    }
}
