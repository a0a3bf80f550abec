use crate::usage::{GpuInfo, HardwareUsage, HostProbe, SystemProbe};
use crate::worker::{WorkerCommand, WorkerFault, WorkerHandle};
use crate::{PoolConfig, PoolError, Task, UnitFactory};
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{oneshot, OnceCell};
use tracing::{debug, error, info, warn};

/// Fixed set of isolated workers shared by every caller.
///
/// Dropping the pool shuts it down: queued callers get
/// [`PoolError::PoolClosed`] and worker threads exit once idle.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

struct Shared {
    config: PoolConfig,
    factory: UnitFactory,
    workers: Mutex<Vec<WorkerHandle>>,
    slots: Mutex<Slots>,
    programs: DashMap<String, Arc<[u8]>>,
    /// Uploads broadcast but not yet confirmed by every worker.
    uploading: DashMap<String, Arc<[u8]>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
    probe: Arc<dyn HostProbe>,
    gpu: OnceCell<Option<GpuInfo>>,
}

/// Idle workers and the callers waiting for one, in arrival order.
#[derive(Default)]
struct Slots {
    idle: Vec<usize>,
    waiters: VecDeque<oneshot::Sender<WorkerLease>>,
}

/// Exclusive use of one worker slot. Dropping the lease releases the slot,
/// so a worker goes back exactly once whatever path the task took.
struct WorkerLease {
    shared: Arc<Shared>,
    index: usize,
    armed: bool,
}

impl WorkerLease {
    fn new(shared: Arc<Shared>, index: usize) -> Self {
        Self {
            shared,
            index,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.shared.release(self.index);
        }
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig, factory: UnitFactory) -> Result<Self, PoolError> {
        Self::with_probe(config, factory, Arc::new(SystemProbe::default()))
    }

    pub fn with_probe(
        config: PoolConfig,
        factory: UnitFactory,
        probe: Arc<dyn HostProbe>,
    ) -> Result<Self, PoolError> {
        let size = config.size.max(1);
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            workers.push(WorkerHandle::spawn(id, 0, factory.clone(), config.report_window)?);
        }

        info!(size, timeout_ms = config.task_timeout.as_millis() as u64, "worker pool ready");

        let shared = Arc::new(Shared {
            config,
            factory,
            workers: Mutex::new(workers),
            slots: Mutex::new(Slots {
                idle: (0..size).rev().collect(),
                waiters: VecDeque::new(),
            }),
            programs: DashMap::new(),
            uploading: DashMap::new(),
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            probe,
            gpu: OnceCell::new(),
        });

        Ok(Self { shared })
    }

    pub fn size(&self) -> usize {
        self.shared.lock_workers().len()
    }

    /// Workers currently in the idle set.
    pub fn idle(&self) -> usize {
        self.shared.lock_slots().idle.len()
    }

    /// Callers suspended until a worker frees up.
    pub fn waiting(&self) -> usize {
        self.shared.lock_slots().waiters.len()
    }

    /// Ids of every program successfully uploaded to all workers.
    pub fn programs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.programs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Registers `code` as `prog_id` on every worker.
    ///
    /// Succeeds only once all workers confirm. On any failure the program is
    /// unloaded everywhere and not recorded.
    pub async fn upload_program(&self, prog_id: &str, code: impl Into<Arc<[u8]>>) -> Result<(), PoolError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }
        let code: Arc<[u8]> = code.into();

        let acks = {
            let workers = self.shared.lock_workers();
            // Recorded under the workers lock so a worker regenerated before
            // every ack arrives is given this program too.
            self.shared.uploading.insert(prog_id.to_string(), code.clone());
            workers
                .iter()
                .map(|worker| {
                    let (tx, rx) = oneshot::channel();
                    let sent = worker.send(WorkerCommand::Upload {
                        prog_id: prog_id.to_string(),
                        code: code.clone(),
                        reply: Some(tx),
                    });
                    let terminated = worker.terminated.clone();
                    let id = worker.id;
                    async move {
                        if sent.is_err() {
                            return Err((id, "worker unavailable".to_string()));
                        }
                        tokio::select! {
                            ack = rx => match ack {
                                Ok(Ok(())) => Ok(()),
                                Ok(Err(reason)) => Err((id, reason)),
                                Err(_) => Err((id, "worker exited".to_string())),
                            },
                            _ = terminated.cancelled() => Err((id, "worker terminated".to_string())),
                        }
                    }
                })
                .collect::<Vec<_>>()
        };

        let failure = join_all(acks).await.into_iter().find_map(Result::err);
        if let Some((worker, reason)) = failure {
            warn!(program = %prog_id, worker, %reason, "upload failed");
            self.shared.uploading.remove(prog_id);
            self.shared.broadcast_unload(prog_id);
            return Err(PoolError::UploadFailed {
                prog_id: prog_id.to_string(),
                worker,
                reason,
            });
        }

        self.shared.programs.insert(prog_id.to_string(), code);
        self.shared.uploading.remove(prog_id);
        info!(program = %prog_id, workers = self.size(), "program uploaded");
        Ok(())
    }

    /// Runs `task` on the next free worker.
    ///
    /// The task runs to its terminal outcome even if the caller stops
    /// waiting, so the worker is never handed on while still busy.
    pub async fn enqueue_task(&self, task: Task) -> Result<Value, PoolError> {
        let shared = self.shared.clone();
        let task_id = task.task_id.clone();
        tokio::spawn(async move { shared.run_task(task).await })
            .await
            .unwrap_or_else(|e| {
                Err(PoolError::TaskExecution {
                    task_id,
                    reason: format!("scheduler task aborted: {e}"),
                })
            })
    }

    /// Samples utilization across workers plus host facts.
    pub async fn query_usage(&self) -> HardwareUsage {
        let shared = &self.shared;
        let gpu = shared
            .gpu
            .get_or_init(|| async {
                let probe = shared.probe.clone();
                tokio::task::spawn_blocking(move || probe.gpu()).await.ok().flatten()
            })
            .await
            .clone();

        let probe = shared.probe.clone();
        let storage = tokio::task::spawn_blocking(move || probe.storage())
            .await
            .unwrap_or_default();

        let busy: f64 = shared.lock_workers().iter().map(|w| w.meter.busy_fraction()).sum();

        HardwareUsage {
            cpus: shared.probe.cpus(),
            cpus_usage: busy * 100.0,
            gpu,
            gpu_usage: 0.0,
            storage_limit: storage.quota,
            storage_used: storage.usage,
        }
    }

    /// Stops accepting work, fails queued callers and terminates workers.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let waiters = std::mem::take(&mut self.shared.lock_slots().waiters);
        drop(waiters);
        for worker in self.shared.lock_workers().iter() {
            worker.terminate();
        }
        info!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn lock_workers(&self) -> MutexGuard<'_, Vec<WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire(self: &Arc<Self>) -> Result<WorkerLease, PoolError> {
        let rx = {
            let mut slots = self.lock_slots();
            if self.closed.load(Ordering::Acquire) {
                return Err(PoolError::PoolClosed);
            }
            if let Some(index) = slots.idle.pop() {
                return Ok(WorkerLease::new(self.clone(), index));
            }
            let (tx, rx) = oneshot::channel();
            slots.waiters.push_back(tx);
            rx
        };
        rx.await.map_err(|_| PoolError::PoolClosed)
    }

    /// Hands `index` to the longest waiting caller, or back to the idle set.
    fn release(self: &Arc<Self>, index: usize) {
        loop {
            let waiter = {
                let mut slots = self.lock_slots();
                match slots.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        slots.idle.push(index);
                        return;
                    }
                }
            };
            match waiter.send(WorkerLease::new(self.clone(), index)) {
                Ok(()) => return,
                // That caller gave up; try the next one.
                Err(lease) => lease.disarm(),
            }
        }
    }

    fn send_to(&self, index: usize, command: WorkerCommand) -> Result<u64, WorkerCommand> {
        let workers = self.lock_workers();
        let worker = &workers[index];
        worker.send(command).map(|_| worker.generation)
    }

    /// Terminates the worker in slot `index` and installs a fresh one that
    /// already holds every registered or in-flight program.
    fn regenerate(&self, index: usize) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut workers = self.lock_workers();
        workers[index].terminate();

        let fresh = match WorkerHandle::spawn(index, generation, self.factory.clone(), self.config.report_window) {
            Ok(fresh) => fresh,
            Err(e) => {
                error!(worker = index, "failed to regenerate worker: {e}");
                return;
            }
        };

        for entry in self.programs.iter().chain(self.uploading.iter()) {
            let _ = fresh.send(WorkerCommand::Upload {
                prog_id: entry.key().clone(),
                code: entry.value().clone(),
                reply: None,
            });
        }

        if self.closed.load(Ordering::Acquire) {
            fresh.terminate();
        }
        workers[index] = fresh;
        debug!(worker = index, generation, "worker regenerated");
    }

    fn broadcast_unload(&self, prog_id: &str) {
        for worker in self.lock_workers().iter() {
            let _ = worker.send(WorkerCommand::Unload {
                prog_id: prog_id.to_string(),
            });
        }
    }

    async fn run_task(self: Arc<Self>, task: Task) -> Result<Value, PoolError> {
        let lease = self.acquire().await?;
        let Task {
            prog_id,
            task_id,
            func_args,
        } = task;

        let (started_tx, started_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = WorkerCommand::Execute {
            prog_id,
            task_id: task_id.clone(),
            args: func_args,
            started: started_tx,
            reply: reply_tx,
        };

        if self.send_to(lease.index, command).is_err() {
            self.regenerate(lease.index);
            return Err(PoolError::TaskExecution {
                task_id,
                reason: "worker unavailable".to_string(),
            });
        }

        if started_rx.await.is_err() {
            self.regenerate(lease.index);
            return Err(PoolError::TaskExecution {
                task_id,
                reason: "worker exited before starting the task".to_string(),
            });
        }

        // The execution budget starts only now that the worker runs the task.
        let started = Instant::now();
        match tokio::time::timeout(self.config.task_timeout, reply_rx).await {
            Ok(Ok(Ok(value))) => {
                debug!(task = %task_id, worker = lease.index, "task completed");
                Ok(value)
            }
            Ok(Ok(Err(WorkerFault::ProgramNotFound(prog_id)))) => Err(PoolError::TaskExecution {
                task_id,
                reason: format!("program `{prog_id}` not found"),
            }),
            Ok(Ok(Err(WorkerFault::Execution(reason)))) => {
                warn!(task = %task_id, worker = lease.index, %reason, "task failed; regenerating worker");
                self.regenerate(lease.index);
                Err(PoolError::TaskExecution { task_id, reason })
            }
            Ok(Err(_)) => {
                self.regenerate(lease.index);
                Err(PoolError::TaskExecution {
                    task_id,
                    reason: "worker exited during execution".to_string(),
                })
            }
            Err(_) => {
                let elapsed = started.elapsed();
                warn!(task = %task_id, worker = lease.index, "task timed out; hard-killing worker");
                self.regenerate(lease.index);
                Err(PoolError::TaskTimeout { task_id, elapsed })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::StorageEstimate;
    use judge::{ExecutionUnit, Judge, NativeRegistry};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingProbe {
        gpu_calls: AtomicUsize,
    }

    impl HostProbe for CountingProbe {
        fn cpus(&self) -> usize {
            4
        }

        fn gpu(&self) -> Option<GpuInfo> {
            self.gpu_calls.fetch_add(1, Ordering::SeqCst);
            None
        }

        fn storage(&self) -> StorageEstimate {
            StorageEstimate { quota: 100, usage: 40 }
        }
    }

    fn registry(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> NativeRegistry {
        let mut registry = NativeRegistry::with_builtins();
        registry.register("echo", |args: &[Value]| Ok(Value::Array(args.to_vec())));
        registry.register("sleep", move |args: &[Value]| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(ms))
        });
        registry.register("fail", |_: &[Value]| Err("boom".to_string()));
        registry.register("panic", |_: &[Value]| -> Result<Value, String> { panic!("kaboom") });
        registry
    }

    struct Fixture {
        pool: Arc<WorkerPool>,
        peak: Arc<AtomicUsize>,
        probe: Arc<CountingProbe>,
    }

    async fn fixture(size: usize, timeout_ms: u64) -> Fixture {
        let peak = Arc::new(AtomicUsize::new(0));
        let natives = Arc::new(registry(Arc::new(AtomicUsize::new(0)), peak.clone()));
        let factory: UnitFactory = Arc::new(move || Box::new(Judge::new(natives.clone())) as Box<dyn ExecutionUnit>);
        let probe = Arc::new(CountingProbe {
            gpu_calls: AtomicUsize::new(0),
        });
        let config = PoolConfig {
            size,
            task_timeout: Duration::from_millis(timeout_ms),
            ..PoolConfig::default()
        };
        let pool = Arc::new(WorkerPool::with_probe(config, factory, probe.clone()).unwrap());
        for (id, code) in [("echo", "native:echo"), ("sleep", "native:sleep"), ("fail", "native:fail"), ("panic", "native:panic")] {
            pool.upload_program(id, code.as_bytes()).await.unwrap();
        }
        Fixture { pool, peak, probe }
    }

    #[tokio::test]
    async fn test_upload_then_execute() {
        let f = fixture(2, 5000).await;
        let out = f
            .pool
            .enqueue_task(Task::new("echo", "t1", vec![json!("hello"), json!(3)]))
            .await
            .unwrap();
        assert_eq!(out, json!(["hello", 3]));
        assert_eq!(f.pool.idle(), 2);
        assert_eq!(f.pool.programs(), vec!["echo", "fail", "panic", "sleep"]);
    }

    #[tokio::test]
    async fn test_unknown_program_is_execution_error() {
        let f = fixture(1, 5000).await;
        let err = f.pool.enqueue_task(Task::new("nope", "t1", vec![])).await.unwrap_err();
        match err {
            PoolError::TaskExecution { task_id, reason } => {
                assert_eq!(task_id, "t1");
                assert!(reason.contains("not found"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_no_program() {
        let f = fixture(3, 5000).await;
        let err = f.pool.upload_program("bad", &b"not a program"[..]).await.unwrap_err();
        assert!(matches!(err, PoolError::UploadFailed { ref prog_id, .. } if prog_id == "bad"));
        assert!(!f.pool.programs().contains(&"bad".to_string()));
        let err = f.pool.enqueue_task(Task::new("bad", "t", vec![])).await.unwrap_err();
        assert!(matches!(err, PoolError::TaskExecution { .. }));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_by_pool_size() {
        let f = fixture(2, 5000).await;
        let tasks: Vec<_> = (0..3)
            .map(|i| {
                let pool = f.pool.clone();
                tokio::spawn(async move { pool.enqueue_task(Task::new("sleep", format!("t{i}"), vec![json!(400)])).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.pool.idle(), 0);
        assert_eq!(f.pool.waiting(), 1);

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), json!(400));
        }
        assert_eq!(f.peak.load(Ordering::SeqCst), 2);
        assert_eq!(f.pool.idle(), 2);
        assert_eq!(f.pool.waiting(), 0);
    }

    #[tokio::test]
    async fn test_timeout_replaces_worker_and_keeps_programs() {
        let f = fixture(1, 200).await;
        let begin = Instant::now();
        let err = f
            .pool
            .enqueue_task(Task::new("sleep", "slow", vec![json!(3000)]))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err:?}");
        assert!(begin.elapsed() >= Duration::from_millis(200));

        assert_eq!(f.pool.size(), 1);
        assert_eq!(f.pool.idle(), 1);
        // The replacement got the registered programs replayed.
        let out = f.pool.enqueue_task(Task::new("echo", "after", vec![json!(1)])).await.unwrap();
        assert_eq!(out, json!([1]));
    }

    #[tokio::test]
    async fn test_queue_delay_does_not_count_against_timeout() {
        let f = fixture(1, 400).await;
        let first = {
            let pool = f.pool.clone();
            tokio::spawn(async move { pool.enqueue_task(Task::new("sleep", "a", vec![json!(250)])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Waits ~250ms for the worker, then runs 250ms: past 400ms from
        // enqueue but well inside the budget from its own start.
        let second = f.pool.enqueue_task(Task::new("sleep", "b", vec![json!(250)])).await;
        assert_eq!(second.unwrap(), json!(250));
        assert_eq!(first.await.unwrap().unwrap(), json!(250));
    }

    #[tokio::test]
    async fn test_errors_and_panics_regenerate_worker() {
        let f = fixture(1, 5000).await;
        let err = f.pool.enqueue_task(Task::new("fail", "f", vec![])).await.unwrap_err();
        assert!(matches!(err, PoolError::TaskExecution { ref reason, .. } if reason.contains("boom")));

        let err = f.pool.enqueue_task(Task::new("panic", "p", vec![])).await.unwrap_err();
        assert!(matches!(err, PoolError::TaskExecution { ref reason, .. } if reason.contains("kaboom")));

        assert_eq!(f.pool.size(), 1);
        let out = f.pool.enqueue_task(Task::new("echo", "ok", vec![])).await.unwrap();
        assert_eq!(out, json!([]));
    }

    #[tokio::test]
    async fn test_worker_regenerated_mid_upload_gets_the_program() {
        let f = fixture(2, 5000).await;

        // Worker 0 is busy, so its upload ack waits behind the sleep.
        let busy = {
            let pool = f.pool.clone();
            tokio::spawn(async move { pool.enqueue_task(Task::new("sleep", "busy", vec![json!(600)])).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let upload = {
            let pool = f.pool.clone();
            tokio::spawn(async move { pool.upload_program("late", &b"native:sleep"[..]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Worker 1 has acked; now fail a task on it so it is replaced.
        let err = f.pool.enqueue_task(Task::new("fail", "f", vec![])).await.unwrap_err();
        assert!(matches!(err, PoolError::TaskExecution { .. }));

        upload.await.unwrap().unwrap();
        assert_eq!(busy.await.unwrap().unwrap(), json!(600));
        assert!(f.pool.programs().contains(&"late".to_string()));

        // Both slots must run it.
        let (a, b) = tokio::join!(
            f.pool.enqueue_task(Task::new("late", "l1", vec![json!(100)])),
            f.pool.enqueue_task(Task::new("late", "l2", vec![json!(100)])),
        );
        assert_eq!(a.unwrap(), json!(100));
        assert_eq!(b.unwrap(), json!(100));
        assert_eq!(f.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gpu_probed_once() {
        let f = fixture(2, 5000).await;
        for _ in 0..3 {
            let usage = f.pool.query_usage().await;
            assert_eq!(usage.cpus, 4);
            assert_eq!(usage.storage_limit, 100);
            assert_eq!(usage.storage_used, 40);
            assert!(usage.gpu.is_none());
        }
        assert_eq!(f.probe.gpu_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let f = fixture(1, 5000).await;
        f.pool.shutdown();
        let err = f.pool.enqueue_task(Task::new("echo", "t", vec![])).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolClosed));
        assert!(matches!(
            f.pool.upload_program("x", &b"native:echo"[..]).await,
            Err(PoolError::PoolClosed)
        ));
    }
}
