use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::Fault;
use crate::protocol::RequestId;
use crate::sandbox::{ExecutionOutcome, Interpreter, Sandbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Accepting,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Execute { code: String, debug: bool },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Executed(ExecutionOutcome),
    ShutdownAccepted,
    Cancelled,
}

pub struct PendingJob {
    pub seq: u64,
    pub request_id: RequestId,
    pub job: Job,
    pub status: JobStatus,
    pub enqueued_at: Instant,
    respond_to: oneshot::Sender<JobOutcome>,
}

/// Handle for one queued job's completion signal.
pub struct Ticket {
    seq: u64,
    receiver: oneshot::Receiver<JobOutcome>,
}

impl Ticket {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Waits for the job to finish. On timeout the job is left alone; it still
    /// runs and its outcome is dropped.
    pub async fn wait(self, timeout: Duration) -> Result<JobOutcome, Fault> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(Fault::Internal(
                "completion signal dropped before the job finished".to_owned(),
            )),
            Err(_) => Err(Fault::Timeout(timeout)),
        }
    }

    pub fn try_outcome(&mut self) -> Option<JobOutcome> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSnapshot {
    pub state: BridgeState,
    pub queued: usize,
    pub running: Option<u64>,
    pub completed: u64,
    pub cancelled: u64,
    pub rejected: u64,
}

struct Inner {
    state: BridgeState,
    queue: VecDeque<PendingJob>,
    running: Option<u64>,
    next_seq: u64,
    completed: u64,
    cancelled: u64,
    rejected: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    work_ready: Condvar,
    capacity: usize,
    shutdown: watch::Sender<bool>,
}

/// Thread-safe hand-off from network tasks to the single main-thread
/// consumer. At most one job is Running at any instant.
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
}

struct RunningGuard<'a> {
    shared: &'a Shared,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut inner = lock(&self.shared.inner);
        inner.running = None;
        inner.completed += 1;
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Bridge {
    pub fn new(capacity: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: BridgeState::Accepting,
                    queue: VecDeque::new(),
                    running: None,
                    next_seq: 0,
                    completed: 0,
                    cancelled: 0,
                    rejected: 0,
                }),
                work_ready: Condvar::new(),
                capacity: capacity.max(1),
                shutdown,
            }),
        }
    }

    pub fn enqueue(&self, request_id: RequestId, job: Job) -> Result<Ticket, Fault> {
        let mut inner = lock(&self.shared.inner);
        if inner.state != BridgeState::Accepting {
            inner.rejected += 1;
            return Err(Fault::ServerShuttingDown);
        }
        if inner.queue.len() >= self.shared.capacity {
            inner.rejected += 1;
            return Err(Fault::ServerBusy(format!(
                "queue is full ({} jobs)",
                self.shared.capacity
            )));
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let (respond_to, receiver) = oneshot::channel();
        debug!(seq, id = %request_id, depth = inner.queue.len() + 1, "job queued");
        inner.queue.push_back(PendingJob {
            seq,
            request_id,
            job,
            status: JobStatus::Queued,
            enqueued_at: Instant::now(),
            respond_to,
        });
        drop(inner);
        self.shared.work_ready.notify_one();
        Ok(Ticket { seq, receiver })
    }

    pub async fn submit(
        &self,
        request_id: RequestId,
        job: Job,
        timeout: Duration,
    ) -> Result<JobOutcome, Fault> {
        self.enqueue(request_id, job)?.wait(timeout).await
    }

    /// Runs at most one queued job on the calling thread. Returns `false`
    /// when the queue is empty or another job is already running.
    pub fn drain_one<I: Interpreter>(&self, sandbox: &mut Sandbox<I>) -> bool {
        let mut pending = {
            let mut inner = lock(&self.shared.inner);
            if inner.running.is_some() {
                return false;
            }
            let Some(pending) = inner.queue.pop_front() else {
                return false;
            };
            inner.running = Some(pending.seq);
            pending
        };
        let guard = RunningGuard {
            shared: &self.shared,
        };
        pending.status = JobStatus::Running;
        let waited = pending.enqueued_at.elapsed();

        let outcome = match &pending.job {
            Job::Execute { code, debug } => {
                let started = Instant::now();
                let outcome = sandbox.run(code, *debug);
                info!(
                    seq = pending.seq,
                    id = %pending.request_id,
                    ok = outcome.is_success(),
                    waited_ms = waited.as_millis() as u64,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
                JobOutcome::Executed(outcome)
            }
            Job::Shutdown => JobOutcome::ShutdownAccepted,
        };
        pending.status = JobStatus::Completed;
        // The queue is closed before the shutdown reply goes out, so nothing
        // can slip in behind it.
        let cancelled = match outcome {
            JobOutcome::ShutdownAccepted => self.stop_accepting(),
            _ => None,
        };
        if pending.respond_to.send(outcome).is_err() {
            debug!(seq = pending.seq, "requester stopped waiting; outcome dropped");
        }
        drop(guard);
        if let Some(cancelled) = cancelled {
            self.announce_shutdown(cancelled);
        }
        true
    }

    /// Stops accepting work and cancels everything still queued. Idempotent.
    pub fn begin_shutdown(&self) {
        if let Some(cancelled) = self.stop_accepting() {
            self.announce_shutdown(cancelled);
        }
    }

    /// Leaves `Accepting` and empties the queue in one critical section.
    /// `None` if shutdown had already begun.
    fn stop_accepting(&self) -> Option<Vec<PendingJob>> {
        let mut inner = lock(&self.shared.inner);
        if inner.state != BridgeState::Accepting {
            return None;
        }
        inner.state = BridgeState::Draining;
        let cancelled: Vec<PendingJob> = inner.queue.drain(..).collect();
        inner.cancelled += cancelled.len() as u64;
        Some(cancelled)
    }

    fn announce_shutdown(&self, cancelled: Vec<PendingJob>) {
        info!(cancelled = cancelled.len(), "bridge draining");
        for mut pending in cancelled {
            pending.status = JobStatus::Cancelled;
            let _ = pending.respond_to.send(JobOutcome::Cancelled);
        }
        self.shared.shutdown.send_replace(true);
        self.shared.work_ready.notify_all();
    }

    /// Final transition once the main loop has stopped polling.
    pub fn close(&self) {
        self.begin_shutdown();
        let mut inner = lock(&self.shared.inner);
        if inner.state != BridgeState::Stopped {
            inner.state = BridgeState::Stopped;
            info!(completed = inner.completed, "bridge stopped");
        }
    }

    /// Blocks until work is queued, shutdown begins, or `timeout` passes.
    pub fn wait_for_work(&self, timeout: Duration) {
        let inner = lock(&self.shared.inner);
        if !inner.queue.is_empty() || inner.state != BridgeState::Accepting {
            return;
        }
        let result = self
            .shared
            .work_ready
            .wait_timeout_while(inner, timeout, |inner| {
                inner.queue.is_empty() && inner.state == BridgeState::Accepting
            });
        if let Err(err) = result {
            warn!("bridge lock poisoned while waiting: {err}");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == BridgeState::Accepting
    }

    /// True once shutdown has begun and nothing is queued or running.
    pub fn is_drained(&self) -> bool {
        let inner = lock(&self.shared.inner);
        inner.state != BridgeState::Accepting && inner.queue.is_empty() && inner.running.is_none()
    }

    pub fn state(&self) -> BridgeState {
        lock(&self.shared.inner).state
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        let inner = lock(&self.shared.inner);
        BridgeSnapshot {
            state: inner.state,
            queued: inner.queue.len(),
            running: inner.running,
            completed: inner.completed,
            cancelled: inner.cancelled,
            rejected: inner.rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::thread;

    use super::*;
    use crate::fake::ScriptedInterpreter;

    fn execute(code: &str) -> Job {
        Job::Execute {
            code: code.to_owned(),
            debug: false,
        }
    }

    fn result_of(outcome: JobOutcome) -> serde_json::Value {
        match outcome {
            JobOutcome::Executed(ExecutionOutcome::Success { result, .. }) => result,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn jobs_drain_in_fifo_order() {
        let bridge = Bridge::new(8);
        let interpreter = ScriptedInterpreter::new();
        let probe = interpreter.probe();
        let mut sandbox = Sandbox::new(interpreter);

        let tickets: Vec<Ticket> = (1..=3)
            .map(|n| {
                bridge
                    .enqueue(RequestId::from(n), execute(&format!("mark job{n}\nresult = {n}")))
                    .expect("enqueue")
            })
            .collect();
        while bridge.drain_one(&mut sandbox) {}

        for (n, ticket) in (1..=3).zip(tickets) {
            let outcome = ticket.wait(Duration::from_secs(1)).await.expect("outcome");
            assert_eq!(result_of(outcome), serde_json::json!(n));
        }
        assert_eq!(probe.log(), ["job1", "job2", "job3"]);
        assert_eq!(bridge.snapshot().completed, 3);
    }

    #[test]
    fn full_queue_is_busy() {
        let bridge = Bridge::new(2);
        let _a = bridge.enqueue(RequestId::from(1), execute("")).expect("first");
        let _b = bridge.enqueue(RequestId::from(2), execute("")).expect("second");
        let err = bridge
            .enqueue(RequestId::from(3), execute(""))
            .err()
            .expect("third is rejected");
        assert!(matches!(err, Fault::ServerBusy(_)));
        assert_eq!(bridge.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn timeout_does_not_cancel_the_job() {
        let bridge = Bridge::new(4);
        let interpreter = ScriptedInterpreter::new();
        let probe = interpreter.probe();
        let mut sandbox = Sandbox::new(interpreter);

        let err = bridge
            .submit(RequestId::from(1), execute("mark late"), Duration::from_millis(10))
            .await
            .expect_err("nobody drains yet");
        assert_eq!(err, Fault::Timeout(Duration::from_millis(10)));
        assert_eq!(bridge.snapshot().queued, 1);

        assert!(bridge.drain_one(&mut sandbox));
        assert_eq!(probe.log(), ["late"]);
    }

    #[tokio::test]
    async fn shutdown_job_answers_then_cancels_the_rest() {
        let bridge = Bridge::new(8);
        let mut sandbox = Sandbox::new(ScriptedInterpreter::new());
        let mut signal = bridge.shutdown_signal();

        let stop = bridge.enqueue(RequestId::from(1), Job::Shutdown).expect("shutdown");
        let behind = bridge.enqueue(RequestId::from(2), execute("result = 1")).expect("behind");
        assert!(bridge.drain_one(&mut sandbox));

        assert_eq!(
            stop.wait(Duration::from_secs(1)).await,
            Ok(JobOutcome::ShutdownAccepted)
        );
        assert_eq!(
            behind.wait(Duration::from_secs(1)).await,
            Ok(JobOutcome::Cancelled)
        );
        assert!(signal.has_changed().expect("sender alive"));
        assert!(*signal.borrow_and_update());
        assert_eq!(
            bridge.enqueue(RequestId::from(3), execute("")).err(),
            Some(Fault::ServerShuttingDown)
        );
        assert!(bridge.is_drained());
        assert!(!bridge.drain_one(&mut sandbox));

        bridge.close();
        let snapshot = bridge.snapshot();
        assert_eq!(snapshot.state, BridgeState::Stopped);
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(sandbox.executions(), 0);
    }

    #[tokio::test]
    async fn queue_is_closed_before_the_shutdown_reply_arrives() {
        let bridge = Bridge::new(8);
        let first = ScriptedInterpreter::new();
        let second = first.sharing_probe();
        let probe = first.probe();

        let stop = bridge.enqueue(RequestId::from(1), Job::Shutdown).expect("shutdown");
        let behind = bridge.enqueue(RequestId::from(2), execute("mark behind")).expect("behind");
        let drainers: Vec<_> = [first, second]
            .into_iter()
            .map(|interpreter| {
                let bridge = bridge.clone();
                thread::spawn(move || {
                    let mut sandbox = Sandbox::new(interpreter);
                    while !bridge.is_drained() {
                        if !bridge.drain_one(&mut sandbox) {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        assert_eq!(
            stop.wait(Duration::from_secs(5)).await,
            Ok(JobOutcome::ShutdownAccepted)
        );
        assert!(!bridge.is_accepting());
        assert_eq!(
            bridge.enqueue(RequestId::from(3), execute("mark late")).err(),
            Some(Fault::ServerShuttingDown)
        );
        assert_eq!(
            behind.wait(Duration::from_secs(5)).await,
            Ok(JobOutcome::Cancelled)
        );
        for handle in drainers {
            handle.join().expect("drainer");
        }
        assert_eq!(probe.executions.load(Ordering::SeqCst), 0);
        assert!(probe.log().is_empty());
    }

    #[test]
    fn running_slot_is_cleared_after_a_panic() {
        let bridge = Bridge::new(4);
        let mut sandbox = Sandbox::new(ScriptedInterpreter::new());
        let mut ticket = bridge.enqueue(RequestId::from(1), execute("panic")).expect("enqueue");
        assert!(bridge.drain_one(&mut sandbox));
        assert!(matches!(
            ticket.try_outcome(),
            Some(JobOutcome::Executed(ExecutionOutcome::Failure { .. }))
        ));
        assert_eq!(bridge.snapshot().running, None);
        let _next = bridge.enqueue(RequestId::from(2), execute("")).expect("enqueue");
        assert!(bridge.drain_one(&mut sandbox));
    }

    #[test]
    fn two_draining_threads_never_overlap() {
        let bridge = Bridge::new(64);
        let first = ScriptedInterpreter::new();
        let second = first.sharing_probe();
        let probe = first.probe();
        for n in 0..20 {
            bridge
                .enqueue(RequestId::from(n), execute("sleep 2"))
                .expect("enqueue");
        }

        let handles: Vec<_> = [first, second]
            .into_iter()
            .map(|interpreter| {
                let bridge = bridge.clone();
                thread::spawn(move || {
                    let mut sandbox = Sandbox::new(interpreter);
                    while bridge.snapshot().queued > 0 || bridge.snapshot().running.is_some() {
                        if !bridge.drain_one(&mut sandbox) {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("drainer");
        }

        assert_eq!(probe.executions.load(Ordering::SeqCst), 20);
        assert_eq!(probe.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_for_work_returns_when_a_job_arrives() {
        let bridge = Bridge::new(4);
        let producer = bridge.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.enqueue(RequestId::from(1), execute("")).expect("enqueue")
        });
        let started = Instant::now();
        bridge.wait_for_work(Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(5));
        let _ticket = handle.join().expect("producer");
        assert_eq!(bridge.snapshot().queued, 1);
    }
}
