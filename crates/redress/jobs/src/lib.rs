//! Queue worker framework for the pipeline phases.
//!
//! Jobs implement [`Job`] and are enqueued onto named queues consumed by
//! independent tokio worker pools. The framework enforces:
//! - unique-per-key jobs (a second enqueue while the key is held is
//!   dropped, which is how per-upload phase idempotency works)
//! - retry with the fixed backoff schedule for transient failures
//! - self-release: a job observing an open circuit returns
//!   [`JobOutcome::Release`] and goes back on the queue after a delay
//!   without consuming one of its tries
//!
//! Cancellation bits live in the KV; jobs check them between units of
//! work and return early without raising.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use async_trait::async_trait;
use redress_cache::{Kv as _, KvHandle};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The named queues of the system (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Default,
    High,
    Vop,
    Bav,
    Billing,
    Reconciliation,
    Webhooks,
    Exports,
    EmpRefresh,
}

impl QueueName {
    pub const ALL: [QueueName; 9] = [
        QueueName::Default,
        QueueName::High,
        QueueName::Vop,
        QueueName::Bav,
        QueueName::Billing,
        QueueName::Reconciliation,
        QueueName::Webhooks,
        QueueName::Exports,
        QueueName::EmpRefresh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::High => "high",
            Self::Vop => "vop",
            Self::Bav => "bav",
            Self::Billing => "billing",
            Self::Reconciliation => "reconciliation",
            Self::Webhooks => "webhooks",
            Self::Exports => "exports",
            Self::EmpRefresh => "emp-refresh",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-level errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Retried with backoff up to the job's `max_tries`.
    #[error("transient job failure: {0}")]
    Transient(String),

    /// Never retried; the job's `on_failure` hook runs immediately.
    #[error("permanent job failure: {0}")]
    Permanent(String),
}

/// What a completed `run` asks the framework to do next.
#[derive(Debug)]
pub enum JobOutcome {
    Done,
    /// Put the job back on its queue after `delay` without consuming a
    /// try (circuit-open self-release).
    Release { delay: Duration },
}

/// Context handed to every job run.
#[derive(Clone)]
pub struct JobCtx {
    pub kv: KvHandle,
    /// 1-based try counter for this job instance.
    pub try_number: u32,
}

/// A unit of queued work.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn queue(&self) -> QueueName {
        QueueName::Default
    }

    /// Human-readable label for logs.
    fn name(&self) -> &str;

    /// Unique-per-key lock; while held, further enqueues of the same key
    /// are dropped.
    fn identity_key(&self) -> Option<String> {
        None
    }

    fn max_tries(&self) -> u32 {
        3
    }

    /// Wall-clock limit for one run; overruns count as transient
    /// failures.
    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    /// Backoff schedule indexed by failed try (capped at the last entry).
    fn backoff(&self) -> &'static [Duration] {
        const SCHEDULE: [Duration; 3] = [
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(60),
        ];
        &SCHEDULE
    }

    async fn run(&self, ctx: &JobCtx) -> Result<JobOutcome, JobError>;

    /// Invoked once when the job fails permanently or exhausts its tries.
    async fn on_failure(&self, _error: &JobError) {}
}

struct QueuedJob {
    job: Arc<dyn Job>,
    tries: u32,
}

type QueueTx = mpsc::UnboundedSender<QueuedJob>;

/// Worker-pool runner over the named queues.
pub struct JobRunner {
    kv: KvHandle,
    senders: HashMap<QueueName, QueueTx>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobRunner {
    /// Identity locks auto-expire in case a worker dies mid-job.
    const IDENTITY_TTL: Duration = Duration::from_secs(2 * 60 * 60);

    /// Spawn worker pools; `workers_for` maps each queue to its pool size.
    pub fn start(kv: KvHandle, workers_for: impl Fn(QueueName) -> usize) -> Arc<Self> {
        let mut senders = HashMap::new();
        let mut spawned: Vec<(QueueName, usize, Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>)> =
            Vec::new();
        for queue in QueueName::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(queue, tx);
            spawned.push((queue, workers_for(queue).max(1), Arc::new(Mutex::new(rx))));
        }
        let runner = Arc::new(Self {
            kv,
            senders,
            handles: Mutex::new(Vec::new()),
        });
        for (queue, workers, rx) in spawned {
            for worker in 0..workers {
                let worker_runner = runner.clone();
                let rx = rx.clone();
                let handle = tokio::spawn(async move {
                    worker_runner.worker_loop(queue, worker, rx).await;
                });
                // Registering the handle cannot block: the runner was just
                // created and nothing else holds the lock yet.
                if let Ok(mut handles) = runner.handles.try_lock() {
                    handles.push(handle);
                }
            }
        }
        runner
    }

    /// The KV shared with every job context.
    pub fn kv(&self) -> &KvHandle {
        &self.kv
    }

    /// Enqueue a job. Returns `false` if an identity-keyed twin is
    /// already queued or running.
    pub async fn enqueue(&self, job: Arc<dyn Job>) -> bool {
        if let Some(key) = job.identity_key() {
            let lock_key = format!("{key}_lock");
            if !self.kv.set_nx(&lock_key, "1", Self::IDENTITY_TTL).await {
                info!(job = job.name(), key, "duplicate job dropped by identity lock");
                return false;
            }
        }
        self.push(QueuedJob { job, tries: 0 });
        true
    }

    fn push(&self, queued: QueuedJob) {
        let queue = queued.job.queue();
        if let Some(tx) = self.senders.get(&queue) {
            // Receivers live as long as the runner; a send failure means
            // shutdown, where dropping the job is correct.
            let _ = tx.send(queued);
        }
    }

    fn push_later(self: &Arc<Self>, queued: QueuedJob, delay: Duration) {
        let runner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            runner.push(queued);
        });
    }

    async fn release_identity(&self, job: &dyn Job) {
        if let Some(key) = job.identity_key() {
            self.kv.delete(&format!("{key}_lock")).await;
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        queue: QueueName,
        worker: usize,
        rx: Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    ) {
        loop {
            let next = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(mut queued) = next else {
                return;
            };
            queued.tries += 1;
            let ctx = JobCtx {
                kv: self.kv.clone(),
                try_number: queued.tries,
            };
            let job = queued.job.clone();
            let outcome = match tokio::time::timeout(job.timeout(), job.run(&ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(JobError::Transient(format!(
                    "job timed out after {}s",
                    job.timeout().as_secs()
                ))),
            };
            match outcome {
                Ok(JobOutcome::Done) => {
                    self.release_identity(job.as_ref()).await;
                }
                Ok(JobOutcome::Release { delay }) => {
                    info!(queue = %queue, worker, job = job.name(), delay_secs = delay.as_secs(),
                        "job released itself back to the queue");
                    // A release is not a failed try.
                    queued.tries -= 1;
                    self.push_later(queued, delay);
                }
                Err(error @ JobError::Transient(_)) if queued.tries < job.max_tries() => {
                    let schedule = job.backoff();
                    let idx = (queued.tries as usize - 1).min(schedule.len() - 1);
                    let delay = schedule[idx];
                    warn!(queue = %queue, worker, job = job.name(), tries = queued.tries,
                        delay_secs = delay.as_secs(), %error, "transient failure, retrying");
                    self.push_later(queued, delay);
                }
                Err(error) => {
                    error!(queue = %queue, worker, job = job.name(), tries = queued.tries,
                        %error, "job failed");
                    job.on_failure(&error).await;
                    self.release_identity(job.as_ref()).await;
                }
            }
        }
    }

    /// Abort all workers. Pending queue contents are dropped.
    pub async fn shutdown(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}

/// KV key carrying the cancellation bit for a batch.
pub fn cancel_key(scope: &str, id: i64) -> String {
    format!("{scope}_cancelled_{id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use redress_cache::MemoryKv;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingJob {
        runs: Arc<AtomicU32>,
        fail_first: u32,
        key: Option<String>,
        hold_ms: u64,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        fn queue(&self) -> QueueName {
            QueueName::Default
        }

        fn identity_key(&self) -> Option<String> {
            self.key.clone()
        }

        fn backoff(&self) -> &'static [Duration] {
            const FAST: [Duration; 1] = [Duration::from_millis(10)];
            &FAST
        }

        async fn run(&self, _ctx: &JobCtx) -> Result<JobOutcome, JobError> {
            if self.hold_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.hold_ms)).await;
            }
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if run <= self.fail_first {
                return Err(JobError::Transient("flaky".into()));
            }
            Ok(JobOutcome::Done)
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let kv: KvHandle = Arc::new(MemoryKv::new());
        let runner = JobRunner::start(kv, |_| 1);
        let runs = Arc::new(AtomicU32::new(0));
        runner
            .enqueue(Arc::new(CountingJob {
                runs: runs.clone(),
                fail_first: 2,
                key: None,
                hold_ms: 0,
            }))
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn identity_key_short_circuits_duplicates() {
        let kv: KvHandle = Arc::new(MemoryKv::new());
        let runner = JobRunner::start(kv, |_| 1);
        let runs = Arc::new(AtomicU32::new(0));
        let make = |runs: Arc<AtomicU32>| {
            Arc::new(CountingJob {
                runs,
                fail_first: 0,
                key: Some("billing_upload_7".into()),
                // Long enough to still be running when the twin arrives.
                hold_ms: 100,
            })
        };
        assert!(runner.enqueue(make(runs.clone())).await);
        assert!(!runner.enqueue(make(runs.clone())).await);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        runner.shutdown().await;
    }
}
