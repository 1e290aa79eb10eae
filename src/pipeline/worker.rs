//! Job queue and worker threads.
//!
//! Fence callbacks and the ticker never run scheduler logic themselves; they
//! post a `Job`. Workers pull jobs off one shared crossbeam channel and hand
//! them to `GraphContext::run_job`. The pool gives no ordering guarantee;
//! ordering comes from the dependency units.

use crate::pipeline::context::GraphContext;
use crate::pipeline::fence::FenceResult;
use crate::pipeline::id::{FenceHandle, NodeId, RequestId};
use crate::pipeline::scheduler::ReadyUnit;
use crossbeam_channel::{never, select, tick, unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Identifies which node and request an output-fence signal belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceCallbackData {
    pub node: NodeId,
    pub request: RequestId,
    pub fence: FenceHandle,
    pub result: FenceResult,
}

#[derive(Debug)]
pub enum Job {
    /// First invocation of a node for a request.
    Process { node: NodeId, request: RequestId },
    /// A dependency unit resolved.
    Resume(ReadyUnit),
    /// A fence watched by the deferred request queue signaled.
    FenceSignaled {
        fence: FenceHandle,
        result: FenceResult,
    },
    /// One of a node's own output fences signaled.
    FenceCallback(FenceCallbackData),
    /// Re-evaluate every pending unit (polling fence mode).
    Poll,
    /// Expire units whose fences are overdue.
    Watchdog,
    Shutdown,
}

/// Create the job channel.
pub fn job_channel() -> (Sender<Job>, Receiver<Job>) {
    unbounded()
}

/// Worker threads plus the optional ticker thread.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    ticker: Option<(Sender<()>, JoinHandle<()>)>,
    jobs: Sender<Job>,
}

impl WorkerPool {
    /// Spawn `threads` workers draining `rx`. A ticker thread posts `Poll`
    /// every `poll` and `Watchdog` every `watchdog` when those are set.
    pub fn start(
        ctx: Arc<GraphContext>,
        jobs: Sender<Job>,
        rx: Receiver<Job>,
        threads: usize,
        poll: Option<Duration>,
        watchdog: Option<Duration>,
    ) -> std::io::Result<Self> {
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let ctx = Arc::clone(&ctx);
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("camgraph-worker-{}", i))
                .spawn(move || worker_loop(ctx, rx))?;
            workers.push(handle);
        }

        let ticker = if poll.is_some() || watchdog.is_some() {
            let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
            let tx = jobs.clone();
            let handle = std::thread::Builder::new()
                .name("camgraph-ticker".to_string())
                .spawn(move || ticker_loop(tx, stop_rx, poll, watchdog))?;
            Some((stop_tx, handle))
        } else {
            None
        };

        tracing::debug!("Started {} scheduler workers", threads);
        Ok(Self {
            workers,
            ticker,
            jobs,
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop the ticker, then let every worker finish its current job and exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some((stop_tx, handle)) = self.ticker.take() {
            let _ = stop_tx.send(());
            if handle.join().is_err() {
                tracing::error!("Ticker thread panicked");
            }
        }
        for _ in 0..self.workers.len() {
            let _ = self.jobs.send(Job::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Scheduler worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(ctx: Arc<GraphContext>, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if matches!(job, Job::Shutdown) {
            break;
        }
        ctx.run_job(job);
    }
}

fn ticker_loop(
    jobs: Sender<Job>,
    stop: Receiver<()>,
    poll: Option<Duration>,
    watchdog: Option<Duration>,
) {
    let poll_tick = poll.map(tick).unwrap_or_else(never);
    let watch_tick = watchdog.map(tick).unwrap_or_else(never);
    loop {
        let job = select! {
            recv(stop) -> _ => break,
            recv(poll_tick) -> _ => Job::Poll,
            recv(watch_tick) -> _ => Job::Watchdog,
        };
        if jobs.send(job).is_err() {
            break;
        }
    }
}
