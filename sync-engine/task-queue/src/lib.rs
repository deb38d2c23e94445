#[macro_use]
extern crate tracing;

mod cancel;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use crossbeam::channel::{self, RecvTimeoutError};
use parking_lot::Mutex;

pub use cancel::CancellationToken;

type Job = Box<dyn FnOnce(&CancellationToken) -> Result<()> + Send + 'static>;

/// A message sent to the background worker.
enum Message {
    /// Runs the given job.
    Run { name: String, job: Job },

    /// Wakes up the sender once every message before it has been handled.
    Barrier(channel::Sender<()>),

    /// Stops the worker once every message before it has been handled.
    Shutdown,
}

/// How the queue executes submitted tasks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueMode {
    /// Tasks are executed in submission order by a single worker thread.
    Background,

    /// Tasks are executed on the submitting thread before `submit` returns.
    Inline,
}

/// A callback ran by the worker once it has been idle for `period`
/// after handling at least one task.
pub struct IdleHandler {
    period: Duration,
    hook: Box<dyn FnMut() + Send + 'static>,
}

impl IdleHandler {
    pub fn new(period: Duration, hook: impl FnMut() + Send + 'static) -> Self {
        Self {
            period,
            hook: Box::new(hook),
        }
    }
}

/// Runs a single job, catching any errors or panics so they never
/// escape into the worker.
fn run_job(queue: &str, name: &str, job: Job, token: &CancellationToken) {
    if token.is_cancelled() {
        debug!("[ QUEUE @ {} ] skipping task {} as the queue is cancelled", queue, name);
        return;
    }

    let start = Instant::now();
    match panic::catch_unwind(AssertUnwindSafe(|| job(token))) {
        Ok(Ok(())) => {
            debug!(
                "[ QUEUE @ {} ] task {} completed in {:?}",
                queue,
                name,
                start.elapsed()
            );
        },
        Ok(Err(e)) => {
            error!("[ QUEUE @ {} ] task {} failed: {:?}", queue, name, e);
        },
        Err(_) => {
            error!("[ QUEUE @ {} ] task {} panicked, the task has been dropped", queue, name);
        },
    }
}

/// The background worker, this processes messages strictly in the
/// order they were sent.
struct Worker {
    name: Arc<String>,
    rx: channel::Receiver<Message>,
    token: CancellationToken,
    pending: Arc<AtomicUsize>,
    idle: Option<IdleHandler>,
}

impl Worker {
    fn start(mut self) {
        let mut work_since_idle = false;

        loop {
            let timeout = self
                .idle
                .as_ref()
                .filter(|_| work_since_idle)
                .map(|idle| idle.period);

            let msg = match timeout {
                Some(period) => match self.rx.recv_timeout(period) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => {
                        self.run_idle_hook();
                        work_since_idle = false;
                        continue;
                    },
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
            };

            match msg {
                Message::Run { name, job } => {
                    run_job(&self.name, &name, job, &self.token);
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    work_since_idle = true;
                },
                Message::Barrier(waker) => {
                    let _ = waker.send(());
                },
                Message::Shutdown => break,
            }
        }

        info!("[ QUEUE @ {} ] worker shutdown complete", &self.name);
    }

    fn run_idle_hook(&mut self) {
        if self.token.is_cancelled() {
            return;
        }

        if let Some(idle) = self.idle.as_mut() {
            trace!("[ QUEUE @ {} ] running idle hook", &self.name);
            if panic::catch_unwind(AssertUnwindSafe(|| (idle.hook)())).is_err() {
                error!("[ QUEUE @ {} ] idle hook panicked", &self.name);
            }
        }
    }
}

/// A FIFO task queue with at most one task running at any time.
///
/// Tasks receive the queue's cancellation token and are expected to check
/// it at safe points. Errors and panics raised by tasks are logged and
/// the task is dropped, the worker itself keeps running.
///
/// Dropping the queue without calling `shutdown` cancels any pending tasks.
pub struct TaskQueue {
    name: Arc<String>,
    mode: QueueMode,
    sender: Mutex<Option<channel::Sender<Message>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
    pending: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl TaskQueue {
    /// Creates a new queue, spawning the worker thread when running
    /// in `QueueMode::Background`.
    ///
    /// The idle handler is ignored in inline mode.
    pub fn create(name: &str, mode: QueueMode, idle: Option<IdleHandler>) -> Result<Self> {
        let name = Arc::new(name.to_string());
        let token = CancellationToken::new();
        let pending = Arc::new(AtomicUsize::new(0));

        let (sender, handle) = match mode {
            QueueMode::Inline => (None, None),
            QueueMode::Background => {
                let (tx, rx) = channel::unbounded();
                let worker = Worker {
                    name: name.clone(),
                    rx,
                    token: token.clone(),
                    pending: pending.clone(),
                    idle,
                };

                let handle = std::thread::Builder::new()
                    .name(format!("{}-task-worker", &name))
                    .spawn(move || worker.start())
                    .map_err(|_e| {
                        Error::msg(format!(
                            "failed to spawn task worker thread for queue {}",
                            &name
                        ))
                    })?;

                info!("[ QUEUE @ {} ] started background worker", &name);
                (Some(tx), Some(handle))
            },
        };

        Ok(Self {
            name,
            mode,
            sender: Mutex::new(sender),
            handle: Mutex::new(handle),
            token,
            pending,
            closed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    #[inline]
    /// The cancellation token handed to every task of this queue.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[inline]
    /// The number of submitted tasks which have not finished yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Submits a task to the queue.
    ///
    /// In inline mode the task has already ran when this returns, a failure
    /// of the task itself is logged rather than returned in both modes.
    pub fn submit<F>(&self, name: impl Into<String>, job: F) -> Result<()>
    where
        F: FnOnce(&CancellationToken) -> Result<()> + Send + 'static,
    {
        let name = name.into();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::msg(format!(
                "task queue {} has shutdown, rejected task {}",
                &self.name, name
            )));
        }

        if self.mode == QueueMode::Inline {
            run_job(&self.name, &name, Box::new(job), &self.token);
            return Ok(());
        }

        let guard = self.sender.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| Error::msg(format!("task queue {} has shutdown", &self.name)))?;

        self.pending.fetch_add(1, Ordering::AcqRel);
        if sender
            .send(Message::Run {
                name,
                job: Box::new(job),
            })
            .is_err()
        {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::msg(format!(
                "task worker for queue {} has exited",
                &self.name
            )));
        }

        Ok(())
    }

    /// Blocks until every task submitted before this call has finished.
    ///
    /// This must not be called from within a task of the same queue.
    pub fn drain(&self) -> Result<()> {
        let sender = match self.sender.lock().as_ref() {
            Some(sender) => sender.clone(),
            None => return Ok(()),
        };

        let (waker, waiter) = channel::bounded(1);
        sender
            .send(Message::Barrier(waker))
            .map_err(|_| Error::msg("task worker has exited"))?;

        waiter
            .recv()
            .map_err(|_| Error::msg("task worker exited before the queue was drained"))?;

        Ok(())
    }

    /// Stops the queue.
    ///
    /// With `drain` every pending task runs before the worker is joined.
    /// Without it the queue is cancelled, pending tasks are skipped and the
    /// worker is detached so this returns without waiting on it.
    pub fn shutdown(&self, drain: bool) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if !drain {
            self.token.cancel();
        }

        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(Message::Shutdown);
        }

        let handle = match self.handle.lock().take() {
            Some(handle) => handle,
            None => return Ok(()),
        };

        if !drain || handle.thread().id() == std::thread::current().id() {
            info!("[ QUEUE @ {} ] detaching worker without waiting", &self.name);
            return Ok(());
        }

        handle
            .join()
            .map_err(|_| Error::msg(format!("task worker for queue {} panicked", &self.name)))
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.shutdown(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_state() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn tasks_run_in_submission_order() -> Result<()> {
        init_state();

        let queue = TaskQueue::create("test-order", QueueMode::Background, None)?;
        let seen = Arc::new(Mutex::new(vec![]));
        for i in 0..50 {
            let seen = seen.clone();
            queue.submit(format!("push-{}", i), move |_| {
                seen.lock().push(i);
                Ok(())
            })?;
        }

        queue.drain()?;
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
        assert_eq!(queue.pending(), 0);

        queue.shutdown(true)
    }

    #[test]
    fn inline_mode_runs_before_returning() -> Result<()> {
        init_state();

        let queue = TaskQueue::create("test-inline", QueueMode::Inline, None)?;
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        queue.submit("flag", move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })?;

        assert!(ran.load(Ordering::SeqCst));
        queue.shutdown(true)?;
        assert!(queue.submit("rejected", |_| Ok(())).is_err());

        Ok(())
    }

    #[test]
    fn failing_tasks_do_not_kill_the_worker() -> Result<()> {
        init_state();

        let queue = TaskQueue::create("test-failures", QueueMode::Background, None)?;
        queue.submit("error", |_| Err(Error::msg("boom")))?;
        queue.submit("panic", |_| panic!("boom"))?;

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        queue.submit("after", move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })?;

        queue.drain()?;
        assert!(ran.load(Ordering::SeqCst));

        queue.shutdown(true)
    }

    #[test]
    fn cancelled_queue_skips_pending_tasks() -> Result<()> {
        init_state();

        let queue = TaskQueue::create("test-cancel", QueueMode::Background, None)?;
        let (release, blocker) = channel::bounded::<()>(0);
        queue.submit("blocker", move |_| {
            let _ = blocker.recv();
            Ok(())
        })?;

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        queue.submit("skipped", move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })?;

        let token = queue.token();
        queue.shutdown(false)?;
        assert!(token.is_cancelled());

        drop(release);

        // The worker is detached, give it a moment to get through the queue.
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.pending() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(queue.pending(), 0);
        assert!(!ran.load(Ordering::SeqCst));

        Ok(())
    }

    #[test]
    fn idle_hook_runs_after_work() -> Result<()> {
        init_state();

        let (tx, rx) = channel::unbounded();
        let idle = IdleHandler::new(Duration::from_millis(20), move || {
            let _ = tx.send(());
        });

        let queue = TaskQueue::create("test-idle", QueueMode::Background, Some(idle))?;
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        queue.submit("work", |_| Ok(()))?;
        rx.recv_timeout(Duration::from_secs(5))?;

        queue.shutdown(true)
    }
}
