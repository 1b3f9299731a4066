use std::fmt;
use std::thread::{self, ThreadId};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Work posted to the foreground loop.
pub type ForegroundTask = Box<dyn FnOnce() + Send>;

/// Single-threaded task queue that stands in for an application's main loop.
///
/// The loop is bound to the thread that created it. Tasks posted through a
/// [`ForegroundHandle`] run in order when the owner drains the loop.
pub struct ForegroundLoop {
    sender: UnboundedSender<ForegroundTask>,
    receiver: UnboundedReceiver<ForegroundTask>,
    thread: ThreadId,
}

impl ForegroundLoop {
    /// Creates a loop bound to the calling thread.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            sender,
            receiver,
            thread: thread::current().id(),
        }
    }

    /// Returns a handle for posting tasks and checking thread affinity.
    #[must_use]
    pub fn handle(&self) -> ForegroundHandle {
        ForegroundHandle {
            sender: self.sender.clone(),
            thread: self.thread,
        }
    }

    /// Runs every task that is already queued, including tasks they post. Returns the count.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Waits for the next task and runs it.
    pub async fn run_once(&mut self) {
        if let Some(task) = self.receiver.recv().await {
            task();
        }
    }
}

impl Default for ForegroundLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ForegroundLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForegroundLoop")
            .field("thread", &self.thread)
            .finish_non_exhaustive()
    }
}

/// Cloneable handle to a [`ForegroundLoop`].
#[derive(Clone, Debug)]
pub struct ForegroundHandle {
    sender: UnboundedSender<ForegroundTask>,
    thread: ThreadId,
}

impl ForegroundHandle {
    /// Posts a task. Returns `false` if the loop has been dropped.
    pub fn post(&self, task: ForegroundTask) -> bool {
        self.sender.send(task).is_ok()
    }

    /// Returns whether the caller runs on the loop's thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }
}
