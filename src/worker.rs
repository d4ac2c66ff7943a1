use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

/// Contract every long-running worker implements. The supervisor holds
/// workers behind this trait, spawns `run` on its own task and signals
/// shutdown through the paired [`StopSignal`].
#[async_trait]
pub trait Worker: Send {
    fn name(&self) -> &'static str;

    /// Main loop. Must observe `stop` between blocking operations and return
    /// within one outer iteration once it fires. An `Err` return is a fatal
    /// worker error; the supervisor restarts the worker from its spec.
    async fn run(&mut self, stop: StopSignal) -> Result<()>;
}

/// Consumer end of a bounded queue. Shared behind a mutex so a restarted
/// worker instance resumes draining the queue its predecessor left behind.
pub type SharedReceiver<T> = std::sync::Arc<tokio::sync::Mutex<tokio::sync::mpsc::Receiver<T>>>;

/// Cooperative stop signal handed to a worker's `run`.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the stop flag is set.
    pub async fn stopped(&mut self) {
        // wait_for only errs when the sender is gone, which also means stop
        self.rx.wait_for(|stop| *stop).await.ok();
    }

    /// Sleep that wakes early when the stop flag is set.
    pub async fn sleep(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stopped() => {}
        }
    }
}

/// Sender half owned by the supervisor; setting it asks the worker to wind
/// down at its next loop boundary.
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send(true).ok();
    }
}

pub fn stop_pair() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}
