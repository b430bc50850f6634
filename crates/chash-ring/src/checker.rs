//! Periodic liveness checker.
//!
//! A [`Checker`] runs a caller-supplied callback on a fixed interval in a
//! background Tokio task. It knows nothing about rings or targets: the
//! orchestrator hands it a closure that reconciles the ring.
//!
//! The control loop waits on either the shutdown channel or the timer, with
//! shutdown polled first. A stop request that arrives while a check is in
//! flight lets that check finish and prevents any further tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

/// Interval used when a zero interval is requested.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Callback invoked on every tick.
pub type CheckFn = Arc<dyn Fn() + Send + Sync>;

/// Handle to the spawned control loop.
struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Cancellable periodic task.
pub struct Checker {
    interval: Duration,
    /// Completed ticks since the last start.
    ticks: Arc<AtomicU64>,
    running: Option<RunningLoop>,
}

impl Checker {
    /// Create a stopped checker. A zero `interval` becomes
    /// [`DEFAULT_CHECK_INTERVAL`].
    pub fn new(interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_CHECK_INTERVAL
        } else {
            interval
        };
        Self {
            interval,
            ticks: Arc::new(AtomicU64::new(0)),
            running: None,
        }
    }

    /// Effective tick interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of completed ticks since the last start.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Start ticking on the current Tokio runtime.
    ///
    /// Returns `false` if the checker is already running (stop it first) or
    /// if there is no runtime to spawn on. The first tick fires one interval
    /// after start. Each invocation of `check` runs on the blocking thread
    /// pool.
    pub fn start<F>(&mut self, check: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.in_checking() {
            warn!("checker already running, stop it before restarting");
            return false;
        }
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "no Tokio runtime, checker not started");
                return false;
            }
        };

        self.ticks.store(0, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(run(
            self.interval,
            Arc::new(check),
            shutdown_rx,
            self.ticks.clone(),
        ));

        self.running = Some(RunningLoop { shutdown_tx, task });
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "checker started"
        );
        true
    }

    /// Request the control loop to exit.
    ///
    /// Returns `false` if the checker was not running. The loop observes the
    /// request before its next tick; use [`Checker::shutdown`] to also wait
    /// for it to exit.
    pub fn stop(&mut self) -> bool {
        match self.running.take() {
            Some(running) => {
                let _ = running.shutdown_tx.send(true);
                debug!("checker stop requested");
                true
            }
            None => {
                warn!("checker is not running");
                false
            }
        }
    }

    /// Stop the control loop and wait until it has exited.
    pub async fn shutdown(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            warn!("checker is not running");
            return false;
        };
        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.task.await {
            error!(error = %e, "checker task ended abnormally");
        }
        true
    }

    /// Whether the control loop is running.
    pub fn in_checking(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }
}

impl Drop for Checker {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(true);
        }
    }
}

impl std::fmt::Debug for Checker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checker")
            .field("interval", &self.interval)
            .field("ticks", &self.ticks())
            .field("running", &self.in_checking())
            .finish()
    }
}

/// Control loop: tick until shutdown is requested or the sender is dropped.
async fn run(
    period: Duration,
    check: CheckFn,
    mut shutdown_rx: watch::Receiver<bool>,
    ticks: Arc<AtomicU64>,
) {
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = tick.tick() => {
                let check = check.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || check()).await {
                    error!(error = %e, "liveness check panicked");
                }
                ticks.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    info!(ticks = ticks.load(Ordering::Relaxed), "checker stopped");
}
