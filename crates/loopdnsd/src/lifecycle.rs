//! Manages the life cycle of the process and shuts things down
//! gracefully.
//!
//! See <https://tokio.rs/tokio/topics/shutdown> for more information.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc::{Receiver as MPSCReceiver, Sender as MPSCSender};
use tokio::sync::watch::{Receiver as WatchReceiver, Sender as WatchSender};

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);
static STOPPING: OnceLock<ShutdownState> = OnceLock::new();

/// In-flight DNS questions and API requests are bounded by their own
/// 5 second deadlines; waiting this long after signalling shutdown lets
/// them drain.
const GRACE_PERIOD: Duration = Duration::from_secs(5);

struct ShutdownState {
    tx: WatchSender<()>,
    rx: WatchReceiver<()>,
    request_shutdown_tx: MPSCSender<()>,
    stop_requested: AtomicBool,
}

pub fn is_shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::Relaxed)
}

/// ShutdownSubscription can be used by code that is idling.
/// Select on your timeout and ShutdownSubscription::shutting_down
/// to wake up when either the timeout expires or the process is
/// about to shut down.
pub struct ShutdownSubscription {
    rx: WatchReceiver<()>,
}

impl ShutdownSubscription {
    pub fn get() -> Self {
        Self {
            rx: STOPPING.get().expect("LifeCycle::new called first").rx.clone(),
        }
    }

    pub async fn shutting_down(&mut self) {
        self.rx.changed().await.ok();
    }
}

/// Represents the life cycle of this server process. Creating an
/// instance prepares the global state; may be called only once.
pub struct LifeCycle {
    request_shutdown_rx: MPSCReceiver<()>,
}

impl LifeCycle {
    pub fn new() -> Self {
        let (request_shutdown_tx, request_shutdown_rx) = tokio::sync::mpsc::channel(1);
        let (tx, rx) = tokio::sync::watch::channel(());
        STOPPING
            .set(ShutdownState {
                tx,
                rx,
                request_shutdown_tx,
                stop_requested: AtomicBool::new(false),
            })
            .map_err(|_| ())
            .expect("LifeCycle::new called twice");

        Self {
            request_shutdown_rx,
        }
    }

    /// Request that we shut down the process. Causes wait_for_shutdown
    /// to wake up and begin the shutdown procedure.
    pub async fn request_shutdown() {
        tracing::debug!("shutdown has been requested");
        if let Some(state) = STOPPING.get() {
            if state
                .stop_requested
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                == Ok(false)
            {
                state.request_shutdown_tx.send(()).await.ok();
            }
        } else {
            tracing::error!("request_shutdown: STOPPING channel is unavailable");
        }
    }

    /// Wait for a shutdown request or termination signal, then
    /// propagate that state to running tasks and give in-flight work
    /// its grace period before returning.
    pub async fn wait_for_shutdown(&mut self) {
        tracing::debug!("waiting for interrupt");
        let mut sig_term =
            tokio::signal::unix::signal(SignalKind::terminate()).expect("listen for SIGTERM");
        let mut sig_hup =
            tokio::signal::unix::signal(SignalKind::hangup()).expect("listen for SIGHUP");

        tokio::select! {
            _ = sig_term.recv() => {}
            _ = sig_hup.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
            _ = self.request_shutdown_rx.recv() => {}
        };

        tracing::info!("shutdown requested, draining in-flight requests");
        SHUTTING_DOWN.store(true, Ordering::SeqCst);
        if let Some(state) = STOPPING.get() {
            state.tx.send(()).ok();
        }

        tokio::time::sleep(GRACE_PERIOD).await;
    }
}
