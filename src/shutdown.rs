/// Process-wide shutdown coordination
///
/// One coordinator is built at startup. It listens for termination signals
/// and for faults reported from detached tasks, and runs the cleanup sequence
/// under a watchdog so a hung cleanup cannot keep the process alive.
use log::{error, info, warn};
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Exit code for a clean stop
pub const EXIT_OK: i32 = 0;
/// Exit code after a fault in the pipeline
pub const EXIT_FAULT: i32 = -1;
/// Exit code when cleanup overran the watchdog
pub const EXIT_WATCHDOG: i32 = -2;

/// Why the process is stopping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(&'static str),
    Fault(String),
}

impl ShutdownReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Signal(_) => EXIT_OK,
            Self::Fault(_) => EXIT_FAULT,
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "received {}", name),
            Self::Fault(reason) => write!(f, "fault: {}", reason),
        }
    }
}

/// Cloneable handle for reporting fatal faults from anywhere in the pipeline
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: mpsc::UnboundedSender<String>,
}

impl FaultReporter {
    pub fn report(&self, fault: impl fmt::Display) {
        let fault = fault.to_string();
        error!("Fatal fault: {}", fault);
        if self.tx.send(fault).is_err() {
            warn!("Shutdown already in progress, fault not forwarded");
        }
    }
}

pub struct ShutdownCoordinator {
    watchdog: Duration,
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl ShutdownCoordinator {
    pub fn new(watchdog: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { watchdog, tx, rx }
    }

    pub fn reporter(&self) -> FaultReporter {
        FaultReporter {
            tx: self.tx.clone(),
        }
    }

    /// Route panics from any task into the fault channel
    pub fn install_panic_hook(&self) {
        let reporter = self.reporter();
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            default_hook(panic_info);
            reporter.report(format!("panic: {}", panic_info));
        }));
    }

    /// Wait for the first fault report
    pub async fn next_fault(&mut self) -> ShutdownReason {
        match self.rx.recv().await {
            Some(fault) => ShutdownReason::Fault(fault),
            // Unreachable while `self.tx` is alive.
            None => ShutdownReason::Fault("fault channel closed".into()),
        }
    }

    /// Wait for Ctrl+C, SIGTERM or a reported fault
    pub async fn wait(&mut self) -> ShutdownReason {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                ShutdownReason::Signal("SIGINT")
            }
            _ = terminate() => ShutdownReason::Signal("SIGTERM"),
            reason = self.next_fault() => reason,
        }
    }

    /// Run `cleanup` under the watchdog and return the process exit code
    pub async fn run_cleanup<F>(&self, reason: &ShutdownReason, cleanup: F) -> i32
    where
        F: Future<Output = ()>,
    {
        info!("Shutting down ({})", reason);
        match timeout(self.watchdog, cleanup).await {
            Ok(()) => {
                info!("Cleanup complete");
                reason.exit_code()
            }
            Err(_) => {
                error!(
                    "Cleanup did not finish within {} seconds, forcing exit",
                    self.watchdog.as_secs()
                );
                EXIT_WATCHDOG
            }
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            error!("Failed to listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
