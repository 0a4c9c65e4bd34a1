//! Two-stage shutdown: `Armed -> Draining -> Terminated`.
//!
//! The first termination signal (or an explicit [`ShutdownController::request_shutdown`])
//! moves the controller to `Draining` and cancels the graceful token; the
//! event loop stops accepting work, drains what was already posted and exits.
//! A second signal while draining forces termination according to the
//! configured [`ForcePolicy`].
//!
//! Signals are delivered to the controller by a [`SignalWatcher`] on its own
//! thread, so they are seen even while a task blocks the loop thread. Tests
//! can also inject them directly through [`ShutdownController::signal`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit status used when termination is forced (128 + SIGINT).
pub const FORCED_EXIT_CODE: i32 = 130;

const ARMED: u8 = 0;
const DRAINING: u8 = 1;
const TERMINATED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownState {
    Armed,
    Draining,
    Terminated,
}

/// What a forced termination does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcePolicy {
    /// Exit the process immediately.
    #[default]
    Exit,
    /// Abandon the in-flight task and leave the event loop; the process
    /// keeps running.
    AbortLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Hangup,
    Interrupt,
    Terminate,
}

impl core::fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TerminationSignal::Hangup => write!(f, "SIGHUP"),
            TerminationSignal::Interrupt => write!(f, "SIGINT"),
            TerminationSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: AtomicU8,
    graceful: CancellationToken,
    forced: CancellationToken,
    terminated: CancellationToken,
    policy: ForcePolicy,
}

#[derive(Debug, Clone)]
pub struct ShutdownController {
    inner: Arc<Inner>,
}

impl ShutdownController {
    pub fn new(policy: ForcePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(ARMED),
                graceful: CancellationToken::new(),
                forced: CancellationToken::new(),
                terminated: CancellationToken::new(),
                policy,
            }),
        }
    }

    pub fn state(&self) -> ShutdownState {
        match self.inner.state.load(Ordering::Acquire) {
            ARMED => ShutdownState::Armed,
            DRAINING => ShutdownState::Draining,
            _ => ShutdownState::Terminated,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state() == ShutdownState::Armed
    }

    pub fn policy(&self) -> ForcePolicy {
        self.inner.policy
    }

    /// Reacts to one occurrence of a watched signal and returns the state
    /// the controller ended up in.
    pub fn signal(&self, signal: TerminationSignal) -> ShutdownState {
        match self.state() {
            ShutdownState::Armed => {
                info!("{} received, shutting down gracefully", signal);
                self.request_shutdown();
            }
            ShutdownState::Draining => {
                warn!("{} received while draining, forcing termination", signal);
                self.force();
            }
            ShutdownState::Terminated => {}
        }
        self.state()
    }

    /// `Armed -> Draining`. Returns false if shutdown had already begun.
    pub fn request_shutdown(&self) -> bool {
        let moved = self
            .inner
            .state
            .compare_exchange(ARMED, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            self.inner.graceful.cancel();
        }
        moved
    }

    /// Forces termination. Under [`ForcePolicy::Exit`] this does not return.
    pub fn force(&self) {
        // forcing implies draining has begun
        self.request_shutdown();
        self.inner.forced.cancel();
        if self.inner.policy == ForcePolicy::Exit {
            std::process::exit(FORCED_EXIT_CODE);
        }
    }

    pub fn is_forced(&self) -> bool {
        self.inner.forced.is_cancelled()
    }

    pub(crate) fn mark_terminated(&self) {
        self.inner.graceful.cancel();
        self.inner.state.store(TERMINATED, Ordering::Release);
        self.inner.terminated.cancel();
    }

    pub(crate) fn graceful_token(&self) -> CancellationToken {
        self.inner.graceful.clone()
    }

    pub(crate) fn forced_token(&self) -> CancellationToken {
        self.inner.forced.clone()
    }

    pub(crate) fn terminated_token(&self) -> CancellationToken {
        self.inner.terminated.clone()
    }
}

impl SignalWatcher {
    /// Arms a watcher on a dedicated thread with its own reactor and
    /// returns once the handlers are installed. The thread exits when the
    /// controller reaches `Terminated`.
    pub fn spawn(controller: ShutdownController, thread_name: String) -> std::io::Result<JoinHandle<()>> {
        let (ready_tx, ready_rx) = sync_channel(1);
        let handle = std::thread::Builder::new().name(thread_name).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            runtime.block_on(async move {
                match SignalWatcher::arm(controller) {
                    Ok(watcher) => {
                        let _ = ready_tx.send(Ok(()));
                        watcher.run().await;
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            });
        })?;

        let armed = ready_rx.recv().unwrap_or_else(|_| {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "signal watcher thread exited during startup",
            ))
        });
        match armed {
            Ok(()) => Ok(handle),
            Err(e) => {
                let _ = handle.join();
                Err(e)
            }
        }
    }
}

/// Watches SIGHUP, SIGINT and SIGTERM and feeds them to a controller.
/// Must be armed from within a tokio runtime.
#[cfg(unix)]
pub struct SignalWatcher {
    controller: ShutdownController,
    hangup: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalWatcher {
    pub fn arm(controller: ShutdownController) -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            controller,
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    pub async fn run(mut self) {
        let terminated = self.controller.terminated_token();
        loop {
            let received = tokio::select! {
                () = terminated.cancelled() => break,
                Some(()) = self.hangup.recv() => TerminationSignal::Hangup,
                Some(()) = self.interrupt.recv() => TerminationSignal::Interrupt,
                Some(()) = self.terminate.recv() => TerminationSignal::Terminate,
                else => break,
            };
            if self.controller.signal(received) == ShutdownState::Terminated {
                break;
            }
        }
    }
}

#[cfg(not(unix))]
pub struct SignalWatcher {
    controller: ShutdownController,
}

#[cfg(not(unix))]
impl SignalWatcher {
    pub fn arm(controller: ShutdownController) -> std::io::Result<Self> {
        Ok(Self { controller })
    }

    pub async fn run(self) {
        let terminated = self.controller.terminated_token();
        loop {
            tokio::select! {
                () = terminated.cancelled() => break,
                received = tokio::signal::ctrl_c() => {
                    if received.is_err()
                        || self.controller.signal(TerminationSignal::Interrupt) == ShutdownState::Terminated
                    {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_starts_armed() {
        let controller = ShutdownController::new(ForcePolicy::AbortLoop);
        assert_eq!(controller.state(), ShutdownState::Armed);
        assert!(controller.is_armed());
        assert!(!controller.graceful_token().is_cancelled());
    }

    #[test]
    fn test_first_signal_drains_second_forces() {
        let controller = ShutdownController::new(ForcePolicy::AbortLoop);

        let state = controller.signal(TerminationSignal::Interrupt);
        assert_eq!(state, ShutdownState::Draining);
        assert!(controller.graceful_token().is_cancelled());
        assert!(!controller.is_forced());

        let state = controller.signal(TerminationSignal::Terminate);
        assert_eq!(state, ShutdownState::Draining);
        assert!(controller.is_forced());
    }

    #[test]
    fn test_transition_is_one_directional() {
        let controller = ShutdownController::new(ForcePolicy::AbortLoop);
        assert!(controller.request_shutdown());
        assert!(!controller.request_shutdown());

        controller.mark_terminated();
        assert_eq!(controller.state(), ShutdownState::Terminated);
        assert_eq!(controller.signal(TerminationSignal::Hangup), ShutdownState::Terminated);
        assert!(!controller.is_forced());
    }

    #[test]
    fn test_watcher_thread_exits_on_termination() {
        let controller = ShutdownController::new(ForcePolicy::AbortLoop);
        let watcher = SignalWatcher::spawn(controller.clone(), "signals-test".to_string()).unwrap();
        assert!(!watcher.is_finished());

        controller.mark_terminated();
        assert!(watcher.join().is_ok());
    }

    #[test]
    fn test_force_policy_serde_names() {
        let policy: ForcePolicy = serde_json::from_str("\"abort_loop\"").unwrap();
        assert_eq!(policy, ForcePolicy::AbortLoop);
        assert_eq!(serde_json::to_string(&ForcePolicy::Exit).unwrap(), "\"exit\"");
    }
}
