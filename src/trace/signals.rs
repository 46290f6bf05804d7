//! Interrupt handling
//!
//! Signals are process-scoped, so one [`InterruptState`] is created at start
//! and shared by reference. The first interrupt wakes whatever guarded
//! sequence is running so it can delete its trace; any further interrupt
//! exits immediately.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// What the listener should do about one interrupt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptAction {
    /// A guarded sequence is listening and will tear down this trace
    Teardown { trace_id: Option<String> },
    /// Nothing is listening, or teardown is already underway
    ForceExit,
}

pub struct InterruptState {
    count: AtomicUsize,
    trace_id: Mutex<Option<String>>,
    notify: watch::Sender<usize>,
}

impl InterruptState {
    pub fn new() -> Arc<Self> {
        let (notify, _) = watch::channel(0);
        Arc::new(Self {
            count: AtomicUsize::new(0),
            trace_id: Mutex::new(None),
            notify,
        })
    }

    /// Record the trace a guarded sequence is about to create.
    pub fn arm(&self, trace_id: &str) {
        if let Ok(mut current) = self.trace_id.lock() {
            *current = Some(trace_id.to_string());
        }
    }

    pub fn disarm(&self) {
        if let Ok(mut current) = self.trace_id.lock() {
            *current = None;
        }
    }

    pub fn current_trace(&self) -> Option<String> {
        self.trace_id.lock().ok().and_then(|id| id.clone())
    }

    /// Receiver woken on the first interrupt
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.notify.subscribe()
    }

    /// Interrupts received since start; never reset
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Count one interrupt and decide what to do about it.
    pub fn record(&self) -> InterruptAction {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if n > 1 || self.notify.receiver_count() == 0 {
            return InterruptAction::ForceExit;
        }
        self.notify.send_replace(n);
        InterruptAction::Teardown {
            trace_id: self.current_trace(),
        }
    }
}

/// Resolves once an interrupt has been delivered to this receiver.
pub async fn interrupted(rx: &mut watch::Receiver<usize>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Listen for termination signals for the rest of the process lifetime.
pub fn spawn_signal_listener(state: Arc<InterruptState>) -> std::io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigpipe = signal(SignalKind::pipe())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
                _ = sighup.recv() => {}
                _ = sigquit.recv() => {}
                _ = sigpipe.recv() => {}
            }
            match state.record() {
                InterruptAction::Teardown { trace_id } => {
                    info!(trace_id = ?trace_id, "interrupt received, tearing down");
                }
                InterruptAction::ForceExit => {
                    warn!(interrupts = state.count(), "exiting without teardown");
                    std::process::exit(1);
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_listener_forces_exit() {
        let state = InterruptState::new();
        assert_eq!(state.record(), InterruptAction::ForceExit);
        assert_eq!(state.count(), 1);
    }

    #[tokio::test]
    async fn test_first_interrupt_wakes_subscriber_second_forces_exit() {
        let state = InterruptState::new();
        state.arm("abc");
        let mut rx = state.subscribe();

        assert_eq!(
            state.record(),
            InterruptAction::Teardown {
                trace_id: Some("abc".into())
            }
        );
        interrupted(&mut rx).await;

        assert_eq!(state.record(), InterruptAction::ForceExit);
        assert_eq!(state.count(), 2);
    }

    #[test]
    fn test_disarm_clears_trace() {
        let state = InterruptState::new();
        state.arm("abc");
        state.disarm();
        assert_eq!(state.current_trace(), None);
    }
}
