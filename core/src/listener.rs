//! Listener lifecycle control: the operator-facing start/stop/restart/
//! shutdown surface for the TLS listener (spec.md §4.8).
//!
//! The HTTP handlers in `pclink-web` only ever express *intent* by
//! calling these methods; the binary's accept loop owns the actual
//! socket and reacts to [`ListenerControl::desired_receiver`] /
//! [`ListenerControl::shutdown_receiver`]. Keeping the intent channel in
//! `pclink-core` means both the web handlers and the binary's main loop
//! depend on the same small surface instead of the web crate reaching
//! into process-lifecycle concerns directly.

use tokio::sync::watch;

/// Desired run state of the TLS listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// The accept loop should be bound and serving.
    Running,
    /// The accept loop should be unbound.
    Stopped,
}

/// Shared handle for expressing listener lifecycle intent. `restart` is
/// `stop` followed by `start` with the same configuration; since this
/// only flips a watched value rather than tearing down `AppState`, the
/// operator session cookie survives a restart untouched (spec.md §4.8).
pub struct ListenerControl {
    desired: watch::Sender<ListenerState>,
    shutdown: watch::Sender<bool>,
}

impl ListenerControl {
    /// Construct a control starting in the `Running` state.
    #[must_use]
    pub fn new() -> Self {
        let (desired, _) = watch::channel(ListenerState::Running);
        let (shutdown, _) = watch::channel(false);
        Self { desired, shutdown }
    }

    /// Subscribe to desired-state changes (`start`/`stop`/`restart`).
    #[must_use]
    pub fn desired_receiver(&self) -> watch::Receiver<ListenerState> {
        self.desired.subscribe()
    }

    /// Subscribe to the full-process shutdown signal.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Current desired state.
    #[must_use]
    pub fn current(&self) -> ListenerState {
        *self.desired.borrow()
    }

    /// Request the listener bind and begin serving.
    pub fn start(&self) {
        let _ = self.desired.send(ListenerState::Running);
    }

    /// Request the listener unbind.
    pub fn stop(&self) {
        let _ = self.desired.send(ListenerState::Stopped);
    }

    /// Request a stop immediately followed by a start, preserving every
    /// other piece of server state (spec.md §4.8 "must not drop the
    /// operator session cookie").
    pub fn restart(&self) {
        let _ = self.desired.send(ListenerState::Stopped);
        let _ = self.desired.send(ListenerState::Running);
    }

    /// Request the whole process exit, stopping every background task
    /// (discovery beacon, cleanup sweep) along with the listener.
    pub fn shutdown(&self) {
        let _ = self.desired.send(ListenerState::Stopped);
        let _ = self.shutdown.send(true);
    }
}

impl Default for ListenerControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let control = ListenerControl::new();
        assert_eq!(control.current(), ListenerState::Running);
    }

    #[test]
    fn stop_then_start_round_trips() {
        let control = ListenerControl::new();
        control.stop();
        assert_eq!(control.current(), ListenerState::Stopped);
        control.start();
        assert_eq!(control.current(), ListenerState::Running);
    }

    #[test]
    fn restart_ends_running() {
        let control = ListenerControl::new();
        control.restart();
        assert_eq!(control.current(), ListenerState::Running);
    }

    #[test]
    fn shutdown_signals_and_stops() {
        let control = ListenerControl::new();
        let mut rx = control.shutdown_receiver();
        control.shutdown();
        assert_eq!(control.current(), ListenerState::Stopped);
        assert!(*rx.borrow_and_update());
    }
}
