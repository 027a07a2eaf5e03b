//! Provider session lifecycle.
//!
//! A `ConnectionManager` owns one `Transport` and walks it through
//! `Disconnected -> Connecting -> Connected -> (Disconnected | Reconnecting -> Connecting)`.
//! Each `start` opens a new session epoch. The transport reports back through the
//! `SessionEvents` it was handed, whose only side effects are a state update and a
//! `QuoteQueue::push`; events carrying an epoch other than the current one come from a
//! session that was already stopped and are dropped.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use quote_common::{Command, Result, SyncError};
use strum_macros::Display;

use crate::config::Credentials;
use crate::queue::{FeedEvent, QuoteQueue, WireMessage};
use crate::signal::StopSignal;
use crate::transport::Transport;

/// Session state as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    /// No session.
    Disconnected,
    /// Connect and login in progress.
    Connecting,
    /// Logged in; commands may be sent.
    Connected,
    /// Waiting out the delay before another connect attempt.
    Reconnecting,
}

fn set_state(state: &Mutex<ConnectionState>, next: ConnectionState) {
    match state.lock() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

fn get_state(state: &Mutex<ConnectionState>) -> ConnectionState {
    match state.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

/// Callback handle given to the transport for one session.
#[derive(Clone)]
pub struct SessionEvents {
    session: u64,
    current: Arc<AtomicU64>,
    state: Arc<Mutex<ConnectionState>>,
    queue: QuoteQueue,
}

impl SessionEvents {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.session
    }

    /// Session epoch these callbacks belong to.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Login accepted.
    pub fn on_connect(&self) {
        if !self.is_current() {
            return;
        }
        set_state(&self.state, ConnectionState::Connected);
        info!("Connected to quote provider (session {})", self.session);
    }

    /// One provider line.
    pub fn on_message(&self, text: &str) {
        if !self.is_current() {
            debug!("Dropping line from closed session {}: {}", self.session, text);
            return;
        }
        if text.trim().is_empty() {
            return;
        }
        self.queue.push(FeedEvent::Message(WireMessage {
            session: self.session,
            text: String::from(text),
        }));
    }

    /// The session ended on the provider or network side.
    pub fn on_disconnect(&self, reason: &str) {
        if !self.is_current() {
            return;
        }
        set_state(&self.state, ConnectionState::Disconnected);
        warn!("Disconnected from quote provider (session {}): {}", self.session, reason);
        self.queue.push(FeedEvent::Disconnected {
            session: self.session,
            reason: String::from(reason),
        });
    }
}

/// Owns the provider session and its transport.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    credentials: Credentials,
    connect_timeout: Duration,
    queue: QuoteQueue,
    state: Arc<Mutex<ConnectionState>>,
    session: Arc<AtomicU64>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Creates a manager whose sessions deliver into `queue`.
    pub fn new(
        transport: T,
        credentials: Credentials,
        connect_timeout: Duration,
        queue: QuoteQueue,
    ) -> Self {
        Self {
            transport,
            credentials,
            connect_timeout,
            queue,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            session: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        get_state(&self.state)
    }

    /// `true` while commands can be sent.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Epoch of the latest session; `0` before the first `start`.
    pub fn session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Opens a session and logs in, bounded by the connect timeout.
    pub fn start(&mut self) -> Result<()> {
        if self.is_connected() {
            debug!("Session {} already connected", self.session());
            return Ok(());
        }

        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        set_state(&self.state, ConnectionState::Connecting);
        info!("Connecting to quote provider (session {})", session);

        let events = SessionEvents {
            session,
            current: Arc::clone(&self.session),
            state: Arc::clone(&self.state),
            queue: self.queue.clone(),
        };

        match self
            .transport
            .open(&self.credentials, self.connect_timeout, events.clone())
        {
            Ok(()) => {
                events.on_connect();
                Ok(())
            }
            Err(e) => {
                self.session.fetch_add(1, Ordering::SeqCst);
                set_state(&self.state, ConnectionState::Disconnected);
                self.transport.close();
                Err(e)
            }
        }
    }

    /// Connects with up to `attempts` tries spaced by `delay`. Fatal login refusals
    /// end the retries at once; the wait between tries aborts on `stop`.
    pub fn connect(&mut self, attempts: u32, delay: Duration, stop: &StopSignal) -> Result<()> {
        let attempts = attempts.max(1);
        let mut last_error = SyncError::NotConnected;

        for attempt in 1..=attempts {
            if stop.is_raised() {
                return Err(SyncError::Stopped);
            }
            if attempt > 1 {
                set_state(&self.state, ConnectionState::Reconnecting);
                info!(
                    "Reconnecting in {:.1}s (attempt {}/{})",
                    delay.as_secs_f64(),
                    attempt,
                    attempts
                );
                if stop.wait(delay) {
                    set_state(&self.state, ConnectionState::Disconnected);
                    return Err(SyncError::Stopped);
                }
            }

            match self.start() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => {
                    error!("Provider refused the session, giving up: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Connect attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Sends `command`. Outside `Connected` this is a no-op with a warning.
    pub fn send(&mut self, command: &Command) -> Result<()> {
        if !self.is_connected() {
            warn!("Not connected ({}), dropping command '{}'", self.state(), command);
            return Ok(());
        }
        if let Err(e) = self.transport.send_line(&command.to_string()) {
            warn!("Failed to send '{}': {}", command, e);
            self.stop();
            return Err(SyncError::Disconnected(e.to_string()));
        }
        Ok(())
    }

    /// Ends the session. Safe to call any number of times.
    pub fn stop(&mut self) {
        let previous = self.state();
        self.session.fetch_add(1, Ordering::SeqCst);
        set_state(&self.state, ConnectionState::Disconnected);
        self.transport.close();
        if previous != ConnectionState::Disconnected {
            info!("Provider session closed");
        }
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::scripted::{ScriptedTransport, TransportScript};

    fn manager(script: &TransportScript) -> (ConnectionManager<ScriptedTransport>, QuoteQueue) {
        let queue = QuoteQueue::unbounded();
        let manager = ConnectionManager::new(
            ScriptedTransport::new(script.clone()),
            Credentials::new("desk", "secret"),
            Duration::from_secs(1),
            queue.clone(),
        );
        (manager, queue)
    }

    #[test]
    fn start_moves_to_connected() {
        let script = TransportScript::default();
        let (mut manager, _queue) = manager(&script);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.start().unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.session(), 1);
        assert_eq!(script.opens(), 1);
    }

    #[test]
    fn send_outside_connected_is_a_noop() {
        let script = TransportScript::default();
        let (mut manager, _queue) = manager(&script);
        manager.send(&Command::snapshot("PETR4")).unwrap();
        assert!(script.sent().is_empty());

        manager.start().unwrap();
        manager.send(&Command::snapshot("PETR4")).unwrap();
        assert_eq!(script.sent(), vec!["SQT PETR4 N"]);
    }

    #[test]
    fn stop_is_idempotent() {
        let script = TransportScript::default();
        let (mut manager, _queue) = manager(&script);
        manager.start().unwrap();
        manager.stop();
        manager.stop();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn unsolicited_disconnect_reaches_the_queue() {
        let script = TransportScript::default();
        let (mut manager, queue) = manager(&script);
        manager.start().unwrap();
        script.disconnect("reset by peer");
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            queue.drain(),
            vec![FeedEvent::Disconnected {
                session: 1,
                reason: String::from("reset by peer")
            }]
        );
    }

    #[test]
    fn callbacks_from_stopped_sessions_are_dropped() {
        let script = TransportScript::default();
        let (mut manager, queue) = manager(&script);
        manager.start().unwrap();
        let stale = script.events().unwrap();
        manager.stop();
        stale.on_message("T:PETR4:101500:2:30.15");
        stale.on_disconnect("late");
        assert!(queue.is_empty());
    }

    #[test]
    fn transient_failures_are_retried() {
        let script = TransportScript::default();
        script.fail_next_opens(1);
        let (mut manager, _queue) = manager(&script);
        manager
            .connect(2, Duration::from_millis(1), &StopSignal::new())
            .unwrap();
        assert_eq!(script.opens(), 2);
        assert!(manager.is_connected());
    }

    #[test]
    fn fatal_refusal_stops_retrying() {
        let script = TransportScript::default();
        script.reject_login("Invalid login.");
        let (mut manager, _queue) = manager(&script);
        let err = manager
            .connect(5, Duration::from_millis(1), &StopSignal::new())
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(script.opens(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn retries_give_up_after_the_bound() {
        let script = TransportScript::default();
        script.fail_next_opens(10);
        let (mut manager, _queue) = manager(&script);
        let err = manager
            .connect(3, Duration::from_millis(1), &StopSignal::new())
            .unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(script.opens(), 3);
    }

    #[test]
    fn stop_signal_aborts_the_backoff() {
        let script = TransportScript::default();
        script.fail_next_opens(10);
        let (mut manager, _queue) = manager(&script);
        let stop = StopSignal::new();
        stop.raise();
        assert!(matches!(
            manager.connect(3, Duration::from_secs(30), &stop),
            Err(SyncError::Stopped)
        ));
        assert_eq!(script.opens(), 0);
    }
}
