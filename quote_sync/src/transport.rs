//! Byte-level access to the provider.
//!
//! `Transport` is the seam between the connection manager and the network. The
//! production implementation, `TcpTransport`, speaks the newline-delimited login and
//! quote protocol over a plain TCP socket and runs a reader thread that feeds every
//! received line to the session's `SessionEvents`. `scripted::ScriptedTransport` is an
//! in-process stand-in used by tests and dry runs.
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, bounded};
use log::{debug, warn};
use quote_common::protocol::{LOGIN_ACCEPTED, is_fatal_auth_message};
use quote_common::{Result, SyncError};

use crate::config::Credentials;
use crate::connection::SessionEvents;

/// A provider session transport.
pub trait Transport: Send {
    /// Opens a session and completes the login within `timeout`. After `Ok`, every
    /// line received goes to `events.on_message` and an unexpected end of the session
    /// to `events.on_disconnect`, until `close` is called.
    fn open(
        &mut self,
        credentials: &Credentials,
        timeout: Duration,
        events: SessionEvents,
    ) -> Result<()>;

    /// Writes one command line.
    fn send_line(&mut self, line: &str) -> Result<()>;

    /// Releases the session. Must be idempotent.
    fn close(&mut self);
}

/// Line protocol over TCP.
pub struct TcpTransport {
    address: String,
    stream: Option<TcpStream>,
    reader: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Transport for `address` (`host:port`); nothing is opened until `open`.
    pub fn new(address: &str) -> Self {
        Self {
            address: String::from(address),
            stream: None,
            reader: None,
        }
    }

    /// Configured provider address.
    pub fn address(&self) -> &str {
        &self.address
    }

    fn connect_any(&self, deadline: Instant, timeout: Duration) -> Result<TcpStream> {
        let addrs = match self.address.parse::<SocketAddr>() {
            Ok(addr) => vec![addr],
            Err(_) => {
                let address = self.address.clone();
                resolve_within(
                    move || address.to_socket_addrs().map(|addrs| addrs.collect()),
                    deadline,
                    timeout,
                )?
            }
        };
        let mut last_error = None;
        for addr in addrs {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if e.kind() == ErrorKind::TimedOut => Err(SyncError::ConnectTimeout(timeout)),
            Some(e) => Err(SyncError::Io(e)),
            None => Err(SyncError::ConnectTimeout(timeout)),
        }
    }
}

/// Runs a blocking name lookup on a helper thread and gives up at `deadline`. A lookup
/// that outlives the deadline finishes in the background and is discarded.
fn resolve_within<F>(resolve: F, deadline: Instant, timeout: Duration) -> Result<Vec<SocketAddr>>
where
    F: FnOnce() -> io::Result<Vec<SocketAddr>> + Send + 'static,
{
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name(String::from("quote-feed-resolver"))
        .spawn(move || {
            let _ = tx.send(resolve());
        })?;

    let remaining = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(remaining) {
        Ok(addrs) => Ok(addrs?),
        Err(RecvTimeoutError::Timeout) => Err(SyncError::ConnectTimeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(SyncError::Io(io::Error::other(
            "address lookup ended without a result",
        ))),
    }
}

fn read_line_lossy<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>> {
    buf.clear();
    let size = reader.read_until(b'\n', buf)?;
    if size == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(String::from(line.trim_end_matches(['\r', '\n']))))
}

fn await_login<R: BufRead>(
    reader: &mut R,
    stream: &TcpStream,
    deadline: Instant,
    timeout: Duration,
) -> Result<()> {
    let mut buf = Vec::new();
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(SyncError::ConnectTimeout(timeout))?;
        stream.set_read_timeout(Some(remaining))?;

        match read_line_lossy(reader, &mut buf) {
            Ok(None) => {
                return Err(SyncError::Disconnected(String::from(
                    "provider closed the connection during login",
                )));
            }
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.eq_ignore_ascii_case(LOGIN_ACCEPTED) {
                    return Ok(());
                }
                if is_fatal_auth_message(trimmed) {
                    return Err(SyncError::AuthRejected(String::from(trimmed)));
                }
                debug!("Login banner: {}", trimmed);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return Err(SyncError::ConnectTimeout(timeout));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SyncError::Io(e)),
        }
    }
}

impl Transport for TcpTransport {
    fn open(
        &mut self,
        credentials: &Credentials,
        timeout: Duration,
        events: SessionEvents,
    ) -> Result<()> {
        self.close();
        let deadline = Instant::now() + timeout;

        let mut stream = self.connect_any(deadline, timeout)?;
        stream.set_nodelay(true)?;
        let login = format!(
            "{}\n{}\n{}\n",
            credentials.software_key, credentials.username, credentials.password
        );
        stream.write_all(login.as_bytes())?;

        let mut reader = BufReader::new(stream.try_clone()?);
        if let Err(e) = await_login(&mut reader, &stream, deadline, timeout) {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(e);
        }
        stream.set_read_timeout(None)?;

        let handle = thread::Builder::new()
            .name(format!("quote-feed-reader-{}", events.session()))
            .spawn(move || {
                let mut buf = Vec::new();
                loop {
                    match read_line_lossy(&mut reader, &mut buf) {
                        Ok(Some(line)) => events.on_message(&line),
                        Ok(None) => {
                            events.on_disconnect("connection closed by provider");
                            break;
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            events.on_disconnect(&e.to_string());
                            break;
                        }
                    }
                }
            })?;

        self.stream = Some(stream);
        self.reader = Some(handle);
        Ok(())
    }

    fn send_line(&mut self, line: &str) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(SyncError::NotConnected)?;
        stream.write_all(format!("{}\n", line).as_bytes())?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!("Socket shutdown: {}", e);
            }
        }
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("Provider reader thread panicked");
            }
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

pub mod scripted {
    //! In-process transport driven by a shared `TransportScript`.
    //!
    //! The script decides how `open` behaves (succeed, fail transiently, reject the
    //! login), records every line sent, and can push provider lines or a disconnect
    //! into the current session at any time, from any thread.
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::time::Duration;

    use quote_common::{Result, SyncError};

    use super::Transport;
    use crate::config::Credentials;
    use crate::connection::SessionEvents;

    type Responder = Box<dyn Fn(&str) -> Vec<String> + Send>;

    #[derive(Default)]
    struct ScriptState {
        opens: usize,
        closes: usize,
        fail_opens: usize,
        reject: Option<String>,
        preload: Vec<String>,
        sent: Vec<String>,
        responder: Option<Responder>,
        events: Option<SessionEvents>,
    }

    /// Shared control handle for one or more `ScriptedTransport`s.
    #[derive(Clone, Default)]
    pub struct TransportScript {
        state: Arc<Mutex<ScriptState>>,
    }

    impl TransportScript {
        fn lock(&self) -> MutexGuard<'_, ScriptState> {
            match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            }
        }

        /// The next `n` opens fail with a transient I/O error.
        pub fn fail_next_opens(&self, n: usize) {
            self.lock().fail_opens = n;
        }

        /// Every open is refused with `text`.
        pub fn reject_login(&self, text: &str) {
            self.lock().reject = Some(String::from(text));
        }

        /// Lines delivered right after the next successful open.
        pub fn preload<S: AsRef<str>>(&self, lines: &[S]) {
            self.lock()
                .preload
                .extend(lines.iter().map(|l| String::from(l.as_ref())));
        }

        /// Answers every sent line with the lines `responder` returns.
        pub fn respond_with<F>(&self, responder: F)
        where
            F: Fn(&str) -> Vec<String> + Send + 'static,
        {
            self.lock().responder = Some(Box::new(responder));
        }

        /// Delivers `line` on the current session.
        pub fn inject(&self, line: &str) {
            let events = self.lock().events.clone();
            if let Some(events) = events {
                events.on_message(line);
            }
        }

        /// Ends the current session from the provider side.
        pub fn disconnect(&self, reason: &str) {
            let events = self.lock().events.take();
            if let Some(events) = events {
                events.on_disconnect(reason);
            }
        }

        /// Callbacks of the current session.
        pub fn events(&self) -> Option<SessionEvents> {
            self.lock().events.clone()
        }

        /// Number of `open` calls so far.
        pub fn opens(&self) -> usize {
            self.lock().opens
        }

        /// Number of `close` calls that released an open session.
        pub fn closes(&self) -> usize {
            self.lock().closes
        }

        /// Every line sent so far, oldest first.
        pub fn sent(&self) -> Vec<String> {
            self.lock().sent.clone()
        }
    }

    /// Transport whose behaviour is scripted through a `TransportScript`.
    pub struct ScriptedTransport {
        script: TransportScript,
    }

    impl ScriptedTransport {
        /// Transport controlled by `script`.
        pub fn new(script: TransportScript) -> Self {
            Self { script }
        }
    }

    impl Transport for ScriptedTransport {
        fn open(
            &mut self,
            _credentials: &Credentials,
            timeout: Duration,
            events: SessionEvents,
        ) -> Result<()> {
            let preload = {
                let mut state = self.script.lock();
                state.opens += 1;
                if let Some(text) = &state.reject {
                    return Err(SyncError::AuthRejected(text.clone()));
                }
                if state.fail_opens > 0 {
                    state.fail_opens -= 1;
                    return Err(SyncError::ConnectTimeout(timeout));
                }
                state.events = Some(events.clone());
                std::mem::take(&mut state.preload)
            };
            for line in preload {
                events.on_message(&line);
            }
            Ok(())
        }

        fn send_line(&mut self, line: &str) -> Result<()> {
            let (events, replies) = {
                let mut state = self.script.lock();
                let events = state.events.clone().ok_or(SyncError::NotConnected)?;
                state.sent.push(String::from(line));
                let replies = state
                    .responder
                    .as_ref()
                    .map(|respond| respond(line))
                    .unwrap_or_default();
                (events, replies)
            };
            for reply in replies {
                events.on_message(&reply);
            }
            Ok(())
        }

        fn close(&mut self) {
            let mut state = self.script.lock();
            if state.events.take().is_some() {
                state.closes += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::queue::{FeedEvent, QuoteQueue};
    use std::net::TcpListener;

    fn serve_once<F>(handler: F) -> String
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                handler(stream);
            }
        });
        address
    }

    fn read_login(stream: &TcpStream) -> Vec<String> {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        (0..3)
            .map(|_| {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                String::from(line.trim_end())
            })
            .collect()
    }

    #[test]
    fn logs_in_and_delivers_lines() {
        let address = serve_once(|mut stream| {
            let login = read_login(&stream);
            assert_eq!(login, vec!["", "desk", "secret"]);
            stream
                .write_all(b"Welcome\r\nYou are connected\r\nT:PETR4:101500:2:30,15\r\n")
                .unwrap();
            thread::sleep(Duration::from_millis(50));
        });

        let queue = QuoteQueue::unbounded();
        let mut manager = ConnectionManager::new(
            TcpTransport::new(&address),
            Credentials::new("desk", "secret"),
            Duration::from_secs(2),
            queue.clone(),
        );
        manager.start().unwrap();
        assert!(manager.is_connected());

        match queue.pop(Duration::from_secs(2)) {
            Some(FeedEvent::Message(msg)) => assert_eq!(msg.text, "T:PETR4:101500:2:30,15"),
            other => panic!("unexpected {:?}", other),
        }
        match queue.pop(Duration::from_secs(2)) {
            Some(FeedEvent::Disconnected { session, .. }) => assert_eq!(session, 1),
            other => panic!("unexpected {:?}", other),
        }
        manager.stop();
    }

    #[test]
    fn refused_login_is_fatal() {
        let address = serve_once(|mut stream| {
            read_login(&stream);
            stream.write_all(b"Invalid login.\n").unwrap();
        });
        let mut manager = ConnectionManager::new(
            TcpTransport::new(&address),
            Credentials::new("desk", "wrong"),
            Duration::from_secs(2),
            QuoteQueue::unbounded(),
        );
        let err = manager.start().unwrap_err();
        assert!(matches!(err, SyncError::AuthRejected(ref text) if text == "Invalid login."));
        assert!(err.is_fatal());
        assert_eq!(manager.transport().address(), address);
    }

    #[test]
    fn silent_provider_times_out() {
        let address = serve_once(|stream| {
            read_login(&stream);
            thread::sleep(Duration::from_millis(500));
        });
        let mut manager = ConnectionManager::new(
            TcpTransport::new(&address),
            Credentials::new("desk", "secret"),
            Duration::from_millis(100),
            QuoteQueue::unbounded(),
        );
        let err = manager.start().unwrap_err();
        assert!(matches!(err, SyncError::ConnectTimeout(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn slow_name_lookup_is_bounded_by_the_connect_deadline() {
        let started = Instant::now();
        let err = resolve_within(
            || {
                thread::sleep(Duration::from_secs(2));
                Ok(Vec::new())
            },
            started + Duration::from_millis(100),
            Duration::from_millis(100),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::ConnectTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn name_lookup_errors_are_transient() {
        let err = resolve_within(
            || Err(io::Error::new(ErrorKind::NotFound, "no such host")),
            Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Io(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn send_without_session_fails() {
        let mut transport = TcpTransport::new("127.0.0.1:9");
        assert!(matches!(transport.send_line("SQT X N"), Err(SyncError::NotConnected)));
        transport.close();
        transport.close();
    }
}
