//! Accept loop of the simulated provider.
//!
//! `ProviderSimulator::bind` opens the listening socket and starts the accept thread;
//! every accepted connection gets its own session thread. A session that fails is
//! logged and forgotten; the accept loop keeps running until `shutdown`.
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use log::{debug, error, info, warn};
use quote_common::Result;

use crate::model::config::SimulatorConfig;
use crate::model::market::Market;
use crate::session::Session;

/// How often the non-blocking accept loop polls for new clients.
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// A running simulated provider.
pub struct ProviderSimulator {
    local_addr: SocketAddr,
    shutdown_tx: Option<Sender<()>>,
    accept: Option<JoinHandle<()>>,
    accepted: Arc<AtomicUsize>,
}

impl ProviderSimulator {
    /// Binds `bind_addr` (e.g. `127.0.0.1:0`) and starts serving.
    pub fn bind(bind_addr: &str, config: SimulatorConfig) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let market = Arc::new(Market::new(&config.symbols, config.initial_price));
        let config = Arc::new(config);
        let accepted = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let counter = Arc::clone(&accepted);
        let accept = thread::Builder::new()
            .name(String::from("simulator-accept"))
            .spawn(move || accept_loop(listener, config, market, shutdown_rx, counter))?;

        info!("Quote simulator listening on {}", local_addr);
        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            accept: Some(accept),
            accepted,
        })
    }

    /// Address clients should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Stops accepting, ends every session and waits for them. Idempotent.
    pub fn shutdown(&mut self) {
        // Dropping the only sender disconnects every session's receiver.
        self.shutdown_tx.take();
        if let Some(handle) = self.accept.take() {
            if handle.join().is_err() {
                error!("Simulator accept thread panicked");
            }
            info!("Quote simulator on {} stopped", self.local_addr);
        }
    }
}

impl Drop for ProviderSimulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    config: Arc<SimulatorConfig>,
    market: Arc<Market>,
    shutdown_rx: Receiver<()>,
    accepted: Arc<AtomicUsize>,
) {
    let mut sessions: Vec<JoinHandle<()>> = Vec::new();

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let id = accepted.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("Accepted {} as session {}", peer, id);
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("Dropping {}: {}", peer, e);
                    continue;
                }
                let session = match Session::new(
                    stream,
                    Arc::clone(&config),
                    Arc::clone(&market),
                    shutdown_rx.clone(),
                ) {
                    Ok(session) => session,
                    Err(e) => {
                        warn!("Dropping {}: {}", peer, e);
                        continue;
                    }
                };
                let spawned = thread::Builder::new()
                    .name(format!("simulator-session-{}", id))
                    .spawn(move || {
                        if let Err(e) = session.run() {
                            warn!("Session {} with {} ended with error: {}", id, peer, e);
                        }
                    });
                match spawned {
                    Ok(handle) => sessions.push(handle),
                    Err(e) => error!("Could not start session thread for {}: {}", peer, e),
                }
                sessions.retain(|h| !h.is_finished());
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                match shutdown_rx.recv_timeout(ACCEPT_POLL) {
                    Err(RecvTimeoutError::Timeout) | Ok(()) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            Err(e) => {
                error!("Accept error: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }

    for handle in sessions {
        let _ = handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream;

    struct Client {
        stream: TcpStream,
        reader: BufReader<TcpStream>,
    }

    impl Client {
        fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let reader = BufReader::new(stream.try_clone().unwrap());
            Self { stream, reader }
        }

        fn send(&mut self, line: &str) {
            self.stream.write_all(format!("{}\n", line).as_bytes()).unwrap();
        }

        fn line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            String::from(line.trim_end())
        }

        fn login(&mut self, user: &str, password: &str) -> String {
            assert_eq!(self.line(), "Quote simulator ready");
            self.send("");
            self.send(user);
            self.send(password);
            self.line()
        }
    }

    fn simulator(config: SimulatorConfig) -> ProviderSimulator {
        ProviderSimulator::bind("127.0.0.1:0", config).unwrap()
    }

    #[test]
    fn answers_snapshots_after_login() {
        let sim = simulator(SimulatorConfig::with_symbols(&["PETR4"]));
        let mut client = Client::connect(sim.local_addr());
        assert_eq!(client.login("demo", "demo"), "You are connected");

        client.send("SQT PETR4 N");
        let frame = client.line();
        assert!(frame.starts_with("T:PETR4:"), "{}", frame);
        let fields: Vec<&str> = frame.split(':').collect();
        assert_eq!(fields[3], "2");
        assert!(fields[4].contains(','), "{}", frame);
        assert_eq!(sim.accepted(), 1);
    }

    #[test]
    fn refuses_bad_credentials() {
        let sim = simulator(SimulatorConfig::with_symbols(&["PETR4"]));
        let mut client = Client::connect(sim.local_addr());
        assert_eq!(client.login("demo", "wrong"), "Invalid login.");
    }

    #[test]
    fn requires_the_configured_software_key() {
        let config = SimulatorConfig {
            software_key: Some(String::from("KEY-1")),
            ..SimulatorConfig::with_symbols(&["PETR4"])
        };
        let sim = simulator(config);
        let mut client = Client::connect(sim.local_addr());
        assert_eq!(client.login("demo", "demo"), "Software key not found.");
    }

    #[test]
    fn unknown_and_streaming_requests_get_error_frames() {
        let sim = simulator(SimulatorConfig::with_symbols(&["PETR4"]));
        let mut client = Client::connect(sim.local_addr());
        client.login("demo", "demo");

        client.send("SQT VALE3 N");
        assert_eq!(client.line(), "E:Invalid symbol VALE3");
        client.send("SQT PETR4 S");
        assert!(client.line().starts_with("E:"));
        client.send("BQT PETR4");
        assert!(client.line().starts_with("E:"));
    }

    #[test]
    fn silent_symbols_never_answer() {
        let mut config = SimulatorConfig::with_symbols(&["PETR4", "VALE3"]);
        config.silent.insert(String::from("VALE3"));
        config.comma_decimals = false;
        let sim = simulator(config);
        let mut client = Client::connect(sim.local_addr());
        client.login("demo", "demo");

        client.send("SQT VALE3 N");
        client.send("SQT PETR4 N");
        let frame = client.line();
        assert!(frame.starts_with("T:PETR4:"), "{}", frame);
        assert!(frame.split(':').nth(4).is_some_and(|price| price.contains('.')));
    }

    #[test]
    fn a_broken_client_does_not_stop_the_server() {
        let sim = simulator(SimulatorConfig::with_symbols(&["PETR4"]));
        {
            let mut rude = Client::connect(sim.local_addr());
            rude.stream.write_all(&[0xff, 0xfe, b'\n']).unwrap();
        }
        let mut client = Client::connect(sim.local_addr());
        assert_eq!(client.login("demo", "demo"), "You are connected");
        client.send("SQT PETR4 N");
        assert!(client.line().starts_with("T:PETR4:"));
    }

    #[test]
    fn shutdown_closes_open_sessions() {
        let mut sim = simulator(SimulatorConfig::with_symbols(&["PETR4"]));
        let mut client = Client::connect(sim.local_addr());
        client.login("demo", "demo");
        sim.shutdown();
        sim.shutdown();

        let mut rest = String::new();
        assert_eq!(client.reader.read_line(&mut rest).unwrap(), 0);
    }
}
