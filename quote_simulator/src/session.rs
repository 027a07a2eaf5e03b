//! One provider session: login handshake, then request/answer until the client quits,
//! the socket closes or the simulator shuts down.
//!
//! Any error here ends this session only; the accept loop keeps serving others.
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::TcpStream;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Local;
use crossbeam_channel::{Receiver, TryRecvError};
use log::{debug, info, warn};
use quote_common::protocol::{
    ASK_FIELD, BID_FIELD, Command, ERROR_PREFIX, LAST_TRADE_FIELD, LOGIN_ACCEPTED, QuoteMode,
    TickFrame,
};
use quote_common::{Result, SyncError};
use rust_decimal::Decimal;

use crate::model::config::SimulatorConfig;
use crate::model::market::Market;

/// Read timeout used to notice a shutdown while a client is idle.
const IDLE_POLL: Duration = Duration::from_millis(100);
/// Spread quoted around the last trade.
const HALF_SPREAD: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

const BANNER: &str = "Quote simulator ready";
const INVALID_LOGIN: &str = "Invalid login.";
const KEY_NOT_FOUND: &str = "Software key not found.";

/// Serves one client connection.
pub struct Session {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    config: Arc<SimulatorConfig>,
    market: Arc<Market>,
    shutdown: Receiver<()>,
}

impl Session {
    /// Wraps an accepted connection.
    pub fn new(
        stream: TcpStream,
        config: Arc<SimulatorConfig>,
        market: Arc<Market>,
        shutdown: Receiver<()>,
    ) -> Result<Self> {
        stream.set_read_timeout(Some(IDLE_POLL))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            stream,
            reader,
            config,
            market,
            shutdown,
        })
    }

    fn shutting_down(&self) -> bool {
        matches!(self.shutdown.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Reads one line, waiting through idle timeouts. `None` on EOF or shutdown.
    fn next_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        loop {
            if self.shutting_down() {
                return Ok(None);
            }
            match self.reader.read_until(b'\n', &mut buf) {
                Ok(0) if buf.is_empty() => return Ok(None),
                Ok(_) => {
                    let line = String::from_utf8(buf)?;
                    return Ok(Some(String::from(line.trim_end_matches(['\r', '\n']))));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SyncError::Io(e)),
            }
        }
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.stream.write_all(format!("{}\r\n", line).as_bytes())?;
        Ok(())
    }

    /// Runs the session to completion.
    pub fn run(mut self) -> Result<()> {
        let peer = self.stream.peer_addr()?;
        self.write_line(BANNER)?;

        if !self.login()? {
            info!("Login refused for {}", peer);
            return Ok(());
        }
        info!("Session opened for {}", peer);

        while let Some(line) = self.next_line()? {
            if line.trim().is_empty() {
                continue;
            }
            match Command::from_str(&line) {
                Ok(Command::Quit) => break,
                Ok(Command::Quote { symbol, mode }) => self.answer_quote(&symbol, mode)?,
                Err(e) => {
                    debug!("Unknown command from {}: {}", peer, line);
                    self.write_line(&format!("{}{}", ERROR_PREFIX, e))?;
                }
            }
        }

        info!("Session closed for {}", peer);
        Ok(())
    }

    fn login(&mut self) -> Result<bool> {
        let mut lines = Vec::with_capacity(3);
        while lines.len() < 3 {
            match self.next_line()? {
                Some(line) => lines.push(line),
                None => return Ok(false),
            }
        }
        let (key, user, password) = (lines[0].trim(), lines[1].trim(), lines[2].as_str());

        if let Some(expected) = &self.config.software_key {
            if key != expected.as_str() {
                self.write_line(KEY_NOT_FOUND)?;
                return Ok(false);
            }
        }
        if user != self.config.username || password != self.config.password {
            self.write_line(INVALID_LOGIN)?;
            return Ok(false);
        }
        self.write_line(LOGIN_ACCEPTED)?;
        Ok(true)
    }

    fn answer_quote(&mut self, symbol: &str, mode: QuoteMode) -> Result<()> {
        if mode == QuoteMode::Streaming {
            let error = format!("{}Streaming not available for {}", ERROR_PREFIX, symbol);
            return self.write_line(&error);
        }
        if self.config.silent.contains(symbol) {
            debug!("{} is silent, not answering", symbol);
            return Ok(());
        }
        let Some(price) = self.market.tick(symbol) else {
            warn!("Request for unlisted symbol {}", symbol);
            return self.write_line(&format!("{}Invalid symbol {}", ERROR_PREFIX, symbol));
        };

        if !self.config.reply_delay.is_zero() {
            thread::sleep(self.config.reply_delay);
        }
        let time = Local::now().format("%H%M%S").to_string();
        let frame = TickFrame::new(symbol, &time)
            .field(LAST_TRADE_FIELD, self.config.render_price(price))
            .field(BID_FIELD, self.config.render_price(price - HALF_SPREAD))
            .field(ASK_FIELD, self.config.render_price(price + HALF_SPREAD));
        self.write_line(&frame.to_string())
    }
}
