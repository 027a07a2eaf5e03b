//! The update cycle state machine.
//!
//! One `CycleScheduler` owns the connection, the queue, the symbol table and the price
//! store, and runs on a single thread; it is the only writer to the store. A cycle
//! walks `Connecting -> RequestsSent -> AwaitingQuotes -> Draining -> CycleComplete`,
//! and the loop then sleeps (`Sleeping`) until the next interval or a stop request
//! (`Stopped`).
//!
//! Accounting rules:
//! - `expected_count` is the number of requested symbols (denylist excluded);
//! - a tick counts once per ticker per cycle, and only after its upsert succeeded;
//! - errors, partial updates, unknown symbols and duplicates never count.
use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use quote_common::{Command, PriceUpdate, Result, SyncError};
use strum_macros::Display;

use crate::config::{EngineConfig, ReconnectPolicy, SymbolRules};
use crate::connection::ConnectionManager;
use crate::parser::{ParseOutcome, QuoteEvent, parse_message};
use crate::queue::{FeedEvent, QuoteQueue};
use crate::signal::StopSignal;
use crate::store::PriceStore;
use crate::symbol_mapper::{SymbolMapping, SymbolTable};
use crate::transport::Transport;

/// Scheduler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CycleState {
    /// Created, no cycle run yet.
    Idle,
    /// Acquiring a provider session.
    Connecting,
    /// All snapshot requests written.
    RequestsSent,
    /// Bounded wait for answers.
    AwaitingQuotes,
    /// Processing what is already queued after the wait ended.
    Draining,
    /// Cycle accounted and logged.
    CycleComplete,
    /// Waiting for the next interval.
    Sleeping,
    /// Loop ended.
    Stopped,
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CycleOutcome {
    /// Every requested symbol answered.
    Complete,
    /// The timeout elapsed with answers missing.
    TimedOut,
    /// No session could be established.
    ConnectFailed,
    /// The session was lost mid-cycle.
    Disconnected,
    /// A stop request interrupted the cycle.
    Stopped,
    /// Nothing to request.
    Empty,
}

/// Bookkeeping of the cycle in flight.
#[derive(Debug)]
pub struct UpdateCycle {
    /// Monotonic start time.
    pub started_at: Instant,
    /// Symbols requested.
    pub expected_count: usize,
    /// Distinct tickers upserted so far.
    pub received_count: usize,
    /// Absolute end of the wait; set once the requests are out.
    pub timeout_at: Option<Instant>,
    answered: HashSet<String>,
}

impl UpdateCycle {
    fn new(expected_count: usize) -> Self {
        Self {
            started_at: Instant::now(),
            expected_count,
            received_count: 0,
            timeout_at: None,
            answered: HashSet::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.received_count >= self.expected_count
    }
}

/// Summary of a finished cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Symbols requested.
    pub expected: usize,
    /// Distinct tickers upserted.
    pub received: usize,
    /// Time from start to accounting.
    pub elapsed: Duration,
    /// How the cycle ended.
    pub outcome: CycleOutcome,
    /// Last phase reached before `CycleComplete`.
    pub last_phase: CycleState,
    /// Requested tickers that got no price.
    pub missing: Vec<String>,
    /// Provider events evicted from a full bounded queue during the cycle.
    pub dropped: u64,
}

/// Runs update cycles against one provider session and one price store.
pub struct CycleScheduler<T: Transport, S: PriceStore> {
    config: EngineConfig,
    rules: SymbolRules,
    connection: ConnectionManager<T>,
    queue: QuoteQueue,
    table: SymbolTable,
    store: S,
    stop: StopSignal,
    state: CycleState,
    cycles: u64,
    drops_seen: u64,
}

impl<T: Transport, S: PriceStore> CycleScheduler<T, S> {
    /// Builds a scheduler; the symbol table is built from the store's catalog.
    pub fn new(
        config: EngineConfig,
        transport: T,
        store: S,
        rules: SymbolRules,
        stop: StopSignal,
    ) -> Result<Self> {
        config.validate()?;
        let queue = match config.queue_capacity {
            Some(capacity) => QuoteQueue::bounded(capacity),
            None => QuoteQueue::unbounded(),
        };
        let connection = ConnectionManager::new(
            transport,
            config.credentials.clone(),
            config.connect_timeout,
            queue.clone(),
        );
        let table = SymbolTable::build(&store.assets()?, &rules.overrides, &rules.denylist);

        Ok(Self {
            config,
            rules,
            connection,
            queue,
            table,
            store,
            stop,
            state: CycleState::Idle,
            cycles: 0,
            drops_seen: 0,
        })
    }

    /// Current phase.
    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Symbol table in use.
    pub fn table(&self) -> &SymbolTable {
        &self.table
    }

    /// The price store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The connection manager.
    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    /// Handle to the stop signal this scheduler observes.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Changes the loop interval and the per-cycle timeout.
    pub fn set_timing(&mut self, interval: Duration, cycle_timeout: Duration) -> Result<()> {
        let mut config = self.config.clone();
        config.interval = interval;
        config.cycle_timeout = cycle_timeout;
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Reloads the store's catalog and rebuilds the symbol table from it. On error the
    /// previous table stays in use.
    pub fn refresh_mapping(&mut self) -> Result<()> {
        self.store.reload()?;
        let assets = self.store.assets()?;
        let table = SymbolTable::build(&assets, &self.rules.overrides, &self.rules.denylist);
        if table.len() != self.table.len() {
            info!("Symbol table now maps {} tickers (was {})", table.len(), self.table.len());
        }
        self.table = table;
        Ok(())
    }

    /// Closes the provider session.
    pub fn shutdown(&mut self) {
        self.connection.stop();
    }

    /// Runs cycles every `interval` until the stop signal is raised or a terminal
    /// error occurs.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "Starting update loop every {}s (timeout {}s, reconnect policy {})",
            self.config.interval.as_secs_f64(),
            self.config.cycle_timeout.as_secs_f64(),
            self.config.reconnect
        );

        let result = loop {
            if self.stop.is_raised() {
                break Ok(());
            }
            if let Err(e) = self.refresh_mapping() {
                warn!("Could not refresh the symbol table, keeping the previous one: {}", e);
            }

            let report = match self.run_cycle(self.config.cycle_timeout) {
                Ok(report) => report,
                Err(e) => break Err(e),
            };

            match report.outcome {
                CycleOutcome::Stopped => break Ok(()),
                CycleOutcome::ConnectFailed | CycleOutcome::Disconnected
                    if self.config.reconnect == ReconnectPolicy::NoRetry =>
                {
                    error!("Provider session unavailable and reconnect policy is 'none'");
                    break Err(SyncError::Disconnected(String::from(
                        "session unavailable and reconnects are disabled",
                    )));
                }
                _ => {}
            }

            self.state = CycleState::Sleeping;
            match self.config.interval.checked_sub(report.elapsed) {
                Some(sleep) if !sleep.is_zero() => {
                    let next = Utc::now()
                        + chrono::Duration::from_std(sleep).unwrap_or(chrono::Duration::zero());
                    info!(
                        "Next update at {} ({:.1}s)",
                        next.format("%H:%M:%S"),
                        sleep.as_secs_f64()
                    );
                    if self.stop.wait(sleep) {
                        break Ok(());
                    }
                }
                _ => warn!(
                    "Update cycle took {:.1}s, longer than the {:.1}s interval; starting now",
                    report.elapsed.as_secs_f64(),
                    self.config.interval.as_secs_f64()
                ),
            }
        };

        self.connection.stop();
        self.state = CycleState::Stopped;
        info!("Update loop finished after {} cycles", self.cycles);
        result
    }

    /// Runs exactly one cycle with `timeout` as its wait bound.
    pub fn run_once(&mut self, timeout: Duration) -> Result<CycleReport> {
        if timeout.is_zero() {
            return Err(SyncError::Config(String::from("cycle timeout must be positive")));
        }
        self.run_cycle(timeout)
    }

    fn run_cycle(&mut self, timeout: Duration) -> Result<CycleReport> {
        self.cycles += 1;
        let started_at = Utc::now();
        let requests = self.table.requests();
        let mut cycle = UpdateCycle::new(requests.len());
        info!(
            "Starting update cycle #{} at {}: {} symbols",
            self.cycles,
            started_at.format("%Y-%m-%d %H:%M:%S"),
            cycle.expected_count
        );

        let stale = self.queue.clear();
        if stale > 0 {
            debug!("Discarded {} messages left over from the previous cycle", stale);
        }

        if requests.is_empty() {
            warn!("No symbols to request, skipping cycle");
            let report = self.finish(
                cycle,
                &requests,
                CycleOutcome::Empty,
                CycleState::Idle,
                started_at,
            );
            return Ok(report);
        }

        self.state = CycleState::Connecting;
        if let Err(e) = self.acquire() {
            return match e {
                e if e.is_fatal() => {
                    self.fail_terminally();
                    Err(e)
                }
                SyncError::Stopped => Ok(self.finish(
                    cycle,
                    &requests,
                    CycleOutcome::Stopped,
                    CycleState::Connecting,
                    started_at,
                )),
                e => {
                    warn!("Could not connect to the quote provider, skipping cycle: {}", e);
                    Ok(self.finish(
                        cycle,
                        &requests,
                        CycleOutcome::ConnectFailed,
                        CycleState::Connecting,
                        started_at,
                    ))
                }
            };
        }

        if let Some(outcome) = self.send_requests(&requests) {
            return Ok(self.finish(cycle, &requests, outcome, CycleState::Connecting, started_at));
        }
        self.state = CycleState::RequestsSent;
        info!("Sent {} snapshot requests", requests.len());

        self.state = CycleState::AwaitingQuotes;
        cycle.timeout_at = Some(Instant::now() + timeout);
        let outcome = match self.await_quotes(&mut cycle) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_terminally();
                return Err(e);
            }
        };

        let (outcome, last_phase) = match outcome {
            CycleOutcome::Complete | CycleOutcome::TimedOut => {
                self.state = CycleState::Draining;
                if let Err(e) = self.drain(&mut cycle) {
                    self.fail_terminally();
                    return Err(e);
                }
                let outcome = if cycle.is_complete() {
                    CycleOutcome::Complete
                } else {
                    CycleOutcome::TimedOut
                };
                (outcome, CycleState::Draining)
            }
            other => (other, CycleState::AwaitingQuotes),
        };

        Ok(self.finish(cycle, &requests, outcome, last_phase, started_at))
    }

    fn acquire(&mut self) -> Result<()> {
        if self.connection.is_connected() {
            debug!("Reusing provider session {}", self.connection.session());
            return Ok(());
        }
        let attempts = self.config.attempts_per_acquire();
        let delay = self.config.effective_reconnect_delay();
        self.connection.connect(attempts, delay, &self.stop)
    }

    fn send_requests(&mut self, requests: &[SymbolMapping]) -> Option<CycleOutcome> {
        for (i, mapping) in requests.iter().enumerate() {
            if self.stop.is_raised() {
                return Some(CycleOutcome::Stopped);
            }
            let delay = self.config.request_delay;
            if i > 0 && !delay.is_zero() && self.stop.wait(delay) {
                return Some(CycleOutcome::Stopped);
            }
            debug!(
                "Requesting quote for {} ({})",
                mapping.provider_symbol, mapping.internal_ticker
            );
            if let Err(e) = self.connection.send(&Command::snapshot(&mapping.provider_symbol)) {
                warn!("Request for {} failed, abandoning cycle: {}", mapping.provider_symbol, e);
                return Some(CycleOutcome::Disconnected);
            }
            if !self.connection.is_connected() {
                warn!("Provider session lost while sending requests");
                return Some(CycleOutcome::Disconnected);
            }
        }
        None
    }

    fn await_quotes(&mut self, cycle: &mut UpdateCycle) -> Result<CycleOutcome> {
        let session = self.connection.session();
        let timeout_at = cycle.timeout_at.unwrap_or_else(Instant::now);

        loop {
            if cycle.is_complete() {
                return Ok(CycleOutcome::Complete);
            }
            if self.stop.is_raised() {
                return Ok(CycleOutcome::Stopped);
            }
            let Some(remaining) = timeout_at.checked_duration_since(Instant::now()) else {
                return Ok(CycleOutcome::TimedOut);
            };
            if remaining.is_zero() {
                return Ok(CycleOutcome::TimedOut);
            }

            let Some(event) = self.queue.pop(remaining.min(self.config.poll_interval)) else {
                continue;
            };
            match event {
                FeedEvent::Message(msg) if msg.session == session => {
                    self.handle_message(&msg.text, cycle)?;
                }
                FeedEvent::Message(msg) => {
                    debug!("Dropping late message from session {}: {}", msg.session, msg.text);
                }
                FeedEvent::Disconnected { session: lost, reason } if lost == session => {
                    warn!("Provider session lost mid-cycle: {}", reason);
                    self.connection.stop();
                    return Ok(CycleOutcome::Disconnected);
                }
                FeedEvent::Disconnected { session: lost, .. } => {
                    debug!("Ignoring disconnect of old session {}", lost);
                }
            }
        }
    }

    fn drain(&mut self, cycle: &mut UpdateCycle) -> Result<()> {
        let session = self.connection.session();
        for event in self.queue.drain() {
            match event {
                FeedEvent::Message(msg) if msg.session == session => {
                    self.handle_message(&msg.text, cycle)?;
                }
                FeedEvent::Disconnected { session: lost, reason } if lost == session => {
                    warn!("Provider session lost: {}", reason);
                    self.connection.stop();
                }
                other => debug!("Dropping stale event {:?}", other),
            }
        }
        Ok(())
    }

    /// Parses and applies one line. Only a fatal provider refusal is returned as an
    /// error; everything else is logged and swallowed.
    fn handle_message(&mut self, text: &str, cycle: &mut UpdateCycle) -> Result<()> {
        match parse_message(text) {
            ParseOutcome::Event(QuoteEvent::Tick {
                provider_symbol,
                last_price,
            }) => {
                let Some(ticker) = self.table.resolve(&provider_symbol).map(String::from) else {
                    warn!("Ticker not found in mapping: {}", provider_symbol);
                    return Ok(());
                };
                if cycle.answered.contains(&ticker) {
                    debug!("Duplicate quote for {} in this cycle ignored", ticker);
                    return Ok(());
                }
                match self.store.upsert(&ticker, PriceUpdate::now(last_price)) {
                    Ok(()) => {
                        cycle.answered.insert(ticker.clone());
                        cycle.received_count += 1;
                        info!(
                            "Price updated for {} ({}): {} [{}/{}]",
                            ticker,
                            provider_symbol,
                            last_price,
                            cycle.received_count,
                            cycle.expected_count
                        );
                    }
                    Err(e) => error!("Failed to update price for {}: {}", ticker, e),
                }
            }
            ParseOutcome::Event(QuoteEvent::Error { text, fatal: true }) => {
                error!("Provider refused the session: {}", text);
                return Err(SyncError::AuthRejected(text));
            }
            ParseOutcome::Event(QuoteEvent::Error { text, .. }) => {
                warn!("Quote error from provider: {}", text);
            }
            ParseOutcome::Ignored(_) | ParseOutcome::Discarded(_) => {}
        }
        Ok(())
    }

    fn fail_terminally(&mut self) {
        self.connection.stop();
        self.state = CycleState::Stopped;
    }

    fn finish(
        &mut self,
        cycle: UpdateCycle,
        requests: &[SymbolMapping],
        outcome: CycleOutcome,
        last_phase: CycleState,
        started_at: DateTime<Utc>,
    ) -> CycleReport {
        let elapsed = cycle.started_at.elapsed();
        let missing: Vec<String> = requests
            .iter()
            .filter(|m| !cycle.answered.contains(&m.internal_ticker))
            .map(|m| m.internal_ticker.clone())
            .collect();
        let total_drops = self.queue.dropped();
        let dropped = total_drops - self.drops_seen;
        self.drops_seen = total_drops;
        if dropped > 0 {
            warn!("Quote queue was full: {} provider events dropped this cycle", dropped);
        }

        match outcome {
            CycleOutcome::TimedOut => warn!(
                "Timed out after {:.1}s with {} of {} quotes missing: {}",
                elapsed.as_secs_f64(),
                cycle.expected_count - cycle.received_count,
                cycle.expected_count,
                missing.join(", ")
            ),
            CycleOutcome::Disconnected => warn!("Cycle abandoned: provider session lost"),
            CycleOutcome::Stopped => info!("Cycle interrupted by stop request"),
            _ => {}
        }

        let keep_session = match self.config.reconnect {
            ReconnectPolicy::ReconnectPerCycle => false,
            ReconnectPolicy::NoRetry | ReconnectPolicy::FixedDelay => {
                outcome != CycleOutcome::Stopped
            }
        };
        if !keep_session {
            self.connection.stop();
        }

        info!(
            "Update cycle #{} finished in {:.1}s ({}): received {}/{}",
            self.cycles,
            elapsed.as_secs_f64(),
            outcome,
            cycle.received_count,
            cycle.expected_count
        );
        self.state = CycleState::CycleComplete;

        CycleReport {
            started_at,
            expected: cycle.expected_count,
            received: cycle.received_count,
            elapsed,
            outcome,
            last_phase,
            missing,
            dropped,
        }
    }
}
