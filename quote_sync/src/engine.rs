//! Caller-facing control surface of the sync engine.
//!
//! `QuoteSyncEngine` owns a `CycleScheduler` and moves it onto a dedicated thread for
//! `start`; `stop` raises the stop signal, joins the thread and takes the scheduler
//! back, so the engine can be started again or driven with `run_once`.
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{SendError, bounded};
use log::{error, info, warn};
use quote_common::{Result, SyncError};

use crate::config::{EngineConfig, SymbolRules};
use crate::scheduler::{CycleReport, CycleScheduler};
use crate::signal::StopSignal;
use crate::store::PriceStore;
use crate::transport::Transport;

type Worker<T, S> = JoinHandle<Option<(CycleScheduler<T, S>, Result<()>)>>;

/// Runs the update loop on a thread from `builder`. The scheduler is handed over only
/// once the thread exists, so a failed spawn returns it to the caller.
fn spawn_loop<T, S>(
    builder: thread::Builder,
    scheduler: CycleScheduler<T, S>,
) -> std::result::Result<Worker<T, S>, (CycleScheduler<T, S>, io::Error)>
where
    T: Transport + 'static,
    S: PriceStore + 'static,
{
    let (handoff_tx, handoff_rx) = bounded::<CycleScheduler<T, S>>(1);
    let spawned = builder.spawn(move || {
        let mut scheduler = handoff_rx.recv().ok()?;
        let result = scheduler.run();
        if let Err(e) = &result {
            error!("Update loop ended with error: {}", e);
        }
        Some((scheduler, result))
    });

    match spawned {
        Ok(worker) => match handoff_tx.send(scheduler) {
            Ok(()) => Ok(worker),
            Err(SendError(scheduler)) => Err((
                scheduler,
                io::Error::other("scheduler thread exited before the hand-off"),
            )),
        },
        Err(e) => Err((scheduler, e)),
    }
}

/// Start/stop/run-once facade over a scheduler.
pub struct QuoteSyncEngine<T: Transport + 'static, S: PriceStore + 'static> {
    scheduler: Option<CycleScheduler<T, S>>,
    worker: Option<Worker<T, S>>,
    stop: StopSignal,
}

impl<T: Transport + 'static, S: PriceStore + 'static> QuoteSyncEngine<T, S> {
    /// Builds an idle engine.
    pub fn new(config: EngineConfig, transport: T, store: S, rules: SymbolRules) -> Result<Self> {
        let stop = StopSignal::new();
        let scheduler = CycleScheduler::new(config, transport, store, rules, stop.clone())?;
        Ok(Self {
            scheduler: Some(scheduler),
            worker: None,
            stop,
        })
    }

    /// Starts the update loop on its own thread. Fails with `EngineBusy` while a loop
    /// is already running.
    pub fn start(&mut self, interval: Duration, cycle_timeout: Duration) -> Result<()> {
        if self.worker.is_some() {
            return Err(SyncError::EngineBusy);
        }
        let mut scheduler = self.scheduler.take().ok_or(SyncError::EngineBusy)?;
        if let Err(e) = scheduler.set_timing(interval, cycle_timeout) {
            self.scheduler = Some(scheduler);
            return Err(e);
        }

        self.stop.reset();
        let builder = thread::Builder::new().name(String::from("quote-sync-scheduler"));
        match spawn_loop(builder, scheduler) {
            Ok(worker) => self.worker = Some(worker),
            Err((scheduler, e)) => {
                error!("Could not start the scheduler thread: {}", e);
                self.scheduler = Some(scheduler);
                return Err(SyncError::Io(e));
            }
        }
        info!("Quote sync engine started");
        Ok(())
    }

    /// Stops the loop and waits for the scheduler thread. Idempotent; returns the
    /// loop's own result the first time after it ran.
    pub fn stop(&mut self) -> Result<()> {
        self.stop.raise();
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        match worker.join() {
            Ok(Some((scheduler, result))) => {
                self.scheduler = Some(scheduler);
                info!("Quote sync engine stopped");
                result
            }
            Ok(None) => Ok(()),
            Err(_) => {
                warn!("Scheduler thread panicked");
                Err(SyncError::WorkerPanicked(String::from("quote-sync-scheduler")))
            }
        }
    }

    /// Runs one cycle on the calling thread. Fails with `EngineBusy` while the loop
    /// is running.
    pub fn run_once(&mut self, timeout: Duration) -> Result<CycleReport> {
        if self.worker.is_some() {
            return Err(SyncError::EngineBusy);
        }
        let scheduler = self.scheduler.as_mut().ok_or(SyncError::EngineBusy)?;
        self.stop.reset();
        scheduler.run_once(timeout)
    }

    /// Reloads the catalog and rebuilds the symbol table. The running loop refreshes
    /// before every cycle by itself, so this fails with `EngineBusy` while it runs.
    pub fn refresh_mapping(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(SyncError::EngineBusy);
        }
        self.scheduler
            .as_mut()
            .ok_or(SyncError::EngineBusy)?
            .refresh_mapping()
    }

    /// `true` while the loop thread exists and has not ended.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// `true` when the loop thread ended by itself (terminal error or stop); `stop`
    /// collects its result.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.is_finished())
    }

    /// The scheduler, when no loop is running.
    pub fn scheduler(&self) -> Option<&CycleScheduler<T, S>> {
        self.scheduler.as_ref()
    }

    /// Handle that stops the loop from any thread (e.g. a signal handler).
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }
}

impl<T: Transport + 'static, S: PriceStore + 'static> Drop for QuoteSyncEngine<T, S> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.stop();
        }
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.shutdown();
        }
    }
}
