//! Hand-off buffer between the transport thread and the scheduler thread.
//!
//! The transport's callbacks only ever `push` into a `QuoteQueue`; the scheduler is the
//! single consumer and `pop`s with a timeout. The queue owns both ends of its crossbeam
//! channel, so neither side ever observes a disconnected channel, even after the
//! session that fed it has been closed.
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One raw provider line, tagged with the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Session epoch assigned by the connection manager.
    pub session: u64,
    /// The line as received, without the line terminator.
    pub text: String,
}

/// Everything the transport side can hand to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// A provider line.
    Message(WireMessage),
    /// The session ended without being asked to.
    Disconnected {
        /// Session epoch that ended.
        session: u64,
        /// Transport-provided reason.
        reason: String,
    },
}

/// Thread-safe FIFO of `FeedEvent`s.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct QuoteQueue {
    tx: Sender<FeedEvent>,
    rx: Receiver<FeedEvent>,
    dropped: Arc<AtomicU64>,
}

impl QuoteQueue {
    /// Queue that grows without limit.
    pub fn unbounded() -> Self {
        let (tx, rx) = unbounded();
        Self::from_channel(tx, rx)
    }

    /// Queue holding at most `capacity` events; a push into a full queue evicts the
    /// oldest event.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self::from_channel(tx, rx)
    }

    fn from_channel(tx: Sender<FeedEvent>, rx: Receiver<FeedEvent>) -> Self {
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Appends `event`. Never blocks.
    pub fn push(&self, event: FeedEvent) {
        let mut pending = event;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if let Ok(evicted) = self.rx.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("Queue full, dropped oldest event: {:?}", evicted);
                    }
                    pending = back;
                }
                // Unreachable while `self` holds the receiver.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Waits up to `timeout` for the next event.
    pub fn pop(&self, timeout: Duration) -> Option<FeedEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Removes and returns everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<FeedEvent> {
        self.rx.try_iter().collect()
    }

    /// Discards everything currently queued and returns how many events were dropped.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Events evicted by a full bounded queue since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for QuoteQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn msg(text: &str) -> FeedEvent {
        FeedEvent::Message(WireMessage {
            session: 1,
            text: String::from(text),
        })
    }

    #[test]
    fn pops_in_arrival_order() {
        let queue = QuoteQueue::unbounded();
        queue.push(msg("a"));
        queue.push(msg("b"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(Duration::from_millis(10)), Some(msg("a")));
        assert_eq!(queue.pop(Duration::from_millis(10)), Some(msg("b")));
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_times_out_when_empty() {
        let queue = QuoteQueue::unbounded();
        let started = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(50)), None);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn bounded_queue_evicts_oldest() {
        let queue = QuoteQueue::bounded(2);
        queue.push(msg("a"));
        queue.push(msg("b"));
        queue.push(msg("c"));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.drain(), vec![msg("b"), msg("c")]);
    }

    #[test]
    fn producer_thread_hands_off_to_consumer() {
        let queue = QuoteQueue::unbounded();
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            for i in 0..100 {
                producer.push(msg(&i.to_string()));
            }
        });
        handle.join().unwrap();

        let mut seen = 0;
        while let Some(FeedEvent::Message(m)) = queue.pop(Duration::from_millis(10)) {
            assert_eq!(m.text, seen.to_string());
            seen += 1;
        }
        assert_eq!(seen, 100);
    }

    #[test]
    fn clear_reports_discarded_count() {
        let queue = QuoteQueue::unbounded();
        queue.push(msg("a"));
        queue.push(FeedEvent::Disconnected {
            session: 1,
            reason: String::from("eof"),
        });
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
