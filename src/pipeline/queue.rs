//! Bounded FIFO hand-off between two stages.
//!
//! Built on a `crossbeam_channel::bounded` channel plus a close signal. The
//! close signal is a second channel whose only sender is dropped on `close()`,
//! which makes it permanently ready and wakes every blocked `push`/`pop`.
//!
//! A push that passed the closed check may still land after `close()`. Pushes
//! are counted while in flight, and `pop` reports end-of-stream only once the
//! queue is closed, no push is in flight and nothing is buffered.

use crossbeam_channel::{bounded, unbounded, Receiver, Select, Sender, TryRecvError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long a `pop` on a closed queue waits per round for in-flight pushes.
const IN_FLIGHT_POLL: Duration = Duration::from_micros(50);

/// Queue operation recorded by the event monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOp {
    Pushed,
    Popped,
    Closed,
}

/// One entry of the push/pop event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueEvent {
    pub op: QueueOp,
    /// Items buffered right after the operation
    pub depth: usize,
}

/// Blocking bounded queue with close semantics.
///
/// Cloning yields another handle to the same queue.
pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    close_tx: Arc<Mutex<Option<Sender<()>>>>,
    close_rx: Receiver<()>,
    closed: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    high_water: Arc<AtomicUsize>,
    capacity: usize,
    monitor: Option<Sender<QueueEvent>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            close_tx: Arc::clone(&self.close_tx),
            close_rx: self.close_rx.clone(),
            closed: Arc::clone(&self.closed),
            in_flight: Arc::clone(&self.in_flight),
            high_water: Arc::clone(&self.high_water),
            capacity: self.capacity,
            monitor: self.monitor.clone(),
        }
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> BoundedQueue<T> {
    /// A queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        let (close_tx, close_rx) = bounded(0);
        Self {
            tx,
            rx,
            close_tx: Arc::new(Mutex::new(Some(close_tx))),
            close_rx,
            closed: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            high_water: Arc::new(AtomicUsize::new(0)),
            capacity,
            monitor: None,
        }
    }

    /// A queue that also reports every push, pop and close.
    pub fn with_events(capacity: usize) -> (Self, Receiver<QueueEvent>) {
        let (event_tx, event_rx) = unbounded();
        let mut queue = Self::new(capacity);
        queue.monitor = Some(event_tx);
        (queue, event_rx)
    }

    /// Block until there is room, then enqueue.
    ///
    /// Returns the item back if the queue is closed before it is enqueued.
    pub fn push(&self, item: T) -> Result<(), T> {
        // counted before the closed check; see `pop`
        let _in_flight = InFlight::enter(&self.in_flight);
        if self.is_closed() {
            return Err(item);
        }

        let mut sel = Select::new();
        let send_index = sel.send(&self.tx);
        let close_index = sel.recv(&self.close_rx);
        let oper = sel.select();
        match oper.index() {
            i if i == send_index => {
                oper.send(&self.tx, item).map_err(|e| e.into_inner())?;
                let depth = self.len();
                self.high_water.fetch_max(depth, Ordering::Relaxed);
                self.record(QueueOp::Pushed, depth);
                Ok(())
            }
            i if i == close_index => {
                let _ = oper.recv(&self.close_rx);
                Err(item)
            }
            _ => Err(item),
        }
    }

    /// Block until an item is available.
    ///
    /// After `close()` the remaining items are still handed out; `None`
    /// signals end-of-stream once the queue is closed and empty with no push
    /// in flight.
    pub fn pop(&self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(item) => {
                    self.record(QueueOp::Popped, self.len());
                    return Some(item);
                }
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }
            if self.is_closed() {
                return self.pop_closed();
            }

            let mut sel = Select::new();
            let recv_index = sel.recv(&self.rx);
            let close_index = sel.recv(&self.close_rx);
            let oper = sel.select();
            match oper.index() {
                i if i == recv_index => {
                    if let Ok(item) = oper.recv(&self.rx) {
                        self.record(QueueOp::Popped, self.len());
                        return Some(item);
                    }
                }
                i if i == close_index => {
                    let _ = oper.recv(&self.close_rx);
                }
                _ => {}
            }
        }
    }

    /// End-of-stream check for a closed queue: late pushes still get through.
    fn pop_closed(&self) -> Option<T> {
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                let item = self.rx.try_recv().ok()?;
                self.record(QueueOp::Popped, self.len());
                return Some(item);
            }
            if let Ok(item) = self.rx.recv_timeout(IN_FLIGHT_POLL) {
                self.record(QueueOp::Popped, self.len());
                return Some(item);
            }
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.rx.try_recv().ok()?;
        self.record(QueueOp::Popped, self.len());
        Some(item)
    }

    /// Reject further pushes and wake blocked callers. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let sender = match self.close_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if sender.is_some() {
            drop(sender);
            self.record(QueueOp::Closed, self.len());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest depth observed after a push.
    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    fn record(&self, op: QueueOp, depth: usize) {
        if let Some(monitor) = &self.monitor {
            let _ = monitor.send(QueueEvent { op, depth });
        }
    }
}

/// Counts a push for as long as it runs.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let q = BoundedQueue::new(4);
        for i in 0..4 {
            q.push(i).unwrap();
        }
        q.close();
        let drained: Vec<i32> = std::iter::from_fn(|| q.pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_closed_queue_rejects_push() {
        let q = BoundedQueue::new(2);
        q.close();
        q.close();
        assert_eq!(q.push(5), Err(5));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let q = BoundedQueue::new(1);
        q.push(1).unwrap();
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push(2))
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(producer.join().unwrap(), Err(2));
        // buffered item survives the close
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let q: BoundedQueue<u8> = BoundedQueue::new(1);
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_backpressure_bounds_depth() {
        let (q, events) = BoundedQueue::with_events(2);
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    q.push(i).unwrap();
                }
                q.close();
            })
        };
        let mut received = Vec::new();
        while let Some(v) = q.pop() {
            received.push(v);
            if v % 7 == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        producer.join().unwrap();

        assert_eq!(received, (0..50).collect::<Vec<_>>());
        assert!(q.high_water_mark() <= 2);
        let log: Vec<QueueEvent> = events.try_iter().collect();
        assert!(log.iter().all(|e| e.depth <= 2));
        assert_eq!(log.iter().filter(|e| e.op == QueueOp::Pushed).count(), 50);
        assert_eq!(log.iter().filter(|e| e.op == QueueOp::Closed).count(), 1);
    }

    #[test]
    fn test_push_racing_close_is_never_lost() {
        for round in 0..200 {
            let q = BoundedQueue::new(4);
            let producers: Vec<_> = (0..4)
                .map(|p| {
                    let q = q.clone();
                    thread::spawn(move || {
                        (0..25).filter(|&i| q.push(p * 100 + i).is_ok()).count()
                    })
                })
                .collect();
            let consumer = {
                let q = q.clone();
                thread::spawn(move || std::iter::from_fn(|| q.pop()).count())
            };
            if round % 2 == 0 {
                thread::yield_now();
            }
            q.close();

            let pushed: usize = producers.into_iter().map(|h| h.join().unwrap()).sum();
            let popped = consumer.join().unwrap();
            assert_eq!(pushed, popped, "round {}", round);
        }
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let q = BoundedQueue::<()>::new(0);
        assert_eq!(q.capacity(), 1);
    }
}
