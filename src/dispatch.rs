use anyhow::{Result, ensure};
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::packet::Packet;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Cancellation signal shared by every worker.
///
/// `signal()` is a channel that never carries a message; cancelling drops its
/// only sender so every pending and future receive on it returns at once.
/// That lets workers wait on it inside `select!` next to their real channel.
#[derive(Clone)]
pub struct Shutdown {
    cancelled: Arc<AtomicBool>,
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (trigger, signal) = channel::bounded(0);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(Mutex::new(Some(trigger))),
            signal,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.trigger.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn signal(&self) -> &Receiver<()> {
        &self.signal
    }

    /// Sleep for `duration`, returning `false` if cancelled first
    pub fn sleep(&self, duration: Duration) -> bool {
        select! {
            recv(self.signal) -> _ => false,
            default(duration) => !self.is_cancelled(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded FIFO between the producers and the transmitter.
///
/// `enqueue` blocks while the channel is full and `dequeue` blocks while it
/// is empty; both give up as soon as the shutdown signal fires.
#[derive(Clone)]
pub struct DispatchChannel {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    capacity: usize,
}

impl DispatchChannel {
    pub fn new(capacity: usize) -> Result<Self> {
        ensure!(capacity > 0, "dispatch channel capacity must be at least 1");
        let (tx, rx) = channel::bounded(capacity);
        Ok(Self { tx, rx, capacity })
    }

    /// Returns `false` if the packet was not queued because of cancellation
    pub fn enqueue(&self, packet: Packet, shutdown: &Shutdown) -> bool {
        if shutdown.is_cancelled() {
            return false;
        }
        select! {
            send(self.tx, packet) -> res => res.is_ok(),
            recv(shutdown.signal()) -> _ => false,
        }
    }

    /// Returns `None` once cancelled
    pub fn dequeue(&self, shutdown: &Shutdown) -> Option<Packet> {
        if shutdown.is_cancelled() {
            return None;
        }
        select! {
            recv(self.rx) -> packet => packet.ok(),
            recv(shutdown.signal()) -> _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Category, MTU};
    use std::net::Ipv4Addr;
    use std::thread;
    use std::time::Instant;

    fn packet(tag: u8) -> Packet {
        Packet::new(vec![tag; MTU], 1, Category::Data, Ipv4Addr::new(192, 168, 1, 1))
    }

    #[test]
    fn test_fifo_order() {
        let shutdown = Shutdown::new();
        let channel = DispatchChannel::new(8).unwrap();

        for tag in 0..5 {
            assert!(channel.enqueue(packet(tag), &shutdown));
        }
        assert_eq!(channel.len(), 5);

        let tags: Vec<u8> = (0..5)
            .map(|_| channel.dequeue(&shutdown).unwrap().bytes()[0])
            .collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(DispatchChannel::new(0).is_err());
    }

    #[test]
    fn test_enqueue_blocks_until_space_frees() {
        let shutdown = Shutdown::new();
        let channel = DispatchChannel::new(2).unwrap();
        assert!(channel.enqueue(packet(0), &shutdown));
        assert!(channel.enqueue(packet(1), &shutdown));
        assert_eq!(channel.len(), channel.capacity());

        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let channel = channel.clone();
            let shutdown = shutdown.clone();
            let done = done.clone();
            thread::spawn(move || {
                let queued = channel.enqueue(packet(2), &shutdown);
                done.store(true, Ordering::SeqCst);
                queued
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst), "producer should block on a full channel");

        assert_eq!(channel.dequeue(&shutdown).unwrap().bytes()[0], 0);
        assert!(producer.join().unwrap());
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(channel.len(), 2);

        // the blocked packet lands behind the backlog
        assert_eq!(channel.dequeue(&shutdown).unwrap().bytes()[0], 1);
        assert_eq!(channel.dequeue(&shutdown).unwrap().bytes()[0], 2);
    }

    #[test]
    fn test_cancel_releases_blocked_producer() {
        let shutdown = Shutdown::new();
        let channel = DispatchChannel::new(1).unwrap();
        assert!(channel.enqueue(packet(0), &shutdown));

        let producer = {
            let channel = channel.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || channel.enqueue(packet(1), &shutdown))
        };

        thread::sleep(Duration::from_millis(50));
        shutdown.cancel();
        assert!(!producer.join().unwrap());
        assert_eq!(channel.len(), 1);
    }

    #[test]
    fn test_cancel_releases_blocked_consumer() {
        let shutdown = Shutdown::new();
        let channel = DispatchChannel::new(4).unwrap();

        let consumer = {
            let channel = channel.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || channel.dequeue(&shutdown))
        };

        thread::sleep(Duration::from_millis(50));
        shutdown.cancel();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn test_no_dequeue_after_cancel() {
        let shutdown = Shutdown::new();
        let channel = DispatchChannel::new(4).unwrap();
        assert!(channel.enqueue(packet(0), &shutdown));

        shutdown.cancel();
        assert!(channel.dequeue(&shutdown).is_none());
        assert!(!channel.enqueue(packet(1), &shutdown));
    }

    #[test]
    fn test_shutdown_sleep() {
        let shutdown = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_millis(10)));

        let start = Instant::now();
        let sleeper = {
            let shutdown = shutdown.clone();
            thread::spawn(move || shutdown.sleep(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        shutdown.cancel();
        assert!(!sleeper.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
