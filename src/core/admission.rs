/// Admission control: a fixed number of execution slots and a bounded wait queue
use crate::config::settings::OverloadPolicy;
use crate::config::types::{ExecutionError, Result};
use crate::core::types::CancellationToken;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Slot tokens live in a bounded channel; taking one admits a request.
#[derive(Debug)]
pub struct AdmissionLimiter {
    slots_tx: Sender<()>,
    slots_rx: Receiver<()>,
    capacity: usize,
    max_queue: usize,
    max_wait: Duration,
    policy: OverloadPolicy,
    waiting: AtomicUsize,
}

impl AdmissionLimiter {
    pub fn new(capacity: usize, max_queue: usize, max_wait: Duration, policy: OverloadPolicy) -> Self {
        let capacity = capacity.max(1);
        let (slots_tx, slots_rx) = bounded(capacity);
        for _ in 0..capacity {
            // Cannot fail: the channel has exactly `capacity` room.
            let _ = slots_tx.try_send(());
        }
        Self {
            slots_tx,
            slots_rx,
            capacity,
            max_queue,
            max_wait,
            policy,
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.slots_rx.len()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Take a slot, waiting in the queue if the policy allows it.
    pub fn admit(&self, cancel: &CancellationToken) -> Result<AdmissionPermit<'_>> {
        match self.slots_rx.try_recv() {
            Ok(()) => return Ok(AdmissionPermit { limiter: self }),
            Err(TryRecvError::Disconnected) => {
                return Err(ExecutionError::Busy("admission channel closed".to_string()))
            }
            Err(TryRecvError::Empty) => {}
        }

        if self.policy == OverloadPolicy::Reject {
            return Err(ExecutionError::Busy(format!(
                "all {} execution slots are in use",
                self.capacity
            )));
        }

        let reserved = self
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                (w < self.max_queue).then_some(w + 1)
            })
            .is_ok();
        if !reserved {
            return Err(ExecutionError::Busy(format!(
                "all {} execution slots are in use and {} requests are queued",
                self.capacity, self.max_queue
            )));
        }
        let _queued = QueueGuard(&self.waiting);

        let deadline = Instant::now() + self.max_wait;
        loop {
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ExecutionError::Busy(format!(
                    "no execution slot freed up within {}ms",
                    self.max_wait.as_millis()
                )));
            }
            match self.slots_rx.recv_timeout(remaining.min(WAIT_SLICE)) {
                Ok(()) => return Ok(AdmissionPermit { limiter: self }),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ExecutionError::Busy("admission channel closed".to_string()))
                }
            }
        }
    }
}

struct QueueGuard<'a>(&'a AtomicUsize);

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An execution slot. Returned to the pool on drop.
#[derive(Debug)]
pub struct AdmissionPermit<'a> {
    limiter: &'a AdmissionLimiter,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        let _ = self.limiter.slots_tx.try_send(());
    }
}
