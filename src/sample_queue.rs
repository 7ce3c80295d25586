use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// A chunk of interleaved samples tagged with the global ordinal of its first sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuf {
    pub first_sample: u64,
    pub samples: Vec<i16>,
}

/// Span evicted from a saturated queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dropped {
    pub first_sample: u64,
    pub n_samples: usize,
}

struct Inner {
    bufs: VecDeque<SampleBuf>,
    // data buffers in `bufs`; sentinels are not counted
    n_data: usize,
    dropped: u64,
}

/// Bounded FIFO of sample buffers shared by one producer and one consumer.
///
/// When full, `enqueue` waits at most `max_block` for the consumer and then
/// evicts the oldest buffer. A zero-length buffer is a wake-up sentinel: it
/// unblocks a waiting consumer, is never handed out as data and does not
/// count toward the capacity.
pub struct SampleQueue {
    name: String,
    capacity: usize,
    max_block: Duration,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl SampleQueue {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            capacity: capacity.max(1),
            max_block: Duration::ZERO,
            inner: Mutex::new(Inner {
                bufs: VecDeque::with_capacity(capacity),
                n_data: 0,
                dropped: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Let producers wait up to `max_block` for room before evicting.
    pub fn with_max_block(mut self, max_block: Duration) -> Self {
        self.max_block = max_block;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Data buffers waiting, sentinels excluded.
    pub fn len(&self) -> usize {
        self.inner.lock().n_data
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fill_fraction(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// Buffers evicted so far.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Appends a buffer. Returns the evicted span if the queue was saturated.
    pub fn enqueue(&self, samples: Vec<i16>, first_sample: u64) -> Option<Dropped> {
        if samples.is_empty() {
            self.wake();
            return None;
        }
        let mut inner = self.inner.lock();
        if inner.n_data >= self.capacity && !self.max_block.is_zero() {
            let deadline = Instant::now() + self.max_block;
            while inner.n_data >= self.capacity {
                if self.cond.wait_until(&mut inner, deadline).timed_out() {
                    break;
                }
            }
        }
        let mut dropped = None;
        if inner.n_data >= self.capacity {
            // oldest data buffer; queued sentinels stay in place
            let oldest = inner.bufs.iter().position(|b| !b.samples.is_empty());
            if let Some(old) = oldest.and_then(|i| inner.bufs.remove(i)) {
                inner.n_data -= 1;
                inner.dropped += 1;
                dropped = Some(Dropped {
                    first_sample: old.first_sample,
                    n_samples: old.samples.len(),
                });
            }
        }
        inner.bufs.push_back(SampleBuf {
            first_sample,
            samples,
        });
        inner.n_data += 1;
        self.cond.notify_all();
        dropped
    }

    /// Pushes the zero-length sentinel, bypassing the capacity limit.
    pub fn wake(&self) {
        let mut inner = self.inner.lock();
        inner.bufs.push_back(SampleBuf {
            first_sample: 0,
            samples: Vec::new(),
        });
        self.cond.notify_all();
    }

    /// Blocks until a buffer arrives. `None` means the queue was woken by a sentinel.
    pub fn dequeue(&self) -> Option<SampleBuf> {
        let mut inner = self.inner.lock();
        while inner.bufs.is_empty() {
            self.cond.wait(&mut inner);
        }
        self.pop(&mut inner)
    }

    /// Like [`dequeue`](Self::dequeue) but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<SampleBuf> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.bufs.is_empty() {
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return None;
            }
        }
        self.pop(&mut inner)
    }

    /// Non-blocking dequeue; sentinels are discarded.
    pub fn try_dequeue(&self) -> Option<SampleBuf> {
        let mut inner = self.inner.lock();
        while let Some(buf) = inner.bufs.pop_front() {
            if !buf.samples.is_empty() {
                inner.n_data -= 1;
                self.cond.notify_all();
                return Some(buf);
            }
        }
        None
    }

    fn pop(&self, inner: &mut Inner) -> Option<SampleBuf> {
        let buf = inner.bufs.pop_front()?;
        self.cond.notify_all();
        if buf.samples.is_empty() {
            None
        } else {
            inner.n_data -= 1;
            Some(buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn fifo_order() {
        let q = SampleQueue::new("test", 8);
        for i in 0..5u64 {
            assert!(q.enqueue(vec![i as i16; 4], i * 4).is_none());
        }
        assert_eq!(q.len(), 5);
        for i in 0..5u64 {
            let buf = q.dequeue().unwrap();
            assert_eq!(buf.first_sample, i * 4);
            assert_eq!(buf.samples, vec![i as i16; 4]);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn overflow_drops_oldest_first() {
        let capacity = 4;
        let n = 11u64;
        let q = SampleQueue::new("test", capacity);
        let mut drops = Vec::new();
        for i in 0..n {
            if let Some(d) = q.enqueue(vec![0; 2], i * 2) {
                drops.push(d);
            }
        }
        assert_eq!(drops.len() as u64, n - capacity as u64);
        assert_eq!(q.dropped(), n - capacity as u64);
        for (i, d) in drops.iter().enumerate() {
            assert_eq!(d.first_sample, i as u64 * 2);
            assert_eq!(d.n_samples, 2);
        }
        let remaining: Vec<u64> = std::iter::from_fn(|| q.try_dequeue())
            .map(|b| b.first_sample)
            .collect();
        assert_eq!(remaining, vec![14, 16, 18, 20]);
    }

    #[test]
    fn sentinel_wakes_blocked_consumer() {
        let q = Arc::new(SampleQueue::new("test", 4));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.dequeue())
        };
        thread::sleep(Duration::from_millis(50));
        q.enqueue(Vec::new(), 123);
        let got = consumer.join().unwrap();
        assert!(got.is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn try_dequeue_skips_sentinels() {
        let q = SampleQueue::new("test", 4);
        q.wake();
        q.enqueue(vec![1, 2], 0);
        q.wake();
        assert_eq!(q.try_dequeue().unwrap().samples, vec![1, 2]);
        assert!(q.try_dequeue().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn sentinel_does_not_evict_data() {
        let q = SampleQueue::new("test", 2);
        q.enqueue(vec![1], 0);
        q.enqueue(vec![2], 1);
        q.wake();
        assert_eq!(q.dropped(), 0);
        assert_eq!(q.try_dequeue().unwrap().first_sample, 0);
        assert_eq!(q.try_dequeue().unwrap().first_sample, 1);
    }

    #[test]
    fn queued_sentinel_does_not_exceed_capacity() {
        let q = SampleQueue::new("test", 2);
        q.enqueue(vec![1], 0);
        q.enqueue(vec![2], 1);
        q.wake();
        let d = q.enqueue(vec![3], 2).unwrap();
        assert_eq!(d.first_sample, 0);
        assert_eq!(q.len(), q.capacity());
        let d = q.enqueue(vec![4], 3).unwrap();
        assert_eq!(d.first_sample, 1);
        assert_eq!(q.len(), q.capacity());
        assert_eq!(q.dropped(), 2);
        // the pending wake-up survives both evictions
        assert_eq!(q.dequeue(), None);
        assert_eq!(q.dequeue().unwrap().first_sample, 2);
        assert_eq!(q.dequeue().unwrap().first_sample, 3);
        assert!(q.is_empty());
    }

    #[test]
    fn producer_waits_for_room_before_evicting() {
        let q = Arc::new(SampleQueue::new("test", 1).with_max_block(Duration::from_secs(5)));
        q.enqueue(vec![1], 0);
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                q.dequeue()
            })
        };
        assert!(q.enqueue(vec![2], 1).is_none());
        assert_eq!(consumer.join().unwrap().unwrap().first_sample, 0);
        assert_eq!(q.dequeue().unwrap().first_sample, 1);
        assert_eq!(q.dropped(), 0);
    }

    #[test]
    fn dequeue_timeout_expires() {
        let q = SampleQueue::new("test", 1);
        assert!(q.dequeue_timeout(Duration::from_millis(10)).is_none());
    }
}
