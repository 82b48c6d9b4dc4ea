//! # Shared Concurrency Primitives
//!
//! The bounded hand-off queue used between every pipeline stage, the
//! round-robin cursor used by the end-point pools and the dispatcher, and
//! the fixed-size thread pool used by the finalizer.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Bounded FIFO hand-off queue.
///
/// Producers block while the queue is full, consumers block while it is
/// empty. A single condition variable suffices because producers and
/// consumers never wait at the same time. Wake policy: a push that takes
/// the queue from empty wakes one consumer, a push to size two wakes all
/// of them (guards against slow producers leaving consumers parked); the
/// pop side mirrors this at one and two slots from the capacity limit.
pub struct WaitQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    signal: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    ended: bool,
}

impl<T> WaitQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                ended: false,
            }),
            signal: Condvar::new(),
        }
    }

    /// Push a value, blocking while the queue is full. After `end_wait` the
    /// queue accepts nothing; the value is handed back to the caller.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut state = self.state.lock();
        loop {
            if state.ended {
                return Err(value);
            }
            if state.items.len() < self.capacity {
                let before = state.items.len();
                state.items.push_back(value);
                if before == 0 {
                    self.signal.notify_one();
                } else if before == 1 {
                    self.signal.notify_all();
                }
                return Ok(());
            }
            self.signal.wait(&mut state);
        }
    }

    /// Pop a value, blocking while the queue is empty. Returns `None` only
    /// after `end_wait` with the queue drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(value) = self.take(&mut state) {
                return Some(value);
            }
            if state.ended {
                return None;
            }
            self.signal.wait(&mut state);
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        self.take(&mut state)
    }

    /// Pop with a bounded wait. Returns `None` on timeout or terminal empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut state = self.state.lock();
        if let Some(value) = self.take(&mut state) {
            return Some(value);
        }
        if state.ended {
            return None;
        }
        let _ = self.signal.wait_for(&mut state, timeout);
        self.take(&mut state)
    }

    /// Stop waiting: wakes everyone, empty pops return `None`, later pushes
    /// are rejected. Idempotent.
    pub fn end_wait(&self) {
        let mut state = self.state.lock();
        state.ended = true;
        self.signal.notify_all();
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    // Producer wake-up thresholds are computed against the pre-pop size, so
    // a full queue wakes one producer and one-from-full wakes them all.
    fn take(&self, state: &mut QueueState<T>) -> Option<T> {
        if state.items.is_empty() {
            return None;
        }
        let to_limit = self.capacity - state.items.len();
        if to_limit == 0 {
            self.signal.notify_one();
        } else if to_limit == 1 {
            self.signal.notify_all();
        }
        state.items.pop_front()
    }
}

/// Thread-safe cursor that cycles through a small set of values.
pub struct RoundRobin<T> {
    state: Mutex<RingState<T>>,
}

struct RingState<T> {
    items: Vec<T>,
    position: usize,
}

impl<T: Clone + PartialEq> RoundRobin<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            state: Mutex::new(RingState { items, position: 0 }),
        }
    }

    /// The next value in rotation, or `None` once the ring is empty.
    pub fn next(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.items.is_empty() {
            return None;
        }
        if state.position >= state.items.len() {
            state.position = 0;
        }
        let value = state.items[state.position].clone();
        state.position = (state.position + 1) % state.items.len();
        Some(value)
    }

    /// Remove all instances of a value; the cursor is re-clamped so the
    /// rotation continues over the survivors.
    pub fn remove(&self, value: &T) {
        let mut state = self.state.lock();
        state.items.retain(|item| item != value);
        if state.position >= state.items.len() {
            state.position = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool running queued closures serially per worker.
///
/// `end_wait_initiate` drains the queue then stops the workers;
/// `terminate_initiate` stops them as soon as each finishes its current
/// job, abandoning queued work.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct PoolShared {
    work: Mutex<VecDeque<Job>>,
    signal: Condvar,
    end_wait: AtomicBool,
    terminate: AtomicBool,
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        let shared = Arc::new(PoolShared {
            work: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
            end_wait: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
        });
        let workers = (0..size.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || Self::work_loop(&shared))
            })
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    fn work_loop(shared: &PoolShared) {
        loop {
            let job = {
                let mut queue = shared.work.lock();
                loop {
                    if shared.terminate.load(Ordering::Acquire) {
                        return;
                    }
                    if let Some(job) = queue.pop_front() {
                        break job;
                    }
                    if shared.end_wait.load(Ordering::Acquire) {
                        return;
                    }
                    shared.signal.wait(&mut queue);
                }
            };
            job();
        }
    }

    pub fn queue(&self, job: impl FnOnce() + Send + 'static) {
        let mut queue = self.shared.work.lock();
        queue.push_back(Box::new(job));
        self.shared.signal.notify_one();
    }

    pub fn end_wait_initiate(&self) {
        self.shared.end_wait.store(true, Ordering::Release);
        self.signal_all();
    }

    pub fn terminate_initiate(&self) {
        self.shared.terminate.store(true, Ordering::Release);
        self.shared.end_wait.store(true, Ordering::Release);
        self.signal_all();
    }

    fn signal_all(&self) {
        let _queue = self.shared.work.lock();
        self.shared.signal.notify_all();
    }

    pub fn join_all(&self) {
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn queued(&self) -> usize {
        self.shared.work.lock().len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if !self.workers.lock().is_empty() {
            self.terminate_initiate();
            self.join_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_wait_queue_fifo() {
        let queue = WaitQueue::new(4);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn test_wait_queue_bounded_producer_blocks() {
        let queue = Arc::new(WaitQueue::new(4));
        let pushed = Arc::new(AtomicUsize::new(0));

        let producer = {
            let queue = Arc::clone(&queue);
            let pushed = Arc::clone(&pushed);
            std::thread::spawn(move || {
                for i in 0..10 {
                    queue.push(i).unwrap();
                    pushed.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        // Producer fills the queue and stalls at exactly the capacity.
        let deadline = Instant::now() + Duration::from_secs(2);
        while pushed.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pushed.load(Ordering::SeqCst), 4);
        assert_eq!(queue.len(), 4);

        // One pop unblocks the producer.
        assert!(queue.pop().is_some());
        let deadline = Instant::now() + Duration::from_secs(2);
        while pushed.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(pushed.load(Ordering::SeqCst) >= 5);

        // Drain the remaining nine items so the producer can finish.
        for _ in 0..9 {
            assert!(queue.pop().is_some());
        }
        producer.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wait_queue_end_wait_unblocks_consumer() {
        let queue: Arc<WaitQueue<u32>> = Arc::new(WaitQueue::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.end_wait();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_wait_queue_rejects_push_after_end_wait() {
        let queue = WaitQueue::new(2);
        queue.push(1).unwrap();
        queue.end_wait();
        assert_eq!(queue.push(2), Err(2));
        // Already queued work still drains.
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_wait_queue_pop_timeout() {
        let queue: WaitQueue<u32> = WaitQueue::new(2);
        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_round_robin_fairness() {
        let ring = RoundRobin::new(vec![1, 2, 3]);
        let mut counts = [0usize; 3];
        for _ in 0..10 {
            let v = ring.next().unwrap();
            counts[v as usize - 1] += 1;
        }
        // 10 calls over 3 entries: each appears 3 or 4 times.
        for count in counts {
            assert!(count == 3 || count == 4, "uneven rotation: {counts:?}");
        }
    }

    #[test]
    fn test_round_robin_remove() {
        let ring = RoundRobin::new(vec![1, 2, 3]);
        ring.remove(&2);
        for _ in 0..10 {
            assert_ne!(ring.next(), Some(2));
        }
        ring.remove(&1);
        ring.remove(&3);
        assert_eq!(ring.next(), None);
    }

    #[test]
    fn test_thread_pool_runs_queued_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(4);
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.queue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.end_wait_initiate();
        pool.join_all();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_thread_pool_terminate_abandons_work() {
        let pool = ThreadPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            pool.queue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
            });
        }
        for _ in 0..100 {
            pool.queue(|| std::thread::sleep(Duration::from_millis(10)));
        }
        std::thread::sleep(Duration::from_millis(10));
        pool.terminate_initiate();
        pool.join_all();
        assert!(counter.load(Ordering::SeqCst) <= 2);
    }
}
