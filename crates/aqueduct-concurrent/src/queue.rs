use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Bounded single-producer single-consumer queue for agent commands. Failed
/// offers hand the item back so the proxy can retry next duty cycle.
#[repr(C)]
pub struct OneToOneQueue<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    _pad0: [u8; 40],
    head: AtomicUsize,
    _pad1: [u8; 56],
    tail: AtomicUsize,
    _pad2: [u8; 56],
}

unsafe impl<T: Send> Send for OneToOneQueue<T> {}
unsafe impl<T: Send> Sync for OneToOneQueue<T> {}

impl<T> OneToOneQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two();
        let buffer =
            (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect::<Box<[_]>>();
        Self {
            buffer,
            mask: capacity - 1,
            _pad0: [0; 40],
            head: AtomicUsize::new(0),
            _pad1: [0; 56],
            tail: AtomicUsize::new(0),
            _pad2: [0; 56],
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn offer(&self, item: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail - head > self.mask {
            return Err(item);
        }
        unsafe { (*self.buffer[tail & self.mask].get()).write(item) };
        self.tail.store(tail + 1, Ordering::Release);
        Ok(())
    }

    pub fn poll(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let item = unsafe { (*self.buffer[head & self.mask].get()).assume_init_read() };
        self.head.store(head + 1, Ordering::Release);
        Some(item)
    }

    pub fn drain<F>(&self, limit: usize, mut f: F) -> usize
    where
        F: FnMut(T),
    {
        let mut count = 0;
        while count < limit {
            let Some(item) = self.poll() else { break };
            f(item);
            count += 1;
        }
        count
    }
}

impl<T> Drop for OneToOneQueue<T> {
    fn drop(&mut self) {
        while self.poll().is_some() {}
    }
}

/// Bounded multi-producer single-consumer queue (per-slot sequence numbers).
/// Sender and Receiver agents feed the conductor through one of these.
#[repr(C)]
pub struct ManyToOneQueue<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    _pad0: [u8; 40],
    head: AtomicUsize,
    _pad1: [u8; 56],
    tail: AtomicUsize,
    _pad2: [u8; 56],
}

#[repr(C, align(64))]
struct Slot<T> {
    sequence: AtomicUsize,
    item: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send> Send for ManyToOneQueue<T> {}
unsafe impl<T: Send> Sync for ManyToOneQueue<T> {}

impl<T> ManyToOneQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two();
        let buffer = (0..capacity)
            .map(|i| Slot { sequence: AtomicUsize::new(i), item: UnsafeCell::new(MaybeUninit::uninit()) })
            .collect::<Box<[_]>>();
        Self {
            buffer,
            mask: capacity - 1,
            _pad0: [0; 40],
            head: AtomicUsize::new(0),
            _pad1: [0; 56],
            tail: AtomicUsize::new(0),
            _pad2: [0; 56],
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn offer(&self, item: T) -> Result<(), T> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[tail & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);

            if seq == tail {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail + 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.item.get()).write(item) };
                        slot.sequence.store(tail + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(t) => tail = t,
                }
            } else if seq < tail {
                return Err(item);
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    pub fn poll(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.buffer[head & self.mask];
        if slot.sequence.load(Ordering::Acquire) != head + 1 {
            return None;
        }
        let item = unsafe { (*slot.item.get()).assume_init_read() };
        slot.sequence.store(head + self.mask + 1, Ordering::Release);
        self.head.store(head + 1, Ordering::Release);
        Some(item)
    }

    pub fn drain<F>(&self, limit: usize, mut f: F) -> usize
    where
        F: FnMut(T),
    {
        let mut count = 0;
        while count < limit {
            let Some(item) = self.poll() else { break };
            f(item);
            count += 1;
        }
        count
    }
}

impl<T> Drop for ManyToOneQueue<T> {
    fn drop(&mut self) {
        while self.poll().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn spsc_basic() {
        let q = OneToOneQueue::with_capacity(4);
        assert!(q.offer(1).is_ok());
        assert!(q.offer(2).is_ok());
        assert_eq!(q.poll(), Some(1));
        assert_eq!(q.poll(), Some(2));
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn spsc_full_returns_item() {
        let q = OneToOneQueue::with_capacity(2);
        assert!(q.offer("a").is_ok());
        assert!(q.offer("b").is_ok());
        assert_eq!(q.offer("c"), Err("c"));
        assert_eq!(q.poll(), Some("a"));
        assert!(q.offer("c").is_ok());
    }

    #[test]
    fn spsc_carries_heap_types() {
        let q = OneToOneQueue::with_capacity(4);
        let item = Arc::new(42);
        q.offer(item.clone()).unwrap();
        assert_eq!(Arc::strong_count(&item), 2);
        drop(q.poll());
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn spsc_drop_releases_pending() {
        let item = Arc::new(1);
        {
            let q = OneToOneQueue::with_capacity(4);
            q.offer(item.clone()).unwrap();
            assert_eq!(Arc::strong_count(&item), 2);
        }
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn mpsc_basic() {
        let q = ManyToOneQueue::with_capacity(8);
        for i in 0..8 {
            q.offer(i).unwrap();
        }
        assert_eq!(q.offer(99), Err(99));
        for i in 0..8 {
            assert_eq!(q.poll(), Some(i));
        }
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn mpsc_concurrent_producers() {
        let q = Arc::new(ManyToOneQueue::with_capacity(1024));
        let per_thread = 10_000u64;

        std::thread::scope(|s| {
            for p in 0..4u64 {
                let q = q.clone();
                s.spawn(move || {
                    for i in 0..per_thread {
                        let mut v = p * per_thread + i;
                        loop {
                            match q.offer(v) {
                                Ok(()) => break,
                                Err(back) => {
                                    v = back;
                                    std::hint::spin_loop();
                                }
                            }
                        }
                    }
                });
            }

            let q = q.clone();
            s.spawn(move || {
                let mut sum = 0u64;
                let mut got = 0u64;
                while got < 4 * per_thread {
                    got += q.drain(128, |v| sum += v) as u64;
                }
                assert_eq!(sum, (0..4 * per_thread).sum::<u64>());
            });
        });
    }
}
