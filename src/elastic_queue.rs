use core::cell::UnsafeCell;
use core::cmp;
use core::fmt;
use core::mem::{self, MaybeUninit};
use core::panic::{RefUnwindSafe, UnwindSafe};
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicU8, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

// States of a slot:
// * A writer takes it `FREE -> COPYING -> VALID`.
// * A reader takes it `VALID -> COPYING -> FREE`.
// Each transition is performed by exactly one thread via compare-and-swap.
const FREE: u8 = 0;
const COPYING: u8 = 1;
const VALID: u8 = 2;

/// A slot in the queue.
struct Slot<T> {
    /// The state of the slot.
    state: AtomicU8,

    /// The value in this slot.
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    /// Creates a free slot with an uninitialized value.
    fn new() -> Self {
        Self {
            state: AtomicU8::new(FREE),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// A growable multi-producer multi-consumer queue.
///
/// This queue allocates a circular buffer on construction and hands out monotonically
/// increasing sequence numbers to producers and consumers. When a push fills the buffer, the
/// producer that filled it reallocates the buffer at double the required capacity while the
/// operations already in flight drain; pushes therefore never fail and never block on a
/// mutex. Popping from an empty queue returns `None` immediately instead of waiting.
///
/// # Examples
///
/// ```
/// use elastic_queue::ElasticQueue;
///
/// let q = ElasticQueue::new(2);
///
/// assert_eq!(q.push('a'), 0);
/// assert_eq!(q.push('b'), 1);
/// assert_eq!(q.push('c'), 2);
/// assert_eq!(q.pop(), Some('a'));
/// assert!(q.capacity() >= 4);
/// ```
pub struct ElasticQueue<T> {
    /// The number of admitted elements.
    ///
    /// Signed, and doubles as the capacity semaphore: admission keeps it within
    /// `0..=capacity`. Producers that cannot reserve room spin until a resize makes room;
    /// consumers that find it at zero report empty.
    size: CachePadded<AtomicIsize>,

    /// The total number of elements ever admitted.
    ///
    /// Strictly monotonic; the run reserved from this counter is the block of sequence
    /// numbers handed to the caller.
    enqueue_count: CachePadded<AtomicUsize>,

    /// The total number of elements ever removed. Strictly monotonic.
    dequeue_count: CachePadded<AtomicUsize>,

    /// The current length of the buffer. Grows, never shrinks.
    capacity: AtomicUsize,

    /// Rebasing constant mapping sequence numbers to physical slots:
    /// `index = (sequence + offset) % capacity`. Rewritten only by `grow`.
    offset: AtomicUsize,

    /// Producers past admission that may still be touching a slot.
    in_flight_enqueue: AtomicUsize,

    /// Consumers past admission that may still be touching a slot.
    in_flight_dequeue: AtomicUsize,

    /// Set while a resize is executing. Admission parks on it.
    resizing: AtomicBool,

    /// The buffer holding slots.
    ///
    /// Replaced wholesale by `grow`, and only once both in-flight counters have drained to
    /// zero; no thread reads the retired allocation after the swap.
    buffer: UnsafeCell<Box<[Slot<T>]>>,
}

unsafe impl<T: Send> Sync for ElasticQueue<T> {}
unsafe impl<T: Send> Send for ElasticQueue<T> {}

impl<T> UnwindSafe for ElasticQueue<T> {}
impl<T> RefUnwindSafe for ElasticQueue<T> {}

impl<T> ElasticQueue<T> {
    /// Creates a new queue with the given initial capacity.
    ///
    /// # Panics
    ///
    /// Panics if the capacity is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use elastic_queue::ElasticQueue;
    ///
    /// let q = ElasticQueue::<i32>::new(100);
    /// ```
    pub fn new(cap: usize) -> Self {
        assert!(cap > 0, "capacity must be non-zero");

        let buffer: Box<[Slot<T>]> = (0..cap).map(|_| Slot::new()).collect();

        Self {
            size: CachePadded::new(AtomicIsize::new(0)),
            enqueue_count: CachePadded::new(AtomicUsize::new(0)),
            dequeue_count: CachePadded::new(AtomicUsize::new(0)),
            capacity: AtomicUsize::new(cap),
            offset: AtomicUsize::new(0),
            in_flight_enqueue: AtomicUsize::new(0),
            in_flight_dequeue: AtomicUsize::new(0),
            resizing: AtomicBool::new(false),
            buffer: UnsafeCell::new(buffer),
        }
    }

    /// Pushes an element into the queue, returning its sequence number.
    ///
    /// This never fails: the push that fills the buffer grows it before returning.
    ///
    /// # Examples
    ///
    /// ```
    /// use elastic_queue::ElasticQueue;
    ///
    /// let q = ElasticQueue::new(1);
    ///
    /// assert_eq!(q.push(10), 0);
    /// assert_eq!(q.push(20), 1);
    /// assert_eq!(q.pop(), Some(10));
    /// ```
    pub fn push(&self, value: T) -> usize {
        let (_, new_size, elected) = self.admit_produce(1);

        let seq = self.enqueue_count.fetch_add(1, Ordering::SeqCst);
        self.write_slot(self.slot_index(seq), value);
        self.in_flight_enqueue.fetch_sub(1, Ordering::SeqCst);

        if elected {
            self.grow(new_size * 2);
            self.resizing.store(false, Ordering::Release);
        }

        seq
    }

    /// Pushes a batch of elements, returning the sequence number of the first one.
    ///
    /// The whole batch is always delivered. If it does not fit into the remaining capacity,
    /// the part that fits is written first and the tail goes directly into the grown buffer,
    /// so a batch observed through [`pop_batch`](ElasticQueue::pop_batch) straddles a resize
    /// transparently.
    ///
    /// An empty batch reserves nothing and returns the sequence number the next push would
    /// get.
    ///
    /// # Examples
    ///
    /// ```
    /// use elastic_queue::ElasticQueue;
    ///
    /// let q = ElasticQueue::new(2);
    ///
    /// assert_eq!(q.push_batch(vec![1, 2, 3]), 0);
    /// assert!(q.capacity() >= 3);
    /// assert_eq!(q.pop(), Some(1));
    /// ```
    pub fn push_batch(&self, values: Vec<T>) -> usize {
        if values.is_empty() {
            return self.enqueue_count.load(Ordering::SeqCst);
        }

        let mut iter = values.into_iter();
        let mut first_seq = None;
        loop {
            let (reserved, new_size, elected) = self.admit_produce(iter.len());
            let remainder = iter.len() - reserved;

            if elected {
                // Drain the other producers before claiming positions: nothing may be
                // written into slots that are about to relocate.
                self.in_flight_enqueue.fetch_sub(1, Ordering::SeqCst);
                let backoff = Backoff::new();
                while self.in_flight_enqueue.load(Ordering::SeqCst) != 0 {
                    backoff.snooze();
                }
            }

            let seq = self.enqueue_count.fetch_add(reserved, Ordering::SeqCst);
            let first = *first_seq.get_or_insert(seq);

            let cap = self.capacity.load(Ordering::Acquire);
            let offset = self.offset.load(Ordering::Acquire);
            let mut index = seq.wrapping_add(offset) % cap;
            for value in iter.by_ref().take(reserved) {
                self.write_slot(index, value);
                index = (index + 1) % cap;
            }

            if elected {
                self.grow((new_size + remainder) * 2);

                // The grown buffer has room for the whole tail; write it while admission
                // is still parked on the flag.
                for value in iter.by_ref() {
                    let seq = self.enqueue_count.fetch_add(1, Ordering::SeqCst);
                    self.write_slot(self.slot_index(seq), value);
                }
                self.size.fetch_add(remainder as isize, Ordering::SeqCst);
                self.resizing.store(false, Ordering::Release);
                return first;
            }

            self.in_flight_enqueue.fetch_sub(1, Ordering::SeqCst);
            if iter.len() == 0 {
                return first;
            }
            // The buffer filled while another thread's resize was in flight; re-admit the
            // tail once it clears.
        }
    }

    /// Attempts to pop an element from the queue.
    ///
    /// If the queue is empty, `None` is returned immediately.
    ///
    /// # Examples
    ///
    /// ```
    /// use elastic_queue::ElasticQueue;
    ///
    /// let q = ElasticQueue::new(4);
    /// assert!(q.pop().is_none());
    ///
    /// q.push(10);
    /// assert_eq!(q.pop(), Some(10));
    /// ```
    pub fn pop(&self) -> Option<T> {
        self.pop_indexed().map(|(_, value)| value)
    }

    /// Attempts to pop an element together with its sequence number.
    ///
    /// # Examples
    ///
    /// ```
    /// use elastic_queue::ElasticQueue;
    ///
    /// let q = ElasticQueue::new(4);
    ///
    /// q.push('x');
    /// q.push('y');
    /// assert_eq!(q.pop_indexed(), Some((0, 'x')));
    /// assert_eq!(q.pop_indexed(), Some((1, 'y')));
    /// ```
    pub fn pop_indexed(&self) -> Option<(usize, T)> {
        if self.admit_consume(1) == 0 {
            return None;
        }

        let seq = self.dequeue_count.fetch_add(1, Ordering::SeqCst);
        let value = self.read_slot(self.slot_index(seq));
        self.in_flight_dequeue.fetch_sub(1, Ordering::SeqCst);

        Some((seq, value))
    }

    /// Attempts to pop up to `max` elements, in sequence order.
    ///
    /// Returns the sequence number of the first element and the removed elements, or `None`
    /// if the queue is empty or `max` is zero. Fewer than `max` elements come back only
    /// because the queue did not contain that many.
    ///
    /// # Examples
    ///
    /// ```
    /// use elastic_queue::ElasticQueue;
    ///
    /// let q = ElasticQueue::new(4);
    ///
    /// q.push_batch(vec![1, 2, 3]);
    /// assert_eq!(q.pop_batch(2), Some((0, vec![1, 2])));
    /// assert_eq!(q.pop_batch(8), Some((2, vec![3])));
    /// assert_eq!(q.pop_batch(8), None);
    /// ```
    pub fn pop_batch(&self, max: usize) -> Option<(usize, Vec<T>)> {
        if max == 0 {
            return None;
        }
        let taken = self.admit_consume(max);
        if taken == 0 {
            return None;
        }

        let seq = self.dequeue_count.fetch_add(taken, Ordering::SeqCst);
        let cap = self.capacity.load(Ordering::Acquire);
        let offset = self.offset.load(Ordering::Acquire);
        let mut index = seq.wrapping_add(offset) % cap;
        let mut values = Vec::with_capacity(taken);
        for _ in 0..taken {
            values.push(self.read_slot(index));
            index = (index + 1) % cap;
        }
        self.in_flight_dequeue.fetch_sub(1, Ordering::SeqCst);

        Some((seq, values))
    }

    /// Returns the number of elements in the queue.
    ///
    /// The count is a stale-tolerant snapshot of the admission counter, not taken under any
    /// lock.
    ///
    /// # Examples
    ///
    /// ```
    /// use elastic_queue::ElasticQueue;
    ///
    /// let q = ElasticQueue::new(8);
    /// assert_eq!(q.len(), 0);
    ///
    /// q.push(10);
    /// q.push(20);
    /// assert_eq!(q.len(), 2);
    /// ```
    pub fn len(&self) -> usize {
        cmp::max(self.size.load(Ordering::SeqCst), 0) as usize
    }

    /// Returns `true` if the queue is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use elastic_queue::ElasticQueue;
    ///
    /// let q = ElasticQueue::new(8);
    ///
    /// assert!(q.is_empty());
    /// q.push(1);
    /// assert!(!q.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current capacity of the queue.
    ///
    /// # Examples
    ///
    /// ```
    /// use elastic_queue::ElasticQueue;
    ///
    /// let q = ElasticQueue::<i32>::new(100);
    ///
    /// assert_eq!(q.capacity(), 100);
    /// ```
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Reserves room for up to `want` new elements.
    ///
    /// Returns the reserved run length (at least 1; producers retry rather than fail), the
    /// post-reservation size, and whether this thread was elected to run the resize. The
    /// in-flight producer count stays incremented; the caller decrements it after touching
    /// its slots.
    fn admit_produce(&self, want: usize) -> (usize, usize, bool) {
        self.in_flight_enqueue.fetch_add(1, Ordering::SeqCst);

        let backoff = Backoff::new();
        loop {
            if self.resizing.load(Ordering::Acquire) {
                self.wait_for_resize(&self.in_flight_enqueue);
            }

            // The capacity is stable from here on: this thread is in flight, so no resize
            // can swap the buffer under it.
            let cap = self.capacity.load(Ordering::SeqCst);
            let mut size = self.size.load(Ordering::SeqCst);
            let reserved = loop {
                let new = cmp::min(size + want as isize, cap as isize);
                match self
                    .size
                    .compare_exchange(size, new, Ordering::SeqCst, Ordering::SeqCst)
                {
                    Ok(_) => break new - size,
                    Err(current) => size = current,
                }
            };

            if reserved > 0 {
                let new_size = (size + reserved) as usize;
                // Landing exactly on the capacity elects this thread as the resizer,
                // unless another growth event is already running.
                let elected = new_size == cap && !self.resizing.swap(true, Ordering::SeqCst);
                return (reserved as usize, new_size, elected);
            }

            backoff.snooze();
        }
    }

    /// Takes up to `want` elements out of the admission counter.
    ///
    /// Returns the taken run length; 0 means the queue was observed empty and the in-flight
    /// consumer count was already released. This is the only non-retrying failure path in
    /// the queue.
    fn admit_consume(&self, want: usize) -> usize {
        if self.size.load(Ordering::SeqCst) <= 0 {
            return 0;
        }

        self.in_flight_dequeue.fetch_add(1, Ordering::SeqCst);

        if self.resizing.load(Ordering::Acquire) {
            self.wait_for_resize(&self.in_flight_dequeue);
        }

        let mut size = self.size.load(Ordering::SeqCst);
        let taken = loop {
            let new = cmp::max(size - want as isize, 0);
            match self
                .size
                .compare_exchange(size, new, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break size - new,
                Err(current) => size = current,
            }
        };

        if taken == 0 {
            self.in_flight_dequeue.fetch_sub(1, Ordering::SeqCst);
        }
        taken as usize
    }

    /// Steps out of the in-flight count and waits for the running resize to finish, then
    /// steps back in. The resizer's drain loop must never wait on parked threads.
    fn wait_for_resize(&self, in_flight: &AtomicUsize) {
        in_flight.fetch_sub(1, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.resizing.load(Ordering::Acquire) {
            backoff.snooze();
        }
        in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Maps a sequence number to its physical slot.
    fn slot_index(&self, seq: usize) -> usize {
        let offset = self.offset.load(Ordering::Acquire);
        seq.wrapping_add(offset) % self.capacity.load(Ordering::Acquire)
    }

    /// Writes `value` into the slot at `index` once the slot hands itself over.
    fn write_slot(&self, index: usize, value: T) {
        // SAFETY: in-flight accounting (or the `resizing` flag, for the resizer itself)
        // keeps `grow` from swapping the buffer while this reference lives.
        let slot = unsafe { &(*self.buffer.get())[index] };

        // The slot may still be occupied by a slower operation from a previous lap of the
        // buffer; wait for it to move out.
        let backoff = Backoff::new();
        while slot
            .state
            .compare_exchange(FREE, COPYING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }

        // SAFETY: `COPYING` grants this thread exclusive access to the cell.
        unsafe { (*slot.value.get()).write(value) };
        slot.state.store(VALID, Ordering::Release);
    }

    /// Moves the value out of the slot at `index` once it becomes valid.
    fn read_slot(&self, index: usize) -> T {
        // SAFETY: as in `write_slot`.
        let slot = unsafe { &(*self.buffer.get())[index] };

        let backoff = Backoff::new();
        while slot
            .state
            .compare_exchange(VALID, COPYING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }

        // SAFETY: `VALID` guarantees the cell is initialized, and `COPYING` grants
        // exclusive access while the value moves out.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.state.store(FREE, Ordering::Release);
        value
    }

    /// Reallocates the buffer to `new_cap` slots and rebases the index mapping.
    ///
    /// Must only be called by the thread that won the `resizing` flag; the caller clears
    /// the flag afterwards.
    fn grow(&self, new_cap: usize) {
        debug_assert!(self.resizing.load(Ordering::Relaxed));

        // Quiescence barrier: no operation may hold a slot while the buffer moves. New
        // arrivals park on the `resizing` flag, so the counters can only drain.
        let backoff = Backoff::new();
        while self.in_flight_enqueue.load(Ordering::SeqCst) != 0
            || self.in_flight_dequeue.load(Ordering::SeqCst) != 0
        {
            backoff.snooze();
        }

        let old_cap = self.capacity.load(Ordering::Relaxed);
        debug_assert!(new_cap > old_cap);

        let dequeues = self.dequeue_count.load(Ordering::Relaxed);
        let offset = self.offset.load(Ordering::Relaxed);
        let len = cmp::max(self.size.load(Ordering::Relaxed), 0) as usize;

        let mut new_buffer: Box<[Slot<T>]> = (0..new_cap).map(|_| Slot::new()).collect();

        // Move the live values, head first, into the bottom of the new buffer.
        {
            // SAFETY: the barrier above guarantees exclusive access until the flag clears.
            let old_buffer = unsafe { &*self.buffer.get() };
            let mut head = dequeues.wrapping_add(offset) % old_cap;
            for slot in new_buffer.iter_mut().take(len) {
                let src = &old_buffer[head];
                debug_assert_eq!(src.state.load(Ordering::Relaxed), VALID);
                // SAFETY: at quiescence every live slot is `VALID`, i.e. initialized and
                // not mid-copy. The value moves, so retiring the old allocation drops no
                // element.
                let value = unsafe { (*src.value.get()).assume_init_read() };
                slot.value.get_mut().write(value);
                *slot.state.get_mut() = VALID;
                head = (head + 1) % old_cap;
            }
            debug_assert_eq!(
                head,
                self.enqueue_count
                    .load(Ordering::Relaxed)
                    .wrapping_add(offset)
                    % old_cap
            );
        }

        // SAFETY: still quiescent, and the old boxed slice no longer holds initialized
        // values, so dropping it only frees the cells.
        unsafe { *self.buffer.get() = new_buffer };

        // Rebase so the head maps to index 0 under the new capacity.
        self.offset
            .store(new_cap - dequeues % new_cap, Ordering::SeqCst);
        self.capacity.store(new_cap, Ordering::SeqCst);
    }
}

impl<T> Drop for ElasticQueue<T> {
    fn drop(&mut self) {
        if mem::needs_drop::<T>() {
            let len = cmp::max(*self.size.get_mut(), 0) as usize;
            let cap = *self.capacity.get_mut();
            let offset = *self.offset.get_mut();
            let mut index = self.dequeue_count.get_mut().wrapping_add(offset) % cap;

            // Drop the admitted elements; every other slot is uninitialized.
            for _ in 0..len {
                let slot = &mut self.buffer.get_mut()[index];
                debug_assert_eq!(*slot.state.get_mut(), VALID);
                // SAFETY: exclusive access, and the walk covers exactly the live slots.
                unsafe { slot.value.get_mut().assume_init_drop() };
                index = (index + 1) % cap;
            }
        }
    }
}

impl<T> fmt::Debug for ElasticQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("ElasticQueue { .. }")
    }
}

impl<T> IntoIterator for ElasticQueue<T> {
    type Item = T;

    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter { value: self }
    }
}

/// A draining iterator over the elements of the queue, in sequence order.
#[derive(Debug)]
pub struct IntoIter<T> {
    value: ElasticQueue<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        let value = &mut self.value;
        if *value.size.get_mut() <= 0 {
            return None;
        }
        *value.size.get_mut() -= 1;

        let seq = *value.dequeue_count.get_mut();
        *value.dequeue_count.get_mut() += 1;

        let cap = *value.capacity.get_mut();
        let index = seq.wrapping_add(*value.offset.get_mut()) % cap;
        let slot = &mut value.buffer.get_mut()[index];
        debug_assert_eq!(*slot.state.get_mut(), VALID);
        *slot.state.get_mut() = FREE;
        // SAFETY: exclusive access, the slot was `VALID`, and the counters above were
        // updated so `Drop` will not touch it again.
        Some(unsafe { slot.value.get_mut().assume_init_read() })
    }
}
