//! FIFO-fair queue locks
//!
//! All three grant the lock in arrival order. They differ in what a waiter
//! spins on: a shared counter (ticket), a private slot in a fixed array
//! (Anderson), or its predecessor's node in an implicit list (CLH).

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use super::{Backoff, RawLock};

/// Ticket lock.
///
/// `lock` takes the next ticket from a dispenser and waits until the
/// now-serving counter reaches it, backing off in proportion to the number
/// of holders still ahead.
#[derive(Debug)]
pub struct TicketLock {
    now_serving: CachePadded<AtomicUsize>,
    next_ticket: CachePadded<AtomicUsize>,
    backoff: Backoff,
}

impl TicketLock {
    /// Spins per waiter ahead in the queue.
    const SPINS_PER_WAITER: u32 = 10;

    /// Create an unlocked ticket lock with linear backoff.
    pub fn new() -> Self {
        Self::with_backoff(Backoff::Linear { max_spins: 100_000 })
    }

    /// Create an unlocked ticket lock with a custom backoff.
    pub fn with_backoff(backoff: Backoff) -> Self {
        Self {
            now_serving: CachePadded::new(AtomicUsize::new(0)),
            next_ticket: CachePadded::new(AtomicUsize::new(0)),
            backoff,
        }
    }

    /// Number of threads holding or waiting for the lock.
    pub fn queue_len(&self) -> usize {
        let next = self.next_ticket.load(Ordering::Relaxed);
        next.wrapping_sub(self.now_serving.load(Ordering::Relaxed))
    }
}

impl Default for TicketLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for TicketLock {
    fn lock(&self) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        loop {
            let ahead = ticket.wrapping_sub(self.now_serving.load(Ordering::Acquire));
            if ahead == 0 {
                return;
            }
            let ahead = u32::try_from(ahead - 1).unwrap_or(u32::MAX);
            self.backoff.wait(ahead.saturating_mul(Self::SPINS_PER_WAITER));
        }
    }

    unsafe fn unlock(&self) {
        self.now_serving.fetch_add(1, Ordering::Release);
    }
}

/// Anderson's array-based queuing lock.
///
/// Each waiter spins on its own cache-padded slot, so a release touches
/// exactly one waiter's line. The slot count bounds the number of threads
/// that may hold or wait for the lock at the same time; exceeding it breaks
/// mutual exclusion. The count is rounded up to a power of two so the slot
/// dispenser can wrap.
#[derive(Debug)]
pub struct AndersonLock {
    next_slot: CachePadded<AtomicUsize>,
    holder: CachePadded<AtomicUsize>,
    must_wait: Box<[CachePadded<AtomicBool>]>,
}

impl AndersonLock {
    /// Create a lock for at most `slots` concurrent contenders.
    ///
    /// # Panics
    ///
    /// Panics if `slots` is zero.
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0, "AndersonLock needs at least one slot");
        let slots = slots.next_power_of_two();
        let must_wait = (0..slots)
            .map(|i| CachePadded::new(AtomicBool::new(i != 0)))
            .collect();
        Self {
            next_slot: CachePadded::new(AtomicUsize::new(0)),
            holder: CachePadded::new(AtomicUsize::new(0)),
            must_wait,
        }
    }

    /// Number of slots in the array.
    pub fn slots(&self) -> usize {
        self.must_wait.len()
    }
}

impl RawLock for AndersonLock {
    fn lock(&self) {
        let mask = self.must_wait.len() - 1;
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed) & mask;
        while self.must_wait[slot].load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        // Re-arm our slot for whoever draws it next time around.
        self.must_wait[slot].store(true, Ordering::Relaxed);
        self.holder.store(slot, Ordering::Relaxed);
    }

    unsafe fn unlock(&self) {
        let mask = self.must_wait.len() - 1;
        let slot = self.holder.load(Ordering::Relaxed);
        self.must_wait[(slot + 1) & mask].store(false, Ordering::Release);
    }
}

struct ClhNode {
    succ_must_wait: CachePadded<AtomicBool>,
}

impl ClhNode {
    fn boxed(must_wait: bool) -> Box<Self> {
        Box::new(Self {
            succ_must_wait: CachePadded::new(AtomicBool::new(must_wait)),
        })
    }
}

thread_local! {
    // Nodes inherited from predecessors, reused for the next acquisition.
    static CLH_SPARES: RefCell<Vec<Box<ClhNode>>> = const { RefCell::new(Vec::new()) };
}

fn take_spare_node() -> *mut ClhNode {
    let spare = CLH_SPARES
        .try_with(|spares| spares.borrow_mut().pop())
        .ok()
        .flatten();
    Box::into_raw(spare.unwrap_or_else(|| ClhNode::boxed(false)))
}

fn keep_spare_node(node: Box<ClhNode>) {
    // During thread teardown the pool may already be gone; the node is
    // simply freed then.
    let _ = CLH_SPARES.try_with(move |spares| spares.borrow_mut().push(node));
}

/// CLH queue lock.
///
/// Waiters form an implicit list by swapping their node into the tail and
/// spin on the predecessor's flag. On acquisition a thread adopts its
/// predecessor's node, so each thread owns a constant number of nodes
/// regardless of how many locks it has used.
pub struct ClhLock {
    tail: CachePadded<AtomicPtr<ClhNode>>,
    holder: AtomicPtr<ClhNode>,
    #[cfg(test)]
    arrivals: AtomicUsize,
}

// Nodes are only reached through the atomics above and are handed between
// threads with release/acquire on `succ_must_wait`.
unsafe impl Send for ClhLock {}
unsafe impl Sync for ClhLock {}

impl ClhLock {
    /// Create an unlocked CLH lock.
    pub fn new() -> Self {
        let sentinel = Box::into_raw(ClhNode::boxed(false));
        Self {
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
            holder: AtomicPtr::new(ptr::null_mut()),
            #[cfg(test)]
            arrivals: AtomicUsize::new(0),
        }
    }
}

impl Default for ClhLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClhLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClhLock").finish_non_exhaustive()
    }
}

impl RawLock for ClhLock {
    fn lock(&self) {
        let node = take_spare_node();
        // SAFETY: `node` came from Box::into_raw and nobody else sees it yet
        unsafe { (*node).succ_must_wait.store(true, Ordering::Relaxed) };

        let pred = self.tail.swap(node, Ordering::AcqRel);
        #[cfg(test)]
        self.arrivals.fetch_add(1, Ordering::SeqCst);
        // SAFETY: `pred` stays allocated until we adopt it below; only the
        // thread that swapped it out of the tail may free it
        while unsafe { (*pred).succ_must_wait.load(Ordering::Acquire) } {
            std::hint::spin_loop();
        }

        // The predecessor released and never touches its node again.
        // SAFETY: we are the unique successor of `pred`
        keep_spare_node(unsafe { Box::from_raw(pred) });
        self.holder.store(node, Ordering::Relaxed);
    }

    unsafe fn unlock(&self) {
        let node = self.holder.load(Ordering::Relaxed);
        debug_assert!(!node.is_null(), "ClhLock unlocked while not held");
        // From here on the node belongs to our successor.
        (*node).succ_must_wait.store(false, Ordering::Release);
    }
}

impl Drop for ClhLock {
    fn drop(&mut self) {
        // Every other node has been adopted by a successor; only the tail
        // is still owned by the lock.
        let tail = *self.tail.get_mut();
        // SAFETY: exclusive access, no waiters can exist
        drop(unsafe { Box::from_raw(tail) });
    }
}
