//! Lock-free intrusive FIFO list
//!
//! [`FifoList`] is a multi-producer, multi-consumer queue built from two
//! atomic pointers. It never allocates: callers own the [`FifoNode`]s and
//! lend them to the list for its lifetime `'a`, so a node can neither move
//! nor be freed while the list may still reach it.
//!
//! Producers swap themselves into `head` and then publish a link from the
//! previous head to the new node. Consumers detach from `tail` by following
//! those links. The window between the swap and the publish is the only
//! place a consumer waits.
//!
//! The list is not ABA-safe: a node that is consumed and re-inserted while
//! another consumer is between loading `tail` and its CAS can corrupt the
//! list. Callers that recycle nodes across consumers need to quiesce first.

#![allow(unsafe_code)] // nodes are reached through raw pointers

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

static NEXT_LIST_ID: AtomicUsize = AtomicUsize::new(1);

/// A value that can be linked into a [`FifoList`].
pub struct FifoNode<T> {
    prev: AtomicPtr<FifoNode<T>>,
    list: AtomicUsize,
    value: T,
}

impl<T> FifoNode<T> {
    /// Wrap `value` in an unlinked node.
    pub const fn new(value: T) -> Self {
        Self {
            prev: AtomicPtr::new(ptr::null_mut()),
            list: AtomicUsize::new(0),
            value,
        }
    }

    /// The carried value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Unwrap the value.
    pub fn into_inner(self) -> T {
        self.value
    }

    /// With `Some(list)`, whether the node is linked into that list; with
    /// `None`, whether it is linked into any list.
    pub fn is_on_list(&self, list: Option<&FifoList<'_, T>>) -> bool {
        let current = self.list.load(Ordering::Acquire);
        match list {
            Some(list) => current == list.id,
            None => current != 0,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for FifoNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoNode")
            .field("value", &self.value)
            .field("linked", &self.is_on_list(None))
            .finish()
    }
}

/// Lock-free FIFO over borrowed nodes.
pub struct FifoList<'a, T> {
    id: usize,
    head: CachePadded<AtomicPtr<FifoNode<T>>>,
    tail: CachePadded<AtomicPtr<FifoNode<T>>>,
    _nodes: PhantomData<&'a FifoNode<T>>,
}

impl<'a, T> FifoList<'a, T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            id: NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed),
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            tail: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            _nodes: PhantomData,
        }
    }

    /// Append `node` at the head end.
    ///
    /// # Panics
    ///
    /// Panics if the node is already linked into a list, this one included.
    pub fn insert(&self, node: &'a FifoNode<T>) {
        if node
            .list
            .compare_exchange(0, self.id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("FifoNode inserted while already on a list");
        }
        debug_assert!(node.prev.load(Ordering::Relaxed).is_null());

        let node_ptr = node as *const FifoNode<T> as *mut FifoNode<T>;
        let prev_head = self.head.swap(node_ptr, Ordering::AcqRel);
        if prev_head.is_null() {
            self.tail.store(node_ptr, Ordering::Release);
        } else {
            // SAFETY: prev_head was linked by a borrow that outlives the
            // list, and it cannot be consumed until this link is published
            unsafe { (*prev_head).prev.store(node_ptr, Ordering::Release) };
        }
    }

    /// Detach and return the oldest node, or `None` if the list is empty.
    pub fn consume(&self) -> Option<&'a FifoNode<T>> {
        let (node, prev) = loop {
            let node = self.tail.load(Ordering::Acquire);
            if node.is_null() {
                return None;
            }
            // SAFETY: every pointer stored in the list came from a `&'a` borrow
            let prev = unsafe { (*node).prev.load(Ordering::Acquire) };
            if self
                .tail
                .compare_exchange(node, prev, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break (node, prev);
            }
        };
        // SAFETY: as above, and the successful CAS makes us its only consumer
        let node: &'a FifoNode<T> = unsafe { &*node };
        assert_eq!(
            node.list.load(Ordering::Acquire),
            self.id,
            "FifoNode consumed from a list it was not inserted into"
        );

        if prev.is_null() {
            // We took the last published node. If it is still the head the
            // list is now empty; otherwise an inserter has swapped past it
            // and will publish the link any moment.
            let node_ptr = node as *const FifoNode<T> as *mut FifoNode<T>;
            if self
                .head
                .compare_exchange(node_ptr, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                let next = loop {
                    let next = node.prev.load(Ordering::Acquire);
                    if !next.is_null() {
                        break next;
                    }
                    std::hint::spin_loop();
                };
                self.tail.store(next, Ordering::Release);
            }
        }

        node.prev.store(ptr::null_mut(), Ordering::Relaxed);
        node.list.store(0, Ordering::Release);
        Some(node)
    }

    /// Whether there is nothing to consume.
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for FifoList<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for FifoList<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoList")
            .field("id", &self.id)
            .field("empty", &self.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64};

    #[test]
    fn test_new_list_is_empty() {
        let list: FifoList<'_, u32> = FifoList::new();
        assert!(list.is_empty());
        assert!(list.consume().is_none());
    }

    #[test]
    fn test_single_node() {
        let node = FifoNode::new(7);
        let list = FifoList::new();
        assert!(!node.is_on_list(None));

        list.insert(&node);
        assert!(!list.is_empty());
        assert!(node.is_on_list(Some(&list)));
        assert!(node.is_on_list(None));

        let got = list.consume().unwrap();
        assert_eq!(*got.get(), 7);
        assert!(!node.is_on_list(None));
        assert!(list.is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let (a, b, c) = (FifoNode::new('a'), FifoNode::new('b'), FifoNode::new('c'));
        let list = FifoList::new();
        list.insert(&a);
        list.insert(&b);
        list.insert(&c);

        assert_eq!(*list.consume().unwrap().get(), 'a');
        assert_eq!(*list.consume().unwrap().get(), 'b');
        assert_eq!(*list.consume().unwrap().get(), 'c');
        assert!(list.consume().is_none());
    }

    #[test]
    fn test_node_reusable_after_consume() {
        let node = FifoNode::new(1);
        let first = FifoList::new();
        let second = FifoList::new();

        first.insert(&node);
        first.consume().unwrap();
        second.insert(&node);
        assert!(node.is_on_list(Some(&second)));
        assert!(!node.is_on_list(Some(&first)));
        assert_eq!(*second.consume().unwrap().get(), 1);
    }

    #[test]
    #[should_panic(expected = "already on a list")]
    fn test_double_insert_panics() {
        let node = FifoNode::new(());
        let list = FifoList::new();
        list.insert(&node);
        list.insert(&node);
    }

    #[test]
    #[should_panic(expected = "already on a list")]
    fn test_insert_into_second_list_panics() {
        let node = FifoNode::new(());
        let first = FifoList::new();
        let second = FifoList::new();
        first.insert(&node);
        second.insert(&node);
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        const PRODUCERS: u64 = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 10_000;

        let nodes: Vec<Vec<FifoNode<u64>>> = (0..PRODUCERS)
            .map(|p| {
                (0..PER_PRODUCER)
                    .map(|k| FifoNode::new(p * PER_PRODUCER + k + 1))
                    .collect()
            })
            .collect();
        let list = FifoList::new();
        let done = AtomicBool::new(false);
        let consumed_sum = AtomicU64::new(0);
        let consumed_count = AtomicU64::new(0);

        crossbeam::thread::scope(|s| {
            let consumers: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    s.spawn(|_| loop {
                        match list.consume() {
                            Some(node) => {
                                consumed_sum.fetch_add(*node.get(), Ordering::Relaxed);
                                consumed_count.fetch_add(1, Ordering::Relaxed);
                            }
                            None if done.load(Ordering::Acquire) => {
                                if list.is_empty() {
                                    break;
                                }
                            }
                            None => std::hint::spin_loop(),
                        }
                    })
                })
                .collect();

            let producers: Vec<_> = nodes
                .iter()
                .map(|batch| {
                    let list = &list;
                    s.spawn(move |_| {
                        for node in batch {
                            list.insert(node);
                        }
                    })
                })
                .collect();

            for producer in producers {
                producer.join().unwrap();
            }
            done.store(true, Ordering::Release);
            for consumer in consumers {
                consumer.join().unwrap();
            }
        })
        .unwrap();

        let total = PRODUCERS * PER_PRODUCER;
        assert_eq!(consumed_count.load(Ordering::Relaxed), total);
        assert_eq!(consumed_sum.load(Ordering::Relaxed), total * (total + 1) / 2);
        assert!(nodes.iter().flatten().all(|n| !n.is_on_list(None)));
    }
}
