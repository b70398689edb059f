//! Lock-free unbounded MPMC FIFO used to hand work to the worker pool.
//!
//! The queue is a singly-linked chain of fixed-size nodes. Producers claim a
//! slot on the tail node with a fetch-and-add and publish the value through a
//! per-slot state machine; when a node fills up the chain is extended (one
//! winner allocates the new node, losers adopt it) and the shared tail
//! pointer advances by compare-and-swap. Consumers own a cursor into the
//! chain and scan forward, claiming pending slots by compare-and-swap.
//!
//! Node lifetime is reference-counted: the queue keeps the tail and a lagging
//! head anchor alive, every consumer keeps its current node alive, and the
//! forward links keep everything downstream alive. As consumers move past a
//! node the head anchor collapses forward and fully-consumed nodes are
//! reclaimed. Guarantees: FIFO per producer (not globally), at-most-once
//! delivery, and no slot is destroyed while a consumer still scans its node.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use crossbeam_utils::CachePadded;

/// Slots per chain node.
pub const NODE_SLOTS: usize = 2048;

// Per-slot lifecycle. A slot moves Free -> Writing -> Pending -> Reading ->
// Complete and never revisits an earlier state.
const FREE: u8 = 0;
const WRITING: u8 = 1;
const PENDING: u8 = 2;
const READING: u8 = 3;
const COMPLETE: u8 = 4;

struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
}

struct Node<T> {
    slots: Box<[Slot<T>]>,
    /// Producer write cursor. `fetch_add` hands each producer a distinct
    /// index, so the slot at a claimed index is owned by exactly one writer.
    claim: CachePadded<AtomicUsize>,
    next: OnceLock<Arc<Node<T>>>,
    census: Arc<AtomicUsize>,
}

// The value cell of a slot is touched only by the producer that claimed its
// index (Writing) or the single consumer that won the Pending -> Reading
// exchange, so cross-thread access is serialized by the state machine.
unsafe impl<T: Send> Send for Node<T> {}
unsafe impl<T: Send> Sync for Node<T> {}

impl<T> Node<T> {
    fn alloc(census: &Arc<AtomicUsize>) -> Arc<Self> {
        census.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            slots: (0..NODE_SLOTS)
                .map(|_| Slot {
                    state: AtomicU8::new(FREE),
                    value: UnsafeCell::new(None),
                })
                .collect(),
            claim: CachePadded::new(AtomicUsize::new(0)),
            next: OnceLock::new(),
            census: census.clone(),
        })
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        self.census.fetch_sub(1, Ordering::Relaxed);
        // Unlink the chain iteratively so dropping a long queue cannot
        // overflow the stack through recursive node drops.
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut unique) => next = unique.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// Unbounded multi-producer multi-consumer FIFO.
pub struct TaskQueue<T> {
    tail: ArcSwap<Node<T>>,
    /// Lagging anchor behind the oldest unconsumed slot. New consumers start
    /// here; it collapses forward as consumers move past nodes.
    head: ArcSwap<Node<T>>,
    node_count: Arc<AtomicUsize>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        let node_count = Arc::new(AtomicUsize::new(0));
        let first = Node::alloc(&node_count);
        Self {
            tail: ArcSwap::from(first.clone()),
            head: ArcSwap::from(first),
            node_count,
        }
    }

    /// Enqueue a value. Never blocks and never fails; the chain grows on
    /// demand.
    pub fn push(&self, value: T) {
        let mut tail = self.tail.load_full();
        loop {
            let index = tail.claim.fetch_add(1, Ordering::AcqRel);
            if index < NODE_SLOTS {
                let slot = &tail.slots[index];
                slot.state.store(WRITING, Ordering::Relaxed);
                unsafe { *slot.value.get() = Some(value) };
                slot.state.store(PENDING, Ordering::Release);
                return;
            }

            // Node exhausted: extend the chain (one winner allocates, losers
            // adopt the winner's node) and advance the shared tail. A lost
            // CAS means another producer advanced it first; either way the
            // reload observes a node at or past `next`.
            let next = tail
                .next
                .get_or_init(|| Node::alloc(&self.node_count))
                .clone();
            let _ = self.tail.compare_and_swap(&tail, next);
            tail = self.tail.load_full();
        }
    }

    /// Handle to the live-node counter, for leak assertions in tests.
    pub fn node_census(&self) -> Arc<AtomicUsize> {
        self.node_count.clone()
    }

    fn collapse_head(&self, departed: &Arc<Node<T>>) {
        if let Some(next) = departed.next.get() {
            // Advances only while the anchor still points at the departed
            // node, so the anchor moves strictly forward one node at a time.
            let _ = self.head.compare_and_swap(departed, next.clone());
        }
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A consumer's private cursor into the queue.
///
/// Holding the cursor keeps its current node (and everything downstream)
/// alive, so slots a consumer may still scan are never reclaimed underneath
/// it.
pub struct Consumer<T> {
    queue: Arc<TaskQueue<T>>,
    node: Arc<Node<T>>,
    index: usize,
}

impl<T> Consumer<T> {
    /// Create a cursor starting at the queue's oldest retained node.
    pub fn new(queue: Arc<TaskQueue<T>>) -> Self {
        let node = queue.head.load_full();
        Self {
            queue,
            node,
            index: 0,
        }
    }

    /// Dequeue the next pending value, or `None` at the producer edge (the
    /// first slot that is still free or mid-write).
    pub fn pop(&mut self) -> Option<T> {
        loop {
            while self.index < NODE_SLOTS {
                let slot = &self.node.slots[self.index];
                match slot.state.compare_exchange(
                    PENDING,
                    READING,
                    Ordering::Acquire,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).take() };
                        slot.state.store(COMPLETE, Ordering::Release);
                        self.index += 1;
                        return value;
                    }
                    // Claimed or consumed by another consumer; keep scanning.
                    Err(READING) | Err(COMPLETE) => self.index += 1,
                    // Free or Writing marks the producer edge.
                    Err(_) => return None,
                }
            }

            let Some(next) = self.node.next.get().cloned() else {
                return None;
            };
            let departed = std::mem::replace(&mut self.node, next);
            self.index = 0;
            self.queue.collapse_head(&departed);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
