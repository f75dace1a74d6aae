//! Append-ordered list of message instances on a queue.
//!
//! Publishers append at the tail, subscriptions walk the chain from their
//! own cursor, and acknowledgements dispense entries, all without a list
//! lock. Dispensed nodes are not removed eagerly: a traversal that walks
//! past one swings its predecessor's `next` slot over it with a
//! compare-and-swap. Concurrent walkers compacting the same region converge
//! on the same chain because a failed swap only means another walker got
//! there first.
//!
//! Nodes are reference counted. An unlinked node keeps its own `next` slot,
//! so a subscription cursor left on it can still continue the walk; the
//! node is freed once the last cursor moves on. The tail node is never
//! unlinked so appends always have a live predecessor.

use crate::instance::MessageInstance;
use crate::message::EntryId;
use arc_swap::{ArcSwap, ArcSwapOption};
use std::sync::Arc;

#[cfg(test)]
#[path = "entry_list_tests.rs"]
mod tests;

// ============================================================================
// Entry Node
// ============================================================================

/// One link of the chain. The head sentinel carries no instance.
pub struct EntryNode {
    entry_id: EntryId,
    instance: Option<Arc<MessageInstance>>,
    next: ArcSwapOption<EntryNode>,
}

impl EntryNode {
    fn head() -> Self {
        Self {
            entry_id: EntryId::HEAD,
            instance: None,
            next: ArcSwapOption::empty(),
        }
    }

    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    pub fn instance(&self) -> Option<&Arc<MessageInstance>> {
        self.instance.as_ref()
    }

    pub fn is_head(&self) -> bool {
        self.instance.is_none()
    }

    /// The head sentinel is never dispensed; it is simply never yielded.
    pub fn is_dispensed(&self) -> bool {
        self.instance.as_ref().is_some_and(|instance| instance.is_dispensed())
    }

    /// Raw successor, dispensed or not
    pub fn next_node(&self) -> Option<Arc<EntryNode>> {
        self.next.load_full()
    }

    /// The next non-dispensed node after this one.
    ///
    /// Dispensed successors are unlinked on the way, except for the tail.
    pub fn next_valid(&self) -> Option<Arc<EntryNode>> {
        let mut next = self.next.load_full();
        while let Some(candidate) = next.clone() {
            if !candidate.is_dispensed() {
                return Some(candidate);
            }

            match candidate.next.load_full() {
                Some(after) => {
                    let _ = self.next.compare_and_swap(&next, Some(after));
                    next = self.next.load_full();
                }
                None => return None,
            }
        }
        None
    }
}

impl Drop for EntryNode {
    // Unlink iteratively so dropping a long chain does not recurse.
    fn drop(&mut self) {
        let mut next = self.next.swap(None);
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(owned) => next = owned.next.swap(None),
                Err(_) => break,
            }
        }
    }
}

impl std::fmt::Debug for EntryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryNode")
            .field("entry_id", &self.entry_id)
            .field("dispensed", &self.is_dispensed())
            .finish()
    }
}

// ============================================================================
// Entry List
// ============================================================================

/// Lock-free ordered list of entries
pub struct EntryList {
    head: Arc<EntryNode>,
    tail: ArcSwap<EntryNode>,
}

impl EntryList {
    pub fn new() -> Self {
        let head = Arc::new(EntryNode::head());
        Self {
            tail: ArcSwap::new(Arc::clone(&head)),
            head,
        }
    }

    /// Sentinel preceding the first entry
    pub fn head(&self) -> Arc<EntryNode> {
        Arc::clone(&self.head)
    }

    /// Append a new entry. `make` builds the instance for the id the entry
    /// receives and may be called again if another append wins the race.
    pub fn append(&self, make: impl Fn(EntryId) -> MessageInstance) -> Arc<MessageInstance> {
        loop {
            let tail = self.tail.load_full();

            if let Some(next) = tail.next.load_full() {
                // Tail is lagging behind a completed append; help it along.
                let _ = self.tail.compare_and_swap(&tail, next);
                continue;
            }

            let entry_id = tail.entry_id.next();
            let instance = Arc::new(make(entry_id));
            let node = Arc::new(EntryNode {
                entry_id,
                instance: Some(Arc::clone(&instance)),
                next: ArcSwapOption::empty(),
            });

            let empty: Option<Arc<EntryNode>> = None;
            let previous = tail.next.compare_and_swap(&empty, Some(Arc::clone(&node)));
            if previous.is_none() {
                let _ = self.tail.compare_and_swap(&tail, node);
                return instance;
            }
        }
    }

    /// First node that still holds an undispensed instance
    pub fn first_valid(&self) -> Option<Arc<EntryNode>> {
        self.head.next_valid()
    }

    /// Id of the most recently appended entry
    pub fn tail_id(&self) -> EntryId {
        self.tail.load().entry_id
    }

    /// Snapshot walk over undispensed instances in entry order
    pub fn iter(&self) -> EntryIter {
        EntryIter {
            current: self.head(),
        }
    }

    /// Number of instances not yet dispensed
    pub fn len_undispensed(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first_valid().is_none()
    }
}

impl Default for EntryList {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the undispensed instances of an [`EntryList`]
pub struct EntryIter {
    current: Arc<EntryNode>,
}

impl Iterator for EntryIter {
    type Item = Arc<MessageInstance>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.current.next_valid()?;
        self.current = Arc::clone(&next);
        next.instance().cloned()
    }
}
