//! Per-channel map of deliveries awaiting acknowledgement.
//!
//! Keys are delivery tags, which a channel hands out in strictly increasing
//! order, so the ordered map's key order is also delivery order. Cumulative
//! acknowledgement is a split of the map at the acknowledged tag.

use crate::instance::MessageInstance;
use crate::message::DeliveryTag;
use crate::subscription::Subscription;
use std::collections::BTreeMap;
use std::sync::Arc;

#[cfg(test)]
#[path = "unacked_tests.rs"]
mod tests;

/// A delivery awaiting acknowledgement
#[derive(Clone)]
pub struct UnackedEntry {
    pub instance: Arc<MessageInstance>,
    pub subscription: Arc<Subscription>,
}

impl std::fmt::Debug for UnackedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnackedEntry")
            .field("instance", &self.instance)
            .field("subscription", &self.subscription.id())
            .finish()
    }
}

/// What [`UnacknowledgedMessageMap::visit`] does with an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Redeliver to the subscription that holds it
    Resend,
    /// Release for any consumer
    Requeue,
    /// Drop without redelivery
    Discard,
}

/// Entries extracted by a visit, each list in tag order
#[derive(Debug, Default)]
pub struct Partitioned {
    pub resend: Vec<(DeliveryTag, UnackedEntry)>,
    pub requeue: Vec<(DeliveryTag, UnackedEntry)>,
    pub discard: Vec<(DeliveryTag, UnackedEntry)>,
}

impl Partitioned {
    pub fn len(&self) -> usize {
        self.resend.len() + self.requeue.len() + self.discard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct UnacknowledgedMessageMap {
    entries: BTreeMap<DeliveryTag, UnackedEntry>,
}

impl UnacknowledgedMessageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery. Returns false, leaving the map untouched, when the
    /// tag is already present.
    pub fn add(
        &mut self,
        tag: DeliveryTag,
        instance: Arc<MessageInstance>,
        subscription: Arc<Subscription>,
    ) -> bool {
        if self.entries.contains_key(&tag) {
            return false;
        }
        self.entries.insert(tag, UnackedEntry { instance, subscription });
        true
    }

    /// Remove and return the acknowledged entries in tag order.
    ///
    /// Cumulative acknowledgement takes every entry up to and including
    /// `tag`. An empty result means the tag was unknown.
    pub fn acknowledge(&mut self, tag: DeliveryTag, cumulative: bool) -> Vec<UnackedEntry> {
        if !cumulative {
            return self.entries.remove(&tag).into_iter().collect();
        }

        let acknowledged = match tag.value().checked_add(1) {
            Some(bound) => {
                let rest = self.entries.split_off(&DeliveryTag::from_raw(bound));
                std::mem::replace(&mut self.entries, rest)
            }
            None => std::mem::take(&mut self.entries),
        };
        acknowledged.into_values().collect()
    }

    /// Forget `tag`, returning what was delivered under it
    pub fn remove(&mut self, tag: DeliveryTag) -> Option<UnackedEntry> {
        self.entries.remove(&tag)
    }

    pub fn get(&self, tag: DeliveryTag) -> Option<&UnackedEntry> {
        self.entries.get(&tag)
    }

    /// Empty the map, returning every entry in tag order
    pub fn cancel_all(&mut self) -> Vec<UnackedEntry> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Split every entry according to `partition` and empty the map
    pub fn visit(
        &mut self,
        mut partition: impl FnMut(DeliveryTag, &UnackedEntry) -> Disposition,
    ) -> Partitioned {
        let mut result = Partitioned::default();
        for (tag, entry) in std::mem::take(&mut self.entries) {
            match partition(tag, &entry) {
                Disposition::Resend => result.resend.push((tag, entry)),
                Disposition::Requeue => result.requeue.push((tag, entry)),
                Disposition::Discard => result.discard.push((tag, entry)),
            }
        }
        result
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Outstanding delivery tags in delivery order
    pub fn tags(&self) -> Vec<DeliveryTag> {
        self.entries.keys().copied().collect()
    }

    /// Sum of body sizes of every outstanding delivery
    pub fn unacknowledged_bytes(&self) -> u64 {
        self.entries.values().map(|entry| entry.instance.message().size()).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
