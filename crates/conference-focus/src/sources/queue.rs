//! Per-participant source-signaling queue.
//!
//! Coalesces outbound add/remove deltas against the set of sources already
//! delivered to the peer. A flush emits at most two batches, **removes
//! first, then adds** — that order is pinned so a peer never momentarily
//! holds two owners for a recycled ssrc.

use super::SourceMap;
use common::media::EndpointSources;
use common::types::EndpointId;
use std::collections::{HashMap, HashSet};

/// The two batches produced by a flush, to be sent in field order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PendingUpdate {
    pub remove: SourceMap,
    pub add: SourceMap,
}

impl PendingUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// Coalescing state for one signaling peer.
#[derive(Debug, Default)]
pub struct SignalingQueue {
    /// What the peer has been told about, by owner.
    delivered: SourceMap,
    /// Pending additions, by owner. Disjoint from `delivered`.
    to_add: SourceMap,
    /// Pending removals, by owner. Always a subset of `delivered`.
    to_remove: HashMap<EndpointId, HashSet<common::media::Ssrc>>,
}

impl SignalingQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue sources of `owner` for addition.
    ///
    /// Already-delivered ssrcs are no-ops; an add of a pending-removed
    /// ssrc cancels the removal (the delivered payload stands).
    pub fn add(&mut self, owner: &EndpointId, sources: EndpointSources) {
        let delivered = self.delivered.entry(owner.clone()).or_default();
        let delivered_ssrcs = delivered.ssrcs();
        let pending_removes = self.to_remove.entry(owner.clone()).or_default();

        let mut fresh = EndpointSources::default();
        for source in sources.sources {
            if pending_removes.remove(&source.ssrc) {
                continue;
            }
            if delivered_ssrcs.contains(&source.ssrc) {
                continue;
            }
            fresh.sources.push(source);
        }
        for group in sources.groups {
            let already = delivered.groups.contains(&group)
                || self
                    .to_add
                    .get(owner)
                    .is_some_and(|pending| pending.groups.contains(&group));
            if !already {
                fresh.groups.push(group);
            }
        }
        if pending_removes.is_empty() {
            self.to_remove.remove(owner);
        }

        if !fresh.is_empty() {
            // drop ssrcs already pending so a double-add stays single
            let pending = self.to_add.entry(owner.clone()).or_default();
            let pending_ssrcs = pending.ssrcs();
            fresh.sources.retain(|s| !pending_ssrcs.contains(&s.ssrc));
            pending.extend(fresh);
        }
    }

    /// Queue sources of `owner` for removal.
    ///
    /// A removal cancels a pending add; a removal of a delivered ssrc
    /// joins the remove delta; anything else is a no-op.
    pub fn remove(&mut self, owner: &EndpointId, sources: &EndpointSources) {
        let requested = sources.ssrcs();

        if let Some(pending) = self.to_add.get_mut(owner) {
            pending.strip(&requested);
            if pending.is_empty() {
                self.to_add.remove(owner);
            }
        }

        if let Some(delivered) = self.delivered.get(owner) {
            let delivered_ssrcs = delivered.ssrcs();
            let joining: HashSet<_> = requested
                .into_iter()
                .filter(|s| delivered_ssrcs.contains(s))
                .collect();
            if !joining.is_empty() {
                self.to_remove.entry(owner.clone()).or_default().extend(joining);
            }
        }
    }

    /// Whether a flush would emit anything.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.to_add.is_empty() || !self.to_remove.is_empty()
    }

    /// Drain the pending deltas and advance the delivered set.
    #[must_use]
    pub fn flush(&mut self) -> PendingUpdate {
        let mut update = PendingUpdate::default();

        for (owner, ssrcs) in self.to_remove.drain() {
            if let Some(delivered) = self.delivered.get_mut(&owner) {
                let removed = delivered.strip(&ssrcs);
                if delivered.is_empty() {
                    self.delivered.remove(&owner);
                }
                if !removed.is_empty() {
                    update.remove.insert(owner, removed);
                }
            }
        }

        for (owner, sources) in self.to_add.drain() {
            self.delivered
                .entry(owner.clone())
                .or_default()
                .extend(sources.clone());
            update.add.insert(owner, sources);
        }

        update
    }

    /// Install the delivered image of a (re)initiated session: the
    /// post-filter sources that left on the initiate. Pending deltas are
    /// discarded.
    pub fn reset(&mut self, initial: SourceMap) {
        self.delivered = initial;
        self.to_add.clear();
        self.to_remove.clear();
    }

    /// Bring the queue in line with the current conference image: queue
    /// removals for delivered sources that no longer exist and additions
    /// for sources that appeared since the delivered image was taken.
    pub fn reconcile(&mut self, current: &SourceMap) {
        let owners: Vec<EndpointId> = self.delivered.keys().cloned().collect();
        for owner in owners {
            let current_ssrcs = current.get(&owner).map(EndpointSources::ssrcs).unwrap_or_default();
            let stale: Vec<_> = self
                .delivered
                .get(&owner)
                .map(|delivered| {
                    delivered
                        .sources
                        .iter()
                        .filter(|s| !current_ssrcs.contains(&s.ssrc))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if !stale.is_empty() {
                self.remove(&owner, &EndpointSources::from_sources(stale));
            }
        }
        for (owner, sources) in current {
            self.add(owner, sources.clone());
        }
    }

    /// Forget an owner entirely, without signaling. Used when the owner's
    /// departure is already visible to the peer via presence.
    pub fn forget(&mut self, owner: &EndpointId) {
        self.delivered.remove(owner);
        self.to_add.remove(owner);
        self.to_remove.remove(owner);
    }

    /// Delivered ssrc count, for snapshots.
    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.delivered.values().map(|s| s.sources.len()).sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::media::{MediaKind, Source};

    fn ep(name: &str) -> EndpointId {
        EndpointId::new(name)
    }

    fn srcs(ssrcs: &[u32]) -> EndpointSources {
        EndpointSources::from_sources(
            ssrcs.iter().map(|s| Source::new(*s, MediaKind::Audio)).collect(),
        )
    }

    #[test]
    fn test_add_then_flush() {
        let mut queue = SignalingQueue::new();
        queue.add(&ep("a"), srcs(&[1, 2]));
        assert!(queue.has_pending());

        let update = queue.flush();
        assert!(update.remove.is_empty());
        assert_eq!(update.add.get(&ep("a")).unwrap().ssrc_list(), vec![1, 2]);
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_add_of_delivered_is_noop() {
        let mut queue = SignalingQueue::new();
        queue.add(&ep("a"), srcs(&[1]));
        let _ = queue.flush();

        queue.add(&ep("a"), srcs(&[1]));
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_remove_cancels_pending_add() {
        let mut queue = SignalingQueue::new();
        queue.add(&ep("a"), srcs(&[1, 2]));
        queue.remove(&ep("a"), &srcs(&[1]));

        let update = queue.flush();
        assert!(update.remove.is_empty());
        assert_eq!(update.add.get(&ep("a")).unwrap().ssrc_list(), vec![2]);
    }

    #[test]
    fn test_remove_of_delivered_joins_remove_delta() {
        let mut queue = SignalingQueue::new();
        queue.add(&ep("a"), srcs(&[1, 2]));
        let _ = queue.flush();

        queue.remove(&ep("a"), &srcs(&[2]));
        let update = queue.flush();
        assert_eq!(update.remove.get(&ep("a")).unwrap().ssrc_list(), vec![2]);
        assert!(update.add.is_empty());

        // peer now only knows ssrc 1
        assert_eq!(queue.delivered_count(), 1);
    }

    #[test]
    fn test_add_cancels_pending_remove() {
        let mut queue = SignalingQueue::new();
        queue.add(&ep("a"), srcs(&[1]));
        let _ = queue.flush();

        queue.remove(&ep("a"), &srcs(&[1]));
        queue.add(&ep("a"), srcs(&[1]));

        let update = queue.flush();
        assert!(update.is_empty());
        assert_eq!(queue.delivered_count(), 1);
    }

    #[test]
    fn test_remove_of_unknown_is_noop() {
        let mut queue = SignalingQueue::new();
        queue.remove(&ep("a"), &srcs(&[42]));
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_causal_order_add_then_remove_yields_remove_observed() {
        // add-then-remove of the same ssrc before any flush: the peer
        // must not observe the source at all.
        let mut queue = SignalingQueue::new();
        queue.add(&ep("a"), srcs(&[9]));
        queue.remove(&ep("a"), &srcs(&[9]));
        assert!(queue.flush().is_empty());
    }

    #[test]
    fn test_reset_installs_delivered_image() {
        let mut queue = SignalingQueue::new();
        queue.add(&ep("a"), srcs(&[1]));

        let mut initial = SourceMap::new();
        initial.insert(ep("b"), srcs(&[5, 6]));
        queue.reset(initial);

        assert!(!queue.has_pending());
        assert_eq!(queue.delivered_count(), 2);

        // re-adding what the initiate carried is a no-op
        queue.add(&ep("b"), srcs(&[5]));
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_reconcile_queues_the_difference() {
        let mut queue = SignalingQueue::new();
        let mut initial = SourceMap::new();
        initial.insert(ep("a"), srcs(&[1, 2]));
        queue.reset(initial);

        // meanwhile ssrc 2 went away and b appeared
        let mut current = SourceMap::new();
        current.insert(ep("a"), srcs(&[1]));
        current.insert(ep("b"), srcs(&[7]));
        queue.reconcile(&current);

        let update = queue.flush();
        assert_eq!(update.remove.get(&ep("a")).unwrap().ssrc_list(), vec![2]);
        assert_eq!(update.add.get(&ep("b")).unwrap().ssrc_list(), vec![7]);
        assert!(update.add.get(&ep("a")).is_none());
    }

    #[test]
    fn test_forget_drops_owner_silently() {
        let mut queue = SignalingQueue::new();
        queue.add(&ep("a"), srcs(&[1]));
        let _ = queue.flush();

        queue.forget(&ep("a"));
        assert!(!queue.has_pending());
        assert_eq!(queue.delivered_count(), 0);
    }
}
