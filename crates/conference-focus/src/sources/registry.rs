//! The conference-wide source registry.
//!
//! One registry per conference, holding the validated source set of every
//! endpoint. All operations are serialized behind the registry's own lock;
//! this is the only lock invite runners may take, and it is never held
//! across I/O. Iteration happens on snapshot copies.

use super::SourceMap;
use crate::errors::SourceError;
use common::media::{EndpointSources, MediaKind, Ssrc};
use common::types::EndpointId;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

/// Per-endpoint budgets.
#[derive(Debug, Clone, Copy)]
pub struct SourceLimits {
    pub max_sources: usize,
    pub max_groups: usize,
}

/// Validated per-endpoint source sets with conflict detection.
pub struct ConferenceSources {
    limits: SourceLimits,
    inner: Mutex<HashMap<EndpointId, EndpointSources>>,
}

impl ConferenceSources {
    #[must_use]
    pub fn new(limits: SourceLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and add sources for `endpoint`.
    ///
    /// The whole call is rejected when any submitted ssrc conflicts with
    /// another endpoint, appears twice in the submission, or the resulting
    /// set would break the per-endpoint budgets or group closure. On
    /// success the registry is updated atomically and the *accepted*
    /// subset is returned: ssrcs already present under this endpoint are
    /// dropped, so re-adds are idempotent.
    pub fn try_to_add(
        &self,
        endpoint: &EndpointId,
        proposed: EndpointSources,
    ) -> Result<EndpointSources, SourceError> {
        if proposed.has_duplicates() {
            let dup = first_duplicate(&proposed);
            return Err(SourceError::Duplicate(dup));
        }

        let mut inner = lock(&self.inner);

        for (owner, owned) in inner.iter() {
            if owner == endpoint {
                continue;
            }
            let owned_ssrcs = owned.ssrcs();
            if let Some(src) = proposed.sources.iter().find(|s| owned_ssrcs.contains(&s.ssrc)) {
                return Err(SourceError::Conflict(src.ssrc));
            }
        }

        let existing = inner.entry(endpoint.clone()).or_default();
        let existing_ssrcs = existing.ssrcs();

        let mut accepted = EndpointSources::default();
        for source in proposed.sources {
            if !existing_ssrcs.contains(&source.ssrc) {
                accepted.sources.push(source);
            }
        }
        for group in proposed.groups {
            if !existing.groups.contains(&group) {
                accepted.groups.push(group);
            }
        }

        let source_count = existing.sources.len() + accepted.sources.len();
        if source_count > self.limits.max_sources {
            return Err(SourceError::TooManySources {
                count: source_count,
                limit: self.limits.max_sources,
            });
        }
        let group_count = existing.groups.len() + accepted.groups.len();
        if group_count > self.limits.max_groups {
            return Err(SourceError::TooManyGroups {
                count: group_count,
                limit: self.limits.max_groups,
            });
        }

        let mut flat: HashSet<Ssrc> = existing_ssrcs;
        flat.extend(accepted.sources.iter().map(|s| s.ssrc));
        for group in existing.groups.iter().chain(accepted.groups.iter()) {
            if let Some(missing) = group.ssrcs.iter().find(|s| !flat.contains(s)) {
                return Err(SourceError::GroupMemberMissing(*missing));
            }
        }

        existing.extend(accepted.clone());
        debug!(
            target: "focus.sources",
            endpoint = %endpoint,
            added = accepted.sources.len(),
            total = existing.sources.len(),
            "Sources added"
        );
        Ok(accepted)
    }

    /// Remove sources owned by `endpoint`.
    ///
    /// A requested ssrc owned by *another* endpoint fails the whole call;
    /// ssrcs owned by nobody are silently skipped. Returns the subset
    /// actually removed (groups touching a removed ssrc go with it).
    pub fn try_to_remove(
        &self,
        endpoint: &EndpointId,
        requested: &EndpointSources,
    ) -> Result<EndpointSources, SourceError> {
        let mut inner = lock(&self.inner);

        let requested_ssrcs = requested.ssrcs();
        for (owner, owned) in inner.iter() {
            if owner == endpoint {
                continue;
            }
            let owned_ssrcs = owned.ssrcs();
            if let Some(ssrc) = requested_ssrcs.iter().find(|s| owned_ssrcs.contains(s)) {
                return Err(SourceError::NotOwned(*ssrc));
            }
        }

        let Some(owned) = inner.get_mut(endpoint) else {
            return Ok(EndpointSources::default());
        };

        let removed = owned.strip(&requested_ssrcs);
        if owned.is_empty() {
            inner.remove(endpoint);
        }
        debug!(
            target: "focus.sources",
            endpoint = %endpoint,
            removed = removed.sources.len(),
            "Sources removed"
        );
        Ok(removed)
    }

    /// Drop and return everything the endpoint advertised. Used on
    /// participant termination.
    pub fn remove(&self, endpoint: &EndpointId) -> EndpointSources {
        lock(&self.inner).remove(endpoint).unwrap_or_default()
    }

    /// Snapshot copy of the whole registry.
    #[must_use]
    pub fn snapshot(&self) -> SourceMap {
        lock(&self.inner).clone()
    }

    /// Snapshot copy without the given endpoint's own sources; the shape
    /// that goes into that endpoint's offer.
    #[must_use]
    pub fn snapshot_excluding(&self, endpoint: &EndpointId) -> SourceMap {
        let mut map = lock(&self.inner).clone();
        map.remove(endpoint);
        map
    }

    /// Number of endpoints currently advertising at least one source of
    /// the given bridge-level kind.
    #[must_use]
    pub fn sender_count(&self, kind: MediaKind) -> usize {
        lock(&self.inner)
            .values()
            .filter(|s| s.has_kind(kind))
            .count()
    }

    /// Whether the endpoint already advertises the given kind.
    #[must_use]
    pub fn endpoint_has_kind(&self, endpoint: &EndpointId, kind: MediaKind) -> bool {
        lock(&self.inner)
            .get(endpoint)
            .is_some_and(|s| s.has_kind(kind))
    }
}

fn first_duplicate(set: &EndpointSources) -> Ssrc {
    let mut seen = HashSet::with_capacity(set.sources.len());
    for source in &set.sources {
        if !seen.insert(source.ssrc) {
            return source.ssrc;
        }
    }
    Ssrc(0)
}

/// The registry lock is never held across I/O or callbacks, so poisoning
/// can only come from a panic in the short critical sections below; fall
/// back to the inner data rather than propagating the panic.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::media::{GroupSemantics, Source, SourceGroup};

    fn limits() -> SourceLimits {
        SourceLimits {
            max_sources: 4,
            max_groups: 2,
        }
    }

    fn ep(name: &str) -> EndpointId {
        EndpointId::new(name)
    }

    fn audio(ssrc: u32) -> Source {
        Source::new(ssrc, MediaKind::Audio)
    }

    fn video(ssrc: u32) -> Source {
        Source::new(ssrc, MediaKind::Video)
    }

    #[test]
    fn test_add_and_snapshot() {
        let registry = ConferenceSources::new(limits());
        let accepted = registry
            .try_to_add(&ep("a"), EndpointSources::from_sources(vec![audio(1), video(2)]))
            .unwrap();
        assert_eq!(accepted.sources.len(), 2);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.get(&ep("a")).unwrap().sources.len(), 2);
    }

    #[test]
    fn test_cross_endpoint_conflict_rejects_whole_call() {
        let registry = ConferenceSources::new(limits());
        registry
            .try_to_add(&ep("a"), EndpointSources::from_sources(vec![audio(111)]))
            .unwrap();

        let err = registry
            .try_to_add(&ep("b"), EndpointSources::from_sources(vec![audio(111), audio(5)]))
            .unwrap_err();
        assert_eq!(err, SourceError::Conflict(Ssrc(111)));

        // b must be untouched, a unchanged
        assert!(registry.snapshot().get(&ep("b")).is_none());
        assert_eq!(registry.snapshot().get(&ep("a")).unwrap().sources.len(), 1);
    }

    #[test]
    fn test_readd_is_idempotent_and_returns_new_subset() {
        let registry = ConferenceSources::new(limits());
        registry
            .try_to_add(&ep("a"), EndpointSources::from_sources(vec![audio(1)]))
            .unwrap();

        let accepted = registry
            .try_to_add(&ep("a"), EndpointSources::from_sources(vec![audio(1), video(2)]))
            .unwrap();
        assert_eq!(accepted.ssrc_list(), vec![2]);
        assert_eq!(registry.snapshot().get(&ep("a")).unwrap().sources.len(), 2);
    }

    #[test]
    fn test_duplicate_in_submission_rejected() {
        let registry = ConferenceSources::new(limits());
        let err = registry
            .try_to_add(&ep("a"), EndpointSources::from_sources(vec![audio(1), audio(1)]))
            .unwrap_err();
        assert_eq!(err, SourceError::Duplicate(Ssrc(1)));
    }

    #[test]
    fn test_source_budget_enforced() {
        let registry = ConferenceSources::new(limits());
        let too_many: Vec<Source> = (1..=5).map(audio).collect();
        let err = registry
            .try_to_add(&ep("a"), EndpointSources::from_sources(too_many))
            .unwrap_err();
        assert!(matches!(err, SourceError::TooManySources { count: 5, limit: 4 }));
    }

    #[test]
    fn test_group_must_reference_flat_set() {
        let registry = ConferenceSources::new(limits());
        let set = EndpointSources::new(
            vec![video(1)],
            vec![SourceGroup::new(GroupSemantics::Fid, vec![1, 99])],
        );
        let err = registry.try_to_add(&ep("a"), set).unwrap_err();
        assert_eq!(err, SourceError::GroupMemberMissing(Ssrc(99)));
    }

    #[test]
    fn test_remove_owned_only() {
        let registry = ConferenceSources::new(limits());
        registry
            .try_to_add(&ep("a"), EndpointSources::from_sources(vec![audio(1)]))
            .unwrap();
        registry
            .try_to_add(&ep("b"), EndpointSources::from_sources(vec![audio(2)]))
            .unwrap();

        // removing b's ssrc as a fails the whole call
        let err = registry
            .try_to_remove(&ep("a"), &EndpointSources::from_sources(vec![audio(2)]))
            .unwrap_err();
        assert_eq!(err, SourceError::NotOwned(Ssrc(2)));

        // unknown ssrcs are skipped, owned ones removed
        let removed = registry
            .try_to_remove(&ep("a"), &EndpointSources::from_sources(vec![audio(1), audio(77)]))
            .unwrap();
        assert_eq!(removed.ssrc_list(), vec![1]);
        assert!(registry.snapshot().get(&ep("a")).is_none());
    }

    #[test]
    fn test_remove_all_on_termination() {
        let registry = ConferenceSources::new(limits());
        registry
            .try_to_add(&ep("a"), EndpointSources::from_sources(vec![audio(1), video(2)]))
            .unwrap();

        let dropped = registry.remove(&ep("a"));
        assert_eq!(dropped.sources.len(), 2);
        assert!(registry.snapshot().is_empty());
        // second removal is empty, not an error
        assert!(registry.remove(&ep("a")).is_empty());
    }

    #[test]
    fn test_sender_counting() {
        let registry = ConferenceSources::new(limits());
        registry
            .try_to_add(&ep("a"), EndpointSources::from_sources(vec![audio(1)]))
            .unwrap();
        registry
            .try_to_add(&ep("b"), EndpointSources::from_sources(vec![audio(2), video(3)]))
            .unwrap();

        assert_eq!(registry.sender_count(MediaKind::Audio), 2);
        assert_eq!(registry.sender_count(MediaKind::Video), 1);
        assert!(registry.endpoint_has_kind(&ep("b"), MediaKind::Video));
        assert!(!registry.endpoint_has_kind(&ep("a"), MediaKind::Video));
    }

    #[test]
    fn test_ssrc_disjointness_invariant() {
        let registry = ConferenceSources::new(limits());
        registry
            .try_to_add(&ep("a"), EndpointSources::from_sources(vec![audio(1), video(2)]))
            .unwrap();
        registry
            .try_to_add(&ep("b"), EndpointSources::from_sources(vec![audio(3)]))
            .unwrap();

        let snapshot = registry.snapshot();
        let mut all: Vec<Ssrc> = snapshot
            .values()
            .flat_map(|s| s.sources.iter().map(|x| x.ssrc))
            .collect();
        let before = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(before, all.len());
    }
}
