//! Source tracking: the validated conference-wide registry, the
//! per-participant signaling queue, and the initial-offer filters.

pub mod compat;
pub mod queue;
pub mod registry;

use common::media::EndpointSources;
use common::types::EndpointId;
use std::collections::HashMap;

/// Sources grouped by owning endpoint; the unit that crosses the signaling
/// boundary (offers, source-add, source-remove).
pub type SourceMap = HashMap<EndpointId, EndpointSources>;

/// Total source count of a map, for logs.
#[must_use]
pub fn source_count(map: &SourceMap) -> usize {
    map.values().map(|s| s.sources.len()).sum()
}
