//! Receiver-capability filters applied to the sources of an initial offer.
//!
//! The filtered image is what actually leaves on the session-initiate, and
//! what the signaling queue installs as its delivered set.

use super::SourceMap;
use common::features::{Feature, FeatureSet};
use common::media::{EndpointSources, GroupSemantics, MediaKind, Ssrc, VideoType};
use std::collections::HashSet;

/// Filter a conference source map for one receiver.
///
/// - Unless the receiver advertises `ssrc-rewriting`, simulcast is
///   stripped: only the primary layer of every SIM group survives,
///   together with its retransmission pairing.
/// - Unless the receiver advertises `receive-multiple-streams`, each
///   sender is collapsed to a single video track (camera preferred) next
///   to its audio.
#[must_use]
pub fn filter_for_receiver(features: &FeatureSet, map: SourceMap) -> SourceMap {
    let mut filtered: SourceMap = map
        .into_iter()
        .map(|(owner, sources)| {
            let mut sources = if features.contains(Feature::SsrcRewriting) {
                sources
            } else {
                strip_simulcast(sources)
            };
            if !features.contains(Feature::ReceiveMultipleStreams) {
                sources = collapse_to_single_video(sources);
            }
            (owner, sources)
        })
        .collect();
    filtered.retain(|_, s| !s.is_empty());
    filtered
}

/// Drop every non-primary simulcast layer and the groups that only exist
/// to describe them.
#[must_use]
pub fn strip_simulcast(mut sources: EndpointSources) -> EndpointSources {
    let mut secondary: HashSet<Ssrc> = HashSet::new();
    for group in &sources.groups {
        if group.semantics == GroupSemantics::Sim {
            secondary.extend(group.ssrcs.iter().skip(1).copied());
        }
    }
    if secondary.is_empty() {
        return sources;
    }

    // retransmission partners of dropped layers go too
    let mut dropped = secondary.clone();
    for group in &sources.groups {
        if group.semantics == GroupSemantics::Fid
            && group.ssrcs.iter().any(|s| secondary.contains(s))
        {
            dropped.extend(group.ssrcs.iter().copied());
        }
    }
    // never drop a SIM primary via its FID pairing
    for group in &sources.groups {
        if group.semantics == GroupSemantics::Sim {
            if let Some(primary) = group.ssrcs.first() {
                dropped.remove(primary);
            }
        }
    }

    let _ = sources.strip(&dropped);
    sources.groups.retain(|g| g.semantics != GroupSemantics::Sim);
    sources
}

/// Keep the audio sources and a single video track per sender, preferring
/// a camera track over desktop.
#[must_use]
pub fn collapse_to_single_video(mut sources: EndpointSources) -> EndpointSources {
    let keep: Option<Ssrc> = sources
        .sources
        .iter()
        .find(|s| {
            s.kind.bridge_kind() == MediaKind::Video && s.video_type != Some(VideoType::Desktop)
        })
        .or_else(|| {
            sources
                .sources
                .iter()
                .find(|s| s.kind.bridge_kind() == MediaKind::Video)
        })
        .map(|s| s.ssrc);

    let drop: HashSet<Ssrc> = sources
        .sources
        .iter()
        .filter(|s| s.kind.bridge_kind() == MediaKind::Video && Some(s.ssrc) != keep)
        .map(|s| s.ssrc)
        .collect();

    // keep the retransmission pairing of the surviving track
    let drop: HashSet<Ssrc> = drop
        .into_iter()
        .filter(|ssrc| {
            !sources.groups.iter().any(|g| {
                g.semantics == GroupSemantics::Fid
                    && g.ssrcs.contains(ssrc)
                    && keep.is_some_and(|k| g.ssrcs.contains(&k))
            })
        })
        .collect();

    let _ = sources.strip(&drop);
    sources
}
