//! The media-source model: ssrcs, kinds, sources and source groups.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// A 32-bit RTP synchronization source identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ssrc(pub u32);

impl fmt::Display for Ssrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a media stream.
///
/// Desktop is carried as a video substream at the bridge, but is an
/// independent unmute authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Desktop,
}

impl MediaKind {
    /// The kind the bridge sees: desktop collapses into video.
    #[must_use]
    pub fn bridge_kind(self) -> MediaKind {
        match self {
            MediaKind::Audio => MediaKind::Audio,
            MediaKind::Video | MediaKind::Desktop => MediaKind::Video,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Desktop => "desktop",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The declared type of a video source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoType {
    Camera,
    Desktop,
}

/// Semantics of a source group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupSemantics {
    /// Retransmission pairing (primary, rtx).
    #[serde(rename = "FID")]
    Fid,
    /// Simulcast layers, low to high.
    #[serde(rename = "SIM")]
    Sim,
    /// Forward error correction pairing.
    #[serde(rename = "FEC-FR")]
    FecFr,
}

/// A media source advertised by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub ssrc: Ssrc,
    pub kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_type: Option<VideoType>,
    #[serde(default)]
    pub muted: bool,
}

impl Source {
    #[must_use]
    pub fn new(ssrc: u32, kind: MediaKind) -> Self {
        Self {
            ssrc: Ssrc(ssrc),
            kind,
            video_type: None,
            muted: false,
        }
    }

    #[must_use]
    pub fn with_video_type(mut self, video_type: VideoType) -> Self {
        self.video_type = Some(video_type);
        self
    }

    #[must_use]
    pub fn muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }
}

/// A group of related ssrcs within one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceGroup {
    pub semantics: GroupSemantics,
    pub ssrcs: Vec<Ssrc>,
}

impl SourceGroup {
    #[must_use]
    pub fn new(semantics: GroupSemantics, ssrcs: Vec<u32>) -> Self {
        Self {
            semantics,
            ssrcs: ssrcs.into_iter().map(Ssrc).collect(),
        }
    }
}

/// The validated source set of a single endpoint: a flat list of sources
/// plus their group structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSources {
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<SourceGroup>,
}

impl EndpointSources {
    #[must_use]
    pub fn new(sources: Vec<Source>, groups: Vec<SourceGroup>) -> Self {
        Self { sources, groups }
    }

    #[must_use]
    pub fn from_sources(sources: Vec<Source>) -> Self {
        Self {
            sources,
            groups: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.groups.is_empty()
    }

    /// The flat ssrc set.
    #[must_use]
    pub fn ssrcs(&self) -> HashSet<Ssrc> {
        self.sources.iter().map(|s| s.ssrc).collect()
    }

    /// Ssrcs referenced by any group.
    #[must_use]
    pub fn grouped_ssrcs(&self) -> HashSet<Ssrc> {
        self.groups
            .iter()
            .flat_map(|g| g.ssrcs.iter().copied())
            .collect()
    }

    /// Whether any source of the given bridge-level kind is present.
    #[must_use]
    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.sources.iter().any(|s| s.kind.bridge_kind() == kind.bridge_kind())
    }

    /// Whether the same ssrc appears twice in the flat list.
    #[must_use]
    pub fn has_duplicates(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.sources.len());
        self.sources.iter().any(|s| !seen.insert(s.ssrc))
    }

    /// Merge another set into this one. The caller is responsible for
    /// conflict checking.
    pub fn extend(&mut self, other: EndpointSources) {
        self.sources.extend(other.sources);
        self.groups.extend(other.groups);
    }

    /// Remove the given ssrcs (and any group touching them). Returns what
    /// was actually removed.
    pub fn strip(&mut self, ssrcs: &HashSet<Ssrc>) -> EndpointSources {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.sources)
                .into_iter()
                .partition(|s| ssrcs.contains(&s.ssrc));
        self.sources = kept;

        let (removed_groups, kept_groups): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.groups)
                .into_iter()
                .partition(|g| g.ssrcs.iter().any(|s| ssrcs.contains(s)));
        self.groups = kept_groups;

        EndpointSources {
            sources: removed,
            groups: removed_groups,
        }
    }

    /// Stable, ordered rendering of the flat ssrc set; handy in logs.
    #[must_use]
    pub fn ssrc_list(&self) -> Vec<u32> {
        let ordered: BTreeSet<u32> = self.sources.iter().map(|s| s.ssrc.0).collect();
        ordered.into_iter().collect()
    }
}
