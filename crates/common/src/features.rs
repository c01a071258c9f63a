//! The closed endpoint feature vocabulary.
//!
//! A participant's feature set is discovered once, at the moment the
//! participant record is created, and treated as immutable for the session.

use crate::media::MediaKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One endpoint capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    Audio,
    Video,
    Sctp,
    Rtx,
    Remb,
    Tcc,
    OpusRed,
    SourceNames,
    SsrcRewriting,
    JsonSources,
    ReceiveMultipleStreams,
    StartMuted,
    AudioMute,
}

/// An immutable snapshot of an endpoint's capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet(HashSet<Feature>);

impl FeatureSet {
    #[must_use]
    pub fn new(features: impl IntoIterator<Item = Feature>) -> Self {
        Self(features.into_iter().collect())
    }

    /// The default capability set assumed for endpoints whose discovery
    /// failed: plain audio+video without extensions.
    #[must_use]
    pub fn assumed() -> Self {
        Self::new([Feature::Audio, Feature::Video])
    }

    #[must_use]
    pub fn contains(&self, feature: Feature) -> bool {
        self.0.contains(&feature)
    }

    /// Whether this endpoint sends or receives the given bridge-level kind.
    #[must_use]
    pub fn supports_kind(&self, kind: MediaKind) -> bool {
        match kind.bridge_kind() {
            MediaKind::Audio => self.contains(Feature::Audio),
            _ => self.contains(Feature::Video),
        }
    }

    /// The media kinds to request on the bridge for this endpoint. Data
    /// (sctp) is not a media kind and is handled separately in the offer.
    #[must_use]
    pub fn media_kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.contains(Feature::Audio) {
            kinds.push(MediaKind::Audio);
        }
        if self.contains(Feature::Video) {
            kinds.push(MediaKind::Video);
        }
        kinds
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<T: IntoIterator<Item = Feature>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
