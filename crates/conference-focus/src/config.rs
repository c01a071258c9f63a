//! Focus configuration.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults; `from_vars` provides the seam used by tests.

use common::types::Region;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Members required in the combined main + visitor rooms before the focus
/// starts inviting.
pub const DEFAULT_MIN_PARTICIPANTS: usize = 2;

/// Per-endpoint source budget.
pub const DEFAULT_MAX_SOURCES: usize = 50;

/// Per-endpoint source-group budget.
pub const DEFAULT_MAX_SOURCE_GROUPS: usize = 50;

/// Seconds an empty conference waits for its first member (or for a
/// breakout to appear) before stopping.
pub const DEFAULT_CONFERENCE_START_TIMEOUT_SECONDS: u64 = 15;

/// Seconds a lone participant is kept before being terminated.
pub const DEFAULT_SINGLE_PARTICIPANT_TIMEOUT_SECONDS: u64 = 20;

/// Seconds to wait for a resumable signaling connection to come back.
pub const DEFAULT_RECONNECT_TIMEOUT_SECONDS: u64 = 30;

/// Participant count at which source-signaling coalescing starts ramping.
pub const DEFAULT_SOURCE_SIGNALING_LOW: usize = 50;

/// Milliseconds of added delay per participant above the ramp start.
pub const DEFAULT_SOURCE_SIGNALING_SLOPE_MS: u64 = 10;

/// Upper bound on the coalescing delay.
pub const DEFAULT_SOURCE_SIGNALING_CAP_MS: u64 = 5_000;

/// Default per-conference soft limit on user participants before new
/// joiners are redirected to a visitor node.
pub const DEFAULT_PARTICIPANTS_SOFT_LIMIT: usize = 50;

/// Concurrency bound of the I/O pool.
pub const DEFAULT_IO_POOL_LIMIT: usize = 64;

/// Focus configuration, shared read-only across conferences.
#[derive(Debug, Clone)]
pub struct FocusConfig {
    /// Members required before the invitation sweep starts.
    pub min_participants: usize,

    /// Per-endpoint source budget.
    pub max_sources: usize,

    /// Per-endpoint source-group budget.
    pub max_source_groups: usize,

    /// Room-wide cap on distinct audio senders; `None` means unlimited.
    pub max_audio_senders: Option<usize>,

    /// Room-wide cap on distinct video senders; `None` means unlimited.
    pub max_video_senders: Option<usize>,

    /// How long an empty conference lingers before stopping.
    pub conference_start_timeout: Duration,

    /// How long a lone participant is kept.
    pub single_participant_timeout: Duration,

    /// How long to wait for signaling resumption before stopping.
    pub reconnect_timeout: Duration,

    /// Participant count at which coalescing delay starts ramping.
    pub source_signaling_low: usize,

    /// Added delay per participant above the ramp start.
    pub source_signaling_slope: Duration,

    /// Upper bound on the coalescing delay.
    pub source_signaling_cap: Duration,

    /// Whether visitor overflow is enabled globally.
    pub visitors_enabled: bool,

    /// Default soft limit on user participants per conference; rooms may
    /// override it.
    pub participants_soft_limit: usize,

    /// Codec preference list advertised in the `visitor-codecs` conference
    /// property while visitors are in use.
    pub visitor_codecs: String,

    /// Region of this focus deployment, used as the allocation default
    /// when a participant advertises none.
    pub region: Region,

    /// Whether allocations expose private bridge addresses.
    pub use_private_addresses: bool,

    /// Concurrency bound of the I/O pool.
    pub io_pool_limit: usize,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            min_participants: DEFAULT_MIN_PARTICIPANTS,
            max_sources: DEFAULT_MAX_SOURCES,
            max_source_groups: DEFAULT_MAX_SOURCE_GROUPS,
            max_audio_senders: None,
            max_video_senders: None,
            conference_start_timeout: Duration::from_secs(
                DEFAULT_CONFERENCE_START_TIMEOUT_SECONDS,
            ),
            single_participant_timeout: Duration::from_secs(
                DEFAULT_SINGLE_PARTICIPANT_TIMEOUT_SECONDS,
            ),
            reconnect_timeout: Duration::from_secs(DEFAULT_RECONNECT_TIMEOUT_SECONDS),
            source_signaling_low: DEFAULT_SOURCE_SIGNALING_LOW,
            source_signaling_slope: Duration::from_millis(DEFAULT_SOURCE_SIGNALING_SLOPE_MS),
            source_signaling_cap: Duration::from_millis(DEFAULT_SOURCE_SIGNALING_CAP_MS),
            visitors_enabled: false,
            participants_soft_limit: DEFAULT_PARTICIPANTS_SOFT_LIMIT,
            visitor_codecs: String::new(),
            region: Region::default(),
            use_private_addresses: false,
            io_pool_limit: DEFAULT_IO_POOL_LIMIT,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl FocusConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = FocusConfig::default();

        if let Some(v) = vars.get("FOCUS_MIN_PARTICIPANTS") {
            config.min_participants = parse(v, "FOCUS_MIN_PARTICIPANTS")?;
        }
        if let Some(v) = vars.get("FOCUS_MAX_SOURCES") {
            config.max_sources = parse(v, "FOCUS_MAX_SOURCES")?;
        }
        if let Some(v) = vars.get("FOCUS_MAX_SOURCE_GROUPS") {
            config.max_source_groups = parse(v, "FOCUS_MAX_SOURCE_GROUPS")?;
        }
        if let Some(v) = vars.get("FOCUS_MAX_AUDIO_SENDERS") {
            config.max_audio_senders = Some(parse(v, "FOCUS_MAX_AUDIO_SENDERS")?);
        }
        if let Some(v) = vars.get("FOCUS_MAX_VIDEO_SENDERS") {
            config.max_video_senders = Some(parse(v, "FOCUS_MAX_VIDEO_SENDERS")?);
        }
        if let Some(v) = vars.get("FOCUS_CONFERENCE_START_TIMEOUT_SECONDS") {
            config.conference_start_timeout =
                Duration::from_secs(parse(v, "FOCUS_CONFERENCE_START_TIMEOUT_SECONDS")?);
        }
        if let Some(v) = vars.get("FOCUS_SINGLE_PARTICIPANT_TIMEOUT_SECONDS") {
            config.single_participant_timeout =
                Duration::from_secs(parse(v, "FOCUS_SINGLE_PARTICIPANT_TIMEOUT_SECONDS")?);
        }
        if let Some(v) = vars.get("FOCUS_RECONNECT_TIMEOUT_SECONDS") {
            config.reconnect_timeout =
                Duration::from_secs(parse(v, "FOCUS_RECONNECT_TIMEOUT_SECONDS")?);
        }
        if let Some(v) = vars.get("FOCUS_SOURCE_SIGNALING_LOW") {
            config.source_signaling_low = parse(v, "FOCUS_SOURCE_SIGNALING_LOW")?;
        }
        if let Some(v) = vars.get("FOCUS_SOURCE_SIGNALING_SLOPE_MS") {
            config.source_signaling_slope =
                Duration::from_millis(parse(v, "FOCUS_SOURCE_SIGNALING_SLOPE_MS")?);
        }
        if let Some(v) = vars.get("FOCUS_SOURCE_SIGNALING_CAP_MS") {
            config.source_signaling_cap =
                Duration::from_millis(parse(v, "FOCUS_SOURCE_SIGNALING_CAP_MS")?);
        }
        if let Some(v) = vars.get("FOCUS_VISITORS_ENABLED") {
            config.visitors_enabled = parse_bool(v, "FOCUS_VISITORS_ENABLED")?;
        }
        if let Some(v) = vars.get("FOCUS_PARTICIPANTS_SOFT_LIMIT") {
            config.participants_soft_limit = parse(v, "FOCUS_PARTICIPANTS_SOFT_LIMIT")?;
        }
        if let Some(v) = vars.get("FOCUS_VISITOR_CODECS") {
            config.visitor_codecs = v.clone();
        }
        if let Some(v) = vars.get("FOCUS_REGION") {
            config.region = Region::new(v.clone());
        }
        if let Some(v) = vars.get("FOCUS_USE_PRIVATE_ADDRESSES") {
            config.use_private_addresses = parse_bool(v, "FOCUS_USE_PRIVATE_ADDRESSES")?;
        }
        if let Some(v) = vars.get("FOCUS_IO_POOL_LIMIT") {
            config.io_pool_limit = parse(v, "FOCUS_IO_POOL_LIMIT")?;
        }

        Ok(config)
    }

    /// Coalescing delay for a conference of the given size: zero below the
    /// ramp start, then linear, capped. Monotonically non-decreasing.
    #[must_use]
    pub fn source_signaling_delay(&self, participant_count: usize) -> Duration {
        let above = participant_count.saturating_sub(self.source_signaling_low);
        u32::try_from(above).map_or(self.source_signaling_cap, |n| {
            (self.source_signaling_slope * n).min(self.source_signaling_cap)
        })
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FocusConfig::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.min_participants, DEFAULT_MIN_PARTICIPANTS);
        assert_eq!(config.max_sources, DEFAULT_MAX_SOURCES);
        assert_eq!(config.max_audio_senders, None);
        assert_eq!(
            config.conference_start_timeout,
            Duration::from_secs(DEFAULT_CONFERENCE_START_TIMEOUT_SECONDS)
        );
        assert!(!config.visitors_enabled);
        assert_eq!(config.participants_soft_limit, DEFAULT_PARTICIPANTS_SOFT_LIMIT);
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("FOCUS_MIN_PARTICIPANTS".to_string(), "1".to_string()),
            ("FOCUS_MAX_AUDIO_SENDERS".to_string(), "2".to_string()),
            ("FOCUS_VISITORS_ENABLED".to_string(), "true".to_string()),
            ("FOCUS_REGION".to_string(), "eu-central".to_string()),
            (
                "FOCUS_SINGLE_PARTICIPANT_TIMEOUT_SECONDS".to_string(),
                "5".to_string(),
            ),
        ]);

        let config = FocusConfig::from_vars(&vars).unwrap();
        assert_eq!(config.min_participants, 1);
        assert_eq!(config.max_audio_senders, Some(2));
        assert!(config.visitors_enabled);
        assert_eq!(config.region.as_str(), "eu-central");
        assert_eq!(config.single_participant_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_value_is_rejected() {
        let vars = HashMap::from([(
            "FOCUS_MIN_PARTICIPANTS".to_string(),
            "not-a-number".to_string(),
        )]);
        assert!(matches!(
            FocusConfig::from_vars(&vars),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_signaling_delay_is_capped_linear() {
        let config = FocusConfig::default();
        assert_eq!(config.source_signaling_delay(1), Duration::ZERO);
        assert_eq!(config.source_signaling_delay(50), Duration::ZERO);
        assert_eq!(
            config.source_signaling_delay(60),
            Duration::from_millis(100)
        );
        assert_eq!(
            config.source_signaling_delay(10_000),
            Duration::from_millis(DEFAULT_SOURCE_SIGNALING_CAP_MS)
        );
        // monotone
        let mut last = Duration::ZERO;
        for n in 0..700 {
            let d = config.source_signaling_delay(n);
            assert!(d >= last);
            last = d;
        }
    }
}
