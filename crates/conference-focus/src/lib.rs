//! Conference focus: the per-conference signaling coordinator of a
//! selective-forwarding video-conferencing system.
//!
//! For each conference (identified by a multi-user chat room) the focus
//! joins the room, discovers participants, negotiates media sessions
//! between every participant and a selected bridge, tracks advertised
//! media sources, propagates source updates, enforces admission and rate
//! limits, migrates endpoints off failed bridges, and tears the room down
//! when it has outlived its usefulness.
//!
//! # Architecture
//!
//! ```text
//! FocusRegistry (process-wide directory, meeting ids, pin table)
//! └── Conference (one actor per room)
//!     ├── owns the participant table and all timeouts
//!     ├── ConferenceSources (validated conference-wide source registry)
//!     ├── BridgeSessionManager (endpoint → bridge, allocate/update/mute)
//!     └── InviteRunner (one cancelable background invite per participant)
//! ```
//!
//! The coordinator is an actor: every transition flows through a mailbox
//! consumed by a single loop, which also drains the room event channel and
//! the bridge-directory event stream. Blocking collaborator calls (bridge
//! allocation, feature discovery, visitor-room joins) run on a bounded
//! I/O pool and report back through the mailbox.
//!
//! The wire-level chat-room transport, the media-session encoding, the
//! bridge-selection heuristic and the visitor topology are collaborators
//! behind the traits in [`xmpp`], [`bridge`] and
//! [`conference::visitors`].

#![warn(clippy::pedantic)]

pub mod bridge;
pub mod conference;
pub mod config;
pub mod errors;
pub mod participant;
pub mod registry;
pub mod sources;
pub mod tasks;
pub mod xmpp;

pub use conference::{Conference, ConferenceHandle, ConferenceOptions, ConferenceSnapshot};
pub use config::FocusConfig;
pub use errors::FocusError;
pub use registry::{FocusRegistry, FocusServices};
