//! Shared identifiers and media model for the conference focus.

#![warn(clippy::pedantic)]

/// Module for addressing and identifier types
pub mod types;

/// Module for the media-source model
pub mod media;

/// Module for the endpoint feature vocabulary
pub mod features;

/// Module for chat-room roles
pub mod role;
