//! Collaborator interfaces toward the signaling realm.
//!
//! The wire-level chat-room transport, presence encoding and media-session
//! negotiation encoding live outside this crate; these modules define the
//! traits and event types the focus consumes, in the shape the coordinator
//! needs them.

pub mod jingle;
pub mod presence;
pub mod room;

pub use presence::MemberPresence;
pub use room::{ChatRoom, RoomEvent, SignalingTransport, TransportError};
