//! Test utilities for the conference focus.
//!
//! Mock implementations of every collaborator the focus consumes, plus
//! fixtures wiring them into a [`conference_focus::FocusServices`] bundle.
//! No real signaling or bridge infrastructure is required:
//!
//! ```rust,ignore
//! use focus_test_utils::TestEnv;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let env = TestEnv::new();
//!     let registry = env.registry();
//!     let handle = registry
//!         .conference_request(env.options("room"))
//!         .await
//!         .unwrap();
//!
//!     let room = env.transport.room(&handle.room().clone()).unwrap();
//!     room.member_joins(env.presence("alice", Role::Member)).await;
//!     // drive the scenario through the mocks...
//! }
//! ```

#![warn(clippy::pedantic)]

pub mod fixtures;
pub mod mock_bridge;
pub mod mock_room;
pub mod mock_signaling;
pub mod mock_visitors;

pub use fixtures::TestEnv;
pub use mock_bridge::{MockBridgeDirectory, MockProvisioner, ProvisionCall};
pub use mock_room::{MockRoom, MockTransport};
pub use mock_signaling::RecordingSignaling;
pub use mock_visitors::MockVisitorDirectory;
