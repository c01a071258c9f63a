//! The bridge side of the focus: selection/provisioning collaborators and
//! the per-conference session manager.

pub mod api;
pub mod sessions;

pub use api::{
    AllocationError, BridgeDescriptor, BridgeDirectory, BridgeEvent, BridgeProvisioner,
    ColibriAllocation, EndpointUpdate, ParticipantAllocation, ProvisionError,
};
pub use sessions::{BridgeSessionEvent, BridgeSessionManager};
