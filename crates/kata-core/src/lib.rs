//! Core abstractions for the Kata object host.
//!
//! This crate provides the fundamental building blocks:
//! - `SpaceId`, `ObjectId`, `PresenceId`, `SessionKey` - identities
//! - `Location` / `LocationUpdate` - kinematic state and dead-reckoning
//! - `Clock` - per-space time source
//! - `SpaceConnection` - capability for one physical session to a space

pub mod clock;
pub mod ids;
pub mod location;
pub mod space;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{IdError, ObjectId, PresenceId, SessionKey, SpaceId};
pub use location::{Bounds, Location, LocationUpdate, Timestamp, extrapolate, merge_update};
pub use space::{
    Auth, ConnectionOutcome, ObjectProperties, OdpMessage, SolidAngle, SpaceConnection,
    SpaceConnectionFactory, SpaceError, SpaceEvent, SpaceEventSender, Visual,
};

pub use glam::{DQuat, DVec3};
