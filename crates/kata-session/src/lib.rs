//! Session multiplexing for the Kata object host.
//!
//! Provides:
//! - `SessionManager` - one space connection per space, many object sessions over it
//! - `HostedObject` - the manager's handle on a script
//! - `SessionConfig` / `ProtocolRegistry` - startup configuration
//! - `LoopbackSpace` - in-process `loop://` space (feature `loopback`)

pub mod config;
pub mod hosted;
#[cfg(feature = "loopback")]
pub mod loopback;
pub mod manager;

pub use config::{HostEvent, ProtocolRegistry, SessionConfig};
pub use hosted::{HostedObject, HostedObjectId};
#[cfg(feature = "loopback")]
pub use loopback::{LOOPBACK_SCHEME, LoopbackSpace};
pub use manager::{ConnectRequest, SessionError, SessionManager};
