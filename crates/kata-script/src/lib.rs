//! Script side of the Kata object host.
//!
//! Provides:
//! - `Script` - owns the script end of the channel and dispatches host messages
//! - `Presence` - this script's object in one space, with request suppression
//! - `RemotePresence` - another object seen through a query
//! - `PresenceView` - read access shared by both kinds of presence

pub mod presence;
pub mod remote_presence;
pub mod script;
pub mod view;

pub use presence::{Presence, PresenceError, PresenceStatus, QueryHandler};
pub use remote_presence::RemotePresence;
pub use script::{ConnectCallback, ConnectFailure, ConnectOptions, OdpHandler, Script, ScriptError};
pub use view::{PresenceState, PresenceView};
