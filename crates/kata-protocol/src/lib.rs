//! Script <-> object host protocol.
//!
//! Provides:
//! - `FromScript` / `ToScript` - tagged message enums
//! - `GraphicsMessage` - renderer pass-through commands
//! - `Dispatch` - tag-based dispatch and JSON envelopes
//! - `channel` - paired, ordered script/host channel

pub mod channel;
pub mod dispatch;
pub mod graphics;
pub mod protocol;

pub use channel::{HostEnd, HostSender, ScriptEnd, ScriptSender, SendError};
pub use dispatch::{Dispatch, ProtocolError, Tagged, decode_envelope, dispatch_envelope, encode_envelope};
pub use graphics::GraphicsMessage;
pub use protocol::{FromScript, ToScript, tags};
