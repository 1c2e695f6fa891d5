//! Messages exchanged between a script and its hosted object.
//!
//! Every message is a flat record with a short `__type` discriminant. Types
//! are structured on both sides of the channel, so nothing needs to be
//! re-parsed after transit; JSON is only involved when a transport frames
//! messages as text (see [`crate::dispatch`]).

use kata_core::{
    Auth, Bounds, Location, LocationUpdate, ObjectId, OdpMessage, SolidAngle, SpaceId, Visual,
};
use serde::{Deserialize, Serialize};

use crate::{dispatch::Tagged, graphics::GraphicsMessage};

/// Wire discriminants.
pub mod tags {
    pub const CONNECT: &str = "fcon";
    pub const DISCONNECT: &str = "fdis";
    pub const SEND_ODP_MESSAGE: &str = "fodp";
    pub const LOCATION: &str = "floc";
    pub const VISUAL: &str = "fvis";
    pub const QUERY: &str = "fque";
    pub const SUBSCRIPTION: &str = "fsub";
    pub const CREATE_OBJECT: &str = "fcre";
    pub const GRAPHICS: &str = "fgfm";

    pub const CONNECTED: &str = "tcon";
    pub const CONNECTION_FAILED: &str = "tfyl";
    pub const DISCONNECTED: &str = "tdis";
    pub const RECEIVE_ODP_MESSAGE: &str = "todp";
    pub const QUERY_EVENT: &str = "tque";
    pub const PRESENCE_LOC_UPDATE: &str = "tloc";

    pub const FROM_SCRIPT: &[&str] = &[
        CONNECT,
        DISCONNECT,
        SEND_ODP_MESSAGE,
        LOCATION,
        VISUAL,
        QUERY,
        SUBSCRIPTION,
        CREATE_OBJECT,
        GRAPHICS,
    ];

    pub const TO_SCRIPT: &[&str] = &[
        CONNECTED,
        CONNECTION_FAILED,
        DISCONNECTED,
        RECEIVE_ODP_MESSAGE,
        QUERY_EVENT,
        PRESENCE_LOC_UPDATE,
    ];
}

/// Message from a script to its hosted object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__type")]
pub enum FromScript {
    /// Request a presence in `space`.
    #[serde(rename = "fcon")]
    Connect {
        space: SpaceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<Auth>,
        #[serde(flatten)]
        loc: LocationUpdate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        visual: Option<Visual>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<SolidAngle>,
    },
    #[serde(rename = "fdis")]
    Disconnect { space: SpaceId, id: ObjectId },
    #[serde(rename = "fodp")]
    SendOdpMessage {
        space: SpaceId,
        source_object: ObjectId,
        source_port: u32,
        dest_object: ObjectId,
        dest_port: u32,
        #[serde(with = "payload")]
        payload: Vec<u8>,
    },
    /// Location update request. Any subset of fields may be present.
    #[serde(rename = "floc")]
    Location {
        space: SpaceId,
        id: ObjectId,
        #[serde(flatten)]
        loc: LocationUpdate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vis: Option<Visual>,
    },
    #[serde(rename = "fvis")]
    Visual {
        space: SpaceId,
        id: ObjectId,
        vis: Visual,
    },
    #[serde(rename = "fque")]
    Query {
        space: SpaceId,
        id: ObjectId,
        sa: SolidAngle,
    },
    #[serde(rename = "fsub")]
    Subscription {
        space: SpaceId,
        id: ObjectId,
        observed: ObjectId,
        enable: bool,
    },
    /// Ask the object host to instantiate another object.
    #[serde(rename = "fcre")]
    CreateObject {
        script: String,
        constructor: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    /// Renderer command; passed through untouched.
    #[serde(rename = "fgfm")]
    Graphics(GraphicsMessage),
}

impl FromScript {
    /// Build a `SendOdpMessage` for `message` in `space`.
    #[must_use]
    pub fn odp(space: SpaceId, message: OdpMessage) -> Self {
        let OdpMessage {
            source_object,
            source_port,
            dest_object,
            dest_port,
            payload,
        } = message;
        Self::SendOdpMessage {
            space,
            source_object,
            source_port,
            dest_object,
            dest_port,
            payload,
        }
    }

    /// Space this message is scoped to, if any.
    #[must_use]
    pub const fn space(&self) -> Option<&SpaceId> {
        match self {
            Self::Connect { space, .. }
            | Self::Disconnect { space, .. }
            | Self::SendOdpMessage { space, .. }
            | Self::Location { space, .. }
            | Self::Visual { space, .. }
            | Self::Query { space, .. }
            | Self::Subscription { space, .. } => Some(space),
            Self::CreateObject { .. } | Self::Graphics(_) => None,
        }
    }
}

impl Tagged for FromScript {
    fn tag(&self) -> &'static str {
        match self {
            Self::Connect { .. } => tags::CONNECT,
            Self::Disconnect { .. } => tags::DISCONNECT,
            Self::SendOdpMessage { .. } => tags::SEND_ODP_MESSAGE,
            Self::Location { .. } => tags::LOCATION,
            Self::Visual { .. } => tags::VISUAL,
            Self::Query { .. } => tags::QUERY,
            Self::Subscription { .. } => tags::SUBSCRIPTION,
            Self::CreateObject { .. } => tags::CREATE_OBJECT,
            Self::Graphics(_) => tags::GRAPHICS,
        }
    }

    fn known_tags() -> &'static [&'static str] {
        tags::FROM_SCRIPT
    }
}

/// Message from a hosted object to its script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__type")]
pub enum ToScript {
    #[serde(rename = "tcon")]
    Connected {
        space: SpaceId,
        id: ObjectId,
        loc: Location,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bounds: Option<Bounds>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        visual: Option<Visual>,
    },
    #[serde(rename = "tfyl")]
    ConnectionFailed {
        space: SpaceId,
        object: ObjectId,
        reason: String,
    },
    #[serde(rename = "tdis")]
    Disconnected { space: SpaceId },
    #[serde(rename = "todp")]
    ReceiveOdpMessage {
        space: SpaceId,
        source_object: ObjectId,
        source_port: u32,
        dest_object: ObjectId,
        dest_port: u32,
        #[serde(with = "payload")]
        payload: Vec<u8>,
    },
    /// `observed` entered or left the interest set of this script's presence.
    #[serde(rename = "tque")]
    QueryEvent {
        space: SpaceId,
        observed: ObjectId,
        entered: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loc: Option<Location>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bounds: Option<Bounds>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        visual: Option<Visual>,
    },
    #[serde(rename = "tloc")]
    PresenceLocUpdate {
        space: SpaceId,
        observed: ObjectId,
        loc: LocationUpdate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        visual: Option<Visual>,
    },
}

impl ToScript {
    /// Build a `ReceiveOdpMessage` for `message` arriving in `space`.
    #[must_use]
    pub fn receive_odp(space: SpaceId, message: OdpMessage) -> Self {
        let OdpMessage {
            source_object,
            source_port,
            dest_object,
            dest_port,
            payload,
        } = message;
        Self::ReceiveOdpMessage {
            space,
            source_object,
            source_port,
            dest_object,
            dest_port,
            payload,
        }
    }

    #[must_use]
    pub const fn space(&self) -> &SpaceId {
        match self {
            Self::Connected { space, .. }
            | Self::ConnectionFailed { space, .. }
            | Self::Disconnected { space }
            | Self::ReceiveOdpMessage { space, .. }
            | Self::QueryEvent { space, .. }
            | Self::PresenceLocUpdate { space, .. } => space,
        }
    }
}

impl Tagged for ToScript {
    fn tag(&self) -> &'static str {
        match self {
            Self::Connected { .. } => tags::CONNECTED,
            Self::ConnectionFailed { .. } => tags::CONNECTION_FAILED,
            Self::Disconnected { .. } => tags::DISCONNECTED,
            Self::ReceiveOdpMessage { .. } => tags::RECEIVE_ODP_MESSAGE,
            Self::QueryEvent { .. } => tags::QUERY_EVENT,
            Self::PresenceLocUpdate { .. } => tags::PRESENCE_LOC_UPDATE,
        }
    }

    fn known_tags() -> &'static [&'static str] {
        tags::TO_SCRIPT
    }
}

/// Base64 encoding for ODP payload bytes.
mod payload {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
