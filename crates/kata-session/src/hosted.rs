//! Host-side stand-in for a script.

use std::fmt;

use kata_core::{
    Bounds, Location, LocationUpdate, ObjectId, ObjectProperties, OdpMessage, SpaceId, Visual,
};
use kata_protocol::{HostSender, ToScript};
use uuid::Uuid;

/// Identifies one attached script within this object host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostedObjectId(Uuid);

impl HostedObjectId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HostedObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HostedObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An object hosted here, as the session manager sees it.
///
/// Turns session events into [`ToScript`] messages on the script's channel.
/// Cheap to clone; every session the object holds points at the same script.
#[derive(Debug, Clone)]
pub struct HostedObject {
    id: HostedObjectId,
    to_script: HostSender,
}

impl HostedObject {
    #[must_use]
    pub fn new(to_script: HostSender) -> Self {
        Self {
            id: HostedObjectId::new(),
            to_script,
        }
    }

    #[must_use]
    pub const fn id(&self) -> HostedObjectId {
        self.id
    }

    /// False once the script has hung up.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.to_script.is_closed()
    }

    fn deliver(&self, msg: ToScript) -> bool {
        if self.to_script.send(msg).is_err() {
            tracing::warn!(object = %self.id, "Script channel closed; dropping message");
            return false;
        }
        true
    }

    pub(crate) fn connected(
        &self,
        space: SpaceId,
        id: ObjectId,
        loc: Location,
        bounds: Option<Bounds>,
        visual: Option<Visual>,
    ) -> bool {
        self.deliver(ToScript::Connected {
            space,
            id,
            loc,
            bounds,
            visual,
        })
    }

    pub(crate) fn connection_failed(&self, space: SpaceId, object: ObjectId, reason: String) -> bool {
        self.deliver(ToScript::ConnectionFailed {
            space,
            object,
            reason,
        })
    }

    pub(crate) fn disconnected(&self, space: SpaceId) -> bool {
        self.deliver(ToScript::Disconnected { space })
    }

    pub(crate) fn receive_odp_message(&self, space: SpaceId, message: OdpMessage) -> bool {
        self.deliver(ToScript::receive_odp(space, message))
    }

    pub(crate) fn prox_event(
        &self,
        space: SpaceId,
        observed: ObjectId,
        entered: bool,
        properties: ObjectProperties,
    ) -> bool {
        let ObjectProperties {
            loc,
            bounds,
            visual,
        } = properties;
        self.deliver(ToScript::QueryEvent {
            space,
            observed,
            entered,
            loc,
            bounds,
            visual,
        })
    }

    pub(crate) fn presence_loc_update(
        &self,
        space: SpaceId,
        observed: ObjectId,
        loc: LocationUpdate,
        visual: Option<Visual>,
    ) -> bool {
        self.deliver(ToScript::PresenceLocUpdate {
            space,
            observed,
            loc,
            visual,
        })
    }
}
