//! Space connection capability and the events it reports back.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{Bounds, Location, LocationUpdate, ObjectId, PresenceId, SpaceId};

/// Opaque renderer-owned description of how an object looks.
pub type Visual = serde_json::Value;

/// Opaque credentials handed to the space on connect.
pub type Auth = serde_json::Value;

/// Interest query parameters: the minimum solid angle (in steradians) an
/// object must subtend to be reported.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SolidAngle(pub f64);

/// Point-to-point message between two objects, routed through a space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OdpMessage {
    pub source_object: ObjectId,
    pub source_port: u32,
    pub dest_object: ObjectId,
    pub dest_port: u32,
    pub payload: Vec<u8>,
}

/// What a space knows about an object when it enters a query result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectProperties {
    pub loc: Option<Location>,
    pub bounds: Option<Bounds>,
    pub visual: Option<Visual>,
}

/// Result of a connect attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionOutcome {
    /// The space accepted the object and assigned it an identity.
    Connected {
        presence: PresenceId,
        loc: Location,
        bounds: Option<Bounds>,
        visual: Option<Visual>,
    },
    /// The space rejected the object.
    Failed { reason: String },
}

/// Callbacks from a space connection into the session manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SpaceEvent {
    ConnectionResponse {
        space: SpaceId,
        object: ObjectId,
        outcome: ConnectionOutcome,
    },
    ProxEvent {
        space: SpaceId,
        querier: ObjectId,
        observed: ObjectId,
        entered: bool,
        properties: ObjectProperties,
    },
    /// Location of `from` changed; `to` is the object being told.
    PresenceLocUpdate {
        space: SpaceId,
        from: ObjectId,
        to: ObjectId,
        update: LocationUpdate,
        visual: Option<Visual>,
    },
    ReceiveOdp {
        space: SpaceId,
        message: OdpMessage,
    },
}

/// Space connection error.
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("Session manager has shut down")]
    ChannelClosed,
}

/// Handle a space connection uses to report events.
///
/// Events are queued rather than delivered inline, so a connection never
/// re-enters the session manager while it is being called.
#[derive(Debug, Clone)]
pub struct SpaceEventSender {
    tx: mpsc::UnboundedSender<SpaceEvent>,
}

impl SpaceEventSender {
    /// Create a sender and the receiver the session manager drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SpaceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event.
    ///
    /// # Errors
    /// Returns error if the session manager is gone.
    pub fn send(&self, event: SpaceEvent) -> Result<(), SpaceError> {
        self.tx.send(event).map_err(|_| SpaceError::ChannelClosed)
    }

    /// Report the result of a connect attempt for `object`.
    ///
    /// # Errors
    /// Returns error if the session manager is gone.
    pub fn connection_response(
        &self,
        space: SpaceId,
        object: ObjectId,
        outcome: ConnectionOutcome,
    ) -> Result<(), SpaceError> {
        self.send(SpaceEvent::ConnectionResponse {
            space,
            object,
            outcome,
        })
    }

    /// Report that `observed` entered or left `querier`'s result set.
    ///
    /// # Errors
    /// Returns error if the session manager is gone.
    pub fn prox_event(
        &self,
        space: SpaceId,
        querier: ObjectId,
        observed: ObjectId,
        entered: bool,
        properties: ObjectProperties,
    ) -> Result<(), SpaceError> {
        self.send(SpaceEvent::ProxEvent {
            space,
            querier,
            observed,
            entered,
            properties,
        })
    }

    /// Report a location change of `from` to the object `to`.
    ///
    /// # Errors
    /// Returns error if the session manager is gone.
    pub fn presence_loc_update(
        &self,
        space: SpaceId,
        from: ObjectId,
        to: ObjectId,
        update: LocationUpdate,
        visual: Option<Visual>,
    ) -> Result<(), SpaceError> {
        self.send(SpaceEvent::PresenceLocUpdate {
            space,
            from,
            to,
            update,
            visual,
        })
    }

    /// Deliver an ODP message addressed to a local object.
    ///
    /// # Errors
    /// Returns error if the session manager is gone.
    pub fn receive_odp(&self, space: SpaceId, message: OdpMessage) -> Result<(), SpaceError> {
        self.send(SpaceEvent::ReceiveOdp { space, message })
    }
}

/// One physical session to one space, shared by every local object in it.
///
/// Calls are fire-and-forget: results come back later through the
/// [`SpaceEventSender`] the connection was built with. Implementations own
/// the wire protocol, retries and authentication.
pub trait SpaceConnection: Send {
    /// Space this connection talks to.
    fn space(&self) -> &SpaceId;

    /// Ask the space to admit `object`, identified by its temporary id.
    fn connect_object(&mut self, object: ObjectId, auth: Option<&Auth>, visual: Option<&Visual>);

    /// Tear down the session of a connected object.
    fn disconnect_object(&mut self, object: ObjectId);

    fn send_odp_message(&mut self, message: OdpMessage);

    fn register_prox_query(&mut self, object: ObjectId, query: SolidAngle);

    fn loc_update_request(
        &mut self,
        object: ObjectId,
        update: &LocationUpdate,
        visual: Option<&Visual>,
    );

    fn subscribe(&mut self, object: ObjectId, observed: ObjectId);

    fn unsubscribe(&mut self, object: ObjectId, observed: ObjectId);
}

/// Builds a connection for a space the session manager has not seen before.
pub type SpaceConnectionFactory =
    Box<dyn Fn(&SpaceId, SpaceEventSender) -> Box<dyn SpaceConnection> + Send + Sync>;
