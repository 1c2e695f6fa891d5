//! Session manager: multiplexes object sessions over space connections.
//!
//! The manager keeps as few space connections as possible, one per space URL,
//! and presents each hosted object with what looks like a dedicated session.
//! All table mutation happens through `&mut self` from one dispatch loop, so
//! every re-key or removal is atomic with respect to message handling.

use std::{
    collections::{HashMap, hash_map::Entry},
    pin::Pin,
};

use kata_core::{
    Auth, ConnectionOutcome, IdError, LocationUpdate, ObjectId, ObjectProperties, OdpMessage,
    SessionKey, SolidAngle, SpaceConnection, SpaceEvent, SpaceEventSender, SpaceId, Visual,
};
use kata_protocol::{FromScript, HostEnd, HostSender, Tagged};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt, StreamMap, wrappers::UnboundedReceiverStream};

use crate::{
    config::{HostEvent, SessionConfig},
    hosted::{HostedObject, HostedObjectId},
};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Unknown space protocol: {0}")]
    UnknownProtocol(String),
    #[error("Unknown object {object} in space {space}")]
    UnknownObject { space: SpaceId, object: ObjectId },
    #[error("No connection to space {0}")]
    UnknownSpace(SpaceId),
    #[error(transparent)]
    InvalidSpace(#[from] IdError),
    #[error("Unknown hosted object: {0}")]
    UnknownHostedObject(HostedObjectId),
    #[error("Script channel closed for hosted object {0}")]
    ChannelClosed(HostedObjectId),
}

impl SessionError {
    /// Whether this error reflects a configuration defect rather than a
    /// routing race. Only fatal errors abort the operation loudly; the rest
    /// are expected while objects connect, migrate and disconnect.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownProtocol(_))
    }
}

/// Parameters of a connect request.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub space: SpaceId,
    /// Initial location to request once connected.
    pub loc: LocationUpdate,
    pub visual: Option<Visual>,
    /// Interest query to register once connected.
    pub query: Option<SolidAngle>,
}

impl ConnectRequest {
    #[must_use]
    pub fn new(space: SpaceId) -> Self {
        Self {
            space,
            loc: LocationUpdate::default(),
            visual: None,
            query: None,
        }
    }

    /// Request for the space named by `url`.
    ///
    /// # Errors
    /// Returns `InvalidSpace` if `url` is not a valid space URL.
    pub fn parse(url: &str) -> Result<Self, SessionError> {
        Ok(Self::new(SpaceId::parse(url)?))
    }
}

struct SessionEntry {
    object: HostedObject,
    /// Set while the entry is keyed by a temporary id.
    pending: Option<ConnectRequest>,
}

/// Messages from one attached script, then a single `None` once it hangs up.
type ScriptStream = Pin<Box<dyn Stream<Item = Option<FromScript>> + Send>>;

/// Session manager.
pub struct SessionManager {
    config: SessionConfig,
    space_connections: HashMap<SpaceId, Box<dyn SpaceConnection>>,
    objects: HashMap<SessionKey, SessionEntry>,
    hosted: HashMap<HostedObjectId, HostedObject>,
    scripts: StreamMap<HostedObjectId, ScriptStream>,
    space_events: SpaceEventSender,
    space_rx: mpsc::UnboundedReceiver<SpaceEvent>,
}

impl SessionManager {
    /// Create a new session manager.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let (space_events, space_rx) = SpaceEventSender::channel();
        Self {
            config,
            space_connections: HashMap::new(),
            objects: HashMap::new(),
            hosted: HashMap::new(),
            scripts: StreamMap::new(),
            space_events,
            space_rx,
        }
    }

    /// Register an object whose script listens on `to_script`.
    ///
    /// Messages from the script must be fed to
    /// [`handle_script_message`](Self::handle_script_message) by the caller;
    /// use [`attach`](Self::attach) to have [`run`](Self::run) do it.
    pub fn host_object(&mut self, to_script: HostSender) -> HostedObject {
        let object = HostedObject::new(to_script);
        self.hosted.insert(object.id(), object.clone());
        object
    }

    /// Register an object and route its script's messages through [`run`](Self::run).
    pub fn attach(&mut self, host: HostEnd) -> HostedObject {
        let (to_script, from_script) = host.into_parts();
        let object = self.host_object(to_script);
        let stream = UnboundedReceiverStream::new(from_script)
            .map(Some)
            .chain(tokio_stream::once(None));
        self.scripts.insert(object.id(), Box::pin(stream));
        object
    }

    /// Forget hosted object `id` and tear down every session it owns.
    ///
    /// Connected sessions are disconnected from their spaces and pending
    /// connects are dropped. The script is not notified. Returns how many
    /// sessions were dropped.
    ///
    /// # Errors
    /// Returns `UnknownHostedObject` if `id` is not hosted here.
    pub fn release_object(&mut self, id: HostedObjectId) -> Result<usize, SessionError> {
        if self.hosted.remove(&id).is_none() {
            tracing::warn!(object = %id, "Release of unknown hosted object");
            return Err(SessionError::UnknownHostedObject(id));
        }
        self.scripts.remove(&id);

        let owned: Vec<SessionKey> = self
            .objects
            .iter()
            .filter(|(_, entry)| entry.object.id() == id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &owned {
            let pending = self
                .objects
                .remove(key)
                .is_some_and(|entry| entry.pending.is_some());
            if pending {
                tracing::debug!(space = %key.space, object = %key.object, "Dropping pending connect");
                continue;
            }
            match self.space_connections.get_mut(&key.space) {
                Some(conn) => conn.disconnect_object(key.object),
                None => tracing::warn!(space = %key.space, "Release for space without a connection"),
            }
        }
        tracing::info!(object = %id, sessions = owned.len(), "Hosted object released");
        Ok(owned.len())
    }

    /// Attempt to connect `object` to the space named in `request`.
    ///
    /// Returns the temporary id the object is tracked under until the space
    /// answers through [`connection_response`](Self::connection_response).
    ///
    /// # Errors
    /// Returns `UnknownProtocol` if no handler is registered for the space's
    /// scheme. The object is not registered in that case and the script is
    /// told the connect failed.
    pub fn connect(
        &mut self,
        object: &HostedObject,
        request: ConnectRequest,
        auth: Option<Auth>,
    ) -> Result<ObjectId, SessionError> {
        let temp_id = ObjectId::random();
        let space = request.space.clone();

        let conn = match self.space_connections.entry(space.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let Some(factory) = self.config.protocols.get(space.scheme()) else {
                    let err = SessionError::UnknownProtocol(space.scheme().to_string());
                    tracing::error!(space = %space, "{err}");
                    object.connection_failed(space, temp_id, err.to_string());
                    return Err(err);
                };
                tracing::info!(space = %space, "Opening space connection");
                entry.insert(factory(&space, self.space_events.clone()))
            }
        };

        let visual = request.visual.clone();
        self.objects.insert(
            SessionKey::new(space.clone(), temp_id),
            SessionEntry {
                object: object.clone(),
                pending: Some(request),
            },
        );

        tracing::debug!(space = %space, temp_id = %temp_id, "Connecting object");
        conn.connect_object(temp_id, auth.as_ref(), visual.as_ref());
        Ok(temp_id)
    }

    /// Handle the space's answer to a connect attempt.
    ///
    /// On success the object is re-keyed from `temp_id` to its assigned id
    /// in a single step. On failure the temporary entry stays in place and
    /// the script is told why.
    ///
    /// # Errors
    /// Returns error if `temp_id` is not a pending object.
    pub fn connection_response(
        &mut self,
        space: &SpaceId,
        temp_id: ObjectId,
        outcome: ConnectionOutcome,
    ) -> Result<(), SessionError> {
        let key = SessionKey::new(space.clone(), temp_id);

        match outcome {
            ConnectionOutcome::Connected {
                presence,
                loc,
                bounds,
                visual,
            } => {
                let Some(mut entry) = self.objects.remove(&key) else {
                    return Err(Self::unknown_object(space, temp_id, "connection response"));
                };
                let request = entry.pending.take();
                let object = entry.object.clone();
                self.objects.insert(presence.key(), entry);

                tracing::info!(
                    space = %space,
                    temp_id = %temp_id,
                    presence = %presence.object,
                    "Object connected"
                );

                if let Some(request) = request {
                    self.apply_connect_extras(&presence.space, presence.object, &request);
                }

                if object.connected(presence.space, presence.object, loc, bounds, visual) {
                    Ok(())
                } else {
                    Err(SessionError::ChannelClosed(object.id()))
                }
            }
            ConnectionOutcome::Failed { reason } => {
                let Some(entry) = self.objects.get(&key) else {
                    return Err(Self::unknown_object(space, temp_id, "connection response"));
                };
                tracing::info!(space = %space, temp_id = %temp_id, "Connect failed: {reason}");
                if entry.object.connection_failed(space.clone(), temp_id, reason) {
                    Ok(())
                } else {
                    Err(SessionError::ChannelClosed(entry.object.id()))
                }
            }
        }
    }

    fn apply_connect_extras(&mut self, space: &SpaceId, id: ObjectId, request: &ConnectRequest) {
        let Some(conn) = self.space_connections.get_mut(space) else {
            return;
        };
        if !request.loc.is_empty() {
            conn.loc_update_request(id, &request.loc, None);
        }
        if let Some(query) = request.query {
            conn.register_prox_query(id, query);
        }
    }

    /// Tear down the session of `id` in `space`.
    ///
    /// # Errors
    /// Returns error if the object is not known in that space.
    pub fn disconnect(&mut self, space: &SpaceId, id: ObjectId) -> Result<(), SessionError> {
        let Some(entry) = self.objects.remove(&SessionKey::new(space.clone(), id)) else {
            return Err(Self::unknown_object(space, id, "disconnect"));
        };
        match self.space_connections.get_mut(space) {
            Some(conn) => conn.disconnect_object(id),
            None => tracing::warn!(space = %space, "Disconnect for space without a connection"),
        }
        tracing::info!(space = %space, object = %id, "Object disconnected");
        if entry.object.disconnected(space.clone()) {
            Ok(())
        } else {
            Err(SessionError::ChannelClosed(entry.object.id()))
        }
    }

    /// Send an ODP message out through `space`.
    ///
    /// # Errors
    /// Returns error if there is no connection to `space`.
    pub fn send_odp_message(
        &mut self,
        space: &SpaceId,
        message: OdpMessage,
    ) -> Result<(), SessionError> {
        self.connection(space, "ODP message")?
            .send_odp_message(message);
        Ok(())
    }

    /// Deliver an ODP message that arrived from `space` to its local destination.
    ///
    /// # Errors
    /// Returns error if the destination object is not hosted here.
    pub fn receive_odp_message(
        &mut self,
        space: &SpaceId,
        message: OdpMessage,
    ) -> Result<(), SessionError> {
        let object = self.hosted_for(space, message.dest_object, "ODP delivery")?;
        if object.receive_odp_message(space.clone(), message) {
            Ok(())
        } else {
            Err(SessionError::ChannelClosed(object.id()))
        }
    }

    /// Register or update the interest query of `id`.
    ///
    /// # Errors
    /// Returns error if there is no connection to `space`.
    pub fn register_prox_query(
        &mut self,
        space: &SpaceId,
        id: ObjectId,
        query: SolidAngle,
    ) -> Result<(), SessionError> {
        self.connection(space, "proximity query")?
            .register_prox_query(id, query);
        Ok(())
    }

    /// Route a proximity event to the object that owns the query.
    ///
    /// # Errors
    /// Returns error if `querier` is not hosted here.
    pub fn prox_event(
        &mut self,
        space: &SpaceId,
        querier: ObjectId,
        observed: ObjectId,
        entered: bool,
        properties: ObjectProperties,
    ) -> Result<(), SessionError> {
        let object = self.hosted_for(space, querier, "proximity event")?;
        if object.prox_event(space.clone(), observed, entered, properties) {
            Ok(())
        } else {
            Err(SessionError::ChannelClosed(object.id()))
        }
    }

    /// Ask the space to move `id`.
    ///
    /// # Errors
    /// Returns error if there is no connection to `space`.
    pub fn loc_update_request(
        &mut self,
        space: &SpaceId,
        id: ObjectId,
        update: &LocationUpdate,
        visual: Option<&Visual>,
    ) -> Result<(), SessionError> {
        self.connection(space, "location update")?
            .loc_update_request(id, update, visual);
        Ok(())
    }

    /// Route a location update describing `from` to the object `to`.
    ///
    /// # Errors
    /// Returns error if `to` is not hosted here.
    pub fn presence_loc_update(
        &mut self,
        space: &SpaceId,
        from: ObjectId,
        to: ObjectId,
        update: LocationUpdate,
        visual: Option<Visual>,
    ) -> Result<(), SessionError> {
        let object = self.hosted_for(space, to, "location update")?;
        if object.presence_loc_update(space.clone(), from, update, visual) {
            Ok(())
        } else {
            Err(SessionError::ChannelClosed(object.id()))
        }
    }

    /// # Errors
    /// Returns error if there is no connection to `space`.
    pub fn subscribe(
        &mut self,
        space: &SpaceId,
        id: ObjectId,
        observed: ObjectId,
    ) -> Result<(), SessionError> {
        self.connection(space, "subscribe")?.subscribe(id, observed);
        Ok(())
    }

    /// # Errors
    /// Returns error if there is no connection to `space`.
    pub fn unsubscribe(
        &mut self,
        space: &SpaceId,
        id: ObjectId,
        observed: ObjectId,
    ) -> Result<(), SessionError> {
        self.connection(space, "unsubscribe")?
            .unsubscribe(id, observed);
        Ok(())
    }

    /// Handle a message from the script of hosted object `from`.
    ///
    /// Session-scoped messages are only honoured for sessions the sender owns.
    ///
    /// # Errors
    /// Returns the routing error, if any; only `UnknownProtocol` is fatal.
    pub fn handle_script_message(
        &mut self,
        from: HostedObjectId,
        msg: FromScript,
    ) -> Result<(), SessionError> {
        let Some(object) = self.hosted.get(&from).cloned() else {
            tracing::warn!(object = %from, tag = msg.tag(), "Message from unknown hosted object");
            return Err(SessionError::UnknownHostedObject(from));
        };
        tracing::trace!(object = %from, tag = msg.tag(), "Script message");

        match msg {
            FromScript::Connect {
                space,
                auth,
                loc,
                visual,
                query,
            } => {
                let request = ConnectRequest {
                    space,
                    loc,
                    visual,
                    query,
                };
                self.connect(&object, request, auth).map(|_| ())
            }
            FromScript::Disconnect { space, id } => {
                self.check_owner(from, &space, id)?;
                self.disconnect(&space, id)
            }
            FromScript::SendOdpMessage {
                space,
                source_object,
                source_port,
                dest_object,
                dest_port,
                payload,
            } => {
                self.check_owner(from, &space, source_object)?;
                self.send_odp_message(
                    &space,
                    OdpMessage {
                        source_object,
                        source_port,
                        dest_object,
                        dest_port,
                        payload,
                    },
                )
            }
            FromScript::Location { space, id, loc, vis } => {
                self.check_owner(from, &space, id)?;
                self.loc_update_request(&space, id, &loc, vis.as_ref())
            }
            FromScript::Visual { space, id, vis } => {
                self.check_owner(from, &space, id)?;
                self.loc_update_request(&space, id, &LocationUpdate::default(), Some(&vis))
            }
            FromScript::Query { space, id, sa } => {
                self.check_owner(from, &space, id)?;
                self.register_prox_query(&space, id, sa)
            }
            FromScript::Subscription {
                space,
                id,
                observed,
                enable,
            } => {
                self.check_owner(from, &space, id)?;
                if enable {
                    self.subscribe(&space, id, observed)
                } else {
                    self.unsubscribe(&space, id, observed)
                }
            }
            FromScript::CreateObject {
                script,
                constructor,
                args,
            } => {
                self.emit_host_event(HostEvent::CreateObject {
                    from,
                    script,
                    constructor,
                    args,
                });
                Ok(())
            }
            FromScript::Graphics(message) => {
                self.emit_host_event(HostEvent::Graphics { from, message });
                Ok(())
            }
        }
    }

    /// Handle a callback from a space connection.
    ///
    /// # Errors
    /// Returns the routing error, if any.
    pub fn handle_space_event(&mut self, event: SpaceEvent) -> Result<(), SessionError> {
        match event {
            SpaceEvent::ConnectionResponse {
                space,
                object,
                outcome,
            } => self.connection_response(&space, object, outcome),
            SpaceEvent::ProxEvent {
                space,
                querier,
                observed,
                entered,
                properties,
            } => self.prox_event(&space, querier, observed, entered, properties),
            SpaceEvent::PresenceLocUpdate {
                space,
                from,
                to,
                update,
                visual,
            } => self.presence_loc_update(&space, from, to, update, visual),
            SpaceEvent::ReceiveOdp { space, message } => self.receive_odp_message(&space, message),
        }
    }

    /// Handle every space event queued so far. Returns how many were handled.
    pub fn process_space_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.space_rx.try_recv() {
            // Misses are already logged where they happen.
            let _ = self.handle_space_event(event);
            handled += 1;
        }
        handled
    }

    /// Dispatch loop: handles script messages and space events one at a time
    /// until every attached script has hung up. Order is kept within each
    /// queue; when both are ready, queued space events go first. A script
    /// that hangs up has its sessions released.
    pub async fn run(mut self) {
        while !self.scripts.is_empty() {
            tokio::select! {
                biased;
                Some(event) = self.space_rx.recv() => {
                    let _ = self.handle_space_event(event);
                }
                next = self.scripts.next() => match next {
                    Some((from, Some(msg))) => {
                        if let Err(e) = self.handle_script_message(from, msg) {
                            tracing::debug!(object = %from, "Script message dropped: {e}");
                        }
                    }
                    Some((from, None)) => {
                        tracing::debug!(object = %from, "Script hung up");
                        let _ = self.release_object(from);
                    }
                    None => break,
                },
            }
        }
        self.process_space_events();
        tracing::debug!("Session manager stopped");
    }

    /// Number of distinct space connections.
    #[must_use]
    pub fn space_connection_count(&self) -> usize {
        self.space_connections.len()
    }

    #[must_use]
    pub fn has_space_connection(&self, space: &SpaceId) -> bool {
        self.space_connections.contains_key(space)
    }

    /// Hosted object registered under `key`, if any.
    #[must_use]
    pub fn object(&self, key: &SessionKey) -> Option<&HostedObject> {
        self.objects.get(key).map(|entry| &entry.object)
    }

    /// True if `key` is still waiting for a connection response.
    #[must_use]
    pub fn is_pending(&self, key: &SessionKey) -> bool {
        self.objects
            .get(key)
            .is_some_and(|entry| entry.pending.is_some())
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Sender space connections report through.
    #[must_use]
    pub fn space_event_sender(&self) -> SpaceEventSender {
        self.space_events.clone()
    }

    fn connection(
        &mut self,
        space: &SpaceId,
        what: &str,
    ) -> Result<&mut Box<dyn SpaceConnection>, SessionError> {
        self.space_connections.get_mut(space).ok_or_else(|| {
            tracing::warn!(space = %space, "Dropping {what}: no connection to space");
            SessionError::UnknownSpace(space.clone())
        })
    }

    fn hosted_for(
        &self,
        space: &SpaceId,
        id: ObjectId,
        what: &str,
    ) -> Result<HostedObject, SessionError> {
        match self.objects.get(&SessionKey::new(space.clone(), id)) {
            Some(entry) => Ok(entry.object.clone()),
            None => Err(Self::unknown_object(space, id, what)),
        }
    }

    fn check_owner(
        &self,
        from: HostedObjectId,
        space: &SpaceId,
        id: ObjectId,
    ) -> Result<(), SessionError> {
        match self.objects.get(&SessionKey::new(space.clone(), id)) {
            Some(entry) if entry.object.id() == from => Ok(()),
            Some(_) => {
                tracing::warn!(space = %space, object = %id, sender = %from, "Session owned by another object");
                Err(SessionError::UnknownObject {
                    space: space.clone(),
                    object: id,
                })
            }
            None => Err(Self::unknown_object(space, id, "script message")),
        }
    }

    fn unknown_object(space: &SpaceId, id: ObjectId, what: &str) -> SessionError {
        tracing::warn!(space = %space, object = %id, "Dropping {what} for unknown object");
        SessionError::UnknownObject {
            space: space.clone(),
            object: id,
        }
    }

    fn emit_host_event(&self, event: HostEvent) {
        match &self.config.host_events {
            Some(tx) => {
                if tx.send(event).is_err() {
                    tracing::warn!("Host event receiver closed; dropping event");
                }
            }
            None => tracing::debug!("No host event sink configured; dropping {event:?}"),
        }
    }
}
