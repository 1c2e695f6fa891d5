//! Script side of the object host boundary.
//!
//! A [`Script`] owns one end of the script/host channel. It turns host
//! messages into presence state changes and callbacks, and offers the
//! calls a script makes that are not tied to a single presence.

use std::{collections::HashMap, sync::Arc, time::Duration};

use kata_core::{
    Auth, Bounds, Clock, DVec3, Location, LocationUpdate, ObjectId, OdpMessage, SessionKey,
    SolidAngle, SpaceId, SystemClock, Visual,
};
use kata_protocol::{Dispatch, FromScript, ScriptEnd, ScriptSender, SendError, ToScript};
use tokio::sync::mpsc;

use crate::{
    presence::{Presence, PresenceError},
    remote_presence::RemotePresence,
    view::{PresenceState, PresenceView},
};

/// Script error.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Not supported: {0}")]
    NotSupported(&'static str),
    #[error("Script channel closed")]
    ChannelClosed,
    #[error("No presence in space {0}")]
    UnknownSpace(SpaceId),
    #[error(transparent)]
    Presence(#[from] PresenceError),
}

impl From<SendError> for ScriptError {
    fn from(_: SendError) -> Self {
        Self::ChannelClosed
    }
}

/// A connect attempt the space turned down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFailure {
    pub space: SpaceId,
    pub reason: String,
}

/// Receives the new presence, or the reason there is none.
pub type ConnectCallback = Box<dyn FnOnce(Result<&mut Presence, ConnectFailure>) + Send>;

/// Receives ODP messages arriving on a bound port.
pub type OdpHandler = Box<dyn FnMut(&OdpMessage) + Send>;

/// Optional parts of a connect request.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub auth: Option<Auth>,
    pub loc: LocationUpdate,
    pub visual: Option<Visual>,
    pub query: Option<SolidAngle>,
}

struct PendingConnect {
    query: Option<SolidAngle>,
    callback: ConnectCallback,
}

/// The controlling logic's view of its object.
pub struct Script {
    sender: ScriptSender,
    receiver: mpsc::UnboundedReceiver<ToScript>,
    clock: Arc<dyn Clock>,
    presences: HashMap<SpaceId, Presence>,
    remote_presences: HashMap<SessionKey, RemotePresence>,
    connect_requests: HashMap<SpaceId, PendingConnect>,
    odp_ports: HashMap<(SessionKey, u32), OdpHandler>,
}

impl Script {
    #[must_use]
    pub fn new(end: ScriptEnd) -> Self {
        Self::with_clock(end, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(end: ScriptEnd, clock: Arc<dyn Clock>) -> Self {
        let (sender, receiver) = end.into_parts();
        Self {
            sender,
            receiver,
            clock,
            presences: HashMap::new(),
            remote_presences: HashMap::new(),
            connect_requests: HashMap::new(),
            odp_ports: HashMap::new(),
        }
    }

    /// Ask for a presence in `space`. `callback` runs once the host answers.
    ///
    /// # Errors
    /// Returns error if the channel is closed.
    pub fn connect<F>(
        &mut self,
        space: SpaceId,
        auth: Option<Auth>,
        callback: F,
    ) -> Result<(), ScriptError>
    where
        F: FnOnce(Result<&mut Presence, ConnectFailure>) + Send + 'static,
    {
        let options = ConnectOptions {
            auth,
            ..ConnectOptions::default()
        };
        self.connect_with(space, options, callback)
    }

    /// Like [`connect`](Self::connect), also requesting an initial location,
    /// visual and query.
    ///
    /// # Errors
    /// Returns error if the channel is closed.
    pub fn connect_with<F>(
        &mut self,
        space: SpaceId,
        options: ConnectOptions,
        callback: F,
    ) -> Result<(), ScriptError>
    where
        F: FnOnce(Result<&mut Presence, ConnectFailure>) + Send + 'static,
    {
        let ConnectOptions {
            auth,
            loc,
            visual,
            query,
        } = options;
        self.sender.send(FromScript::Connect {
            space: space.clone(),
            auth,
            loc,
            visual,
            query,
        })?;
        let pending = PendingConnect {
            query,
            callback: Box::new(callback),
        };
        if self.connect_requests.insert(space.clone(), pending).is_some() {
            tracing::warn!(space = %space, "Replacing pending connect request");
        }
        Ok(())
    }

    /// Ask the object host to start another object.
    ///
    /// # Errors
    /// Returns error if the channel is closed.
    pub fn create_object(
        &self,
        script: impl Into<String>,
        constructor: impl Into<String>,
        args: serde_json::Value,
    ) -> Result<(), ScriptError> {
        Ok(self.sender.send(FromScript::CreateObject {
            script: script.into(),
            constructor: constructor.into(),
            args,
        })?)
    }

    /// Deliver ODP messages sent to `port` of this script's presence in
    /// `space` to `handler`. Rebinding a port replaces its handler.
    ///
    /// # Errors
    /// Returns error if there is no active presence in `space`.
    pub fn bind_odp_port<F>(&mut self, space: &SpaceId, port: u32, handler: F) -> Result<(), ScriptError>
    where
        F: FnMut(&OdpMessage) + Send + 'static,
    {
        let presence = self
            .presences
            .get(space)
            .ok_or_else(|| ScriptError::UnknownSpace(space.clone()))?;
        if !presence.is_active() {
            return Err(PresenceError::Invalidated(presence.key()).into());
        }
        self.odp_ports
            .insert((presence.key(), port), Box::new(handler));
        Ok(())
    }

    /// Returns false if nothing was bound.
    pub fn unbind_odp_port(&mut self, space: &SpaceId, port: u32) -> bool {
        let Some(presence) = self.presences.get(space) else {
            return false;
        };
        self.odp_ports.remove(&(presence.key(), port)).is_some()
    }

    /// # Errors
    /// Always returns `NotSupported`.
    pub fn timer<F>(&mut self, _period: Duration, _callback: F, _repeat: bool) -> Result<(), ScriptError>
    where
        F: FnMut() + Send + 'static,
    {
        Err(ScriptError::NotSupported("Script::timer"))
    }

    /// # Errors
    /// Always returns `NotSupported`.
    pub fn persistence_read(&mut self, _keys: &[&str]) -> Result<serde_json::Value, ScriptError> {
        Err(ScriptError::NotSupported("Script::persistence_read"))
    }

    /// # Errors
    /// Always returns `NotSupported`.
    pub fn persistence_write(&mut self, _values: serde_json::Value) -> Result<(), ScriptError> {
        Err(ScriptError::NotSupported("Script::persistence_write"))
    }

    /// Presence in `space`, including an invalidated one not yet replaced.
    #[must_use]
    pub fn presence(&self, space: &SpaceId) -> Option<&Presence> {
        self.presences.get(space)
    }

    pub fn presence_mut(&mut self, space: &SpaceId) -> Option<&mut Presence> {
        self.presences.get_mut(space)
    }

    #[must_use]
    pub fn remote_presence(&self, key: &SessionKey) -> Option<&RemotePresence> {
        self.remote_presences.get(key)
    }

    /// Remote presences currently tracked, across all spaces.
    pub fn remote_presences(&self) -> impl Iterator<Item = &RemotePresence> {
        self.remote_presences.values()
    }

    /// Dispatch every message already waiting. Returns how many there were.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.receiver.try_recv() {
            self.dispatch(msg);
            handled += 1;
        }
        handled
    }

    /// Wait for the next message and dispatch it. Returns false once the
    /// host end has hung up.
    pub async fn step(&mut self) -> bool {
        match self.receiver.recv().await {
            Some(msg) => {
                self.dispatch(msg);
                true
            }
            None => false,
        }
    }

    /// Dispatch messages until the host end hangs up.
    pub async fn run(mut self) {
        while self.step().await {}
        tracing::debug!("Script channel closed");
    }

    fn handle_connected(
        &mut self,
        space: SpaceId,
        id: ObjectId,
        loc: Location,
        bounds: Option<Bounds>,
        visual: Option<Visual>,
    ) {
        let state = PresenceState::new(space.clone(), id, loc, bounds, visual);
        let mut presence = Presence::new(state, self.sender.clone(), Arc::clone(&self.clock));
        let pending = self.connect_requests.remove(&space);
        if let Some(query) = pending.as_ref().and_then(|p| p.query) {
            presence.record_query(query);
        }

        if let Some(old) = self.presences.insert(space.clone(), presence) {
            if old.is_active() {
                tracing::warn!(space = %space, old = %old.id(), new = %id, "Replacing active presence");
            }
        }
        tracing::info!(space = %space, id = %id, "Presence connected");

        match (pending, self.presences.get_mut(&space)) {
            (Some(pending), Some(presence)) => (pending.callback)(Ok(presence)),
            _ => tracing::debug!(space = %space, "No connect callback waiting"),
        }
    }

    fn handle_connection_failed(&mut self, space: SpaceId, object: ObjectId, reason: String) {
        let Some(pending) = self.connect_requests.remove(&space) else {
            tracing::warn!(space = %space, temp_id = %object, "Connect failure with no request pending");
            return;
        };
        tracing::info!(space = %space, "Connect failed: {reason}");
        (pending.callback)(Err(ConnectFailure { space, reason }));
    }

    fn handle_disconnected(&mut self, space: &SpaceId) {
        let Some(presence) = self.presences.get_mut(space) else {
            tracing::warn!(space = %space, "Disconnect for space without a presence");
            return;
        };
        presence.invalidate();
        self.remote_presences.retain(|key, _| key.space != *space);
        self.odp_ports.retain(|(key, _), _| key.space != *space);
        tracing::info!(space = %space, "Presence invalidated");
    }

    fn handle_receive_odp(&mut self, space: SpaceId, message: &OdpMessage) {
        let key = SessionKey::new(space, message.dest_object);
        match self.odp_ports.get_mut(&(key, message.dest_port)) {
            Some(handler) => handler(message),
            None => tracing::debug!(
                dest = %message.dest_object,
                port = message.dest_port,
                "ODP message to unbound port dropped"
            ),
        }
    }

    fn handle_query_event(
        &mut self,
        space: SpaceId,
        observed: ObjectId,
        entered: bool,
        loc: Option<Location>,
        bounds: Option<Bounds>,
        visual: Option<Visual>,
    ) {
        let Some(presence) = self.presences.get_mut(&space) else {
            tracing::warn!(space = %space, "Query event for space without a presence");
            return;
        };
        let key = SessionKey::new(space.clone(), observed);

        if entered {
            let loc = loc.unwrap_or_else(|| Location::at_rest(DVec3::ZERO, presence.now()));
            if let Some(remote) = self.remote_presences.get_mut(&key) {
                tracing::warn!(key = %key, "Duplicate enter event");
                remote.update_loc(&LocationUpdate::from(loc), visual, loc.time);
                return;
            }
            let remote = RemotePresence::new(space, observed, loc, bounds, visual);
            presence.remote_presence(&remote, true);
            self.remote_presences.insert(key, remote);
        } else {
            let Some(remote) = self.remote_presences.remove(&key) else {
                tracing::warn!(key = %key, "Exit event for unknown remote presence");
                return;
            };
            presence.remote_presence(&remote, false);
        }
    }

    fn handle_presence_loc_update(
        &mut self,
        space: &SpaceId,
        observed: ObjectId,
        loc: &LocationUpdate,
        visual: Option<Visual>,
    ) {
        match self.presences.get_mut(space) {
            Some(presence) => {
                presence.handle_loc_event(observed, loc, visual, &mut self.remote_presences);
            }
            None => tracing::warn!(space = %space, "Location update for space without a presence"),
        }
    }
}

impl Dispatch for Script {
    type Message = ToScript;

    fn dispatch(&mut self, msg: ToScript) {
        match msg {
            ToScript::Connected {
                space,
                id,
                loc,
                bounds,
                visual,
            } => self.handle_connected(space, id, loc, bounds, visual),
            ToScript::ConnectionFailed {
                space,
                object,
                reason,
            } => self.handle_connection_failed(space, object, reason),
            ToScript::Disconnected { space } => self.handle_disconnected(&space),
            ToScript::ReceiveOdpMessage {
                space,
                source_object,
                source_port,
                dest_object,
                dest_port,
                payload,
            } => {
                let message = OdpMessage {
                    source_object,
                    source_port,
                    dest_object,
                    dest_port,
                    payload,
                };
                self.handle_receive_odp(space, &message);
            }
            ToScript::QueryEvent {
                space,
                observed,
                entered,
                loc,
                bounds,
                visual,
            } => self.handle_query_event(space, observed, entered, loc, bounds, visual),
            ToScript::PresenceLocUpdate {
                space,
                observed,
                loc,
                visual,
            } => self.handle_presence_loc_update(&space, observed, &loc, visual),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use kata_core::{ManualClock, Timestamp};
    use kata_protocol::{HostEnd, ProtocolError, channel, dispatch_envelope};
    use kata_session::{SessionConfig, SessionManager};

    use super::*;

    fn space() -> SpaceId {
        SpaceId::parse("loop://test/").unwrap()
    }

    fn script() -> (Script, HostEnd) {
        let (end, host) = channel::pair();
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1.0)));
        (Script::with_clock(end, clock), host)
    }

    /// Script with a connected presence in `space()`.
    fn connected_script() -> (Script, HostEnd, ObjectId) {
        let (mut script, mut host) = script();
        script.connect(space(), None, |_| {}).unwrap();
        host.try_recv();
        let id = ObjectId::random();
        script.dispatch(ToScript::Connected {
            space: space(),
            id,
            loc: Location::default(),
            bounds: None,
            visual: None,
        });
        (script, host, id)
    }

    fn query_event(observed: ObjectId, entered: bool) -> ToScript {
        ToScript::QueryEvent {
            space: space(),
            observed,
            entered,
            loc: Some(Location::at_rest(DVec3::ONE, Timestamp::from_secs(1.0))),
            bounds: None,
            visual: None,
        }
    }

    #[test]
    fn test_connect_callback_gets_presence() {
        let (mut script, mut host) = script();
        let got = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&got);

        script
            .connect_with(
                space(),
                ConnectOptions {
                    query: Some(SolidAngle(0.3)),
                    ..ConnectOptions::default()
                },
                move |result| {
                    let presence = result.unwrap();
                    *slot.lock().unwrap() = Some(presence.id());
                },
            )
            .unwrap();
        assert!(matches!(
            host.try_recv(),
            Some(FromScript::Connect { query: Some(SolidAngle(q)), .. }) if q == 0.3
        ));

        let id = ObjectId::random();
        script.dispatch(ToScript::Connected {
            space: space(),
            id,
            loc: Location::default(),
            bounds: None,
            visual: None,
        });

        assert_eq!(*got.lock().unwrap(), Some(id));
        let presence = script.presence(&space()).unwrap();
        assert_eq!(presence.id(), id);
        assert_eq!(presence.query(), Some(SolidAngle(0.3)));
    }

    #[test]
    fn test_connect_failure_reaches_callback() {
        let (mut script, _host) = script();
        let got = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&got);
        script
            .connect(space(), None, move |result| {
                *slot.lock().unwrap() = result.err();
            })
            .unwrap();

        script.dispatch(ToScript::ConnectionFailed {
            space: space(),
            object: ObjectId::random(),
            reason: "no room".into(),
        });

        assert_eq!(
            *got.lock().unwrap(),
            Some(ConnectFailure {
                space: space(),
                reason: "no room".into()
            })
        );
        assert!(script.presence(&space()).is_none());
    }

    #[test]
    fn test_disconnect_invalidates_until_replaced() {
        let (mut script, mut host, id) = connected_script();

        script.presence_mut(&space()).unwrap().disconnect().unwrap();
        assert!(matches!(host.try_recv(), Some(FromScript::Disconnect { id: d, .. }) if d == id));
        assert!(script.presence(&space()).unwrap().is_active());

        script.dispatch(ToScript::Disconnected { space: space() });
        let presence = script.presence_mut(&space()).unwrap();
        assert!(!presence.is_active());
        assert!(matches!(
            presence.set_position(DVec3::ONE),
            Err(PresenceError::Invalidated(_))
        ));

        script.connect(space(), None, |_| {}).unwrap();
        let new_id = ObjectId::random();
        script.dispatch(ToScript::Connected {
            space: space(),
            id: new_id,
            loc: Location::default(),
            bounds: None,
            visual: None,
        });
        let presence = script.presence(&space()).unwrap();
        assert!(presence.is_active());
        assert_eq!(presence.id(), new_id);
    }

    #[test]
    fn test_query_events_track_remote_presences() {
        let (mut script, _host, _) = connected_script();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        script
            .presence_mut(&space())
            .unwrap()
            .set_query_handler(move |remote, added| log.lock().unwrap().push((remote.id(), added)))
            .unwrap();

        let other = ObjectId::random();
        let key = SessionKey::new(space(), other);

        script.dispatch(query_event(other, true));
        script.dispatch(query_event(other, true));
        assert_eq!(script.remote_presences().count(), 1);
        assert_eq!(script.remote_presence(&key).unwrap().location().pos, DVec3::ONE);

        script.dispatch(query_event(other, false));
        assert!(script.remote_presence(&key).is_none());

        script.dispatch(query_event(other, false));

        assert_eq!(*seen.lock().unwrap(), vec![(other, true), (other, false)]);
    }

    #[test]
    fn test_loc_updates_for_self_and_remote() {
        let (mut script, _host, id) = connected_script();
        let other = ObjectId::random();
        script.dispatch(query_event(other, true));

        let update = LocationUpdate {
            vel: Some(DVec3::Z),
            time: Some(Timestamp::from_secs(1.0)),
            ..LocationUpdate::default()
        };
        for observed in [id, other, ObjectId::random()] {
            script.dispatch(ToScript::PresenceLocUpdate {
                space: space(),
                observed,
                loc: update,
                visual: None,
            });
        }

        assert_eq!(script.presence(&space()).unwrap().velocity(), DVec3::Z);
        let remote = script.remote_presence(&SessionKey::new(space(), other)).unwrap();
        assert_eq!(remote.velocity(), DVec3::Z);
        assert_eq!(remote.location().pos, DVec3::ONE);
    }

    #[test]
    fn test_odp_ports() {
        let (mut script, _host, id) = connected_script();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&received);
        script
            .bind_odp_port(&space(), 7, move |msg| log.lock().unwrap().push(msg.payload.clone()))
            .unwrap();

        for port in [7, 8] {
            script.dispatch(ToScript::ReceiveOdpMessage {
                space: space(),
                source_object: ObjectId::random(),
                source_port: 1,
                dest_object: id,
                dest_port: port,
                payload: vec![u8::try_from(port).unwrap()],
            });
        }

        assert_eq!(*received.lock().unwrap(), vec![vec![7]]);
        assert!(script.unbind_odp_port(&space(), 7));
        assert!(!script.unbind_odp_port(&space(), 7));
        assert!(matches!(
            script.bind_odp_port(&SpaceId::parse("loop://elsewhere/").unwrap(), 1, |_| {}),
            Err(ScriptError::UnknownSpace(_))
        ));
    }

    #[test]
    fn test_unsupported_features() {
        let (mut script, _host) = script();
        assert!(matches!(
            script.timer(Duration::from_secs(1), || {}, true),
            Err(ScriptError::NotSupported(_))
        ));
        assert!(matches!(
            script.persistence_read(&["score"]),
            Err(ScriptError::NotSupported(_))
        ));
        assert!(matches!(
            script.persistence_write(serde_json::json!({ "score": 1 })),
            Err(ScriptError::NotSupported(_))
        ));
    }

    #[test]
    fn test_unknown_envelope_not_dispatched() {
        let (mut script, _host, _) = connected_script();
        let err = dispatch_envelope(&mut script, r#"{"__type":"tzzz","space":"loop://test/"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(ref t) if t == "tzzz"));
        assert!(script.presence(&space()).unwrap().is_active());
    }

    #[test]
    fn test_create_object_message() {
        let (script, mut host) = script();
        script
            .create_object("bot.js", "Bot", serde_json::json!([1, 2]))
            .unwrap();
        assert!(matches!(
            host.try_recv(),
            Some(FromScript::CreateObject { constructor, .. }) if constructor == "Bot"
        ));
    }

    #[test]
    fn test_pending_messages_processed_in_order() {
        let (mut script, host) = script();
        script.connect(space(), None, |_| {}).unwrap();
        let id = ObjectId::random();
        let to_script = host.sender();
        to_script
            .send(ToScript::Connected {
                space: space(),
                id,
                loc: Location::default(),
                bounds: None,
                visual: None,
            })
            .unwrap();
        to_script.send(ToScript::Disconnected { space: space() }).unwrap();

        assert_eq!(script.process_pending(), 2);
        assert!(!script.presence(&space()).unwrap().is_active());
    }

    #[tokio::test]
    async fn test_two_scripts_over_loopback() {
        let mut manager = SessionManager::new(SessionConfig::with_loopback());
        let (end_a, host_a) = channel::pair();
        let (end_b, host_b) = channel::pair();
        manager.attach(host_a);
        manager.attach(host_b);
        let mut a = Script::new(end_a);
        let mut b = Script::new(end_b);
        let runner = tokio::spawn(manager.run());

        a.connect_with(
            space(),
            ConnectOptions {
                query: Some(SolidAngle(0.1)),
                ..ConnectOptions::default()
            },
            |_| {},
        )
        .unwrap();
        assert!(a.step().await);
        let a_id = a.presence(&space()).unwrap().id();

        b.connect(space(), None, |_| {}).unwrap();
        assert!(b.step().await);
        let b_id = b.presence(&space()).unwrap().id();

        // a's query sees b arrive.
        assert!(a.step().await);
        assert!(a.remote_presence(&SessionKey::new(space(), b_id)).is_some());

        let inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inbox);
        b.bind_odp_port(&space(), 9, move |msg| sink.lock().unwrap().push(msg.clone()))
            .unwrap();
        a.presence_mut(&space())
            .unwrap()
            .send_odp_message(b_id, 9, 9, b"hello".to_vec())
            .unwrap();
        assert!(b.step().await);
        {
            let inbox = inbox.lock().unwrap();
            assert_eq!(inbox.len(), 1);
            assert_eq!(inbox[0].payload, b"hello");
            assert_eq!(inbox[0].source_object, a_id);
            assert_eq!(inbox[0].dest_port, 9);
        }

        b.presence_mut(&space()).unwrap().set_position(DVec3::X).unwrap();
        // Self echo for b, update for a's tracked remote.
        assert!(b.step().await);
        assert!(a.step().await);
        let remote = a.remote_presence(&SessionKey::new(space(), b_id)).unwrap();
        assert_eq!(remote.location().pos, DVec3::X);
        assert_ne!(a_id, b_id);

        drop(a);
        drop(b);
        runner.await.unwrap();
    }
}
