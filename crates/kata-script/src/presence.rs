//! The locally controlled presence of a script in one space.
//!
//! A presence keeps two locations apart: the authoritative one, reconciled
//! from the space, and the requested one, which is only used to avoid
//! sending the same request twice.

use std::{collections::HashMap, fmt, sync::Arc};

use kata_core::{
    Bounds, Clock, DQuat, DVec3, Location, LocationUpdate, ObjectId, OdpMessage, SessionKey,
    SolidAngle, Timestamp, Visual, extrapolate, merge_update,
};
use kata_protocol::{FromScript, ScriptSender, SendError};

use crate::{
    remote_presence::RemotePresence,
    view::{PresenceState, PresenceView},
};

/// Presence error.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("Presence {0} has been invalidated")]
    Invalidated(SessionKey),
    #[error("Not supported: {0}")]
    NotSupported(&'static str),
    #[error("Script channel closed")]
    ChannelClosed,
}

impl From<SendError> for PresenceError {
    fn from(_: SendError) -> Self {
        Self::ChannelClosed
    }
}

/// Called with a remote presence and whether it entered (`true`) or left
/// the query's result set.
pub type QueryHandler = Box<dyn FnMut(&RemotePresence, bool) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Active,
    /// Terminal. Outbound calls fail with [`PresenceError::Invalidated`].
    Invalidated,
}

/// Read-write view of this script's object in one space.
///
/// Only created by [`Script`](crate::Script) when a connect succeeds.
pub struct Presence {
    state: PresenceState,
    requested: Location,
    query: Option<SolidAngle>,
    query_handler: Option<QueryHandler>,
    sender: ScriptSender,
    clock: Arc<dyn Clock>,
    status: PresenceStatus,
}

impl Presence {
    pub(crate) fn new(state: PresenceState, sender: ScriptSender, clock: Arc<dyn Clock>) -> Self {
        Self {
            requested: state.location,
            state,
            query: None,
            query_handler: None,
            sender,
            clock,
            status: PresenceStatus::Active,
        }
    }

    #[must_use]
    pub const fn status(&self) -> PresenceStatus {
        self.status
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == PresenceStatus::Active
    }

    /// Last location asked of the space.
    #[must_use]
    pub const fn requested_location(&self) -> &Location {
        &self.requested
    }

    /// Current time in this presence's space.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now(&self.state.space)
    }

    /// # Errors
    /// Returns error if the presence is invalidated or the channel is closed.
    pub fn set_position(&mut self, pos: DVec3) -> Result<(), PresenceError> {
        self.ensure_active()?;
        let now = self.now();
        if extrapolate(&self.requested, now).pos == pos {
            return Ok(());
        }
        self.request(LocationUpdate::motion(pos, self.velocity(), now), now)
    }

    /// # Errors
    /// Returns error if the presence is invalidated or the channel is closed.
    pub fn set_velocity(&mut self, vel: DVec3) -> Result<(), PresenceError> {
        self.ensure_active()?;
        let now = self.now();
        if self.requested.vel == vel {
            return Ok(());
        }
        self.request(LocationUpdate::motion(self.position(now), vel, now), now)
    }

    /// # Errors
    /// Returns error if the presence is invalidated or the channel is closed.
    pub fn set_orientation(&mut self, orient: DQuat) -> Result<(), PresenceError> {
        self.ensure_active()?;
        let now = self.now();
        if extrapolate(&self.requested, now).orient == orient {
            return Ok(());
        }
        let update =
            LocationUpdate::rotation(orient, self.rotational_axis(), self.angular_speed(), now);
        self.request(update, now)
    }

    /// Spin about `axis` at `speed` radians per second.
    ///
    /// # Errors
    /// Returns error if the presence is invalidated or the channel is closed.
    #[allow(clippy::float_cmp)]
    pub fn set_angular_rotation(&mut self, axis: DVec3, speed: f64) -> Result<(), PresenceError> {
        self.ensure_active()?;
        let now = self.now();
        if self.requested.ang_speed == speed && self.requested.rot_axis == axis {
            return Ok(());
        }
        let update = LocationUpdate::rotation(self.orientation(now), axis, speed, now);
        self.request(update, now)
    }

    /// Request an arbitrary partial location. Unstamped updates are stamped
    /// with the current time.
    ///
    /// # Errors
    /// Returns error if the presence is invalidated or the channel is closed.
    pub fn set_location(&mut self, update: LocationUpdate) -> Result<(), PresenceError> {
        self.ensure_active()?;
        let now = self.now();
        let at = update.time.unwrap_or(now);
        let update = update.with_time(at);
        if update.matches(&extrapolate(&self.requested, at)) {
            return Ok(());
        }
        self.request(update, now)
    }

    /// # Errors
    /// Returns error if the presence is invalidated or the channel is closed.
    pub fn set_bounds(&mut self, bounds: Bounds) -> Result<(), PresenceError> {
        self.ensure_active()?;
        let update = LocationUpdate {
            bounds: Some(bounds),
            time: Some(self.now()),
            ..LocationUpdate::default()
        };
        self.send_location(update)
    }

    /// # Errors
    /// Returns error if the presence is invalidated or the channel is closed.
    pub fn set_scale(&mut self, scale: DVec3) -> Result<(), PresenceError> {
        self.ensure_active()?;
        let update = LocationUpdate {
            scale: Some(scale),
            time: Some(self.now()),
            ..LocationUpdate::default()
        };
        self.send_location(update)
    }

    /// # Errors
    /// Returns error if the presence is invalidated or the channel is closed.
    pub fn set_visual(&mut self, visual: Visual) -> Result<(), PresenceError> {
        self.ensure_active()?;
        self.send(FromScript::Visual {
            space: self.state.space.clone(),
            id: self.state.id,
            vis: visual,
        })
    }

    #[must_use]
    pub const fn query(&self) -> Option<SolidAngle> {
        self.query
    }

    /// Register or replace this presence's interest query.
    ///
    /// # Errors
    /// Returns error if the presence is invalidated or the channel is closed.
    pub fn set_query(&mut self, query: SolidAngle) -> Result<(), PresenceError> {
        self.ensure_active()?;
        self.query = Some(query);
        self.send(FromScript::Query {
            space: self.state.space.clone(),
            id: self.state.id,
            sa: query,
        })
    }

    /// Called with each remote presence the query reports entering or leaving.
    ///
    /// # Errors
    /// Returns error if the presence is invalidated.
    pub fn set_query_handler<F>(&mut self, handler: F) -> Result<(), PresenceError>
    where
        F: FnMut(&RemotePresence, bool) + Send + 'static,
    {
        self.ensure_active()?;
        self.query_handler = Some(Box::new(handler));
        Ok(())
    }

    /// # Errors
    /// Returns error if the presence is invalidated or the channel is closed.
    pub fn subscribe(&mut self, observed: ObjectId) -> Result<(), PresenceError> {
        self.subscription(observed, true)
    }

    /// # Errors
    /// Returns error if the presence is invalidated or the channel is closed.
    pub fn unsubscribe(&mut self, observed: ObjectId) -> Result<(), PresenceError> {
        self.subscription(observed, false)
    }

    /// Ask for the session to be torn down. The presence is invalidated when
    /// the host confirms.
    ///
    /// # Errors
    /// Returns error if the presence is invalidated or the channel is closed.
    pub fn disconnect(&mut self) -> Result<(), PresenceError> {
        self.ensure_active()?;
        self.send(FromScript::Disconnect {
            space: self.state.space.clone(),
            id: self.state.id,
        })
    }

    /// Send `payload` from `source_port` to `dest_port` on object `dest`.
    ///
    /// # Errors
    /// Returns error if the presence is invalidated or the channel is closed.
    pub fn send_odp_message(
        &mut self,
        dest: ObjectId,
        source_port: u32,
        dest_port: u32,
        payload: Vec<u8>,
    ) -> Result<(), PresenceError> {
        self.ensure_active()?;
        let message = OdpMessage {
            source_object: self.state.id,
            source_port,
            dest_object: dest,
            dest_port,
            payload,
        };
        self.send(FromScript::odp(self.state.space.clone(), message))
    }

    /// # Errors
    /// Always returns `NotSupported`.
    pub fn on_disconnected<F>(&mut self, _handler: F) -> Result<(), PresenceError>
    where
        F: FnMut() + Send + 'static,
    {
        Err(PresenceError::NotSupported("Presence::on_disconnected"))
    }

    /// Apply a location update describing `observed`, which is either this
    /// presence or one of `remotes`. Returns false if `observed` is unknown.
    pub(crate) fn handle_loc_event(
        &mut self,
        observed: ObjectId,
        update: &LocationUpdate,
        visual: Option<Visual>,
        remotes: &mut HashMap<SessionKey, RemotePresence>,
    ) -> bool {
        let now = self.now();
        if observed == self.state.id {
            self.state.update_loc(update, visual, now);
            return true;
        }
        let key = SessionKey::new(self.state.space.clone(), observed);
        match remotes.get_mut(&key) {
            Some(remote) => {
                remote.update_loc(update, visual, now);
                true
            }
            None => {
                tracing::warn!(key = %key, "Location update for untracked remote presence");
                false
            }
        }
    }

    /// Tell the query handler, if any, that `remote` entered or left.
    pub(crate) fn remote_presence(&mut self, remote: &RemotePresence, added: bool) {
        if let Some(handler) = self.query_handler.as_mut() {
            handler(remote, added);
        }
    }

    /// Note a query that was registered as part of the connect request.
    pub(crate) fn record_query(&mut self, query: SolidAngle) {
        self.query = Some(query);
    }

    pub(crate) fn invalidate(&mut self) {
        self.status = PresenceStatus::Invalidated;
    }

    fn ensure_active(&self) -> Result<(), PresenceError> {
        match self.status {
            PresenceStatus::Active => Ok(()),
            PresenceStatus::Invalidated => Err(PresenceError::Invalidated(self.key())),
        }
    }

    fn subscription(&mut self, observed: ObjectId, enable: bool) -> Result<(), PresenceError> {
        self.ensure_active()?;
        self.send(FromScript::Subscription {
            space: self.state.space.clone(),
            id: self.state.id,
            observed,
            enable,
        })
    }

    /// Record `update` as requested and send it.
    fn request(&mut self, update: LocationUpdate, now: Timestamp) -> Result<(), PresenceError> {
        self.requested = merge_update(&update, &self.requested, now);
        self.send_location(update)
    }

    fn send_location(&self, update: LocationUpdate) -> Result<(), PresenceError> {
        self.send(FromScript::Location {
            space: self.state.space.clone(),
            id: self.state.id,
            loc: update,
            vis: None,
        })
    }

    fn send(&self, msg: FromScript) -> Result<(), PresenceError> {
        Ok(self.sender.send(msg)?)
    }
}

impl PresenceView for Presence {
    fn state(&self) -> &PresenceState {
        &self.state
    }
}

impl fmt::Debug for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Presence")
            .field("state", &self.state)
            .field("requested", &self.requested)
            .field("query", &self.query)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use kata_core::{ManualClock, SpaceId};
    use kata_protocol::{HostEnd, channel};

    use super::*;

    struct Fixture {
        presence: Presence,
        host: HostEnd,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            let (script, host) = channel::pair();
            let clock = Arc::new(ManualClock::new(Timestamp::from_secs(100.0)));
            let state = PresenceState::new(
                SpaceId::parse("loop://test/").unwrap(),
                ObjectId::random(),
                Location::at_rest(DVec3::ZERO, Timestamp::from_secs(100.0)),
                None,
                None,
            );
            Self {
                presence: Presence::new(state, script.sender(), clock.clone()),
                host,
                clock,
            }
        }

        fn drain(&mut self) -> Vec<FromScript> {
            std::iter::from_fn(|| self.host.try_recv()).collect()
        }
    }

    #[test]
    fn test_repeated_position_is_suppressed() {
        let mut fx = Fixture::new();
        let pos = DVec3::new(1.0, 2.0, 3.0);

        fx.presence.set_position(pos).unwrap();
        fx.presence.set_position(pos).unwrap();

        let sent = fx.drain();
        assert_eq!(sent.len(), 1);
        let FromScript::Location { loc, .. } = &sent[0] else {
            panic!("expected a location message, got {:?}", sent[0]);
        };
        assert_eq!(loc.pos, Some(pos));
        assert_eq!(loc.vel, Some(DVec3::ZERO));
        assert_eq!(loc.time, Some(Timestamp::from_secs(100.0)));
        assert!(loc.orient.is_none());
    }

    #[test]
    fn test_velocity_carries_authoritative_position() {
        let mut fx = Fixture::new();

        fx.presence.set_velocity(DVec3::X).unwrap();
        // Requested velocity is already X.
        fx.clock.advance(1.0);
        fx.presence.set_velocity(DVec3::X).unwrap();

        let sent = fx.drain();
        assert_eq!(sent.len(), 1);
        let FromScript::Location { loc, .. } = &sent[0] else {
            panic!("expected a location message");
        };
        assert_eq!(loc.pos, Some(DVec3::ZERO));
        assert_eq!(loc.vel, Some(DVec3::X));
        assert_eq!(fx.presence.requested_location().vel, DVec3::X);
    }

    #[test]
    fn test_requested_position_is_dead_reckoned() {
        let mut fx = Fixture::new();
        fx.presence.set_velocity(DVec3::X).unwrap();
        fx.clock.advance(2.0);

        // The requested location has drifted to x = 2 by now.
        fx.presence.set_position(DVec3::new(2.0, 0.0, 0.0)).unwrap();
        fx.presence.set_position(DVec3::ZERO).unwrap();

        assert_eq!(fx.drain().len(), 2);
    }

    #[test]
    fn test_rotation_setters() {
        let mut fx = Fixture::new();
        let orient = DQuat::from_rotation_y(0.5);

        fx.presence.set_orientation(orient).unwrap();
        fx.presence.set_orientation(orient).unwrap();
        fx.presence.set_angular_rotation(DVec3::Z, 1.0).unwrap();
        fx.presence.set_angular_rotation(DVec3::Z, 1.0).unwrap();

        let sent = fx.drain();
        assert_eq!(sent.len(), 2);
        let FromScript::Location { loc, .. } = &sent[0] else {
            panic!("expected a location message");
        };
        assert_eq!(loc.orient, Some(orient));
        assert_eq!(loc.ang_speed, Some(0.0));
        let FromScript::Location { loc, .. } = &sent[1] else {
            panic!("expected a location message");
        };
        // Orientation comes from the authoritative state, not the request.
        assert_eq!(loc.orient, Some(DQuat::IDENTITY));
        assert_eq!(loc.rot_axis, Some(DVec3::Z));
        assert_eq!(loc.ang_speed, Some(1.0));
    }

    #[test]
    fn test_set_location_suppressed_when_matching() {
        let mut fx = Fixture::new();
        let update = LocationUpdate {
            pos: Some(DVec3::ZERO),
            ..LocationUpdate::default()
        };
        fx.presence.set_location(update).unwrap();
        assert!(fx.drain().is_empty());

        let update = LocationUpdate {
            pos: Some(DVec3::ONE),
            ..LocationUpdate::default()
        };
        fx.presence.set_location(update).unwrap();
        fx.presence.set_location(update).unwrap();
        assert_eq!(fx.drain().len(), 1);
    }

    #[test]
    fn test_bounds_scale_visual_always_sent() {
        let mut fx = Fixture::new();
        let bounds = Bounds::new(DVec3::ZERO, 2.0);

        fx.presence.set_bounds(bounds).unwrap();
        fx.presence.set_bounds(bounds).unwrap();
        fx.presence.set_scale(DVec3::ONE).unwrap();
        fx.presence.set_visual(serde_json::json!({ "mesh": "a.dae" })).unwrap();

        let sent = fx.drain();
        assert_eq!(sent.len(), 4);
        assert!(matches!(&sent[0], FromScript::Location { loc, .. } if loc.bounds == Some(bounds) && loc.pos.is_none()));
        assert!(matches!(&sent[2], FromScript::Location { loc, .. } if loc.scale == Some(DVec3::ONE)));
        assert!(matches!(&sent[3], FromScript::Visual { .. }));
    }

    #[test]
    fn test_query_and_subscriptions() {
        let mut fx = Fixture::new();
        let other = ObjectId::random();

        fx.presence.set_query(SolidAngle(0.25)).unwrap();
        fx.presence.subscribe(other).unwrap();
        fx.presence.unsubscribe(other).unwrap();

        assert_eq!(fx.presence.query(), Some(SolidAngle(0.25)));
        let sent = fx.drain();
        assert!(matches!(sent[0], FromScript::Query { sa, .. } if sa == SolidAngle(0.25)));
        assert!(matches!(sent[1], FromScript::Subscription { enable: true, observed, .. } if observed == other));
        assert!(matches!(sent[2], FromScript::Subscription { enable: false, .. }));
    }

    #[test]
    fn test_invalidated_presence_refuses_calls() {
        let mut fx = Fixture::new();
        fx.presence.invalidate();

        assert!(matches!(
            fx.presence.set_position(DVec3::ONE),
            Err(PresenceError::Invalidated(_))
        ));
        assert!(matches!(
            fx.presence.disconnect(),
            Err(PresenceError::Invalidated(_))
        ));
        assert!(matches!(
            fx.presence.send_odp_message(ObjectId::random(), 1, 1, vec![]),
            Err(PresenceError::Invalidated(_))
        ));
        assert!(matches!(
            fx.presence.set_query_handler(|_, _| {}),
            Err(PresenceError::Invalidated(_))
        ));
        assert!(fx.drain().is_empty());
        assert_eq!(fx.presence.status(), PresenceStatus::Invalidated);
    }

    #[test]
    fn test_on_disconnected_not_supported() {
        let mut fx = Fixture::new();
        assert!(matches!(
            fx.presence.on_disconnected(|| {}),
            Err(PresenceError::NotSupported(_))
        ));
    }

    #[test]
    fn test_closed_channel() {
        let mut fx = Fixture::new();
        drop(fx.host);
        assert!(matches!(
            fx.presence.set_visual(serde_json::Value::Null),
            Err(PresenceError::ChannelClosed)
        ));
    }

    #[test]
    fn test_loc_events() {
        let mut fx = Fixture::new();
        let me = fx.presence.id();
        let space = fx.presence.space().clone();
        let other = ObjectId::random();
        let mut remotes = HashMap::new();
        let update = LocationUpdate {
            pos: Some(DVec3::ONE),
            ..LocationUpdate::default()
        };

        assert!(fx.presence.handle_loc_event(me, &update, None, &mut remotes));
        assert_eq!(fx.presence.location().pos, DVec3::ONE);
        // The request side is untouched by authoritative updates.
        assert_eq!(fx.presence.requested_location().pos, DVec3::ZERO);

        assert!(!fx.presence.handle_loc_event(other, &update, None, &mut remotes));

        remotes.insert(
            SessionKey::new(space.clone(), other),
            RemotePresence::new(space.clone(), other, Location::default(), None, None),
        );
        assert!(fx.presence.handle_loc_event(other, &update, None, &mut remotes));
        assert_eq!(
            remotes[&SessionKey::new(space, other)].location().pos,
            DVec3::ONE
        );
    }

    #[test]
    fn test_query_handler_invoked() {
        let mut fx = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let remote = RemotePresence::new(
            fx.presence.space().clone(),
            ObjectId::random(),
            Location::default(),
            None,
            None,
        );

        // No handler yet.
        fx.presence.remote_presence(&remote, true);

        let log = Arc::clone(&seen);
        fx.presence
            .set_query_handler(move |remote, added| log.lock().unwrap().push((remote.id(), added)))
            .unwrap();
        fx.presence.remote_presence(&remote, true);
        fx.presence.remote_presence(&remote, false);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(remote.id(), true), (remote.id(), false)]
        );
    }
}
