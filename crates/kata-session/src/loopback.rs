//! In-process space served under the `loop://` scheme.
//!
//! Every object sees every other object (the query radius is ignored) and
//! location requests are applied immediately. Useful for demos and tests.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use kata_core::{
    Auth, Bounds, Clock, ConnectionOutcome, Location, LocationUpdate, ObjectId, ObjectProperties,
    OdpMessage, PresenceId, SolidAngle, SpaceConnection, SpaceError, SpaceEventSender, SpaceId,
    SystemClock, Visual, merge_update,
};

pub const LOOPBACK_SCHEME: &str = "loop";

/// [`SpaceConnectionFactory`](kata_core::SpaceConnectionFactory) for `loop://` spaces.
pub fn factory(space: &SpaceId, events: SpaceEventSender) -> Box<dyn SpaceConnection> {
    Box::new(LoopbackSpace::new(space.clone(), events))
}

#[derive(Debug, Clone)]
struct LoopbackObject {
    loc: Location,
    bounds: Option<Bounds>,
    visual: Option<Visual>,
    query: Option<SolidAngle>,
    subscribers: HashSet<ObjectId>,
}

impl LoopbackObject {
    fn properties(&self) -> ObjectProperties {
        ObjectProperties {
            loc: Some(self.loc),
            bounds: self.bounds,
            visual: self.visual.clone(),
        }
    }
}

pub struct LoopbackSpace {
    space: SpaceId,
    events: SpaceEventSender,
    clock: Arc<dyn Clock>,
    objects: HashMap<ObjectId, LoopbackObject>,
}

impl LoopbackSpace {
    #[must_use]
    pub fn new(space: SpaceId, events: SpaceEventSender) -> Self {
        Self::with_clock(space, events, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(space: SpaceId, events: SpaceEventSender, clock: Arc<dyn Clock>) -> Self {
        Self {
            space,
            events,
            clock,
            objects: HashMap::new(),
        }
    }

    /// Number of objects currently in the space.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn report(&self, result: Result<(), SpaceError>) {
        if let Err(e) = result {
            tracing::warn!(space = %self.space, "Loopback event dropped: {e}");
        }
    }

    /// Objects with an active query, other than `except`.
    fn queriers(&self, except: ObjectId) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|(id, obj)| **id != except && obj.query.is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    fn announce(&self, observed: ObjectId, entered: bool, properties: &ObjectProperties) {
        for querier in self.queriers(observed) {
            self.report(self.events.prox_event(
                self.space.clone(),
                querier,
                observed,
                entered,
                properties.clone(),
            ));
        }
    }
}

impl SpaceConnection for LoopbackSpace {
    fn space(&self) -> &SpaceId {
        &self.space
    }

    fn connect_object(&mut self, object: ObjectId, _auth: Option<&Auth>, visual: Option<&Visual>) {
        let id = ObjectId::random();
        let entry = LoopbackObject {
            loc: Location {
                time: self.clock.now(&self.space),
                ..Location::default()
            },
            bounds: None,
            visual: visual.cloned(),
            query: None,
            subscribers: HashSet::new(),
        };
        let properties = entry.properties();
        self.objects.insert(id, entry);
        tracing::debug!(space = %self.space, temp_id = %object, id = %id, "Loopback connect");

        self.report(self.events.connection_response(
            self.space.clone(),
            object,
            ConnectionOutcome::Connected {
                presence: PresenceId::new(self.space.clone(), id),
                loc: properties.loc.unwrap_or_default(),
                bounds: None,
                visual: properties.visual.clone(),
            },
        ));
        self.announce(id, true, &properties);
    }

    fn disconnect_object(&mut self, object: ObjectId) {
        let Some(removed) = self.objects.remove(&object) else {
            tracing::warn!(space = %self.space, object = %object, "Disconnect of unknown object");
            return;
        };
        for other in self.objects.values_mut() {
            other.subscribers.remove(&object);
        }
        self.announce(object, false, &removed.properties());
    }

    fn send_odp_message(&mut self, message: OdpMessage) {
        if !self.objects.contains_key(&message.dest_object) {
            tracing::debug!(space = %self.space, dest = %message.dest_object, "ODP to unknown object dropped");
            return;
        }
        self.report(self.events.receive_odp(self.space.clone(), message));
    }

    fn register_prox_query(&mut self, object: ObjectId, query: SolidAngle) {
        let Some(entry) = self.objects.get_mut(&object) else {
            tracing::warn!(space = %self.space, object = %object, "Query from unknown object");
            return;
        };
        let first = entry.query.replace(query).is_none();
        if !first {
            return;
        }
        for (id, other) in &self.objects {
            if *id != object {
                self.report(self.events.prox_event(
                    self.space.clone(),
                    object,
                    *id,
                    true,
                    other.properties(),
                ));
            }
        }
    }

    fn loc_update_request(
        &mut self,
        object: ObjectId,
        update: &LocationUpdate,
        visual: Option<&Visual>,
    ) {
        let now = self.clock.now(&self.space);
        let Some(entry) = self.objects.get_mut(&object) else {
            tracing::warn!(space = %self.space, object = %object, "Location update for unknown object");
            return;
        };
        entry.loc = merge_update(update, &entry.loc, now);
        if update.bounds.is_some() {
            entry.bounds = update.bounds;
        }
        if let Some(visual) = visual {
            entry.visual = Some(visual.clone());
        }

        let applied = LocationUpdate {
            time: Some(entry.loc.time),
            ..*update
        };
        let mut recipients: BTreeSet<ObjectId> = entry.subscribers.iter().copied().collect();
        recipients.insert(object);
        recipients.extend(self.queriers(object));

        for to in recipients {
            self.report(self.events.presence_loc_update(
                self.space.clone(),
                object,
                to,
                applied,
                visual.cloned(),
            ));
        }
    }

    fn subscribe(&mut self, object: ObjectId, observed: ObjectId) {
        match self.objects.get_mut(&observed) {
            Some(entry) => {
                entry.subscribers.insert(object);
            }
            None => tracing::debug!(space = %self.space, observed = %observed, "Subscribe to unknown object"),
        }
    }

    fn unsubscribe(&mut self, object: ObjectId, observed: ObjectId) {
        if let Some(entry) = self.objects.get_mut(&observed) {
            entry.subscribers.remove(&object);
        }
    }
}
