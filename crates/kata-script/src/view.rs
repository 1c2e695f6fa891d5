//! State shared by local and remote presences.

use kata_core::{
    Bounds, DQuat, DVec3, Location, LocationUpdate, ObjectId, SessionKey, SpaceId, Timestamp,
    Visual, extrapolate, merge_update,
};

/// What is known about one object in one space.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceState {
    pub(crate) space: SpaceId,
    pub(crate) id: ObjectId,
    pub(crate) location: Location,
    pub(crate) bounds: Option<Bounds>,
    pub(crate) visual: Option<Visual>,
}

impl PresenceState {
    #[must_use]
    pub const fn new(
        space: SpaceId,
        id: ObjectId,
        location: Location,
        bounds: Option<Bounds>,
        visual: Option<Visual>,
    ) -> Self {
        Self {
            space,
            id,
            location,
            bounds,
            visual,
        }
    }

    /// Fold a partial update into the stored location.
    pub fn update_loc(&mut self, update: &LocationUpdate, visual: Option<Visual>, now: Timestamp) {
        self.location = merge_update(update, &self.location, now);
        if update.bounds.is_some() {
            self.bounds = update.bounds;
        }
        if visual.is_some() {
            self.visual = visual;
        }
    }
}

/// Read access to a presence, local or remote.
pub trait PresenceView {
    fn state(&self) -> &PresenceState;

    fn space(&self) -> &SpaceId {
        &self.state().space
    }

    fn id(&self) -> ObjectId {
        self.state().id
    }

    fn key(&self) -> SessionKey {
        SessionKey::new(self.space().clone(), self.id())
    }

    /// Last location reconciled from the space.
    fn location(&self) -> &Location {
        &self.state().location
    }

    /// Dead-reckoned position at `now`.
    fn position(&self, now: Timestamp) -> DVec3 {
        extrapolate(self.location(), now).pos
    }

    fn velocity(&self) -> DVec3 {
        self.location().vel
    }

    /// Dead-reckoned orientation at `now`.
    fn orientation(&self, now: Timestamp) -> DQuat {
        extrapolate(self.location(), now).orient
    }

    fn rotational_axis(&self) -> DVec3 {
        self.location().rot_axis
    }

    fn angular_speed(&self) -> f64 {
        self.location().ang_speed
    }

    fn bounds(&self) -> Option<Bounds> {
        self.state().bounds
    }

    fn visual(&self) -> Option<&Visual> {
        self.state().visual.as_ref()
    }
}
