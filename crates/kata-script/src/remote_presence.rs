//! Read-only view of another object seen through a query.

use kata_core::{Bounds, Location, LocationUpdate, ObjectId, SpaceId, Timestamp, Visual};

use crate::view::{PresenceState, PresenceView};

/// Another object as perceived by a local presence's query.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePresence {
    state: PresenceState,
}

impl RemotePresence {
    #[must_use]
    pub const fn new(
        space: SpaceId,
        id: ObjectId,
        location: Location,
        bounds: Option<Bounds>,
        visual: Option<Visual>,
    ) -> Self {
        Self {
            state: PresenceState::new(space, id, location, bounds, visual),
        }
    }

    pub fn update_loc(&mut self, update: &LocationUpdate, visual: Option<Visual>, now: Timestamp) {
        self.state.update_loc(update, visual, now);
    }
}

impl PresenceView for RemotePresence {
    fn state(&self) -> &PresenceState {
        &self.state
    }
}
