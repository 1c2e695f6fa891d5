//! Kinematic location state and dead-reckoning.
//!
//! A [`Location`] is a full kinematic snapshot taken at a point in time. A
//! [`LocationUpdate`] carries any subset of those fields and is folded into a
//! previous snapshot with [`merge_update`]. Both are plain data and cross the
//! script boundary as-is.

use std::fmt;

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};

/// Point in time, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(f64);

impl Timestamp {
    #[must_use]
    pub const fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    #[must_use]
    pub const fn as_secs(self) -> f64 {
        self.0
    }

    /// Seconds elapsed from `earlier` to `self` (negative if `earlier` is later).
    #[must_use]
    pub fn since(self, earlier: Self) -> f64 {
        self.0 - earlier.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.0)
    }
}

/// Bounding sphere of an object, relative to its position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub center: DVec3,
    pub radius: f64,
}

impl Bounds {
    #[must_use]
    pub const fn new(center: DVec3, radius: f64) -> Self {
        Self { center, radius }
    }
}

/// Full kinematic state of an object at `time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub pos: DVec3,
    pub vel: DVec3,
    pub orient: DQuat,
    #[serde(rename = "rotaxis")]
    pub rot_axis: DVec3,
    #[serde(rename = "angvel")]
    pub ang_speed: f64,
    pub time: Timestamp,
}

impl Default for Location {
    fn default() -> Self {
        Self::at_rest(DVec3::ZERO, Timestamp::default())
    }
}

impl Location {
    /// Stationary, unrotated object at `pos`.
    #[must_use]
    pub const fn at_rest(pos: DVec3, time: Timestamp) -> Self {
        Self {
            pos,
            vel: DVec3::ZERO,
            orient: DQuat::IDENTITY,
            rot_axis: DVec3::ZERO,
            ang_speed: 0.0,
            time,
        }
    }

    /// See [`extrapolate`].
    #[must_use]
    pub fn extrapolate(&self, now: Timestamp) -> Self {
        extrapolate(self, now)
    }
}

/// Partial location. Absent fields are inherited from a previous [`Location`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LocationUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<DVec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vel: Option<DVec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orient: Option<DQuat>,
    #[serde(default, rename = "rotaxis", skip_serializing_if = "Option::is_none")]
    pub rot_axis: Option<DVec3>,
    #[serde(default, rename = "angvel", skip_serializing_if = "Option::is_none")]
    pub ang_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<DVec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Timestamp>,
}

impl LocationUpdate {
    /// Translation-only update.
    #[must_use]
    pub const fn motion(pos: DVec3, vel: DVec3, time: Timestamp) -> Self {
        Self {
            pos: Some(pos),
            vel: Some(vel),
            orient: None,
            rot_axis: None,
            ang_speed: None,
            bounds: None,
            scale: None,
            time: Some(time),
        }
    }

    /// Rotation-only update.
    #[must_use]
    pub const fn rotation(orient: DQuat, rot_axis: DVec3, ang_speed: f64, time: Timestamp) -> Self {
        Self {
            pos: None,
            vel: None,
            orient: Some(orient),
            rot_axis: Some(rot_axis),
            ang_speed: Some(ang_speed),
            bounds: None,
            scale: None,
            time: Some(time),
        }
    }

    #[must_use]
    pub const fn with_time(mut self, time: Timestamp) -> Self {
        self.time = Some(time);
        self
    }

    /// True if no field other than `time` is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pos.is_none()
            && self.vel.is_none()
            && self.orient.is_none()
            && self.rot_axis.is_none()
            && self.ang_speed.is_none()
            && self.bounds.is_none()
            && self.scale.is_none()
    }

    /// True if every kinematic field present here equals the field of `loc`
    /// exactly. Bounds and scale are not part of [`Location`], so an update
    /// carrying either never matches.
    #[must_use]
    pub fn matches(&self, loc: &Location) -> bool {
        self.bounds.is_none()
            && self.scale.is_none()
            && self.pos.is_none_or(|pos| pos == loc.pos)
            && self.vel.is_none_or(|vel| vel == loc.vel)
            && self.orient.is_none_or(|orient| orient == loc.orient)
            && self.rot_axis.is_none_or(|axis| axis == loc.rot_axis)
            && self.ang_speed.is_none_or(|speed| speed == loc.ang_speed)
    }
}

impl From<Location> for LocationUpdate {
    fn from(loc: Location) -> Self {
        Self {
            pos: Some(loc.pos),
            vel: Some(loc.vel),
            orient: Some(loc.orient),
            rot_axis: Some(loc.rot_axis),
            ang_speed: Some(loc.ang_speed),
            bounds: None,
            scale: None,
            time: Some(loc.time),
        }
    }
}

/// Dead-reckon `loc` forward (or backward) to `now`.
///
/// Position moves at constant velocity; orientation turns about `rot_axis` at
/// `ang_speed` radians per second. The result is stamped with `now`.
#[must_use]
pub fn extrapolate(loc: &Location, now: Timestamp) -> Location {
    let dt = now.since(loc.time);
    Location {
        pos: loc.pos + loc.vel * dt,
        orient: rotate(loc.orient, loc.rot_axis, loc.ang_speed * dt),
        time: now,
        ..*loc
    }
}

fn rotate(orient: DQuat, axis: DVec3, angle: f64) -> DQuat {
    if angle == 0.0 {
        return orient;
    }
    // A degenerate axis means "not rotating".
    axis.try_normalize().map_or(orient, |axis| {
        (DQuat::from_axis_angle(axis, angle) * orient).normalize()
    })
}

/// Fold `partial` into `previous`.
///
/// The result is taken at `partial.time`, or at `now` when the update carries
/// no timestamp. Fields present in `partial` win; the rest come from
/// `previous` extrapolated to that time.
#[must_use]
pub fn merge_update(partial: &LocationUpdate, previous: &Location, now: Timestamp) -> Location {
    let time = partial.time.unwrap_or(now);
    let base = extrapolate(previous, time);
    Location {
        pos: partial.pos.unwrap_or(base.pos),
        vel: partial.vel.unwrap_or(base.vel),
        orient: partial.orient.unwrap_or(base.orient),
        rot_axis: partial.rot_axis.unwrap_or(base.rot_axis),
        ang_speed: partial.ang_speed.unwrap_or(base.ang_speed),
        time,
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::FRAC_PI_2;

    use proptest::prelude::*;

    use super::*;

    const EPS: f64 = 1e-6;

    fn spinning(time: f64) -> Location {
        Location {
            pos: DVec3::new(1.0, 2.0, 3.0),
            vel: DVec3::new(0.5, 0.0, -1.0),
            orient: DQuat::IDENTITY,
            rot_axis: DVec3::Y,
            ang_speed: FRAC_PI_2,
            time: Timestamp::from_secs(time),
        }
    }

    #[test]
    fn test_extrapolate_translates_and_rotates() {
        let loc = spinning(10.0);
        let out = extrapolate(&loc, Timestamp::from_secs(12.0));

        assert!(out.pos.abs_diff_eq(DVec3::new(2.0, 2.0, 1.0), EPS));
        // Two seconds at a quarter turn per second is a half turn about Y.
        let expected = DQuat::from_axis_angle(DVec3::Y, std::f64::consts::PI);
        assert!(out.orient.abs_diff_eq(expected, EPS));
        assert_eq!(out.time, Timestamp::from_secs(12.0));
        assert_eq!(out.vel, loc.vel);
        // Input untouched.
        assert_eq!(loc.time, Timestamp::from_secs(10.0));
    }

    #[test]
    fn test_extrapolate_same_time_is_identity() {
        let loc = spinning(3.0);
        assert_eq!(extrapolate(&loc, loc.time), loc);
    }

    #[test]
    fn test_zero_axis_does_not_rotate() {
        let loc = Location {
            rot_axis: DVec3::ZERO,
            ang_speed: 5.0,
            ..spinning(0.0)
        };
        let out = extrapolate(&loc, Timestamp::from_secs(4.0));
        assert_eq!(out.orient, loc.orient);
    }

    #[test]
    fn test_merge_motion_keeps_rotation_from_previous() {
        let previous = spinning(0.0);
        let update = LocationUpdate::motion(
            DVec3::new(9.0, 9.0, 9.0),
            DVec3::ZERO,
            Timestamp::from_secs(1.0),
        );

        let merged = merge_update(&update, &previous, Timestamp::from_secs(5.0));
        let at_update = extrapolate(&previous, Timestamp::from_secs(1.0));

        assert_eq!(merged.pos, DVec3::new(9.0, 9.0, 9.0));
        assert_eq!(merged.vel, DVec3::ZERO);
        assert_eq!(merged.orient, at_update.orient);
        assert_eq!(merged.rot_axis, previous.rot_axis);
        assert_eq!(merged.ang_speed, previous.ang_speed);
        assert_eq!(merged.time, Timestamp::from_secs(1.0));
    }

    #[test]
    fn test_merge_without_time_uses_now() {
        let previous = spinning(0.0);
        let update = LocationUpdate {
            ang_speed: Some(0.0),
            ..LocationUpdate::default()
        };
        let merged = merge_update(&update, &previous, Timestamp::from_secs(2.0));
        assert_eq!(merged.time, Timestamp::from_secs(2.0));
        assert!(merged.pos.abs_diff_eq(DVec3::new(2.0, 2.0, 1.0), EPS));
        assert_eq!(merged.ang_speed, 0.0);
    }

    #[test]
    fn test_update_matches() {
        let loc = spinning(0.0);
        assert!(LocationUpdate::default().matches(&loc));
        assert!(
            LocationUpdate {
                pos: Some(loc.pos),
                ..LocationUpdate::default()
            }
            .matches(&loc)
        );
        assert!(
            !LocationUpdate {
                pos: Some(loc.pos + DVec3::X),
                ..LocationUpdate::default()
            }
            .matches(&loc)
        );
        assert!(
            !LocationUpdate {
                scale: Some(DVec3::ONE),
                ..LocationUpdate::default()
            }
            .matches(&loc)
        );
    }

    #[test]
    fn test_update_serialization_skips_absent_fields() {
        let update = LocationUpdate::motion(DVec3::ONE, DVec3::ZERO, Timestamp::from_secs(1.5));
        let json = serde_json::to_value(update).unwrap();
        assert_eq!(json["pos"], serde_json::json!([1.0, 1.0, 1.0]));
        assert_eq!(json["time"], serde_json::json!(1.5));
        assert!(json.get("orient").is_none());
        assert!(json.get("rotaxis").is_none());
    }

    fn vec3() -> impl Strategy<Value = DVec3> {
        (-100.0..100.0f64, -100.0..100.0f64, -100.0..100.0f64)
            .prop_map(|(x, y, z)| DVec3::new(x, y, z))
    }

    fn location() -> impl Strategy<Value = Location> {
        (vec3(), vec3(), vec3(), -3.0..3.0f64, 0.0..50.0f64).prop_map(
            |(pos, vel, rot_axis, ang_speed, time)| Location {
                pos,
                vel,
                orient: DQuat::IDENTITY,
                rot_axis,
                ang_speed,
                time: Timestamp::from_secs(time),
            },
        )
    }

    proptest! {
        #[test]
        fn prop_extrapolate_idempotent_at_same_time(loc in location(), dt in 0.0..20.0f64) {
            let t1 = Timestamp::from_secs(loc.time.as_secs() + dt);
            let once = extrapolate(&loc, t1);
            prop_assert_eq!(extrapolate(&once, t1), once);
        }

        #[test]
        fn prop_extrapolate_composes(loc in location(), d1 in 0.0..20.0f64, d2 in 0.0..20.0f64) {
            let t1 = Timestamp::from_secs(loc.time.as_secs() + d1);
            let t2 = Timestamp::from_secs(t1.as_secs() + d2);

            let direct = extrapolate(&loc, t2);
            let stepped = extrapolate(&extrapolate(&loc, t1), t2);

            prop_assert!(direct.pos.abs_diff_eq(stepped.pos, 1e-6));
            prop_assert!(direct.orient.abs_diff_eq(stepped.orient, 1e-6));
            prop_assert_eq!(direct.time, stepped.time);
        }
    }
}
