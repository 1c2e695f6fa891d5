//! Renderer commands carried under the `fgfm` tag.
//!
//! The session layer never interprets these; it forwards them to whatever
//! rendering front end is attached. Field names match what renderers expect.

use kata_core::{DVec3, Location, LocationUpdate, ObjectId, SpaceId, Visual};
use serde::{Deserialize, Serialize};

/// Renderer scene name for the view `observer` has of `space`.
#[must_use]
pub fn graphics_scope(space: &SpaceId, observer: ObjectId) -> String {
    format!("{space}{observer}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg")]
pub enum GraphicsMessage {
    Create {
        space: String,
        spaceid: String,
        id: ObjectId,
        #[serde(flatten)]
        loc: LocationUpdate,
    },
    Move {
        space: String,
        spaceid: String,
        id: ObjectId,
        #[serde(flatten)]
        loc: LocationUpdate,
    },
    Animate {
        space: String,
        spaceid: String,
        id: ObjectId,
        animation: String,
    },
    Label {
        space: String,
        spaceid: String,
        id: ObjectId,
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<DVec3>,
    },
    Destroy {
        space: String,
        id: ObjectId,
    },
    Mesh {
        space: String,
        spaceid: String,
        id: ObjectId,
        mesh: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anim: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up_axis: Option<DVec3>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        center: Option<DVec3>,
        scale: DVec3,
    },
    DestroyMesh {
        space: String,
        spaceid: String,
        id: ObjectId,
    },
    AttachCamera {
        space: String,
        spaceid: String,
        id: ObjectId,
        target: String,
    },
    AttachCameraTexture {
        space: String,
        spaceid: String,
        id: ObjectId,
        texobjspace: String,
        texobjid: ObjectId,
        texname: String,
    },
    DetachCamera {
        space: String,
        spaceid: String,
        id: ObjectId,
    },
    Raytrace {
        space: String,
        requestid: serde_json::Value,
        pos: DVec3,
        dir: DVec3,
        multiple: bool,
        infinite: bool,
    },
    Highlight {
        space: String,
        id: ObjectId,
        enable: bool,
    },
    Enable {
        space: String,
        #[serde(rename = "type")]
        event: String,
    },
    Disable {
        space: String,
        #[serde(rename = "type")]
        event: String,
    },
    Custom {
        space: String,
        spaceid: String,
        data: serde_json::Value,
    },
}

impl GraphicsMessage {
    /// Add a node for `id` to `observer`'s view of `space`.
    #[must_use]
    pub fn create_node(space: &SpaceId, observer: ObjectId, id: ObjectId, loc: &Location) -> Self {
        let scope = graphics_scope(space, observer);
        Self::Create {
            spaceid: scope.clone(),
            space: scope,
            id,
            loc: LocationUpdate::from(*loc),
        }
    }

    #[must_use]
    pub fn move_node(
        space: &SpaceId,
        observer: ObjectId,
        id: ObjectId,
        loc: LocationUpdate,
    ) -> Self {
        let scope = graphics_scope(space, observer);
        Self::Move {
            spaceid: scope.clone(),
            space: scope,
            id,
            loc,
        }
    }

    #[must_use]
    pub fn destroy_node(space: &SpaceId, observer: ObjectId, id: ObjectId) -> Self {
        Self::Destroy {
            space: graphics_scope(space, observer),
            id,
        }
    }

    #[must_use]
    pub fn animate(space: &SpaceId, observer: ObjectId, id: ObjectId, animation: String) -> Self {
        let scope = graphics_scope(space, observer);
        Self::Animate {
            spaceid: scope.clone(),
            space: scope,
            id,
            animation,
        }
    }

    #[must_use]
    pub fn label(
        space: &SpaceId,
        observer: ObjectId,
        id: ObjectId,
        label: String,
        offset: Option<DVec3>,
    ) -> Self {
        let scope = graphics_scope(space, observer);
        Self::Label {
            spaceid: scope.clone(),
            space: scope,
            id,
            label,
            offset,
        }
    }

    #[must_use]
    pub fn attach_camera(space: &SpaceId, observer: ObjectId, id: ObjectId, target: String) -> Self {
        let scope = graphics_scope(space, observer);
        Self::AttachCamera {
            spaceid: scope.clone(),
            space: scope,
            id,
            target,
        }
    }

    #[must_use]
    pub fn detach_camera(space: &SpaceId, observer: ObjectId, id: ObjectId) -> Self {
        let scope = graphics_scope(space, observer);
        Self::DetachCamera {
            spaceid: scope.clone(),
            space: scope,
            id,
        }
    }

    /// Mesh commands for an object's visual.
    ///
    /// A visual with a `mesh` string yields a `Mesh` command; anything else
    /// (lights, empty visuals) yields nothing.
    #[must_use]
    pub fn visual_updates(
        space: &SpaceId,
        observer: ObjectId,
        id: ObjectId,
        visual: Option<&Visual>,
    ) -> Vec<Self> {
        let Some(mesh) = visual
            .and_then(|v| v.get("mesh"))
            .and_then(serde_json::Value::as_str)
        else {
            return Vec::new();
        };
        let vec3 = |key: &str| {
            visual
                .and_then(|v| v.get(key))
                .and_then(|v| serde_json::from_value::<DVec3>(v.clone()).ok())
        };
        let scope = graphics_scope(space, observer);
        vec![Self::Mesh {
            spaceid: scope.clone(),
            space: scope,
            id,
            mesh: mesh.to_string(),
            anim: visual
                .and_then(|v| v.get("anim"))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            up_axis: vec3("up_axis"),
            center: vec3("center"),
            scale: DVec3::ONE,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FromScript;

    fn space() -> SpaceId {
        SpaceId::parse("loop://local/").unwrap()
    }

    #[test]
    fn test_graphics_envelope_shape() {
        let observer = ObjectId::random();
        let id = ObjectId::random();
        let msg = FromScript::Graphics(GraphicsMessage::create_node(
            &space(),
            observer,
            id,
            &Location::default(),
        ));

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["__type"], "fgfm");
        assert_eq!(json["msg"], "Create");
        assert_eq!(json["space"], format!("loop://local/{observer}"));
        assert_eq!(json["spaceid"], json["space"]);
        assert_eq!(json["pos"], serde_json::json!([0.0, 0.0, 0.0]));

        let parsed: FromScript = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_enable_uses_type_field() {
        let msg = GraphicsMessage::Enable {
            space: "loop://local/".into(),
            event: "mousedown".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "mousedown");
        assert_eq!(json["msg"], "Enable");
    }

    #[test]
    fn test_visual_updates() {
        let observer = ObjectId::random();
        let id = ObjectId::random();
        let visual = serde_json::json!({ "mesh": "models/duck.dae", "up_axis": [0.0, 0.0, 1.0] });

        let msgs = GraphicsMessage::visual_updates(&space(), observer, id, Some(&visual));
        assert_eq!(msgs.len(), 1);
        let GraphicsMessage::Mesh { mesh, up_axis, .. } = &msgs[0] else {
            panic!("Wrong message type");
        };
        assert_eq!(mesh, "models/duck.dae");
        assert_eq!(*up_axis, Some(DVec3::Z));

        let light = serde_json::json!({ "light": "point" });
        assert!(GraphicsMessage::visual_updates(&space(), observer, id, Some(&light)).is_empty());
        assert!(GraphicsMessage::visual_updates(&space(), observer, id, None).is_empty());
    }
}
