//! Markers: poses rigidly attached to a body (or to the world), providing the
//! stable local frames joints, straps and fluid sacs are built on.

use rapier::na;

use crate::attributes::{AttributeMap, LoadError};

/// A basis axis of a marker frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn from_str(s: &str) -> Option<Axis> {
        match s {
            "X" | "x" | "0" => Some(Axis::X),
            "Y" | "y" | "1" => Some(Axis::Y),
            "Z" | "z" | "2" => Some(Axis::Z),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// Snapshot of a marker's world-frame state for the current step.
///
/// The orchestrator rebuilds these once per step so straps, sacs and drivers
/// all see the same post-integrate frames.
#[derive(Debug, Clone)]
pub struct MarkerState {
    pub body: Option<String>,
    pub pose: na::Isometry3<f64>,
    pub velocity: na::Vector3<f64>,
}

impl MarkerState {
    pub fn position(&self) -> na::Vector3<f64> {
        self.pose.translation.vector
    }

    pub fn axis(&self, axis: Axis) -> na::Vector3<f64> {
        let mut local = na::Vector3::zeros();
        local[axis.index()] = 1.0;
        self.pose.rotation * local
    }
}

/// A pose fixed in a body's frame. `body` is `None` for world-frame markers.
#[derive(Debug)]
pub struct Marker {
    name: String,
    body: Option<String>,
    position: na::Vector3<f64>,
    quaternion: na::UnitQuaternion<f64>,
    dump: bool,
}

impl Marker {
    pub fn from_attributes(attributes: &AttributeMap) -> Result<Marker, LoadError> {
        let body = match attributes.get_str_opt("BodyID") {
            None | Some("") | Some("World") => None,
            Some(name) => Some(name.to_string()),
        };
        let position = match attributes.get_str_opt("Position") {
            Some(_) => attributes.get_vector3("Position")?,
            None => na::Vector3::zeros(),
        };
        let quaternion = match attributes.get_str_opt("Quaternion") {
            Some(_) => attributes.get_quaternion("Quaternion")?,
            None => na::UnitQuaternion::identity(),
        };
        Ok(Marker {
            name: attributes.id().to_string(),
            body,
            position,
            quaternion,
            dump: attributes.get_bool_or("Dump", false)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning body's name, or `None` for a world marker.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn position(&self) -> &na::Vector3<f64> {
        &self.position
    }

    pub fn quaternion(&self) -> &na::UnitQuaternion<f64> {
        &self.quaternion
    }

    pub fn dump(&self) -> bool {
        self.dump
    }

    /// The marker pose in its body's frame.
    pub fn local_isometry(&self) -> na::Isometry3<f64> {
        na::Isometry3::from_parts(na::Translation3::from(self.position), self.quaternion)
    }

    /// World pose given the owning body's world pose.
    pub fn world_pose(&self, body_pose: &na::Isometry3<f64>) -> na::Isometry3<f64> {
        body_pose * self.local_isometry()
    }

    /// World position given the owning body's world pose.
    pub fn world_position(&self, body_pose: &na::Isometry3<f64>) -> na::Vector3<f64> {
        self.world_pose(body_pose).translation.vector
    }

    /// A world-frame basis axis of the marker.
    pub fn world_axis(&self, body_pose: &na::Isometry3<f64>, axis: Axis) -> na::Vector3<f64> {
        let rotation = self.world_pose(body_pose).rotation;
        let mut local = na::Vector3::zeros();
        local[axis.index()] = 1.0;
        rotation * local
    }

    /// World velocity of the marker point for a body with the given twist.
    pub fn world_velocity(
        &self,
        body_pose: &na::Isometry3<f64>,
        linear_velocity: &na::Vector3<f64>,
        angular_velocity: &na::Vector3<f64>,
    ) -> na::Vector3<f64> {
        let arm = body_pose.rotation * self.position;
        linear_velocity + angular_velocity.cross(&arm)
    }

    /// Captures the marker's world-frame state for this step.
    pub fn state(
        &self,
        body_pose: &na::Isometry3<f64>,
        linear_velocity: &na::Vector3<f64>,
        angular_velocity: &na::Vector3<f64>,
    ) -> MarkerState {
        MarkerState {
            body: self.body.clone(),
            pose: self.world_pose(body_pose),
            velocity: self.world_velocity(body_pose, linear_velocity, angular_velocity),
        }
    }

    pub fn to_attributes(&self) -> AttributeMap {
        let mut map = AttributeMap::new("MARKER", &self.name);
        map.set("BodyID", self.body.clone().unwrap_or_default());
        map.set_vector3("Position", &self.position);
        map.set_quaternion("Quaternion", &self.quaternion);
        if self.dump {
            map.set_bool("Dump", true);
        }
        map
    }

    pub fn dump_header(&self) -> String {
        "Time\tXP\tYP\tZP\tQW\tQX\tQY\tQZ".to_string()
    }

    pub fn dump_line(&self, time: f64, body_pose: &na::Isometry3<f64>) -> String {
        let pose = self.world_pose(body_pose);
        let p = pose.translation.vector;
        let q = pose.rotation;
        [time, p.x, p.y, p.z, q.w, q.i, q.j, q.k]
            .iter()
            .map(|x| crate::attributes::format_f64(*x))
            .collect::<Vec<_>>()
            .join("\t")
    }
}
