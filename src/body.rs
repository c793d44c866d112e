//! Rigid bodies: mass properties, pose, twist and the per-axis limit tests
//! used by the abort predicates.

use rapier::na;
use rapier::prelude::*;

use crate::attributes::{AttributeMap, LoadError};
use crate::physics::PhysicsWorld;

/// Which limit a body violated, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitViolation {
    Position(usize),
    LinearVelocity(usize),
    AngularVelocity(usize),
    NumericalError,
}

impl std::fmt::Display for LimitViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let axis = |i: usize| ["X", "Y", "Z"][i];
        match self {
            LimitViolation::Position(i) => write!(f, "{} position", axis(*i)),
            LimitViolation::LinearVelocity(i) => write!(f, "{} linear velocity", axis(*i)),
            LimitViolation::AngularVelocity(i) => write!(f, "{} angular velocity", axis(*i)),
            LimitViolation::NumericalError => write!(f, "non-finite state"),
        }
    }
}

/// A dynamic rigid body backed by the physics engine.
#[derive(Debug)]
pub struct Body {
    name: String,
    handle: RigidBodyHandle,
    mass: f64,
    inertia: na::Matrix3<f64>,
    construction_position: na::Vector3<f64>,
    position_low_bound: na::Vector3<f64>,
    position_high_bound: na::Vector3<f64>,
    linear_velocity_low_bound: na::Vector3<f64>,
    linear_velocity_high_bound: na::Vector3<f64>,
    angular_velocity_low_bound: na::Vector3<f64>,
    angular_velocity_high_bound: na::Vector3<f64>,
    dump: bool,
}

/// Symmetric positive-definite test via leading principal minors.
fn is_positive_definite(m: &na::Matrix3<f64>) -> bool {
    let d1 = m[(0, 0)];
    let d2 = m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)];
    let d3 = m.determinant();
    d1 > 0.0 && d2 > 0.0 && d3 > 0.0
}

impl Body {
    /// Builds a body from its model attributes and inserts it into the world.
    pub fn from_attributes(
        attributes: &AttributeMap,
        world: &mut PhysicsWorld,
        linear_damping: f64,
        angular_damping: f64,
    ) -> Result<Body, LoadError> {
        let mass = attributes.get_f64("Mass")?;
        if mass <= 0.0 {
            return Err(attributes.invalid("Mass must be positive"));
        }

        let moi = attributes.get_f64_list("MOI")?;
        if moi.len() != 6 {
            return Err(attributes.invalid("MOI needs 6 values: Ixx Iyy Izz Ixy Ixz Iyz"));
        }
        let inertia = na::Matrix3::new(
            moi[0], moi[3], moi[4], //
            moi[3], moi[1], moi[5], //
            moi[4], moi[5], moi[2],
        );
        if !is_positive_definite(&inertia) {
            return Err(attributes.invalid("MOI is not positive-definite"));
        }

        let construction_position = attributes.get_vector3("ConstructionPosition")?;
        let position = match attributes.get_str_opt("Position") {
            Some(_) => attributes.get_vector3("Position")?,
            None => construction_position,
        };
        let quaternion = match attributes.get_str_opt("Quaternion") {
            Some(_) => attributes.get_quaternion("Quaternion")?,
            None => na::UnitQuaternion::identity(),
        };
        let linear_velocity = match attributes.get_str_opt("LinearVelocity") {
            Some(_) => attributes.get_vector3("LinearVelocity")?,
            None => na::Vector3::zeros(),
        };
        let angular_velocity = match attributes.get_str_opt("AngularVelocity") {
            Some(_) => attributes.get_vector3("AngularVelocity")?,
            None => na::Vector3::zeros(),
        };

        let unbounded = na::Vector3::repeat(f64::MAX);
        let bound = |name: &str, sign: f64| -> Result<na::Vector3<f64>, LoadError> {
            match attributes.get_str_opt(name) {
                Some(_) => attributes.get_vector3(name),
                None => Ok(unbounded * sign),
            }
        };

        let mass_properties =
            MassProperties::with_inertia_matrix(point![0.0, 0.0, 0.0], mass, inertia);
        let rigid_body = RigidBodyBuilder::dynamic()
            .position(na::Isometry3::from_parts(
                na::Translation3::from(position),
                quaternion,
            ))
            .linvel(linear_velocity)
            .angvel(angular_velocity)
            .linear_damping(linear_damping)
            .angular_damping(angular_damping)
            .additional_mass_properties(mass_properties)
            .build();
        let handle = world.insert_body(rigid_body);

        Ok(Body {
            name: attributes.id().to_string(),
            handle,
            mass,
            inertia,
            construction_position,
            position_low_bound: bound("PositionLowBound", -1.0)?,
            position_high_bound: bound("PositionHighBound", 1.0)?,
            linear_velocity_low_bound: bound("LinearVelocityLowBound", -1.0)?,
            linear_velocity_high_bound: bound("LinearVelocityHighBound", 1.0)?,
            angular_velocity_low_bound: bound("AngularVelocityLowBound", -1.0)?,
            angular_velocity_high_bound: bound("AngularVelocityHighBound", 1.0)?,
            dump: attributes.get_bool_or("Dump", false)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> RigidBodyHandle {
        self.handle
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }

    pub fn construction_position(&self) -> &na::Vector3<f64> {
        &self.construction_position
    }

    pub fn dump(&self) -> bool {
        self.dump
    }

    /// World pose of the body.
    pub fn pose(&self, world: &PhysicsWorld) -> na::Isometry3<f64> {
        *world.bodies().get(self.handle).map(|b| b.position()).unwrap_or(&na::Isometry3::identity())
    }

    pub fn linear_velocity(&self, world: &PhysicsWorld) -> na::Vector3<f64> {
        world
            .bodies()
            .get(self.handle)
            .map(|b| *b.linvel())
            .unwrap_or_else(na::Vector3::zeros)
    }

    pub fn angular_velocity(&self, world: &PhysicsWorld) -> na::Vector3<f64> {
        world
            .bodies()
            .get(self.handle)
            .map(|b| *b.angvel())
            .unwrap_or_else(na::Vector3::zeros)
    }

    /// Checks the body against its per-axis bounds and for non-finite state.
    pub fn test_limits(&self, world: &PhysicsWorld) -> Option<LimitViolation> {
        let pose = self.pose(world);
        let p = pose.translation.vector;
        let v = self.linear_velocity(world);
        let w = self.angular_velocity(world);

        for i in 0..3 {
            if !p[i].is_finite() || !v[i].is_finite() || !w[i].is_finite() {
                return Some(LimitViolation::NumericalError);
            }
        }
        for i in 0..3 {
            if p[i] < self.position_low_bound[i] || p[i] > self.position_high_bound[i] {
                return Some(LimitViolation::Position(i));
            }
        }
        for i in 0..3 {
            if v[i] < self.linear_velocity_low_bound[i] || v[i] > self.linear_velocity_high_bound[i]
            {
                return Some(LimitViolation::LinearVelocity(i));
            }
        }
        for i in 0..3 {
            if w[i] < self.angular_velocity_low_bound[i]
                || w[i] > self.angular_velocity_high_bound[i]
            {
                return Some(LimitViolation::AngularVelocity(i));
            }
        }
        None
    }

    /// Serialises the body, with its current pose and twist, for a snapshot.
    pub fn to_attributes(&self, world: &PhysicsWorld) -> AttributeMap {
        let mut map = AttributeMap::new("BODY", &self.name);
        map.set_f64("Mass", self.mass);
        let i = &self.inertia;
        map.set_f64_list(
            "MOI",
            &[
                i[(0, 0)],
                i[(1, 1)],
                i[(2, 2)],
                i[(0, 1)],
                i[(0, 2)],
                i[(1, 2)],
            ],
        );
        map.set_vector3("ConstructionPosition", &self.construction_position);
        let pose = self.pose(world);
        map.set_vector3("Position", &pose.translation.vector);
        map.set_quaternion("Quaternion", &pose.rotation);
        map.set_vector3("LinearVelocity", &self.linear_velocity(world));
        map.set_vector3("AngularVelocity", &self.angular_velocity(world));
        let bounded = |v: &na::Vector3<f64>| v.iter().all(|x| x.abs() < f64::MAX);
        if bounded(&self.position_low_bound) {
            map.set_vector3("PositionLowBound", &self.position_low_bound);
        }
        if bounded(&self.position_high_bound) {
            map.set_vector3("PositionHighBound", &self.position_high_bound);
        }
        if bounded(&self.linear_velocity_low_bound) {
            map.set_vector3("LinearVelocityLowBound", &self.linear_velocity_low_bound);
        }
        if bounded(&self.linear_velocity_high_bound) {
            map.set_vector3("LinearVelocityHighBound", &self.linear_velocity_high_bound);
        }
        if bounded(&self.angular_velocity_low_bound) {
            map.set_vector3("AngularVelocityLowBound", &self.angular_velocity_low_bound);
        }
        if bounded(&self.angular_velocity_high_bound) {
            map.set_vector3("AngularVelocityHighBound", &self.angular_velocity_high_bound);
        }
        if self.dump {
            map.set_bool("Dump", true);
        }
        map
    }

    pub fn dump_header(&self) -> String {
        "Time\tXP\tYP\tZP\tQW\tQX\tQY\tQZ\tXV\tYV\tZV\tXRV\tYRV\tZRV".to_string()
    }

    pub fn dump_line(&self, time: f64, world: &PhysicsWorld) -> String {
        let pose = self.pose(world);
        let p = pose.translation.vector;
        let q = pose.rotation;
        let v = self.linear_velocity(world);
        let w = self.angular_velocity(world);
        let fields = [
            time, p.x, p.y, p.z, q.w, q.i, q.j, q.k, v.x, v.y, v.z, w.x, w.y, w.z,
        ];
        fields
            .iter()
            .map(|x| crate::attributes::format_f64(*x))
            .collect::<Vec<_>>()
            .join("\t")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn body_map() -> AttributeMap {
        let mut m = AttributeMap::new("BODY", "torso");
        m.set("Mass", "1.0");
        m.set("MOI", "1 1 1 0 0 0");
        m.set("ConstructionPosition", "0 0 10");
        m
    }

    #[test]
    fn construction_position_is_default_pose() {
        let mut world = PhysicsWorld::new();
        let body = Body::from_attributes(&body_map(), &mut world, 0.0, 0.0).unwrap();
        assert_relative_eq!(body.pose(&world).translation.vector.z, 10.0);
    }

    #[test]
    fn non_positive_mass_is_rejected() {
        let mut world = PhysicsWorld::new();
        let mut m = body_map();
        m.set("Mass", "0.0");
        assert!(Body::from_attributes(&m, &mut world, 0.0, 0.0).is_err());
    }

    #[test]
    fn indefinite_inertia_is_rejected() {
        let mut world = PhysicsWorld::new();
        let mut m = body_map();
        m.set("MOI", "1 1 1 5 0 0");
        assert!(Body::from_attributes(&m, &mut world, 0.0, 0.0).is_err());
    }

    #[test]
    fn position_bound_violation_is_reported() {
        let mut world = PhysicsWorld::new();
        let mut m = body_map();
        m.set("PositionHighBound", "100 100 5");
        let body = Body::from_attributes(&m, &mut world, 0.0, 0.0).unwrap();
        assert_eq!(
            body.test_limits(&world),
            Some(LimitViolation::Position(2))
        );
    }

    #[test]
    fn within_bounds_passes() {
        let mut world = PhysicsWorld::new();
        let body = Body::from_attributes(&body_map(), &mut world, 0.0, 0.0).unwrap();
        assert_eq!(body.test_limits(&world), None);
    }
}
