//! Joints anchored by marker pairs, built on the engine's impulse joints.
//!
//! Per-variant state covers hinge stops and motors, the fixed joint's stress
//! sampling, and the bare angular/linear motors. The joint axis convention is
//! the anchoring marker's local X axis.

use rapier::na;
use rapier::prelude::*;

use crate::attributes::{AttributeMap, LoadError};
use crate::body::Body;
use crate::maths::{ButterworthFilter, Filter, MovingAverage};
use crate::marker::{Axis, Marker};
use crate::physics::PhysicsWorld;
use crate::strap::MarkerStates;

use std::collections::HashMap;

/// Hinge geometry snapshot consumed by the inverse-kinematics drivers.
#[derive(Debug, Clone)]
pub struct JointGeometry {
    pub anchor: na::Vector3<f64>,
    pub axis: na::Vector3<f64>,
    pub angle: f64,
    pub lo_stop: f64,
    pub hi_stop: f64,
}

/// Stop and motor configuration of a hinge.
#[derive(Debug)]
pub struct HingeData {
    lo_stop: f64,
    hi_stop: f64,
    stop_cfm: f64,
    stop_erp: f64,
    stop_bounce: f64,
    lo_stop_torque_limit: f64,
    hi_stop_torque_limit: f64,
    stop_torque_filter: Option<MovingAverage>,
    motor_target_velocity: f64,
    motor_max_force: f64,
    angle: f64,
    stop_torque: f64,
}

/// Stress sampling configuration of a fixed joint.
#[derive(Debug)]
pub struct FixedData {
    stress_area: f64,
    stress_limit: f64,
    cutoff_frequency: f64,
    window: usize,
    low_pass: Option<StressFilter>,
    stress: f64,
}

#[derive(Debug)]
enum StressFilter {
    Butterworth(ButterworthFilter),
    Window(MovingAverage),
}

#[derive(Debug)]
pub enum JointKind {
    Hinge(HingeData),
    Universal,
    Ball,
    Fixed(FixedData),
    FloatingHinge,
    AMotor {
        motor_target_velocity: f64,
        motor_max_force: f64,
    },
    LMotor {
        motor_target_velocity: f64,
        motor_max_force: f64,
    },
}

/// A constraint between the bodies of two markers.
#[derive(Debug)]
pub struct Joint {
    name: String,
    body1_marker: String,
    body2_marker: String,
    handle: ImpulseJointHandle,
    kind: JointKind,
    dump: bool,
}

/// Signed twist of `q` about the local X axis, in [-pi, pi].
fn twist_about_x(q: &na::UnitQuaternion<f64>) -> f64 {
    let mut angle = 2.0 * q.i.atan2(q.w);
    if angle > std::f64::consts::PI {
        angle -= 2.0 * std::f64::consts::PI;
    } else if angle < -std::f64::consts::PI {
        angle += 2.0 * std::f64::consts::PI;
    }
    angle
}

impl Joint {
    /// Builds the joint from attributes and inserts its engine constraint.
    pub fn from_attributes(
        attributes: &AttributeMap,
        markers: &HashMap<String, Marker>,
        bodies: &HashMap<String, Body>,
        world: &mut PhysicsWorld,
    ) -> Result<Joint, LoadError> {
        let marker1_id = attributes.get_str("Body1MarkerID")?.to_string();
        let marker2_id = attributes.get_str("Body2MarkerID")?.to_string();
        let marker1 = markers
            .get(&marker1_id)
            .ok_or_else(|| attributes.unresolved("Body1MarkerID", &marker1_id))?;
        let marker2 = markers
            .get(&marker2_id)
            .ok_or_else(|| attributes.unresolved("Body2MarkerID", &marker2_id))?;
        if marker1.body() == marker2.body() {
            return Err(attributes.invalid("joint markers must be on distinct bodies"));
        }
        let body_handle = |marker: &Marker| -> Result<RigidBodyHandle, LoadError> {
            match marker.body() {
                None => Ok(world.world_body()),
                Some(name) => bodies
                    .get(name)
                    .map(Body::handle)
                    .ok_or_else(|| attributes.unresolved("BodyID", name)),
            }
        };
        let handle1 = body_handle(marker1)?;
        let handle2 = body_handle(marker2)?;

        let frame1 = marker1.local_isometry();
        let frame2 = marker2.local_isometry();

        let kind = match attributes.get_str("Type")? {
            "Hinge" => {
                let lo_stop = attributes.get_f64_or("LowStop", -f64::MAX)?;
                let hi_stop = attributes.get_f64_or("HighStop", f64::MAX)?;
                if lo_stop > hi_stop {
                    return Err(attributes.invalid("LowStop must not exceed HighStop"));
                }
                let window = attributes.get_usize_or("StopTorqueWindow", 0)?;
                JointKind::Hinge(HingeData {
                    lo_stop,
                    hi_stop,
                    stop_cfm: attributes.get_f64_or("StopCFM", 0.0)?,
                    stop_erp: attributes.get_f64_or("StopERP", 0.2)?,
                    stop_bounce: attributes.get_f64_or("StopBounce", 0.0)?,
                    lo_stop_torque_limit: attributes.get_f64_or("LoStopTorqueLimit", -f64::MAX)?,
                    hi_stop_torque_limit: attributes.get_f64_or("HiStopTorqueLimit", f64::MAX)?,
                    stop_torque_filter: (window > 0).then(|| MovingAverage::new(window)),
                    motor_target_velocity: attributes.get_f64_or("MotorTargetVelocity", 0.0)?,
                    motor_max_force: attributes.get_f64_or("MotorMaxForce", 0.0)?,
                    angle: 0.0,
                    stop_torque: 0.0,
                })
            }
            "Universal" => JointKind::Universal,
            "Ball" => JointKind::Ball,
            "Fixed" => {
                let window = attributes.get_usize_or("StressLimitWindow", 0)?;
                JointKind::Fixed(FixedData {
                    stress_area: attributes.get_f64_or("StressCalculationArea", 1.0)?,
                    stress_limit: attributes.get_f64_or("StressLimit", -1.0)?,
                    // the Butterworth variant needs the step size, so it is
                    // installed at late initialisation
                    cutoff_frequency: attributes.get_f64_or("StressLimitCutoffFrequency", 0.0)?,
                    window,
                    low_pass: (window > 0)
                        .then(|| StressFilter::Window(MovingAverage::new(window))),
                    stress: 0.0,
                })
            }
            "FloatingHinge" => JointKind::FloatingHinge,
            "AMotor" => JointKind::AMotor {
                motor_target_velocity: attributes.get_f64_or("MotorTargetVelocity", 0.0)?,
                motor_max_force: attributes.get_f64_or("MotorMaxForce", 0.0)?,
            },
            "LMotor" => JointKind::LMotor {
                motor_target_velocity: attributes.get_f64_or("MotorTargetVelocity", 0.0)?,
                motor_max_force: attributes.get_f64_or("MotorMaxForce", 0.0)?,
            },
            other => {
                return Err(attributes.invalid(format!("unknown joint Type \"{other}\"")));
            }
        };

        let mut builder = GenericJointBuilder::new(kind.locked_axes())
            .local_frame1(frame1)
            .local_frame2(frame2);
        if let JointKind::Hinge(hinge) = &kind {
            if hinge.lo_stop > -f64::MAX || hinge.hi_stop < f64::MAX {
                builder = builder.limits(JointAxis::AngX, [hinge.lo_stop, hinge.hi_stop]);
            }
        }
        let handle = world.insert_joint(handle1, handle2, builder.build());

        Ok(Joint {
            name: attributes.id().to_string(),
            body1_marker: marker1_id,
            body2_marker: marker2_id,
            handle,
            kind,
            dump: attributes.get_bool_or("Dump", false)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &JointKind {
        &self.kind
    }

    pub fn handle(&self) -> ImpulseJointHandle {
        self.handle
    }

    pub fn marker_ids(&self) -> (&str, &str) {
        (&self.body1_marker, &self.body2_marker)
    }

    pub fn dump(&self) -> bool {
        self.dump
    }

    /// Current hinge angle, when this joint has one.
    pub fn angle(&self) -> Option<f64> {
        match &self.kind {
            JointKind::Hinge(hinge) => Some(hinge.angle),
            _ => None,
        }
    }

    /// Hinge geometry for the IK drivers, `None` for non-hinges.
    pub fn geometry(&self, markers: &MarkerStates) -> Option<JointGeometry> {
        let hinge = match &self.kind {
            JointKind::Hinge(hinge) => hinge,
            _ => return None,
        };
        let m1 = markers.get(&self.body1_marker)?;
        Some(JointGeometry {
            anchor: m1.position(),
            axis: m1.axis(Axis::X),
            angle: hinge.angle,
            lo_stop: hinge.lo_stop,
            hi_stop: hinge.hi_stop,
        })
    }

    /// Applies motor commands and samples angles, stop torques and stress.
    pub fn update(&mut self, world: &mut PhysicsWorld, markers: &MarkerStates, h: f64) {
        let impulses = world
            .joints()
            .get(self.handle)
            .map(|j| j.impulses)
            .unwrap_or_else(na::Vector6::zeros);
        let inv_h = if h > 0.0 { 1.0 / h } else { 0.0 };

        match &mut self.kind {
            JointKind::Hinge(hinge) => {
                let m1 = &markers[self.body1_marker.as_str()];
                let m2 = &markers[self.body2_marker.as_str()];
                let relative = m1.pose.rotation.inverse() * m2.pose.rotation;
                hinge.angle = twist_about_x(&relative);

                if hinge.motor_max_force > 0.0 {
                    if let Some(joint) = world.joints_mut().get_mut(self.handle) {
                        joint
                            .data
                            .set_motor_velocity(JointAxis::AngX, hinge.motor_target_velocity, 1.0)
                            .set_motor_max_force(JointAxis::AngX, hinge.motor_max_force);
                    }
                }

                // constraint torque along the hinge axis; only meaningful as a
                // stop torque while the angle sits outside its stops
                let raw = impulses[3] * inv_h;
                hinge.stop_torque = match &mut hinge.stop_torque_filter {
                    Some(filter) => filter.update(raw),
                    None => raw,
                };
            }
            JointKind::Fixed(fixed) => {
                let force =
                    na::Vector3::new(impulses[0], impulses[1], impulses[2]).norm() * inv_h;
                let raw = force / fixed.stress_area;
                fixed.stress = match &mut fixed.low_pass {
                    Some(StressFilter::Butterworth(filter)) => filter.update(raw),
                    Some(StressFilter::Window(filter)) => filter.update(raw),
                    None => raw,
                };
            }
            JointKind::AMotor {
                motor_target_velocity,
                motor_max_force,
            } => {
                if let Some(joint) = world.joints_mut().get_mut(self.handle) {
                    joint
                        .data
                        .set_motor_velocity(JointAxis::AngX, *motor_target_velocity, 1.0)
                        .set_motor_max_force(JointAxis::AngX, *motor_max_force);
                }
            }
            JointKind::LMotor {
                motor_target_velocity,
                motor_max_force,
            } => {
                if let Some(joint) = world.joints_mut().get_mut(self.handle) {
                    joint
                        .data
                        .set_motor_velocity(JointAxis::X, *motor_target_velocity, 1.0)
                        .set_motor_max_force(JointAxis::X, *motor_max_force);
                }
            }
            JointKind::Universal | JointKind::Ball | JointKind::FloatingHinge => {}
        }
    }

    /// Installs the fixed-joint stress filter once the step size is known.
    pub fn late_initialisation(&mut self, h: f64) {
        if let JointKind::Fixed(fixed) = &mut self.kind {
            if fixed.cutoff_frequency > 0.0 && h > 0.0 {
                fixed.low_pass = Some(StressFilter::Butterworth(ButterworthFilter::low_pass(
                    fixed.cutoff_frequency,
                    1.0 / h,
                )));
            }
        }
    }

    /// Abort reason when a stop torque or stress limit is exceeded.
    pub fn check_abort(&self) -> Option<String> {
        match &self.kind {
            JointKind::Hinge(hinge) => {
                let outside_stops =
                    hinge.angle <= hinge.lo_stop || hinge.angle >= hinge.hi_stop;
                if !outside_stops {
                    return None;
                }
                if hinge.stop_torque < hinge.lo_stop_torque_limit
                    || hinge.stop_torque > hinge.hi_stop_torque_limit
                {
                    return Some(format!(
                        "joint {}: stop torque {} outside limits",
                        self.name, hinge.stop_torque
                    ));
                }
                None
            }
            JointKind::Fixed(fixed) => {
                if fixed.stress_limit > 0.0 && fixed.stress > fixed.stress_limit {
                    return Some(format!(
                        "joint {}: stress {} over limit {}",
                        self.name, fixed.stress, fixed.stress_limit
                    ));
                }
                None
            }
            _ => None,
        }
    }

    pub fn to_attributes(&self) -> AttributeMap {
        let mut map = AttributeMap::new("JOINT", &self.name);
        map.set("Body1MarkerID", self.body1_marker.clone());
        map.set("Body2MarkerID", self.body2_marker.clone());
        match &self.kind {
            JointKind::Hinge(hinge) => {
                map.set("Type", "Hinge");
                if hinge.lo_stop > -f64::MAX {
                    map.set_f64("LowStop", hinge.lo_stop);
                }
                if hinge.hi_stop < f64::MAX {
                    map.set_f64("HighStop", hinge.hi_stop);
                }
                map.set_f64("StopCFM", hinge.stop_cfm);
                map.set_f64("StopERP", hinge.stop_erp);
                map.set_f64("StopBounce", hinge.stop_bounce);
                if hinge.lo_stop_torque_limit > -f64::MAX {
                    map.set_f64("LoStopTorqueLimit", hinge.lo_stop_torque_limit);
                }
                if hinge.hi_stop_torque_limit < f64::MAX {
                    map.set_f64("HiStopTorqueLimit", hinge.hi_stop_torque_limit);
                }
                if hinge.motor_max_force > 0.0 {
                    map.set_f64("MotorTargetVelocity", hinge.motor_target_velocity);
                    map.set_f64("MotorMaxForce", hinge.motor_max_force);
                }
            }
            JointKind::Universal => map.set("Type", "Universal"),
            JointKind::Ball => map.set("Type", "Ball"),
            JointKind::Fixed(fixed) => {
                map.set("Type", "Fixed");
                map.set_f64("StressCalculationArea", fixed.stress_area);
                if fixed.stress_limit > 0.0 {
                    map.set_f64("StressLimit", fixed.stress_limit);
                }
                if fixed.cutoff_frequency > 0.0 {
                    map.set_f64("StressLimitCutoffFrequency", fixed.cutoff_frequency);
                }
                if fixed.window > 0 {
                    map.set("StressLimitWindow", fixed.window.to_string());
                }
            }
            JointKind::FloatingHinge => map.set("Type", "FloatingHinge"),
            JointKind::AMotor {
                motor_target_velocity,
                motor_max_force,
            } => {
                map.set("Type", "AMotor");
                map.set_f64("MotorTargetVelocity", *motor_target_velocity);
                map.set_f64("MotorMaxForce", *motor_max_force);
            }
            JointKind::LMotor {
                motor_target_velocity,
                motor_max_force,
            } => {
                map.set("Type", "LMotor");
                map.set_f64("MotorTargetVelocity", *motor_target_velocity);
                map.set_f64("MotorMaxForce", *motor_max_force);
            }
        }
        if self.dump {
            map.set_bool("Dump", true);
        }
        map
    }

    pub fn dump_header(&self) -> String {
        match &self.kind {
            JointKind::Hinge(_) => "Time\tAngle\tStopTorque".to_string(),
            JointKind::Fixed(_) => "Time\tStress".to_string(),
            _ => "Time".to_string(),
        }
    }

    pub fn dump_line(&self, time: f64) -> String {
        let fields: Vec<f64> = match &self.kind {
            JointKind::Hinge(hinge) => vec![time, hinge.angle, hinge.stop_torque],
            JointKind::Fixed(fixed) => vec![time, fixed.stress],
            _ => vec![time],
        };
        fields
            .iter()
            .map(|x| crate::attributes::format_f64(*x))
            .collect::<Vec<_>>()
            .join("\t")
    }
}

impl JointKind {
    fn locked_axes(&self) -> JointAxesMask {
        match self {
            JointKind::Hinge(_) => JointAxesMask::LOCKED_REVOLUTE_AXES,
            JointKind::Universal => {
                JointAxesMask::X | JointAxesMask::Y | JointAxesMask::Z | JointAxesMask::ANG_Z
            }
            JointKind::Ball => JointAxesMask::LOCKED_SPHERICAL_AXES,
            JointKind::Fixed(_) => JointAxesMask::LOCKED_FIXED_AXES,
            JointKind::FloatingHinge => JointAxesMask::ANG_Y | JointAxesMask::ANG_Z,
            JointKind::AMotor { .. } | JointKind::LMotor { .. } => JointAxesMask::empty(),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn twist_extraction_matches_axis_angle() {
        let q = na::UnitQuaternion::from_axis_angle(&na::Vector3::x_axis(), 0.7);
        assert_relative_eq!(twist_about_x(&q), 0.7, epsilon = 1e-12);
        let q = na::UnitQuaternion::from_axis_angle(&na::Vector3::x_axis(), -2.0);
        assert_relative_eq!(twist_about_x(&q), -2.0, epsilon = 1e-12);
    }

    #[test]
    fn markers_on_same_body_are_rejected() {
        let mut world = PhysicsWorld::new();
        let mut bodies = HashMap::new();
        let mut body_map = AttributeMap::new("BODY", "torso");
        body_map.set("Mass", "1");
        body_map.set("MOI", "1 1 1 0 0 0");
        body_map.set("ConstructionPosition", "0 0 0");
        bodies.insert(
            "torso".to_string(),
            Body::from_attributes(&body_map, &mut world, 0.0, 0.0).unwrap(),
        );

        let mut markers = HashMap::new();
        for name in ["m1", "m2"] {
            let mut m = AttributeMap::new("MARKER", name);
            m.set("BodyID", "torso");
            markers.insert(name.to_string(), Marker::from_attributes(&m).unwrap());
        }

        let mut j = AttributeMap::new("JOINT", "bad");
        j.set("Type", "Hinge");
        j.set("Body1MarkerID", "m1");
        j.set("Body2MarkerID", "m2");
        assert!(Joint::from_attributes(&j, &markers, &bodies, &mut world).is_err());
    }

    #[test]
    fn dangling_marker_is_unresolved() {
        let mut world = PhysicsWorld::new();
        let bodies = HashMap::new();
        let markers = HashMap::new();
        let mut j = AttributeMap::new("JOINT", "knee");
        j.set("Type", "Hinge");
        j.set("Body1MarkerID", "missing");
        j.set("Body2MarkerID", "also_missing");
        let err = Joint::from_attributes(&j, &markers, &bodies, &mut world).unwrap_err();
        assert!(err.is_unresolved());
    }

    #[test]
    fn equal_stops_make_a_fixed_axis() {
        // lo == hi is accepted and pins the angle range to a point
        let mut world = PhysicsWorld::new();
        let mut bodies = HashMap::new();
        for name in ["a", "b"] {
            let mut body_map = AttributeMap::new("BODY", name);
            body_map.set("Mass", "1");
            body_map.set("MOI", "1 1 1 0 0 0");
            body_map.set("ConstructionPosition", "0 0 0");
            bodies.insert(
                name.to_string(),
                Body::from_attributes(&body_map, &mut world, 0.0, 0.0).unwrap(),
            );
        }
        let mut markers = HashMap::new();
        for (name, body) in [("m1", "a"), ("m2", "b")] {
            let mut m = AttributeMap::new("MARKER", name);
            m.set("BodyID", body);
            markers.insert(name.to_string(), Marker::from_attributes(&m).unwrap());
        }
        let mut j = AttributeMap::new("JOINT", "pinned");
        j.set("Type", "Hinge");
        j.set("Body1MarkerID", "m1");
        j.set("Body2MarkerID", "m2");
        j.set("LowStop", "0.5");
        j.set("HighStop", "0.5");
        let joint = Joint::from_attributes(&j, &markers, &bodies, &mut world).unwrap();
        match joint.kind() {
            JointKind::Hinge(h) => {
                assert_relative_eq!(h.lo_stop, h.hi_stop);
            }
            _ => unreachable!(),
        }
    }
}
