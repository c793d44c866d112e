//! Two- and three-hinge inverse kinematics drivers.
//!
//! The chain is solved in the plane normal to the proximal hinge axis: the
//! two-link interior uses the closed-form triangle law, and the three-link
//! chain first resolves its redundant proximal angle with a bounded Brent
//! search on a reachability residual, then reduces to the two-link case.

use rapier::na;

use crate::attributes::{AttributeMap, LoadError};
use crate::joint::JointGeometry;
use crate::maths;

use super::DriverContext;

/// Signed angle from `u` to `v` about the unit normal `n`.
fn signed_angle(u: &na::Vector3<f64>, v: &na::Vector3<f64>, n: &na::Vector3<f64>) -> f64 {
    u.cross(v).dot(n).atan2(u.dot(v))
}

fn project(v: &na::Vector3<f64>, n: &na::Vector3<f64>) -> na::Vector3<f64> {
    v - n * v.dot(n)
}

fn rotate(v: &na::Vector3<f64>, n: &na::Vector3<f64>, angle: f64) -> na::Vector3<f64> {
    na::UnitQuaternion::from_axis_angle(&na::Unit::new_normalize(*n), angle) * v
}

/// IK driver over an ordered chain of two or three hinge joints.
pub struct HingeIk {
    target_marker: String,
    effector_marker: String,
    joints: Vec<String>,
}

struct PlanarChain {
    normal: na::Vector3<f64>,
    anchors: Vec<na::Vector3<f64>>,
    effector: na::Vector3<f64>,
    target: na::Vector3<f64>,
}

impl HingeIk {
    pub fn from_attributes(attributes: &AttributeMap, links: usize) -> Result<HingeIk, LoadError> {
        let joints = attributes.get_str_list("JointIDList")?;
        if joints.len() != links {
            return Err(attributes.invalid(format!("JointIDList must name {links} joints")));
        }
        Ok(HingeIk {
            target_marker: attributes.get_str("TargetMarkerID")?.to_string(),
            effector_marker: attributes.get_str("EffectorMarkerID")?.to_string(),
            joints,
        })
    }

    pub fn joint_ids(&self) -> &[String] {
        &self.joints
    }

    pub fn marker_ids(&self) -> [&str; 2] {
        [&self.target_marker, &self.effector_marker]
    }

    /// Target angles, one per joint in declared order, clamped to each
    /// joint's stop range.
    pub fn solve(&self, context: &DriverContext) -> Vec<f64> {
        let geometry: Vec<&JointGeometry> = match self
            .joints
            .iter()
            .map(|name| context.joint_geometry.get(name))
            .collect::<Option<Vec<_>>>()
        {
            Some(geometry) => geometry,
            None => return vec![0.0; self.joints.len()],
        };
        let chain = PlanarChain {
            normal: geometry[0].axis.normalize(),
            anchors: geometry.iter().map(|g| g.anchor).collect(),
            effector: context.markers[self.effector_marker.as_str()].position(),
            target: context.markers[self.target_marker.as_str()].position(),
        };
        match geometry.len() {
            2 => {
                let (delta1, delta2) = two_link_deltas(
                    &chain.normal,
                    chain.anchors[0],
                    chain.anchors[1],
                    chain.effector,
                    chain.target,
                );
                vec![
                    (geometry[0].angle + delta1).clamp(geometry[0].lo_stop, geometry[0].hi_stop),
                    (geometry[1].angle + delta2).clamp(geometry[1].lo_stop, geometry[1].hi_stop),
                ]
            }
            3 => three_link_solve(&chain, &geometry),
            _ => vec![0.0; self.joints.len()],
        }
    }

    pub fn append_attributes(&self, map: &mut AttributeMap) {
        map.set(
            "Type",
            if self.joints.len() == 2 {
                "TwoHingeJoint"
            } else {
                "ThreeHingeJoint"
            },
        );
        map.set("TargetMarkerID", self.target_marker.clone());
        map.set("EffectorMarkerID", self.effector_marker.clone());
        map.set_str_list("JointIDList", &self.joints);
    }
}

/// Closed-form two-link solve: angle changes for the proximal and distal
/// joints that put the effector on the target, keeping the current bend side.
fn two_link_deltas(
    normal: &na::Vector3<f64>,
    a1: na::Vector3<f64>,
    a2: na::Vector3<f64>,
    effector: na::Vector3<f64>,
    target: na::Vector3<f64>,
) -> (f64, f64) {
    let link1 = project(&(a2 - a1), normal);
    let link2 = project(&(effector - a2), normal);
    let to_target = project(&(target - a1), normal);
    let l1 = link1.norm();
    let l2 = link2.norm();
    if l1 == 0.0 || l2 == 0.0 || to_target.norm() == 0.0 {
        return (0.0, 0.0);
    }
    let d = to_target.norm().clamp((l1 - l2).abs().max(1e-12), l1 + l2);

    // triangle law at the proximal joint
    let beta = ((l1 * l1 + d * d - l2 * l2) / (2.0 * l1 * d))
        .clamp(-1.0, 1.0)
        .acos();
    let side = {
        let s = link1.cross(&link2).dot(normal);
        if s >= 0.0 {
            1.0
        } else {
            -1.0
        }
    };
    let aim = to_target / to_target.norm();

    // pick the proximal direction whose elbow bends to the current side
    let mut chosen = None;
    for sign in [side, -side] {
        let v1 = rotate(&aim, normal, sign * beta) * l1;
        let elbow = a1 + v1;
        let v2 = project(&(target - elbow), normal);
        let bend = v1.cross(&v2).dot(normal);
        if bend * side >= 0.0 || chosen.is_none() {
            chosen = Some((v1, v2));
            if bend * side >= 0.0 {
                break;
            }
        }
    }
    let (v1_desired, v2_desired) = chosen.unwrap();

    let delta1 = signed_angle(&link1, &v1_desired, normal);
    let relative_current = signed_angle(&link1, &link2, normal);
    let relative_desired = signed_angle(&v1_desired, &v2_desired, normal);
    (delta1, relative_desired - relative_current)
}

/// Three-link solve: Brent over the redundant proximal angle, then the
/// two-link closed form on the remaining pair.
fn three_link_solve(chain: &PlanarChain, geometry: &[&JointGeometry]) -> Vec<f64> {
    let normal = chain.normal;
    let a1 = chain.anchors[0];
    let l2 = project(&(chain.anchors[2] - chain.anchors[1]), &normal).norm();
    let l3 = project(&(chain.effector - chain.anchors[2]), &normal).norm();
    // a comfortable reduced reach keeps the distal pair away from lockout
    let comfortable = (l2 * l2 + l3 * l3)
        .sqrt()
        .clamp((l2 - l3).abs() + 1e-9, l2 + l3 - 1e-9);

    // reachability residual of the reduced problem after rotating joint 1
    let mut residual = |delta1: f64| {
        let a2 = a1 + rotate(&(chain.anchors[1] - a1), &normal, delta1);
        project(&(chain.target - a2), &normal).norm() - comfortable
    };
    let lo = geometry[0].lo_stop.max(geometry[0].angle - std::f64::consts::PI) - geometry[0].angle;
    let hi = geometry[0].hi_stop.min(geometry[0].angle + std::f64::consts::PI) - geometry[0].angle;
    let delta1 = match maths::zeroin(lo, hi, &mut residual, 1e-10) {
        Some(root) => root,
        // no root in range: take the end with the smaller residual
        None => {
            if residual(lo).abs() < residual(hi).abs() {
                lo
            } else {
                hi
            }
        }
    };

    // rotate the downstream chain with joint 1, then solve the distal pair
    let rotate_about_a1 =
        |p: na::Vector3<f64>| a1 + rotate(&(p - a1), &normal, delta1);
    let a2 = rotate_about_a1(chain.anchors[1]);
    let a3 = rotate_about_a1(chain.anchors[2]);
    let effector = rotate_about_a1(chain.effector);
    let (delta2, delta3) = two_link_deltas(&normal, a2, a3, effector, chain.target);

    vec![
        (geometry[0].angle + delta1).clamp(geometry[0].lo_stop, geometry[0].hi_stop),
        (geometry[1].angle + delta2).clamp(geometry[1].lo_stop, geometry[1].hi_stop),
        (geometry[2].angle + delta3).clamp(geometry[2].lo_stop, geometry[2].hi_stop),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn straight_reach_needs_no_bend() {
        // two unit links along +x, target exactly at full reach
        let n = na::Vector3::z();
        let (d1, d2) = two_link_deltas(
            &n,
            na::Vector3::zeros(),
            na::Vector3::new(1.0, 0.0, 0.0),
            na::Vector3::new(2.0, 0.0, 0.0),
            na::Vector3::new(2.0, 0.0, 0.0),
        );
        assert_relative_eq!(d1, 0.0, epsilon = 1e-9);
        assert_relative_eq!(d2, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn two_link_deltas_place_effector_on_target() {
        let n = na::Vector3::z();
        let a1 = na::Vector3::zeros();
        let a2 = na::Vector3::new(1.0, 0.0, 0.0);
        let effector = na::Vector3::new(2.0, 0.0, 0.0);
        let target = na::Vector3::new(1.0, 1.0, 0.0);
        let (d1, d2) = two_link_deltas(&n, a1, a2, effector, target);

        // replay the deltas through the chain
        let a2_new = a1 + rotate(&(a2 - a1), &n, d1);
        let link2 = rotate(&(effector - a2), &n, d1 + d2);
        let effector_new = a2_new + link2;
        assert_relative_eq!(effector_new.x, target.x, epsilon = 1e-9);
        assert_relative_eq!(effector_new.y, target.y, epsilon = 1e-9);
    }

    #[test]
    fn unreachable_target_clamps_to_full_extension() {
        let n = na::Vector3::z();
        let a1 = na::Vector3::zeros();
        let a2 = na::Vector3::new(1.0, 0.0, 0.0);
        let effector = na::Vector3::new(1.0, 1.0, 0.0);
        let target = na::Vector3::new(10.0, 0.0, 0.0);
        let (d1, d2) = two_link_deltas(&n, a1, a2, effector, target);
        let a2_new = a1 + rotate(&(a2 - a1), &n, d1);
        let link2 = rotate(&(effector - a2), &n, d1 + d2);
        let effector_new = a2_new + link2;
        // the chain straightens along the target direction
        assert_relative_eq!(effector_new.y, 0.0, epsilon = 1e-9);
        assert_relative_eq!(effector_new.x, 2.0, epsilon = 1e-9);
    }
}
