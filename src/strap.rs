//! Straps: piecewise-linear muscle paths that turn a scalar tension into
//! balanced point-forces on their host bodies.
//!
//! Geometry is recomputed from marker states each step; the tension scalar is
//! multiplied into the cached unit directions only when the forces are applied.

mod cylinder_wrap;
mod two_cylinder_wrap;

use std::collections::HashMap;

use log::warn;
use rapier::na;

use crate::attributes::{AttributeMap, LoadError};
use crate::marker::MarkerState;

pub use cylinder_wrap::cylinder_wrap;
pub use two_cylinder_wrap::two_cylinder_wrap;

/// Marker snapshots for the current step, keyed by marker id.
pub type MarkerStates = HashMap<String, MarkerState>;

/// A unit-direction force contribution at a world point on a host body.
///
/// The applied force is `direction * tension`; `body` is `None` when the point
/// rides a world-frame marker, in which case nothing receives the load.
#[derive(Debug, Clone)]
pub struct PointForce {
    pub body: Option<String>,
    pub point: na::Vector3<f64>,
    pub direction: na::Vector3<f64>,
}

/// Outcome of a wrap computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapStatus {
    Straight,
    Wrapped,
    Degenerate,
}

/// A wrapped or straight path expressed as hosted polyline vertices.
pub struct WrapPath {
    pub status: WrapStatus,
    /// Vertices as (host body, world point); interior wrap vertices ride the
    /// cylinder's body.
    pub vertices: Vec<(Option<String>, na::Vector3<f64>)>,
    /// Analytic path length (tangent segments plus exact arc lengths).
    pub length: f64,
}

/// Path variants a strap can take.
pub enum StrapKind {
    TwoPoint {
        origin: String,
        insertion: String,
    },
    NPoint {
        origin: String,
        via: Vec<String>,
        insertion: String,
    },
    CylinderWrap {
        origin: String,
        insertion: String,
        cylinder: String,
        radius: f64,
        wrap_segments: usize,
        last_status: Option<WrapStatus>,
        degenerate_logged: bool,
    },
    TwoCylinderWrap {
        origin: String,
        insertion: String,
        cylinder1: String,
        radius1: f64,
        cylinder2: String,
        radius2: f64,
        wrap_segments: usize,
        last_status: Option<WrapStatus>,
        degenerate_logged: bool,
    },
}

/// An ordered geometric path yielding per-body point forces under tension.
#[derive(Debug)]
pub struct Strap {
    name: String,
    kind: StrapKind,
    length: f64,
    last_length: Option<f64>,
    velocity: f64,
    tension: f64,
    point_forces: Vec<PointForce>,
    dump: bool,
}

impl Strap {
    pub fn from_attributes(attributes: &AttributeMap) -> Result<Strap, LoadError> {
        let origin = attributes.get_str("OriginMarkerID")?.to_string();
        let insertion = attributes.get_str("InsertionMarkerID")?.to_string();
        let kind = match attributes.get_str("Type")? {
            "TwoPoint" => StrapKind::TwoPoint { origin, insertion },
            "NPoint" => StrapKind::NPoint {
                origin,
                via: attributes.get_str_list("ViaPointMarkerIDList")?,
                insertion,
            },
            "CylinderWrap" => StrapKind::CylinderWrap {
                origin,
                insertion,
                cylinder: attributes.get_str("CylinderMarkerID")?.to_string(),
                radius: attributes.get_f64("CylinderRadius")?,
                wrap_segments: attributes.get_usize_or("WrapSegments", 8)?,
                last_status: None,
                degenerate_logged: false,
            },
            "TwoCylinderWrap" => StrapKind::TwoCylinderWrap {
                origin,
                insertion,
                cylinder1: attributes.get_str("Cylinder1MarkerID")?.to_string(),
                radius1: attributes.get_f64("Cylinder1Radius")?,
                cylinder2: attributes.get_str("Cylinder2MarkerID")?.to_string(),
                radius2: attributes.get_f64("Cylinder2Radius")?,
                wrap_segments: attributes.get_usize_or("WrapSegments", 8)?,
                last_status: None,
                degenerate_logged: false,
            },
            other => {
                return Err(attributes.invalid(format!("unknown strap Type \"{other}\"")));
            }
        };
        Ok(Strap {
            name: attributes.id().to_string(),
            kind,
            length: 0.0,
            last_length: None,
            velocity: 0.0,
            tension: 0.0,
            point_forces: Vec::new(),
            dump: attributes.get_bool_or("Dump", false)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &StrapKind {
        &self.kind
    }

    /// Marker ids this strap references, for load-time validation.
    pub fn marker_ids(&self) -> Vec<&str> {
        match &self.kind {
            StrapKind::TwoPoint { origin, insertion } => vec![origin, insertion],
            StrapKind::NPoint {
                origin,
                via,
                insertion,
            } => {
                let mut ids = vec![origin.as_str()];
                ids.extend(via.iter().map(String::as_str));
                ids.push(insertion);
                ids
            }
            StrapKind::CylinderWrap {
                origin,
                insertion,
                cylinder,
                ..
            } => vec![origin, insertion, cylinder],
            StrapKind::TwoCylinderWrap {
                origin,
                insertion,
                cylinder1,
                cylinder2,
                ..
            } => vec![origin, insertion, cylinder1, cylinder2],
        }
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    /// Shortening velocity: positive while the path is getting shorter.
    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn tension(&self) -> f64 {
        self.tension
    }

    pub fn set_tension(&mut self, tension: f64) {
        self.tension = tension;
    }

    pub fn point_forces(&self) -> &[PointForce] {
        &self.point_forces
    }

    pub fn dump(&self) -> bool {
        self.dump
    }

    /// Recomputes geometry, length, velocity and point forces for this step.
    ///
    /// `h` is the step size; the first update and wrap-mode changes hold the
    /// previous velocity so a path discontinuity cannot spike it.
    pub fn update(&mut self, markers: &MarkerStates, h: f64) {
        let (vertices, analytic_length, mode_changed) = match &mut self.kind {
            StrapKind::TwoPoint { origin, insertion } => {
                let o = &markers[origin.as_str()];
                let i = &markers[insertion.as_str()];
                let vertices = vec![
                    (o.body.clone(), o.position()),
                    (i.body.clone(), i.position()),
                ];
                (vertices, None, false)
            }
            StrapKind::NPoint {
                origin,
                via,
                insertion,
            } => {
                let mut vertices = Vec::with_capacity(via.len() + 2);
                let o = &markers[origin.as_str()];
                vertices.push((o.body.clone(), o.position()));
                for name in via.iter() {
                    let m = &markers[name.as_str()];
                    vertices.push((m.body.clone(), m.position()));
                }
                let i = &markers[insertion.as_str()];
                vertices.push((i.body.clone(), i.position()));
                (vertices, None, false)
            }
            StrapKind::CylinderWrap {
                origin,
                insertion,
                cylinder,
                radius,
                wrap_segments,
                last_status,
                degenerate_logged,
            } => {
                let path = cylinder_wrap(
                    &markers[origin.as_str()],
                    &markers[insertion.as_str()],
                    &markers[cylinder.as_str()],
                    *radius,
                    *wrap_segments,
                );
                if path.status == WrapStatus::Degenerate && !*degenerate_logged {
                    warn!("strap endpoint inside wrap cylinder, using straight path");
                    *degenerate_logged = true;
                }
                let mode_changed = last_status.map_or(false, |s| s != path.status);
                *last_status = Some(path.status);
                (path.vertices, Some(path.length), mode_changed)
            }
            StrapKind::TwoCylinderWrap {
                origin,
                insertion,
                cylinder1,
                radius1,
                cylinder2,
                radius2,
                wrap_segments,
                last_status,
                degenerate_logged,
            } => {
                let path = two_cylinder_wrap(
                    &markers[origin.as_str()],
                    &markers[insertion.as_str()],
                    &markers[cylinder1.as_str()],
                    *radius1,
                    &markers[cylinder2.as_str()],
                    *radius2,
                    *wrap_segments,
                );
                if path.status == WrapStatus::Degenerate && !*degenerate_logged {
                    warn!("two-cylinder wrap degenerated, using reduced path");
                    *degenerate_logged = true;
                }
                let mode_changed = last_status.map_or(false, |s| s != path.status);
                *last_status = Some(path.status);
                (path.vertices, Some(path.length), mode_changed)
            }
        };

        let polyline_length: f64 = vertices
            .windows(2)
            .map(|pair| (pair[1].1 - pair[0].1).norm())
            .sum();
        let new_length = analytic_length.unwrap_or(polyline_length);

        match self.last_length {
            Some(last) if h > 0.0 && !mode_changed => {
                self.velocity = -(new_length - last) / h;
            }
            Some(_) => {} // hold velocity for one step across a mode change
            None => self.velocity = 0.0,
        }
        self.last_length = Some(new_length);
        self.length = new_length;

        self.point_forces = point_forces_for(&vertices);
    }

    pub fn to_attributes(&self) -> AttributeMap {
        let mut map = AttributeMap::new("STRAP", &self.name);
        match &self.kind {
            StrapKind::TwoPoint { origin, insertion } => {
                map.set("Type", "TwoPoint");
                map.set("OriginMarkerID", origin.clone());
                map.set("InsertionMarkerID", insertion.clone());
            }
            StrapKind::NPoint {
                origin,
                via,
                insertion,
            } => {
                map.set("Type", "NPoint");
                map.set("OriginMarkerID", origin.clone());
                map.set("InsertionMarkerID", insertion.clone());
                map.set_str_list("ViaPointMarkerIDList", via);
            }
            StrapKind::CylinderWrap {
                origin,
                insertion,
                cylinder,
                radius,
                wrap_segments,
                ..
            } => {
                map.set("Type", "CylinderWrap");
                map.set("OriginMarkerID", origin.clone());
                map.set("InsertionMarkerID", insertion.clone());
                map.set("CylinderMarkerID", cylinder.clone());
                map.set_f64("CylinderRadius", *radius);
                map.set("WrapSegments", wrap_segments.to_string());
            }
            StrapKind::TwoCylinderWrap {
                origin,
                insertion,
                cylinder1,
                radius1,
                cylinder2,
                radius2,
                wrap_segments,
                ..
            } => {
                map.set("Type", "TwoCylinderWrap");
                map.set("OriginMarkerID", origin.clone());
                map.set("InsertionMarkerID", insertion.clone());
                map.set("Cylinder1MarkerID", cylinder1.clone());
                map.set_f64("Cylinder1Radius", *radius1);
                map.set("Cylinder2MarkerID", cylinder2.clone());
                map.set_f64("Cylinder2Radius", *radius2);
                map.set("WrapSegments", wrap_segments.to_string());
            }
        }
        if self.dump {
            map.set_bool("Dump", true);
        }
        map
    }
}

/// Point forces of a taut polyline: ends pull inward, interior vertices see the
/// difference of the neighbouring unit segment vectors. The result sums to zero
/// force and zero torque over the hosts for any tension.
pub(crate) fn point_forces_for(vertices: &[(Option<String>, na::Vector3<f64>)]) -> Vec<PointForce> {
    let n = vertices.len();
    if n < 2 {
        return Vec::new();
    }
    let mut units = Vec::with_capacity(n - 1);
    for pair in vertices.windows(2) {
        let d = pair[1].1 - pair[0].1;
        let norm = d.norm();
        units.push(if norm > 0.0 { d / norm } else { na::Vector3::zeros() });
    }
    let mut forces = Vec::with_capacity(n);
    for (i, (body, point)) in vertices.iter().enumerate() {
        let direction = if i == 0 {
            units[0]
        } else if i == n - 1 {
            -units[n - 2]
        } else {
            units[i] - units[i - 1]
        };
        forces.push(PointForce {
            body: body.clone(),
            point: *point,
            direction,
        });
    }
    forces
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rapier::na;

    pub(crate) fn fixed_marker(body: Option<&str>, position: na::Vector3<f64>) -> MarkerState {
        MarkerState {
            body: body.map(str::to_string),
            pose: na::Isometry3::from_parts(
                na::Translation3::from(position),
                na::UnitQuaternion::identity(),
            ),
            velocity: na::Vector3::zeros(),
        }
    }

    fn two_point_strap() -> Strap {
        let mut m = AttributeMap::new("STRAP", "s");
        m.set("Type", "TwoPoint");
        m.set("OriginMarkerID", "o");
        m.set("InsertionMarkerID", "i");
        Strap::from_attributes(&m).unwrap()
    }

    #[test]
    fn two_point_length_and_directions() {
        let mut strap = two_point_strap();
        let mut markers = MarkerStates::new();
        markers.insert("o".into(), fixed_marker(Some("a"), na::Vector3::new(0.0, 0.0, 0.0)));
        markers.insert("i".into(), fixed_marker(Some("b"), na::Vector3::new(3.0, 4.0, 0.0)));
        strap.update(&markers, 0.001);
        assert_relative_eq!(strap.length(), 5.0);
        assert_relative_eq!(strap.velocity(), 0.0);
        let forces = strap.point_forces();
        assert_relative_eq!(forces[0].direction.x, 0.6, epsilon = 1e-12);
        assert_relative_eq!(forces[1].direction.x, -0.6, epsilon = 1e-12);
    }

    #[test]
    fn velocity_positive_when_shortening() {
        let mut strap = two_point_strap();
        let mut markers = MarkerStates::new();
        markers.insert("o".into(), fixed_marker(Some("a"), na::Vector3::zeros()));
        markers.insert("i".into(), fixed_marker(Some("b"), na::Vector3::new(2.0, 0.0, 0.0)));
        strap.update(&markers, 0.1);
        markers.insert("i".into(), fixed_marker(Some("b"), na::Vector3::new(1.9, 0.0, 0.0)));
        strap.update(&markers, 0.1);
        assert_relative_eq!(strap.velocity(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn n_point_forces_balance() {
        let mut m = AttributeMap::new("STRAP", "s");
        m.set("Type", "NPoint");
        m.set("OriginMarkerID", "o");
        m.set("ViaPointMarkerIDList", "v1 v2");
        m.set("InsertionMarkerID", "i");
        let mut strap = Strap::from_attributes(&m).unwrap();

        let mut markers = MarkerStates::new();
        markers.insert("o".into(), fixed_marker(Some("a"), na::Vector3::new(0.0, 0.0, 0.0)));
        markers.insert("v1".into(), fixed_marker(Some("b"), na::Vector3::new(1.0, 0.5, 0.2)));
        markers.insert("v2".into(), fixed_marker(Some("b"), na::Vector3::new(2.0, -0.3, 0.1)));
        markers.insert("i".into(), fixed_marker(Some("c"), na::Vector3::new(3.0, 0.0, 0.0)));
        strap.update(&markers, 0.001);

        let tension = 7.0;
        let mut total = na::Vector3::zeros();
        let mut torque = na::Vector3::zeros();
        for pf in strap.point_forces() {
            let f = pf.direction * tension;
            total += f;
            torque += pf.point.cross(&f);
        }
        let tol = 1e-6 * tension * strap.length();
        assert!(total.norm() < tol, "net force {total:?}");
        assert!(torque.norm() < tol, "net torque {torque:?}");
    }
}
