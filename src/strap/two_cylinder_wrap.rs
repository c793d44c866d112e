//! Routing a strap around two parallel cylinders.
//!
//! Solved in the first cylinder marker's frame (shared axis along local Z).
//! Candidate chains are built from point-circle and circle-circle tangents for
//! every wrap-sense combination, then compete against the one-cylinder paths;
//! the shortest consistent path wins, so the strap degrades to one cylinder or
//! a straight line exactly when the geometry says it should.

use rapier::na;

use crate::marker::MarkerState;

use super::cylinder_wrap::cylinder_wrap;
use super::{WrapPath, WrapStatus};

const TWO_PI: f64 = 2.0 * std::f64::consts::PI;
const MIN_ARC: f64 = 1.0e-9;

fn mod_two_pi(angle: f64) -> f64 {
    let mut a = angle % TWO_PI;
    if a < 0.0 {
        a += TWO_PI;
    }
    a
}

fn arc_between(from: f64, to: f64, ccw: bool) -> f64 {
    if ccw {
        mod_two_pi(to - from)
    } else {
        mod_two_pi(from - to)
    }
}

fn segment_distance(a: na::Vector2<f64>, b: na::Vector2<f64>, center: na::Vector2<f64>) -> f64 {
    let ab = b - a;
    let len2 = ab.norm_squared();
    if len2 == 0.0 {
        return (a - center).norm();
    }
    let t = ((center - a).dot(&ab) / len2).clamp(0.0, 1.0);
    (a + ab * t - center).norm()
}

/// Touch angle on a circle at `center` for the tangent from `point`.
/// `entry` selects the tangent where travel continues onto the circle; `ccw`
/// is the wrap sense on the circle.
fn point_tangent_angle(
    point: na::Vector2<f64>,
    center: na::Vector2<f64>,
    radius: f64,
    ccw: bool,
    entry: bool,
) -> Option<f64> {
    let d = point - center;
    let dist = d.norm();
    if dist <= radius {
        return None;
    }
    let alpha = d.y.atan2(d.x);
    let beta = (radius / dist).clamp(-1.0, 1.0).acos();
    Some(match (ccw, entry) {
        (true, true) => alpha + beta,
        (true, false) => alpha - beta,
        (false, true) => alpha - beta,
        (false, false) => alpha + beta,
    })
}

struct CylinderTangent {
    /// Touch point on the first circle.
    from: na::Vector2<f64>,
    /// Touch point on the second circle.
    to: na::Vector2<f64>,
}

/// Tangent segment from circle 1 (sense `ccw1`) to circle 2 (sense `ccw2`).
/// Same senses use an external tangent, opposite senses an internal one.
fn circle_circle_tangent(
    c1: na::Vector2<f64>,
    r1: f64,
    ccw1: bool,
    c2: na::Vector2<f64>,
    r2: f64,
    ccw2: bool,
) -> Option<CylinderTangent> {
    let delta = c2 - c1;
    let d = delta.norm();
    if d == 0.0 {
        return None;
    }
    let gamma = delta.y.atan2(delta.x);
    let (cos_arg, sign2) = if ccw1 == ccw2 {
        ((r1 - r2) / d, 1.0)
    } else {
        ((r1 + r2) / d, -1.0)
    };
    if cos_arg.abs() > 1.0 {
        return None;
    }
    let beta = cos_arg.acos();
    for phi in [gamma + beta, gamma - beta] {
        let n = na::Vector2::new(phi.cos(), phi.sin());
        let from = c1 + n * r1;
        let to = c2 + n * (r2 * sign2);
        // travel direction leaving circle 1 must head towards circle 2
        let travel = if ccw1 {
            na::Vector2::new(-n.y, n.x)
        } else {
            na::Vector2::new(n.y, -n.x)
        };
        if travel.dot(&(to - from)) > 0.0 {
            return Some(CylinderTangent { from, to });
        }
    }
    None
}

struct Candidate {
    theta1_in: f64,
    arc1: f64,
    theta2_in: f64,
    arc2: f64,
    ccw1: bool,
    ccw2: bool,
    exit1: na::Vector2<f64>,
    entry2: na::Vector2<f64>,
    exit2: na::Vector2<f64>,
    entry1: na::Vector2<f64>,
    planar_length: f64,
}

fn build_candidate(
    o: na::Vector2<f64>,
    i: na::Vector2<f64>,
    c2: na::Vector2<f64>,
    r1: f64,
    r2: f64,
    ccw1: bool,
    ccw2: bool,
) -> Option<Candidate> {
    let c1 = na::Vector2::zeros();
    let theta1_in = point_tangent_angle(o, c1, r1, ccw1, true)?;
    let theta2_out = point_tangent_angle(i, c2, r2, ccw2, false)?;
    let tangent = circle_circle_tangent(c1, r1, ccw1, c2, r2, ccw2)?;
    let theta1_out = tangent.from.y.atan2(tangent.from.x);
    let rel = tangent.to - c2;
    let theta2_in = rel.y.atan2(rel.x);

    let arc1 = arc_between(theta1_in, theta1_out, ccw1);
    let arc2 = arc_between(theta2_in, theta2_out, ccw2);
    if arc1 <= MIN_ARC
        || arc2 <= MIN_ARC
        || arc1 >= TWO_PI - MIN_ARC
        || arc2 >= TWO_PI - MIN_ARC
    {
        return None;
    }

    let entry1 = na::Vector2::new(theta1_in.cos(), theta1_in.sin()) * r1;
    let exit2 = c2 + na::Vector2::new(theta2_out.cos(), theta2_out.sin()) * r2;

    // free segments must stay clear of the other cylinder
    if segment_distance(o, entry1, c2) < r2 || segment_distance(exit2, i, c1) < r1 {
        return None;
    }

    let planar_length = (entry1 - o).norm()
        + r1 * arc1
        + (tangent.to - tangent.from).norm()
        + r2 * arc2
        + (i - exit2).norm();

    Some(Candidate {
        theta1_in,
        arc1,
        theta2_in,
        arc2,
        ccw1,
        ccw2,
        exit1: tangent.from,
        entry2: tangent.to,
        exit2,
        entry1,
        planar_length,
    })
}

/// True when every segment of a world-space polyline stays clear of a circle
/// given in the local frame.
fn polyline_clear(
    path: &WrapPath,
    to_local: &na::Isometry3<f64>,
    center: na::Vector2<f64>,
    radius: f64,
) -> bool {
    path.vertices.windows(2).all(|pair| {
        let a = to_local * na::Point3::from(pair[0].1);
        let b = to_local * na::Point3::from(pair[1].1);
        segment_distance(
            na::Vector2::new(a.x, a.y),
            na::Vector2::new(b.x, b.y),
            center,
        ) >= radius - 1.0e-9
    })
}

/// Computes the strap path from `origin` to `insertion` over two parallel
/// cylinders.
pub fn two_cylinder_wrap(
    origin: &MarkerState,
    insertion: &MarkerState,
    cylinder1: &MarkerState,
    radius1: f64,
    cylinder2: &MarkerState,
    radius2: f64,
    wrap_segments: usize,
) -> WrapPath {
    let to_local = cylinder1.pose.inverse();
    let o3 = to_local * na::Point3::from(origin.position());
    let i3 = to_local * na::Point3::from(insertion.position());
    let k3 = to_local * na::Point3::from(cylinder2.position());
    let o2 = na::Vector2::new(o3.x, o3.y);
    let i2 = na::Vector2::new(i3.x, i3.y);
    let c2 = na::Vector2::new(k3.x, k3.y);
    let c1 = na::Vector2::zeros();

    let straight = |status: WrapStatus| WrapPath {
        status,
        vertices: vec![
            (origin.body.clone(), origin.position()),
            (insertion.body.clone(), insertion.position()),
        ],
        length: (insertion.position() - origin.position()).norm(),
    };

    if (o2 - c1).norm() <= radius1
        || (i2 - c1).norm() <= radius1
        || (o2 - c2).norm() <= radius2
        || (i2 - c2).norm() <= radius2
    {
        return straight(WrapStatus::Degenerate);
    }

    // overlapping discs cannot carry a two-cylinder path
    if (c2 - c1).norm() < radius1 + radius2 {
        let mut path = cylinder_wrap(origin, insertion, cylinder1, radius1, wrap_segments);
        path.status = WrapStatus::Degenerate;
        return path;
    }

    if segment_distance(o2, i2, c1) >= radius1 && segment_distance(o2, i2, c2) >= radius2 {
        return straight(WrapStatus::Straight);
    }

    let mut best: Option<Candidate> = None;
    for ccw1 in [true, false] {
        for ccw2 in [true, false] {
            if let Some(candidate) = build_candidate(o2, i2, c2, radius1, radius2, ccw1, ccw2) {
                let better = best
                    .as_ref()
                    .map_or(true, |b| candidate.planar_length < b.planar_length);
                if better {
                    best = Some(candidate);
                }
            }
        }
    }

    // one-cylinder alternatives: the rope may never reach the second cylinder
    let mut choices: Vec<WrapPath> = Vec::new();
    if let Some(candidate) = best {
        choices.push(realize(
            candidate, origin, insertion, cylinder1, radius1, cylinder2, radius2, o3, i3, c2,
            wrap_segments,
        ));
    }
    let p1 = cylinder_wrap(origin, insertion, cylinder1, radius1, wrap_segments);
    if p1.status == WrapStatus::Wrapped && polyline_clear(&p1, &to_local, c2, radius2) {
        choices.push(p1);
    }
    let p2 = cylinder_wrap(origin, insertion, cylinder2, radius2, wrap_segments);
    if p2.status == WrapStatus::Wrapped && polyline_clear(&p2, &to_local, c1, radius1) {
        choices.push(p2);
    }

    choices
        .into_iter()
        .min_by(|a, b| a.length.total_cmp(&b.length))
        .unwrap_or_else(|| straight(WrapStatus::Straight))
}

#[allow(clippy::too_many_arguments)]
fn realize(
    candidate: Candidate,
    origin: &MarkerState,
    insertion: &MarkerState,
    cylinder1: &MarkerState,
    radius1: f64,
    cylinder2: &MarkerState,
    radius2: f64,
    o3: na::Point3<f64>,
    i3: na::Point3<f64>,
    c2: na::Vector2<f64>,
    wrap_segments: usize,
) -> WrapPath {
    // axial interpolation over the planar path, as in the one-cylinder wrap
    let len_in = (candidate.entry1 - na::Vector2::new(o3.x, o3.y)).norm();
    let len_arc1 = radius1 * candidate.arc1;
    let len_mid = (candidate.entry2 - candidate.exit1).norm();
    let len_arc2 = radius2 * candidate.arc2;
    let len_out = (na::Vector2::new(i3.x, i3.y) - candidate.exit2).norm();
    let planar_total = len_in + len_arc1 + len_mid + len_arc2 + len_out;
    let dz = i3.z - o3.z;
    let z_at = |s: f64| o3.z + dz * (s / planar_total);

    let segments = wrap_segments.max(1);
    let mut vertices = Vec::with_capacity(2 * segments + 4);
    vertices.push((origin.body.clone(), origin.position()));
    for k in 0..=segments {
        let fraction = k as f64 / segments as f64;
        let theta = if candidate.ccw1 {
            candidate.theta1_in + candidate.arc1 * fraction
        } else {
            candidate.theta1_in - candidate.arc1 * fraction
        };
        let local = na::Point3::new(
            radius1 * theta.cos(),
            radius1 * theta.sin(),
            z_at(len_in + len_arc1 * fraction),
        );
        vertices.push((cylinder1.body.clone(), (cylinder1.pose * local).coords));
    }
    for k in 0..=segments {
        let fraction = k as f64 / segments as f64;
        let theta = if candidate.ccw2 {
            candidate.theta2_in + candidate.arc2 * fraction
        } else {
            candidate.theta2_in - candidate.arc2 * fraction
        };
        let local = na::Point3::new(
            c2.x + radius2 * theta.cos(),
            c2.y + radius2 * theta.sin(),
            z_at(len_in + len_arc1 + len_mid + len_arc2 * fraction),
        );
        vertices.push((cylinder2.body.clone(), (cylinder1.pose * local).coords));
    }
    vertices.push((insertion.body.clone(), insertion.position()));

    let dz_arc1 = z_at(len_in + len_arc1) - z_at(len_in);
    let dz_arc2 =
        z_at(len_in + len_arc1 + len_mid + len_arc2) - z_at(len_in + len_arc1 + len_mid);
    let entry1_3 = na::Vector3::new(candidate.entry1.x, candidate.entry1.y, z_at(len_in));
    let exit1_3 = na::Vector3::new(
        candidate.exit1.x,
        candidate.exit1.y,
        z_at(len_in + len_arc1),
    );
    let entry2_3 = na::Vector3::new(
        candidate.entry2.x,
        candidate.entry2.y,
        z_at(len_in + len_arc1 + len_mid),
    );
    let exit2_3 = na::Vector3::new(
        candidate.exit2.x,
        candidate.exit2.y,
        z_at(len_in + len_arc1 + len_mid + len_arc2),
    );
    let length = (entry1_3 - o3.coords).norm()
        + (len_arc1 * len_arc1 + dz_arc1 * dz_arc1).sqrt()
        + (entry2_3 - exit1_3).norm()
        + (len_arc2 * len_arc2 + dz_arc2 * dz_arc2).sqrt()
        + (i3.coords - exit2_3).norm();

    WrapPath {
        status: WrapStatus::Wrapped,
        vertices,
        length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn world_marker(body: Option<&str>, position: na::Vector3<f64>) -> MarkerState {
        MarkerState {
            body: body.map(str::to_string),
            pose: na::Isometry3::from_parts(
                na::Translation3::from(position),
                na::UnitQuaternion::identity(),
            ),
            velocity: na::Vector3::zeros(),
        }
    }

    #[test]
    fn clear_line_stays_straight() {
        let origin = world_marker(Some("a"), na::Vector3::new(-5.0, 4.0, 0.0));
        let insertion = world_marker(Some("b"), na::Vector3::new(5.0, 4.0, 0.0));
        let c1 = world_marker(Some("c"), na::Vector3::zeros());
        let c2 = world_marker(Some("d"), na::Vector3::new(3.0, 0.0, 0.0));
        let path = two_cylinder_wrap(&origin, &insertion, &c1, 1.0, &c2, 1.0, 8);
        assert_eq!(path.status, WrapStatus::Straight);
        assert_relative_eq!(path.length, 10.0);
    }

    #[test]
    fn line_through_both_discs_wraps_both_cylinders() {
        // the direct line passes through both discs, so the rope lies over both
        let origin = world_marker(Some("a"), na::Vector3::new(-6.0, 1.0, 0.0));
        let insertion = world_marker(Some("b"), na::Vector3::new(10.0, 1.0, 0.0));
        let c1 = world_marker(Some("c"), na::Vector3::new(-2.0, 0.0, 0.0));
        let c2 = world_marker(Some("d"), na::Vector3::new(6.0, 0.0, 0.0));
        let path = two_cylinder_wrap(&origin, &insertion, &c1, 1.5, &c2, 1.5, 12);
        assert_eq!(path.status, WrapStatus::Wrapped);
        let straight = (insertion.position() - origin.position()).norm();
        assert!(path.length > straight);
        let hosts: Vec<_> = path
            .vertices
            .iter()
            .filter_map(|(b, _)| b.as_deref())
            .collect();
        assert!(hosts.contains(&"c") && hosts.contains(&"d"));
        // forces still balance over all four hosts
        let forces = crate::strap::point_forces_for(&path.vertices);
        let total: na::Vector3<f64> = forces.iter().map(|f| f.direction).sum();
        assert!(total.norm() < 1e-9);
    }

    #[test]
    fn distant_second_cylinder_degrades_to_one_cylinder() {
        let origin = world_marker(Some("a"), na::Vector3::new(2.0, 0.0, 0.0));
        let insertion = world_marker(Some("b"), na::Vector3::new(-2.0, 0.0, 0.0));
        let c1 = world_marker(Some("c"), na::Vector3::zeros());
        let c2 = world_marker(Some("d"), na::Vector3::new(0.0, 30.0, 0.0));
        let path = two_cylinder_wrap(&origin, &insertion, &c1, 1.0, &c2, 1.0, 16);
        assert_eq!(path.status, WrapStatus::Wrapped);
        let expected = 2.0 * 3.0_f64.sqrt() + std::f64::consts::PI / 3.0;
        assert_relative_eq!(path.length, expected, epsilon = 1e-6);
    }

    #[test]
    fn overlapping_cylinders_are_degenerate() {
        let origin = world_marker(Some("a"), na::Vector3::new(-5.0, 0.1, 0.0));
        let insertion = world_marker(Some("b"), na::Vector3::new(5.0, 0.1, 0.0));
        let c1 = world_marker(Some("c"), na::Vector3::zeros());
        let c2 = world_marker(Some("d"), na::Vector3::new(1.0, 0.0, 0.0));
        let path = two_cylinder_wrap(&origin, &insertion, &c1, 1.0, &c2, 1.0, 8);
        assert_eq!(path.status, WrapStatus::Degenerate);
    }
}
