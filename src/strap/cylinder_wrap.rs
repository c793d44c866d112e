//! Routing a strap around a single cylinder.
//!
//! The problem is solved in the cylinder marker's frame: the cylinder axis is
//! the marker's local Z, so the wrap reduces to tangents and an arc in the XY
//! plane, with the axial component interpolated along the path.

use rapier::na;

use crate::marker::MarkerState;

use super::{WrapPath, WrapStatus};

const TWO_PI: f64 = 2.0 * std::f64::consts::PI;

fn mod_two_pi(angle: f64) -> f64 {
    let mut a = angle % TWO_PI;
    if a < 0.0 {
        a += TWO_PI;
    }
    a
}

/// Shortest distance from the segment `a`-`b` to the origin, in 2-D.
fn segment_distance_to_origin(a: na::Vector2<f64>, b: na::Vector2<f64>) -> f64 {
    let ab = b - a;
    let len2 = ab.norm_squared();
    if len2 == 0.0 {
        return a.norm();
    }
    let t = (-a.dot(&ab) / len2).clamp(0.0, 1.0);
    (a + ab * t).norm()
}

struct WrapSense {
    theta_entry: f64,
    theta_exit: f64,
    arc: f64,
}

/// Tangent construction for one wrap sense. `ccw` selects the rotation
/// direction the path takes around the circle.
fn sense(o: na::Vector2<f64>, i: na::Vector2<f64>, radius: f64, ccw: bool) -> WrapSense {
    let alpha_o = o.y.atan2(o.x);
    let alpha_i = i.y.atan2(i.x);
    let beta_o = (radius / o.norm()).clamp(-1.0, 1.0).acos();
    let beta_i = (radius / i.norm()).clamp(-1.0, 1.0).acos();
    if ccw {
        let theta_entry = alpha_o + beta_o;
        let theta_exit = alpha_i - beta_i;
        WrapSense {
            theta_entry,
            theta_exit,
            arc: mod_two_pi(theta_exit - theta_entry),
        }
    } else {
        let theta_entry = alpha_o - beta_o;
        let theta_exit = alpha_i + beta_i;
        WrapSense {
            theta_entry,
            theta_exit,
            arc: mod_two_pi(theta_entry - theta_exit),
        }
    }
}

/// Computes the strap path from `origin` to `insertion` around the cylinder
/// marker (axis along its local Z) of the given radius.
pub fn cylinder_wrap(
    origin: &MarkerState,
    insertion: &MarkerState,
    cylinder: &MarkerState,
    radius: f64,
    wrap_segments: usize,
) -> WrapPath {
    let to_local = cylinder.pose.inverse();
    let o3 = to_local * na::Point3::from(origin.position());
    let i3 = to_local * na::Point3::from(insertion.position());
    let o2 = na::Vector2::new(o3.x, o3.y);
    let i2 = na::Vector2::new(i3.x, i3.y);

    let straight = |status: WrapStatus| WrapPath {
        status,
        vertices: vec![
            (origin.body.clone(), origin.position()),
            (insertion.body.clone(), insertion.position()),
        ],
        length: (insertion.position() - origin.position()).norm(),
    };

    // an endpoint inside the cylinder has no tangent: fall back to straight
    if o2.norm() <= radius || i2.norm() <= radius {
        return straight(WrapStatus::Degenerate);
    }

    if segment_distance_to_origin(o2, i2) >= radius {
        return straight(WrapStatus::Straight);
    }

    let ccw = sense(o2, i2, radius, true);
    let cw = sense(o2, i2, radius, false);
    let (chosen, ccw_chosen) = if ccw.arc <= cw.arc {
        (ccw, true)
    } else {
        (cw, false)
    };
    if chosen.arc <= 1e-12 || chosen.arc >= TWO_PI - 1e-12 {
        return straight(WrapStatus::Straight);
    }

    // 2-D path lengths fix the axial interpolation
    let t_entry = na::Vector2::new(chosen.theta_entry.cos(), chosen.theta_entry.sin()) * radius;
    let t_exit = na::Vector2::new(chosen.theta_exit.cos(), chosen.theta_exit.sin()) * radius;
    let len_in = (t_entry - o2).norm();
    let len_arc = radius * chosen.arc;
    let len_out = (i2 - t_exit).norm();
    let planar_total = len_in + len_arc + len_out;
    let dz = i3.z - o3.z;
    let z_at = |s: f64| o3.z + dz * (s / planar_total);

    let segments = wrap_segments.max(1);
    let mut vertices = Vec::with_capacity(segments + 3);
    vertices.push((origin.body.clone(), origin.position()));
    for k in 0..=segments {
        let fraction = k as f64 / segments as f64;
        let theta = if ccw_chosen {
            chosen.theta_entry + chosen.arc * fraction
        } else {
            chosen.theta_entry - chosen.arc * fraction
        };
        let local = na::Point3::new(
            radius * theta.cos(),
            radius * theta.sin(),
            z_at(len_in + len_arc * fraction),
        );
        let world = cylinder.pose * local;
        vertices.push((cylinder.body.clone(), world.coords));
    }
    vertices.push((insertion.body.clone(), insertion.position()));

    // analytic length: straight tangents in 3-D plus the helical arc
    let entry3 = na::Vector3::new(t_entry.x, t_entry.y, z_at(len_in));
    let exit3 = na::Vector3::new(t_exit.x, t_exit.y, z_at(len_in + len_arc));
    let dz_arc = exit3.z - entry3.z;
    let length = (entry3 - o3.coords).norm()
        + (len_arc * len_arc + dz_arc * dz_arc).sqrt()
        + (i3.coords - exit3).norm();

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
    fn symmetric_wrap_length_is_tangents_plus_sixty_degree_arc() {
        let origin = world_marker(Some("a"), na::Vector3::new(2.0, 0.0, 0.0));
        let insertion = world_marker(Some("b"), na::Vector3::new(-2.0, 0.0, 0.0));
        let cylinder = world_marker(Some("c"), na::Vector3::zeros());
        let path = cylinder_wrap(&origin, &insertion, &cylinder, 1.0, 16);
        assert_eq!(path.status, WrapStatus::Wrapped);
        let expected = 2.0 * 3.0_f64.sqrt() + std::f64::consts::PI / 3.0;
        assert_relative_eq!(path.length, expected, epsilon = 1e-6);
    }

    #[test]
    fn cylinder_force_is_along_y_by_symmetry() {
        let origin = world_marker(Some("a"), na::Vector3::new(2.0, 0.0, 0.0));
        let insertion = world_marker(Some("b"), na::Vector3::new(-2.0, 0.0, 0.0));
        let cylinder = world_marker(Some("c"), na::Vector3::zeros());
        let path = cylinder_wrap(&origin, &insertion, &cylinder, 1.0, 32);
        let forces = crate::strap::point_forces_for(&path.vertices);
        let mut on_cylinder = na::Vector3::zeros();
        for pf in &forces {
            if pf.body.as_deref() == Some("c") {
                on_cylinder += pf.direction;
            }
        }
        assert!(on_cylinder.y.abs() > 1e-6);
        assert_relative_eq!(on_cylinder.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(on_cylinder.z, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn clear_line_stays_straight() {
        let origin = world_marker(Some("a"), na::Vector3::new(2.0, 3.0, 0.0));
        let insertion = world_marker(Some("b"), na::Vector3::new(-2.0, 3.0, 0.0));
        let cylinder = world_marker(Some("c"), na::Vector3::zeros());
        let path = cylinder_wrap(&origin, &insertion, &cylinder, 1.0, 8);
        assert_eq!(path.status, WrapStatus::Straight);
        assert_relative_eq!(path.length, 4.0);
    }

    #[test]
    fn endpoint_inside_cylinder_degenerates() {
        let origin = world_marker(Some("a"), na::Vector3::new(0.5, 0.0, 0.0));
        let insertion = world_marker(Some("b"), na::Vector3::new(-2.0, 0.0, 0.0));
        let cylinder = world_marker(Some("c"), na::Vector3::zeros());
        let path = cylinder_wrap(&origin, &insertion, &cylinder, 1.0, 8);
        assert_eq!(path.status, WrapStatus::Degenerate);
    }

    #[test]
    fn axial_offset_produces_helical_arc() {
        let origin = world_marker(Some("a"), na::Vector3::new(2.0, 0.0, 0.0));
        let insertion = world_marker(Some("b"), na::Vector3::new(-2.0, 0.0, 1.0));
        let cylinder = world_marker(Some("c"), na::Vector3::zeros());
        let planar = cylinder_wrap(
            &origin,
            &world_marker(Some("b"), na::Vector3::new(-2.0, 0.0, 0.0)),
            &cylinder,
            1.0,
            8,
        );
        let helical = cylinder_wrap(&origin, &insertion, &cylinder, 1.0, 8);
        assert!(helical.length > planar.length);
        assert!(helical.length < planar.length + 1.0);
    }
}
