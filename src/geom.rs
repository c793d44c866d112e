//! Collision geometry attached to bodies, with the material parameters used
//! to build unilateral contacts, and the per-step contact records read back by
//! reflex drivers and data targets.

use rapier::na;
use rapier::prelude::*;

use crate::attributes::{AttributeMap, LoadError};
use crate::body::Body;
use crate::physics::PhysicsWorld;

use std::collections::HashMap;

/// One primitive shape.
#[derive(Debug)]
pub enum GeomShape {
    Sphere {
        radius: f64,
    },
    Box {
        lx: f64,
        ly: f64,
        lz: f64,
    },
    CappedCylinder {
        radius: f64,
        height: f64,
    },
    Plane {
        normal: na::Vector3<f64>,
        offset: f64,
    },
    Convex {
        points: Vec<na::Point3<f64>>,
    },
    Trimesh {
        vertices: Vec<na::Point3<f64>>,
        indices: Vec<[u32; 3]>,
    },
}

/// Contact material. The soft constraint terms have no direct engine analog
/// and ride along as model data; friction and bounce resolve pairwise with
/// the max rule.
#[derive(Debug, Clone)]
pub struct GeomMaterial {
    pub mu: f64,
    pub rho: f64,
    pub bounce: f64,
    pub soft_cfm: f64,
    pub soft_erp: f64,
}

/// A contact experienced by this geom during the last step.
#[derive(Debug, Clone)]
pub struct GeomContact {
    pub position: na::Vector3<f64>,
    pub normal: na::Vector3<f64>,
    pub force: na::Vector3<f64>,
}

/// A collision primitive attached to one body (or to the world).
#[derive(Debug)]
pub struct Geom {
    name: String,
    body: Option<String>,
    shape: GeomShape,
    material: GeomMaterial,
    abort: bool,
    adhesion: bool,
    exclude: Vec<String>,
    group: String,
    collider: ColliderHandle,
    contacts: Vec<GeomContact>,
    dump: bool,
}

impl Geom {
    pub fn from_attributes(
        attributes: &AttributeMap,
        bodies: &HashMap<String, Body>,
        world: &mut PhysicsWorld,
    ) -> Result<Geom, LoadError> {
        let body = match attributes.get_str_opt("BodyID") {
            None | Some("") | Some("World") => None,
            Some(name) => Some(name.to_string()),
        };
        let body_handle = match &body {
            None => world.world_body(),
            Some(name) => bodies
                .get(name)
                .map(Body::handle)
                .ok_or_else(|| attributes.unresolved("BodyID", name))?,
        };

        let shape = match attributes.get_str("Type")? {
            "Sphere" => GeomShape::Sphere {
                radius: attributes.get_f64("Radius")?,
            },
            "Box" => {
                let size = attributes.get_vector3("Size")?;
                GeomShape::Box {
                    lx: size.x,
                    ly: size.y,
                    lz: size.z,
                }
            }
            "CappedCylinder" => GeomShape::CappedCylinder {
                radius: attributes.get_f64("Radius")?,
                height: attributes.get_f64("Height")?,
            },
            "Plane" => {
                let abcd = attributes.get_f64_list("PlaneEquation")?;
                if abcd.len() != 4 {
                    return Err(attributes.invalid("PlaneEquation needs 4 values: a b c d"));
                }
                let normal = na::Vector3::new(abcd[0], abcd[1], abcd[2]);
                if normal.norm() == 0.0 {
                    return Err(attributes.invalid("plane normal must be non-zero"));
                }
                GeomShape::Plane {
                    normal: normal.normalize(),
                    offset: abcd[3] / normal.norm(),
                }
            }
            "Convex" => {
                let values = attributes.get_f64_list("Vertices")?;
                if values.len() % 3 != 0 || values.is_empty() {
                    return Err(attributes.invalid("Vertices must be triples"));
                }
                GeomShape::Convex {
                    points: values
                        .chunks(3)
                        .map(|c| na::Point3::new(c[0], c[1], c[2]))
                        .collect(),
                }
            }
            "Trimesh" => {
                let values = attributes.get_f64_list("Vertices")?;
                if values.len() % 3 != 0 || values.is_empty() {
                    return Err(attributes.invalid("Vertices must be triples"));
                }
                let raw_indices = attributes.get_f64_list("TriangleIndices")?;
                if raw_indices.len() % 3 != 0 || raw_indices.is_empty() {
                    return Err(attributes.invalid("TriangleIndices must be triples"));
                }
                GeomShape::Trimesh {
                    vertices: values
                        .chunks(3)
                        .map(|c| na::Point3::new(c[0], c[1], c[2]))
                        .collect(),
                    indices: raw_indices
                        .chunks(3)
                        .map(|c| [c[0] as u32, c[1] as u32, c[2] as u32])
                        .collect(),
                }
            }
            other => {
                return Err(attributes.invalid(format!("unknown geom Type \"{other}\"")));
            }
        };

        let material = GeomMaterial {
            mu: attributes.get_f64_or("Mu", 1.0)?,
            rho: attributes.get_f64_or("Rho", 0.0)?,
            bounce: attributes.get_f64_or("Bounce", 0.0)?,
            soft_cfm: attributes.get_f64_or("SoftCFM", 0.0)?,
            soft_erp: attributes.get_f64_or("SoftERP", 0.0)?,
        };

        let position = match attributes.get_str_opt("Position") {
            Some(_) => attributes.get_vector3("Position")?,
            None => na::Vector3::zeros(),
        };
        let quaternion = match attributes.get_str_opt("Quaternion") {
            Some(_) => attributes.get_quaternion("Quaternion")?,
            None => na::UnitQuaternion::identity(),
        };
        let local_pose =
            na::Isometry3::from_parts(na::Translation3::from(position), quaternion);

        let mut builder = match &shape {
            GeomShape::Sphere { radius } => ColliderBuilder::ball(*radius),
            GeomShape::Box { lx, ly, lz } => {
                ColliderBuilder::cuboid(lx / 2.0, ly / 2.0, lz / 2.0)
            }
            GeomShape::CappedCylinder { radius, height } => {
                // the cylindrical section runs along local Z
                let half = ((height - 2.0 * radius) / 2.0).max(0.0);
                ColliderBuilder::capsule_z(half, *radius)
            }
            GeomShape::Plane { normal, .. } => {
                ColliderBuilder::halfspace(UnitVector::new_normalize(*normal))
            }
            GeomShape::Convex { points } => ColliderBuilder::convex_hull(points)
                .ok_or_else(|| attributes.invalid("degenerate convex hull"))?,
            GeomShape::Trimesh { vertices, indices } => {
                ColliderBuilder::trimesh(vertices.clone(), indices.clone())
            }
        };
        let pose = match &shape {
            // the plane sits at its offset along the normal
            GeomShape::Plane { normal, offset } => na::Isometry3::from_parts(
                na::Translation3::from(local_pose.translation.vector + normal * *offset),
                local_pose.rotation,
            ),
            _ => local_pose,
        };
        builder = builder
            .position(pose)
            .density(0.0)
            .friction(material.mu)
            .friction_combine_rule(CoefficientCombineRule::Max)
            .restitution(material.bounce)
            .restitution_combine_rule(CoefficientCombineRule::Max)
            .active_hooks(ActiveHooks::FILTER_CONTACT_PAIRS);

        let collider = world.insert_collider(builder.build(), body_handle);

        let group = match attributes.get_str_opt("ContactGroup") {
            Some(group) => group.to_string(),
            None => body
                .clone()
                .unwrap_or_else(|| "environment".to_string()),
        };

        Ok(Geom {
            name: attributes.id().to_string(),
            body,
            shape,
            material,
            abort: attributes.get_bool_or("Abort", false)?,
            adhesion: attributes.get_bool_or("Adhesion", false)?,
            exclude: attributes.get_str_list_or_empty("ExcludeIDList"),
            group,
            collider,
            contacts: Vec::new(),
            dump: attributes.get_bool_or("Dump", false)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn shape(&self) -> &GeomShape {
        &self.shape
    }

    pub fn material(&self) -> &GeomMaterial {
        &self.material
    }

    pub fn collider(&self) -> ColliderHandle {
        self.collider
    }

    pub fn abort(&self) -> bool {
        self.abort
    }

    pub fn adhesion(&self) -> bool {
        self.adhesion
    }

    pub fn exclude_list(&self) -> &[String] {
        &self.exclude
    }

    pub fn contact_group(&self) -> &str {
        &self.group
    }

    pub fn dump(&self) -> bool {
        self.dump
    }

    /// Cleared at the start of every step before collision rebuild.
    pub fn clear_contacts(&mut self) {
        self.contacts.clear();
    }

    pub fn add_contact(&mut self, contact: GeomContact) {
        self.contacts.push(contact);
    }

    pub fn contacts(&self) -> &[GeomContact] {
        &self.contacts
    }

    /// Total contact force magnitude over the last step, the reaction load
    /// reflex drivers read.
    pub fn contact_load(&self) -> f64 {
        self.contacts
            .iter()
            .fold(na::Vector3::zeros(), |acc, c| acc + c.force)
            .norm()
    }

    pub fn to_attributes(&self) -> AttributeMap {
        let mut map = AttributeMap::new("GEOM", &self.name);
        map.set("BodyID", self.body.clone().unwrap_or_default());
        match &self.shape {
            GeomShape::Sphere { radius } => {
                map.set("Type", "Sphere");
                map.set_f64("Radius", *radius);
            }
            GeomShape::Box { lx, ly, lz } => {
                map.set("Type", "Box");
                map.set_f64_list("Size", &[*lx, *ly, *lz]);
            }
            GeomShape::CappedCylinder { radius, height } => {
                map.set("Type", "CappedCylinder");
                map.set_f64("Radius", *radius);
                map.set_f64("Height", *height);
            }
            GeomShape::Plane { normal, offset } => {
                map.set("Type", "Plane");
                map.set_f64_list(
                    "PlaneEquation",
                    &[normal.x, normal.y, normal.z, *offset],
                );
            }
            GeomShape::Convex { points } => {
                map.set("Type", "Convex");
                let flat: Vec<f64> = points.iter().flat_map(|p| [p.x, p.y, p.z]).collect();
                map.set_f64_list("Vertices", &flat);
            }
            GeomShape::Trimesh { vertices, indices } => {
                map.set("Type", "Trimesh");
                let flat: Vec<f64> = vertices.iter().flat_map(|p| [p.x, p.y, p.z]).collect();
                map.set_f64_list("Vertices", &flat);
                let flat_idx: Vec<f64> = indices
                    .iter()
                    .flat_map(|t| [t[0] as f64, t[1] as f64, t[2] as f64])
                    .collect();
                map.set_f64_list("TriangleIndices", &flat_idx);
            }
        }
        map.set_f64("Mu", self.material.mu);
        map.set_f64("Rho", self.material.rho);
        map.set_f64("Bounce", self.material.bounce);
        map.set_f64("SoftCFM", self.material.soft_cfm);
        map.set_f64("SoftERP", self.material.soft_erp);
        map.set_bool("Abort", self.abort);
        map.set_bool("Adhesion", self.adhesion);
        if !self.exclude.is_empty() {
            map.set_str_list("ExcludeIDList", &self.exclude);
        }
        map.set("ContactGroup", self.group.clone());
        if self.dump {
            map.set_bool("Dump", true);
        }
        map
    }

    pub fn dump_header(&self) -> String {
        "Time\tNumContacts\tFX\tFY\tFZ".to_string()
    }

    pub fn dump_line(&self, time: f64) -> String {
        let total = self
            .contacts
            .iter()
            .fold(na::Vector3::zeros(), |acc, c| acc + c.force);
        [time, self.contacts.len() as f64, total.x, total.y, total.z]
            .iter()
            .map(|x| crate::attributes::format_f64(*x))
            .collect::<Vec<_>>()
            .join("\t")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world_sphere(attrs: &[(&str, &str)]) -> Result<Geom, LoadError> {
        let mut world = PhysicsWorld::new();
        let bodies = HashMap::new();
        let mut m = AttributeMap::new("GEOM", "ground");
        m.set("Type", "Sphere");
        m.set("Radius", "0.5");
        for (k, v) in attrs {
            m.set(k, *v);
        }
        Geom::from_attributes(&m, &bodies, &mut world)
    }

    #[test]
    fn world_geom_defaults_to_environment_group() {
        let geom = world_sphere(&[]).unwrap();
        assert_eq!(geom.contact_group(), "environment");
        assert!(geom.body().is_none());
    }

    #[test]
    fn contact_load_sums_forces() {
        let mut geom = world_sphere(&[]).unwrap();
        geom.add_contact(GeomContact {
            position: na::Vector3::zeros(),
            normal: na::Vector3::z(),
            force: na::Vector3::new(0.0, 0.0, 3.0),
        });
        geom.add_contact(GeomContact {
            position: na::Vector3::zeros(),
            normal: na::Vector3::z(),
            force: na::Vector3::new(0.0, 0.0, 1.0),
        });
        assert_eq!(geom.contact_load(), 4.0);
        geom.clear_contacts();
        assert_eq!(geom.contact_load(), 0.0);
    }

    #[test]
    fn dangling_body_is_unresolved() {
        let err = world_sphere(&[("BodyID", "missing")]).unwrap_err();
        assert!(err.is_unresolved());
    }

    #[test]
    fn bad_plane_equation_is_rejected() {
        let mut world = PhysicsWorld::new();
        let bodies = HashMap::new();
        let mut m = AttributeMap::new("GEOM", "ground");
        m.set("Type", "Plane");
        m.set("PlaneEquation", "0 0 0 1");
        assert!(Geom::from_attributes(&m, &bodies, &mut world).is_err());
    }
}
