//! Fluid sacs: closed triangle-mesh membranes over marker-backed vertices,
//! producing pressure loads on their host bodies.

use std::collections::HashMap;

use rapier::na;

use crate::attributes::{AttributeMap, LoadError};
use crate::strap::MarkerStates;

/// Per-triangle derived state for the current step.
#[derive(Debug, Clone)]
pub struct Triangle {
    pub indices: [usize; 3],
    pub area: f64,
    pub centroid: na::Vector3<f64>,
    pub normal: na::Vector3<f64>,
}

/// A pressure load on a marker's host body at the marker's world position.
#[derive(Debug, Clone)]
pub struct SacLoad {
    pub body: Option<String>,
    pub point: na::Vector3<f64>,
    pub force: na::Vector3<f64>,
}

/// Pressure models.
pub enum FluidSacKind {
    /// Isothermal ideal gas: P = max(0, nRT/V - P_ext).
    IdealGas {
        amount_of_substance: f64,
        temperature: f64,
        external_pressure: f64,
        gas_constant: f64,
    },
    /// Linear bulk-modulus fluid: P = P0 - K (V - V0)/V0 + (D/V0) V̇.
    Incompressible {
        fluid_volume: f64,
        bulk_modulus: f64,
        bulk_modulus_damping: f64,
        starting_pressure: f64,
    },
}

/// A closed membrane over ordered markers.
#[derive(Debug)]
pub struct FluidSac {
    name: String,
    markers: Vec<String>,
    triangle_indices: Vec<[usize; 3]>,
    kind: FluidSacKind,
    triangles: Vec<Triangle>,
    volume: f64,
    last_volume: Option<f64>,
    dot_volume: f64,
    pressure: f64,
    loads: Vec<SacLoad>,
    volume_sign: f64,
    dump: bool,
}

/// Signed volume contribution of one triangle against the origin.
fn signed_tetrahedron_volume(
    p1: &na::Vector3<f64>,
    p2: &na::Vector3<f64>,
    p3: &na::Vector3<f64>,
) -> f64 {
    p1.dot(&p2.cross(p3)) / 6.0
}

impl FluidSac {
    pub fn from_attributes(attributes: &AttributeMap) -> Result<FluidSac, LoadError> {
        let markers = attributes.get_str_list("MarkerIDList")?;
        let raw = attributes.get_f64_list("TriangleList")?;
        if raw.len() % 3 != 0 || raw.is_empty() {
            return Err(attributes.invalid("TriangleList must be index triples"));
        }
        let triangle_indices: Vec<[usize; 3]> = raw
            .chunks(3)
            .map(|c| [c[0] as usize, c[1] as usize, c[2] as usize])
            .collect();
        for t in &triangle_indices {
            if t.iter().any(|&i| i >= markers.len()) {
                return Err(attributes.invalid("triangle index out of range"));
            }
        }
        Self::check_mesh(&triangle_indices, markers.len())
            .map_err(|message| attributes.invalid(message))?;

        let kind = match attributes.get_str("Type")? {
            "IdealGas" => FluidSacKind::IdealGas {
                amount_of_substance: attributes.get_f64("AmountOfSubstance")?,
                temperature: attributes.get_f64("Temperature")?,
                external_pressure: attributes.get_f64_or("ExternalPressure", 101.325e3)?,
                gas_constant: attributes.get_f64_or("GasConstant", 8.314)?,
            },
            "Incompressible" => FluidSacKind::Incompressible {
                fluid_volume: attributes.get_f64("FluidVolume")?,
                bulk_modulus: attributes.get_f64("BulkModulus")?,
                bulk_modulus_damping: attributes.get_f64_or("BulkModulusDamping", 0.0)?,
                starting_pressure: attributes.get_f64("StartingPressure")?,
            },
            other => {
                return Err(attributes.invalid(format!("unknown fluid sac Type \"{other}\"")));
            }
        };

        Ok(FluidSac {
            name: attributes.id().to_string(),
            markers,
            triangle_indices,
            kind,
            triangles: Vec::new(),
            volume: 0.0,
            last_volume: None,
            dot_volume: 0.0,
            pressure: 0.0,
            loads: Vec::new(),
            volume_sign: 0.0,
            dump: attributes.get_bool_or("Dump", false)?,
        })
    }

    /// Every marker must be used, and every edge shared by exactly two
    /// triangles with opposite orientation.
    fn check_mesh(triangles: &[[usize; 3]], marker_count: usize) -> Result<(), String> {
        let mut used = vec![false; marker_count];
        let mut directed_edges: HashMap<(usize, usize), usize> = HashMap::new();
        for t in triangles {
            for &(a, b) in &[(t[0], t[1]), (t[1], t[2]), (t[2], t[0])] {
                if a == b {
                    return Err("triangle with repeated vertex".to_string());
                }
                *directed_edges.entry((a, b)).or_insert(0) += 1;
                used[a] = true;
            }
        }
        if let Some(index) = used.iter().position(|u| !u) {
            return Err(format!("marker index {index} is not used by any triangle"));
        }
        for (&(a, b), &count) in &directed_edges {
            if count != 1 {
                return Err(format!("edge {a}-{b} used {count} times in one direction"));
            }
            if directed_edges.get(&(b, a)) != Some(&1) {
                return Err(format!("edge {a}-{b} has no opposite-orientation partner"));
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn marker_ids(&self) -> &[String] {
        &self.markers
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn dot_volume(&self) -> f64 {
        self.dot_volume
    }

    pub fn pressure(&self) -> f64 {
        self.pressure
    }

    pub fn loads(&self) -> &[SacLoad] {
        &self.loads
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    pub fn dump(&self) -> bool {
        self.dump
    }

    /// Recomputes mesh state, volume, pressure and marker loads.
    ///
    /// Fails when the enclosed volume collapses or flips sign, which is a
    /// fatal model error.
    pub fn update(&mut self, markers: &MarkerStates, h: f64) -> Result<(), String> {
        let positions: Vec<na::Vector3<f64>> = self
            .markers
            .iter()
            .map(|name| markers[name.as_str()].position())
            .collect();

        self.triangles.clear();
        let mut volume = 0.0;
        for t in &self.triangle_indices {
            let (p0, p1, p2) = (&positions[t[0]], &positions[t[1]], &positions[t[2]]);
            let cross = (p1 - p0).cross(&(p2 - p0));
            let double_area = cross.norm();
            self.triangles.push(Triangle {
                indices: *t,
                area: double_area / 2.0,
                centroid: (p0 + p1 + p2) / 3.0,
                normal: if double_area > 0.0 {
                    cross / double_area
                } else {
                    na::Vector3::zeros()
                },
            });
            volume += signed_tetrahedron_volume(p0, p1, p2);
        }

        if volume == 0.0 {
            return Err(format!("fluid sac {}: enclosed volume is zero", self.name));
        }
        if self.volume_sign == 0.0 {
            self.volume_sign = volume.signum();
        } else if volume.signum() != self.volume_sign {
            return Err(format!(
                "fluid sac {}: enclosed volume changed sign",
                self.name
            ));
        }

        self.dot_volume = match self.last_volume {
            Some(last) if h > 0.0 => (volume - last) / h,
            _ => 0.0,
        };
        self.last_volume = Some(volume);
        self.volume = volume;

        self.pressure = match &self.kind {
            FluidSacKind::IdealGas {
                amount_of_substance,
                temperature,
                external_pressure,
                gas_constant,
            } => {
                (amount_of_substance * gas_constant * temperature / volume.abs()
                    - external_pressure)
                    .max(0.0)
            }
            FluidSacKind::Incompressible {
                fluid_volume,
                bulk_modulus,
                bulk_modulus_damping,
                starting_pressure,
            } => {
                // reducing volume raises pressure
                let volume_term = bulk_modulus * (volume - fluid_volume) / fluid_volume;
                let dot_volume_term = self.dot_volume * bulk_modulus_damping / fluid_volume;
                starting_pressure - volume_term + dot_volume_term
            }
        };

        // lump each triangle's P·A·n̂ equally onto its three vertices
        let mut accumulated: Vec<na::Vector3<f64>> =
            vec![na::Vector3::zeros(); self.markers.len()];
        for triangle in &self.triangles {
            let force = triangle.normal * (self.pressure * triangle.area / 3.0);
            for &index in &triangle.indices {
                accumulated[index] += force;
            }
        }
        self.loads = self
            .markers
            .iter()
            .zip(accumulated)
            .map(|(name, force)| {
                let state = &markers[name.as_str()];
                SacLoad {
                    body: state.body.clone(),
                    point: state.position(),
                    force,
                }
            })
            .collect();

        Ok(())
    }

    pub fn to_attributes(&self) -> AttributeMap {
        let mut map = AttributeMap::new("FLUIDSAC", &self.name);
        map.set_str_list("MarkerIDList", &self.markers);
        let flat: Vec<f64> = self
            .triangle_indices
            .iter()
            .flat_map(|t| [t[0] as f64, t[1] as f64, t[2] as f64])
            .collect();
        map.set_f64_list("TriangleList", &flat);
        match &self.kind {
            FluidSacKind::IdealGas {
                amount_of_substance,
                temperature,
                external_pressure,
                gas_constant,
            } => {
                map.set("Type", "IdealGas");
                map.set_f64("AmountOfSubstance", *amount_of_substance);
                map.set_f64("Temperature", *temperature);
                map.set_f64("ExternalPressure", *external_pressure);
                map.set_f64("GasConstant", *gas_constant);
            }
            FluidSacKind::Incompressible {
                fluid_volume,
                bulk_modulus,
                bulk_modulus_damping,
                starting_pressure,
            } => {
                map.set("Type", "Incompressible");
                map.set_f64("FluidVolume", *fluid_volume);
                map.set_f64("BulkModulus", *bulk_modulus);
                map.set_f64("BulkModulusDamping", *bulk_modulus_damping);
                map.set_f64("StartingPressure", *starting_pressure);
            }
        }
        if self.dump {
            map.set_bool("Dump", true);
        }
        map
    }

    pub fn dump_header(&self) -> String {
        "Time\tVolume\tDotVolume\tPressure".to_string()
    }

    pub fn dump_line(&self, time: f64) -> String {
        [time, self.volume, self.dot_volume, self.pressure]
            .iter()
            .map(|x| crate::attributes::format_f64(*x))
            .collect::<Vec<_>>()
            .join("\t")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::MarkerState;
    use approx::assert_relative_eq;

    const CUBE_TRIANGLES: [[usize; 3]; 12] = [
        [0, 2, 1],
        [0, 3, 2],
        [4, 5, 6],
        [4, 6, 7],
        [0, 1, 5],
        [0, 5, 4],
        [2, 3, 7],
        [2, 7, 6],
        [0, 4, 7],
        [0, 7, 3],
        [1, 2, 6],
        [1, 6, 5],
    ];

    fn cube_positions(scale: f64) -> Vec<na::Vector3<f64>> {
        [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
            [0.0, 1.0, 1.0],
        ]
        .iter()
        .map(|p| na::Vector3::new(p[0], p[1], p[2] * scale))
        .collect()
    }

    fn cube_states(scale: f64) -> MarkerStates {
        let mut states = MarkerStates::new();
        for (i, p) in cube_positions(scale).into_iter().enumerate() {
            states.insert(
                format!("m{i}"),
                MarkerState {
                    body: Some("shell".to_string()),
                    pose: na::Isometry3::from_parts(
                        na::Translation3::from(p),
                        na::UnitQuaternion::identity(),
                    ),
                    velocity: na::Vector3::zeros(),
                },
            );
        }
        states
    }

    fn gas_cube(nrt_over_pext: f64) -> FluidSac {
        let mut m = AttributeMap::new("FLUIDSAC", "sac");
        m.set("Type", "IdealGas");
        m.set(
            "MarkerIDList",
            "m0 m1 m2 m3 m4 m5 m6 m7",
        );
        let flat: Vec<f64> = CUBE_TRIANGLES
            .iter()
            .flat_map(|t| [t[0] as f64, t[1] as f64, t[2] as f64])
            .collect();
        m.set_f64_list("TriangleList", &flat);
        // choose n so that nRT = nrt_over_pext * P_ext
        let p_ext = 101.325e3;
        let n = nrt_over_pext * p_ext / (8.314 * 293.15);
        m.set_f64("AmountOfSubstance", n);
        m.set("Temperature", "293.15");
        m.set_f64("ExternalPressure", p_ext);
        FluidSac::from_attributes(&m).unwrap()
    }

    #[test]
    fn unit_cube_volume_is_one() {
        let mut sac = gas_cube(1.0);
        sac.update(&cube_states(1.0), 0.001).unwrap();
        assert_relative_eq!(sac.volume(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn gas_at_equilibrium_volume_has_zero_pressure() {
        let mut sac = gas_cube(1.0);
        sac.update(&cube_states(1.0), 0.001).unwrap();
        assert_relative_eq!(sac.pressure(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn compressed_gas_pushes_faces_outward() {
        let mut sac = gas_cube(1.0);
        sac.update(&cube_states(0.9), 0.001).unwrap();
        assert!(sac.pressure() > 0.0);
        // every vertex load points away from the cube centre
        let centre = na::Vector3::new(0.5, 0.5, 0.45);
        for load in sac.loads() {
            let outward = load.point - centre;
            assert!(load.force.dot(&outward) > 0.0);
        }
        // closed mesh: loads sum to zero
        let total: na::Vector3<f64> = sac.loads().iter().map(|l| l.force).sum();
        assert!(total.norm() < 1e-9 * sac.pressure());
    }

    #[test]
    fn volume_rate_follows_compression() {
        let mut sac = gas_cube(1.0);
        sac.update(&cube_states(1.0), 0.1).unwrap();
        sac.update(&cube_states(0.9), 0.1).unwrap();
        assert_relative_eq!(sac.dot_volume(), -1.0, epsilon = 1e-9);
    }

    #[test]
    fn open_mesh_is_rejected() {
        let mut m = AttributeMap::new("FLUIDSAC", "sac");
        m.set("Type", "IdealGas");
        m.set("MarkerIDList", "m0 m1 m2 m3");
        // single triangle: every edge lacks its partner
        m.set("TriangleList", "0 1 2");
        assert!(FluidSac::from_attributes(&m).is_err());
    }

    #[test]
    fn incompressible_pressure_rises_when_squeezed() {
        let mut m = AttributeMap::new("FLUIDSAC", "sac");
        m.set("Type", "Incompressible");
        m.set("MarkerIDList", "m0 m1 m2 m3 m4 m5 m6 m7");
        let flat: Vec<f64> = CUBE_TRIANGLES
            .iter()
            .flat_map(|t| [t[0] as f64, t[1] as f64, t[2] as f64])
            .collect();
        m.set_f64_list("TriangleList", &flat);
        m.set("FluidVolume", "1.0");
        m.set("BulkModulus", "2.0e5");
        m.set("BulkModulusDamping", "0");
        m.set("StartingPressure", "1000");
        let mut sac = FluidSac::from_attributes(&m).unwrap();
        sac.update(&cube_states(1.0), 0.001).unwrap();
        assert_relative_eq!(sac.pressure(), 1000.0, epsilon = 1e-9);
        sac.update(&cube_states(0.95), 0.001).unwrap();
        // P = P0 - K (V - V0)/V0 (+ damping term, which only helps)
        assert!(sac.pressure() > 1000.0);
    }
}
