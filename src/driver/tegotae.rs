//! Tegotae reflex driver: a decentralised oscillator whose phase is slowed by
//! the measured ground-reaction load of a named geom.

use crate::attributes::{AttributeMap, LoadError};

use super::DriverContext;

/// Per-leg phase oscillator, θ̇ = ω − σ·N·cos θ.
///
/// The load N is read from the step just completed, giving the reflex its
/// deterministic one-step delay.
pub struct Tegotae {
    omega: f64,
    sigma: f64,
    geom: String,
    theta: f64,
}

impl Tegotae {
    pub fn from_attributes(attributes: &AttributeMap) -> Result<Tegotae, LoadError> {
        Ok(Tegotae {
            omega: attributes.get_f64("Omega")?,
            sigma: attributes.get_f64("Sigma")?,
            geom: attributes.get_str("GeomID")?.to_string(),
            theta: attributes.get_f64_or("InitialPhase", 0.0)?,
        })
    }

    pub fn geom_id(&self) -> &str {
        &self.geom
    }

    pub fn phase(&self) -> f64 {
        self.theta
    }

    /// Advances the phase by one forward-Euler step and returns sin θ.
    pub fn update(&mut self, context: &DriverContext) -> f64 {
        let load = context.geom_loads.get(&self.geom).copied().unwrap_or(0.0);
        let theta_dot = self.omega - self.sigma * load * self.theta.cos();
        self.theta += theta_dot * context.step_size;
        self.theta.sin()
    }

    pub fn append_attributes(&self, map: &mut AttributeMap) {
        map.set("Type", "Tegotae");
        map.set_f64("Omega", self.omega);
        map.set_f64("Sigma", self.sigma);
        map.set("GeomID", self.geom.clone());
        map.set_f64("InitialPhase", self.theta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::joint::JointGeometry;
    use crate::strap::MarkerStates;
    use approx::assert_relative_eq;
    use std::collections::HashMap;

    fn tegotae(omega: f64, sigma: f64) -> Tegotae {
        let mut m = AttributeMap::new("DRIVER", "d");
        m.set_f64("Omega", omega);
        m.set_f64("Sigma", sigma);
        m.set("GeomID", "foot");
        Tegotae::from_attributes(&m).unwrap()
    }

    #[test]
    fn unloaded_phase_advances_at_omega() {
        let mut t = tegotae(2.0, 1.0);
        let markers = MarkerStates::new();
        let loads = HashMap::new();
        let joints: HashMap<String, JointGeometry> = HashMap::new();
        let context = DriverContext {
            time: 0.0,
            step_size: 0.01,
            step_count: 0,
            markers: &markers,
            geom_loads: &loads,
            joint_geometry: &joints,
        };
        for _ in 0..100 {
            t.update(&context);
        }
        assert_relative_eq!(t.phase(), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn ground_load_retards_the_phase() {
        let markers = MarkerStates::new();
        let joints: HashMap<String, JointGeometry> = HashMap::new();
        let mut loaded = tegotae(2.0, 0.5);
        let mut free = tegotae(2.0, 0.5);
        let mut loads = HashMap::new();
        loads.insert("foot".to_string(), 10.0);
        let no_loads = HashMap::new();
        // near θ=0, cos θ > 0, so load slows the oscillator
        for _ in 0..10 {
            loaded.update(&DriverContext {
                time: 0.0,
                step_size: 0.01,
                step_count: 0,
                markers: &markers,
                geom_loads: &loads,
                joint_geometry: &joints,
            });
            free.update(&DriverContext {
                time: 0.0,
                step_size: 0.01,
                step_count: 0,
                markers: &markers,
                geom_loads: &no_loads,
                joint_geometry: &joints,
            });
        }
        assert!(loaded.phase() < free.phase());
    }
}
