//! Warehouse: a canonical reference trajectory of body positions used by the
//! ClosestWarehouse fitness, scored as the running minimum distance to any
//! reference row.

use rapier::na;

use crate::attributes::{AttributeMap, LoadError};

/// Rows of reference positions for a tracked body list.
#[derive(Debug)]
pub struct Warehouse {
    name: String,
    bodies: Vec<String>,
    rows: Vec<Vec<na::Vector3<f64>>>,
}

impl Warehouse {
    pub fn from_attributes(attributes: &AttributeMap) -> Result<Warehouse, LoadError> {
        let bodies = attributes.get_str_list("BodyIDList")?;
        if bodies.is_empty() {
            return Err(attributes.invalid("BodyIDList must not be empty"));
        }
        let flat = attributes.get_f64_list("Positions")?;
        let stride = bodies.len() * 3;
        if flat.is_empty() || flat.len() % stride != 0 {
            return Err(attributes.invalid(format!(
                "Positions must hold rows of {stride} values"
            )));
        }
        let rows = flat
            .chunks(stride)
            .map(|row| {
                row.chunks(3)
                    .map(|c| na::Vector3::new(c[0], c[1], c[2]))
                    .collect()
            })
            .collect();
        Ok(Warehouse {
            name: attributes.id().to_string(),
            bodies,
            rows,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body_ids(&self) -> &[String] {
        &self.bodies
    }

    /// Distance from the current body positions to the nearest reference row
    /// (root of the summed squared per-body distances).
    pub fn nearest_distance(&self, positions: &[na::Vector3<f64>]) -> f64 {
        self.rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(positions)
                    .map(|(reference, current)| (current - reference).norm_squared())
                    .sum::<f64>()
                    .sqrt()
            })
            .fold(f64::MAX, f64::min)
    }

    pub fn to_attributes(&self) -> AttributeMap {
        let mut map = AttributeMap::new("WAREHOUSE", &self.name);
        map.set_str_list("BodyIDList", &self.bodies);
        let flat: Vec<f64> = self
            .rows
            .iter()
            .flat_map(|row| row.iter().flat_map(|p| [p.x, p.y, p.z]))
            .collect();
        map.set_f64_list("Positions", &flat);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn nearest_row_wins() {
        let mut m = AttributeMap::new("WAREHOUSE", "w");
        m.set("BodyIDList", "torso");
        m.set("Positions", "0 0 0  10 0 0");
        let w = Warehouse::from_attributes(&m).unwrap();
        let d = w.nearest_distance(&[na::Vector3::new(9.0, 0.0, 0.0)]);
        assert_relative_eq!(d, 1.0);
    }

    #[test]
    fn row_shape_is_validated() {
        let mut m = AttributeMap::new("WAREHOUSE", "w");
        m.set("BodyIDList", "torso pelvis");
        m.set("Positions", "0 0 0");
        assert!(Warehouse::from_attributes(&m).is_err());
    }
}
