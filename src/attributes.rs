//! String attribute maps for every model element, with typed accessors.
//!
//! Each element of the model file is a flat tag plus a string→string map; this
//! module owns the map and the parsing of numbers, vectors, quaternions and
//! whitespace-separated lists out of it.

use std::collections::BTreeMap;

use rapier::na;
use thiserror::Error;

/// Quaternions in the model file must be unit to within this tolerance.
const QUATERNION_NORM_TOLERANCE: f64 = 1.0e-6;

/// A problem found while loading a model element.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("{tag} ID=\"{id}\": missing attribute {attribute}")]
    MissingAttribute {
        tag: String,
        id: String,
        attribute: String,
    },
    #[error("{tag} ID=\"{id}\": attribute {attribute}=\"{value}\": {reason}")]
    Malformed {
        tag: String,
        id: String,
        attribute: String,
        value: String,
        reason: String,
    },
    #[error("{tag} ID=\"{id}\": reference {attribute}=\"{value}\" not found")]
    Unresolved {
        tag: String,
        id: String,
        attribute: String,
        value: String,
    },
    #[error("{tag} ID=\"{id}\": {message}")]
    Invalid {
        tag: String,
        id: String,
        message: String,
    },
    #[error("{0}")]
    Document(String),
}

impl LoadError {
    /// True for dangling references, which the fixed-point loader retries.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, LoadError::Unresolved { .. })
    }
}

/// Ordered string→string attribute map for one model element.
#[derive(Debug, Clone, Default)]
pub struct AttributeMap {
    tag: String,
    id: String,
    map: BTreeMap<String, String>,
}

impl AttributeMap {
    pub fn new(tag: &str, id: &str) -> AttributeMap {
        AttributeMap {
            tag: tag.to_string(),
            id: id.to_string(),
            map: BTreeMap::new(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.map.iter()
    }

    fn missing(&self, name: &str) -> LoadError {
        LoadError::MissingAttribute {
            tag: self.tag.clone(),
            id: self.id.clone(),
            attribute: name.to_string(),
        }
    }

    fn malformed(&self, name: &str, value: &str, reason: &str) -> LoadError {
        LoadError::Malformed {
            tag: self.tag.clone(),
            id: self.id.clone(),
            attribute: name.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Builds the unresolved-reference error for a named attribute.
    pub fn unresolved(&self, name: &str, value: &str) -> LoadError {
        LoadError::Unresolved {
            tag: self.tag.clone(),
            id: self.id.clone(),
            attribute: name.to_string(),
            value: value.to_string(),
        }
    }

    /// Builds a free-form validity error for this element.
    pub fn invalid(&self, message: impl Into<String>) -> LoadError {
        LoadError::Invalid {
            tag: self.tag.clone(),
            id: self.id.clone(),
            message: message.into(),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<&str, LoadError> {
        self.map
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| self.missing(name))
    }

    pub fn get_str_opt(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    pub fn get_f64(&self, name: &str) -> Result<f64, LoadError> {
        let raw = self.get_str(name)?;
        raw.trim()
            .parse::<f64>()
            .map_err(|_| self.malformed(name, raw, "not a number"))
    }

    pub fn get_f64_or(&self, name: &str, default: f64) -> Result<f64, LoadError> {
        match self.get_str_opt(name) {
            Some(_) => self.get_f64(name),
            None => Ok(default),
        }
    }

    pub fn get_usize(&self, name: &str) -> Result<usize, LoadError> {
        let raw = self.get_str(name)?;
        raw.trim()
            .parse::<usize>()
            .map_err(|_| self.malformed(name, raw, "not a non-negative integer"))
    }

    pub fn get_usize_or(&self, name: &str, default: usize) -> Result<usize, LoadError> {
        match self.get_str_opt(name) {
            Some(_) => self.get_usize(name),
            None => Ok(default),
        }
    }

    pub fn get_i64_or(&self, name: &str, default: i64) -> Result<i64, LoadError> {
        match self.get_str_opt(name) {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|_| self.malformed(name, raw, "not an integer")),
            None => Ok(default),
        }
    }

    pub fn get_bool_or(&self, name: &str, default: bool) -> Result<bool, LoadError> {
        let raw = match self.get_str_opt(name) {
            Some(raw) => raw,
            None => return Ok(default),
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(self.malformed(name, raw, "not a boolean")),
        }
    }

    pub fn get_f64_list(&self, name: &str) -> Result<Vec<f64>, LoadError> {
        let raw = self.get_str(name)?;
        raw.split_whitespace()
            .map(|token| {
                token
                    .parse::<f64>()
                    .map_err(|_| self.malformed(name, raw, "not a list of numbers"))
            })
            .collect()
    }

    pub fn get_str_list(&self, name: &str) -> Result<Vec<String>, LoadError> {
        Ok(self
            .get_str(name)?
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }

    pub fn get_str_list_or_empty(&self, name: &str) -> Vec<String> {
        self.get_str_opt(name)
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn get_vector3(&self, name: &str) -> Result<na::Vector3<f64>, LoadError> {
        let list = self.get_f64_list(name)?;
        if list.len() != 3 {
            let raw = self.get_str(name)?;
            return Err(self.malformed(name, raw, "expected 3 values"));
        }
        Ok(na::Vector3::new(list[0], list[1], list[2]))
    }

    /// Parses a quaternion given as `qw qx qy qz` and checks it is unit-norm.
    pub fn get_quaternion(&self, name: &str) -> Result<na::UnitQuaternion<f64>, LoadError> {
        let list = self.get_f64_list(name)?;
        if list.len() != 4 {
            let raw = self.get_str(name)?;
            return Err(self.malformed(name, raw, "expected 4 values"));
        }
        let q = na::Quaternion::new(list[0], list[1], list[2], list[3]);
        if (q.norm() - 1.0).abs() > QUATERNION_NORM_TOLERANCE {
            let raw = self.get_str(name)?;
            return Err(self.malformed(name, raw, "quaternion is not unit-norm"));
        }
        Ok(na::UnitQuaternion::from_quaternion(q))
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.map.insert(name.to_string(), value.into());
    }

    pub fn set_f64(&mut self, name: &str, value: f64) {
        self.set(name, format_f64(value));
    }

    pub fn set_bool(&mut self, name: &str, value: bool) {
        self.set(name, if value { "true" } else { "false" });
    }

    pub fn set_f64_list(&mut self, name: &str, values: &[f64]) {
        let joined = values
            .iter()
            .map(|v| format_f64(*v))
            .collect::<Vec<_>>()
            .join(" ");
        self.set(name, joined);
    }

    pub fn set_vector3(&mut self, name: &str, v: &na::Vector3<f64>) {
        self.set_f64_list(name, &[v.x, v.y, v.z]);
    }

    pub fn set_quaternion(&mut self, name: &str, q: &na::UnitQuaternion<f64>) {
        self.set_f64_list(name, &[q.w, q.i, q.j, q.k]);
    }

    pub fn set_str_list(&mut self, name: &str, values: &[String]) {
        self.set(name, values.join(" "));
    }
}

/// Scientific notation with 17 significant digits, the dump and snapshot format.
pub fn format_f64(value: f64) -> String {
    format!("{:.16e}", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn map(pairs: &[(&str, &str)]) -> AttributeMap {
        let mut m = AttributeMap::new("BODY", "torso");
        for (k, v) in pairs {
            m.set(k, *v);
        }
        m
    }

    #[test]
    fn typed_accessors_parse() {
        let m = map(&[
            ("Mass", "2.5"),
            ("Dump", "true"),
            ("Position", "1 2 3"),
            ("Quaternion", "1 0 0 0"),
        ]);
        assert_relative_eq!(m.get_f64("Mass").unwrap(), 2.5);
        assert!(m.get_bool_or("Dump", false).unwrap());
        assert_relative_eq!(m.get_vector3("Position").unwrap().z, 3.0);
        assert_relative_eq!(m.get_quaternion("Quaternion").unwrap().w, 1.0);
    }

    #[test]
    fn missing_attribute_names_the_element() {
        let m = map(&[]);
        let err = m.get_f64("Mass").unwrap_err();
        assert_eq!(
            err.to_string(),
            "BODY ID=\"torso\": missing attribute Mass"
        );
    }

    #[test]
    fn non_unit_quaternion_is_rejected() {
        let m = map(&[("Quaternion", "1 1 0 0")]);
        assert!(m.get_quaternion("Quaternion").is_err());
    }

    #[test]
    fn round_trip_preserves_17_digits() {
        let mut m = map(&[]);
        m.set_f64("Value", std::f64::consts::PI);
        let back = m.get_f64("Value").unwrap();
        assert_eq!(back, std::f64::consts::PI);
    }

    #[test]
    fn lists_split_on_whitespace() {
        let m = map(&[("TargetIDList", "left_hip  right_hip\tleft_knee")]);
        let list = m.get_str_list("TargetIDList").unwrap();
        assert_eq!(list, vec!["left_hip", "right_hip", "left_knee"]);
    }
}
