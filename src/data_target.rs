//! Data targets: time-indexed reference trajectories scored against the
//! simulation state to build the fitness value.

use rapier::na;

use crate::attributes::{AttributeMap, LoadError};

/// Error-to-score mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Linear,
    Square,
}

/// When a target contributes: at discrete sample times only, or every step
/// against an interpolated reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    Discrete,
    Continuous,
}

/// Scalar channel sampled from the referenced entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarChannel {
    XP,
    YP,
    ZP,
    Q0,
    Q1,
    Q2,
    Q3,
    XV,
    YV,
    ZV,
    XRV,
    YRV,
    ZRV,
    XA,
    YA,
    ZA,
    Angle,
    Force,
    Length,
    ContactCount,
    MechanicalEnergy,
    MetabolicEnergy,
    Time,
}

impl ScalarChannel {
    pub fn from_str(s: &str) -> Option<ScalarChannel> {
        use ScalarChannel::*;
        Some(match s {
            "XP" => XP,
            "YP" => YP,
            "ZP" => ZP,
            "Q0" => Q0,
            "Q1" => Q1,
            "Q2" => Q2,
            "Q3" => Q3,
            "XV" => XV,
            "YV" => YV,
            "ZV" => ZV,
            "XRV" => XRV,
            "YRV" => YRV,
            "ZRV" => ZRV,
            "XA" => XA,
            "YA" => YA,
            "ZA" => ZA,
            "Angle" => Angle,
            "Force" => Force,
            "Length" => Length,
            "ContactCount" => ContactCount,
            "MechanicalEnergy" => MechanicalEnergy,
            "MetabolicEnergy" => MetabolicEnergy,
            "Time" => Time,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        use ScalarChannel::*;
        match self {
            XP => "XP",
            YP => "YP",
            ZP => "ZP",
            Q0 => "Q0",
            Q1 => "Q1",
            Q2 => "Q2",
            Q3 => "Q3",
            XV => "XV",
            YV => "YV",
            ZV => "ZV",
            XRV => "XRV",
            YRV => "YRV",
            ZRV => "ZRV",
            XA => "XA",
            YA => "YA",
            ZA => "ZA",
            Angle => "Angle",
            Force => "Force",
            Length => "Length",
            ContactCount => "ContactCount",
            MechanicalEnergy => "MechanicalEnergy",
            MetabolicEnergy => "MetabolicEnergy",
            Time => "Time",
        }
    }
}

/// Marker-pair comparison channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerComparison {
    Distance,
    Angle,
}

/// Reference series and comparison semantics per target variant.
pub enum DataTargetKind {
    Scalar {
        target: String,
        channel: ScalarChannel,
        reference_marker: Option<String>,
        values: Vec<f64>,
    },
    Vector {
        target: String,
        values: Vec<na::Vector3<f64>>,
    },
    Quaternion {
        target: String,
        values: Vec<na::UnitQuaternion<f64>>,
    },
    MarkerCompare {
        marker1: String,
        marker2: String,
        comparison: MarkerComparison,
        values: Vec<f64>,
    },
}

/// The simulation-side sample a target is compared against.
pub enum TargetValue {
    Scalar(f64),
    Vector(na::Vector3<f64>),
    Quaternion(na::UnitQuaternion<f64>),
}

/// A time-sorted reference trajectory with an error-to-score mapping.
#[derive(Debug)]
pub struct DataTarget {
    name: String,
    times: Vec<f64>,
    kind: DataTargetKind,
    intercept: f64,
    slope: f64,
    match_type: MatchType,
    match_policy: MatchPolicy,
    abort_threshold: f64,
    last_match_index: Option<usize>,
    last_error: Option<f64>,
    dump: bool,
}

impl DataTarget {
    pub fn from_attributes(attributes: &AttributeMap) -> Result<DataTarget, LoadError> {
        let times = attributes.get_f64_list("TargetTimes")?;
        if times.is_empty() {
            return Err(attributes.invalid("TargetTimes must not be empty"));
        }
        if times.windows(2).any(|w| w[0] >= w[1]) {
            return Err(attributes.invalid("TargetTimes must be strictly increasing"));
        }
        let values = attributes.get_f64_list("TargetValues")?;

        let kind = match attributes.get_str("Type")? {
            "Scalar" => {
                if values.len() != times.len() {
                    return Err(attributes.invalid("TargetValues must match TargetTimes"));
                }
                let channel_name = attributes.get_str("DataType")?;
                DataTargetKind::Scalar {
                    target: attributes.get_str_opt("TargetID").unwrap_or("").to_string(),
                    channel: ScalarChannel::from_str(channel_name).ok_or_else(|| {
                        attributes.invalid(format!("unknown DataType \"{channel_name}\""))
                    })?,
                    reference_marker: attributes
                        .get_str_opt("ReferenceMarkerID")
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                    values,
                }
            }
            "Vector" => {
                if values.len() != times.len() * 3 {
                    return Err(attributes.invalid("TargetValues must be 3 per time sample"));
                }
                DataTargetKind::Vector {
                    target: attributes.get_str("TargetID")?.to_string(),
                    values: values
                        .chunks(3)
                        .map(|c| na::Vector3::new(c[0], c[1], c[2]))
                        .collect(),
                }
            }
            "Quaternion" => {
                if values.len() != times.len() * 4 {
                    return Err(attributes.invalid("TargetValues must be 4 per time sample"));
                }
                let mut quaternions = Vec::with_capacity(times.len());
                for c in values.chunks(4) {
                    let q = na::Quaternion::new(c[0], c[1], c[2], c[3]);
                    if (q.norm() - 1.0).abs() > 1.0e-6 {
                        return Err(attributes.invalid("reference quaternion is not unit-norm"));
                    }
                    quaternions.push(na::UnitQuaternion::from_quaternion(q));
                }
                DataTargetKind::Quaternion {
                    target: attributes.get_str("TargetID")?.to_string(),
                    values: quaternions,
                }
            }
            "MarkerCompare" => {
                if values.len() != times.len() {
                    return Err(attributes.invalid("TargetValues must match TargetTimes"));
                }
                DataTargetKind::MarkerCompare {
                    marker1: attributes.get_str("Marker1ID")?.to_string(),
                    marker2: attributes.get_str("Marker2ID")?.to_string(),
                    comparison: match attributes.get_str_opt("Comparison") {
                        None | Some("Distance") => MarkerComparison::Distance,
                        Some("Angle") => MarkerComparison::Angle,
                        Some(other) => {
                            return Err(
                                attributes.invalid(format!("unknown Comparison \"{other}\""))
                            )
                        }
                    },
                    values,
                }
            }
            other => {
                return Err(attributes.invalid(format!("unknown data target Type \"{other}\"")));
            }
        };

        Ok(DataTarget {
            name: attributes.id().to_string(),
            times,
            kind,
            intercept: attributes.get_f64_or("Intercept", 0.0)?,
            slope: attributes.get_f64_or("Slope", -1.0)?,
            match_type: match attributes.get_str_opt("MatchType") {
                None | Some("Linear") => MatchType::Linear,
                Some("Square") => MatchType::Square,
                Some(other) => {
                    return Err(attributes.invalid(format!("unknown MatchType \"{other}\"")))
                }
            },
            match_policy: match attributes.get_str_opt("MatchPolicy") {
                None | Some("Discrete") => MatchPolicy::Discrete,
                Some("Continuous") => MatchPolicy::Continuous,
                Some(other) => {
                    return Err(attributes.invalid(format!("unknown MatchPolicy \"{other}\"")))
                }
            },
            abort_threshold: attributes.get_f64_or("AbortThreshold", -f64::MAX)?,
            last_match_index: None,
            last_error: None,
            dump: attributes.get_bool_or("Dump", false)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &DataTargetKind {
        &self.kind
    }

    pub fn dump(&self) -> bool {
        self.dump
    }

    pub fn last_error(&self) -> Option<f64> {
        self.last_error
    }

    /// Nearest sample index when `time` is within half a step of it and not
    /// already consumed.
    fn discrete_match(&self, time: f64, h: f64) -> Option<usize> {
        let upper = self.times.partition_point(|&t| t < time);
        let mut best: Option<usize> = None;
        for candidate in [upper.wrapping_sub(1), upper] {
            if candidate < self.times.len() {
                let distance = (self.times[candidate] - time).abs();
                if distance <= h / 2.0
                    && best.map_or(true, |b| distance < (self.times[b] - time).abs())
                {
                    best = Some(candidate);
                }
            }
        }
        best.filter(|index| self.last_match_index != Some(*index))
    }

    /// Reference value interpolation weights for continuous matching.
    fn interpolation(&self, time: f64) -> (usize, usize, f64) {
        if time <= self.times[0] {
            return (0, 0, 0.0);
        }
        let last = self.times.len() - 1;
        if time >= self.times[last] {
            return (last, last, 0.0);
        }
        let upper = self.times.partition_point(|&t| t <= time);
        let (i0, i1) = (upper - 1, upper);
        let span = self.times[i1] - self.times[i0];
        (i0, i1, (time - self.times[i0]) / span)
    }

    fn reference_error(&self, index0: usize, index1: usize, fraction: f64, current: &TargetValue) -> f64 {
        match (&self.kind, current) {
            (DataTargetKind::Scalar { values, .. }, TargetValue::Scalar(x))
            | (DataTargetKind::MarkerCompare { values, .. }, TargetValue::Scalar(x)) => {
                let reference = values[index0] + (values[index1] - values[index0]) * fraction;
                x - reference
            }
            (DataTargetKind::Vector { values, .. }, TargetValue::Vector(v)) => {
                let reference = values[index0].lerp(&values[index1], fraction);
                (v - reference).norm()
            }
            (DataTargetKind::Quaternion { values, .. }, TargetValue::Quaternion(q)) => {
                let reference = if index0 == index1 {
                    values[index0]
                } else {
                    values[index0].slerp(&values[index1], fraction)
                };
                let dot = q.coords.dot(&reference.coords).abs().clamp(-1.0, 1.0);
                2.0 * dot.acos()
            }
            _ => 0.0,
        }
    }

    fn error_score(&self, error: f64) -> f64 {
        let positive = match self.match_type {
            MatchType::Linear => error.abs(),
            MatchType::Square => error * error,
        };
        self.intercept + self.slope * positive
    }

    /// Scores the current state, returning the fitness contribution when the
    /// time matches, and remembering the error for the abort predicate.
    pub fn evaluate(&mut self, time: f64, h: f64, current: &TargetValue) -> Option<f64> {
        match self.match_policy {
            MatchPolicy::Discrete => {
                let index = self.discrete_match(time, h)?;
                self.last_match_index = Some(index);
                let error = self.reference_error(index, index, 0.0, current);
                self.last_error = Some(error);
                Some(self.error_score(error))
            }
            MatchPolicy::Continuous => {
                let (i0, i1, fraction) = self.interpolation(time);
                let error = self.reference_error(i0, i1, fraction, current);
                self.last_error = Some(error);
                Some(self.error_score(error))
            }
        }
    }

    /// True when the last error breached the abort threshold.
    pub fn abort_exceeded(&self) -> bool {
        self.abort_threshold > -f64::MAX
            && self
                .last_error
                .map_or(false, |e| e.abs() > self.abort_threshold)
    }

    pub fn to_attributes(&self) -> AttributeMap {
        let mut map = AttributeMap::new("DATATARGET", &self.name);
        map.set_f64_list("TargetTimes", &self.times);
        match &self.kind {
            DataTargetKind::Scalar {
                target,
                channel,
                reference_marker,
                values,
            } => {
                map.set("Type", "Scalar");
                map.set("TargetID", target.clone());
                map.set("DataType", channel.as_str());
                if let Some(reference) = reference_marker {
                    map.set("ReferenceMarkerID", reference.clone());
                }
                map.set_f64_list("TargetValues", values);
            }
            DataTargetKind::Vector { target, values } => {
                map.set("Type", "Vector");
                map.set("TargetID", target.clone());
                let flat: Vec<f64> = values.iter().flat_map(|v| [v.x, v.y, v.z]).collect();
                map.set_f64_list("TargetValues", &flat);
            }
            DataTargetKind::Quaternion { target, values } => {
                map.set("Type", "Quaternion");
                map.set("TargetID", target.clone());
                let flat: Vec<f64> = values
                    .iter()
                    .flat_map(|q| [q.w, q.i, q.j, q.k])
                    .collect();
                map.set_f64_list("TargetValues", &flat);
            }
            DataTargetKind::MarkerCompare {
                marker1,
                marker2,
                comparison,
                values,
            } => {
                map.set("Type", "MarkerCompare");
                map.set("Marker1ID", marker1.clone());
                map.set("Marker2ID", marker2.clone());
                map.set(
                    "Comparison",
                    match comparison {
                        MarkerComparison::Distance => "Distance",
                        MarkerComparison::Angle => "Angle",
                    },
                );
                map.set_f64_list("TargetValues", values);
            }
        }
        map.set_f64("Intercept", self.intercept);
        map.set_f64("Slope", self.slope);
        map.set(
            "MatchType",
            match self.match_type {
                MatchType::Linear => "Linear",
                MatchType::Square => "Square",
            },
        );
        map.set(
            "MatchPolicy",
            match self.match_policy {
                MatchPolicy::Discrete => "Discrete",
                MatchPolicy::Continuous => "Continuous",
            },
        );
        if self.abort_threshold > -f64::MAX {
            map.set_f64("AbortThreshold", self.abort_threshold);
        }
        if self.dump {
            map.set_bool("Dump", true);
        }
        map
    }

    pub fn dump_header(&self) -> String {
        "Time\tError".to_string()
    }

    pub fn dump_line(&self, time: f64) -> String {
        [time, self.last_error.unwrap_or(0.0)]
            .iter()
            .map(|x| crate::attributes::format_f64(*x))
            .collect::<Vec<_>>()
            .join("\t")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scalar_target(extra: &[(&str, &str)]) -> DataTarget {
        let mut m = AttributeMap::new("DATATARGET", "track_z");
        m.set("Type", "Scalar");
        m.set("TargetID", "torso");
        m.set("DataType", "ZP");
        m.set("TargetTimes", "0.0 1.0 2.0");
        m.set("TargetValues", "10.0 5.0 0.0");
        m.set("Intercept", "1.0");
        m.set("Slope", "-1.0");
        for (k, v) in extra {
            m.set(k, *v);
        }
        DataTarget::from_attributes(&m).unwrap()
    }

    #[test]
    fn discrete_match_fires_once_per_sample() {
        let mut t = scalar_target(&[]);
        let h = 0.1;
        // well away from any sample time: no contribution
        assert!(t.evaluate(0.5, h, &TargetValue::Scalar(7.0)).is_none());
        // at the sample: contributes intercept + slope * |error|
        let score = t.evaluate(1.0, h, &TargetValue::Scalar(5.5)).unwrap();
        assert_relative_eq!(score, 1.0 - 0.5);
        // the same sample is never double counted
        assert!(t.evaluate(1.01, h, &TargetValue::Scalar(5.5)).is_none());
    }

    #[test]
    fn continuous_match_interpolates() {
        let mut t = scalar_target(&[("MatchPolicy", "Continuous")]);
        // halfway between 10 and 5, reference is 7.5
        let score = t.evaluate(0.5, 0.1, &TargetValue::Scalar(7.5)).unwrap();
        assert_relative_eq!(score, 1.0);
    }

    #[test]
    fn square_match_squares_the_error() {
        let mut t = scalar_target(&[("MatchType", "Square"), ("Intercept", "0"), ("Slope", "1")]);
        let score = t.evaluate(0.0, 0.1, &TargetValue::Scalar(13.0)).unwrap();
        assert_relative_eq!(score, 9.0);
    }

    #[test]
    fn abort_threshold_trips_on_large_error() {
        let mut t = scalar_target(&[("AbortThreshold", "2.0")]);
        let _ = t.evaluate(0.0, 0.1, &TargetValue::Scalar(10.5));
        assert!(!t.abort_exceeded());
        let _ = t.evaluate(1.0, 0.1, &TargetValue::Scalar(15.0));
        assert!(t.abort_exceeded());
    }

    #[test]
    fn quaternion_error_is_double_angle() {
        let mut m = AttributeMap::new("DATATARGET", "orient");
        m.set("Type", "Quaternion");
        m.set("TargetID", "torso");
        m.set("TargetTimes", "0.0");
        m.set("TargetValues", "1 0 0 0");
        m.set("Intercept", "0");
        m.set("Slope", "-1");
        let mut t = DataTarget::from_attributes(&m).unwrap();
        let rotated =
            na::UnitQuaternion::from_axis_angle(&na::Vector3::x_axis(), 0.3);
        let score = t
            .evaluate(0.0, 0.1, &TargetValue::Quaternion(rotated))
            .unwrap();
        assert_relative_eq!(score, -0.3, epsilon = 1e-9);
    }

    #[test]
    fn unsorted_times_are_rejected() {
        let mut m = AttributeMap::new("DATATARGET", "bad");
        m.set("Type", "Scalar");
        m.set("TargetID", "torso");
        m.set("DataType", "XP");
        m.set("TargetTimes", "1.0 0.5");
        m.set("TargetValues", "0 0");
        assert!(DataTarget::from_attributes(&m).is_err());
    }
}
