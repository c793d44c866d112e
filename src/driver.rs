//! Drivers: time-to-scalar producers that fan out to named drivables, and the
//! step-stamped accumulator those drivables receive into.

mod hinge_ik;
mod tegotae;

use std::collections::HashMap;

use rapier::na;

use crate::attributes::{AttributeMap, LoadError};
use crate::joint::JointGeometry;
use crate::marker::Axis;
use crate::strap::MarkerStates;

pub use hinge_ik::HingeIk;
pub use tegotae::Tegotae;

/// Step-stamped drive accumulator.
///
/// Pushes from different steps never mix: receiving with a new stamp discards
/// the old sum, and reading checks the stamp.
#[derive(Debug, Clone)]
pub struct DriveInput {
    sum: f64,
    stamp: i64,
}

impl DriveInput {
    pub fn new() -> DriveInput {
        DriveInput {
            sum: 0.0,
            stamp: i64::MIN,
        }
    }

    pub fn receive(&mut self, value: f64, step_count: i64) {
        if self.stamp != step_count {
            self.sum = 0.0;
            self.stamp = step_count;
        }
        self.sum += value;
    }

    /// The sum of pushes stamped with `step_count`, zero otherwise.
    pub fn sum_for(&self, step_count: i64) -> f64 {
        if self.stamp == step_count {
            self.sum
        } else {
            0.0
        }
    }
}

impl Default for DriveInput {
    fn default() -> Self {
        Self::new()
    }
}

/// World state a driver may read, all from the step just completed.
pub struct DriverContext<'a> {
    pub time: f64,
    pub step_size: f64,
    pub step_count: i64,
    pub markers: &'a MarkerStates,
    /// Ground-reaction load magnitude per geom, post-integrate.
    pub geom_loads: &'a HashMap<String, f64>,
    /// Hinge geometry per joint.
    pub joint_geometry: &'a HashMap<String, JointGeometry>,
}

/// Piecewise-constant lookup over cumulative change times.
///
/// At exactly a change time the new interval's value applies. With
/// `interpolate`, values ramp linearly across each interval; `wrap` makes the
/// last interval ramp back to the first value (cyclic use).
fn table_lookup(
    change_times: &[f64],
    values: &[f64],
    t: f64,
    interpolate: bool,
    wrap: Option<f64>,
) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let index = change_times.partition_point(|&ct| ct <= t).saturating_sub(1);
    if !interpolate {
        return values[index];
    }
    let interval_end = if index + 1 < change_times.len() {
        change_times[index + 1]
    } else {
        match wrap {
            Some(period) => period,
            None => return values[index],
        }
    };
    let next_value = if index + 1 < values.len() {
        values[index + 1]
    } else {
        match wrap {
            Some(_) => values[0],
            None => return values[index],
        }
    };
    let span = interval_end - change_times[index];
    if span <= 0.0 {
        return values[index];
    }
    let fraction = ((t - change_times[index]) / span).clamp(0.0, 1.0);
    values[index] + (next_value - values[index]) * fraction
}

fn cumulative_change_times(durations: &[f64]) -> Vec<f64> {
    let mut times = Vec::with_capacity(durations.len());
    let mut acc = 0.0;
    for d in durations {
        times.push(acc);
        acc += d;
    }
    times
}

/// Driver variants.
pub enum DriverKind {
    Fixed {
        value: f64,
    },
    Step {
        change_times: Vec<f64>,
        values: Vec<f64>,
    },
    Cyclic {
        change_times: Vec<f64>,
        values: Vec<f64>,
        period: f64,
        phase_delay: f64,
    },
    StackedBoxcar {
        period: f64,
        delays: Vec<f64>,
        widths: Vec<f64>,
        heights: Vec<f64>,
    },
    MarkerPosition {
        marker: String,
        reference_marker: Option<String>,
        axis: Axis,
        velocity: bool,
    },
    MarkerEllipse {
        reference_marker: String,
        radius_a: f64,
        radius_b: f64,
        omega: f64,
        phase: f64,
        output_axis: Axis,
    },
    Tegotae(Tegotae),
    HingeIk(HingeIk),
}

/// A named scalar producer with a clamped range and a target fan-out list.
#[derive(Debug)]
pub struct Driver {
    name: String,
    targets: Vec<String>,
    min_value: f64,
    max_value: f64,
    linear_interpolation: bool,
    kind: DriverKind,
    value: f64,
    per_target: Option<Vec<f64>>,
    last_step_count: i64,
    dump: bool,
}

impl Driver {
    pub fn from_attributes(attributes: &AttributeMap) -> Result<Driver, LoadError> {
        let kind = match attributes.get_str("Type")? {
            "Fixed" => DriverKind::Fixed {
                value: attributes.get_f64("Value")?,
            },
            "Step" => {
                let durations = attributes.get_f64_list("Durations")?;
                let values = attributes.get_f64_list("Values")?;
                if durations.len() != values.len() || values.is_empty() {
                    return Err(
                        attributes.invalid("Durations and Values must be equal-length lists")
                    );
                }
                DriverKind::Step {
                    change_times: cumulative_change_times(&durations),
                    values,
                }
            }
            "Cyclic" => {
                let durations = attributes.get_f64_list("Durations")?;
                let values = attributes.get_f64_list("Values")?;
                if durations.len() != values.len() || values.is_empty() {
                    return Err(
                        attributes.invalid("Durations and Values must be equal-length lists")
                    );
                }
                let period: f64 = durations.iter().sum();
                if period <= 0.0 {
                    return Err(attributes.invalid("cycle period must be positive"));
                }
                DriverKind::Cyclic {
                    change_times: cumulative_change_times(&durations),
                    values,
                    period,
                    phase_delay: attributes.get_f64_or("PhaseDelay", 0.0)?,
                }
            }
            "StackedBoxcar" => {
                let delays = attributes.get_f64_list("Delays")?;
                let widths = attributes.get_f64_list("Widths")?;
                let heights = attributes.get_f64_list("Heights")?;
                if delays.len() != widths.len() || widths.len() != heights.len() {
                    return Err(attributes.invalid(
                        "Delays, Widths and Heights must be equal-length lists",
                    ));
                }
                let period = attributes.get_f64("CycleTime")?;
                if period <= 0.0 {
                    return Err(attributes.invalid("CycleTime must be positive"));
                }
                DriverKind::StackedBoxcar {
                    period,
                    delays,
                    widths,
                    heights,
                }
            }
            "MarkerPosition" => DriverKind::MarkerPosition {
                marker: attributes.get_str("MarkerID")?.to_string(),
                reference_marker: attributes
                    .get_str_opt("ReferenceMarkerID")
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                axis: Axis::from_str(attributes.get_str("Axis")?)
                    .ok_or_else(|| attributes.invalid("Axis must be X, Y or Z"))?,
                velocity: attributes.get_bool_or("Velocity", false)?,
            },
            "MarkerEllipse" => DriverKind::MarkerEllipse {
                reference_marker: attributes.get_str("ReferenceMarkerID")?.to_string(),
                radius_a: attributes.get_f64("RadiusA")?,
                radius_b: attributes.get_f64("RadiusB")?,
                omega: attributes.get_f64("Omega")?,
                phase: attributes.get_f64_or("Phase", 0.0)?,
                output_axis: Axis::from_str(attributes.get_str("OutputAxis")?)
                    .ok_or_else(|| attributes.invalid("OutputAxis must be X, Y or Z"))?,
            },
            "Tegotae" => DriverKind::Tegotae(Tegotae::from_attributes(attributes)?),
            "TwoHingeJoint" => DriverKind::HingeIk(HingeIk::from_attributes(attributes, 2)?),
            "ThreeHingeJoint" => DriverKind::HingeIk(HingeIk::from_attributes(attributes, 3)?),
            other => {
                return Err(attributes.invalid(format!("unknown driver Type \"{other}\"")));
            }
        };

        let range = match attributes.get_str_opt("DriverRange") {
            Some(_) => {
                let list = attributes.get_f64_list("DriverRange")?;
                if list.len() != 2 || list[0] > list[1] {
                    return Err(attributes.invalid("DriverRange must be \"min max\""));
                }
                (list[0], list[1])
            }
            None => (-f64::MAX, f64::MAX),
        };

        Ok(Driver {
            name: attributes.id().to_string(),
            targets: attributes.get_str_list("TargetIDList")?,
            min_value: range.0,
            max_value: range.1,
            linear_interpolation: attributes.get_bool_or("LinearInterpolation", false)?,
            kind,
            value: 0.0,
            per_target: None,
            last_step_count: i64::MIN,
            dump: attributes.get_bool_or("Dump", false)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &DriverKind {
        &self.kind
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn dump(&self) -> bool {
        self.dump
    }

    /// The cycle period, for drivers that have one; the orchestrator derives
    /// the simulation cycle time as the maximum over all drivers.
    pub fn period(&self) -> Option<f64> {
        match &self.kind {
            DriverKind::Cyclic { period, .. } => Some(*period),
            DriverKind::StackedBoxcar { period, .. } => Some(*period),
            _ => None,
        }
    }

    fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min_value, self.max_value)
    }

    /// Computes this step's output(s), clamped to the driver range.
    pub fn update(&mut self, context: &DriverContext) {
        self.per_target = None;
        let raw = match &mut self.kind {
            DriverKind::Fixed { value } => *value,
            DriverKind::Step {
                change_times,
                values,
            } => table_lookup(
                change_times,
                values,
                context.time,
                self.linear_interpolation,
                None,
            ),
            DriverKind::Cyclic {
                change_times,
                values,
                period,
                phase_delay,
            } => {
                let effective = (context.time - *phase_delay * *period).rem_euclid(*period);
                table_lookup(
                    change_times,
                    values,
                    effective,
                    self.linear_interpolation,
                    Some(*period),
                )
            }
            DriverKind::StackedBoxcar {
                period,
                delays,
                widths,
                heights,
            } => {
                let phase = context.time.rem_euclid(*period) / *period;
                let mut sum = 0.0;
                for ((delay, width), height) in delays.iter().zip(widths).zip(heights.iter()) {
                    if (phase - delay).rem_euclid(1.0) < *width {
                        sum += height;
                    }
                }
                sum
            }
            DriverKind::MarkerPosition {
                marker,
                reference_marker,
                axis,
                velocity,
            } => {
                let state = &context.markers[marker.as_str()];
                let (position, vel) = match reference_marker {
                    Some(reference) => {
                        let reference = &context.markers[reference.as_str()];
                        (
                            reference
                                .pose
                                .inverse_transform_point(&na::Point3::from(state.position()))
                                .coords,
                            reference.pose.rotation.inverse() * state.velocity,
                        )
                    }
                    None => (state.position(), state.velocity),
                };
                if *velocity {
                    vel[axis.index()]
                } else {
                    position[axis.index()]
                }
            }
            DriverKind::MarkerEllipse {
                radius_a,
                radius_b,
                omega,
                phase,
                output_axis,
                ..
            } => {
                let theta = *omega * context.time + *phase;
                let local = na::Vector3::new(
                    *radius_a * theta.cos(),
                    *radius_b * theta.sin(),
                    0.0,
                );
                local[output_axis.index()]
            }
            DriverKind::Tegotae(tegotae) => tegotae.update(context),
            DriverKind::HingeIk(ik) => {
                let angles: Vec<f64> = ik
                    .solve(context)
                    .into_iter()
                    .map(|a| a.clamp(self.min_value, self.max_value))
                    .collect();
                self.value = angles.first().copied().unwrap_or(0.0);
                self.per_target = Some(angles);
                self.last_step_count = context.step_count;
                return;
            }
        };
        self.value = self.clamp(raw);
        self.last_step_count = context.step_count;
    }

    /// The pushes to perform: one per target. Ordinary drivers broadcast one
    /// value; IK drivers deliver joint angles to targets in declared order.
    pub fn emissions(&self) -> Vec<(String, f64)> {
        match &self.per_target {
            Some(values) => self
                .targets
                .iter()
                .zip(values.iter())
                .map(|(t, v)| (t.clone(), *v))
                .collect(),
            None => self
                .targets
                .iter()
                .map(|t| (t.clone(), self.value))
                .collect(),
        }
    }

    pub fn to_attributes(&self) -> AttributeMap {
        let mut map = AttributeMap::new("DRIVER", &self.name);
        map.set_str_list("TargetIDList", &self.targets);
        if self.min_value > -f64::MAX {
            map.set_f64_list("DriverRange", &[self.min_value, self.max_value]);
        }
        map.set_bool("LinearInterpolation", self.linear_interpolation);
        match &self.kind {
            DriverKind::Fixed { value } => {
                map.set("Type", "Fixed");
                map.set_f64("Value", *value);
            }
            DriverKind::Step {
                change_times,
                values,
            } => {
                map.set("Type", "Step");
                map.set_f64_list("Durations", &durations_from(change_times, None));
                map.set_f64_list("Values", values);
            }
            DriverKind::Cyclic {
                change_times,
                values,
                period,
                phase_delay,
            } => {
                map.set("Type", "Cyclic");
                map.set_f64_list("Durations", &durations_from(change_times, Some(*period)));
                map.set_f64_list("Values", values);
                map.set_f64("PhaseDelay", *phase_delay);
            }
            DriverKind::StackedBoxcar {
                period,
                delays,
                widths,
                heights,
            } => {
                map.set("Type", "StackedBoxcar");
                map.set_f64("CycleTime", *period);
                map.set_f64_list("Delays", delays);
                map.set_f64_list("Widths", widths);
                map.set_f64_list("Heights", heights);
            }
            DriverKind::MarkerPosition {
                marker,
                reference_marker,
                axis,
                velocity,
            } => {
                map.set("Type", "MarkerPosition");
                map.set("MarkerID", marker.clone());
                if let Some(reference) = reference_marker {
                    map.set("ReferenceMarkerID", reference.clone());
                }
                map.set("Axis", ["X", "Y", "Z"][axis.index()]);
                map.set_bool("Velocity", *velocity);
            }
            DriverKind::MarkerEllipse {
                reference_marker,
                radius_a,
                radius_b,
                omega,
                phase,
                output_axis,
            } => {
                map.set("Type", "MarkerEllipse");
                map.set("ReferenceMarkerID", reference_marker.clone());
                map.set_f64("RadiusA", *radius_a);
                map.set_f64("RadiusB", *radius_b);
                map.set_f64("Omega", *omega);
                map.set_f64("Phase", *phase);
                map.set("OutputAxis", ["X", "Y", "Z"][output_axis.index()]);
            }
            DriverKind::Tegotae(tegotae) => tegotae.append_attributes(&mut map),
            DriverKind::HingeIk(ik) => ik.append_attributes(&mut map),
        }
        if self.dump {
            map.set_bool("Dump", true);
        }
        map
    }

    pub fn dump_header(&self) -> String {
        "Time\tValue".to_string()
    }

    pub fn dump_line(&self, time: f64) -> String {
        [time, self.value]
            .iter()
            .map(|x| crate::attributes::format_f64(*x))
            .collect::<Vec<_>>()
            .join("\t")
    }
}

/// Inverse of [cumulative_change_times], for serialisation.
fn durations_from(change_times: &[f64], period: Option<f64>) -> Vec<f64> {
    let mut durations = Vec::with_capacity(change_times.len());
    for i in 0..change_times.len() {
        let end = if i + 1 < change_times.len() {
            change_times[i + 1]
        } else {
            period.unwrap_or(change_times[i])
        };
        durations.push(end - change_times[i]);
    }
    durations
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn context<'a>(
        time: f64,
        markers: &'a MarkerStates,
        loads: &'a HashMap<String, f64>,
        joints: &'a HashMap<String, JointGeometry>,
    ) -> DriverContext<'a> {
        DriverContext {
            time,
            step_size: 0.001,
            step_count: 0,
            markers,
            geom_loads: loads,
            joint_geometry: joints,
        }
    }

    fn eval(driver: &mut Driver, time: f64) -> f64 {
        let markers = MarkerStates::new();
        let loads = HashMap::new();
        let joints = HashMap::new();
        driver.update(&context(time, &markers, &loads, &joints));
        driver.value()
    }

    fn cyclic_driver() -> Driver {
        let mut m = AttributeMap::new("DRIVER", "d");
        m.set("Type", "Cyclic");
        m.set("TargetIDList", "muscle");
        m.set("Durations", "0.25 0.25 0.25 0.25");
        m.set("Values", "0 1 0 1");
        m.set("DriverRange", "0 1");
        Driver::from_attributes(&m).unwrap()
    }

    #[test]
    fn drive_input_discards_stale_pushes() {
        let mut input = DriveInput::new();
        input.receive(0.4, 3);
        input.receive(0.2, 3);
        assert_relative_eq!(input.sum_for(3), 0.6);
        input.receive(0.1, 4);
        assert_relative_eq!(input.sum_for(4), 0.1);
        assert_relative_eq!(input.sum_for(3), 0.0);
    }

    #[test]
    fn cyclic_values_hit_exactly() {
        let mut d = cyclic_driver();
        assert_eq!(eval(&mut d, 0.30), 1.0);
        assert_eq!(eval(&mut d, 0.50), 0.0);
    }

    #[test]
    fn cyclic_output_repeats_with_period() {
        let mut d = cyclic_driver();
        for t in [0.05, 0.3, 0.62, 0.99] {
            let a = eval(&mut d, t);
            let b = eval(&mut d, t + 1.0);
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn phase_delay_shifts_the_cycle() {
        let mut m = AttributeMap::new("DRIVER", "d");
        m.set("Type", "Cyclic");
        m.set("TargetIDList", "muscle");
        m.set("Durations", "0.5 0.5");
        m.set("Values", "0 1");
        m.set("PhaseDelay", "0.5");
        let mut d = Driver::from_attributes(&m).unwrap();
        // a half-period delay swaps the two halves
        assert_eq!(eval(&mut d, 0.25), 1.0);
        assert_eq!(eval(&mut d, 0.75), 0.0);
    }

    #[test]
    fn step_change_time_returns_new_value() {
        let mut m = AttributeMap::new("DRIVER", "d");
        m.set("Type", "Step");
        m.set("TargetIDList", "muscle");
        m.set("Durations", "1 1 1");
        m.set("Values", "5 7 9");
        let mut d = Driver::from_attributes(&m).unwrap();
        assert_eq!(eval(&mut d, 1.0), 7.0);
        assert_eq!(eval(&mut d, 0.999999), 5.0);
        // past the last change time the final value holds
        assert_eq!(eval(&mut d, 10.0), 9.0);
    }

    #[test]
    fn step_interpolation_ramps_between_values() {
        let mut m = AttributeMap::new("DRIVER", "d");
        m.set("Type", "Step");
        m.set("TargetIDList", "muscle");
        m.set("Durations", "1 1");
        m.set("Values", "0 10");
        m.set("LinearInterpolation", "true");
        let mut d = Driver::from_attributes(&m).unwrap();
        assert_relative_eq!(eval(&mut d, 0.5), 5.0);
    }

    #[test]
    fn clamp_is_bit_exact() {
        let mut m = AttributeMap::new("DRIVER", "d");
        m.set("Type", "Fixed");
        m.set("TargetIDList", "muscle");
        m.set("Value", "7.5");
        m.set("DriverRange", "0 1");
        let mut d = Driver::from_attributes(&m).unwrap();
        assert_eq!(eval(&mut d, 0.0), 1.0);
    }

    #[test]
    fn stacked_boxcar_sums_overlapping_pulses() {
        let mut m = AttributeMap::new("DRIVER", "d");
        m.set("Type", "StackedBoxcar");
        m.set("TargetIDList", "muscle");
        m.set("CycleTime", "1.0");
        m.set("Delays", "0.0 0.4");
        m.set("Widths", "0.5 0.2");
        m.set("Heights", "1.0 2.0");
        let mut d = Driver::from_attributes(&m).unwrap();
        assert_relative_eq!(eval(&mut d, 0.1), 1.0);
        assert_relative_eq!(eval(&mut d, 0.45), 3.0);
        assert_relative_eq!(eval(&mut d, 0.55), 2.0);
        assert_relative_eq!(eval(&mut d, 0.8), 0.0);
    }

    #[test]
    fn marker_position_reads_the_chosen_axis() {
        use crate::marker::MarkerState;
        let mut m = AttributeMap::new("DRIVER", "d");
        m.set("Type", "MarkerPosition");
        m.set("TargetIDList", "muscle");
        m.set("MarkerID", "heel");
        m.set("Axis", "Z");
        let mut d = Driver::from_attributes(&m).unwrap();

        let mut markers = MarkerStates::new();
        markers.insert(
            "heel".to_string(),
            MarkerState {
                body: Some("foot".to_string()),
                pose: na::Isometry3::translation(0.3, -0.1, 0.07),
                velocity: na::Vector3::new(0.0, 0.0, -2.0),
            },
        );
        let loads = HashMap::new();
        let joints = HashMap::new();
        d.update(&context(0.0, &markers, &loads, &joints));
        assert_relative_eq!(d.value(), 0.07);

        m.set("Velocity", "true");
        let mut d = Driver::from_attributes(&m).unwrap();
        d.update(&context(0.0, &markers, &loads, &joints));
        assert_relative_eq!(d.value(), -2.0);
    }

    #[test]
    fn marker_ellipse_traces_its_parametric_path() {
        let mut m = AttributeMap::new("DRIVER", "d");
        m.set("Type", "MarkerEllipse");
        m.set("TargetIDList", "muscle");
        m.set("ReferenceMarkerID", "hip");
        m.set("RadiusA", "2.0");
        m.set("RadiusB", "0.5");
        m.set("Omega", "3.141592653589793"); // half a turn per second
        m.set("Phase", "0");
        m.set("OutputAxis", "X");
        let mut d = Driver::from_attributes(&m).unwrap();
        assert_relative_eq!(eval(&mut d, 0.0), 2.0);
        assert_relative_eq!(eval(&mut d, 1.0), -2.0, epsilon = 1e-12);
        m.set("OutputAxis", "Y");
        let mut d = Driver::from_attributes(&m).unwrap();
        assert_relative_eq!(eval(&mut d, 0.5), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn fixed_driver_broadcasts_to_all_targets() {
        let mut m = AttributeMap::new("DRIVER", "d");
        m.set("Type", "Fixed");
        m.set("TargetIDList", "left right");
        m.set("Value", "0.5");
        let mut d = Driver::from_attributes(&m).unwrap();
        eval(&mut d, 0.0);
        let emissions = d.emissions();
        assert_eq!(emissions.len(), 2);
        assert_eq!(emissions[0], ("left".to_string(), 0.5));
        assert_eq!(emissions[1], ("right".to_string(), 0.5));
    }
}
