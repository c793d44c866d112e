//! Controllers: drivables that are also drivers, closing a feedback loop
//! across the simulation step.

use crate::attributes::{AttributeMap, LoadError};
use crate::driver::DriveInput;

/// Shared PID state.
///
/// The integral uses the trapezium rule; the first sample seeds the previous
/// error so the derivative cannot spike; setpoint changes reset both to stop
/// wind-up.
struct PidState {
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    previous_error: Option<f64>,
}

impl PidState {
    fn new(kp: f64, ki: f64, kd: f64) -> PidState {
        PidState {
            kp,
            ki,
            kd,
            integral: 0.0,
            previous_error: None,
        }
    }

    fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_error = None;
    }

    fn compute(&mut self, error: f64, h: f64) -> f64 {
        let previous = self.previous_error.unwrap_or(error);
        self.integral += (error + previous) / 2.0 * h;
        let derivative = if h > 0.0 { (error - previous) / h } else { 0.0 };
        self.previous_error = Some(error);
        self.kp * error + self.ki * self.integral + self.kd * derivative
    }
}

/// Controller variants.
pub enum ControllerKind {
    /// The accumulated input is the error itself.
    PidErrorIn,
    /// The accumulated input is a desired muscle length; the error is the
    /// measured strap length (over the nominal length) minus that setpoint.
    PidMuscleLength {
        muscle: String,
        nominal_length: f64,
        last_setpoint: Option<f64>,
    },
}

/// A drivable that is also a driver.
#[derive(Debug)]
pub struct Controller {
    name: String,
    targets: Vec<String>,
    min_value: f64,
    max_value: f64,
    kind: ControllerKind,
    pid: PidState,
    input: DriveInput,
    value: f64,
    last_step_count: i64,
    dump: bool,
}

impl Controller {
    pub fn from_attributes(attributes: &AttributeMap) -> Result<Controller, LoadError> {
        let kind = match attributes.get_str("Type")? {
            "PIDErrorIn" => ControllerKind::PidErrorIn,
            "PIDMuscleLength" => ControllerKind::PidMuscleLength {
                muscle: attributes.get_str("MuscleID")?.to_string(),
                nominal_length: attributes.get_f64_or("NominalLength", 1.0)?,
                last_setpoint: None,
            },
            other => {
                return Err(attributes.invalid(format!("unknown controller Type \"{other}\"")));
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
        Ok(Controller {
            name: attributes.id().to_string(),
            targets: attributes.get_str_list("TargetIDList")?,
            min_value: range.0,
            max_value: range.1,
            kind,
            pid: PidState::new(
                attributes.get_f64("Kp")?,
                attributes.get_f64("Ki")?,
                attributes.get_f64("Kd")?,
            ),
            input: DriveInput::new(),
            value: 0.0,
            last_step_count: i64::MIN,
            dump: attributes.get_bool_or("Dump", false)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ControllerKind {
        &self.kind
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn input_mut(&mut self) -> &mut DriveInput {
        &mut self.input
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn dump(&self) -> bool {
        self.dump
    }

    /// The muscle whose length this controller reads, if any.
    pub fn muscle_id(&self) -> Option<&str> {
        match &self.kind {
            ControllerKind::PidMuscleLength { muscle, .. } => Some(muscle),
            ControllerKind::PidErrorIn => None,
        }
    }

    /// Runs the PID over this step's accumulated input.
    ///
    /// `muscle_length` is the measured strap length of the target muscle, for
    /// the length-tracking variant.
    pub fn update(&mut self, step_count: i64, h: f64, muscle_length: Option<f64>) {
        if self.last_step_count == step_count {
            // stacked controllers advance one cycle per step
            log::warn!("controller {} updated twice in one step", self.name);
        }
        let accumulated = self.input.sum_for(step_count);
        let error = match &mut self.kind {
            ControllerKind::PidErrorIn => accumulated,
            ControllerKind::PidMuscleLength {
                nominal_length,
                last_setpoint,
                ..
            } => {
                if last_setpoint.map_or(true, |s| s != accumulated) {
                    self.pid.reset();
                    *last_setpoint = Some(accumulated);
                }
                let measured = muscle_length.unwrap_or(0.0) / *nominal_length;
                measured - accumulated
            }
        };
        let output = self.pid.compute(error, h);
        self.value = output.clamp(self.min_value, self.max_value);
        self.last_step_count = step_count;
    }

    /// Downstream pushes, one per named target.
    pub fn emissions(&self) -> Vec<(String, f64)> {
        self.targets
            .iter()
            .map(|t| (t.clone(), self.value))
            .collect()
    }

    pub fn to_attributes(&self) -> AttributeMap {
        let mut map = AttributeMap::new("CONTROLLER", &self.name);
        map.set_str_list("TargetIDList", &self.targets);
        if self.min_value > -f64::MAX {
            map.set_f64_list("DriverRange", &[self.min_value, self.max_value]);
        }
        map.set_f64("Kp", self.pid.kp);
        map.set_f64("Ki", self.pid.ki);
        map.set_f64("Kd", self.pid.kd);
        match &self.kind {
            ControllerKind::PidErrorIn => map.set("Type", "PIDErrorIn"),
            ControllerKind::PidMuscleLength {
                muscle,
                nominal_length,
                ..
            } => {
                map.set("Type", "PIDMuscleLength");
                map.set("MuscleID", muscle.clone());
                map.set_f64("NominalLength", *nominal_length);
            }
        }
        if self.dump {
            map.set_bool("Dump", true);
        }
        map
    }

    pub fn dump_header(&self) -> String {
        "Time\tInput\tValue".to_string()
    }

    pub fn dump_line(&self, time: f64, step_count: i64) -> String {
        [time, self.input.sum_for(step_count), self.value]
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

    fn pid_error_in(kp: f64, ki: f64, kd: f64) -> Controller {
        let mut m = AttributeMap::new("CONTROLLER", "c");
        m.set("Type", "PIDErrorIn");
        m.set("TargetIDList", "muscle");
        m.set_f64("Kp", kp);
        m.set_f64("Ki", ki);
        m.set_f64("Kd", kd);
        m.set("DriverRange", "-10 10");
        Controller::from_attributes(&m).unwrap()
    }

    #[test]
    fn proportional_term_scales_error() {
        let mut c = pid_error_in(2.0, 0.0, 0.0);
        c.input_mut().receive(0.5, 0);
        c.update(0, 0.01, None);
        assert_relative_eq!(c.value(), 1.0);
    }

    #[test]
    fn first_step_has_no_derivative_spike() {
        let mut c = pid_error_in(0.0, 0.0, 100.0);
        c.input_mut().receive(5.0, 0);
        c.update(0, 0.01, None);
        // previous error seeds at the current error, so d term is zero
        assert_relative_eq!(c.value(), 0.0);
        c.input_mut().receive(5.0, 1);
        c.update(1, 0.01, None);
        assert_relative_eq!(c.value(), 0.0);
    }

    #[test]
    fn integral_accumulates_trapezoidally() {
        let mut c = pid_error_in(0.0, 1.0, 0.0);
        c.input_mut().receive(1.0, 0);
        c.update(0, 0.5, None);
        assert_relative_eq!(c.value(), 0.5);
        c.input_mut().receive(1.0, 1);
        c.update(1, 0.5, None);
        assert_relative_eq!(c.value(), 1.0);
    }

    #[test]
    fn output_clamps_to_range() {
        let mut c = pid_error_in(100.0, 0.0, 0.0);
        c.input_mut().receive(5.0, 0);
        c.update(0, 0.01, None);
        assert_relative_eq!(c.value(), 10.0);
    }

    #[test]
    fn setpoint_change_resets_windup() {
        let mut m = AttributeMap::new("CONTROLLER", "c");
        m.set("Type", "PIDMuscleLength");
        m.set("TargetIDList", "muscle");
        m.set("MuscleID", "muscle");
        m.set("NominalLength", "1.0");
        m.set("Kp", "0");
        m.set("Ki", "1");
        m.set("Kd", "0");
        let mut c = Controller::from_attributes(&m).unwrap();
        for step in 0..10 {
            c.input_mut().receive(0.5, step);
            c.update(step, 0.1, Some(1.0));
        }
        let wound_up = c.value().abs();
        assert!(wound_up > 0.0);
        // a new setpoint clears the integral
        c.input_mut().receive(0.6, 10);
        c.update(10, 0.1, Some(1.0));
        assert!(c.value().abs() < wound_up);
    }
}
