//! Muscle models: tension generators driving a strap from an activation.
//!
//! Three variants: the instantaneous Minetti & Alexander model, the complete
//! Hill-type version with serial and parallel elastic elements, and a damped
//! spring. Minetti & Alexander, J. theor. Biol. (1997) 186, 467-476.

use log::warn;

use crate::attributes::{AttributeMap, LoadError};
use crate::driver::DriveInput;
use crate::maths;
use crate::strap::Strap;

/// Strain-stress law of an elastic element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrainModel {
    Linear,
    Square,
}

impl StrainModel {
    fn from_attribute(attributes: &AttributeMap, name: &str) -> Result<StrainModel, LoadError> {
        match attributes.get_str_opt(name) {
            None | Some("Linear") => Ok(StrainModel::Linear),
            Some("Square") => Ok(StrainModel::Square),
            Some(other) => Err(attributes.invalid(format!("unknown strain model \"{other}\""))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            StrainModel::Linear => "Linear",
            StrainModel::Square => "Square",
        }
    }
}

/// Minetti & Alexander force-velocity curve.
///
/// `v` is the contraction velocity, positive while shortening; the result is
/// the full-activation force for a muscle of isometric strength `f0`.
fn force_velocity(f0: f64, vmax: f64, k: f64, v: f64) -> f64 {
    let v = v.clamp(-vmax, vmax);
    if v < 0.0 {
        // lengthening
        f0 * (1.8 - 0.8 * ((vmax + v) / (vmax - (7.56 / k) * v)))
    } else {
        f0 * (vmax - v) / (vmax + (v / k))
    }
}

/// Umberger-style metabolic cost ratio of the normalised shortening velocity.
fn metabolic_sigma(rel_v: f64) -> f64 {
    let rel_v = rel_v.clamp(-1.0, 1.0);
    let v2 = rel_v * rel_v;
    let v3 = v2 * rel_v;
    (0.054 + 0.506 * rel_v + 2.46 * v2) / (1.0 - 1.13 * rel_v + 12.8 * v2 - 1.64 * v3)
}

/// Instantaneous Minetti & Alexander model.
pub struct MinettiAlexander {
    force_per_unit_area: f64,
    vmax_factor: f64,
    pca: f64,
    fibre_length: f64,
    k: f64,
    f0: f64,
    vmax: f64,
    alpha: f64,
}

impl MinettiAlexander {
    fn from_attributes(attributes: &AttributeMap) -> Result<MinettiAlexander, LoadError> {
        let force_per_unit_area = attributes.get_f64("ForcePerUnitArea")?;
        let vmax_factor = attributes.get_f64("VMaxFactor")?;
        let pca = attributes.get_f64("PCA")?;
        let fibre_length = attributes.get_f64("FibreLength")?;
        Ok(MinettiAlexander {
            force_per_unit_area,
            vmax_factor,
            pca,
            fibre_length,
            k: attributes.get_f64("ActivationK")?,
            f0: pca * force_per_unit_area,
            vmax: fibre_length * vmax_factor,
            alpha: 0.0,
        })
    }

    /// Sets the active fibre proportion and the resulting strap tension.
    fn update(&mut self, strap: &mut Strap, stimulus: f64) {
        self.alpha = stimulus.clamp(0.0, 1.0);
        let f_full = force_velocity(self.f0, self.vmax, self.k, strap.velocity());
        strap.set_tension(self.alpha * f_full);
    }

    fn metabolic_power(&self, strap: &Strap) -> f64 {
        self.alpha * self.f0 * self.vmax * metabolic_sigma(strap.velocity() / self.vmax)
    }
}

/// Everything the force-error residual reads and writes.
///
/// Velocities here are lengthening-positive, matching the element algebra;
/// the strap's shortening velocity is negated on the way in.
#[derive(Debug, Clone, Default)]
struct HillElements {
    lpe: f64,
    lse: f64,
    vce: f64,
    vse: f64,
    fpe: f64,
    fse: f64,
    fce: f64,
    f0: f64,
    target_fce: f64,
    err: f64,
}

/// Hill model with serial and parallel spring/damper elements.
pub struct MinettiAlexanderComplete {
    // contractile element
    force_per_unit_area: f64,
    vmax_factor: f64,
    pca: f64,
    fibre_length: f64,
    k: f64,
    width: f64,
    fmax: f64,
    vmax: f64,
    // parallel element
    parallel_strain_at_fmax: f64,
    parallel_strain_rate_at_fmax: f64,
    parallel_strain_model: StrainModel,
    spe: f64,
    epe: f64,
    dpe: f64,
    // serial element
    serial_strain_at_fmax: f64,
    serial_strain_rate_at_fmax: f64,
    serial_strain_model: StrainModel,
    sse: f64,
    ese: f64,
    dse: f64,
    // activation
    activation_kinetics: bool,
    fast_twitch_proportion: f64,
    t_act: f64,
    t_deact: f64,
    activation_rate: f64,
    minimum_activation: f64,
    alpha: Option<f64>,
    // solver
    tolerance: f64,
    last_lpe: Option<f64>,
    elements: HillElements,
    stimulus: f64,
}

fn elastic_constant(
    fmax: f64,
    strain_at_fmax: f64,
    slack_length: f64,
    model: StrainModel,
) -> f64 {
    if strain_at_fmax == 0.0 {
        return 0.0;
    }
    match model {
        StrainModel::Linear => fmax / (strain_at_fmax * slack_length),
        StrainModel::Square => fmax / (strain_at_fmax * slack_length).powi(2),
    }
}

fn damping_constant(fmax: f64, strain_rate_at_fmax: f64, slack_length: f64) -> f64 {
    if strain_rate_at_fmax == 0.0 {
        0.0
    } else {
        fmax / (strain_rate_at_fmax * slack_length)
    }
}

fn element_force(
    extension: f64,
    velocity: f64,
    elastic: f64,
    damping: f64,
    model: StrainModel,
) -> f64 {
    if extension <= 0.0 {
        return 0.0;
    }
    let force = match model {
        StrainModel::Linear => elastic * extension + damping * velocity,
        StrainModel::Square => elastic * extension * extension + damping * velocity,
    };
    force.max(0.0)
}

impl MinettiAlexanderComplete {
    fn from_attributes(attributes: &AttributeMap) -> Result<MinettiAlexanderComplete, LoadError> {
        let force_per_unit_area = attributes.get_f64("ForcePerUnitArea")?;
        let vmax_factor = attributes.get_f64("VMaxFactor")?;
        let pca = attributes.get_f64("PCA")?;
        let fibre_length = attributes.get_f64("FibreLength")?;
        let fmax = pca * force_per_unit_area;
        let vmax = fibre_length * vmax_factor;

        let parallel_strain_at_fmax = attributes.get_f64("ParallelStrainAtFmax")?;
        let parallel_strain_rate_at_fmax = attributes.get_f64("ParallelStrainRateAtFmax")?;
        let parallel_strain_model = StrainModel::from_attribute(attributes, "ParallelStrainModel")?;
        let spe = fibre_length;

        let serial_strain_at_fmax = attributes.get_f64("SerialStrainAtFmax")?;
        let serial_strain_rate_at_fmax = attributes.get_f64("SerialStrainRateAtFmax")?;
        let serial_strain_model = StrainModel::from_attribute(attributes, "SerialStrainModel")?;
        // a tendon length of -1 is derived later from the strap's rest length
        let sse = attributes.get_f64("TendonLength")?;

        let fast_twitch_proportion = attributes.get_f64_or("FastTwitchProportion", 0.5)?;
        let t_activation_a = attributes.get_f64_or("TActivationA", 80.0e-3)?;
        let t_activation_b = attributes.get_f64_or("TActivationB", -0.47e-3)?;
        let t_deactivation_a = attributes.get_f64_or("TDeactivationA", 90.0e-3)?;
        let t_deactivation_b = attributes.get_f64_or("TDeactivationB", -0.56e-3)?;

        let mut muscle = MinettiAlexanderComplete {
            force_per_unit_area,
            vmax_factor,
            pca,
            fibre_length,
            k: attributes.get_f64("ActivationK")?,
            width: attributes.get_f64("Width")?,
            fmax,
            vmax,
            parallel_strain_at_fmax,
            parallel_strain_rate_at_fmax,
            parallel_strain_model,
            spe,
            epe: elastic_constant(fmax, parallel_strain_at_fmax, spe, parallel_strain_model),
            dpe: damping_constant(fmax, parallel_strain_rate_at_fmax, spe),
            serial_strain_at_fmax,
            serial_strain_rate_at_fmax,
            serial_strain_model,
            sse,
            ese: 0.0,
            dse: 0.0,
            activation_kinetics: attributes.get_bool_or("ActivationKinetics", false)?,
            fast_twitch_proportion,
            t_act: t_activation_a + t_activation_b * fast_twitch_proportion,
            t_deact: t_deactivation_a + t_deactivation_b * fast_twitch_proportion,
            activation_rate: attributes.get_f64_or("ActivationRate", 0.0)?,
            minimum_activation: attributes.get_f64_or("MinimumActivation", 0.001)?,
            alpha: None,
            tolerance: attributes.get_f64_or("Tolerance", maths::DEFAULT_ZERO_TOLERANCE)?,
            last_lpe: match attributes.get_f64_or("InitialFibreLength", -1.0)? {
                l if l >= 0.0 => Some(l),
                _ => None,
            },
            elements: HillElements::default(),
            stimulus: 0.0,
        };
        if muscle.sse >= 0.0 {
            muscle.derive_serial_constants();
        }
        Ok(muscle)
    }

    fn derive_serial_constants(&mut self) {
        self.ese = elastic_constant(
            self.fmax,
            self.serial_strain_at_fmax,
            self.sse,
            self.serial_strain_model,
        );
        self.dse = damping_constant(self.fmax, self.serial_strain_rate_at_fmax, self.sse);
    }

    /// Completes setup once the strap's rest length is known.
    fn late_initialisation(&mut self, strap_length: f64) {
        if self.sse < 0.0 {
            self.sse = (strap_length - self.spe).max(0.0);
            self.derive_serial_constants();
        }
        if self.last_lpe.is_none() {
            let min_lpe = (self.spe - self.spe * self.width / 2.0).max(0.0);
            let max_lpe = (strap_length - self.sse).max(min_lpe);
            self.last_lpe = Some((max_lpe + min_lpe) / 2.0);
        }
    }

    /// First-order activation kinetics (Nagano & Gerritsen 2001 eq. A2), or a
    /// bounded rate when kinetics are disabled.
    fn update_activation(&mut self, stimulus: f64, h: f64) {
        let stimulus = stimulus.clamp(self.minimum_activation, 1.0);
        self.stimulus = stimulus;
        let alpha = match self.alpha {
            None => stimulus,
            Some(alpha) => {
                if self.activation_kinetics {
                    let t2 = 1.0 / self.t_deact;
                    let t1 = 1.0 / self.t_act - t2;
                    let qdot = (stimulus - alpha) * (t1 * stimulus + t2);
                    (alpha + qdot * h).clamp(self.minimum_activation, 1.0)
                } else if self.activation_rate != 0.0 {
                    let step = self.activation_rate * h;
                    if stimulus > alpha {
                        (alpha + step).min(stimulus)
                    } else {
                        (alpha - step).max(stimulus)
                    }
                } else {
                    stimulus
                }
            }
        };
        self.alpha = Some(alpha);
    }

    /// Force mismatch between the contractile law and the elastic elements at
    /// a trial fibre length. Also records every element quantity at the trial.
    fn force_error(&self, lpe: f64, total_length: f64, lengthening_rate: f64, h: f64) -> HillElements {
        let mut e = HillElements {
            lpe,
            lse: total_length - lpe,
            ..HillElements::default()
        };
        let last_lpe = self.last_lpe.unwrap_or(lpe);
        e.vce = if h > 0.0 { (lpe - last_lpe) / h } else { 0.0 };
        e.vse = lengthening_rate - e.vce;

        e.fpe = element_force(
            e.lpe - self.spe,
            e.vce,
            self.epe,
            self.dpe,
            self.parallel_strain_model,
        );
        e.fse = element_force(
            e.lse - self.sse,
            e.vse,
            self.ese,
            self.dse,
            self.serial_strain_model,
        );
        e.target_fce = e.fse - e.fpe;

        let alpha = self.alpha.unwrap_or(0.0);
        e.f0 = (self.fmax * (1.0 - 4.0 * (e.lpe / self.spe - 1.0).powi(2) / self.width)).max(0.0);
        e.fce = if e.f0 > 0.0 && alpha > 0.0 {
            let vce = e.vce.clamp(-self.vmax, self.vmax);
            if vce > 0.0 {
                // eccentric
                alpha * e.f0 * (1.8 + (0.8 * self.k * (vce - self.vmax)) / (7.56 * vce + self.k * self.vmax))
            } else {
                // concentric
                (alpha * e.f0 * self.k * (vce + self.vmax)) / (-vce + self.k * self.vmax)
            }
        } else {
            0.0
        };
        e.err = e.fce - e.target_fce;
        e
    }

    /// Solves the fibre length so the contractile and elastic forces agree,
    /// then loads the strap with the serial element force.
    fn update(&mut self, strap: &mut Strap, stimulus: f64, h: f64, name: &str) {
        self.update_activation(stimulus, h);

        let total_length = strap.length();
        let lengthening_rate = -strap.velocity();

        let min_lpe = (self.spe - self.spe * self.width / 2.0).max(0.0);
        let min_length = self.sse + min_lpe;
        if total_length <= min_length {
            // slack: nothing is stretched and the fibre sits at its minimum
            self.last_lpe = Some(min_lpe);
            self.elements = HillElements {
                lpe: min_lpe,
                lse: self.sse,
                ..HillElements::default()
            };
            strap.set_tension(0.0);
            return;
        }

        if self.ese == 0.0 {
            // no tendon spring: the fibre takes all the non-tendon length
            let e = self.force_error(total_length - self.sse, total_length, lengthening_rate, h);
            self.last_lpe = Some(e.lpe);
            self.elements = e;
            strap.set_tension(self.elements.fse);
            return;
        }

        let seed = self
            .last_lpe
            .unwrap_or((total_length - self.sse).max(min_lpe))
            .clamp(0.0, total_length);
        let mut residual =
            |lpe: f64| self.force_error(lpe, total_length, lengthening_rate, h).err;
        let first = residual(seed);
        let solution = if first.abs() <= self.tolerance {
            Some(seed)
        } else {
            maths::expand_bracket(seed, 0.0, total_length, 100, &mut residual).and_then(
                |(low, high)| maths::zeroin(low, high, &mut residual, self.tolerance),
            )
        };

        match solution {
            Some(lpe) => {
                self.elements = self.force_error(lpe, total_length, lengthening_rate, h);
                self.last_lpe = Some(lpe);
            }
            None => {
                warn!("muscle {name}: unable to solve fibre length, keeping previous");
                self.elements = self.force_error(seed, total_length, lengthening_rate, h);
                self.last_lpe = Some(seed);
            }
        }
        strap.set_tension(self.elements.fse);
    }

    fn metabolic_power(&self) -> f64 {
        let alpha = self.alpha.unwrap_or(0.0);
        alpha * self.elements.f0 * self.vmax * metabolic_sigma(-self.elements.vce / self.vmax)
    }

    /// Stored serial element energy. With damping this is stored, not
    /// necessarily returned.
    fn serial_elastic_energy(&self) -> f64 {
        let extension = self.elements.lse - self.sse;
        if extension <= 0.0 {
            return 0.0;
        }
        match self.serial_strain_model {
            StrainModel::Linear => 0.5 * extension * extension * self.ese,
            StrainModel::Square => extension.powi(3) * self.ese / 3.0,
        }
    }

    fn parallel_elastic_energy(&self) -> f64 {
        let extension = self.elements.lpe - self.spe;
        if extension <= 0.0 {
            return 0.0;
        }
        match self.parallel_strain_model {
            StrainModel::Linear => 0.5 * extension * extension * self.epe,
            StrainModel::Square => extension.powi(3) * self.epe / 3.0,
        }
    }
}

/// Damped spring element with a breaking strain.
pub struct DampedSpring {
    unloaded_length: f64,
    spring_constant: f64,
    area: f64,
    damping: f64,
    breaking_strain: f64,
    activation: f64,
}

impl DampedSpring {
    fn from_attributes(attributes: &AttributeMap) -> Result<DampedSpring, LoadError> {
        Ok(DampedSpring {
            unloaded_length: attributes.get_f64("UnloadedLength")?,
            spring_constant: attributes.get_f64("SpringConstant")?,
            area: attributes.get_f64("Area")?,
            damping: attributes.get_f64("Damping")?,
            breaking_strain: attributes.get_f64("BreakingStrain")?,
            activation: 0.0,
        })
    }

    /// Activation scales the stress linearly; a slack spring carries nothing.
    fn update(&mut self, strap: &mut Strap, stimulus: f64) {
        self.activation = stimulus;
        let elastic_strain = (strap.length() - self.unloaded_length) / self.unloaded_length;
        let elastic_stress = elastic_strain * self.spring_constant;
        let tension = if elastic_stress <= 0.0 {
            0.0
        } else {
            let lengthening_rate = -strap.velocity() / self.unloaded_length;
            let damping_stress = lengthening_rate * self.damping;
            ((elastic_stress + damping_stress) * self.area * self.activation).max(0.0)
        };
        strap.set_tension(tension);
    }

    fn should_break(&self, strap: &Strap) -> bool {
        if self.breaking_strain <= 0.0 {
            return false;
        }
        (strap.length() - self.unloaded_length) / self.unloaded_length > self.breaking_strain
    }

    fn elastic_energy(&self, strap: &Strap) -> f64 {
        let extension = strap.length() - self.unloaded_length;
        if extension <= 0.0 {
            return 0.0;
        }
        0.5 * self.spring_constant * self.area * extension * extension / self.unloaded_length
    }
}

/// Model variants of a [Muscle].
pub enum MuscleKind {
    MinettiAlexander(MinettiAlexander),
    MinettiAlexanderComplete(MinettiAlexanderComplete),
    DampedSpring(DampedSpring),
}

/// A named actuator driving one strap.
#[derive(Debug)]
pub struct Muscle {
    name: String,
    strap: String,
    kind: MuscleKind,
    input: DriveInput,
    broken: bool,
    dump: bool,
}

impl Muscle {
    pub fn from_attributes(attributes: &AttributeMap) -> Result<Muscle, LoadError> {
        let kind = match attributes.get_str("Type")? {
            "MinettiAlexander" => {
                MuscleKind::MinettiAlexander(MinettiAlexander::from_attributes(attributes)?)
            }
            "MinettiAlexanderComplete" => MuscleKind::MinettiAlexanderComplete(
                MinettiAlexanderComplete::from_attributes(attributes)?,
            ),
            "DampedSpring" => MuscleKind::DampedSpring(DampedSpring::from_attributes(attributes)?),
            other => {
                return Err(attributes.invalid(format!("unknown muscle Type \"{other}\"")));
            }
        };
        Ok(Muscle {
            name: attributes.id().to_string(),
            strap: attributes.get_str("StrapID")?.to_string(),
            kind,
            input: DriveInput::new(),
            broken: false,
            dump: attributes.get_bool_or("Dump", false)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strap_id(&self) -> &str {
        &self.strap
    }

    pub fn kind(&self) -> &MuscleKind {
        &self.kind
    }

    pub fn input_mut(&mut self) -> &mut DriveInput {
        &mut self.input
    }

    /// A broken damped spring stays out of the active set for the run.
    pub fn broken(&self) -> bool {
        self.broken
    }

    pub fn dump(&self) -> bool {
        self.dump
    }

    /// Called once after load when the strap geometry is first known.
    pub fn late_initialisation(&mut self, strap_length: f64) {
        if let MuscleKind::MinettiAlexanderComplete(m) = &mut self.kind {
            m.late_initialisation(strap_length);
        }
    }

    /// Computes activation from the accumulated drive and loads the strap.
    pub fn update(&mut self, strap: &mut Strap, step_count: i64, h: f64) {
        if self.broken {
            strap.set_tension(0.0);
            return;
        }
        let stimulus = self.input.sum_for(step_count);
        match &mut self.kind {
            MuscleKind::MinettiAlexander(m) => m.update(strap, stimulus),
            MuscleKind::MinettiAlexanderComplete(m) => {
                let name = self.name.clone();
                m.update(strap, stimulus, h, &name)
            }
            MuscleKind::DampedSpring(m) => {
                m.update(strap, stimulus);
                if m.should_break(strap) {
                    warn!("muscle {} exceeded its breaking strain", self.name);
                    self.broken = true;
                    strap.set_tension(0.0);
                }
            }
        }
    }

    /// Mechanical power delivered through the strap, positive while the
    /// tension does work on the path (shortening under load).
    pub fn mechanical_power(&self, strap: &Strap) -> f64 {
        strap.tension() * strap.velocity()
    }

    pub fn metabolic_power(&self, strap: &Strap) -> f64 {
        match &self.kind {
            MuscleKind::MinettiAlexander(m) => m.metabolic_power(strap),
            MuscleKind::MinettiAlexanderComplete(m) => m.metabolic_power(),
            MuscleKind::DampedSpring(_) => 0.0,
        }
    }

    pub fn elastic_energy(&self, strap: &Strap) -> f64 {
        match &self.kind {
            MuscleKind::MinettiAlexander(_) => 0.0,
            MuscleKind::MinettiAlexanderComplete(m) => {
                m.serial_elastic_energy() + m.parallel_elastic_energy()
            }
            MuscleKind::DampedSpring(m) => m.elastic_energy(strap),
        }
    }

    /// Activation currently acting in the model.
    pub fn activation(&self) -> f64 {
        match &self.kind {
            MuscleKind::MinettiAlexander(m) => m.alpha,
            MuscleKind::MinettiAlexanderComplete(m) => m.alpha.unwrap_or(0.0),
            MuscleKind::DampedSpring(m) => m.activation,
        }
    }

    pub fn to_attributes(&self) -> AttributeMap {
        let mut map = AttributeMap::new("MUSCLE", &self.name);
        map.set("StrapID", self.strap.clone());
        match &self.kind {
            MuscleKind::MinettiAlexander(m) => {
                map.set("Type", "MinettiAlexander");
                map.set_f64("ForcePerUnitArea", m.force_per_unit_area);
                map.set_f64("VMaxFactor", m.vmax_factor);
                map.set_f64("PCA", m.pca);
                map.set_f64("FibreLength", m.fibre_length);
                map.set_f64("ActivationK", m.k);
            }
            MuscleKind::MinettiAlexanderComplete(m) => {
                map.set("Type", "MinettiAlexanderComplete");
                map.set_f64("ForcePerUnitArea", m.force_per_unit_area);
                map.set_f64("VMaxFactor", m.vmax_factor);
                map.set_f64("PCA", m.pca);
                map.set_f64("FibreLength", m.fibre_length);
                map.set_f64("ActivationK", m.k);
                map.set_f64("Width", m.width);
                map.set_f64("TendonLength", m.sse);
                map.set_f64("SerialStrainAtFmax", m.serial_strain_at_fmax);
                map.set_f64("SerialStrainRateAtFmax", m.serial_strain_rate_at_fmax);
                map.set("SerialStrainModel", m.serial_strain_model.as_str());
                map.set_f64("ParallelStrainAtFmax", m.parallel_strain_at_fmax);
                map.set_f64("ParallelStrainRateAtFmax", m.parallel_strain_rate_at_fmax);
                map.set("ParallelStrainModel", m.parallel_strain_model.as_str());
                map.set_bool("ActivationKinetics", m.activation_kinetics);
                map.set_f64("FastTwitchProportion", m.fast_twitch_proportion);
                map.set_f64("ActivationRate", m.activation_rate);
                map.set_f64("MinimumActivation", m.minimum_activation);
                if let Some(lpe) = m.last_lpe {
                    map.set_f64("InitialFibreLength", lpe);
                }
            }
            MuscleKind::DampedSpring(m) => {
                map.set("Type", "DampedSpring");
                map.set_f64("UnloadedLength", m.unloaded_length);
                map.set_f64("SpringConstant", m.spring_constant);
                map.set_f64("Area", m.area);
                map.set_f64("Damping", m.damping);
                map.set_f64("BreakingStrain", m.breaking_strain);
            }
        }
        if self.dump {
            map.set_bool("Dump", true);
        }
        map
    }

    pub fn dump_header(&self) -> String {
        "Time\tActivation\tTension\tLength\tVelocity\tPMech\tPMet".to_string()
    }

    pub fn dump_line(&self, time: f64, strap: &Strap) -> String {
        [
            time,
            self.activation(),
            strap.tension(),
            strap.length(),
            strap.velocity(),
            self.mechanical_power(strap),
            self.metabolic_power(strap),
        ]
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
    use crate::strap::MarkerStates;
    use approx::assert_relative_eq;
    use rapier::na;

    fn strap_of_length(length: f64) -> (Strap, MarkerStates) {
        let mut m = AttributeMap::new("STRAP", "s");
        m.set("Type", "TwoPoint");
        m.set("OriginMarkerID", "o");
        m.set("InsertionMarkerID", "i");
        let mut strap = Strap::from_attributes(&m).unwrap();
        let mut markers = MarkerStates::new();
        markers.insert(
            "o".into(),
            MarkerState {
                body: Some("a".into()),
                pose: na::Isometry3::identity(),
                velocity: na::Vector3::zeros(),
            },
        );
        markers.insert(
            "i".into(),
            MarkerState {
                body: Some("b".into()),
                pose: na::Isometry3::translation(length, 0.0, 0.0),
                velocity: na::Vector3::zeros(),
            },
        );
        strap.update(&markers, 0.001);
        (strap, markers)
    }

    fn ma_muscle() -> Muscle {
        let mut m = AttributeMap::new("MUSCLE", "biceps");
        m.set("Type", "MinettiAlexander");
        m.set("StrapID", "s");
        m.set("ForcePerUnitArea", "300000");
        m.set("VMaxFactor", "8.4");
        m.set("PCA", "0.001");  // fmax = 300
        m.set("FibreLength", "0.1"); // vmax = 0.84
        m.set("ActivationK", "0.17");
        Muscle::from_attributes(&m).unwrap()
    }

    fn complete_muscle(tendon_length: f64) -> Muscle {
        let mut m = AttributeMap::new("MUSCLE", "biceps");
        m.set("Type", "MinettiAlexanderComplete");
        m.set("StrapID", "s");
        m.set("ForcePerUnitArea", "200000");
        m.set("VMaxFactor", "8.4");
        m.set("PCA", "0.0005"); // fmax = 100
        m.set("FibreLength", "0.5"); // optimal fibre length
        m.set("ActivationK", "0.17");
        m.set("Width", "1.0");
        m.set_f64("TendonLength", tendon_length);
        m.set("SerialStrainAtFmax", "0.06");
        m.set("SerialStrainRateAtFmax", "0");
        m.set("SerialStrainModel", "Linear");
        m.set("ParallelStrainAtFmax", "0.6");
        m.set("ParallelStrainRateAtFmax", "0");
        m.set("ParallelStrainModel", "Linear");
        Muscle::from_attributes(&m).unwrap()
    }

    #[test]
    fn zero_activation_means_zero_tension() {
        let (mut strap, _) = strap_of_length(1.0);
        let mut muscle = ma_muscle();
        muscle.input_mut().receive(0.0, 0);
        muscle.update(&mut strap, 0, 0.001);
        assert_eq!(strap.tension(), 0.0);
    }

    #[test]
    fn isometric_tension_is_fmax_at_full_activation() {
        let (mut strap, _) = strap_of_length(1.0);
        let mut muscle = ma_muscle();
        muscle.input_mut().receive(1.0, 0);
        muscle.update(&mut strap, 0, 0.001);
        // v = 0 so the force-velocity curve gives exactly fmax
        assert_relative_eq!(strap.tension(), 300.0, epsilon = 1e-9);
    }

    #[test]
    fn hill_steady_state_balances_tendon_and_fibre() {
        // strap held at constant length: after settling, the tension equals
        // the contractile force at the solved fibre length
        let (mut strap, markers) = strap_of_length(1.0);
        let mut muscle = complete_muscle(0.5);
        muscle.late_initialisation(strap.length());
        let h = 0.001;
        for step in 0..2000 {
            strap.update(&markers, h);
            muscle.input_mut().receive(1.0, step);
            muscle.update(&mut strap, step, h);
        }
        let m = match muscle.kind() {
            MuscleKind::MinettiAlexanderComplete(m) => m,
            _ => unreachable!(),
        };
        // the x-space solver tolerance bounds the force residual loosely
        assert!(m.elements.err.abs() <= 1e-3);
        // at steady state the fibre is isometric and fse - fpe = fce(v=0)
        assert!(m.elements.vce.abs() < 1e-4);
        assert_relative_eq!(
            m.elements.fse - m.elements.fpe,
            m.elements.fce,
            epsilon = 1e-3
        );
        assert!(strap.tension() > 0.0);
    }

    #[test]
    fn slack_hill_muscle_carries_no_tension() {
        let (mut strap, _) = strap_of_length(0.4); // below tendon + min fibre
        let mut muscle = complete_muscle(0.5);
        muscle.late_initialisation(strap.length());
        muscle.input_mut().receive(1.0, 0);
        muscle.update(&mut strap, 0, 0.001);
        assert_eq!(strap.tension(), 0.0);
    }

    #[test]
    fn damped_spring_breaks_beyond_breaking_strain() {
        let (mut strap, _) = strap_of_length(2.0);
        let mut m = AttributeMap::new("MUSCLE", "ligament");
        m.set("Type", "DampedSpring");
        m.set("StrapID", "s");
        m.set("UnloadedLength", "1.0");
        m.set("SpringConstant", "1000");
        m.set("Area", "0.01");
        m.set("Damping", "0");
        m.set("BreakingStrain", "0.5");
        let mut muscle = Muscle::from_attributes(&m).unwrap();
        muscle.input_mut().receive(1.0, 0);
        muscle.update(&mut strap, 0, 0.001);
        assert!(muscle.broken());
        assert_eq!(strap.tension(), 0.0);
        // once broken it never loads the strap again
        muscle.input_mut().receive(1.0, 1);
        muscle.update(&mut strap, 1, 0.001);
        assert_eq!(strap.tension(), 0.0);
    }

    #[test]
    fn damped_spring_tension_follows_strain() {
        let (mut strap, _) = strap_of_length(1.1);
        let mut m = AttributeMap::new("MUSCLE", "ligament");
        m.set("Type", "DampedSpring");
        m.set("StrapID", "s");
        m.set("UnloadedLength", "1.0");
        m.set("SpringConstant", "1000");
        m.set("Area", "0.01");
        m.set("Damping", "0");
        m.set("BreakingStrain", "-1");
        let mut muscle = Muscle::from_attributes(&m).unwrap();
        muscle.input_mut().receive(1.0, 0);
        muscle.update(&mut strap, 0, 0.001);
        // strain 0.1 * E 1000 * area 0.01 * activation 1
        assert_relative_eq!(strap.tension(), 1.0, epsilon = 1e-9);
    }
}
