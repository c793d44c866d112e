//! The simulation orchestrator: owns every entity, runs the per-step
//! pipeline, accumulates fitness and energy, and applies the abort rules.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use log::{info, warn};
use rapier::na;
use rapier::prelude::{ColliderHandle, GenericJointBuilder, JointAxesMask};

use crate::attributes::{AttributeMap, LoadError};
use crate::body::Body;
use crate::controller::Controller;
use crate::data_target::{DataTarget, DataTargetKind, MarkerComparison, ScalarChannel, TargetValue};
use crate::driver::{Driver, DriverContext};
use crate::fluid_sac::FluidSac;
use crate::geom::{Geom, GeomContact};
use crate::joint::{Joint, JointGeometry};
use crate::marker::Marker;
use crate::muscle::Muscle;
use crate::physics::{CollisionFilter, IntegrationKind, PhysicsWorld, WorldSettings};
use crate::reporter::{DumpStream, Reporter};
use crate::strap::{MarkerStates, Strap};
use crate::warehouse::Warehouse;

/// Fitness composition selected in the GLOBAL element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitnessType {
    KinematicMatch,
    KinematicMatchMiniMax,
    ClosestWarehouse,
}

/// Global simulation parameters from the GLOBAL element.
#[derive(Debug)]
pub struct Global {
    pub settings: WorldSettings,
    pub linear_damping: f64,
    pub angular_damping: f64,
    pub fitness_type: FitnessType,
    pub bmr: f64,
    pub time_limit: f64,
    pub mechanical_energy_limit: f64,
    pub metabolic_energy_limit: f64,
    pub allow_connected_collisions: bool,
    pub allow_internal_collisions: bool,
    pub permitted_numerical_errors: i64,
    pub numerical_errors_score: f64,
    pub max_contacts: usize,
    pub distance_travelled_body: Option<String>,
}

impl Global {
    pub fn from_attributes(attributes: &AttributeMap) -> Result<Global, LoadError> {
        let integration_kind = match attributes.get_str("IntegrationStepType")? {
            "World" => IntegrationKind::World,
            "Quick" => IntegrationKind::Quick,
            other => {
                return Err(
                    attributes.invalid(format!("unknown IntegrationStepType \"{other}\""))
                )
            }
        };
        let fitness_type = match attributes.get_str("FitnessType")? {
            "KinematicMatch" => FitnessType::KinematicMatch,
            "KinematicMatchMiniMax" => FitnessType::KinematicMatchMiniMax,
            "ClosestWarehouse" => FitnessType::ClosestWarehouse,
            other => return Err(attributes.invalid(format!("unknown FitnessType \"{other}\""))),
        };
        Ok(Global {
            settings: WorldSettings {
                gravity: attributes.get_vector3("Gravity")?,
                step_size: attributes.get_f64("StepSize")?,
                erp: attributes.get_f64("ERP")?,
                cfm: attributes.get_f64("CFM")?,
                contact_max_correcting_velocity: attributes
                    .get_f64("ContactMaxCorrectingVel")?,
                contact_surface_layer: attributes.get_f64("ContactSurfaceLayer")?,
                integration_kind,
            },
            linear_damping: attributes.get_f64("LinearDamping")?,
            angular_damping: attributes.get_f64("AngularDamping")?,
            fitness_type,
            bmr: attributes.get_f64("BMR")?,
            time_limit: attributes.get_f64("TimeLimit")?,
            mechanical_energy_limit: attributes.get_f64("MechanicalEnergyLimit")?,
            metabolic_energy_limit: attributes.get_f64("MetabolicEnergyLimit")?,
            allow_connected_collisions: attributes.get_bool_or("AllowConnectedCollisions", false)?,
            allow_internal_collisions: attributes.get_bool_or("AllowInternalCollisions", false)?,
            permitted_numerical_errors: attributes.get_i64_or("PermittedNumericalErrors", 0)?,
            numerical_errors_score: attributes.get_f64("NumericalErrorsScore")?,
            max_contacts: attributes.get_usize_or("MaxContacts", 16)?,
            distance_travelled_body: attributes
                .get_str_opt("DistanceTravelledBodyID")
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }

    pub fn to_attributes(&self) -> AttributeMap {
        let mut map = AttributeMap::new("GLOBAL", "global");
        map.set_vector3("Gravity", &self.settings.gravity);
        map.set_f64("StepSize", self.settings.step_size);
        map.set_f64("ERP", self.settings.erp);
        map.set_f64("CFM", self.settings.cfm);
        map.set_f64(
            "ContactMaxCorrectingVel",
            self.settings.contact_max_correcting_velocity,
        );
        map.set_f64("ContactSurfaceLayer", self.settings.contact_surface_layer);
        map.set(
            "IntegrationStepType",
            match self.settings.integration_kind {
                IntegrationKind::World => "World",
                IntegrationKind::Quick => "Quick",
            },
        );
        map.set_f64("LinearDamping", self.linear_damping);
        map.set_f64("AngularDamping", self.angular_damping);
        map.set(
            "FitnessType",
            match self.fitness_type {
                FitnessType::KinematicMatch => "KinematicMatch",
                FitnessType::KinematicMatchMiniMax => "KinematicMatchMiniMax",
                FitnessType::ClosestWarehouse => "ClosestWarehouse",
            },
        );
        map.set_f64("BMR", self.bmr);
        map.set_f64("TimeLimit", self.time_limit);
        map.set_f64("MechanicalEnergyLimit", self.mechanical_energy_limit);
        map.set_f64("MetabolicEnergyLimit", self.metabolic_energy_limit);
        map.set_bool("AllowConnectedCollisions", self.allow_connected_collisions);
        map.set_bool("AllowInternalCollisions", self.allow_internal_collisions);
        map.set(
            "PermittedNumericalErrors",
            self.permitted_numerical_errors.to_string(),
        );
        map.set_f64("NumericalErrorsScore", self.numerical_errors_score);
        map.set("MaxContacts", self.max_contacts.to_string());
        if let Some(body) = &self.distance_travelled_body {
            map.set("DistanceTravelledBodyID", body.clone());
        }
        map
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Time or energy limit reached.
    Completed,
    /// An abort predicate fired.
    Aborted(String),
}

/// Owns every entity of one loaded model and advances it step by step.
#[derive(Debug)]
pub struct Simulation {
    pub(crate) global: Global,
    pub(crate) world: PhysicsWorld,
    pub(crate) filter: CollisionFilter,
    pub(crate) bodies: HashMap<String, Body>,
    pub(crate) markers: HashMap<String, Marker>,
    pub(crate) joints: HashMap<String, Joint>,
    pub(crate) geoms: HashMap<String, Geom>,
    pub(crate) straps: HashMap<String, Strap>,
    pub(crate) muscles: HashMap<String, Muscle>,
    pub(crate) fluid_sacs: HashMap<String, FluidSac>,
    pub(crate) drivers: HashMap<String, Driver>,
    pub(crate) controllers: HashMap<String, Controller>,
    pub(crate) data_targets: HashMap<String, DataTarget>,
    pub(crate) warehouses: HashMap<String, Warehouse>,
    pub(crate) reporters: HashMap<String, Reporter>,
    pub(crate) collider_to_geom: HashMap<ColliderHandle, String>,

    marker_states: MarkerStates,
    geom_loads: HashMap<String, f64>,
    previous_linear_velocities: HashMap<String, na::Vector3<f64>>,
    adhesion_pairs: HashSet<(ColliderHandle, ColliderHandle)>,

    time: f64,
    step_count: i64,
    cycle_time: Option<f64>,
    mechanical_energy: f64,
    metabolic_energy: f64,
    kinematic_match_fitness: f64,
    minimax_fitness: f64,
    closest_warehouse_fitness: f64,
    numerical_error_count: i64,
    abort: Option<String>,

    dump_directory: PathBuf,
    dump_streams: HashMap<String, DumpStream>,
    output_state_file: Option<PathBuf>,
    output_state_at_time: Option<f64>,
    output_state_at_cycle: Option<i64>,
    abort_after_state: bool,
    model_state_written: bool,
}

impl Simulation {
    /// An empty simulation around a configured world; the loader fills it.
    pub fn new(global: Global) -> Simulation {
        let mut world = PhysicsWorld::new();
        world.configure(&global.settings);
        let filter = CollisionFilter::new(
            global.allow_connected_collisions,
            global.allow_internal_collisions,
        );
        Simulation {
            global,
            world,
            filter,
            bodies: HashMap::new(),
            markers: HashMap::new(),
            joints: HashMap::new(),
            geoms: HashMap::new(),
            straps: HashMap::new(),
            muscles: HashMap::new(),
            fluid_sacs: HashMap::new(),
            drivers: HashMap::new(),
            controllers: HashMap::new(),
            data_targets: HashMap::new(),
            warehouses: HashMap::new(),
            reporters: HashMap::new(),
            collider_to_geom: HashMap::new(),
            marker_states: MarkerStates::new(),
            geom_loads: HashMap::new(),
            previous_linear_velocities: HashMap::new(),
            adhesion_pairs: HashSet::new(),
            time: 0.0,
            step_count: 0,
            cycle_time: None,
            mechanical_energy: 0.0,
            metabolic_energy: 0.0,
            kinematic_match_fitness: 0.0,
            minimax_fitness: 0.0,
            closest_warehouse_fitness: -f64::MAX,
            numerical_error_count: 0,
            abort: None,
            dump_directory: PathBuf::from("."),
            dump_streams: HashMap::new(),
            output_state_file: None,
            output_state_at_time: None,
            output_state_at_cycle: None,
            abort_after_state: false,
            model_state_written: false,
        }
    }

    pub fn global(&self) -> &Global {
        &self.global
    }

    pub fn world(&self) -> &PhysicsWorld {
        &self.world
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn step_count(&self) -> i64 {
        self.step_count
    }

    pub fn mechanical_energy(&self) -> f64 {
        self.mechanical_energy
    }

    pub fn metabolic_energy(&self) -> f64 {
        self.metabolic_energy
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort.as_deref()
    }

    pub fn set_dump_directory(&mut self, directory: PathBuf) {
        self.dump_directory = directory;
    }

    pub fn set_output_state_file(&mut self, path: PathBuf) {
        self.output_state_file = Some(path);
    }

    pub fn set_output_state_at_time(&mut self, time: f64) {
        self.output_state_at_time = Some(time);
    }

    pub fn set_output_state_at_cycle(&mut self, cycle: i64) {
        self.output_state_at_cycle = Some(cycle);
    }

    pub fn set_abort_after_state(&mut self, abort: bool) {
        self.abort_after_state = abort;
    }

    /// The fitness scalar for the selected composition mode.
    pub fn fitness(&self) -> f64 {
        match self.global.fitness_type {
            FitnessType::KinematicMatch => self.kinematic_match_fitness,
            FitnessType::KinematicMatchMiniMax => self.minimax_fitness,
            FitnessType::ClosestWarehouse => {
                if self.closest_warehouse_fitness == -f64::MAX {
                    0.0
                } else {
                    self.closest_warehouse_fitness
                }
            }
        }
    }

    /// Distance travelled by the configured reference body.
    pub fn distance_travelled(&self) -> f64 {
        let Some(name) = &self.global.distance_travelled_body else {
            return 0.0;
        };
        let Some(body) = self.bodies.get(name) else {
            return 0.0;
        };
        let current = body.pose(&self.world).translation.vector;
        (current - body.construction_position()).norm()
    }

    /// Finishing touches after the loader has inserted every entity: collision
    /// permissions, initial geometry, filters, cycle time.
    pub fn late_initialisation(&mut self) -> Result<(), LoadError> {
        let h = self.global.settings.step_size;

        // collision permissions
        let mut group_ids: HashMap<String, usize> = HashMap::new();
        let mut collider_groups = Vec::new();
        let mut exclusions = Vec::new();
        for geom in self.geoms.values() {
            let next = group_ids.len();
            let id = *group_ids
                .entry(geom.contact_group().to_string())
                .or_insert(next);
            collider_groups.push((geom.collider(), id));
            for excluded in geom.exclude_list() {
                let other = self.geoms.get(excluded).ok_or_else(|| {
                    LoadError::Unresolved {
                        tag: "GEOM".to_string(),
                        id: geom.name().to_string(),
                        attribute: "ExcludeIDList".to_string(),
                        value: excluded.clone(),
                    }
                })?;
                exclusions.push((geom.collider(), other.collider()));
            }
            self.collider_to_geom
                .insert(geom.collider(), geom.name().to_string());
        }
        for (collider, id) in collider_groups {
            self.filter.set_group(collider, id);
        }
        for (a, b) in exclusions {
            self.filter.exclude_pair(a, b);
        }
        for joint in self.joints.values() {
            let (m1, m2) = joint.marker_ids();
            let handle = |marker_id: &str| {
                self.markers
                    .get(marker_id)
                    .and_then(|m| m.body())
                    .and_then(|b| self.bodies.get(b))
                    .map(Body::handle)
            };
            if let (Some(h1), Some(h2)) = (handle(m1), handle(m2)) {
                self.filter.connect_bodies(h1, h2);
            }
        }

        // initial geometry so muscles and sacs see the t=0 state
        self.refresh_marker_states();

        // both wrap cylinders must share an axis direction
        for strap in self.straps.values() {
            if let crate::strap::StrapKind::TwoCylinderWrap {
                cylinder1,
                cylinder2,
                ..
            } = strap.kind()
            {
                let axis = |name: &str| {
                    self.marker_states
                        .get(name)
                        .map(|m| m.axis(crate::marker::Axis::Z))
                };
                if let (Some(a1), Some(a2)) = (axis(cylinder1), axis(cylinder2)) {
                    if a1.dot(&a2).abs() < 1.0 - 1.0e-6 {
                        return Err(LoadError::Invalid {
                            tag: "STRAP".to_string(),
                            id: strap.name().to_string(),
                            message: "wrap cylinder axes are not parallel".to_string(),
                        });
                    }
                }
            }
        }

        for muscle in self.muscles.values_mut() {
            let strap = self.straps.get_mut(muscle.strap_id()).ok_or_else(|| {
                LoadError::Unresolved {
                    tag: "MUSCLE".to_string(),
                    id: muscle.name().to_string(),
                    attribute: "StrapID".to_string(),
                    value: muscle.strap_id().to_string(),
                }
            })?;
            strap.update(&self.marker_states, h);
            if strap.length() <= 0.0 {
                return Err(LoadError::Invalid {
                    tag: "STRAP".to_string(),
                    id: strap.name().to_string(),
                    message: "strap has zero length".to_string(),
                });
            }
            muscle.late_initialisation(strap.length());
        }
        let mut sac_failure: Option<(String, String)> = None;
        for sac in self.fluid_sacs.values_mut() {
            if let Err(message) = sac.update(&self.marker_states, 0.0) {
                sac_failure = Some((sac.name().to_string(), message));
                break;
            }
        }
        if let Some((id, message)) = sac_failure {
            return Err(LoadError::Invalid {
                tag: "FLUIDSAC".to_string(),
                id,
                message,
            });
        }
        for joint in self.joints.values_mut() {
            joint.late_initialisation(h);
        }

        self.cycle_time = self
            .drivers
            .values()
            .filter_map(Driver::period)
            .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p))));

        for (name, body) in &self.bodies {
            self.previous_linear_velocities
                .insert(name.clone(), body.linear_velocity(&self.world));
        }
        Ok(())
    }

    fn refresh_marker_states(&mut self) {
        let mut states = MarkerStates::with_capacity(self.markers.len());
        for (name, marker) in &self.markers {
            let state = match marker.body().and_then(|b| self.bodies.get(b)) {
                Some(body) => marker.state(
                    &body.pose(&self.world),
                    &body.linear_velocity(&self.world),
                    &body.angular_velocity(&self.world),
                ),
                None => marker.state(
                    &na::Isometry3::identity(),
                    &na::Vector3::zeros(),
                    &na::Vector3::zeros(),
                ),
            };
            states.insert(name.clone(), state);
        }
        self.marker_states = states;
    }

    /// Advances the simulation one step, following the fixed phase order:
    /// scoring, contact rebuild, drivers, controllers, muscles, joints, fluid
    /// sacs, integrate, post-step checks.
    pub fn step(&mut self) {
        if self.abort.is_some() {
            return;
        }
        let h = self.global.settings.step_size;
        self.refresh_marker_states();

        // 1. scoring against the state of the step just completed
        self.score_data_targets(h);
        if self.abort.is_some() {
            return;
        }

        // 2. contact rebuild: the per-step records clear here and the engine
        // refills them during integrate
        for geom in self.geoms.values_mut() {
            geom.clear_contacts();
        }

        // 3. drivers
        let joint_geometry: HashMap<String, JointGeometry> = self
            .joints
            .iter()
            .filter_map(|(name, joint)| {
                joint
                    .geometry(&self.marker_states)
                    .map(|g| (name.clone(), g))
            })
            .collect();
        let mut emissions: Vec<(String, f64)> = Vec::new();
        {
            let context = DriverContext {
                time: self.time,
                step_size: h,
                step_count: self.step_count,
                markers: &self.marker_states,
                geom_loads: &self.geom_loads,
                joint_geometry: &joint_geometry,
            };
            let mut names: Vec<String> = self.drivers.keys().cloned().collect();
            names.sort();
            for name in names {
                let driver = self.drivers.get_mut(&name).unwrap();
                driver.update(&context);
                emissions.extend(driver.emissions());
            }
        }
        for (target, value) in emissions {
            self.push_drive(&target, value);
        }

        // 4. controllers in name order; a controller's push reaches another
        // controller only on the next cycle once the latter already updated
        let mut controller_names: Vec<String> = self.controllers.keys().cloned().collect();
        controller_names.sort();
        for name in controller_names {
            let mut controller = match self.controllers.remove(&name) {
                Some(controller) => controller,
                None => continue,
            };
            let muscle_length = controller
                .muscle_id()
                .and_then(|id| self.muscles.get(id))
                .and_then(|m| self.straps.get(m.strap_id()))
                .map(Strap::length);
            controller.update(self.step_count, h, muscle_length);
            let pushes = controller.emissions();
            self.controllers.insert(name, controller);
            for (target, value) in pushes {
                self.push_drive(&target, value);
            }
        }

        // 5. muscles and straps
        for muscle in self.muscles.values_mut() {
            if muscle.broken() {
                continue;
            }
            let strap = match self.straps.get_mut(muscle.strap_id()) {
                Some(strap) => strap,
                None => continue,
            };
            strap.update(&self.marker_states, h);
            muscle.update(strap, self.step_count, h);
            if muscle.broken() {
                continue;
            }
            let tension = strap.tension();
            for point_force in strap.point_forces() {
                if let Some(body) = point_force
                    .body
                    .as_deref()
                    .and_then(|name| self.bodies.get(name))
                {
                    self.world.add_force_at_point(
                        body.handle(),
                        point_force.direction * tension,
                        na::Point3::from(point_force.point),
                    );
                }
            }
        }

        // 6. joints
        for joint in self.joints.values_mut() {
            joint.update(&mut self.world, &self.marker_states, h);
        }

        // 7. fluid sacs
        let mut sac_failure: Option<String> = None;
        for sac in self.fluid_sacs.values_mut() {
            match sac.update(&self.marker_states, h) {
                Ok(()) => {
                    for load in sac.loads() {
                        if let Some(body) = load
                            .body
                            .as_deref()
                            .and_then(|name| self.bodies.get(name))
                        {
                            self.world.add_force_at_point(
                                body.handle(),
                                load.force,
                                na::Point3::from(load.point),
                            );
                        }
                    }
                }
                Err(message) => {
                    sac_failure = Some(message);
                    break;
                }
            }
        }
        if let Some(message) = sac_failure {
            // integrate is skipped, discarding this step's partial forces
            self.abort = Some(message);
            return;
        }

        // 8. integrate
        self.world.step(&self.filter);

        // 9. post-step bookkeeping and checks
        self.post_step(h);
    }

    /// Pushes a drive value into the named drivable, stamped with this step.
    fn push_drive(&mut self, target: &str, value: f64) {
        if let Some(muscle) = self.muscles.get_mut(target) {
            muscle.input_mut().receive(value, self.step_count);
        } else if let Some(controller) = self.controllers.get_mut(target) {
            controller.input_mut().receive(value, self.step_count);
        } else {
            warn!("drive target {target} not found");
        }
    }

    fn score_data_targets(&mut self, h: f64) {
        match self.global.fitness_type {
            FitnessType::ClosestWarehouse => {
                for warehouse in self.warehouses.values() {
                    let positions: Vec<na::Vector3<f64>> = warehouse
                        .body_ids()
                        .iter()
                        .filter_map(|name| self.bodies.get(name))
                        .map(|body| body.pose(&self.world).translation.vector)
                        .collect();
                    if positions.len() != warehouse.body_ids().len() {
                        continue;
                    }
                    let distance = warehouse.nearest_distance(&positions);
                    if -distance > self.closest_warehouse_fitness {
                        self.closest_warehouse_fitness = -distance;
                    }
                }
            }
            FitnessType::KinematicMatch | FitnessType::KinematicMatchMiniMax => {
                let mut samples: Vec<(String, TargetValue)> = Vec::new();
                for (name, data_target) in &self.data_targets {
                    if let Some(value) = self.current_target_value(data_target) {
                        samples.push((name.clone(), value));
                    }
                }
                let mut min_score = f64::MAX;
                for (name, value) in samples {
                    let data_target = self.data_targets.get_mut(&name).unwrap();
                    if let Some(score) = data_target.evaluate(self.time, h, &value) {
                        self.kinematic_match_fitness += score;
                        if score < min_score {
                            min_score = score;
                        }
                    }
                    if data_target.abort_exceeded() {
                        self.abort =
                            Some(format!("data target {name} over abort threshold"));
                    }
                }
                if min_score < f64::MAX {
                    self.minimax_fitness += min_score;
                }
            }
        }
    }

    /// Samples the simulation-side value a data target compares against.
    fn current_target_value(&self, data_target: &DataTarget) -> Option<TargetValue> {
        match data_target.kind() {
            DataTargetKind::Scalar {
                target,
                channel,
                reference_marker,
                ..
            } => self
                .scalar_channel_value(target, *channel, reference_marker.as_deref())
                .map(TargetValue::Scalar),
            DataTargetKind::Vector { target, .. } => {
                if let Some(body) = self.bodies.get(target) {
                    return Some(TargetValue::Vector(
                        body.pose(&self.world).translation.vector,
                    ));
                }
                self.marker_states
                    .get(target)
                    .map(|m| TargetValue::Vector(m.position()))
            }
            DataTargetKind::Quaternion { target, .. } => {
                if let Some(body) = self.bodies.get(target) {
                    return Some(TargetValue::Quaternion(body.pose(&self.world).rotation));
                }
                self.marker_states
                    .get(target)
                    .map(|m| TargetValue::Quaternion(m.pose.rotation))
            }
            DataTargetKind::MarkerCompare {
                marker1,
                marker2,
                comparison,
                ..
            } => {
                let m1 = self.marker_states.get(marker1)?;
                let m2 = self.marker_states.get(marker2)?;
                let value = match comparison {
                    MarkerComparison::Distance => (m1.position() - m2.position()).norm(),
                    MarkerComparison::Angle => {
                        let dot = m1
                            .pose
                            .rotation
                            .coords
                            .dot(&m2.pose.rotation.coords)
                            .abs()
                            .clamp(-1.0, 1.0);
                        2.0 * dot.acos()
                    }
                };
                Some(TargetValue::Scalar(value))
            }
        }
    }

    fn scalar_channel_value(
        &self,
        target: &str,
        channel: ScalarChannel,
        reference_marker: Option<&str>,
    ) -> Option<f64> {
        use ScalarChannel::*;
        match channel {
            Time => return Some(self.time),
            MechanicalEnergy => return Some(self.mechanical_energy),
            MetabolicEnergy => return Some(self.metabolic_energy),
            _ => {}
        }
        if let Some(body) = self.bodies.get(target) {
            let pose = body.pose(&self.world);
            let mut position = pose.translation.vector;
            let mut velocity = body.linear_velocity(&self.world);
            if let Some(reference) = reference_marker.and_then(|r| self.marker_states.get(r)) {
                position = reference
                    .pose
                    .inverse_transform_point(&na::Point3::from(position))
                    .coords;
                velocity = reference.pose.rotation.inverse() * velocity;
            }
            let angular = body.angular_velocity(&self.world);
            let q = pose.rotation;
            let h = self.global.settings.step_size;
            let acceleration = |i: usize| {
                let previous = self
                    .previous_linear_velocities
                    .get(target)
                    .copied()
                    .unwrap_or_else(na::Vector3::zeros);
                if h > 0.0 {
                    (body.linear_velocity(&self.world)[i] - previous[i]) / h
                } else {
                    0.0
                }
            };
            return Some(match channel {
                XP => position.x,
                YP => position.y,
                ZP => position.z,
                Q0 => q.w,
                Q1 => q.i,
                Q2 => q.j,
                Q3 => q.k,
                XV => velocity.x,
                YV => velocity.y,
                ZV => velocity.z,
                XRV => angular.x,
                YRV => angular.y,
                ZRV => angular.z,
                XA => acceleration(0),
                YA => acceleration(1),
                ZA => acceleration(2),
                _ => return None,
            });
        }
        if let Some(state) = self.marker_states.get(target) {
            let position = state.position();
            let q = state.pose.rotation;
            return Some(match channel {
                XP => position.x,
                YP => position.y,
                ZP => position.z,
                Q0 => q.w,
                Q1 => q.i,
                Q2 => q.j,
                Q3 => q.k,
                XV => state.velocity.x,
                YV => state.velocity.y,
                ZV => state.velocity.z,
                _ => return None,
            });
        }
        if let Some(muscle) = self.muscles.get(target) {
            let strap = self.straps.get(muscle.strap_id())?;
            return Some(match channel {
                Force => strap.tension(),
                Length => strap.length(),
                _ => return None,
            });
        }
        if let Some(joint) = self.joints.get(target) {
            return match channel {
                Angle => joint.angle(),
                _ => None,
            };
        }
        if let Some(geom) = self.geoms.get(target) {
            return match channel {
                ContactCount => Some(geom.contacts().len() as f64),
                Force => Some(geom.contact_load()),
                _ => None,
            };
        }
        None
    }

    fn post_step(&mut self, h: f64) {
        // numerical errors from the engine, counted against the cap
        if let Some(message) = self.world.error_sink_mut().take() {
            self.numerical_error_count += 1;
            if self.global.permitted_numerical_errors >= 0
                && self.numerical_error_count > self.global.permitted_numerical_errors
            {
                self.abort = Some(format!(
                    "numerical error count {} over limit: {message}",
                    self.numerical_error_count
                ));
            } else {
                warn!("t={} numerical error: {message}", self.time);
                self.kinematic_match_fitness += self.global.numerical_errors_score;
                self.minimax_fitness += self.global.numerical_errors_score;
            }
        }

        // contacts are recorded two-sided, then adhesion and abort flags apply
        let records = self.world.harvest_contacts();
        let mut adhesions: Vec<(ColliderHandle, ColliderHandle, na::Point3<f64>)> = Vec::new();
        for record in &records {
            let name1 = self.collider_to_geom.get(&record.collider1).cloned();
            let name2 = self.collider_to_geom.get(&record.collider2).cloned();
            if let Some(geom) = name1.as_deref().and_then(|n| self.geoms.get_mut(n)) {
                geom.add_contact(GeomContact {
                    position: record.position.coords,
                    normal: record.normal,
                    force: record.force,
                });
            }
            if let Some(geom) = name2.as_deref().and_then(|n| self.geoms.get_mut(n)) {
                geom.add_contact(GeomContact {
                    position: record.position.coords,
                    normal: record.normal,
                    force: -record.force,
                });
            }
            if self.abort.is_none() {
                let abort_geom = [&name1, &name2]
                    .into_iter()
                    .flatten()
                    .find(|n| self.geoms.get(*n).map_or(false, Geom::abort));
                if let Some(name) = abort_geom {
                    self.abort = Some(format!("contact on abort geom {name}"));
                }
            }
            let adhesion = [&name1, &name2]
                .into_iter()
                .flatten()
                .any(|n| self.geoms.get(n).map_or(false, Geom::adhesion));
            if adhesion {
                adhesions.push((record.collider1, record.collider2, record.position));
            }
        }
        // adhesion welds the pair with a permanent ball joint at the contact
        for (c1, c2, point) in adhesions {
            let key = crate::physics::ordered_collider_pair(c1, c2);
            if !self.adhesion_pairs.insert(key) {
                continue;
            }
            let parent = |world: &PhysicsWorld, c: ColliderHandle| {
                world.colliders().get(c).and_then(|collider| collider.parent())
            };
            let (b1, b2) = match (parent(&self.world, c1), parent(&self.world, c2)) {
                (Some(b1), Some(b2)) => (b1, b2),
                _ => continue,
            };
            let pose1 = match self.world.bodies().get(b1) {
                Some(body) => *body.position(),
                None => continue,
            };
            let pose2 = match self.world.bodies().get(b2) {
                Some(body) => *body.position(),
                None => continue,
            };
            let joint = GenericJointBuilder::new(JointAxesMask::LOCKED_SPHERICAL_AXES)
                .local_anchor1(pose1.inverse_transform_point(&point))
                .local_anchor2(pose2.inverse_transform_point(&point))
                .build();
            self.world.insert_joint(b1, b2, joint);
        }

        // reaction loads the reflex drivers read next step
        self.geom_loads = self
            .geoms
            .iter()
            .map(|(name, geom)| (name.clone(), geom.contact_load()))
            .collect();

        // energy bookkeeping
        for muscle in self.muscles.values() {
            if muscle.broken() {
                continue;
            }
            if let Some(strap) = self.straps.get(muscle.strap_id()) {
                self.mechanical_energy += muscle.mechanical_power(strap) * h;
                self.metabolic_energy += muscle.metabolic_power(strap) * h;
            }
        }
        self.metabolic_energy += self.global.bmr * h;

        // abort predicates
        if self.abort.is_none() {
            for (name, body) in &self.bodies {
                if let Some(violation) = body.test_limits(&self.world) {
                    self.abort = Some(format!("body {name}: {violation}"));
                    break;
                }
            }
        }
        if self.abort.is_none() {
            for joint in self.joints.values() {
                if let Some(reason) = joint.check_abort() {
                    self.abort = Some(reason);
                    break;
                }
            }
        }

        self.write_dumps();
        self.handle_state_output();

        for (name, body) in &self.bodies {
            self.previous_linear_velocities
                .insert(name.clone(), body.linear_velocity(&self.world));
        }

        self.time += h;
        self.step_count += 1;
    }

    fn write_dumps(&mut self) {
        let time = self.time;
        let directory = self.dump_directory.clone();
        let mut write = |streams: &mut HashMap<String, DumpStream>,
                         name: &str,
                         header: String,
                         line: String| {
            streams
                .entry(name.to_string())
                .or_insert_with(|| DumpStream::new(&directory, name))
                .write_record(&header, &line);
        };

        for (name, body) in &self.bodies {
            if body.dump() {
                write(
                    &mut self.dump_streams,
                    name,
                    body.dump_header(),
                    body.dump_line(time, &self.world),
                );
            }
        }
        for (name, marker) in &self.markers {
            if marker.dump() {
                let pose = marker
                    .body()
                    .and_then(|b| self.bodies.get(b))
                    .map(|b| b.pose(&self.world))
                    .unwrap_or_else(na::Isometry3::identity);
                write(
                    &mut self.dump_streams,
                    name,
                    marker.dump_header(),
                    marker.dump_line(time, &pose),
                );
            }
        }
        for (name, joint) in &self.joints {
            if joint.dump() {
                write(
                    &mut self.dump_streams,
                    name,
                    joint.dump_header(),
                    joint.dump_line(time),
                );
            }
        }
        for (name, geom) in &self.geoms {
            if geom.dump() {
                write(
                    &mut self.dump_streams,
                    name,
                    geom.dump_header(),
                    geom.dump_line(time),
                );
            }
        }
        for (name, muscle) in &self.muscles {
            if muscle.dump() {
                if let Some(strap) = self.straps.get(muscle.strap_id()) {
                    write(
                        &mut self.dump_streams,
                        name,
                        muscle.dump_header(),
                        muscle.dump_line(time, strap),
                    );
                }
            }
        }
        for (name, sac) in &self.fluid_sacs {
            if sac.dump() {
                write(
                    &mut self.dump_streams,
                    name,
                    sac.dump_header(),
                    sac.dump_line(time),
                );
            }
        }
        for (name, driver) in &self.drivers {
            if driver.dump() {
                write(
                    &mut self.dump_streams,
                    name,
                    driver.dump_header(),
                    driver.dump_line(time),
                );
            }
        }
        for (name, controller) in &self.controllers {
            if controller.dump() {
                write(
                    &mut self.dump_streams,
                    name,
                    controller.dump_header(),
                    controller.dump_line(time, self.step_count),
                );
            }
        }
        for (name, data_target) in &self.data_targets {
            if data_target.dump() {
                write(
                    &mut self.dump_streams,
                    name,
                    data_target.dump_header(),
                    data_target.dump_line(time),
                );
            }
        }
        let fitness = self.fitness();
        let (mechanical, metabolic) = (self.mechanical_energy, self.metabolic_energy);
        for (name, reporter) in &self.reporters {
            write(
                &mut self.dump_streams,
                name,
                reporter.dump_header(),
                reporter.dump_line(time, fitness, mechanical, metabolic),
            );
        }
    }

    fn handle_state_output(&mut self) {
        if self.model_state_written {
            return;
        }
        let due_by_time = self.output_state_at_time.map_or(false, |t| self.time >= t);
        let due_by_cycle = match (self.output_state_at_cycle, self.cycle_time) {
            (Some(cycle), Some(period)) => self.time >= cycle as f64 * period,
            _ => false,
        };
        if !(due_by_time || due_by_cycle) {
            return;
        }
        let Some(path) = self.output_state_file.clone() else {
            return;
        };
        match std::fs::write(&path, crate::loader::save_model(self)) {
            Ok(()) => {
                info!("model state written to {}", path.display());
                self.model_state_written = true;
                if self.abort_after_state {
                    self.abort = Some("model state written".to_string());
                }
            }
            Err(error) => {
                warn!("cannot write model state: {error}");
                self.output_state_file = None;
            }
        }
    }

    /// True when a limit says the run is complete (not an abort).
    pub fn should_quit(&self) -> bool {
        if self.global.time_limit > 0.0 && self.time >= self.global.time_limit {
            return true;
        }
        if self.global.mechanical_energy_limit > 0.0
            && self.mechanical_energy >= self.global.mechanical_energy_limit
        {
            return true;
        }
        if self.global.metabolic_energy_limit > 0.0
            && self.metabolic_energy >= self.global.metabolic_energy_limit
        {
            return true;
        }
        false
    }

    /// Runs until a limit or an abort, returning how it ended.
    pub fn run(&mut self) -> RunOutcome {
        while !self.should_quit() {
            self.step();
            if let Some(reason) = &self.abort {
                return RunOutcome::Aborted(reason.clone());
            }
        }
        RunOutcome::Completed
    }
}
