//! Thin adapter around the rapier constrained-dynamics engine.
//!
//! Everything the simulator needs from the engine goes through [PhysicsWorld]:
//! body/joint/collider storage, the per-step pipeline call, pairwise collision
//! filtering, and post-integrate contact harvesting. No other module builds
//! rapier pipeline state.

use std::collections::{HashMap, HashSet};

use log::debug;
use rapier::na;
use rapier::prelude::*;

/// Integrator selection from the GLOBAL element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationKind {
    /// Accurate mode: raised solver iteration counts.
    World,
    /// Fast mode: engine default iteration counts.
    Quick,
}

/// Solver iterations used by [IntegrationKind::World].
const WORLD_STEP_VELOCITY_ITERATIONS: usize = 16;
const WORLD_STEP_FRICTION_ITERATIONS: usize = 16;

/// The subset of the GLOBAL element the engine itself consumes.
#[derive(Debug, Clone)]
pub struct WorldSettings {
    pub gravity: na::Vector3<f64>,
    pub step_size: f64,
    pub erp: f64,
    pub cfm: f64,
    pub contact_max_correcting_velocity: f64,
    pub contact_surface_layer: f64,
    pub integration_kind: IntegrationKind,
}

impl Default for WorldSettings {
    fn default() -> Self {
        WorldSettings {
            gravity: na::Vector3::new(0.0, 0.0, -9.81),
            step_size: 1.0e-4,
            erp: 0.2,
            cfm: 1.0e-10,
            contact_max_correcting_velocity: 100.0,
            contact_surface_layer: 0.001,
            integration_kind: IntegrationKind::World,
        }
    }
}

/// One contact found after integration, in world coordinates.
///
/// `normal` points from the first collider towards the second; `force` is the
/// constraint impulse over the step converted to a force on the first collider.
#[derive(Debug, Clone)]
pub struct ContactRecord {
    pub collider1: ColliderHandle,
    pub collider2: ColliderHandle,
    pub position: na::Point3<f64>,
    pub normal: na::Vector3<f64>,
    pub force: na::Vector3<f64>,
}

/// Instance-owned sink for engine numerical anomalies.
///
/// The orchestrator reads and clears the pending message after each integrate,
/// so independent simulations in one process never share error state.
#[derive(Debug, Default)]
pub struct ErrorSink {
    pending: Option<String>,
}

impl ErrorSink {
    pub fn record(&mut self, message: impl Into<String>) {
        // only the first message per step is kept, the rest would repeat it
        if self.pending.is_none() {
            self.pending = Some(message.into());
        }
    }

    pub fn take(&mut self) -> Option<String> {
        self.pending.take()
    }
}

/// Pairwise collision permissions derived from the model at load time.
///
/// Implements the engine's contact-pair filter so that exclusion lists, contact
/// groups and joined-body suppression run inside the broadphase/narrowphase.
#[derive(Debug, Default)]
pub struct CollisionFilter {
    allow_connected: bool,
    allow_internal: bool,
    excluded: HashSet<(ColliderHandle, ColliderHandle)>,
    groups: HashMap<ColliderHandle, usize>,
    connected: HashSet<(RigidBodyHandle, RigidBodyHandle)>,
}

/// Normalises a collider pair so either traversal order maps to one key.
pub fn ordered_collider_pair(
    a: ColliderHandle,
    b: ColliderHandle,
) -> (ColliderHandle, ColliderHandle) {
    if a.into_raw_parts() <= b.into_raw_parts() {
        (a, b)
    } else {
        (b, a)
    }
}

fn ordered_body_pair(
    a: RigidBodyHandle,
    b: RigidBodyHandle,
) -> (RigidBodyHandle, RigidBodyHandle) {
    if a.into_raw_parts() <= b.into_raw_parts() {
        (a, b)
    } else {
        (b, a)
    }
}

impl CollisionFilter {
    pub fn new(allow_connected: bool, allow_internal: bool) -> CollisionFilter {
        CollisionFilter {
            allow_connected,
            allow_internal,
            ..CollisionFilter::default()
        }
    }

    pub fn exclude_pair(&mut self, a: ColliderHandle, b: ColliderHandle) {
        self.excluded.insert(ordered_collider_pair(a, b));
    }

    pub fn set_group(&mut self, collider: ColliderHandle, group: usize) {
        self.groups.insert(collider, group);
    }

    pub fn connect_bodies(&mut self, a: RigidBodyHandle, b: RigidBodyHandle) {
        self.connected.insert(ordered_body_pair(a, b));
    }

    fn pair_allowed(
        &self,
        collider1: ColliderHandle,
        collider2: ColliderHandle,
        body1: Option<RigidBodyHandle>,
        body2: Option<RigidBodyHandle>,
    ) -> bool {
        if self
            .excluded
            .contains(&ordered_collider_pair(collider1, collider2))
        {
            return false;
        }
        if !self.allow_internal {
            if let (Some(g1), Some(g2)) = (self.groups.get(&collider1), self.groups.get(&collider2))
            {
                if g1 == g2 {
                    return false;
                }
            }
        }
        if !self.allow_connected {
            if let (Some(b1), Some(b2)) = (body1, body2) {
                if self.connected.contains(&ordered_body_pair(b1, b2)) {
                    return false;
                }
            }
        }
        true
    }
}

impl PhysicsHooks for CollisionFilter {
    fn filter_contact_pair(&self, context: &PairFilterContext) -> Option<SolverFlags> {
        if self.pair_allowed(
            context.collider1,
            context.collider2,
            context.rigid_body1,
            context.rigid_body2,
        ) {
            Some(SolverFlags::COMPUTE_IMPULSES)
        } else {
            None
        }
    }

    fn filter_intersection_pair(&self, context: &PairFilterContext) -> bool {
        self.pair_allowed(
            context.collider1,
            context.collider2,
            context.rigid_body1,
            context.rigid_body2,
        )
    }
}

/// A struct to store all the parameters for the [PhysicsPipeline]
struct PhysicsPipelineParameters {
    gravity: Vector<Real>,
    integration_parameters: IntegrationParameters,
    islands: IslandManager,
    broad_phase: BroadPhase,
    narrow_phase: NarrowPhase,
    rigid_body_set: RigidBodySet,
    collider_set: ColliderSet,
    impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    ccd_solver: CCDSolver,
}

/// The simulation's rigid-body world.
pub struct PhysicsWorld {
    physics_pipeline: PhysicsPipeline,
    params: PhysicsPipelineParameters,
    world_body: RigidBodyHandle,
    error_sink: ErrorSink,
}

impl std::fmt::Debug for PhysicsWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicsWorld")
            .field("world_body", &self.world_body)
            .field("error_sink", &self.error_sink)
            .finish()
    }
}

impl PhysicsWorld {
    /// Creates an empty world containing only the static anchor body that
    /// world-frame markers attach to.
    pub fn new() -> PhysicsWorld {
        let mut params = PhysicsPipelineParameters {
            gravity: vector![0.0, 0.0, 0.0],
            integration_parameters: IntegrationParameters::default(),
            islands: IslandManager::new(),
            broad_phase: BroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
        };
        let world_body = params
            .rigid_body_set
            .insert(RigidBodyBuilder::fixed().build());

        PhysicsWorld {
            physics_pipeline: PhysicsPipeline::new(),
            params,
            world_body,
            error_sink: ErrorSink::default(),
        }
    }

    /// Applies the GLOBAL element's engine parameters.
    pub fn configure(&mut self, settings: &WorldSettings) {
        let params = &mut self.params;
        params.gravity = settings.gravity;

        let ip = &mut params.integration_parameters;
        ip.dt = settings.step_size;
        ip.erp = settings.erp;
        ip.joint_erp = settings.erp;
        ip.allowed_linear_error = settings.contact_surface_layer;
        // the engine caps penetration correction as a distance per step
        ip.max_penetration_correction =
            settings.contact_max_correcting_velocity * settings.step_size;
        match settings.integration_kind {
            IntegrationKind::World => {
                ip.max_velocity_iterations = WORLD_STEP_VELOCITY_ITERATIONS;
                ip.max_velocity_friction_iterations = WORLD_STEP_FRICTION_ITERATIONS;
            }
            IntegrationKind::Quick => {
                let defaults = IntegrationParameters::default();
                ip.max_velocity_iterations = defaults.max_velocity_iterations;
                ip.max_velocity_friction_iterations = defaults.max_velocity_friction_iterations;
            }
        }
        if settings.cfm != 0.0 {
            // no engine analog; kept as model data and reported once
            debug!("CFM={} has no direct engine mapping", settings.cfm);
        }
    }

    /// The static body world-frame markers and joints anchor to.
    pub fn world_body(&self) -> RigidBodyHandle {
        self.world_body
    }

    pub fn bodies(&self) -> &RigidBodySet {
        &self.params.rigid_body_set
    }

    pub fn bodies_mut(&mut self) -> &mut RigidBodySet {
        &mut self.params.rigid_body_set
    }

    pub fn colliders(&self) -> &ColliderSet {
        &self.params.collider_set
    }

    pub fn joints(&self) -> &ImpulseJointSet {
        &self.params.impulse_joint_set
    }

    pub fn joints_mut(&mut self) -> &mut ImpulseJointSet {
        &mut self.params.impulse_joint_set
    }

    pub fn step_size(&self) -> f64 {
        self.params.integration_parameters.dt
    }

    pub fn error_sink_mut(&mut self) -> &mut ErrorSink {
        &mut self.error_sink
    }

    /// Inserts a rigid body and returns its handle.
    pub fn insert_body(&mut self, body: RigidBody) -> RigidBodyHandle {
        self.params.rigid_body_set.insert(body)
    }

    /// Inserts a collider attached to `body`.
    pub fn insert_collider(&mut self, collider: Collider, body: RigidBodyHandle) -> ColliderHandle {
        self.params.collider_set.insert_with_parent(
            collider,
            body,
            &mut self.params.rigid_body_set,
        )
    }

    /// Inserts an impulse joint between two bodies.
    pub fn insert_joint(
        &mut self,
        body1: RigidBodyHandle,
        body2: RigidBodyHandle,
        joint: GenericJoint,
    ) -> ImpulseJointHandle {
        self.params
            .impulse_joint_set
            .insert(body1, body2, joint, true)
    }

    /// Applies a world-frame force at a world point on `body` for this step.
    pub fn add_force_at_point(
        &mut self,
        body: RigidBodyHandle,
        force: na::Vector3<f64>,
        point: na::Point3<f64>,
    ) {
        if let Some(rb) = self.params.rigid_body_set.get_mut(body) {
            if rb.is_dynamic() {
                rb.add_force_at_point(force, point, true);
            }
        }
    }

    /// Advances the world by the configured step.
    ///
    /// A zero step size skips the integrator entirely so that poses and twists
    /// are untouched.
    pub fn step(&mut self, hooks: &dyn PhysicsHooks) {
        if self.params.integration_parameters.dt == 0.0 {
            return;
        }
        let params = &mut self.params;
        let events_handler = &();

        self.physics_pipeline.step(
            &params.gravity,
            &params.integration_parameters,
            &mut params.islands,
            &mut params.broad_phase,
            &mut params.narrow_phase,
            &mut params.rigid_body_set,
            &mut params.collider_set,
            &mut params.impulse_joint_set,
            &mut params.multibody_joint_set,
            &mut params.ccd_solver,
            hooks,
            events_handler,
        );

        // clear the per-step external forces the straps and sacs applied
        for (_, body) in params.rigid_body_set.iter_mut() {
            body.reset_forces(false);
            body.reset_torques(false);
        }

        self.check_finite();
    }

    /// Routes non-finite body state into the error sink.
    fn check_finite(&mut self) {
        for (_, body) in self.params.rigid_body_set.iter() {
            let p = body.position();
            let v = body.linvel();
            let w = body.angvel();
            let finite = p.translation.vector.iter().all(|x| x.is_finite())
                && p.rotation.coords.iter().all(|x| x.is_finite())
                && v.iter().all(|x| x.is_finite())
                && w.iter().all(|x| x.is_finite());
            if !finite {
                self.error_sink
                    .record("non-finite body state after integration");
                return;
            }
        }
    }

    /// Collects the contacts produced by the last step.
    pub fn harvest_contacts(&self) -> Vec<ContactRecord> {
        let dt = self.params.integration_parameters.dt;
        let inv_dt = if dt > 0.0 { 1.0 / dt } else { 0.0 };
        let mut records = Vec::new();
        for pair in self.params.narrow_phase.contact_pairs() {
            if !pair.has_any_active_contact {
                continue;
            }
            let collider1 = match self.params.collider_set.get(pair.collider1) {
                Some(c) => c,
                None => continue,
            };
            for manifold in &pair.manifolds {
                let normal = manifold.data.normal;
                for point in &manifold.points {
                    if point.dist > 0.0 {
                        continue;
                    }
                    let position = collider1.position() * point.local_p1;
                    records.push(ContactRecord {
                        collider1: pair.collider1,
                        collider2: pair.collider2,
                        position,
                        normal,
                        force: normal * (point.data.impulse * inv_dt),
                    });
                }
            }
        }
        records
    }
}

impl Default for PhysicsWorld {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn free_fall_matches_discrete_integration() {
        let mut world = PhysicsWorld::new();
        let settings = WorldSettings {
            gravity: na::Vector3::new(0.0, 0.0, -9.81),
            step_size: 0.001,
            ..WorldSettings::default()
        };
        world.configure(&settings);
        let handle = world.insert_body(
            RigidBodyBuilder::dynamic()
                .translation(vector![0.0, 0.0, 10.0])
                .build(),
        );
        let filter = CollisionFilter::default();
        for _ in 0..1000 {
            world.step(&filter);
        }
        let z = world.bodies().get(handle).unwrap().translation().z;
        // analytic value is 10 - g/2 = 5.095; the engine integrates
        // semi-implicitly so the discrete answer differs by g*h*t/2
        assert_relative_eq!(z, 10.0 - 0.5 * 9.81, epsilon = 1e-2);
        let vz = world.bodies().get(handle).unwrap().linvel().z;
        assert_relative_eq!(vz, -9.81, epsilon = 1e-6);
    }

    #[test]
    fn zero_step_size_is_a_no_op() {
        let mut world = PhysicsWorld::new();
        let settings = WorldSettings {
            step_size: 0.0,
            ..WorldSettings::default()
        };
        world.configure(&settings);
        let handle = world.insert_body(
            RigidBodyBuilder::dynamic()
                .translation(vector![1.0, 2.0, 3.0])
                .build(),
        );
        world.step(&CollisionFilter::default());
        let body = world.bodies().get(handle).unwrap();
        assert_relative_eq!(body.translation().z, 3.0);
        assert_relative_eq!(body.linvel().norm(), 0.0);
    }

    #[test]
    fn error_sink_keeps_first_message() {
        let mut sink = ErrorSink::default();
        sink.record("first");
        sink.record("second");
        assert_eq!(sink.take().unwrap(), "first");
        assert!(sink.take().is_none());
    }
}
