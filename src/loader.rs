//! Model-file loading and saving.
//!
//! The document is a flat tag/attribute tree. Loading is two-pass: every
//! element parses into an attribute map first, then creation runs to a fixed
//! point so forward references resolve in any order; whatever is still
//! unresolved when a full pass creates nothing is reported together.

use std::collections::HashSet;

use log::warn;

use crate::attributes::{AttributeMap, LoadError};
use crate::body::Body;
use crate::controller::Controller;
use crate::data_target::{DataTarget, DataTargetKind, ScalarChannel};
use crate::driver::{Driver, DriverKind};
use crate::fluid_sac::FluidSac;
use crate::geom::Geom;
use crate::joint::Joint;
use crate::marker::Marker;
use crate::muscle::Muscle;
use crate::reporter::Reporter;
use crate::simulation::{Global, Simulation};
use crate::strap::Strap;
use crate::warehouse::Warehouse;

const KNOWN_TAGS: &[&str] = &[
    "GLOBAL",
    "BODY",
    "MARKER",
    "JOINT",
    "GEOM",
    "STRAP",
    "MUSCLE",
    "FLUIDSAC",
    "DRIVER",
    "DATATARGET",
    "CONTROLLER",
    "REPORTER",
    "WAREHOUSE",
];

/// Attributes the loader understands, per tag; anything else warns.
fn known_attributes(tag: &str) -> &'static [&'static str] {
    match tag {
        "GLOBAL" => &[
            "ID",
            "Gravity",
            "StepSize",
            "ERP",
            "CFM",
            "ContactMaxCorrectingVel",
            "ContactSurfaceLayer",
            "LinearDamping",
            "AngularDamping",
            "IntegrationStepType",
            "FitnessType",
            "BMR",
            "TimeLimit",
            "MechanicalEnergyLimit",
            "MetabolicEnergyLimit",
            "AllowConnectedCollisions",
            "AllowInternalCollisions",
            "PermittedNumericalErrors",
            "NumericalErrorsScore",
            "MaxContacts",
            "DistanceTravelledBodyID",
        ],
        "BODY" => &[
            "ID",
            "Mass",
            "MOI",
            "ConstructionPosition",
            "ConstructionDensity",
            "Position",
            "Quaternion",
            "LinearVelocity",
            "AngularVelocity",
            "PositionLowBound",
            "PositionHighBound",
            "LinearVelocityLowBound",
            "LinearVelocityHighBound",
            "AngularVelocityLowBound",
            "AngularVelocityHighBound",
            "Dump",
        ],
        "MARKER" => &["ID", "BodyID", "Position", "Quaternion", "Dump"],
        "JOINT" => &[
            "ID",
            "Type",
            "Body1MarkerID",
            "Body2MarkerID",
            "LowStop",
            "HighStop",
            "StopCFM",
            "StopERP",
            "StopBounce",
            "LoStopTorqueLimit",
            "HiStopTorqueLimit",
            "StopTorqueWindow",
            "MotorTargetVelocity",
            "MotorMaxForce",
            "StressCalculationArea",
            "StressLimit",
            "StressLimitCutoffFrequency",
            "StressLimitWindow",
            "Dump",
        ],
        "GEOM" => &[
            "ID",
            "Type",
            "BodyID",
            "Position",
            "Quaternion",
            "Radius",
            "Height",
            "Size",
            "PlaneEquation",
            "Vertices",
            "TriangleIndices",
            "Mu",
            "Rho",
            "Bounce",
            "SoftCFM",
            "SoftERP",
            "Abort",
            "Adhesion",
            "ExcludeIDList",
            "ContactGroup",
            "Dump",
        ],
        "STRAP" => &[
            "ID",
            "Type",
            "OriginMarkerID",
            "InsertionMarkerID",
            "ViaPointMarkerIDList",
            "CylinderMarkerID",
            "CylinderRadius",
            "Cylinder1MarkerID",
            "Cylinder1Radius",
            "Cylinder2MarkerID",
            "Cylinder2Radius",
            "WrapSegments",
            "Dump",
        ],
        "MUSCLE" => &[
            "ID",
            "Type",
            "StrapID",
            "ForcePerUnitArea",
            "VMaxFactor",
            "PCA",
            "FibreLength",
            "ActivationK",
            "Width",
            "TendonLength",
            "SerialStrainAtFmax",
            "SerialStrainRateAtFmax",
            "SerialStrainModel",
            "ParallelStrainAtFmax",
            "ParallelStrainRateAtFmax",
            "ParallelStrainModel",
            "ActivationKinetics",
            "FastTwitchProportion",
            "TActivationA",
            "TActivationB",
            "TDeactivationA",
            "TDeactivationB",
            "ActivationRate",
            "MinimumActivation",
            "Tolerance",
            "InitialFibreLength",
            "UnloadedLength",
            "SpringConstant",
            "Area",
            "Damping",
            "BreakingStrain",
            "Dump",
        ],
        "FLUIDSAC" => &[
            "ID",
            "Type",
            "MarkerIDList",
            "TriangleList",
            "AmountOfSubstance",
            "Temperature",
            "ExternalPressure",
            "GasConstant",
            "FluidVolume",
            "BulkModulus",
            "BulkModulusDamping",
            "StartingPressure",
            "Dump",
        ],
        "DRIVER" => &[
            "ID",
            "Type",
            "TargetIDList",
            "DriverRange",
            "LinearInterpolation",
            "Value",
            "Durations",
            "Values",
            "PhaseDelay",
            "CycleTime",
            "Delays",
            "Widths",
            "Heights",
            "MarkerID",
            "ReferenceMarkerID",
            "Axis",
            "Velocity",
            "RadiusA",
            "RadiusB",
            "Omega",
            "Phase",
            "OutputAxis",
            "Sigma",
            "GeomID",
            "InitialPhase",
            "TargetMarkerID",
            "EffectorMarkerID",
            "JointIDList",
            "Dump",
        ],
        "DATATARGET" => &[
            "ID",
            "Type",
            "TargetID",
            "DataType",
            "ReferenceMarkerID",
            "Marker1ID",
            "Marker2ID",
            "Comparison",
            "TargetTimes",
            "TargetValues",
            "Intercept",
            "Slope",
            "MatchType",
            "MatchPolicy",
            "AbortThreshold",
            "Dump",
        ],
        "CONTROLLER" => &[
            "ID",
            "Type",
            "Kp",
            "Ki",
            "Kd",
            "TargetIDList",
            "DriverRange",
            "MuscleID",
            "NominalLength",
            "Dump",
        ],
        "REPORTER" => &["ID", "Dump"],
        "WAREHOUSE" => &["ID", "BodyIDList", "Positions", "Dump"],
        _ => &[],
    }
}

/// Parses the whole document into attribute maps, rejecting unknown tags.
fn parse_elements(text: &str) -> Result<Vec<AttributeMap>, Vec<LoadError>> {
    let document = match roxmltree::Document::parse(text) {
        Ok(document) => document,
        Err(error) => return Err(vec![LoadError::Document(error.to_string())]),
    };
    let mut elements = Vec::new();
    let mut errors = Vec::new();
    for node in document.root_element().children() {
        if !node.is_element() {
            continue;
        }
        let tag = node.tag_name().name();
        if !KNOWN_TAGS.contains(&tag) {
            errors.push(LoadError::Document(format!("unknown tag <{tag}>")));
            continue;
        }
        let id = node.attribute("ID").unwrap_or("");
        if tag != "GLOBAL" && id.is_empty() {
            errors.push(LoadError::Document(format!("<{tag}> element without ID")));
            continue;
        }
        let mut map = AttributeMap::new(tag, id);
        let known = known_attributes(tag);
        for attribute in node.attributes() {
            if !known.contains(&attribute.name()) {
                warn!(
                    "{tag} ID=\"{id}\": ignoring unknown attribute {}",
                    attribute.name()
                );
                continue;
            }
            map.set(attribute.name(), attribute.value());
        }
        elements.push(map);
    }
    if errors.is_empty() {
        Ok(elements)
    } else {
        Err(errors)
    }
}

/// Validates that every name in `ids` exists in the simulation's muscles or
/// controllers (the drivable families).
fn check_drivable_targets(
    simulation: &Simulation,
    map: &AttributeMap,
    ids: &[String],
) -> Result<(), LoadError> {
    for id in ids {
        if !simulation.muscles.contains_key(id) && !simulation.controllers.contains_key(id) {
            return Err(map.unresolved("TargetIDList", id));
        }
    }
    Ok(())
}

fn check_markers(
    simulation: &Simulation,
    map: &AttributeMap,
    attribute: &str,
    ids: &[&str],
) -> Result<(), LoadError> {
    for id in ids {
        if !simulation.markers.contains_key(*id) {
            return Err(map.unresolved(attribute, id));
        }
    }
    Ok(())
}

/// Tries to create one element inside the simulation. An unresolved-reference
/// error keeps the element pending for a later pass.
fn create_element(simulation: &mut Simulation, map: &AttributeMap) -> Result<(), LoadError> {
    let id = map.id().to_string();
    match map.tag() {
        "BODY" => {
            let body = Body::from_attributes(
                map,
                &mut simulation.world,
                simulation.global.linear_damping,
                simulation.global.angular_damping,
            )?;
            simulation.bodies.insert(id, body);
        }
        "MARKER" => {
            let marker = Marker::from_attributes(map)?;
            if let Some(body) = marker.body() {
                if !simulation.bodies.contains_key(body) {
                    return Err(map.unresolved("BodyID", body));
                }
            }
            simulation.markers.insert(id, marker);
        }
        "JOINT" => {
            let joint = Joint::from_attributes(
                map,
                &simulation.markers,
                &simulation.bodies,
                &mut simulation.world,
            )?;
            simulation.joints.insert(id, joint);
        }
        "GEOM" => {
            let geom = Geom::from_attributes(map, &simulation.bodies, &mut simulation.world)?;
            simulation.geoms.insert(id, geom);
        }
        "STRAP" => {
            let strap = Strap::from_attributes(map)?;
            let marker_ids: Vec<String> =
                strap.marker_ids().iter().map(|s| s.to_string()).collect();
            let marker_refs: Vec<&str> = marker_ids.iter().map(String::as_str).collect();
            check_markers(simulation, map, "MarkerID", &marker_refs)?;
            simulation.straps.insert(id, strap);
        }
        "MUSCLE" => {
            let muscle = Muscle::from_attributes(map)?;
            if !simulation.straps.contains_key(muscle.strap_id()) {
                return Err(map.unresolved("StrapID", muscle.strap_id()));
            }
            simulation.muscles.insert(id, muscle);
        }
        "FLUIDSAC" => {
            let sac = FluidSac::from_attributes(map)?;
            let marker_ids: Vec<&str> = sac.marker_ids().iter().map(String::as_str).collect();
            check_markers(simulation, map, "MarkerIDList", &marker_ids)?;
            simulation.fluid_sacs.insert(id, sac);
        }
        "DRIVER" => {
            let driver = Driver::from_attributes(map)?;
            check_drivable_targets(simulation, map, driver.targets())?;
            match driver.kind() {
                DriverKind::MarkerPosition {
                    marker,
                    reference_marker,
                    ..
                } => {
                    let mut ids = vec![marker.as_str()];
                    if let Some(reference) = reference_marker {
                        ids.push(reference);
                    }
                    check_markers(simulation, map, "MarkerID", &ids)?;
                }
                DriverKind::MarkerEllipse {
                    reference_marker, ..
                } => {
                    check_markers(simulation, map, "ReferenceMarkerID", &[reference_marker])?;
                }
                DriverKind::Tegotae(tegotae) => {
                    if !simulation.geoms.contains_key(tegotae.geom_id()) {
                        return Err(map.unresolved("GeomID", tegotae.geom_id()));
                    }
                }
                DriverKind::HingeIk(ik) => {
                    check_markers(simulation, map, "MarkerID", &ik.marker_ids())?;
                    for joint in ik.joint_ids() {
                        if !simulation.joints.contains_key(joint) {
                            return Err(map.unresolved("JointIDList", joint));
                        }
                    }
                }
                _ => {}
            }
            simulation.drivers.insert(id, driver);
        }
        "CONTROLLER" => {
            let controller = Controller::from_attributes(map)?;
            check_drivable_targets(simulation, map, controller.targets())?;
            if let Some(muscle) = controller.muscle_id() {
                if !simulation.muscles.contains_key(muscle) {
                    return Err(map.unresolved("MuscleID", muscle));
                }
            }
            simulation.controllers.insert(id, controller);
        }
        "DATATARGET" => {
            let data_target = DataTarget::from_attributes(map)?;
            match data_target.kind() {
                DataTargetKind::Scalar {
                    target, channel, ..
                } => {
                    let global_channel = matches!(
                        channel,
                        ScalarChannel::Time
                            | ScalarChannel::MechanicalEnergy
                            | ScalarChannel::MetabolicEnergy
                    );
                    if !global_channel
                        && !simulation.bodies.contains_key(target)
                        && !simulation.markers.contains_key(target)
                        && !simulation.muscles.contains_key(target)
                        && !simulation.joints.contains_key(target)
                        && !simulation.geoms.contains_key(target)
                    {
                        return Err(map.unresolved("TargetID", target));
                    }
                }
                DataTargetKind::Vector { target, .. }
                | DataTargetKind::Quaternion { target, .. } => {
                    if !simulation.bodies.contains_key(target)
                        && !simulation.markers.contains_key(target)
                    {
                        return Err(map.unresolved("TargetID", target));
                    }
                }
                DataTargetKind::MarkerCompare {
                    marker1, marker2, ..
                } => {
                    check_markers(simulation, map, "MarkerID", &[marker1, marker2])?;
                }
            }
            simulation.data_targets.insert(id, data_target);
        }
        "WAREHOUSE" => {
            let warehouse = Warehouse::from_attributes(map)?;
            for body in warehouse.body_ids() {
                if !simulation.bodies.contains_key(body) {
                    return Err(map.unresolved("BodyIDList", body));
                }
            }
            simulation.warehouses.insert(id, warehouse);
        }
        "REPORTER" => {
            let reporter = Reporter::from_attributes(map)?;
            simulation.reporters.insert(id, reporter);
        }
        other => {
            return Err(map.invalid(format!("unhandled tag <{other}>")));
        }
    }
    Ok(())
}

/// Loads a model document into a ready-to-run simulation.
///
/// All problems found are returned together; dangling references are retried
/// until a full pass resolves nothing more.
pub fn load_model(text: &str) -> Result<Simulation, Vec<LoadError>> {
    let elements = parse_elements(text)?;

    let mut errors = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    for element in &elements {
        if !seen.insert((element.tag().to_string(), element.id().to_string())) {
            errors.push(LoadError::Document(format!(
                "duplicate {} ID=\"{}\"",
                element.tag(),
                element.id()
            )));
        }
    }

    let global_map = match elements.iter().find(|e| e.tag() == "GLOBAL") {
        Some(global_map) => global_map,
        None => {
            errors.push(LoadError::Document("missing GLOBAL element".to_string()));
            return Err(errors);
        }
    };
    let global = match Global::from_attributes(global_map) {
        Ok(global) => global,
        Err(error) => {
            errors.push(error);
            return Err(errors);
        }
    };
    let mut simulation = Simulation::new(global);

    // fixed point over unresolved elements
    let mut pending: Vec<&AttributeMap> =
        elements.iter().filter(|e| e.tag() != "GLOBAL").collect();
    loop {
        let mut still_pending = Vec::new();
        let mut progressed = false;
        for map in pending {
            match create_element(&mut simulation, map) {
                Ok(()) => progressed = true,
                Err(error) if error.is_unresolved() => still_pending.push(map),
                Err(error) => {
                    errors.push(error);
                    progressed = true; // a hard failure is not retried
                }
            }
        }
        pending = still_pending;
        if pending.is_empty() || !progressed {
            break;
        }
    }
    for map in pending {
        // report the precise dangling reference for each unresolved element
        if let Err(error) = create_element(&mut simulation, map) {
            errors.push(error);
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    if let Err(error) = simulation.late_initialisation() {
        return Err(vec![error]);
    }
    Ok(simulation)
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn write_element(out: &mut String, map: &AttributeMap) {
    out.push('<');
    out.push_str(map.tag());
    if !map.id().is_empty() {
        out.push_str(&format!(" ID=\"{}\"", escape(map.id())));
    }
    for (name, value) in map.iter() {
        if name == "ID" {
            continue;
        }
        out.push_str(&format!(" {}=\"{}\"", name, escape(value)));
    }
    out.push_str("/>\n");
}

/// Serialises the simulation's current state in the model-file schema, so the
/// result reloads as an initial state.
pub fn save_model(simulation: &Simulation) -> String {
    let mut out = String::from("<GAITSYM>\n");
    write_element(&mut out, &simulation.global.to_attributes());

    let sorted = |mut maps: Vec<AttributeMap>| -> Vec<AttributeMap> {
        maps.sort_by(|a, b| a.id().cmp(b.id()));
        maps
    };

    for map in sorted(
        simulation
            .bodies
            .values()
            .map(|b| b.to_attributes(&simulation.world))
            .collect(),
    ) {
        write_element(&mut out, &map);
    }
    for map in sorted(simulation.markers.values().map(Marker::to_attributes).collect()) {
        write_element(&mut out, &map);
    }
    for map in sorted(simulation.joints.values().map(Joint::to_attributes).collect()) {
        write_element(&mut out, &map);
    }
    for map in sorted(simulation.geoms.values().map(Geom::to_attributes).collect()) {
        write_element(&mut out, &map);
    }
    for map in sorted(simulation.straps.values().map(Strap::to_attributes).collect()) {
        write_element(&mut out, &map);
    }
    for map in sorted(simulation.muscles.values().map(Muscle::to_attributes).collect()) {
        write_element(&mut out, &map);
    }
    for map in sorted(
        simulation
            .fluid_sacs
            .values()
            .map(FluidSac::to_attributes)
            .collect(),
    ) {
        write_element(&mut out, &map);
    }
    for map in sorted(simulation.drivers.values().map(Driver::to_attributes).collect()) {
        write_element(&mut out, &map);
    }
    for map in sorted(
        simulation
            .controllers
            .values()
            .map(Controller::to_attributes)
            .collect(),
    ) {
        write_element(&mut out, &map);
    }
    for map in sorted(
        simulation
            .data_targets
            .values()
            .map(DataTarget::to_attributes)
            .collect(),
    ) {
        write_element(&mut out, &map);
    }
    for map in sorted(
        simulation
            .warehouses
            .values()
            .map(Warehouse::to_attributes)
            .collect(),
    ) {
        write_element(&mut out, &map);
    }
    for map in sorted(
        simulation
            .reporters
            .values()
            .map(Reporter::to_attributes)
            .collect(),
    ) {
        write_element(&mut out, &map);
    }
    out.push_str("</GAITSYM>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn global_attributes(step_size: f64, time_limit: f64, gravity: &str) -> String {
        format!(
            "<GLOBAL Gravity=\"{gravity}\" StepSize=\"{step_size}\" ERP=\"0.2\" CFM=\"1e-10\" \
             ContactMaxCorrectingVel=\"100\" ContactSurfaceLayer=\"0.001\" \
             LinearDamping=\"0\" AngularDamping=\"0\" IntegrationStepType=\"World\" \
             FitnessType=\"KinematicMatch\" BMR=\"0\" TimeLimit=\"{time_limit}\" \
             MechanicalEnergyLimit=\"0\" MetabolicEnergyLimit=\"0\" \
             PermittedNumericalErrors=\"0\" NumericalErrorsScore=\"0\"/>"
        )
    }

    fn falling_body_model() -> String {
        format!(
            "<GAITSYM>\n{}\n\
             <BODY ID=\"ball\" Mass=\"1\" MOI=\"1 1 1 0 0 0\" \
              ConstructionPosition=\"0 0 10\"/>\n\
             </GAITSYM>",
            global_attributes(0.001, 1.0, "0 0 -9.81")
        )
    }

    fn run_until(simulation: &mut Simulation, time: f64) {
        let h = simulation.global().settings.step_size;
        while simulation.time() < time - h / 2.0 {
            simulation.step();
            assert!(simulation.abort_reason().is_none(), "unexpected abort");
        }
    }

    #[test]
    fn falling_body_tracks_gravity() {
        let mut simulation = load_model(&falling_body_model()).unwrap();
        let outcome = simulation.run();
        assert_eq!(outcome, crate::simulation::RunOutcome::Completed);
        let body = &simulation.bodies["ball"];
        let z = body.pose(simulation.world()).translation.vector.z;
        // analytic 10 - g/2 = 5.095, first-order integration within 1e-2
        assert_relative_eq!(z, 5.095, epsilon = 1e-2);
        let vz = body.linear_velocity(simulation.world()).z;
        assert_relative_eq!(vz, -9.81, epsilon = 1e-6);
    }

    #[test]
    fn pendulum_period_matches_analytic() {
        // hinge at the origin about +Y, bob of point-like inertia at distance
        // 1; small initial angle so the simple-pendulum period applies
        let theta0: f64 = 0.1;
        let x0 = theta0.sin();
        let z0 = -theta0.cos();
        let quarter = std::f64::consts::FRAC_1_SQRT_2;
        let model = format!(
            "<GAITSYM>\n{}\n\
             <BODY ID=\"bob\" Mass=\"1\" MOI=\"1e-6 1e-6 1e-6 0 0 0\" \
              ConstructionPosition=\"{x0} 0 {z0}\"/>\n\
             <MARKER ID=\"world_anchor\" BodyID=\"\" Position=\"0 0 0\" \
              Quaternion=\"{quarter} 0 0 {quarter}\"/>\n\
             <MARKER ID=\"bob_anchor\" BodyID=\"bob\" Position=\"{} 0 {}\" \
              Quaternion=\"{quarter} 0 0 {quarter}\"/>\n\
             <JOINT ID=\"pivot\" Type=\"Hinge\" Body1MarkerID=\"world_anchor\" \
              Body2MarkerID=\"bob_anchor\"/>\n\
             </GAITSYM>",
            global_attributes(0.001, 3.0, "0 0 -9.81"),
            -x0,
            -z0,
        );
        let mut simulation = load_model(&model).unwrap();

        // detect the period from successive stationary points of the swing
        let mut previous_theta = theta0;
        let mut previous_rate: f64 = 0.0;
        let mut crossings = Vec::new();
        for _ in 0..2500 {
            simulation.step();
            assert!(simulation.abort_reason().is_none());
            let p = simulation.bodies["bob"]
                .pose(simulation.world())
                .translation
                .vector;
            let theta = p.x.atan2(-p.z);
            let rate = theta - previous_theta;
            if previous_rate != 0.0 && rate.signum() != previous_rate.signum() {
                crossings.push(simulation.time());
            }
            previous_theta = theta;
            if rate != 0.0 {
                previous_rate = rate;
            }
            if crossings.len() >= 2 {
                break;
            }
        }
        assert!(crossings.len() >= 2, "pendulum never completed a swing");
        let period = crossings[1]; // second stationary point sits at one period
        let analytic = 2.0 * std::f64::consts::PI * (1.0_f64 / 9.81).sqrt();
        assert_relative_eq!(period, analytic, max_relative = 0.015);
    }

    #[test]
    fn cyclic_driver_delivers_exact_values() {
        let model = format!(
            "<GAITSYM>\n{}\n\
             <BODY ID=\"a\" Mass=\"1\" MOI=\"1 1 1 0 0 0\" ConstructionPosition=\"0 0 0\"/>\n\
             <BODY ID=\"b\" Mass=\"1\" MOI=\"1 1 1 0 0 0\" ConstructionPosition=\"2 0 0\"/>\n\
             <MARKER ID=\"origin\" BodyID=\"a\" Position=\"0 0 0\"/>\n\
             <MARKER ID=\"insertion\" BodyID=\"b\" Position=\"0 0 0\"/>\n\
             <STRAP ID=\"line\" Type=\"TwoPoint\" OriginMarkerID=\"origin\" \
              InsertionMarkerID=\"insertion\"/>\n\
             <MUSCLE ID=\"spring\" Type=\"DampedSpring\" StrapID=\"line\" \
              UnloadedLength=\"1\" SpringConstant=\"100\" Area=\"0.01\" Damping=\"0\" \
              BreakingStrain=\"-1\"/>\n\
             <DRIVER ID=\"clock\" Type=\"Cyclic\" TargetIDList=\"spring\" \
              Durations=\"0.25 0.25 0.25 0.25\" Values=\"0 1 0 1\" DriverRange=\"0 1\"/>\n\
             </GAITSYM>",
            global_attributes(0.001, 2.0, "0 0 0")
        );
        let mut simulation = load_model(&model).unwrap();
        run_until(&mut simulation, 0.301);
        assert_eq!(simulation.muscles["spring"].activation(), 1.0);
        run_until(&mut simulation, 0.501);
        assert_eq!(simulation.muscles["spring"].activation(), 0.0);
    }

    #[test]
    fn body_quaternions_stay_unit_norm() {
        let mut simulation = load_model(&falling_body_model()).unwrap();
        for _ in 0..200 {
            simulation.step();
            for body in simulation.bodies.values() {
                let q = body.pose(simulation.world()).rotation;
                assert!((q.norm() - 1.0).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn coincident_hinge_stops_pin_the_axis() {
        // stops at lo == hi == 0 must hold the pendulum against gravity
        let quarter = std::f64::consts::FRAC_1_SQRT_2;
        let model = format!(
            "<GAITSYM>\n{}\n\
             <BODY ID=\"bob\" Mass=\"1\" MOI=\"1e-3 1e-3 1e-3 0 0 0\" \
              ConstructionPosition=\"1 0 0\"/>\n\
             <MARKER ID=\"world_anchor\" BodyID=\"\" Position=\"0 0 0\" \
              Quaternion=\"{quarter} 0 0 {quarter}\"/>\n\
             <MARKER ID=\"bob_anchor\" BodyID=\"bob\" Position=\"-1 0 0\" \
              Quaternion=\"{quarter} 0 0 {quarter}\"/>\n\
             <JOINT ID=\"pivot\" Type=\"Hinge\" Body1MarkerID=\"world_anchor\" \
              Body2MarkerID=\"bob_anchor\" LowStop=\"0\" HighStop=\"0\"/>\n\
             </GAITSYM>",
            global_attributes(0.001, 0.5, "0 0 -9.81")
        );
        let mut simulation = load_model(&model).unwrap();
        let outcome = simulation.run();
        assert_eq!(outcome, crate::simulation::RunOutcome::Completed);
        let angle = simulation.joints["pivot"].angle().unwrap();
        assert!(angle.abs() < 0.02, "hinge drifted to {angle}");
    }

    #[test]
    fn controller_closes_the_loop_within_one_step() {
        // fixed driver -> PID controller -> muscle, all in the same step
        let model = format!(
            "<GAITSYM>\n{}\n\
             <BODY ID=\"a\" Mass=\"1\" MOI=\"1 1 1 0 0 0\" ConstructionPosition=\"0 0 0\"/>\n\
             <BODY ID=\"b\" Mass=\"1\" MOI=\"1 1 1 0 0 0\" ConstructionPosition=\"2 0 0\"/>\n\
             <MARKER ID=\"origin\" BodyID=\"a\" Position=\"0 0 0\"/>\n\
             <MARKER ID=\"insertion\" BodyID=\"b\" Position=\"0 0 0\"/>\n\
             <STRAP ID=\"line\" Type=\"TwoPoint\" OriginMarkerID=\"origin\" \
              InsertionMarkerID=\"insertion\"/>\n\
             <MUSCLE ID=\"spring\" Type=\"DampedSpring\" StrapID=\"line\" \
              UnloadedLength=\"1\" SpringConstant=\"100\" Area=\"0.01\" Damping=\"0\" \
              BreakingStrain=\"-1\"/>\n\
             <CONTROLLER ID=\"pid\" Type=\"PIDErrorIn\" TargetIDList=\"spring\" \
              Kp=\"2\" Ki=\"0\" Kd=\"0\" DriverRange=\"0 1\"/>\n\
             <DRIVER ID=\"setpoint\" Type=\"Fixed\" TargetIDList=\"pid\" Value=\"0.5\"/>\n\
             </GAITSYM>",
            global_attributes(0.001, 1.0, "0 0 0")
        );
        let mut simulation = load_model(&model).unwrap();
        simulation.step();
        // Kp * 0.5 = 1.0, published downstream and consumed the same step
        assert_eq!(simulation.muscles["spring"].activation(), 1.0);
    }

    #[test]
    fn zero_step_size_advances_stamps_only() {
        let model = format!(
            "<GAITSYM>\n{}\n\
             <BODY ID=\"ball\" Mass=\"1\" MOI=\"1 1 1 0 0 0\" \
              ConstructionPosition=\"0 0 10\"/>\n\
             </GAITSYM>",
            global_attributes(0.0, 0.0, "0 0 -9.81")
        );
        let mut simulation = load_model(&model).unwrap();
        simulation.step();
        assert_eq!(simulation.step_count(), 1);
        let z = simulation.bodies["ball"]
            .pose(simulation.world())
            .translation
            .vector
            .z;
        assert_relative_eq!(z, 10.0);
        assert_relative_eq!(
            simulation.bodies["ball"]
                .linear_velocity(simulation.world())
                .norm(),
            0.0
        );
    }

    #[test]
    fn save_then_load_reproduces_state() {
        let mut simulation = load_model(&falling_body_model()).unwrap();
        for _ in 0..100 {
            simulation.step();
        }
        let saved = save_model(&simulation);
        let reloaded = load_model(&saved).unwrap();
        let z_original = simulation.bodies["ball"]
            .pose(simulation.world())
            .translation
            .vector
            .z;
        let z_reloaded = reloaded.bodies["ball"]
            .pose(reloaded.world())
            .translation
            .vector
            .z;
        assert_eq!(z_original, z_reloaded);
        let v_original = simulation.bodies["ball"].linear_velocity(simulation.world());
        let v_reloaded = reloaded.bodies["ball"].linear_velocity(reloaded.world());
        assert_eq!(v_original.z, v_reloaded.z);
    }

    #[test]
    fn forward_references_resolve() {
        // muscle precedes its strap, strap precedes its markers
        let model = format!(
            "<GAITSYM>\n{}\n\
             <MUSCLE ID=\"spring\" Type=\"DampedSpring\" StrapID=\"line\" \
              UnloadedLength=\"1\" SpringConstant=\"100\" Area=\"0.01\" Damping=\"0\" \
              BreakingStrain=\"-1\"/>\n\
             <STRAP ID=\"line\" Type=\"TwoPoint\" OriginMarkerID=\"origin\" \
              InsertionMarkerID=\"insertion\"/>\n\
             <MARKER ID=\"origin\" BodyID=\"a\" Position=\"0 0 0\"/>\n\
             <MARKER ID=\"insertion\" BodyID=\"b\" Position=\"0 0 0\"/>\n\
             <BODY ID=\"a\" Mass=\"1\" MOI=\"1 1 1 0 0 0\" ConstructionPosition=\"0 0 0\"/>\n\
             <BODY ID=\"b\" Mass=\"1\" MOI=\"1 1 1 0 0 0\" ConstructionPosition=\"2 0 0\"/>\n\
             </GAITSYM>",
            global_attributes(0.001, 1.0, "0 0 0")
        );
        assert!(load_model(&model).is_ok());
    }

    #[test]
    fn dangling_reference_is_reported_precisely() {
        let model = format!(
            "<GAITSYM>\n{}\n\
             <MARKER ID=\"m\" BodyID=\"nowhere\" Position=\"0 0 0\"/>\n\
             </GAITSYM>",
            global_attributes(0.001, 1.0, "0 0 0")
        );
        let errors = load_model(&model).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("nowhere")));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let model = format!(
            "<GAITSYM>\n{}\n<SPACESHIP ID=\"x\"/>\n</GAITSYM>",
            global_attributes(0.001, 1.0, "0 0 0")
        );
        assert!(load_model(&model).is_err());
    }

    #[test]
    fn load_failures_aggregate() {
        let model = format!(
            "<GAITSYM>\n{}\n\
             <BODY ID=\"bad\" Mass=\"-1\" MOI=\"1 1 1 0 0 0\" \
              ConstructionPosition=\"0 0 0\"/>\n\
             <MARKER ID=\"m\" BodyID=\"nowhere\" Position=\"0 0 0\"/>\n\
             </GAITSYM>",
            global_attributes(0.001, 1.0, "0 0 0")
        );
        let errors = load_model(&model).unwrap_err();
        assert!(errors.len() >= 2);
    }

    #[test]
    fn data_target_scores_against_trajectory() {
        let model = format!(
            "<GAITSYM>\n{}\n\
             <BODY ID=\"ball\" Mass=\"1\" MOI=\"1 1 1 0 0 0\" \
              ConstructionPosition=\"0 0 10\"/>\n\
             <DATATARGET ID=\"hold_z\" Type=\"Scalar\" TargetID=\"ball\" DataType=\"ZP\" \
              TargetTimes=\"0.05\" TargetValues=\"10\" Intercept=\"1\" Slope=\"-1\" \
              MatchType=\"Linear\"/>\n\
             </GAITSYM>",
            global_attributes(0.001, 0.1, "0 0 0")
        );
        let mut simulation = load_model(&model).unwrap();
        let outcome = simulation.run();
        assert_eq!(outcome, crate::simulation::RunOutcome::Completed);
        // no gravity: the ball holds position and the single match scores 1
        assert_relative_eq!(simulation.fitness(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn data_target_abort_names_the_target() {
        let model = format!(
            "<GAITSYM>\n{}\n\
             <BODY ID=\"ball\" Mass=\"1\" MOI=\"1 1 1 0 0 0\" \
              ConstructionPosition=\"0 0 10\"/>\n\
             <DATATARGET ID=\"impossible\" Type=\"Scalar\" TargetID=\"ball\" DataType=\"ZP\" \
              TargetTimes=\"0.05\" TargetValues=\"0\" Intercept=\"0\" Slope=\"-1\" \
              MatchType=\"Linear\" AbortThreshold=\"1\"/>\n\
             </GAITSYM>",
            global_attributes(0.001, 0.2, "0 0 0")
        );
        let mut simulation = load_model(&model).unwrap();
        let outcome = simulation.run();
        match outcome {
            crate::simulation::RunOutcome::Aborted(reason) => {
                assert!(reason.contains("impossible"));
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }
}
