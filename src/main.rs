//! Command-line entry point: load a model, run it to termination, report the
//! fitness scalar.
//!
//! Exit codes: 0 normal termination, 1 abort by predicate, 2 model load
//! failure, 3 I/O error.

use std::path::PathBuf;
use std::process::ExitCode;

use gaitsym::loader;
use gaitsym::simulation::RunOutcome;

struct Options {
    config: PathBuf,
    output_state: Option<PathBuf>,
    output_state_at_time: Option<f64>,
    output_state_at_cycle: Option<i64>,
    dump_directory: Option<PathBuf>,
    abort_after_state: bool,
}

fn usage() -> &'static str {
    "usage: gaitsym --config MODEL.xml [--output-state STATE.xml] \
     [--output-state-at-time T] [--output-state-at-cycle N] [--dump DIR] \
     [--abort-after-state]"
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let mut config = None;
    let mut output_state = None;
    let mut output_state_at_time = None;
    let mut output_state_at_cycle = None;
    let mut dump_directory = None;
    let mut abort_after_state = false;

    let mut index = 0;
    while index < args.len() {
        let arg = args[index].as_str();
        let value = |index: usize| -> Result<&String, String> {
            args.get(index + 1)
                .ok_or_else(|| format!("{arg} needs a value"))
        };
        match arg {
            "--config" => {
                config = Some(PathBuf::from(value(index)?));
                index += 2;
            }
            "--output-state" => {
                output_state = Some(PathBuf::from(value(index)?));
                index += 2;
            }
            "--output-state-at-time" => {
                output_state_at_time = Some(
                    value(index)?
                        .parse::<f64>()
                        .map_err(|_| "--output-state-at-time needs a number".to_string())?,
                );
                index += 2;
            }
            "--output-state-at-cycle" => {
                output_state_at_cycle = Some(
                    value(index)?
                        .parse::<i64>()
                        .map_err(|_| "--output-state-at-cycle needs an integer".to_string())?,
                );
                index += 2;
            }
            "--dump" => {
                dump_directory = Some(PathBuf::from(value(index)?));
                index += 2;
            }
            "--abort-after-state" => {
                abort_after_state = true;
                index += 1;
            }
            other => return Err(format!("unknown argument {other}\n{}", usage())),
        }
    }
    Ok(Options {
        config: config.ok_or_else(|| format!("--config is required\n{}", usage()))?,
        output_state,
        output_state_at_time,
        output_state_at_cycle,
        dump_directory,
        abort_after_state,
    })
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match parse_options(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };

    let text = match std::fs::read_to_string(&options.config) {
        Ok(text) => text,
        Err(error) => {
            eprintln!("cannot read {}: {error}", options.config.display());
            return ExitCode::from(3);
        }
    };

    let mut simulation = match loader::load_model(&text) {
        Ok(simulation) => simulation,
        Err(errors) => {
            for error in &errors {
                eprintln!("{error}");
            }
            eprintln!("{} load error(s)", errors.len());
            return ExitCode::from(2);
        }
    };

    if let Some(directory) = options.dump_directory {
        if let Err(error) = std::fs::create_dir_all(&directory) {
            eprintln!("cannot create {}: {error}", directory.display());
            return ExitCode::from(3);
        }
        simulation.set_dump_directory(directory);
    }
    if let Some(path) = options.output_state {
        simulation.set_output_state_file(path);
    }
    if let Some(time) = options.output_state_at_time {
        simulation.set_output_state_at_time(time);
    }
    if let Some(cycle) = options.output_state_at_cycle {
        simulation.set_output_state_at_cycle(cycle);
    }
    simulation.set_abort_after_state(options.abort_after_state);

    let outcome = simulation.run();
    println!("{}", simulation.fitness());
    eprintln!(
        "t={} steps={} mechanical={} metabolic={} distance={}",
        simulation.time(),
        simulation.step_count(),
        simulation.mechanical_energy(),
        simulation.metabolic_energy(),
        simulation.distance_travelled(),
    );

    match outcome {
        RunOutcome::Completed => ExitCode::SUCCESS,
        RunOutcome::Aborted(reason) => {
            eprintln!("aborted: {reason}");
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn config_is_required() {
        assert!(parse_options(&strings(&[])).is_err());
    }

    #[test]
    fn all_flags_parse() {
        let options = parse_options(&strings(&[
            "--config",
            "model.xml",
            "--output-state",
            "state.xml",
            "--output-state-at-time",
            "1.5",
            "--dump",
            "out",
            "--abort-after-state",
        ]))
        .unwrap();
        assert_eq!(options.config, PathBuf::from("model.xml"));
        assert_eq!(options.output_state, Some(PathBuf::from("state.xml")));
        assert_eq!(options.output_state_at_time, Some(1.5));
        assert_eq!(options.dump_directory, Some(PathBuf::from("out")));
        assert!(options.abort_after_state);
    }

    #[test]
    fn unknown_flag_is_an_error() {
        assert!(parse_options(&strings(&["--frobnicate"])).is_err());
    }
}
