//! Dump streams and the reporter entity that records global channels.
//!
//! A stream opens its `<id>.tsv` lazily on first write, emits the header line
//! once, then appends one record per step in 17-significant-digit scientific
//! notation. An I/O failure disables that stream for the rest of the run.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;

use crate::attributes::{format_f64, AttributeMap, LoadError};

/// Lazily opened tab-separated dump file for one entity.
#[derive(Debug)]
pub struct DumpStream {
    path: PathBuf,
    file: Option<File>,
    failed: bool,
}

impl DumpStream {
    pub fn new(directory: &Path, id: &str) -> DumpStream {
        DumpStream {
            path: directory.join(format!("{id}.tsv")),
            file: None,
            failed: false,
        }
    }

    /// Appends one record, writing the header first on the initial call.
    pub fn write_record(&mut self, header: &str, line: &str) {
        if self.failed {
            return;
        }
        if self.file.is_none() {
            match File::create(&self.path) {
                Ok(mut file) => {
                    if let Err(error) = writeln!(file, "{header}") {
                        warn!("dump {}: {error}, dumping disabled", self.path.display());
                        self.failed = true;
                        return;
                    }
                    self.file = Some(file);
                }
                Err(error) => {
                    warn!("dump {}: {error}, dumping disabled", self.path.display());
                    self.failed = true;
                    return;
                }
            }
        }
        if let Some(file) = &mut self.file {
            if let Err(error) = writeln!(file, "{line}") {
                warn!("dump {}: {error}, dumping disabled", self.path.display());
                self.failed = true;
            }
        }
    }
}

/// Records the global channels (fitness accumulators and energy totals) on
/// the standard dump schedule.
#[derive(Debug)]
pub struct Reporter {
    name: String,
}

impl Reporter {
    pub fn from_attributes(attributes: &AttributeMap) -> Result<Reporter, LoadError> {
        Ok(Reporter {
            name: attributes.id().to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dump_header(&self) -> String {
        "Time\tFitness\tMechanicalEnergy\tMetabolicEnergy".to_string()
    }

    pub fn dump_line(
        &self,
        time: f64,
        fitness: f64,
        mechanical_energy: f64,
        metabolic_energy: f64,
    ) -> String {
        [time, fitness, mechanical_energy, metabolic_energy]
            .iter()
            .map(|x| format_f64(*x))
            .collect::<Vec<_>>()
            .join("\t")
    }

    pub fn to_attributes(&self) -> AttributeMap {
        AttributeMap::new("REPORTER", &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_writes_header_once() {
        let dir = std::env::temp_dir().join("gaitsym_dump_test");
        std::fs::create_dir_all(&dir).unwrap();
        let mut stream = DumpStream::new(&dir, "unit_test_entity");
        stream.write_record("Time\tValue", "0\t1");
        stream.write_record("Time\tValue", "1\t2");
        let contents =
            std::fs::read_to_string(dir.join("unit_test_entity.tsv")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["Time\tValue", "0\t1", "1\t2"]);
        std::fs::remove_file(dir.join("unit_test_entity.tsv")).unwrap();
    }
}
