//! Process and system memory sampling.

use sysinfo::{Pid, System};

use super::Sample;

pub fn sample(system: &System, pid: Pid) -> Vec<Sample> {
    let mut samples = vec![Sample {
        key: "proc.memory.availableMB".to_owned(),
        value: (system.available_memory() / (1024 * 1024)) as f64,
    }];

    if let Some(process) = system.process(pid) {
        samples.push(Sample {
            key: "proc.memory.rssMB".to_owned(),
            value: (process.memory() / (1024 * 1024)) as f64,
        });
        let total = system.total_memory();
        if total > 0 {
            samples.push(Sample {
                key: "proc.memory.percent".to_owned(),
                value: process.memory() as f64 / total as f64 * 100.0,
            });
        }
    }

    samples
}
