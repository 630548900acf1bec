//! Per-core and aggregate CPU usage sampling.

use sysinfo::System;

use super::Sample;

pub fn sample(system: &System) -> Vec<Sample> {
    let cpus = system.cpus();
    if cpus.is_empty() {
        return Vec::new();
    }

    let average = cpus.iter().map(|cpu| cpu.cpu_usage() as f64).sum::<f64>() / cpus.len() as f64;
    let mut samples = vec![Sample {
        key: "cpu".to_owned(),
        value: average,
    }];

    for (index, cpu) in cpus.iter().enumerate() {
        samples.push(Sample {
            key: format!("cpu.{index}.cpu_percent"),
            value: cpu.cpu_usage() as f64,
        });
    }

    samples
}
