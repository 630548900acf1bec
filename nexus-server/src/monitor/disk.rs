//! Disk usage sampling: percent used across every mounted volume sysinfo
//! can see.

use sysinfo::Disks;

use super::Sample;

pub fn sample(disks: &Disks) -> Vec<Sample> {
    let (total, used) = disks
        .iter()
        .map(|disk| (disk.total_space(), disk.total_space() - disk.available_space()))
        .fold((0u64, 0u64), |(total_acc, used_acc), (total, used)| (total_acc + total, used_acc + used));

    if total == 0 {
        return Vec::new();
    }

    vec![Sample {
        key: "disk.usagePercent".to_owned(),
        value: used as f64 / total as f64 * 100.0,
    }]
}
