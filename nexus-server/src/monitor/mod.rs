//! Periodic resource sampling for the run, averaged over a window of ticks
//! and emitted as plain `Stats` records through the front of the pipeline.

mod cpu;
mod disk;
mod gpu;
mod memory;

use std::collections::HashMap;

use sysinfo::{Disks, System};
use tokio::sync::{mpsc, oneshot};

use crate::proto::{Control, Record, RecordKind, StatsItem, StatsRecord};
use crate::settings::Settings;

pub struct Sample {
    pub key: String,
    pub value: f64,
}

pub struct MetricsMonitor {
    cancel: Option<oneshot::Sender<()>>,
    join: tokio::task::JoinHandle<()>,
}

impl MetricsMonitor {
    pub fn spawn(record_in_tx: mpsc::Sender<Record>, settings: Settings) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let join = tokio::spawn(run(record_in_tx, settings, cancel_rx));
        Self {
            cancel: Some(cancel_tx),
            join,
        }
    }

    pub async fn close(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        let _ = self.join.await;
    }
}

async fn run(record_in_tx: mpsc::Sender<Record>, settings: Settings, mut cancel: oneshot::Receiver<()>) {
    let sample_rate = std::time::Duration::from_secs_f64(settings.stats_sample_rate_seconds.max(1.0));
    let samples_to_average = settings.stats_samples_to_average.max(1);

    let mut system = System::new_all();
    let Some(pid) = sysinfo::get_current_pid().ok() else {
        error!("failed to resolve own pid; system monitor disabled for this run");
        return;
    };

    let mut interval = tokio::time::interval(sample_rate);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut buffers: HashMap<String, Vec<f64>> = HashMap::new();
    let mut ticks = 0u32;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                system.refresh_cpu_usage();
                system.refresh_memory();
                system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), false);
                let disks = Disks::new_with_refreshed_list();

                for sample in memory::sample(&system, pid)
                    .into_iter()
                    .chain(disk::sample(&disks))
                    .chain(cpu::sample(&system))
                    .chain(gpu::sample())
                {
                    buffers.entry(sample.key).or_default().push(sample.value);
                }
                ticks += 1;

                if ticks >= samples_to_average {
                    emit(&record_in_tx, &mut buffers).await;
                    ticks = 0;
                }
            }
            _ = &mut cancel => break,
        }
    }

    if !buffers.is_empty() {
        emit(&record_in_tx, &mut buffers).await;
    }
}

async fn emit(record_in_tx: &mpsc::Sender<Record>, buffers: &mut HashMap<String, Vec<f64>>) {
    let items = buffers
        .drain()
        .filter(|(_, values)| !values.is_empty())
        .map(|(key, values)| StatsItem {
            key,
            value_json: (values.iter().sum::<f64>() / values.len() as f64).to_string(),
        })
        .collect();

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

    let record = Record {
        control: Control::default(),
        kind: RecordKind::Stats(StatsRecord {
            items,
            timestamp_seconds: now.as_secs() as f64,
            timestamp_nanos: now.subsec_nanos(),
        }),
    };

    if record_in_tx.send(record).await.is_err() {
        warn!("handler channel closed while system monitor still sampling");
    }
}
