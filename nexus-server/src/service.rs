//! Process lifecycle: load configuration and logging, start the runtime
//! and its tasks, and drive a graceful shutdown on stop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use nexus_log::LoggerGuard;
use nexus_task::{ChildTask, ShutdownHandle, ShutdownSignal, Task, spawn_task};
use tokio::runtime::{self, Runtime};

use crate::NexusState;
use crate::config::ConfHandle;
use crate::log::{self, NexusLog};
use crate::server::Server;
use crate::stream_mux::StreamMux;

#[allow(clippy::large_enum_variant)]
enum ServiceState {
    Stopped,
    Running { shutdown_handle: ShutdownHandle, runtime: Runtime },
}

pub struct NexusService {
    conf_handle: ConfHandle,
    state: ServiceState,
    _logger_guard: LoggerGuard,
}

impl NexusService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let logger_guard = log::init(&conf.log_dir(), conf.debug).context("failed to set up logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        if conf.debug {
            warn!("**DEBUG OPTIONS ARE ENABLED, PLEASE DO NOT USE IN PRODUCTION**");
        }

        Ok(Self {
            conf_handle,
            state: ServiceState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("failed to create runtime");

        let conf_handle = self.conf_handle.clone();
        let tasks = runtime.block_on(spawn_tasks(conf_handle))?;

        let mut join_all = futures::future::select_all(tasks.inner.into_iter().map(|child| Box::pin(child.join())));

        runtime.spawn(async move {
            loop {
                let (result, _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!("a task terminated gracefully"),
                    Ok(Err(error)) => error!(error = format!("{error:#}"), "a task failed"),
                    Err(error) => error!(%error, "a task panicked"),
                }

                if rest.is_empty() {
                    break;
                } else {
                    join_all = futures::future::select_all(rest);
                }
            }
        });

        self.state = ServiceState::Running {
            shutdown_handle: tasks.shutdown_handle,
            runtime,
        };

        Ok(())
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, ServiceState::Stopped) {
            ServiceState::Stopped => {
                info!("attempted to stop nexus service, but it's already stopped");
            }
            ServiceState::Running { shutdown_handle, runtime } => {
                info!("stopping nexus service");

                shutdown_handle.signal();

                runtime.block_on(async move {
                    tokio::select! {
                        _ = shutdown_handle.all_closed() => {
                            debug!("all tasks closed gracefully");
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {
                            warn!("some tasks didn't terminate in time");
                        }
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(3));

                self.state = ServiceState::Stopped;
            }
        }
    }
}

struct Tasks {
    inner: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl Tasks {
    fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
        Self {
            inner: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: Task<Output = anyhow::Result<()>> + 'static,
    {
        let child = spawn_task(task, self.shutdown_signal.clone());
        self.inner.push(child);
    }
}

async fn spawn_tasks(conf_handle: ConfHandle) -> anyhow::Result<Tasks> {
    let mut tasks = Tasks::new();

    let state = NexusState {
        conf_handle: conf_handle.clone(),
        streams: Arc::new(StreamMux::new()),
        shutdown_signal: tasks.shutdown_signal.clone(),
        shutdown_handle: tasks.shutdown_handle.clone(),
    };

    let server = Server::bind(state).await.context("failed to bind server")?;
    tasks.register(server);

    tasks.register(nexus_log::LogDeleterTask::<NexusLog>::new(conf_handle.get_conf().log_dir()));

    Ok(tasks)
}
