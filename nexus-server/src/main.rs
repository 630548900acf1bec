#[macro_use]
extern crate tracing;

use anyhow::Context as _;
use nexus_server::config::{Conf, ConfHandle};
use nexus_server::service::NexusService;
use tap::prelude::*;

fn main() -> anyhow::Result<()> {
    let conf = Conf::from_args(std::env::args().skip(1)).context("invalid arguments")?;
    let conf_handle = ConfHandle::new(conf);

    let mut service = NexusService::load(conf_handle).context("service loading failed")?;

    service
        .start()
        .tap_err(|error| error!(error = format!("{error:#}"), "failed to start"))?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to build the async runtime")?;
    rt.block_on(build_signals_fut())?;

    service.stop();

    Ok(())
}

#[cfg(unix)]
async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut quit_signal = signal(SignalKind::quit()).context("failed to create quit signal stream failed")?;
    let mut interrupt_signal =
        signal(SignalKind::interrupt()).context("failed to create interrupt signal stream failed")?;

    futures::future::select_all(vec![
        Box::pin(terminate_signal.recv()),
        Box::pin(quit_signal.recv()),
        Box::pin(interrupt_signal.recv()),
    ])
    .await;

    Ok(())
}

#[cfg(not(unix))]
async fn build_signals_fut() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("CTRL_C signal failed")
}
