//! Binds the loopback listener clients connect to, advertises the chosen
//! port, and spawns one [`crate::connection::Connection`] per accepted
//! socket.

use std::net::SocketAddr;

use anyhow::Context as _;
use async_trait::async_trait;
use nexus_task::{ChildTask, ShutdownSignal, Task};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::NexusState;

pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
    state: NexusState,
}

impl Server {
    pub async fn bind(state: NexusState) -> anyhow::Result<Self> {
        let socket = TcpSocket::new_v4().context("failed to create TCP socket")?;
        socket
            .bind("127.0.0.1:0".parse().expect("valid loopback addr"))
            .context("failed to bind loopback socket")?;
        let listener = socket.listen(64).context("failed to listen on loopback socket")?;
        let addr = listener.local_addr().context("failed to read bound local address")?;

        info!(port = addr.port(), "listening for client connections");

        let conf = state.conf_handle.get_conf();
        crate::portfile::write(&conf.port_filename, addr.port()).context("failed to write port file")?;

        Ok(Self { listener, addr, state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let state = self.state.clone();
                    ChildTask::spawn(handle_peer(stream, state, peer_addr)).detach();
                }
                Err(error) => error!(%error, "failed to accept connection"),
            }
        }
    }
}

#[async_trait]
impl Task for Server {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "nexus server";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

async fn handle_peer(stream: TcpStream, state: NexusState, peer_addr: SocketAddr) {
    if let Err(error) = stream.set_nodelay(true) {
        warn!(%error, "set_nodelay failed on accepted stream");
    }

    if let Err(error) = crate::connection::Connection::new(stream, state, peer_addr).serve().await {
        error!(%error, %peer_addr, "connection failed");
    }
}
