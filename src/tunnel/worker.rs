//! Worker side of a tunnel
//!
//! Runs as a short-lived process. Only a helper thread joins the network
//! namespace, long enough to dial the target; the rendezvous dial and the
//! relay happen from the namespace the worker started in.

use crate::error::{Error, Result};
use crate::tunnel::broker::WorkerArgs;
use crate::tunnel::relay::{self, RelayStats};
use nix::sched::{CloneFlags, setns};
use std::fs::File;
use std::net::SocketAddrV4;
use std::path::Path;
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

/// Connect to `target` from inside the namespace at `ns_path`
pub fn dial_in_namespace(ns_path: &Path, target: SocketAddrV4) -> Result<std::net::TcpStream> {
    let netns = File::open(ns_path).map_err(|e| {
        Error::Tunnel(format!("failed to open namespace {}: {}", ns_path.display(), e))
    })?;

    std::thread::Builder::new()
        .name("netferry-dial".into())
        .spawn(move || -> Result<std::net::TcpStream> {
            setns(&netns, CloneFlags::CLONE_NEWNET)
                .map_err(|e| Error::Tunnel(format!("setns failed: {}", e)))?;
            std::net::TcpStream::connect(target)
                .map_err(|e| Error::Tunnel(format!("failed to dial {}: {}", target, e)))
        })?
        .join()
        .map_err(|_| Error::Tunnel("dial thread panicked".into()))?
}

/// Call back the broker and relay between it and an established target
pub async fn bridge_target(target: TcpStream, rendezvous: &Path) -> Result<RelayStats> {
    let upstream = UnixStream::connect(rendezvous).await.map_err(|e| {
        Error::Tunnel(format!(
            "failed to reach rendezvous {}: {}",
            rendezvous.display(),
            e
        ))
    })?;

    relay::splice(upstream, target)
        .await
        .map_err(|e| Error::Tunnel(format!("relay failed: {}", e)))
}

/// Full worker run: dial in the namespace, then bridge
pub async fn run(args: WorkerArgs) -> Result<RelayStats> {
    let ns_path = args.ns_path.clone();
    let target = args.target;
    let stream =
        tokio::task::spawn_blocking(move || dial_in_namespace(&ns_path, target)).await??;
    stream.set_nonblocking(true)?;
    let stream = TcpStream::from_std(stream)?;
    debug!(%target, "dialled target");

    bridge_target(stream, &args.rendezvous).await
}
