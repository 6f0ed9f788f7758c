//! Server side of a tunnel
//!
//! After the agent answers a connect request, the broker starts a worker
//! that dials the target from inside the network namespace and calls back
//! over a single-use Unix socket. The upgraded client connection and that
//! socket are then spliced together.

use crate::error::{Error, Result};
use crate::names::NameGenerator;
use crate::network::types::Network;
use crate::tunnel::relay::{self, RelayStats};
use crate::tunnel::session::TunnelSession;
use std::fs;
use std::net::SocketAddrV4;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Command;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Hidden subcommand the worker process runs
pub const WORKER_COMMAND: &str = "netns-pipe-socket";

/// What a worker needs to know
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub ns_path: PathBuf,
    pub target: SocketAddrV4,
    pub rendezvous: PathBuf,
}

/// Starts workers; the handle resolves when the worker is done
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, args: &WorkerArgs) -> Result<JoinHandle<Result<()>>>;
}

/// Launches workers by re-executing the agent binary
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    exe: PathBuf,
}

impl ProcessLauncher {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    /// Launcher for the running executable
    pub fn current() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, args: &WorkerArgs) -> Result<JoinHandle<Result<()>>> {
        let mut child = Command::new(&self.exe)
            .arg(WORKER_COMMAND)
            .arg(&args.ns_path)
            .arg(args.target.ip().to_string())
            .arg(args.target.port().to_string())
            .arg(&args.rendezvous)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tunnel(format!("failed to launch worker: {}", e)))?;

        debug!(pid = ?child.id(), target = %args.target, "launched worker");

        Ok(tokio::spawn(async move {
            let status = child.wait().await?;
            if status.success() {
                Ok(())
            } else {
                Err(Error::CommandFailed {
                    command: WORKER_COMMAND.to_string(),
                    message: format!("exited with {}", status),
                })
            }
        }))
    }
}

/// Single-use Unix socket, removed from disk when dropped
#[derive(Debug)]
pub struct Rendezvous {
    path: PathBuf,
    listener: UnixListener,
}

impl Rendezvous {
    pub fn bind(path: PathBuf) -> Result<Self> {
        let listener = UnixListener::bind(&path).map_err(|e| {
            Error::Tunnel(format!("failed to listen on {}: {}", path.display(), e))
        })?;
        let rendezvous = Self { path, listener };
        fs::set_permissions(&rendezvous.path, fs::Permissions::from_mode(0o600))?;
        Ok(rendezvous)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// A negotiated tunnel whose rendezvous is ready
#[derive(Debug)]
pub struct PendingTunnel {
    session: TunnelSession,
    rendezvous: Rendezvous,
    ns_path: PathBuf,
}

impl PendingTunnel {
    pub fn session(&self) -> &TunnelSession {
        &self.session
    }
}

pub struct TunnelBroker {
    runtime_dir: PathBuf,
    names: Arc<NameGenerator>,
    launcher: Arc<dyn WorkerLauncher>,
}

fn worker_exit(exited: std::result::Result<Result<()>, JoinError>) -> Error {
    match exited {
        Ok(Ok(())) => Error::Tunnel("worker exited before connecting".into()),
        Ok(Err(e)) => e,
        Err(e) => Error::Join(e),
    }
}

impl TunnelBroker {
    pub fn new(
        runtime_dir: impl Into<PathBuf>,
        names: Arc<NameGenerator>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            names,
            launcher,
        }
    }

    /// Prepare a tunnel into `network`
    ///
    /// Everything that can fail before the client is told about success
    /// happens here.
    pub fn prepare(&self, network: &Network, target: SocketAddrV4) -> Result<PendingTunnel> {
        if !network.is_provisioned() {
            return Err(Error::Namespace {
                network: network.id.clone(),
                message: "network has no namespace yet".into(),
            });
        }

        fs::create_dir_all(&self.runtime_dir)?;
        let rendezvous = Rendezvous::bind(self.names.rendezvous_path(&self.runtime_dir))?;
        let session = TunnelSession::new(self.names.id(), &network.id, target);

        debug!(session = session.id(), rendezvous = %rendezvous.path().display(), "tunnel negotiated");
        Ok(PendingTunnel {
            session,
            rendezvous,
            ns_path: PathBuf::from(&network.ns_handle_path),
        })
    }

    /// Bridge `client` to the target until both directions are done
    pub async fn run<S>(&self, pending: PendingTunnel, client: S) -> Result<RelayStats>
    where
        S: AsyncRead + AsyncWrite,
    {
        let PendingTunnel {
            mut session,
            rendezvous,
            ns_path,
        } = pending;

        let args = WorkerArgs {
            ns_path,
            target: session.target(),
            rendezvous: rendezvous.path().to_path_buf(),
        };
        let mut worker = match self.launcher.launch(&args) {
            Ok(worker) => worker,
            Err(e) => {
                session.close();
                return Err(e);
            }
        };

        let accepted = tokio::select! {
            conn = rendezvous.accept() => conn,
            exited = &mut worker => Err(worker_exit(exited)),
        };
        // Single use: nobody else may connect after this point
        drop(rendezvous);

        let upstream = match accepted {
            Ok(upstream) => upstream,
            Err(e) => {
                worker.abort();
                session.close();
                return Err(e);
            }
        };

        session.bridge()?;
        info!(
            session = session.id(),
            network_id = session.network_id(),
            target = %session.target(),
            "tunnel bridging"
        );

        let (relayed, exited) = tokio::join!(relay::splice(client, upstream), worker);
        session.close();

        match exited {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = session.id(), error = %e, "worker failed"),
            Err(e) => warn!(session = session.id(), error = %e, "worker task failed"),
        }

        let stats =
            relayed.map_err(|e| Error::Tunnel(format!("relay failed: {}", e)))?;
        info!(
            session = session.id(),
            sent = stats.forward,
            received = stats.backward,
            "tunnel closed"
        );
        Ok(stats)
    }
}
