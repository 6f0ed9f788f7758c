//! Caller side of a tunnel
//!
//! Asks the agent for a tunnel over HTTP/1.1, takes over the upgraded
//! connection, then exposes it on a local TCP listener and relays the first
//! connection that arrives.

use crate::error::{Error, Result};
use crate::server::ErrorBody;
use crate::tunnel::UPGRADE_PROTOCOL;
use crate::tunnel::relay::{self, RelayStats};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::upgrade::Upgraded;
use hyper::{Request, StatusCode, header};
use hyper_util::rt::TokioIo;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Raw byte stream to the target once the agent switched protocols
pub type TunnelStream = TokioIo<Upgraded>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub network_id: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Talks to one agent
#[derive(Debug, Clone)]
pub struct TunnelClient {
    agent: String,
}

impl TunnelClient {
    /// `agent` is a `host:port` address
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
        }
    }

    /// Open a raw stream to the target through the agent
    pub async fn request(&self, req: &TunnelRequest) -> Result<TunnelStream> {
        let stream = TcpStream::connect(&self.agent)
            .await
            .map_err(|e| Error::Tunnel(format!("failed to reach agent {}: {}", self.agent, e)))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::Tunnel(format!("handshake with {} failed: {}", self.agent, e)))?;
        // Hands the socket back to `upgrade::on` after a 101
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "agent connection ended");
            }
        });

        let request = Request::builder()
            .method("POST")
            .uri(format!(
                "/networks/{}/connect?ip={}&port={}",
                req.network_id, req.ip, req.port
            ))
            .header(header::HOST, self.agent.as_str())
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, UPGRADE_PROTOCOL)
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::InvalidRequest(format!("bad connect request: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::Tunnel(format!("connect request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::SWITCHING_PROTOCOLS {
            let upgraded = hyper::upgrade::on(response)
                .await
                .map_err(|e| Error::Tunnel(format!("upgrade failed: {}", e)))?;
            debug!(network_id = %req.network_id, ip = %req.ip, port = req.port, "tunnel accepted");
            return Ok(TokioIo::new(upgraded));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Tunnel(format!("failed to read agent answer: {}", e)))?
            .to_bytes();
        let message = serde_json::from_slice::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());

        Err(match status {
            StatusCode::NOT_FOUND => Error::NetworkNotFound(req.network_id.clone()),
            StatusCode::BAD_REQUEST => Error::InvalidRequest(message),
            status => Error::Tunnel(format!("agent answered {}: {}", status.as_u16(), message)),
        })
    }

    /// Request a tunnel and bind the local listener that will carry it
    pub async fn connect(&self, req: &TunnelRequest, bind: SocketAddr) -> Result<LocalTunnel> {
        let remote = self.request(req).await?;
        let listener = TcpListener::bind(bind).await?;
        Ok(LocalTunnel { remote, listener })
    }
}

/// An accepted tunnel waiting for its local connection
#[derive(Debug)]
pub struct LocalTunnel {
    remote: TunnelStream,
    listener: TcpListener,
}

impl LocalTunnel {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept exactly one local connection and relay until both sides drain
    pub async fn serve(self) -> Result<RelayStats> {
        let Self { remote, listener } = self;
        let (local, peer) = listener.accept().await?;
        drop(listener);
        info!(%peer, "local connection accepted");

        relay::splice(local, remote)
            .await
            .map_err(|e| Error::Tunnel(format!("relay failed: {}", e)))
    }
}
