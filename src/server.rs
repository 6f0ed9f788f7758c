//! Agent API
//!
//! JSON routes over networks and endpoints. `connect` validates its request,
//! answers `101 Switching Protocols` and hands the upgraded connection to
//! the tunnel broker.

use crate::error::{Error, Result};
use crate::network::driver::Driver;
use crate::network::endpoint::{EndpointCreate, EndpointRepository};
use crate::network::repository::{NetworkCreate, NetworkRepository};
use crate::network::types::{Endpoint, Network};
use crate::tunnel::UPGRADE_PROTOCOL;
use crate::tunnel::broker::TunnelBroker;
use axum::body::{Body, Bytes};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Body of every error answer
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Body of an endpoint activation request
#[derive(Debug, Deserialize)]
struct ActivateRequest {
    target_netns: PathBuf,
}

/// Query of a connect request; both fields are checked by `connect_target`
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub ip: Option<String>,
    pub port: Option<String>,
}

fn parse<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    if body.is_empty() {
        return Err(Error::InvalidRequest("request body is required".into()));
    }
    Ok(serde_json::from_slice(body)?)
}

/// Parse the `ip` and `port` query parameters of a connect request
pub fn connect_target(query: &ConnectQuery) -> Result<SocketAddrV4> {
    let ip = query
        .ip
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::InvalidRequest("missing 'ip' parameter".into()))?;
    let port = query
        .port
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::InvalidRequest("missing 'port' parameter".into()))?;

    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| Error::InvalidRequest(format!("'{}' is not an IPv4 address", ip)))?;
    let port: u16 = match port.parse() {
        Ok(0) | Err(_) => {
            return Err(Error::InvalidRequest(format!("'{}' is not a valid port", port)));
        }
        Ok(port) => port,
    };

    Ok(SocketAddrV4::new(ip, port))
}

fn wants_tunnel(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(UPGRADE_PROTOCOL))
}

pub struct Agent<D: Driver> {
    networks: Arc<NetworkRepository<D>>,
    endpoints: Arc<EndpointRepository<D>>,
    broker: Arc<TunnelBroker>,
}

impl<D: Driver> Agent<D> {
    pub fn new(
        networks: Arc<NetworkRepository<D>>,
        endpoints: Arc<EndpointRepository<D>>,
        broker: Arc<TunnelBroker>,
    ) -> Self {
        Self {
            networks,
            endpoints,
            broker,
        }
    }

    /// Serve the API until `shutdown` resolves
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "agent API listening");
        }

        axum::serve(listener, router(self))
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("agent API stopped");
        Ok(())
    }
}

/// Every route of the agent API
pub fn router<D: Driver>(agent: Arc<Agent<D>>) -> Router {
    Router::new()
        .route("/networks", get(list_networks::<D>).post(create_network::<D>))
        .route(
            "/networks/{id}",
            get(show_network::<D>).delete(delete_network::<D>),
        )
        .route("/networks/{id}/ensure", post(ensure_network::<D>))
        .route(
            "/networks/{id}/endpoints",
            get(list_endpoints::<D>).post(create_endpoint::<D>),
        )
        .route(
            "/networks/{id}/endpoints/{ep}",
            get(show_endpoint::<D>).delete(delete_endpoint::<D>),
        )
        .route(
            "/networks/{id}/endpoints/{ep}/activate",
            post(activate_endpoint::<D>),
        )
        .route(
            "/networks/{id}/connect",
            post(connect::<D>).get(connect::<D>),
        )
        .fallback(no_route)
        .method_not_allowed_fallback(no_route)
        .layer(middleware::from_fn(log_request))
        .with_state(agent)
}

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = next.run(req).await;
    debug!(%method, %path, status = response.status().as_u16(), "request");
    response
}

async fn no_route(method: Method, uri: Uri) -> Error {
    Error::RouteNotFound(format!("{} {}", method, uri.path()))
}

async fn list_networks<D: Driver>(
    State(agent): State<Arc<Agent<D>>>,
) -> Result<Json<Vec<Network>>> {
    Ok(Json(agent.networks.list().await?))
}

async fn create_network<D: Driver>(
    State(agent): State<Arc<Agent<D>>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Network>)> {
    let params: NetworkCreate = parse(&body)?;
    let network = agent.networks.create(params).await?;
    Ok((StatusCode::CREATED, Json(network)))
}

async fn show_network<D: Driver>(
    State(agent): State<Arc<Agent<D>>>,
    Path(id): Path<String>,
) -> Result<Json<Network>> {
    Ok(Json(agent.networks.get(&id).await?))
}

async fn delete_network<D: Driver>(
    State(agent): State<Arc<Agent<D>>>,
    Path(id): Path<String>,
) -> Result<Json<Network>> {
    Ok(Json(agent.networks.delete(&id).await?))
}

async fn ensure_network<D: Driver>(
    State(agent): State<Arc<Agent<D>>>,
    Path(id): Path<String>,
) -> Result<Json<Network>> {
    let network = agent.networks.get(&id).await?;
    Ok(Json(agent.networks.ensure(&network).await?))
}

async fn list_endpoints<D: Driver>(
    State(agent): State<Arc<Agent<D>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Endpoint>>> {
    let network = agent.networks.get(&id).await?;
    Ok(Json(agent.endpoints.list(&network).await?))
}

async fn create_endpoint<D: Driver>(
    State(agent): State<Arc<Agent<D>>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Endpoint>)> {
    let network = agent.networks.get(&id).await?;
    let params: EndpointCreate = parse(&body)?;
    let endpoint = agent.endpoints.create(&network, params).await?;
    Ok((StatusCode::CREATED, Json(endpoint)))
}

async fn show_endpoint<D: Driver>(
    State(agent): State<Arc<Agent<D>>>,
    Path((id, ep)): Path<(String, String)>,
) -> Result<Json<Endpoint>> {
    let network = agent.networks.get(&id).await?;
    Ok(Json(agent.endpoints.get(&network, &ep).await?))
}

async fn delete_endpoint<D: Driver>(
    State(agent): State<Arc<Agent<D>>>,
    Path((id, ep)): Path<(String, String)>,
) -> Result<Json<Endpoint>> {
    let network = agent.networks.get(&id).await?;
    Ok(Json(agent.endpoints.delete(&network, &ep).await?))
}

async fn activate_endpoint<D: Driver>(
    State(agent): State<Arc<Agent<D>>>,
    Path((id, ep)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Endpoint>> {
    let network = agent.networks.get(&id).await?;
    let endpoint = agent.endpoints.get(&network, &ep).await?;
    let params: ActivateRequest = parse(&body)?;
    let endpoint = agent
        .endpoints
        .activate(&network, endpoint, &params.target_netns)
        .await?;
    Ok(Json(endpoint))
}

/// Validate, prepare the broker, then switch the connection to the tunnel
///
/// Nothing is upgraded unless every check passed, so rejections are plain
/// JSON errors.
async fn connect<D: Driver>(
    State(agent): State<Arc<Agent<D>>>,
    Path(id): Path<String>,
    query: std::result::Result<Query<ConnectQuery>, QueryRejection>,
    mut req: Request,
) -> Result<Response> {
    let Query(query) = query.map_err(|e| Error::InvalidRequest(e.body_text()))?;
    let target = connect_target(&query)?;
    if !wants_tunnel(req.headers()) {
        return Err(Error::InvalidRequest(format!(
            "connect requires 'Upgrade: {}'",
            UPGRADE_PROTOCOL
        )));
    }

    let network = agent.networks.get(&id).await?;
    let pending = agent.broker.prepare(&network, target)?;
    let session = pending.session().id().to_string();
    info!(
        session = %session,
        network_id = %network.id,
        ip = %target.ip(),
        port = target.port(),
        "tunnel requested"
    );

    // Resolves once the 101 below has been written
    let upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => {
                if let Err(e) = agent.broker.run(pending, TokioIo::new(upgraded)).await {
                    warn!(session = %session, error = %e, "tunnel failed");
                }
            }
            Err(e) => warn!(session = %session, error = %e, "connection upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, UPGRADE_PROTOCOL)
        .body(Body::empty())
        .map_err(|e| Error::Tunnel(format!("failed to build upgrade response: {}", e)))
}
