//! Control plane: signed management API and per-service webhooks
//!
//! Every `/api/*` request must carry `X-Signature-256` computed with the
//! global secret over the raw body. `/hooks/{name}` is authenticated with the
//! service's own secret via `X-Hub-Signature-256`, or not at all when the
//! service has none.

use crate::config::{Config, ServiceSpec};
use crate::error::{json_error_response, ErrorCode, HotifyError, Result};
use crate::registry::Registry;
use crate::signature::{self, API_SIGNATURE_HEADER, WEBHOOK_SIGNATURE_HEADER};
use crate::supervisor::Supervisor;
use anyhow::Context;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, X-Signature-256";

/// Helper to create an empty response
fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => json_error_response(ErrorCode::InternalError, e.to_string()),
    }
}

fn with_cors(mut response: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    response
}

/// Lifecycle operations exposed under `/api/services/{name}/{action}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceAction {
    Start,
    Stop,
    Update,
    Restart,
}

impl ServiceAction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "update" => Some(Self::Update),
            "restart" => Some(Self::Restart),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Update => "update",
            Self::Restart => "restart",
        }
    }

    async fn apply(&self, supervisor: &Supervisor) -> Result<()> {
        match self {
            Self::Start => supervisor.start().await,
            Self::Stop => supervisor.stop().await,
            Self::Update => supervisor.update().await,
            Self::Restart => supervisor.restart().await,
        }
    }
}

/// Split a request path into percent-decoded segments
fn path_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            urlencoding::decode(s)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| s.to_string())
        })
        .collect()
}

#[derive(Serialize)]
struct LogsView<'a> {
    name: &'a str,
    logs: Vec<String>,
    /// Lines produced since launch, including evicted ones
    total: u64,
}

/// Request handling, independent of the transport
pub struct ControlState {
    config: Config,
    registry: Arc<Registry>,
}

impl ControlState {
    /// `config.secret` must already be set
    pub fn new(config: Config, registry: Arc<Registry>) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Route one request with a fully read body
    pub async fn handle(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Response<Full<Bytes>> {
        debug!(%method, path, "Request");

        if method == Method::OPTIONS {
            return with_cors(empty(StatusCode::NO_CONTENT));
        }

        let owned = path_segments(path);
        let segments: Vec<&str> = owned.iter().map(String::as_str).collect();

        let response = match segments.as_slice() {
            ["hooks", name] => self.webhook(method, name, headers, &body),
            ["api", rest @ ..] => {
                let header = headers
                    .get(API_SIGNATURE_HEADER)
                    .and_then(|v| v.to_str().ok());
                match signature::verify(&self.config.secret, &body, header) {
                    Ok(()) => self.api(method, rest, &body).await,
                    Err(e) => {
                        warn!(%method, path, "Rejected unsigned or mis-signed API request");
                        Response::from(&e)
                    }
                }
            }
            _ => json_error_response(ErrorCode::NotFound, format!("no route for {}", path)),
        };

        with_cors(response)
    }

    async fn api(&self, method: &Method, segments: &[&str], body: &Bytes) -> Response<Full<Bytes>> {
        let result = match (method, segments) {
            (&Method::GET, ["config"]) => Ok(self.get_config()),
            (&Method::GET, ["services"]) => Ok(json_response(StatusCode::OK, &self.registry.list())),
            (&Method::POST, ["services"]) => self.create_service(body).await,
            (&Method::GET, ["services", name]) => self.get_service(name),
            (&Method::DELETE, ["services", name]) => self.delete_service(name).await,
            (&Method::GET, ["services", name, "logs"]) => self.get_logs(name),
            (&Method::GET, ["services", name, action]) => match ServiceAction::parse(action) {
                Some(action) => self.run_action(name, action).await,
                None => Err(HotifyError::NotFound(format!("{}/{}", name, action))),
            },
            (_, ["config"]) | (_, ["services"]) | (_, ["services", _]) => Ok(method_not_allowed(method)),
            (_, ["services", _, sub]) if *sub == "logs" || ServiceAction::parse(sub).is_some() => {
                Ok(method_not_allowed(method))
            }
            _ => Ok(json_error_response(
                ErrorCode::NotFound,
                format!("no route for /api/{}", segments.join("/")),
            )),
        };

        result.unwrap_or_else(|e| {
            if e.status_code().is_server_error() {
                error!(error = %e, "API request failed");
            } else {
                debug!(error = %e, "API request rejected");
            }
            Response::from(&e)
        })
    }

    fn get_config(&self) -> Response<Full<Bytes>> {
        let mut config = self.config.clone();
        config.services = self.registry.specs();
        json_response(StatusCode::OK, &config.redacted())
    }

    fn lookup(&self, name: &str) -> Result<Arc<Supervisor>> {
        self.registry
            .lookup(name)
            .ok_or_else(|| HotifyError::NotFound(name.to_string()))
    }

    async fn create_service(&self, body: &Bytes) -> Result<Response<Full<Bytes>>> {
        let spec: ServiceSpec = serde_json::from_slice(body)
            .map_err(|e| HotifyError::InvalidRequest(format!("invalid JSON: {}", e)))?;

        let supervisor = self.registry.create(spec).await?;
        info!(service = %supervisor.name(), "Service created");
        Ok(json_response(StatusCode::CREATED, &supervisor.info()))
    }

    fn get_service(&self, name: &str) -> Result<Response<Full<Bytes>>> {
        let supervisor = self.lookup(name)?;
        Ok(json_response(StatusCode::OK, &supervisor.info()))
    }

    fn get_logs(&self, name: &str) -> Result<Response<Full<Bytes>>> {
        let supervisor = self.lookup(name)?;
        let (logs, total) = supervisor.log_snapshot();
        Ok(json_response(
            StatusCode::OK,
            &LogsView {
                name: supervisor.name(),
                logs,
                total,
            },
        ))
    }

    async fn delete_service(&self, name: &str) -> Result<Response<Full<Bytes>>> {
        self.registry.delete(name).await?;
        info!(service = name, "Service deleted");
        Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({ "name": name, "status": "deleted" }),
        ))
    }

    async fn run_action(&self, name: &str, action: ServiceAction) -> Result<Response<Full<Bytes>>> {
        let supervisor = self.lookup(name)?;
        info!(service = name, action = action.as_str(), "Running service action");
        action.apply(&supervisor).await?;
        Ok(json_response(StatusCode::OK, &supervisor.summary()))
    }

    /// Answers with a bare status code. Update runs in the background.
    fn webhook(
        &self,
        method: &Method,
        name: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Response<Full<Bytes>> {
        if method != Method::POST {
            return empty(StatusCode::METHOD_NOT_ALLOWED);
        }

        let Some(supervisor) = self.registry.lookup(name) else {
            debug!(service = name, "Webhook for unknown service");
            return empty(StatusCode::NOT_FOUND);
        };

        if let Some(secret) = supervisor.spec().secret.as_deref() {
            let header = headers
                .get(WEBHOOK_SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok());
            if signature::verify(secret, body, header).is_err() {
                warn!(service = name, "Invalid webhook signature");
                return empty(StatusCode::FORBIDDEN);
            }
        }

        info!(service = name, "Received webhook, updating");
        tokio::spawn(async move {
            if let Err(e) = supervisor.update().await {
                error!(service = %supervisor.name(), error = %e, "Webhook update failed");
            }
        });

        empty(StatusCode::OK)
    }
}

fn method_not_allowed(method: &Method) -> Response<Full<Bytes>> {
    json_error_response(
        ErrorCode::MethodNotAllowed,
        format!("method {} not allowed", method),
    )
}

/// HTTP listener serving a [`ControlState`]
pub struct ControlPlane {
    listener: TcpListener,
    state: Arc<ControlState>,
}

impl ControlPlane {
    /// Bind the listener. Failure here is fatal for the daemon.
    pub async fn bind(addr: &str, state: ControlState) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind control plane to {}", addr))?;
        Ok(Self {
            listener,
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown_rx` turns true
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "Control plane listening (HTTP/1.1 and HTTP/2)");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, state).await {
                                    debug!(addr = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control plane shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<ControlState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ControlState>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok(state
        .handle(&parts.method, parts.uri.path(), &parts.headers, body)
        .await)
}
