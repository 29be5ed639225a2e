//! HTTP front for the offline cache engine
//!
//! Every request the host page would send to the origin is received here and
//! handed to the runtime. Requests under the control path carry control
//! messages, manual sync triggers and configuration reloads instead.

use crate::config::OfflineConfig;
use crate::error::{OfflineError, Result};
use crate::models::{origin_target, InterceptedRequest, ResponseSnapshot};
use crate::worker::{ControlMessage, EventOutcome, OfflineRuntime, WorkerEvent};
use http::header::{HeaderName, HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use reqwest::Url;
use serde_json::json;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Response header naming where a response came from
pub const SOURCE_HEADER: &str = "x-washcache-source";

/// HTTP server routing requests into an [`OfflineRuntime`]
pub struct OfflineServer {
    runtime: Arc<OfflineRuntime>,
    origin: Url,
    control_path: String,
    config_path: Option<PathBuf>,
}

impl OfflineServer {
    /// Create a new server
    ///
    /// # Arguments
    /// * `runtime` - Runtime handling the requests
    /// * `config` - Configuration providing the origin and control path
    /// * `config_path` - File re-read on `POST <control_path>/reload`
    pub fn new(
        runtime: Arc<OfflineRuntime>,
        config: &OfflineConfig,
        config_path: Option<PathBuf>,
    ) -> Result<Self> {
        Ok(OfflineServer {
            runtime,
            origin: config.origin_url()?,
            control_path: config.control_path.trim_end_matches('/').to_string(),
            config_path,
        })
    }

    /// Accept connections on `addr` until the process is terminated
    pub async fn start(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Offline cache listening on http://{} (origin {})", addr, self.origin);
        info!("Control endpoints under http://{}{}", addr, self.control_path);

        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = Arc::clone(&self);

            tokio::task::spawn(async move {
                let result = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(move |req| {
                            let server = Arc::clone(&server);
                            async move { server.handle(req).await }
                        }),
                    )
                    .await;

                if let Err(err) = result {
                    error!("Error serving connection from {}: {:?}", peer, err);
                }
            });
        }
    }

    /// Handle one HTTP request
    pub async fn handle<B>(&self, req: Request<B>) -> std::result::Result<Response<Full<Bytes>>, hyper::http::Error>
    where
        B: Body,
        B::Error: Display,
    {
        let path = req.uri().path().to_string();
        if let Some(action) = path.strip_prefix(self.control_path.as_str()) {
            if action.is_empty() || action.starts_with('/') {
                return self.handle_control(req, action.trim_start_matches('/').to_string()).await;
            }
        }

        let request = match self.to_intercepted(req).await {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejecting request: {}", e);
                return json_response(
                    StatusCode::from_u16(e.to_http_status()).unwrap_or(StatusCode::BAD_REQUEST),
                    json!({"error": e.to_string()}),
                );
            }
        };

        let is_head = request.method == Method::HEAD;
        let served = self.runtime.intercept(&request).await;
        debug!(
            "{} {} -> {} ({})",
            request.method,
            request.url,
            served.response.status,
            served.source.as_str()
        );
        snapshot_response(served.response, served.source.as_str(), is_head)
    }

    async fn to_intercepted<B>(&self, req: Request<B>) -> Result<InterceptedRequest>
    where
        B: Body,
        B::Error: Display,
    {
        let (parts, body) = req.into_parts();
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = origin_target(&self.origin, target);

        let mut request = InterceptedRequest::new(parts.method, url)?;
        request.headers = parts.headers;

        let body = body
            .collect()
            .await
            .map_err(|e| OfflineError::IoError(format!("Failed to read request body: {}", e)))?
            .to_bytes();
        if !body.is_empty() {
            request.body = Some(body);
        }
        Ok(request)
    }

    async fn handle_control<B>(
        &self,
        req: Request<B>,
        action: String,
    ) -> std::result::Result<Response<Full<Bytes>>, hyper::http::Error>
    where
        B: Body,
        B::Error: Display,
    {
        if *req.method() != Method::POST {
            return json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                json!({"error": "control endpoints accept POST only"}),
            );
        }

        let result = match action.as_str() {
            "message" => self.control_message(req).await,
            "sync" => self.control_sync().await,
            "reload" => self.control_reload().await,
            _ => {
                return json_response(
                    StatusCode::NOT_FOUND,
                    json!({"error": format!("unknown control action '{}'", action)}),
                )
            }
        };

        match result {
            Ok((status, body)) => json_response(status, body),
            Err(e) => {
                warn!("Control action {} failed: {}", action, e);
                json_response(
                    StatusCode::from_u16(e.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    json!({"error": e.to_string()}),
                )
            }
        }
    }

    async fn control_message<B>(&self, req: Request<B>) -> Result<(StatusCode, serde_json::Value)>
    where
        B: Body,
        B::Error: Display,
    {
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| OfflineError::IoError(format!("Failed to read message body: {}", e)))?
            .to_bytes();
        let message: ControlMessage = match serde_json::from_slice(&body) {
            Ok(message) => message,
            Err(e) => {
                return Ok((
                    StatusCode::BAD_REQUEST,
                    json!({"error": format!("unrecognized control message: {}", e)}),
                ))
            }
        };

        let (tx, rx) = oneshot::channel();
        let outcome = self
            .runtime
            .dispatch(WorkerEvent::Message {
                message,
                reply: Some(tx),
            })
            .await?;

        Ok(match outcome {
            EventOutcome::Replied(_) => {
                let reply = rx
                    .await
                    .map_err(|_| OfflineError::InvalidState("no reply to control message".to_string()))?;
                (StatusCode::OK, reply)
            }
            EventOutcome::Activated { generation, .. } => {
                (StatusCode::OK, json!({"activated": generation}))
            }
            EventOutcome::Prefetching(_) => (StatusCode::ACCEPTED, json!({"prefetching": true})),
            _ => (StatusCode::OK, json!({"ok": true})),
        })
    }

    async fn control_sync(&self) -> Result<(StatusCode, serde_json::Value)> {
        let tag = self.runtime.sync_queue().tag().to_string();
        match self.runtime.dispatch(WorkerEvent::Sync { tag }).await? {
            EventOutcome::Synced(Some(report)) => Ok((
                StatusCode::OK,
                json!({
                    "attempted": report.attempted,
                    "replayed": report.replayed,
                    "failed": report.failed,
                    "remaining": report.remaining,
                }),
            )),
            _ => Ok((StatusCode::CONFLICT, json!({"error": "sync already running"}))),
        }
    }

    async fn control_reload(&self) -> Result<(StatusCode, serde_json::Value)> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| OfflineError::ConfigError("no configuration file to reload".to_string()))?;
        let config = OfflineConfig::from_file(path)?;
        let changes = self.runtime.reload(config).await?;
        Ok((StatusCode::OK, json!({"changed": changes.summary()})))
    }
}

/// Convert a captured response into a hyper response
fn snapshot_response(
    snapshot: ResponseSnapshot,
    source: &'static str,
    strip_body: bool,
) -> std::result::Result<Response<Full<Bytes>>, hyper::http::Error> {
    let status = StatusCode::from_u16(snapshot.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &snapshot.headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => debug!("Dropping invalid header {}", name),
            }
        }
        headers.insert(SOURCE_HEADER, HeaderValue::from_static(source));
    }
    let body = if strip_body { Bytes::new() } else { snapshot.body };
    builder.body(Full::new(body))
}

fn json_response(
    status: StatusCode,
    body: serde_json::Value,
) -> std::result::Result<Response<Full<Bytes>>, hyper::http::Error> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
}
