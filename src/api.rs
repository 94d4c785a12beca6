//! HTTP API for entity management and nginx control
//!
//! Every route lives under `/api/v1`. Successful responses use the
//! `{"success": true, "data": ...}` envelope; failures carry an
//! [`ErrorResponse`](crate::error::ErrorResponse) body with a stable code.
//!
//! Mutations only enqueue an apply intent after the store has committed, so
//! the renderer never observes a write that was rolled back.

use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, CONTENT_TYPE,
};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::apply::{ApplyCoordinator, ApplyIntent, FailureKind};
use crate::error::{json_error_response, ApiErrorCode, StoreError};
use crate::model::{
    CertificateDraft, Entity, EntityDraft, EntityId, EntityKind, ProxyHostDraft, UpstreamDraft,
    UpstreamServer, UpstreamServerDraft,
};
use crate::queue::ChangeQueue;
use crate::store::EntityStore;

const API_PREFIX: &str = "/api/v1";

const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const CORS_ALLOW_HEADERS: &str = "Content-Type, Authorization";

/// Success envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

pub struct ApiServer {
    store: Arc<dyn EntityStore>,
    coordinator: Arc<ApplyCoordinator>,
    queue: Arc<ChangeQueue>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        store: Arc<dyn EntityStore>,
        coordinator: Arc<ApplyCoordinator>,
        queue: Arc<ChangeQueue>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            coordinator,
            queue,
            shutdown_rx,
        })
    }

    /// Bind `addr` and serve until shutdown
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    /// Every response carries the CORS headers; preflights are answered
    /// without routing
    async fn handle_request(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let mut response = if req.method() == Method::OPTIONS {
            let mut preflight = Response::new(Full::new(Bytes::new()));
            *preflight.status_mut() = StatusCode::NO_CONTENT;
            preflight
        } else {
            self.route(req).await
        };
        add_cors_headers(response.headers_mut());
        Ok(response)
    }

    async fn route(&self, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        let Some(rest) = path.strip_prefix(API_PREFIX) else {
            return not_found();
        };
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

        let response = match (&method, segments.as_slice()) {
            (&Method::GET, ["health"]) => self.health(),

            (&Method::POST, ["nginx", "reload"]) => self.reload(),
            (&Method::POST, ["nginx", "test"]) => self.test_config().await,
            (&Method::GET, ["nginx", "status"]) => Ok(self.nginx_status().await),
            (&Method::GET, ["nginx", "apply"]) => self.apply_status(),

            (_, ["upstreams", upstream_id, "servers", rest @ ..]) => {
                self.handle_servers(&method, upstream_id, rest, req).await
            }

            (_, [resource, rest @ ..]) => match resource_kind(resource) {
                Some(kind) => self.handle_entities(kind, &method, rest, req).await,
                None => Ok(not_found()),
            },

            _ => Ok(not_found()),
        };

        response.unwrap_or_else(|e| {
            error!(error = %e, %method, %path, "API request failed");
            json_error_response(ApiErrorCode::InternalError, e.to_string())
        })
    }

    fn health(&self) -> Result<Response<Full<Bytes>>> {
        let body = serde_json::json!({
            "status": "ok",
            "service": "balancer-studio",
            "version": env!("CARGO_PKG_VERSION"),
        });
        Ok(json_response(StatusCode::OK, body.to_string()))
    }

    // ==================== Entities ====================

    async fn handle_entities(
        &self,
        kind: EntityKind,
        method: &Method,
        rest: &[&str],
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        match (method, rest) {
            (&Method::GET, []) => self.list_entities(kind),
            (&Method::POST, []) => {
                let body = req.collect().await?.to_bytes();
                match parse_draft(kind, None, &body) {
                    Ok(draft) => self.create_entity(draft),
                    Err(resp) => Ok(resp),
                }
            }
            (_, [id]) => {
                let Some(id) = parse_id(id) else {
                    return Ok(invalid_id(id));
                };
                match *method {
                    Method::GET => self.get_entity(kind, id),
                    Method::PUT => {
                        let body = req.collect().await?.to_bytes();
                        match parse_draft(kind, None, &body) {
                            Ok(draft) => self.update_entity(id, draft),
                            Err(resp) => Ok(resp),
                        }
                    }
                    Method::DELETE => self.delete_entity(kind, id),
                    _ => Ok(not_found()),
                }
            }
            _ => Ok(not_found()),
        }
    }

    async fn handle_servers(
        &self,
        method: &Method,
        upstream_id: &str,
        rest: &[&str],
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        let Some(upstream_id) = parse_id(upstream_id) else {
            return Ok(invalid_id(upstream_id));
        };

        match (method, rest) {
            (&Method::GET, []) => match self.store.get(EntityKind::Upstream, upstream_id) {
                Ok(Entity::Upstream(upstream)) => ok_response(StatusCode::OK, &upstream.servers),
                Ok(_) => Ok(not_found()),
                Err(e) => Ok(store_error(&e)),
            },
            (&Method::POST, []) => {
                let body = req.collect().await?.to_bytes();
                match parse_draft(EntityKind::UpstreamServer, Some(upstream_id), &body) {
                    Ok(draft) => self.create_entity(draft),
                    Err(resp) => Ok(resp),
                }
            }
            (_, [server_id]) => {
                let Some(server_id) = parse_id(server_id) else {
                    return Ok(invalid_id(server_id));
                };
                match *method {
                    Method::GET => match self.owned_server(upstream_id, server_id) {
                        Ok(server) => ok_response(StatusCode::OK, &server),
                        Err(e) => Ok(store_error(&e)),
                    },
                    Method::PUT => {
                        let body = req.collect().await?.to_bytes();
                        match parse_draft(EntityKind::UpstreamServer, Some(upstream_id), &body) {
                            Ok(draft) => self.update_entity(server_id, draft),
                            Err(resp) => Ok(resp),
                        }
                    }
                    Method::DELETE => match self.owned_server(upstream_id, server_id) {
                        Ok(_) => self.delete_entity(EntityKind::UpstreamServer, server_id),
                        Err(e) => Ok(store_error(&e)),
                    },
                    _ => Ok(not_found()),
                }
            }
            _ => Ok(not_found()),
        }
    }

    /// Look up a server that belongs to the upstream named in the path
    fn owned_server(
        &self,
        upstream_id: EntityId,
        server_id: EntityId,
    ) -> std::result::Result<UpstreamServer, StoreError> {
        match self.store.get(EntityKind::UpstreamServer, server_id)? {
            Entity::UpstreamServer(server) if server.upstream_id == upstream_id => Ok(server),
            _ => Err(StoreError::NotFound {
                kind: EntityKind::UpstreamServer,
                id: server_id,
            }),
        }
    }

    fn list_entities(&self, kind: EntityKind) -> Result<Response<Full<Bytes>>> {
        match self.store.list(kind) {
            Ok(entities) => ok_response(StatusCode::OK, &entities),
            Err(e) => Ok(store_error(&e)),
        }
    }

    fn get_entity(&self, kind: EntityKind, id: EntityId) -> Result<Response<Full<Bytes>>> {
        match self.store.get(kind, id) {
            Ok(entity) => ok_response(StatusCode::OK, &entity),
            Err(e) => Ok(store_error(&e)),
        }
    }

    fn create_entity(&self, draft: EntityDraft) -> Result<Response<Full<Bytes>>> {
        let kind = draft.kind();
        match self.store.create(draft) {
            Ok(committed) => {
                let id = committed.value.id();
                info!(%kind, id, revision = committed.revision, "Entity created");
                self.queue.enqueue(ApplyIntent::new(
                    committed.revision,
                    format!("created {} {}", kind, id),
                ));
                ok_response(StatusCode::CREATED, &committed.value)
            }
            Err(e) => Ok(store_error(&e)),
        }
    }

    fn update_entity(&self, id: EntityId, draft: EntityDraft) -> Result<Response<Full<Bytes>>> {
        let kind = draft.kind();
        match self.store.update(id, draft) {
            Ok(committed) => {
                info!(%kind, id, revision = committed.revision, "Entity updated");
                self.queue.enqueue(ApplyIntent::new(
                    committed.revision,
                    format!("updated {} {}", kind, id),
                ));
                ok_response(StatusCode::OK, &committed.value)
            }
            Err(e) => Ok(store_error(&e)),
        }
    }

    fn delete_entity(&self, kind: EntityKind, id: EntityId) -> Result<Response<Full<Bytes>>> {
        match self.store.delete(kind, id) {
            Ok(committed) => {
                info!(%kind, id, revision = committed.revision, "Entity deleted");
                self.queue.enqueue(ApplyIntent::new(
                    committed.revision,
                    format!("deleted {} {}", kind, id),
                ));
                ok_response(StatusCode::OK, &serde_json::json!({ "id": id, "deleted": true }))
            }
            Err(e) => Ok(store_error(&e)),
        }
    }

    // ==================== nginx ====================

    fn reload(&self) -> Result<Response<Full<Bytes>>> {
        let revision = match self.store.revision() {
            Ok(revision) => revision,
            Err(e) => return Ok(store_error(&e)),
        };
        let intent = ApplyIntent::new(revision, "manual reload").forced();
        info!(revision, "Manual reload requested");
        self.queue.enqueue(intent.clone());
        ok_response(StatusCode::ACCEPTED, &intent)
    }

    async fn test_config(&self) -> Result<Response<Full<Bytes>>> {
        let mut cancel = self.shutdown_rx.clone();
        match self.coordinator.dry_run(&mut cancel).await {
            Ok(dry) => ok_response(
                StatusCode::OK,
                &serde_json::json!({
                    "valid": true,
                    "fingerprint": dry.fingerprint,
                    "active": dry.active,
                    "snapshot_revision": dry.snapshot_revision,
                }),
            ),
            Err(failure) => {
                let code = match failure.kind {
                    FailureKind::Render => ApiErrorCode::RenderError,
                    FailureKind::Syntax => ApiErrorCode::SyntaxError,
                    FailureKind::Store => ApiErrorCode::StoreError,
                    _ => ApiErrorCode::InternalError,
                };
                Ok(json_error_response(code, failure.detail))
            }
        }
    }

    async fn nginx_status(&self) -> Response<Full<Bytes>> {
        match self.coordinator.controller().status().await {
            Ok(status) => ok_response(StatusCode::OK, &status).unwrap_or_else(|e| {
                json_error_response(ApiErrorCode::InternalError, e.to_string())
            }),
            Err(e) => {
                warn!(error = %e, "nginx status unavailable");
                json_error_response(ApiErrorCode::StatusUnavailable, e.to_string())
            }
        }
    }

    fn apply_status(&self) -> Result<Response<Full<Bytes>>> {
        let body = serde_json::json!({
            "state": self.coordinator.state(),
            "active_fingerprint": self.coordinator.active_fingerprint(),
            "pending": self.queue.pending(),
            "last_report": self.coordinator.last_report(),
            "stats": self.coordinator.stats(),
            "queue": self.queue.stats(),
        });
        ok_response(StatusCode::OK, &body)
    }
}

fn resource_kind(segment: &str) -> Option<EntityKind> {
    match segment {
        "proxy-hosts" => Some(EntityKind::ProxyHost),
        "certificates" => Some(EntityKind::Certificate),
        "upstreams" => Some(EntityKind::Upstream),
        _ => None,
    }
}

fn parse_id(raw: &str) -> Option<EntityId> {
    raw.parse::<EntityId>().ok().filter(|id| *id > 0)
}

/// Decode a request body into the draft type for `kind`
fn parse_draft(
    kind: EntityKind,
    upstream_id: Option<EntityId>,
    body: &[u8],
) -> std::result::Result<EntityDraft, Response<Full<Bytes>>> {
    let parsed = match (kind, upstream_id) {
        (EntityKind::ProxyHost, _) => {
            serde_json::from_slice::<ProxyHostDraft>(body).map(EntityDraft::ProxyHost)
        }
        (EntityKind::Certificate, _) => {
            serde_json::from_slice::<CertificateDraft>(body).map(EntityDraft::Certificate)
        }
        (EntityKind::Upstream, _) => {
            serde_json::from_slice::<UpstreamDraft>(body).map(EntityDraft::Upstream)
        }
        (EntityKind::UpstreamServer, Some(upstream_id)) => serde_json::from_slice::<UpstreamServerDraft>(body)
            .map(|server| EntityDraft::UpstreamServer {
                upstream_id,
                server,
            }),
        (EntityKind::UpstreamServer, None) => {
            return Err(json_error_response(
                ApiErrorCode::InvalidRequest,
                "upstream servers are managed through /upstreams/{id}/servers",
            ))
        }
    };

    parsed.map_err(|e| {
        json_error_response(
            ApiErrorCode::InvalidRequest,
            format!("invalid {} body: {}", kind, e),
        )
    })
}

// ==================== Helper Functions ====================

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn add_cors_headers(headers: &mut HeaderMap) {
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
}

fn ok_response<T: Serialize>(status: StatusCode, data: &T) -> Result<Response<Full<Bytes>>> {
    let body = serde_json::to_string(&ApiResponse::ok(data))?;
    Ok(json_response(status, body))
}

fn store_error(err: &StoreError) -> Response<Full<Bytes>> {
    let code = ApiErrorCode::from(err);
    if code == ApiErrorCode::StoreError {
        error!(error = %err, "Store failure");
    }
    json_error_response(code, err.to_string())
}

fn not_found() -> Response<Full<Bytes>> {
    json_error_response(ApiErrorCode::NotFound, "no such route")
}

fn invalid_id(raw: &str) -> Response<Full<Bytes>> {
    json_error_response(ApiErrorCode::InvalidRequest, format!("invalid id: {}", raw))
}
