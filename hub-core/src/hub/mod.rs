//! The Connection Hub: accepts agent WebSocket connections on its own
//! listener, admits them (origin/token/agent-id checks from [`admission`]),
//! registers them in [`registry::Registry`], and keeps the registry honest
//! via the reaper.
//!
//! Grounded on `hub_server/ws/hub.go`'s `Hub.Run()`/`ServeWs`, transplanted
//! onto a raw `tokio-tungstenite` `TcpListener` accept loop the way the
//! teacher's `continuum-core::voice::call_server` runs its own socket
//! server, per the decision (see `SPEC_FULL.md` §3.B) to keep the agent
//! WebSocket off the axum router entirely.

pub mod admission;
pub mod connection;
pub mod reaper;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::binding::BindingStore;
use crate::config::Config;
use crate::store::AgentRepository;

use connection::{run_connection, Connection};
use registry::Registry;

/// spec.md:125 — read limit applied to each admitted agent socket.
const MAX_WS_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

pub struct Hub {
    config: Arc<Config>,
    store: Arc<dyn AgentRepository>,
    binding: Arc<BindingStore>,
    registry: Arc<Registry<Connection>>,
}

impl Hub {
    pub fn new(config: Arc<Config>, store: Arc<dyn AgentRepository>, binding: Arc<BindingStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            binding,
            registry: Arc::new(Registry::new()),
        })
    }

    pub fn registry(&self) -> Arc<Registry<Connection>> {
        self.registry.clone()
    }

    /// Binds the WS listener and runs the accept loop, the unregister
    /// drain, and the stale-connection reaper until the process exits.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.ws_listen_addr)
            .await
            .with_context(|| format!("binding ws listener on {}", self.config.ws_listen_addr))?;
        tracing::info!(addr = %self.config.ws_listen_addr, "agent websocket listener bound");

        let (unregister_tx, mut unregister_rx) = mpsc::channel::<Arc<Connection>>(256);

        let drain_registry = self.registry.clone();
        let drain_store = self.store.clone();
        tokio::spawn(async move {
            while let Some(conn) = unregister_rx.recv().await {
                if drain_registry.remove_if_same(&conn.id, &conn) {
                    if let Err(e) = drain_store.mark_status(&conn.id, crate::store::AgentStatus::Offline) {
                        tracing::warn!(agent_id = %conn.id, error = %e, "failed to mark agent offline");
                    }
                }
            }
        });

        let reaper_registry = self.registry.clone();
        let stale_threshold = self.config.stale_threshold;
        let reaper_unregister = unregister_tx.clone();
        tokio::spawn(async move {
            reaper::run(reaper_registry, stale_threshold, reaper_unregister, now_unix).await;
        });

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "ws accept failed");
                    continue;
                }
            };
            let hub = self.clone();
            let unregister = unregister_tx.clone();
            tokio::spawn(async move {
                hub.accept_connection(stream, remote_addr, unregister).await;
            });
        }
    }

    async fn accept_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr, unregister: mpsc::Sender<Arc<Connection>>) {
        let admitted_id = Arc::new(parking_lot::Mutex::new(None));
        let admitted_id_cb = admitted_id.clone();
        let allowed_origins = self.config.allowed_origins.clone();
        let ws_token = self.config.ws_token.clone();

        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let origin = req.headers().get("origin").and_then(|v| v.to_str().ok());
            if !admission::origin_allowed(origin, &allowed_origins) {
                return Err(reject(StatusCode::FORBIDDEN));
            }

            let query = req.uri().query().unwrap_or("");
            let params = parse_query(query);

            let header_token = req.headers().get("x-ws-token").and_then(|v| v.to_str().ok());
            let auth_header = req.headers().get("authorization").and_then(|v| v.to_str().ok());
            let query_token = params.get("token").map(String::as_str);
            let token = admission::extract_token(header_token, auth_header, query_token);
            if !admission::token_valid(&ws_token, token) {
                return Err(reject(StatusCode::UNAUTHORIZED));
            }

            let header_id = req.headers().get("x-agent-id").and_then(|v| v.to_str().ok());
            let query_id = params.get("agent_id").map(String::as_str);
            match admission::extract_agent_id(header_id, query_id) {
                Some(id) => {
                    *admitted_id_cb.lock() = Some(id.to_string());
                    Ok(resp)
                }
                None => Err(reject(StatusCode::BAD_REQUEST)),
            }
        };

        // tungstenite has no permessage-deflate support to negotiate here;
        // the read-limit half of spec.md:125 is enforced via WebSocketConfig.
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(MAX_WS_MESSAGE_BYTES))
            .max_frame_size(Some(MAX_WS_MESSAGE_BYTES));

        let ws_stream = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%remote_addr, error = %e, "ws handshake rejected");
                return;
            }
        };

        let agent_id = match admitted_id.lock().take() {
            Some(id) => id,
            None => {
                tracing::error!(%remote_addr, "handshake accepted without an admitted agent id");
                return;
            }
        };

        use futures_util::StreamExt;
        let (write, read) = ws_stream.split();
        let conn = Connection::new(agent_id.clone(), remote_addr.to_string(), write);

        tracing::info!(agent_id = %agent_id, %remote_addr, "agent connected");
        self.registry.insert(agent_id.clone(), conn.clone());

        run_connection(conn, read, self.store.clone(), self.binding.clone(), unregister).await;

        tracing::info!(agent_id = %agent_id, "agent disconnected");
    }
}

fn reject(status: StatusCode) -> ErrorResponse {
    Response::builder().status(status).body(None).expect("static response is well-formed")
}

fn parse_query(query: &str) -> std::collections::HashMap<String, String> {
    query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .filter_map(|kv| {
            let mut parts = kv.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next().unwrap_or("");
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
