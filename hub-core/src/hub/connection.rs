//! A single agent's live WebSocket connection: read loop, ping loop, write
//! path, and the reply-slot table the Call Mediator delivers RPC responses
//! through.
//!
//! Grounded on `hub_server/ws/client.go`'s `Client`: a read pump with a 90s
//! per-message deadline, a ping loop with EMA latency tracking, and a
//! per-connection write mutex — transplanted onto `tokio-tungstenite`'s
//! `accept_async`/`SinkExt`/`StreamExt` split the way the teacher's
//! `voice/call_server.rs` structures its own connection handler.

use std::io::Read;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flate2::read::GzDecoder;
use futures_util::stream::SplitSink;
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use hub_wire::{BindPayload, BindResultPayload, Frame, FrameType, HeartbeatPayload, ResponsePayload};

use crate::binding::BindingStore;
use crate::store::AgentRepository;

const READ_DEADLINE: Duration = Duration::from_secs(90);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const PING_PERIOD: Duration = Duration::from_secs(30);
const PING_WRITE_DEADLINE: Duration = Duration::from_secs(10);
const REPLY_SEND_DEADLINE: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionStats {
    pub ping_count: u64,
    pub pong_count: u64,
    pub failure_count: u32,
    pub avg_latency_ms: f64,
    pub messages_sent: u64,
    pub messages_recv: u64,
}

/// One agent's live socket. Exclusively owned by the hub's registry once
/// [`Connection::register`] publishes it; the reply-slot map is the one
/// piece the Call Mediator reaches into directly.
pub struct Connection {
    pub id: String,
    pub remote_addr: String,
    hostname: Mutex<String>,
    version: Mutex<String>,
    last_seen: AtomicI64,
    write: Mutex<WsSink>,
    reply_slots: DashMap<String, mpsc::Sender<ResponsePayload>>,
    stats: Mutex<ConnectionStats>,
    cancel: tokio_util::sync::CancellationToken,
    pending_pong: Mutex<Option<oneshot::Sender<()>>>,
}

/// Minimal standin for `tokio-util`'s cancellation token — the teacher's
/// `Client` uses a `context.CancelFunc` equivalent; rather than pull in the
/// full `tokio-util` crate for one type, a tiny watch-channel wrapper gives
/// the same "fire once, observable everywhere" semantics.
mod tokio_util {
    pub mod sync {
        use tokio::sync::watch;

        #[derive(Clone)]
        pub struct CancellationToken {
            tx: std::sync::Arc<watch::Sender<bool>>,
            rx: watch::Receiver<bool>,
        }

        impl CancellationToken {
            pub fn new() -> Self {
                let (tx, rx) = watch::channel(false);
                Self { tx: std::sync::Arc::new(tx), rx }
            }

            pub fn cancel(&self) {
                let _ = self.tx.send(true);
            }

            pub fn is_cancelled(&self) -> bool {
                *self.rx.borrow()
            }

            pub async fn cancelled(&self) {
                let mut rx = self.rx.clone();
                loop {
                    if *rx.borrow() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl Connection {
    pub fn new(id: String, remote_addr: String, write: WsSink) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote_addr,
            hostname: Mutex::new(String::new()),
            version: Mutex::new(String::new()),
            last_seen: AtomicI64::new(now_unix()),
            write: Mutex::new(write),
            reply_slots: DashMap::new(),
            stats: Mutex::new(ConnectionStats::default()),
            cancel: tokio_util::sync::CancellationToken::new(),
            pending_pong: Mutex::new(None),
        })
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ConnectionStats {
        *self.stats.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn hostname(&self) -> String {
        self.hostname.lock().clone()
    }

    pub fn version(&self) -> String {
        self.version.lock().clone()
    }

    /// Registers a reply slot for `req_id`, buffered to absorb a normal
    /// reply plus an eventual close without blocking the dispatcher.
    pub fn register_reply_slot(&self, req_id: &str) -> mpsc::Receiver<ResponsePayload> {
        let (tx, rx) = mpsc::channel(2);
        self.reply_slots.insert(req_id.to_string(), tx);
        rx
    }

    pub fn remove_reply_slot(&self, req_id: &str) {
        self.reply_slots.remove(req_id);
    }

    /// Serialises `frame` and writes it under the write mutex with a 10s
    /// deadline. The mutex is held only across this single write, never
    /// across an I/O wait elsewhere (§4.F invariant iv).
    pub async fn write_frame(&self, frame: &Frame) -> std::io::Result<()> {
        let json = serde_json::to_string(frame)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut sink = self.write.lock();
        let fut = sink.send(Message::Text(json.into()));
        match timeout(WRITE_DEADLINE, fut).await {
            Ok(Ok(())) => {
                self.stats.lock().messages_sent += 1;
                Ok(())
            }
            Ok(Err(e)) => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)),
            Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline exceeded")),
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Arms a one-shot waiter for the next `Message::Pong`, replacing any
    /// earlier one a timed-out ping left behind.
    fn arm_pong_waiter(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.pending_pong.lock() = Some(tx);
        rx
    }

    /// Called from the read loop when a `Message::Pong` arrives; wakes the
    /// ping loop's waiter, if one is armed.
    pub fn on_pong(&self) {
        if let Some(tx) = self.pending_pong.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// Spawns the read loop, ping loop, and performs registry/store bookkeeping
/// for a freshly admitted connection. Returns once the connection has fully
/// torn down (read loop exit).
pub async fn run_connection(
    conn: Arc<Connection>,
    mut read: futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    store: Arc<dyn AgentRepository>,
    binding: Arc<BindingStore>,
    unregister: mpsc::Sender<Arc<Connection>>,
) {
    let ping_conn = conn.clone();
    let ping_unregister = unregister.clone();
    tokio::spawn(async move { ping_loop(ping_conn, ping_unregister).await });

    loop {
        let next = timeout(READ_DEADLINE, read.next());
        let msg = match next.await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                tracing::warn!(agent_id = %conn.id, error = %e, "websocket read error");
                break;
            }
            Ok(None) => {
                tracing::info!(agent_id = %conn.id, "websocket closed by peer");
                break;
            }
            Err(_) => {
                tracing::warn!(agent_id = %conn.id, "read deadline exceeded");
                break;
            }
        };

        let raw: Option<String> = match msg {
            Message::Text(text) => Some(text.to_string()),
            Message::Binary(bytes) => match decompress(&bytes) {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::warn!(agent_id = %conn.id, error = %e, "gzip decompress failed");
                    None
                }
            },
            Message::Close(_) => break,
            Message::Pong(_) => {
                conn.on_pong();
                None
            }
            _ => None,
        };

        let Some(raw) = raw else { continue };

        let frame: Frame = match serde_json::from_str(&raw) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(agent_id = %conn.id, error = %e, "frame parse failed");
                continue;
            }
        };

        conn.last_seen.store(now_unix(), Ordering::Relaxed);
        conn.stats.lock().messages_recv += 1;

        let conn = conn.clone();
        let store = store.clone();
        let binding = binding.clone();
        let agent_id = conn.id.clone();
        tokio::spawn(async move {
            let outcome = std::panic::AssertUnwindSafe(dispatch_frame(conn, store, binding, frame))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                tracing::error!(agent_id = %agent_id, "frame dispatch panicked, frame dropped");
            }
        });
    }

    let _ = unregister.send(conn.clone()).await;
    conn.close();
}

async fn dispatch_frame(
    conn: Arc<Connection>,
    store: Arc<dyn AgentRepository>,
    binding: Arc<BindingStore>,
    frame: Frame,
) {
    match frame.frame_type {
        FrameType::Heartbeat => {
            let payload: HeartbeatPayload = match frame.payload_as() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(agent_id = %conn.id, error = %e, "bad heartbeat payload");
                    return;
                }
            };
            *conn.hostname.lock() = payload.hostname.clone();
            *conn.version.lock() = payload.version.clone();

            if let Err(e) = store.upsert_heartbeat(
                &conn.id,
                &payload.hostname,
                &payload.version,
                &conn.remote_addr,
                payload.hardware_fingerprint.clone(),
                now_unix(),
            ) {
                tracing::warn!(agent_id = %conn.id, error = %e, "heartbeat store update failed");
            }

            let ack = match Frame::new(
                format!("pong-{}", frame.id),
                FrameType::HeartbeatAck,
                "hub-server",
                serde_json::json!({}),
            ) {
                Ok(f) => f,
                Err(_) => return,
            };
            if let Err(e) = conn.write_frame(&ack).await {
                tracing::warn!(agent_id = %conn.id, error = %e, "heartbeat_ack send failed");
            }
        }

        FrameType::Metrics => {
            // Opaque line-oriented text forwarded to the metrics cache; the
            // cache itself is out of scope here (see MetricsStore §4.C),
            // this only validates the envelope shape.
            if let Err(e) = frame.payload_as::<hub_wire::MetricsPayload>() {
                tracing::warn!(agent_id = %conn.id, error = %e, "bad metrics payload");
            }
        }

        FrameType::Response => {
            let payload: ResponsePayload = match frame.payload_as() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(agent_id = %conn.id, error = %e, "bad response payload");
                    return;
                }
            };
            if let Some(slot) = conn.reply_slots.get(&payload.request_id) {
                let tx = slot.clone();
                drop(slot);
                if timeout(REPLY_SEND_DEADLINE, tx.send(payload)).await.is_err() {
                    tracing::warn!(agent_id = %conn.id, "reply slot send timed out, dropping");
                }
            } else {
                tracing::warn!(agent_id = %conn.id, request_id = %payload.request_id, "stray response, no matching slot");
            }
        }

        FrameType::Bind => {
            let payload: BindPayload = match frame.payload_as() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(agent_id = %conn.id, error = %e, "bad bind payload");
                    return;
                }
            };
            let result = binding.consume(&payload.token).and_then(|user_id| {
                store
                    .bind_owner(&conn.id, user_id)
                    .map_err(|e| crate::error::HubError::Internal(e.to_string()))
            });

            let result_payload = match &result {
                Ok(()) => BindResultPayload { success: true, error: None },
                Err(e) => BindResultPayload { success: false, error: Some(e.to_string()) },
            };
            if let Ok(reply) = Frame::new(
                format!("bind-result-{}", frame.id),
                FrameType::BindResult,
                "hub-server",
                result_payload,
            ) {
                if let Err(e) = conn.write_frame(&reply).await {
                    tracing::warn!(agent_id = %conn.id, error = %e, "bind_result send failed");
                }
            }
        }

        FrameType::HeartbeatAck | FrameType::Command | FrameType::BindResult => {
            tracing::warn!(agent_id = %conn.id, frame_type = ?frame.frame_type, "unexpected frame type from agent");
        }
    }
}

async fn ping_loop(conn: Arc<Connection>, unregister: mpsc::Sender<Arc<Connection>>) {
    let mut interval = tokio::time::interval(PING_PERIOD);
    interval.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let start = tokio::time::Instant::now();
        let pong_rx = conn.arm_pong_waiter();

        // Round-trip liveness: the ping write must complete AND the peer's
        // actual Pong must arrive, both within the deadline — a send that
        // completes against a half-open socket proves nothing by itself.
        let ping_and_wait = async {
            {
                let mut sink = conn.write.lock();
                sink.send(Message::Ping(Vec::new().into())).await.map_err(|_| ())?;
            }
            pong_rx.await.map_err(|_| ())
        };
        let result = timeout(PING_WRITE_DEADLINE, ping_and_wait).await;
        let latency = start.elapsed();

        let mut stats = conn.stats.lock();
        stats.ping_count += 1;

        match result {
            Ok(Ok(())) => {
                stats.pong_count += 1;
                stats.failure_count = 0;
                let sample = latency.as_secs_f64() * 1000.0;
                stats.avg_latency_ms = if stats.avg_latency_ms == 0.0 {
                    sample
                } else {
                    (stats.avg_latency_ms * 9.0 + sample) / 10.0
                };
                drop(stats);
                if latency > Duration::from_secs(5) {
                    tracing::warn!(agent_id = %conn.id, latency_ms = latency.as_millis(), "ping latency high");
                }
            }
            _ => {
                stats.failure_count += 1;
                drop(stats);
                tracing::warn!(agent_id = %conn.id, "ping failed or unacknowledged, unregistering connection");
                let _ = unregister.send(conn.clone()).await;
                return;
            }
        }
    }
}

fn decompress(bytes: &[u8]) -> std::io::Result<String> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
