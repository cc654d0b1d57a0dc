//! S5: an agent that presents a freshly generated binding token over its
//! socket gets claimed for the issuing user, end to end through
//! `run_connection`'s frame dispatch.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hub_core::binding::BindingStore;
use hub_core::hub::connection::{run_connection, Connection};
use hub_core::store::memory::MemoryStore;
use hub_core::store::AgentRepository;
use hub_wire::{BindPayload, BindResultPayload, Frame, FrameType};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

async fn agent_pair(id: &str) -> (Arc<Connection>, WebSocketStream<MaybeTlsStream<TcpStream>>, futures_util::stream::SplitStream<WebSocketStream<TcpStream>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    });

    let (agent_ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
    let hub_ws = server_task.await.unwrap();

    let (write, read) = hub_ws.split();
    let conn = Connection::new(id.to_string(), addr.to_string(), write);
    (conn, agent_ws, read)
}

#[tokio::test]
async fn a_valid_bind_token_claims_the_agent_for_its_issuing_user() {
    let store: Arc<dyn AgentRepository> = Arc::new(MemoryStore::new());
    store.upsert_heartbeat("A1", "host", "1.0", "127.0.0.1:0", None, 0).unwrap();

    let binding = Arc::new(BindingStore::new());
    let token = binding.generate(42);

    let (conn, mut agent_ws, read) = agent_pair("A1").await;
    let (unregister_tx, mut unregister_rx) = mpsc::channel(4);

    let driver = {
        let store = store.clone();
        let binding = binding.clone();
        tokio::spawn(async move { run_connection(conn, read, store, binding, unregister_tx).await })
    };

    let bind_frame = Frame::new("bind-1", FrameType::Bind, "A1", BindPayload { token }).unwrap();
    agent_ws.send(Message::Text(serde_json::to_string(&bind_frame).unwrap().into())).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), agent_ws.next()).await.unwrap().unwrap().unwrap();
    let reply_frame: Frame = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply_frame.frame_type, FrameType::BindResult);
    let result: BindResultPayload = reply_frame.payload_as().unwrap();
    assert!(result.success, "bind should succeed: {:?}", result.error);

    let agent = store.get("A1").unwrap().unwrap();
    assert!(agent.bound);
    assert_eq!(agent.user_id, 42);

    agent_ws.send(Message::Close(None)).await.ok();
    let _ = tokio::time::timeout(Duration::from_secs(5), unregister_rx.recv()).await;
    driver.abort();
}

#[tokio::test]
async fn an_unknown_token_is_rejected_and_leaves_the_agent_unbound() {
    let store: Arc<dyn AgentRepository> = Arc::new(MemoryStore::new());
    store.upsert_heartbeat("A2", "host", "1.0", "127.0.0.1:0", None, 0).unwrap();

    let binding = Arc::new(BindingStore::new());

    let (conn, mut agent_ws, read) = agent_pair("A2").await;
    let (unregister_tx, mut unregister_rx) = mpsc::channel(4);

    let driver = {
        let store = store.clone();
        let binding = binding.clone();
        tokio::spawn(async move { run_connection(conn, read, store, binding, unregister_tx).await })
    };

    let bind_frame = Frame::new("bind-1", FrameType::Bind, "A2", BindPayload { token: "deadbe".into() }).unwrap();
    agent_ws.send(Message::Text(serde_json::to_string(&bind_frame).unwrap().into())).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), agent_ws.next()).await.unwrap().unwrap().unwrap();
    let reply_frame: Frame = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    let result: BindResultPayload = reply_frame.payload_as().unwrap();
    assert!(!result.success);

    let agent = store.get("A2").unwrap().unwrap();
    assert!(!agent.bound);

    agent_ws.send(Message::Close(None)).await.ok();
    let _ = tokio::time::timeout(Duration::from_secs(5), unregister_rx.recv()).await;
    driver.abort();
}
