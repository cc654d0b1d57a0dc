//! S6: a second connection registering under an agent id already present
//! in the registry closes the first and takes over the slot, and a stale
//! unregister from the superseded connection must not evict its successor.

use std::sync::Arc;

use futures_util::StreamExt;
use hub_core::hub::connection::Connection;
use hub_core::hub::registry::Registry;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

async fn agent_pair(id: &str) -> (Arc<Connection>, WebSocketStream<MaybeTlsStream<TcpStream>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    });

    let (agent_ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
    let hub_ws = server_task.await.unwrap();

    let (write, _read) = hub_ws.split();
    let conn = Connection::new(id.to_string(), addr.to_string(), write);
    (conn, agent_ws)
}

#[tokio::test]
async fn a_second_registration_closes_the_first_and_takes_the_slot() {
    let registry: Arc<Registry<Connection>> = Arc::new(Registry::new());

    let (first, _first_agent) = agent_pair("A1").await;
    registry.insert("A1".into(), first.clone());

    let (second, _second_agent) = agent_pair("A1").await;
    registry.insert("A1".into(), second.clone());

    assert!(first.is_cancelled(), "the superseded connection must be closed");
    assert!(!second.is_cancelled());
    assert_eq!(registry.len(), 1);

    let current = registry.get("A1").unwrap();
    assert!(Arc::ptr_eq(&current, &second));
}

#[tokio::test]
async fn a_stale_unregister_from_the_superseded_connection_does_not_evict_its_successor() {
    let registry: Arc<Registry<Connection>> = Arc::new(Registry::new());

    let (first, _first_agent) = agent_pair("A1").await;
    registry.insert("A1".into(), first.clone());

    let (second, _second_agent) = agent_pair("A1").await;
    registry.insert("A1".into(), second.clone());

    // The stale unregister carries the superseded `Arc<Connection>` — it
    // must be rejected, leaving the successor in place.
    assert!(!registry.remove_if_same("A1", &first));
    assert_eq!(registry.len(), 1);
    assert!(registry.get("A1").is_some());

    assert!(registry.remove_if_same("A1", &second));
    assert!(registry.is_empty());
}
