//! Stateless signaling relay.
//!
//! Each websocket client announces itself with `advertise`; the relay
//! remembers which connection owns that hash and broadcasts the
//! advertisement to everyone else. Every other message is forwarded
//! verbatim to the connection registered for its `dest`.

use anyhow::Result;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use synapse::{SessionId, SignalMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct Client {
    conn: u64,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
pub struct RelayState {
    clients: DashMap<SessionId, Client>,
    next_conn: AtomicU64,
}

impl RelayState {
    fn dispatch(&self, conn: u64, tx: &mpsc::UnboundedSender<String>, text: &str, owned: &mut Vec<SessionId>) {
        let signal: SignalMessage = match serde_json::from_str(text) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(conn, "dropping malformed signal: {e}");
                return;
            }
        };

        match &signal {
            SignalMessage::Advertise { hash } => {
                info!(conn, peer = %hash, "advertise");
                self.clients.insert(
                    hash.clone(),
                    Client {
                        conn,
                        tx: tx.clone(),
                    },
                );
                if !owned.contains(hash) {
                    owned.push(hash.clone());
                }
                for client in self.clients.iter() {
                    if client.key() != hash {
                        let _ = client.tx.send(text.to_string());
                    }
                }
            }
            _ => {
                let Some(dest) = signal.dest() else {
                    return;
                };
                match self.clients.get(dest) {
                    Some(client) => {
                        let _ = client.tx.send(text.to_string());
                    }
                    None => debug!(conn, %dest, "no client registered for destination"),
                }
            }
        }
    }

    /// Forgets the hashes a closed connection registered, unless another
    /// connection has re-advertised them since.
    fn disconnect(&self, conn: u64, owned: &[SessionId]) {
        for hash in owned {
            if self.clients.remove_if(hash, |_, client| client.conn == conn).is_some() {
                info!(conn, peer = %hash, "client left");
            }
        }
    }
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(upgrade))
        .with_state(state)
}

pub async fn run_relay(port: u16) -> Result<()> {
    let app = router(Arc::new(RelayState::default()));
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Relay active: ws://localhost:{}/ws", port);
    axum::Server::bind(&addr).serve(app.into_make_service()).await?;
    Ok(())
}

async fn index(State(state): State<Arc<RelayState>>) -> Html<String> {
    Html(format!(
        r#"<div style="font-family: sans-serif; padding: 2rem;">
            <h1>Swarm Relay</h1>
            <p><strong>Registered peers:</strong> {}</p>
            <p>Connect a node to <code>/ws</code>.</p>
        </div>"#,
        state.clients.len()
    ))
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve(socket, state))
}

async fn serve(socket: WebSocket, state: Arc<RelayState>) {
    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    debug!(conn, "client connected");
    let mut owned = Vec::new();
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => state.dispatch(conn, &tx, &text, &mut owned),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn, "socket error: {e}");
                break;
            }
        }
    }

    state.disconnect(conn, &owned);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse::SessionDescription;

    fn client() -> (mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>) {
        mpsc::unbounded_channel()
    }

    fn text(signal: &SignalMessage) -> String {
        serde_json::to_string(signal).unwrap()
    }

    #[test]
    fn test_advertise_broadcasts_and_offers_route() {
        let relay = RelayState::default();
        let (a_tx, mut a_rx) = client();
        let (b_tx, mut b_rx) = client();
        let (mut a_owned, mut b_owned) = (Vec::new(), Vec::new());

        relay.dispatch(0, &a_tx, &text(&SignalMessage::Advertise { hash: "h1".into() }), &mut a_owned);
        assert!(a_rx.try_recv().is_err());

        let advertise = text(&SignalMessage::Advertise { hash: "h2".into() });
        relay.dispatch(1, &b_tx, &advertise, &mut b_owned);
        assert_eq!(a_rx.try_recv().unwrap(), advertise);
        assert!(b_rx.try_recv().is_err());

        let offer = text(&SignalMessage::Offer {
            offer: SessionDescription::offer("v=0"),
            src: "h1".into(),
            dest: "h2".into(),
        });
        relay.dispatch(0, &a_tx, &offer, &mut a_owned);
        assert_eq!(b_rx.try_recv().unwrap(), offer);

        // Unknown destinations and junk are dropped.
        let lost = text(&SignalMessage::Answer {
            answer: SessionDescription::answer("v=0"),
            src: "h2".into(),
            dest: "h9".into(),
        });
        relay.dispatch(1, &b_tx, &lost, &mut b_owned);
        relay.dispatch(1, &b_tx, "not json", &mut b_owned);
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_keeps_newer_registration() {
        let relay = RelayState::default();
        let (old_tx, _old_rx) = client();
        let (new_tx, _new_rx) = client();
        let mut old_owned = Vec::new();
        let mut new_owned = Vec::new();
        let advertise = text(&SignalMessage::Advertise { hash: "h1".into() });

        relay.dispatch(0, &old_tx, &advertise, &mut old_owned);
        relay.dispatch(1, &new_tx, &advertise, &mut new_owned);
        relay.disconnect(0, &old_owned);
        assert_eq!(relay.clients.get(&SessionId::from("h1")).map(|c| c.conn), Some(1));

        relay.disconnect(1, &new_owned);
        assert!(relay.clients.is_empty());
    }
}
