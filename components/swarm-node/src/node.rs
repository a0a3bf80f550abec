use crate::api;
use crate::config::NodeConfig;
use crate::types::AppState;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use hive::{PoolConfig, SystemProbe, UnitFactory, WorkerPool};
use judge::{ExecutionUnit, Judge};
use std::sync::Arc;
use synapse::transport::{TcpConfig, TcpTransportFactory};
use synapse::{Identity, Mesh, MeshConfig, SignalMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

pub async fn run_node(config: NodeConfig) -> Result<()> {
    let identity = Identity::load_or_generate(&config.identity_path)
        .with_context(|| format!("identity at {}", config.identity_path.display()))?;
    let local = identity.session_id();

    let factory: UnitFactory = Arc::new(|| Box::new(Judge::with_builtins()) as Box<dyn ExecutionUnit>);
    let pool_config = PoolConfig {
        size: config.workers,
        task_timeout: config.task_timeout,
        ..PoolConfig::default()
    };
    let pool = Arc::new(WorkerPool::with_probe(
        pool_config,
        factory,
        Arc::new(SystemProbe::new(&config.storage_path)),
    )?);

    let (outbound, inbound) = connect_relay(&config.relay_url).await?;

    let transports = Arc::new(TcpTransportFactory::new(TcpConfig {
        bind: config.bind,
        advertise: config.advertise.clone(),
    }));
    let (mesh, handle) = Mesh::new(local.clone(), MeshConfig::default(), transports, pool.clone(), outbound);
    let mesh_task = tokio::spawn(mesh.run(inbound));

    let state = Arc::new(AppState {
        mesh: handle.clone(),
        pool: pool.clone(),
    });
    let app = api::router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.http_port));
    info!(id = %local, "Node Active: http://localhost:{}", config.http_port);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    handle.shutdown();
    let _ = mesh_task.await;
    pool.shutdown();
    Ok(())
}

/// Opens the relay websocket and bridges it to a pair of signal channels.
/// The inbound channel closes when the relay connection drops.
async fn connect_relay(
    url: &str,
) -> Result<(
    mpsc::UnboundedSender<SignalMessage>,
    mpsc::UnboundedReceiver<SignalMessage>,
)> {
    let (socket, _) = connect_async(url)
        .await
        .with_context(|| format!("connecting to relay {url}"))?;
    info!(%url, "relay connected");
    let (mut sink, mut stream) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalMessage>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalMessage>();

    tokio::spawn(async move {
        while let Some(signal) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&signal) {
                Ok(text) => text,
                Err(e) => {
                    warn!("cannot encode signal: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                warn!("relay write failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(signal) => {
                        if inbound_tx.send(signal).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("ignoring relay frame: {e}"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("relay read failed: {e}");
                    break;
                }
            }
        }
        info!("relay disconnected");
    });

    Ok((outbound_tx, inbound_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay;
    use std::time::Duration;
    use synapse::SessionId;

    #[tokio::test]
    async fn test_relay_bridge_round_trip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = relay::router(Arc::new(relay::RelayState::default()));
        let server = axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service());
        tokio::spawn(server);

        let url = format!("ws://127.0.0.1:{port}/ws");
        let (a_out, mut a_in) = connect_relay(&url).await.unwrap();
        let (b_out, mut b_in) = connect_relay(&url).await.unwrap();

        a_out.send(SignalMessage::Advertise { hash: "a".into() }).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        b_out.send(SignalMessage::Advertise { hash: "b".into() }).unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(5), a_in.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, SignalMessage::Advertise { hash: "b".into() });

        let candidate = SignalMessage::Candidate {
            src: SessionId::from("a"),
            dest: SessionId::from("b"),
            candidate: synapse::IceCandidate::new("candidate:1 1 tcp 127.0.0.1 9 typ host"),
        };
        a_out.send(candidate.clone()).unwrap();
        let routed = tokio::time::timeout(Duration::from_secs(5), b_in.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(routed, candidate);
    }
}
