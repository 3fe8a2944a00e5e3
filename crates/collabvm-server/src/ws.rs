//! WebSocket transport: admission, the read loop, and the writer task that
//! drains each connection's send queue.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use futures::{SinkExt, StreamExt};

use collabvm_proto::ClientMessage;

use crate::server::CollabVmServer;

pub fn build_router(server: Arc<CollabVmServer>) -> Router {
    Router::new()
        .route("/ws", any(ws_handler))
        .with_state(server)
}

async fn ws_handler(
    State(server): State<Arc<CollabVmServer>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(server, socket, addr))
}

async fn handle_socket(server: Arc<CollabVmServer>, socket: WebSocket, addr: SocketAddr) {
    let ip = addr.ip();
    if !server.pre_connect(ip).await {
        tracing::debug!(ip = %ip, "connection rejected by per-IP limit");
        return;
    }
    let (conn, mut outbound_rx) = server.register_connection(ip).await;
    let (mut sink, mut stream) = socket.split();

    // Writer: one write in flight per connection; frames queued while a
    // write was pending are flushed together as a batch.
    let writer_conn = Arc::clone(&conn);
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = outbound_rx.recv() => {
                    let Some(frame) = maybe else { break };
                    if sink.feed(Message::Binary(frame)).await.is_err() {
                        writer_conn.close();
                        break;
                    }
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if sink.feed(Message::Binary(frame)).await.is_err() {
                            writer_conn.close();
                            break;
                        }
                    }
                    if sink.flush().await.is_err() {
                        writer_conn.close();
                        break;
                    }
                }
                _ = writer_conn.wait_closed() => break,
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            maybe = stream.next() => {
                match maybe {
                    Some(Ok(Message::Binary(data))) => {
                        // Admin connections accept large frames (config
                        // updates); everyone else gets the bounded buffer.
                        let is_admin = conn.state.dispatch(|s| s.is_admin).await;
                        let decoded = if is_admin {
                            ClientMessage::from_bytes(&data)
                        } else {
                            ClientMessage::from_bytes_bounded(&data)
                        };
                        match decoded {
                            Ok(message) => server.handle_message(&conn, message).await,
                            Err(err) => {
                                tracing::debug!(connection = conn.id, error = %err,
                                    "closing connection on malformed frame");
                                break;
                            }
                        }
                    }
                    // The protocol is binary-only.
                    Some(Ok(Message::Text(_))) => break,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
            _ = conn.wait_closed() => break,
        }
    }

    server.disconnect(&conn).await;
    let _ = writer.await;
}
