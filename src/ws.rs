//! NIP-01 WebSocket transport.
//!
//! Each connection runs two tasks: the inbound loop handles requests one at a
//! time, and the outbound loop drains the connection's outbox to the socket and
//! sends heartbeat pings. They share nothing but the outbox and the
//! connection's lifecycle state.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
    time::{interval_at, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnState, Connection},
    message::RelayMessage,
    relay::Relay,
};

/// Bind `addr` and serve WebSocket clients until `shutdown` resolves.
pub async fn serve_ws(
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, relay, shutdown).await
}

/// Serve WebSocket clients on an already bound listener.
pub async fn serve_on(
    listener: TcpListener,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = Router::new().route("/", get(handler)).with_state(relay);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// Complete the upgrade handshake and hand the socket to the connection tasks.
async fn handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(relay): State<Arc<Relay>>,
) -> impl IntoResponse {
    let max = relay.limits().max_message_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| process(socket, relay, addr))
}

/// Run one connection from open to closed.
async fn process(socket: WebSocket, relay: Arc<Relay>, addr: SocketAddr) {
    let (conn, outbox) = relay.connect(addr.to_string());
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbox, conn.clone(), relay.clone()));
    read_loop(stream, &relay, &conn).await;
    conn.begin_close();
    if let Err(e) = writer.await {
        warn!(conn = conn.id(), error = %e, "outbound task failed");
    }
    relay.disconnect(&conn);
}

/// Resolve once the connection starts closing.
async fn closing(state: &mut watch::Receiver<ConnState>) {
    loop {
        if *state.borrow_and_update() >= ConnState::Closing {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// Read frames and handle requests in order until the peer leaves, goes idle,
/// or the connection is closed from elsewhere.
async fn read_loop(mut stream: SplitStream<WebSocket>, relay: &Relay, conn: &Arc<Connection>) {
    let limits = relay.limits();
    let mut state = conn.watch_state();
    loop {
        let frame = tokio::select! {
            frame = timeout(limits.idle_timeout, stream.next()) => frame,
            _ = closing(&mut state) => break,
        };
        let text = match frame {
            Err(_) => {
                info!(conn = conn.id(), "idle timeout");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                warn!(conn = conn.id(), error = %e, "websocket error");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(Message::Binary(bytes)))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    let notice =
                        RelayMessage::Notice("binary frames must be UTF-8 JSON".into());
                    if conn.reply(notice, limits.write_timeout).await.is_err() {
                        break;
                    }
                    continue;
                }
            },
            // pings and pongs only refresh the idle window
            Ok(Some(Ok(_))) => continue,
        };
        if let Err(e) = relay.handle_text(conn, &text).await {
            warn!(conn = conn.id(), peer = conn.peer(), "{e}; dropping connection");
            break;
        }
    }
}

/// Drain the outbox to the socket and send heartbeat pings.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::Receiver<RelayMessage>,
    conn: Arc<Connection>,
    relay: Arc<Relay>,
) {
    let limits = relay.limits();
    let mut state = conn.watch_state();
    let mut heartbeat = interval_at(
        Instant::now() + limits.ping_interval,
        limits.ping_interval,
    );
    loop {
        let frame = tokio::select! {
            msg = outbox.recv() => match msg {
                Some(msg) => match msg.to_json() {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        warn!(conn = conn.id(), error = %e, "failed to encode message");
                        continue;
                    }
                },
                None => break,
            },
            _ = heartbeat.tick() => Message::Ping(Vec::new()),
            _ = closing(&mut state) => break,
        };
        match timeout(limits.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn = conn.id(), error = %e, "write failed");
                break;
            }
            Err(_) => {
                warn!(conn = conn.id(), "write timed out");
                break;
            }
        }
    }
    conn.begin_close();
    outbox.close();
    let _ = timeout(limits.write_timeout, sink.send(Message::Close(None))).await;
}
