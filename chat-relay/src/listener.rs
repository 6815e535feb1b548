//! Accept loops for both transports.
//!
//! Each accepted transport is wrapped in a [`Connection`] and handed to the
//! server as [`Event::NewConnection`]. Nothing is read here; the server
//! starts the reader loop once the client is registered.

use std::{net::SocketAddr, time::Duration};

use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
};
use tokio::{net::TcpListener, sync::mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{connection::Connection, event::Event};

pub async fn accept_tcp(
    listener: TcpListener,
    events: mpsc::Sender<Event>,
    write_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let connection = Connection::from_stream(stream, peer, write_timeout);
                info!(%peer, connection = %connection.id(), "accepted tcp connection");
                if events.send(Event::NewConnection(connection)).await.is_err() {
                    debug!("server stopped; tcp listener exiting");
                    return;
                }
            }
            Err(err) => warn!(error = ?err, "failed to accept tcp connection"),
        }
    }
}

#[derive(Clone)]
struct UpgradeState {
    events: mpsc::Sender<Event>,
    write_timeout: Duration,
}

/// Serves WebSocket upgrades on every path until the task is dropped.
pub async fn serve_websocket(
    listener: TcpListener,
    events: mpsc::Sender<Event>,
    write_timeout: Duration,
) -> std::io::Result<()> {
    let app = Router::new()
        .fallback(upgrade)
        .layer(TraceLayer::new_for_http())
        .with_state(UpgradeState {
            events,
            write_timeout,
        });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn upgrade(
    State(state): State<UpgradeState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(%peer, error = %rejection, "failed to upgrade to websocket");
            return rejection.into_response();
        }
    };

    ws.on_failed_upgrade(move |err: axum::Error| {
        warn!(%peer, error = %err, "websocket handshake failed");
    })
    .on_upgrade(move |socket| register_websocket(socket, peer, state))
}

async fn register_websocket(socket: WebSocket, peer: SocketAddr, state: UpgradeState) {
    let connection = Connection::from_websocket(socket, peer, state.write_timeout);
    info!(%peer, connection = %connection.id(), "accepted websocket connection");
    if state
        .events
        .send(Event::NewConnection(connection))
        .await
        .is_err()
    {
        debug!(%peer, "server stopped; dropping websocket connection");
    }
}
