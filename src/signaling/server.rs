use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::actor::{RoomHandle, RoomRouterHandle};
use super::messages::ClientMessage;
use super::types::{ConnectionId, Outbound, RoomId, SignalingError};
use crate::config::Config;

pub const DEFAULT_SIGNALING_PORT: u16 = 3479;
pub const HEALTH_PATH: &str = "/health";
const HEALTH_ROOM_COUNT_TIMEOUT: Duration = Duration::from_millis(50);

/// Per-connection transport settings
#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    ping_interval: Duration,
    pong_timeout: Duration,
    max_message_bytes: usize,
}

#[derive(Clone)]
struct AppState {
    router: RoomRouterHandle,
    settings: ConnectionSettings,
}

pub struct SignalingServer {
    listener: TcpListener,
    app: Router,
}

impl SignalingServer {
    /// Bind the listener and start the room router.
    pub async fn bind(config: &Config) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        info!("Signaling server listening on {}", listener.local_addr()?);

        let state = AppState {
            router: RoomRouterHandle::spawn(),
            settings: ConnectionSettings {
                ping_interval: config.ping_interval(),
                pong_timeout: config.pong_timeout(),
                max_message_bytes: config.max_message_bytes,
            },
        };

        Ok(Self {
            listener,
            app: app(state),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> std::io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. Upgraded connections are not waited on.
    pub async fn run_until<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(
            self.listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }
}

fn app(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route("/room/:room_id", any(room_upgrade))
        .fallback(not_found)
        .with_state(state)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    rooms: Option<usize>,
}

/// Always 200. The room count is best effort and omitted if the router is slow.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let rooms = tokio::time::timeout(HEALTH_ROOM_COUNT_TIMEOUT, state.router.room_count())
        .await
        .ok()
        .and_then(Result::ok);
    (
        StatusCode::OK,
        Json(Health {
            status: "ok",
            rooms,
        }),
    )
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

async fn room_upgrade(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!("Rejecting non-upgrade request from {}: {}", addr, rejection);
            return (StatusCode::UPGRADE_REQUIRED, "Expected WebSocket upgrade").into_response();
        }
    };

    let room = RoomId::from(room_id);
    let max = state.settings.max_message_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| async move {
            if let Err(e) = handle_connection(socket, addr, room, state).await {
                warn!("Connection error from {}: {}", addr, e);
            }
        })
}

async fn handle_connection(
    socket: WebSocket,
    addr: SocketAddr,
    room: RoomId,
    state: AppState,
) -> Result<(), SignalingError> {
    let conn = ConnectionId::generate();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

    let room = state.router.attach(room, conn, tx).await?;
    info!(
        "WebSocket connection {} from {} in room {}",
        conn,
        addr,
        room.room()
    );

    let settings = state.settings;
    let mut ping_interval = tokio::time::interval(settings.ping_interval);
    // the first tick completes immediately
    ping_interval.tick().await;
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(out) = rx.recv() => {
                    match out {
                        Outbound::Text(msg) => {
                            if ws_tx.send(Message::Text(msg.as_str().to_owned())).await.is_err() {
                                break;
                            }
                        }
                        Outbound::Close => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    if ws_tx.send(ctrl_msg).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    loop {
        let pong_timeout = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("No Pong received, disconnecting {}", conn);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(tokio::time::Instant::now() + settings.pong_timeout);
                debug!("Ping sent to {}", conn);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", conn);
                break;
            }

            _ = &mut send_task => {
                debug!("Writer for {} finished", conn);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error on {}: {}", conn, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        if let Err(e) = handle_text_message(&text, conn, &room) {
                            debug!("Stopping {}: {}", conn, e);
                            break;
                        }
                    }
                    Message::Binary(data) => {
                        debug!("Dropping {} byte binary frame from {}", data.len(), conn);
                    }
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from {}", conn);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", conn);
                        break;
                    }
                    Message::Ping(_) => {}
                }
            }
        }
    }

    room.close(conn);
    send_task.abort();
    info!("WebSocket disconnected: {} ({})", conn, addr);

    Ok(())
}

/// Malformed frames are dropped; only a closed room ends the connection.
fn handle_text_message(
    text: &str,
    conn: ConnectionId,
    room: &RoomHandle,
) -> Result<(), SignalingError> {
    match ClientMessage::parse(text) {
        Ok(msg) => room.dispatch(conn, msg),
        Err(e) => {
            debug!("Dropping malformed frame from {}: {}", conn, e);
            Ok(())
        }
    }
}
