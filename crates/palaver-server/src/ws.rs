use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;

use palaver_core::envelope::ClientPayload;
use palaver_core::{EngineError, ServerEnvelope};
use palaver_engine::{Session, SessionKind};

use crate::app::App;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Client-facing routes: the WebSocket endpoint and a health probe.
pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(app)
        .layer(CorsLayer::permissive())
}

/// Serve until `shutdown` resolves, then drain the app.
pub async fn serve(
    app: Arc<App>,
    listener: tokio::net::TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "listening for clients");
    axum::serve(listener, router(Arc::clone(&app)))
        .with_graceful_shutdown(shutdown)
        .await?;
    app.shutdown().await;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(app): State<Arc<App>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn health_handler(State(app): State<Arc<App>>) -> impl IntoResponse {
    let mut status = serde_json::json!({
        "status": "ok",
        "topics": app.hub.topic_count(),
        "sessions": app.sessions.local_count(),
    });
    if let Some(cluster) = &app.cluster {
        status["node"] = serde_json::json!(cluster.node());
        status["ring"] = serde_json::json!(cluster.ring_signature().to_string());
        status["leader"] = serde_json::json!(cluster.is_leader());
    }
    Json(status)
}

/// One client connection: a writer task drains the session's outbound
/// queue and pings on an interval; the reader decodes frames into the
/// session's dispatch path. Either side failing tears the session down.
async fn handle_socket(socket: WebSocket, app: Arc<App>) {
    let (sess, mut rx) = Session::new(SessionKind::Websocket, app.hub.config().send_queue);
    app.sessions.add(Arc::clone(&sess));
    tracing::info!(sid = %sess.id, "client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_sid = sess.id.clone();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                env = rx.recv() => {
                    let Some(env) = env else { break };
                    let text = match serde_json::to_string(&env) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(sid = %writer_sid, error = %e, "unserializable envelope");
                            continue;
                        }
                    };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let reader_sess = Arc::clone(&sess);
    let reader_app = Arc::clone(&app);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let payload: ClientPayload = match serde_json::from_str(&text) {
                        Ok(payload) => payload,
                        Err(e) => {
                            let err = EngineError::Malformed(e.to_string());
                            reader_sess.queue_out(ServerEnvelope::ctrl_err(None, "", &err));
                            continue;
                        }
                    };
                    reader_sess.dispatch(payload, &reader_app.hub).await;
                }
                WsMessage::Close(_) => break,
                // axum answers pings itself; pongs need no bookkeeping
                // because a dead link surfaces as a writer error.
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    tracing::info!(sid = %sess.id, "client disconnected");
    app.sessions.evict(&sess.id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[tokio::test]
    async fn router_builds_with_default_app() {
        let app = App::start(ServerConfig::default()).await.unwrap();
        let _router = router(Arc::clone(&app));
        app.shutdown().await;
    }
}
