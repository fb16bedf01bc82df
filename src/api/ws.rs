//! 部署进度 WebSocket
//!
//! GET {prefix}/ws/:id
//!
//! 连接后立即推送当前进度快照（未知部署为 `{"status":"unknown"}`），
//! 之后转发该部署的进度与生命周期事件；客户端发送 `ping` 时回复最新快照，
//! 空闲超过心跳间隔时发送 `{"type":"heartbeat"}`。

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::state::AppState;

/// 创建 WebSocket 路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws/:id", get(progress_websocket_handler))
}

async fn progress_websocket_handler(
    ws: WebSocketUpgrade,
    Path(deployment_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_progress_connection(socket, state, deployment_id))
}

/// 当前快照的 JSON 文本
async fn status_message(state: &AppState, deployment_id: &str) -> String {
    match state.progress.snapshot(deployment_id).await {
        Some(snapshot) => serde_json::to_string(&snapshot)
            .unwrap_or_else(|_| r#"{"status":"unknown"}"#.to_string()),
        None => r#"{"status":"unknown"}"#.to_string(),
    }
}

async fn handle_progress_connection(socket: WebSocket, state: Arc<AppState>, deployment_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // 先订阅再发快照，避免漏掉两者之间的事件
    let (subscriber_id, mut events) = state.subscribers.subscribe(&deployment_id).await;
    info!(deployment_id = %deployment_id, subscriber_id, "WebSocket subscriber connected");

    let initial = status_message(&state, &deployment_id).await;
    if ws_tx.send(Message::Text(initial)).await.is_err() {
        state.subscribers.unsubscribe(&deployment_id, subscriber_id).await;
        return;
    }

    let period = state.config.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat.reset();
                        if text.trim() == "ping" {
                            let reply = status_message(&state, &deployment_id).await;
                            if ws_tx.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        heartbeat.reset();
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => heartbeat.reset(),
                    Some(Err(e)) => {
                        debug!(deployment_id = %deployment_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }

            event = events.recv() => {
                match event {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // 发送队列积压被剔除
                    None => {
                        warn!(deployment_id = %deployment_id, subscriber_id, "Subscriber dropped by hub");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                let beat = r#"{"type":"heartbeat"}"#.to_string();
                if ws_tx.send(Message::Text(beat)).await.is_err() {
                    break;
                }
            }

            _ = state.shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.subscribers.unsubscribe(&deployment_id, subscriber_id).await;
    info!(deployment_id = %deployment_id, subscriber_id, "WebSocket subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

    use crate::services;
    use crate::services::events::spawn_relay;
    use crate::state::AppState;
    use crate::test_support::{self, FakeSource};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve(state: Arc<AppState>) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = super::super::router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn connect(port: u16, deployment_id: &str) -> Client {
        let url = format!("ws://127.0.0.1:{}/api/v1/ws/{}", port, deployment_id);
        let (client, _) = connect_async(url.as_str()).await.unwrap();
        client
    }

    async fn next_json(client: &mut Client) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_deployment_ping_and_heartbeat() {
        let (state, _dir) = test_support::state_with(FakeSource::instant(), |config| {
            config.heartbeat_interval = Duration::from_millis(300);
        });
        let port = serve(state.clone()).await;
        let mut client = connect(port, "missing").await;

        assert_eq!(next_json(&mut client).await["status"], "unknown");

        client.send(Message::Text("ping".to_string())).await.unwrap();
        assert_eq!(next_json(&mut client).await["status"], "unknown");

        assert_eq!(next_json(&mut client).await["type"], "heartbeat");
        assert_eq!(state.subscribers.subscriber_count("missing").await, 1);

        client.close(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(state.subscribers.subscriber_count("missing").await, 0);
    }

    #[tokio::test]
    async fn test_progress_streamed_until_completed() {
        let (state, _dir) = test_support::state(FakeSource::instant());
        let _relay = spawn_relay(&state);
        let port = serve(state.clone()).await;

        let mut client = connect(port, "d1").await;
        assert_eq!(next_json(&mut client).await["status"], "unknown");

        let request = serde_json::from_value(serde_json::json!({
            "model_id": "demo/model",
            "model_type": "nlp",
            "deployment_name": "d1"
        }))
        .unwrap();
        services::deploy::start(state.clone(), request).await.unwrap();

        let mut last_progress = 0;
        loop {
            let json = next_json(&mut client).await;
            if json.get("type").is_some() {
                continue;
            }
            let progress = json["progress"].as_u64().unwrap();
            assert!(progress >= last_progress);
            last_progress = progress;
            if json["status"] == "completed" {
                break;
            }
        }
        assert_eq!(last_progress, 100);

        client.send(Message::Text("ping".to_string())).await.unwrap();
        let json = next_json(&mut client).await;
        assert_eq!(json["status"], "completed");
        assert_eq!(json["completed_steps"], 6);

        state.shutdown().await;
    }
}
