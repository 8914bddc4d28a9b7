use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use once_cell::sync::OnceCell;
use salvo::prelude::*;
use tracing::info;

use crate::bridge::BridgeCore;
use crate::config::Config;

pub mod handlers;
pub mod middleware;

use self::handlers::appservice::{push_transaction, query_room, query_user};
use self::handlers::health::{get_status, health_check};
use self::middleware::auth::authorize;

#[derive(Clone)]
pub struct WebState {
    pub bridge: Arc<BridgeCore>,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

pub fn web_state() -> &'static WebState {
    WEB_STATE
        .get()
        .expect("web state is not initialized before handler execution")
}

/// The endpoints the homeserver pushes to, all behind homeserver-token auth.
/// Mounted twice: under the current `/_matrix/app/v1` prefix and at the root
/// for homeservers still speaking the legacy appservice API.
fn appservice_routes() -> Router {
    Router::new()
        .hoop(authorize)
        .push(Router::with_path("transactions/{txn_id}").put(push_transaction))
        .push(Router::with_path("users/{user_id}").get(query_user))
        .push(Router::with_path("rooms/{room_alias}").get(query_room))
}

pub fn create_router() -> Router {
    Router::new()
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("status").get(get_status))
        .push(Router::with_path("_matrix/app/v1").push(appservice_routes()))
        .push(appservice_routes())
}

#[derive(Clone)]
pub struct WebServer {
    config: Arc<Config>,
}

impl WebServer {
    pub fn new(config: Arc<Config>, bridge: Arc<BridgeCore>) -> Result<Self> {
        let _ = WEB_STATE.set(WebState {
            bridge,
            started_at: Instant::now(),
        });

        Ok(Self { config })
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.config.bridge.bind_address, self.config.bridge.port
        );
        info!("Starting appservice endpoint on {}", bind_addr);

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor).serve(create_router()).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    use super::*;
    use crate::db::{DatabaseManager, NewChannel};
    use crate::message::MessageEvent;

    async fn start_test_server() -> (String, mpsc::Receiver<crate::message::CommonMessage>) {
        let file = tempfile::NamedTempFile::new().expect("temp sqlite file");
        let db_path = file.path().to_string_lossy().to_string();
        std::mem::forget(file);
        let config = crate::bridge::tests::test_config("http://localhost:8008", &db_path);
        let db = DatabaseManager::new(&config.database)
            .await
            .expect("db manager");
        db.migrate().await.expect("migrate");
        db.channel_store()
            .create(&NewChannel {
                remote_name: "general".to_string(),
                matrix_room_id: "!room:localhost".to_string(),
                is_direct: false,
                remote_id: "#general".to_string(),
            })
            .await
            .expect("seed channel");

        let (tx, rx) = mpsc::channel(16);
        let bridge = Arc::new(BridgeCore::new(config.clone(), db, tx).expect("bridge core"));
        bridge.cache_display_name("@alice:localhost", "alice");
        let _ = WEB_STATE.set(WebState {
            bridge,
            started_at: Instant::now(),
        });

        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe port");
        let port = probe.local_addr().expect("probe addr").port();
        drop(probe);
        let acceptor = TcpListener::new(format!("127.0.0.1:{port}")).bind().await;
        tokio::spawn(async move {
            Server::new(acceptor).serve(create_router()).await;
        });
        (format!("http://127.0.0.1:{port}"), rx)
    }

    // One test covers the endpoint surface: the handler state is a
    // process-wide singleton, so splitting these into separate tests would
    // have them fight over it.
    #[tokio::test]
    async fn transaction_endpoint_authenticates_and_relays() {
        let (base, mut rx) = start_test_server().await;
        let http = reqwest::Client::new();

        // Wrong token is refused.
        let resp = http
            .put(format!("{base}/transactions/1?access_token=wrong"))
            .json(&serde_json::json!({ "events": [] }))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), 403);

        // Malformed body is a client error.
        let resp = http
            .put(format!("{base}/transactions/2?access_token=hs-secret"))
            .body("not json")
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), 400);

        // A valid transaction acks immediately and the event reaches the
        // gateway channel.
        let body = serde_json::json!({
            "events": [{
                "type": "m.room.message",
                "event_id": "$ev1",
                "room_id": "!room:localhost",
                "sender": "@alice:localhost",
                "origin_server_ts": chrono::Utc::now().timestamp_millis(),
                "content": { "msgtype": "m.text", "body": "over http" },
            }],
        });
        let resp = http
            .put(format!(
                "{base}/_matrix/app/v1/transactions/3?access_token=hs-secret"
            ))
            .json(&body)
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), 200);

        let msg = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("message within deadline")
            .expect("channel open");
        assert_eq!(msg.text, "over http");
        assert_eq!(msg.event, MessageEvent::Text);

        // Existence queries answer from the identity store.
        let resp = http
            .get(format!("{base}/rooms/%23general?access_token=hs-secret"))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), 200);
        let resp = http
            .get(format!("{base}/rooms/%23missing?access_token=hs-secret"))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), 404);

        let resp = http
            .get(format!(
                "{base}/users/@_irc_bridge_bob_xyz:localhost?access_token=hs-secret"
            ))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), 200);
        let resp = http
            .get(format!("{base}/users/@someone:localhost?access_token=hs-secret"))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), 404);

        let resp = http
            .get(format!("{base}/health"))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), 200);
    }
}
