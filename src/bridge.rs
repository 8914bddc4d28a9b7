use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{DatabaseError, DatabaseManager};
use crate::matrix::{MatrixApiError, MatrixClient, RateLimiter};
use crate::media::MediaHandler;
use crate::message::{CommonMessage, RemoteProtocol};

pub mod channels;
pub mod inbound;
pub mod mentions;
pub mod outbound;
pub mod protocol;
pub mod users;

pub use self::inbound::MatrixEvent;
pub use self::protocol::{adapter_for, ProtocolAdapter};

const NAME_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Api(#[from] MatrixApiError),
    #[error("user {0} does not exist in the appservice database")]
    UserNotFound(String),
    #[error("channel {0} does not exist in the appservice database")]
    ChannelNotFound(String),
}

struct NameCacheEntry {
    display_name: String,
    last_updated: Instant,
}

/// The appservice core: owns the identity store handles, the bot client, the
/// in-memory room index and display-name cache, and the single rate-limit
/// gate every outbound homeserver call goes through.
pub struct BridgeCore {
    config: Arc<Config>,
    db: DatabaseManager,
    bot: MatrixClient,
    limiter: RateLimiter,
    media: MediaHandler,
    gateway_tx: mpsc::Sender<CommonMessage>,
    /// Matrix room id -> remote channel id. Fast-path index over the channel
    /// table; rebuilt at startup, updated on every mapping write.
    room_map: RwLock<HashMap<String, String>>,
    name_cache: RwLock<HashMap<String, NameCacheEntry>>,
    remote_protocol: RwLock<Option<RemoteProtocol>>,
    /// Username of the operator on the remote network, learned from
    /// membership sync traffic; used to route mentions at the main user.
    remote_username: RwLock<String>,
    avatar_url: RwLock<Option<String>>,
}

impl BridgeCore {
    pub fn new(
        config: Arc<Config>,
        db: DatabaseManager,
        gateway_tx: mpsc::Sender<CommonMessage>,
    ) -> Result<Self, BridgeError> {
        let bot = MatrixClient::new(
            &config.bridge.homeserver_url,
            config.registration.appservice_token.clone().into(),
        )?;
        Ok(Self {
            config,
            db,
            bot,
            limiter: RateLimiter::new(),
            media: MediaHandler::new(),
            gateway_tx,
            room_map: RwLock::new(HashMap::new()),
            name_cache: RwLock::new(HashMap::new()),
            remote_protocol: RwLock::new(None),
            remote_username: RwLock::new(String::new()),
            avatar_url: RwLock::new(None),
        })
    }

    /// Restore persisted state and warm the in-memory indexes. Called once at
    /// startup before the web server starts feeding transactions in.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let prefix = &self.config.bridge.account_prefix;
        let info = self.db.info_store().ensure(prefix).await?;

        *self.avatar_url.write() = info.avatar_url.clone();
        let persisted = info
            .remote_protocol
            .as_deref()
            .and_then(|s| s.parse::<RemoteProtocol>().ok());
        match persisted {
            Some(protocol) => *self.remote_protocol.write() = Some(protocol),
            None => {
                if let Some(protocol) = self.config.bridge.remote_network {
                    self.db
                        .info_store()
                        .set_remote_protocol(prefix, protocol.as_str())
                        .await?;
                    *self.remote_protocol.write() = Some(protocol);
                }
            }
        }

        let channels = self.db.channel_store().list().await?;
        {
            let mut map = self.room_map.write();
            for channel in &channels {
                map.insert(channel.matrix_room_id.clone(), channel.remote_id.clone());
            }
        }
        info!(
            "bridge state restored channels={} protocol={}",
            channels.len(),
            self.protocol_label()
        );

        self.upload_avatar().await;

        let core = self.clone();
        tokio::spawn(async move {
            core.init_control_room().await;
        });

        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bot(&self) -> &MatrixClient {
        &self.bot
    }

    pub fn db(&self) -> &DatabaseManager {
        &self.db
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn protocol(&self) -> Option<RemoteProtocol> {
        *self.remote_protocol.read()
    }

    pub fn protocol_label(&self) -> String {
        self.protocol()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default()
    }

    /// Fix the instance's remote protocol on first successful send and
    /// persist it so it survives restarts.
    pub async fn bind_protocol(&self, protocol: RemoteProtocol) {
        if self.protocol().is_some() {
            return;
        }
        *self.remote_protocol.write() = Some(protocol);
        if let Err(e) = self
            .db
            .info_store()
            .set_remote_protocol(&self.config.bridge.account_prefix, protocol.as_str())
            .await
        {
            warn!("failed to persist protocol binding: {}", e);
        }
        info!("remote protocol bound protocol={}", protocol);
    }

    pub fn remote_username(&self) -> String {
        self.remote_username.read().clone()
    }

    pub fn set_remote_username(&self, username: &str) {
        if !username.is_empty() {
            *self.remote_username.write() = username.to_string();
        }
    }

    pub fn channel_for_room(&self, room_id: &str) -> Option<String> {
        self.room_map.read().get(room_id).cloned()
    }

    /// Reverse room-map lookup: remote channel id -> Matrix room id.
    pub fn room_for_channel(&self, channel_id: &str) -> Option<String> {
        self.room_map
            .read()
            .iter()
            .find(|(_, channel)| channel.as_str() == channel_id)
            .map(|(room_id, _)| room_id.clone())
    }

    pub fn set_room_mapping(&self, room_id: &str, channel_id: &str) {
        self.room_map
            .write()
            .insert(room_id.to_string(), channel_id.to_string());
    }

    /// Display name for a Matrix ID, answered from the cache when fresh and
    /// otherwise fetched from the homeserver, falling back to the bare
    /// localpart when the profile query fails.
    pub async fn display_name(&self, mxid: &str) -> String {
        if let Some(entry) = self.name_cache.read().get(mxid) {
            return entry.display_name.clone();
        }
        let fetched = match self.bot.get_display_name(mxid).await {
            Ok(Some(name)) => name,
            Ok(None) => mxid.trim_start_matches('@').to_string(),
            Err(e) => {
                warn!("couldn't retrieve the display name for {}: {}", mxid, e);
                mxid.trim_start_matches('@').to_string()
            }
        };
        self.cache_display_name(mxid, &fetched)
    }

    /// Store a mxid -> display-name mapping. Stale entries are evicted here
    /// rather than on a timer, and a name already held by another user gets
    /// both entries rewritten to `"{name} ({mxid})"` so in-flight renders
    /// stay distinguishable.
    pub fn cache_display_name(&self, mxid: &str, display_name: &str) -> String {
        let now = Instant::now();
        let mut cache = self.name_cache.write();

        let mut conflict = false;
        for (other_mxid, entry) in cache.iter_mut() {
            if other_mxid != mxid && entry.display_name == display_name {
                conflict = true;
                entry.display_name = format!("{} ({})", display_name, other_mxid);
            }
        }
        cache.retain(|_, entry| now.duration_since(entry.last_updated) <= NAME_CACHE_TTL);

        let resolved = if conflict {
            format!("{} ({})", display_name, mxid)
        } else {
            display_name.to_string()
        };
        cache.insert(
            mxid.to_string(),
            NameCacheEntry {
                display_name: resolved.clone(),
                last_updated: now,
            },
        );
        resolved
    }

    /// Hand a translated message to the gateway.
    pub async fn emit(&self, msg: CommonMessage) {
        debug!(
            "<= sending message to gateway channel={} event={:?}",
            msg.channel, msg.event
        );
        if let Err(e) = self.gateway_tx.send(msg).await {
            warn!("gateway channel closed, message dropped: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;

    pub(crate) fn test_config(homeserver_url: &str, db_path: &str) -> Arc<Config> {
        let yaml = format!(
            r#"
bridge:
  homeserver_url: {homeserver_url}
  bot_mxid: "@_irc_bot:localhost"
  main_user: "@admin:localhost"
  account_prefix: "_irc_bridge_"
  user_suffix: "bd"
  remote_network: irc
registration:
  as_token: as-secret
  hs_token: hs-secret
database:
  filename: {db_path}
"#
        );
        Arc::new(Config::load_from_str(&yaml).expect("test config parses"))
    }

    async fn test_core() -> (Arc<BridgeCore>, mpsc::Receiver<CommonMessage>) {
        let file = tempfile::NamedTempFile::new().expect("temp sqlite file");
        let db_path = file.path().to_string_lossy().to_string();
        // Keep the backing file alive for the duration of the test.
        std::mem::forget(file);
        let config = test_config("http://localhost:8008", &db_path);
        let db = DatabaseManager::new(&config.database)
            .await
            .expect("db manager");
        db.migrate().await.expect("migrate");
        let (tx, rx) = mpsc::channel(16);
        let core = Arc::new(BridgeCore::new(config, db, tx).expect("bridge core"));
        (core, rx)
    }

    #[tokio::test]
    async fn display_name_collision_rewrites_both_entries() {
        let (core, _rx) = test_core().await;

        let first = core.cache_display_name("@u1:srv", "Bob");
        assert_eq!(first, "Bob");

        let second = core.cache_display_name("@u2:srv", "Bob");
        assert_eq!(second, "Bob (@u2:srv)");

        let cache = core.name_cache.read();
        assert_eq!(
            cache.get("@u1:srv").unwrap().display_name,
            "Bob (@u1:srv)"
        );
        assert_eq!(
            cache.get("@u2:srv").unwrap().display_name,
            "Bob (@u2:srv)"
        );
    }

    #[tokio::test]
    async fn room_map_lookups_work_both_ways() {
        let (core, _rx) = test_core().await;
        core.set_room_mapping("!room:srv", "#chan");
        assert_eq!(core.channel_for_room("!room:srv").as_deref(), Some("#chan"));
        assert_eq!(core.room_for_channel("#chan").as_deref(), Some("!room:srv"));
        assert!(core.room_for_channel("#other").is_none());
    }
}
