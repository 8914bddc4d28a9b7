use std::sync::Arc;

use crate::config::DatabaseConfig;
use crate::db::{ChannelStore, DatabaseError, InfoStore, MembershipStore, UserStore};

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{
    SqliteChannelStore, SqliteInfoStore, SqliteMembershipStore, SqliteUserStore,
};
#[cfg(feature = "sqlite")]
use diesel::sqlite::SqliteConnection;
#[cfg(feature = "sqlite")]
use diesel::{Connection, RunQueryDsl};

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "sqlite")]
    sqlite_path: String,
    channel_store: Arc<dyn ChannelStore>,
    user_store: Arc<dyn UserStore>,
    membership_store: Arc<dyn MembershipStore>,
    info_store: Arc<dyn InfoStore>,
}

impl DatabaseManager {
    #[cfg(feature = "sqlite")]
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let path = config.sqlite_path();
        let path_arc = Arc::new(path.clone());

        let channel_store = Arc::new(SqliteChannelStore::new(path_arc.clone()));
        let user_store = Arc::new(SqliteUserStore::new(path_arc.clone()));
        let membership_store = Arc::new(SqliteMembershipStore::new(path_arc.clone()));
        let info_store = Arc::new(SqliteInfoStore::new(path_arc));

        Ok(Self {
            sqlite_path: path,
            channel_store,
            user_store,
            membership_store,
            info_store,
        })
    }

    #[cfg(not(feature = "sqlite"))]
    pub async fn new(_config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        Err(DatabaseError::Connection(
            "SQLite feature not enabled".to_string(),
        ))
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        #[cfg(feature = "sqlite")]
        {
            return Self::migrate_sqlite(&self.sqlite_path).await;
        }
        #[cfg(not(feature = "sqlite"))]
        Err(DatabaseError::Migration(
            "SQLite feature not enabled".to_string(),
        ))
    }

    #[cfg(feature = "sqlite")]
    async fn migrate_sqlite(path: &str) -> Result<(), DatabaseError> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = SqliteConnection::establish(&path)
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS channels (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    remote_name TEXT NOT NULL,
                    matrix_room_id TEXT NOT NULL UNIQUE,
                    is_direct BOOLEAN NOT NULL DEFAULT 0,
                    remote_id TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS virtual_users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL,
                    matrix_token TEXT NOT NULL,
                    matrix_id TEXT NOT NULL UNIQUE,
                    remote_id TEXT NOT NULL UNIQUE,
                    registered BOOLEAN NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS channel_members (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    channel_id TEXT NOT NULL,
                    matrix_id TEXT NOT NULL,
                    joined BOOLEAN NOT NULL DEFAULT 0,
                    UNIQUE(channel_id, matrix_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS bridge_info (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    account_prefix TEXT NOT NULL UNIQUE,
                    remote_protocol TEXT NOT NULL DEFAULT '',
                    avatar_url TEXT NOT NULL DEFAULT ''
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_channels_remote_id ON channels(remote_id)",
                "CREATE INDEX IF NOT EXISTS idx_channels_matrix_room_id ON channels(matrix_room_id)",
                "CREATE INDEX IF NOT EXISTS idx_channels_remote_name ON channels(remote_name)",
                "CREATE INDEX IF NOT EXISTS idx_virtual_users_remote_id ON virtual_users(remote_id)",
                "CREATE INDEX IF NOT EXISTS idx_virtual_users_matrix_id ON virtual_users(matrix_id)",
                "CREATE INDEX IF NOT EXISTS idx_channel_members_channel ON channel_members(channel_id)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn channel_store(&self) -> Arc<dyn ChannelStore> {
        self.channel_store.clone()
    }

    pub fn user_store(&self) -> Arc<dyn UserStore> {
        self.user_store.clone()
    }

    pub fn membership_store(&self) -> Arc<dyn MembershipStore> {
        self.membership_store.clone()
    }

    pub fn info_store(&self) -> Arc<dyn InfoStore> {
        self.info_store.clone()
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use secrecy::ExposeSecret;
    use tempfile::NamedTempFile;

    use super::DatabaseManager;
    use crate::config::DatabaseConfig;
    use crate::db::{DatabaseError, NewChannel, NewVirtualUser};

    async fn open_manager(path: &str) -> DatabaseManager {
        let config = DatabaseConfig {
            filename: path.to_string(),
        };
        let manager = DatabaseManager::new(&config).await.expect("db manager");
        manager.migrate().await.expect("migrate");
        manager
    }

    #[tokio::test]
    async fn sqlite_channel_roundtrip() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db_path = file.path().to_string_lossy().to_string();
        let manager = open_manager(&db_path).await;

        let channel = NewChannel {
            remote_name: "general".to_string(),
            matrix_room_id: "!abc:example.org".to_string(),
            is_direct: false,
            remote_id: "chan-1".to_string(),
        };
        manager
            .channel_store()
            .create(&channel)
            .await
            .expect("insert channel");

        let by_remote = manager
            .channel_store()
            .get_by_remote_id("chan-1")
            .await
            .expect("query by remote id")
            .expect("channel exists");
        assert_eq!(by_remote.matrix_room_id, "!abc:example.org");
        assert!(!by_remote.is_direct);

        let by_room = manager
            .channel_store()
            .get_by_matrix_room("!abc:example.org")
            .await
            .expect("query by room")
            .expect("channel exists");
        assert_eq!(by_room.remote_id, "chan-1");

        let by_name = manager
            .channel_store()
            .get_by_remote_name("general")
            .await
            .expect("query by name")
            .expect("channel exists");
        assert_eq!(by_name.remote_id, "chan-1");

        // Reopen to confirm persistence across connections.
        let reopened = open_manager(&db_path).await;
        let listed = reopened.channel_store().list().await.expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn sqlite_duplicate_channel_mapping_is_rejected() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db_path = file.path().to_string_lossy().to_string();
        let manager = open_manager(&db_path).await;

        let channel = NewChannel {
            remote_name: "general".to_string(),
            matrix_room_id: "!abc:example.org".to_string(),
            is_direct: false,
            remote_id: "chan-1".to_string(),
        };
        manager
            .channel_store()
            .create(&channel)
            .await
            .expect("insert channel");

        let dup = NewChannel {
            remote_name: "general-2".to_string(),
            matrix_room_id: "!other:example.org".to_string(),
            is_direct: false,
            remote_id: "chan-1".to_string(),
        };
        let err = manager
            .channel_store()
            .create(&dup)
            .await
            .expect_err("duplicate remote id must fail");
        assert!(matches!(err, DatabaseError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn sqlite_virtual_user_roundtrip() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db_path = file.path().to_string_lossy().to_string();
        let manager = open_manager(&db_path).await;

        let user = NewVirtualUser {
            username: "irc_alice_xyz".to_string(),
            matrix_token: "syt_secret_token".to_string().into(),
            matrix_id: "@irc_alice_xyz:example.org".to_string(),
            remote_id: "alice".to_string(),
            registered: true,
        };
        manager
            .user_store()
            .create(&user)
            .await
            .expect("insert user");

        let by_remote = manager
            .user_store()
            .get_by_remote_id("alice")
            .await
            .expect("query by remote id")
            .expect("user exists");
        assert_eq!(by_remote.matrix_id, "@irc_alice_xyz:example.org");
        assert_eq!(by_remote.matrix_token.expose_secret(), "syt_secret_token");
        assert!(by_remote.registered);

        let by_mxid = manager
            .user_store()
            .get_by_matrix_id("@irc_alice_xyz:example.org")
            .await
            .expect("query by matrix id")
            .expect("user exists");
        assert_eq!(by_mxid.remote_id, "alice");

        let missing = manager
            .user_store()
            .get_by_remote_id("bob")
            .await
            .expect("query missing");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn sqlite_membership_ensure_is_idempotent_and_keeps_joined() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db_path = file.path().to_string_lossy().to_string();
        let manager = open_manager(&db_path).await;

        let store = manager.membership_store();
        store
            .ensure("chan-1", "@irc_alice:example.org", false)
            .await
            .expect("ensure");
        store
            .set_joined("chan-1", "@irc_alice:example.org", true)
            .await
            .expect("set joined");

        // A later ensure with joined=false must not reset the flag.
        store
            .ensure("chan-1", "@irc_alice:example.org", false)
            .await
            .expect("ensure again");

        let row = store
            .get("chan-1", "@irc_alice:example.org")
            .await
            .expect("get")
            .expect("row exists");
        assert!(row.joined);

        store
            .ensure("chan-1", "@irc_bob:example.org", false)
            .await
            .expect("ensure bob");
        let members = store
            .members_for_channel("chan-1")
            .await
            .expect("members");
        assert_eq!(members.len(), 2);

        store
            .remove("chan-1", "@irc_bob:example.org")
            .await
            .expect("remove bob");
        let members = store
            .members_for_channel("chan-1")
            .await
            .expect("members after remove");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].matrix_id, "@irc_alice:example.org");
    }

    #[tokio::test]
    async fn sqlite_bridge_info_ensure_and_update() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db_path = file.path().to_string_lossy().to_string();
        let manager = open_manager(&db_path).await;

        let info = manager.info_store().ensure("irc_").await.expect("ensure");
        assert_eq!(info.account_prefix, "irc_");
        assert!(info.remote_protocol.is_none());
        assert!(info.avatar_url.is_none());

        manager
            .info_store()
            .set_remote_protocol("irc_", "irc")
            .await
            .expect("set protocol");
        manager
            .info_store()
            .set_avatar_url("irc_", "mxc://example.org/abc123")
            .await
            .expect("set avatar");

        let info = manager
            .info_store()
            .ensure("irc_")
            .await
            .expect("ensure again");
        assert_eq!(info.remote_protocol.as_deref(), Some("irc"));
        assert_eq!(info.avatar_url.as_deref(), Some("mxc://example.org/abc123"));
    }
}
