use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use secrecy::ExposeSecret;

use crate::db::schema_sqlite::{bridge_info, channel_members, channels, virtual_users};

use super::models::{
    BridgeInfo, ChannelRecord, MembershipRecord, NewChannel, NewVirtualUser, VirtualUserRecord,
};
use super::DatabaseError;

fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    SqliteConnection::establish(path).map_err(|e| DatabaseError::Connection(e.to_string()))
}

// SQLite hands back i32 primary keys; the store API keeps i64.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = channels)]
struct DbChannel {
    id: i32,
    remote_name: String,
    matrix_room_id: String,
    is_direct: bool,
    remote_id: String,
    created_at: String,
}

impl DbChannel {
    fn into_record(self) -> Result<ChannelRecord, DatabaseError> {
        Ok(ChannelRecord {
            id: self.id as i64,
            remote_name: self.remote_name,
            matrix_room_id: self.matrix_room_id,
            is_direct: self.is_direct,
            remote_id: self.remote_id,
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = channels)]
struct DbNewChannel<'a> {
    remote_name: &'a str,
    matrix_room_id: &'a str,
    is_direct: bool,
    remote_id: &'a str,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = virtual_users)]
struct DbVirtualUser {
    id: i32,
    username: String,
    matrix_token: String,
    matrix_id: String,
    remote_id: String,
    registered: bool,
    created_at: String,
}

impl DbVirtualUser {
    fn into_record(self) -> Result<VirtualUserRecord, DatabaseError> {
        Ok(VirtualUserRecord {
            id: self.id as i64,
            username: self.username,
            matrix_token: self.matrix_token.into(),
            matrix_id: self.matrix_id,
            remote_id: self.remote_id,
            registered: self.registered,
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = virtual_users)]
struct DbNewVirtualUser<'a> {
    username: &'a str,
    matrix_token: &'a str,
    matrix_id: &'a str,
    remote_id: &'a str,
    registered: bool,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = channel_members)]
struct DbMembership {
    id: i32,
    channel_id: String,
    matrix_id: String,
    joined: bool,
}

impl DbMembership {
    fn into_record(self) -> MembershipRecord {
        MembershipRecord {
            id: self.id as i64,
            channel_id: self.channel_id,
            matrix_id: self.matrix_id,
            joined: self.joined,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = channel_members)]
struct DbNewMembership<'a> {
    channel_id: &'a str,
    matrix_id: &'a str,
    joined: bool,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = bridge_info)]
struct DbBridgeInfo {
    #[allow(dead_code)]
    id: i32,
    account_prefix: String,
    remote_protocol: String,
    avatar_url: String,
}

impl DbBridgeInfo {
    fn into_record(self) -> BridgeInfo {
        BridgeInfo {
            account_prefix: self.account_prefix,
            remote_protocol: if self.remote_protocol.is_empty() {
                None
            } else {
                Some(self.remote_protocol)
            },
            avatar_url: if self.avatar_url.is_empty() {
                None
            } else {
                Some(self.avatar_url)
            },
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = bridge_info)]
struct DbNewBridgeInfo<'a> {
    account_prefix: &'a str,
    remote_protocol: &'a str,
    avatar_url: &'a str,
}

pub struct SqliteChannelStore {
    db_path: Arc<String>,
}

impl SqliteChannelStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::ChannelStore for SqliteChannelStore {
    async fn get_by_remote_id(
        &self,
        remote_id_value: &str,
    ) -> Result<Option<ChannelRecord>, DatabaseError> {
        let remote_id_value = remote_id_value.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::channels::dsl::*;
            channels
                .filter(remote_id.eq(remote_id_value))
                .select(DbChannel::as_select())
                .first::<DbChannel>(&mut conn)
                .optional()
                .map_err(DatabaseError::from)?
                .map(DbChannel::into_record)
                .transpose()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn get_by_matrix_room(
        &self,
        room_id: &str,
    ) -> Result<Option<ChannelRecord>, DatabaseError> {
        let room_id = room_id.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::channels::dsl::*;
            channels
                .filter(matrix_room_id.eq(room_id))
                .select(DbChannel::as_select())
                .first::<DbChannel>(&mut conn)
                .optional()
                .map_err(DatabaseError::from)?
                .map(DbChannel::into_record)
                .transpose()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn get_by_remote_name(
        &self,
        name: &str,
    ) -> Result<Option<ChannelRecord>, DatabaseError> {
        let name = name.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::channels::dsl::*;
            channels
                .filter(remote_name.eq(name))
                .select(DbChannel::as_select())
                .first::<DbChannel>(&mut conn)
                .optional()
                .map_err(DatabaseError::from)?
                .map(DbChannel::into_record)
                .transpose()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn create(&self, channel: &NewChannel) -> Result<(), DatabaseError> {
        let channel = channel.clone();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            diesel::insert_into(channels::table)
                .values(&DbNewChannel {
                    remote_name: &channel.remote_name,
                    matrix_room_id: &channel.matrix_room_id,
                    is_direct: channel.is_direct,
                    remote_id: &channel.remote_id,
                    created_at: datetime_to_string(&Utc::now()),
                })
                .execute(&mut conn)
                .map_err(DatabaseError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn list(&self) -> Result<Vec<ChannelRecord>, DatabaseError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::channels::dsl::*;
            channels
                .select(DbChannel::as_select())
                .load::<DbChannel>(&mut conn)
                .map_err(DatabaseError::from)?
                .into_iter()
                .map(DbChannel::into_record)
                .collect()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}

pub struct SqliteUserStore {
    db_path: Arc<String>,
}

impl SqliteUserStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::UserStore for SqliteUserStore {
    async fn get_by_remote_id(
        &self,
        remote_id_value: &str,
    ) -> Result<Option<VirtualUserRecord>, DatabaseError> {
        let remote_id_value = remote_id_value.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::virtual_users::dsl::*;
            virtual_users
                .filter(remote_id.eq(remote_id_value))
                .select(DbVirtualUser::as_select())
                .first::<DbVirtualUser>(&mut conn)
                .optional()
                .map_err(DatabaseError::from)?
                .map(DbVirtualUser::into_record)
                .transpose()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn get_by_matrix_id(
        &self,
        matrix_id_value: &str,
    ) -> Result<Option<VirtualUserRecord>, DatabaseError> {
        let matrix_id_value = matrix_id_value.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::virtual_users::dsl::*;
            virtual_users
                .filter(matrix_id.eq(matrix_id_value))
                .select(DbVirtualUser::as_select())
                .first::<DbVirtualUser>(&mut conn)
                .optional()
                .map_err(DatabaseError::from)?
                .map(DbVirtualUser::into_record)
                .transpose()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn get_by_username(
        &self,
        username_value: &str,
    ) -> Result<Option<VirtualUserRecord>, DatabaseError> {
        let username_value = username_value.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::virtual_users::dsl::*;
            virtual_users
                .filter(username.eq(username_value))
                .select(DbVirtualUser::as_select())
                .first::<DbVirtualUser>(&mut conn)
                .optional()
                .map_err(DatabaseError::from)?
                .map(DbVirtualUser::into_record)
                .transpose()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn create(&self, user: &NewVirtualUser) -> Result<(), DatabaseError> {
        let user = user.clone();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            diesel::insert_into(virtual_users::table)
                .values(&DbNewVirtualUser {
                    username: &user.username,
                    matrix_token: user.matrix_token.expose_secret(),
                    matrix_id: &user.matrix_id,
                    remote_id: &user.remote_id,
                    registered: user.registered,
                    created_at: datetime_to_string(&Utc::now()),
                })
                .execute(&mut conn)
                .map_err(DatabaseError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}

pub struct SqliteMembershipStore {
    db_path: Arc<String>,
}

impl SqliteMembershipStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::MembershipStore for SqliteMembershipStore {
    async fn ensure(
        &self,
        channel_id_value: &str,
        matrix_id_value: &str,
        joined_value: bool,
    ) -> Result<(), DatabaseError> {
        let channel_id_value = channel_id_value.to_string();
        let matrix_id_value = matrix_id_value.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            diesel::insert_or_ignore_into(channel_members::table)
                .values(&DbNewMembership {
                    channel_id: &channel_id_value,
                    matrix_id: &matrix_id_value,
                    joined: joined_value,
                })
                .execute(&mut conn)
                .map_err(DatabaseError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn get(
        &self,
        channel_id_value: &str,
        matrix_id_value: &str,
    ) -> Result<Option<MembershipRecord>, DatabaseError> {
        let channel_id_value = channel_id_value.to_string();
        let matrix_id_value = matrix_id_value.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::channel_members::dsl::*;
            Ok(channel_members
                .filter(channel_id.eq(channel_id_value))
                .filter(matrix_id.eq(matrix_id_value))
                .select(DbMembership::as_select())
                .first::<DbMembership>(&mut conn)
                .optional()
                .map_err(DatabaseError::from)?
                .map(DbMembership::into_record))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn set_joined(
        &self,
        channel_id_value: &str,
        matrix_id_value: &str,
        joined_value: bool,
    ) -> Result<(), DatabaseError> {
        let channel_id_value = channel_id_value.to_string();
        let matrix_id_value = matrix_id_value.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::channel_members::dsl::*;
            diesel::update(
                channel_members
                    .filter(channel_id.eq(channel_id_value))
                    .filter(matrix_id.eq(matrix_id_value)),
            )
            .set(joined.eq(joined_value))
            .execute(&mut conn)
            .map_err(DatabaseError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn members_for_channel(
        &self,
        channel_id_value: &str,
    ) -> Result<Vec<MembershipRecord>, DatabaseError> {
        let channel_id_value = channel_id_value.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::channel_members::dsl::*;
            Ok(channel_members
                .filter(channel_id.eq(channel_id_value))
                .select(DbMembership::as_select())
                .load::<DbMembership>(&mut conn)
                .map_err(DatabaseError::from)?
                .into_iter()
                .map(DbMembership::into_record)
                .collect())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn remove(
        &self,
        channel_id_value: &str,
        matrix_id_value: &str,
    ) -> Result<(), DatabaseError> {
        let channel_id_value = channel_id_value.to_string();
        let matrix_id_value = matrix_id_value.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::channel_members::dsl::*;
            diesel::delete(
                channel_members
                    .filter(channel_id.eq(channel_id_value))
                    .filter(matrix_id.eq(matrix_id_value)),
            )
            .execute(&mut conn)
            .map_err(DatabaseError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}

pub struct SqliteInfoStore {
    db_path: Arc<String>,
}

impl SqliteInfoStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::InfoStore for SqliteInfoStore {
    async fn ensure(&self, prefix: &str) -> Result<BridgeInfo, DatabaseError> {
        let prefix = prefix.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::bridge_info::dsl::*;
            diesel::insert_or_ignore_into(bridge_info)
                .values(&DbNewBridgeInfo {
                    account_prefix: &prefix,
                    remote_protocol: "",
                    avatar_url: "",
                })
                .execute(&mut conn)
                .map_err(DatabaseError::from)?;
            let row = bridge_info
                .filter(account_prefix.eq(&prefix))
                .select(DbBridgeInfo::as_select())
                .first::<DbBridgeInfo>(&mut conn)
                .map_err(DatabaseError::from)?;
            Ok(row.into_record())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn set_remote_protocol(
        &self,
        prefix: &str,
        protocol: &str,
    ) -> Result<(), DatabaseError> {
        let prefix = prefix.to_string();
        let protocol = protocol.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::bridge_info::dsl::*;
            diesel::update(bridge_info.filter(account_prefix.eq(prefix)))
                .set(remote_protocol.eq(protocol))
                .execute(&mut conn)
                .map_err(DatabaseError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn set_avatar_url(&self, prefix: &str, url: &str) -> Result<(), DatabaseError> {
        let prefix = prefix.to_string();
        let url = url.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::bridge_info::dsl::*;
            diesel::update(bridge_info.filter(account_prefix.eq(prefix)))
                .set(avatar_url.eq(url))
                .execute(&mut conn)
                .map_err(DatabaseError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}
