use async_trait::async_trait;

use super::models::{
    BridgeInfo, ChannelRecord, MembershipRecord, NewChannel, NewVirtualUser, VirtualUserRecord,
};
use super::DatabaseError;

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn get_by_remote_id(&self, remote_id: &str)
        -> Result<Option<ChannelRecord>, DatabaseError>;
    async fn get_by_matrix_room(
        &self,
        room_id: &str,
    ) -> Result<Option<ChannelRecord>, DatabaseError>;
    async fn get_by_remote_name(
        &self,
        name: &str,
    ) -> Result<Option<ChannelRecord>, DatabaseError>;
    async fn create(&self, channel: &NewChannel) -> Result<(), DatabaseError>;
    async fn list(&self) -> Result<Vec<ChannelRecord>, DatabaseError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_remote_id(
        &self,
        remote_id: &str,
    ) -> Result<Option<VirtualUserRecord>, DatabaseError>;
    async fn get_by_matrix_id(
        &self,
        matrix_id: &str,
    ) -> Result<Option<VirtualUserRecord>, DatabaseError>;
    async fn get_by_username(
        &self,
        username: &str,
    ) -> Result<Option<VirtualUserRecord>, DatabaseError>;
    async fn create(&self, user: &NewVirtualUser) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Insert the junction row if it does not exist yet; an existing row is
    /// left untouched (its joined flag is never downgraded here).
    async fn ensure(
        &self,
        channel_id: &str,
        matrix_id: &str,
        joined: bool,
    ) -> Result<(), DatabaseError>;
    async fn get(
        &self,
        channel_id: &str,
        matrix_id: &str,
    ) -> Result<Option<MembershipRecord>, DatabaseError>;
    async fn set_joined(
        &self,
        channel_id: &str,
        matrix_id: &str,
        joined: bool,
    ) -> Result<(), DatabaseError>;
    async fn members_for_channel(
        &self,
        channel_id: &str,
    ) -> Result<Vec<MembershipRecord>, DatabaseError>;
    async fn remove(&self, channel_id: &str, matrix_id: &str) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait InfoStore: Send + Sync {
    /// Create the per-instance info row if missing and return it.
    async fn ensure(&self, account_prefix: &str) -> Result<BridgeInfo, DatabaseError>;
    async fn set_remote_protocol(
        &self,
        account_prefix: &str,
        protocol: &str,
    ) -> Result<(), DatabaseError>;
    async fn set_avatar_url(&self, account_prefix: &str, url: &str)
        -> Result<(), DatabaseError>;
}
