use chrono::{DateTime, Utc};
use secrecy::SecretString;

/// A remote channel (or DM) mapped onto a Matrix room. Identity fields are
/// immutable after creation; the record is looked up by any of remote_id,
/// matrix_room_id or remote_name.
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub id: i64,
    pub remote_name: String,
    pub matrix_room_id: String,
    pub is_direct: bool,
    pub remote_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChannel {
    pub remote_name: String,
    pub matrix_room_id: String,
    pub is_direct: bool,
    pub remote_id: String,
}

/// A remote user represented by a registered appservice account. The access
/// token is a long-lived credential; it stays wrapped so it cannot leak into
/// logs.
#[derive(Debug, Clone)]
pub struct VirtualUserRecord {
    pub id: i64,
    pub username: String,
    pub matrix_token: SecretString,
    pub matrix_id: String,
    pub remote_id: String,
    pub registered: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct NewVirtualUser {
    pub username: String,
    pub matrix_token: SecretString,
    pub matrix_id: String,
    pub remote_id: String,
    pub registered: bool,
}

impl std::fmt::Debug for NewVirtualUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewVirtualUser")
            .field("username", &self.username)
            .field("matrix_id", &self.matrix_id)
            .field("remote_id", &self.remote_id)
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}

/// Channel/user junction row. `joined` tracks whether the virtual user has
/// actually joined the Matrix room, which can lag the DB membership because
/// invite/join is a separate asynchronous round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipRecord {
    pub id: i64,
    /// Remote channel id.
    pub channel_id: String,
    /// The virtual user's Matrix ID.
    pub matrix_id: String,
    pub joined: bool,
}

/// Per-instance persisted state: the protocol binding and the cached room
/// avatar mxc URL.
#[derive(Debug, Clone, Default)]
pub struct BridgeInfo {
    pub account_prefix: String,
    pub remote_protocol: Option<String>,
    pub avatar_url: Option<String>,
}
