pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::models::{
    BridgeInfo, ChannelRecord, MembershipRecord, NewChannel, NewVirtualUser, VirtualUserRecord,
};
pub use self::stores::{ChannelStore, InfoStore, MembershipStore, UserStore};

pub mod error;
pub mod manager;
pub mod models;
pub mod stores;

#[cfg(feature = "sqlite")]
pub mod schema_sqlite;

#[cfg(feature = "sqlite")]
pub mod sqlite;
