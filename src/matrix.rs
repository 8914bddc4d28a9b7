pub mod client;
pub mod limiter;

pub use self::client::{CreateRoomRequest, MatrixApiError, MatrixClient, RegisteredUser};
pub use self::limiter::RateLimiter;
