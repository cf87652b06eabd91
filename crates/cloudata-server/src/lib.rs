pub mod auth;
pub mod redis;
pub mod resp;
pub mod session;

pub use auth::{Authenticator, AUTH_KEYSPACE_NAME};
pub use redis::RedisServer;
pub use session::{Connection, Session, SessionSlot};
