use thiserror::Error;
use tracing::error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Too many active connections for this address")]
    TooManyConnections,
    #[error("The room is full")]
    RoomFull,
    #[error("Too many rooms created by this address")]
    TooManyRoomsCreated,
    /// A room mutation lost its lock lease or hit a concurrent writer. No
    /// write happened; callers may retry.
    #[error("Transaction failed: {0}")]
    TransactionFailed(&'static str),
    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),
    /// Connection must be rejected or torn down with a specific close code.
    #[error("{reason}")]
    InvalidConnection { code: u16, reason: String },
    #[error("The change feed dropped {0} mutations")]
    ChangeFeedLost(u64),
    #[cfg(feature = "backend_redis")]
    #[error("There was a problem with the connection to redis: {source}")]
    RedisError {
        #[from]
        source: redis::RedisError,
    },
    #[error("Could not serialize or deserialize a stored value: {source}")]
    SerdeJsonError {
        #[from]
        source: serde_json::Error,
    },
    #[error("Could not do this io: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("{0}")]
    BadConfig(&'static str),
    #[error("{0}")]
    /// Don't create this directly. Use Error::bad_store instead.
    BadStore(&'static str),
}

impl Error {
    pub fn bad_config(message: &'static str) -> Self {
        error!("BadConfig: {}", message);
        Self::BadConfig(message)
    }

    pub fn bad_store(message: &'static str) -> Self {
        error!("BadStore: {}", message);
        Self::BadStore(message)
    }
}
