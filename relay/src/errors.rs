use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("Transport disconnected")]
    TransportDisconnected,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Device {device_id} is already owned by another user")]
    OwnershipConflict { device_id: String, owner: String },

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Identity provider error: {0}")]
    IdentityProvider(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    /// Transient failures clear up on their own (reconnect, store recovering).
    /// Everything else is a property of the input and will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Mqtt(_)
            | Error::Connection(_)
            | Error::TransportDisconnected
            | Error::StoreUnavailable(_)
            | Error::IdentityProvider(_)
            | Error::ChannelSend => true,
            Error::Database(db_err) => is_transient_db_error(db_err),

            Error::Migration(_)
            | Error::Validation(_)
            | Error::OwnershipConflict { .. }
            | Error::Unauthenticated(_)
            | Error::Unauthorized(_)
            | Error::DeviceNotFound(_)
            | Error::Config(_)
            | Error::Json(_)
            | Error::Io(_) => false,
        }
    }
}

pub(crate) fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" || // too_many_connections
                code == "40001" // serialization_failure
            })
        }
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
