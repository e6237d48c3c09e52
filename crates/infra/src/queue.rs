//! Queue/cache service liveness check.
//!
//! The worker does not consume from redis; it only confirms at startup that
//! the service the rest of the platform depends on is reachable.

use std::time::Duration;

use tracing::{debug, instrument};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid redis url: {0}")]
    InvalidUrl(String),
    #[error("redis connection error: {0}")]
    Connection(String),
    #[error("redis command error: {0}")]
    Command(String),
}

/// Connect to redis and `PING` it.
#[instrument(skip(redis_url), err)]
pub fn check_liveness(redis_url: &str) -> Result<(), QueueError> {
    let client = redis::Client::open(redis_url).map_err(|e| QueueError::InvalidUrl(e.to_string()))?;
    let mut conn = client
        .get_connection_with_timeout(CONNECT_TIMEOUT)
        .map_err(|e| QueueError::Connection(e.to_string()))?;

    let reply: String = redis::cmd("PING")
        .query(&mut conn)
        .map_err(|e| QueueError::Command(e.to_string()))?;
    if reply != "PONG" {
        return Err(QueueError::Command(format!("unexpected PING reply: {reply}")));
    }

    debug!("redis answered PING");
    Ok(())
}
