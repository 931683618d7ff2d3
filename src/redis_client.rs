use redis::aio::ConnectionManager;

/// Creates the demo application's own `ConnectionManager`.
///
/// `ConnectionManager` is cheaply cloneable; every clone shares the same
/// multiplexed connection and reconnects on failure.
pub async fn connect(url: &str) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(url)?;
    let conn = ConnectionManager::new(client).await.map_err(|e| {
        tracing::error!(%url, err = %e, "cannot connect to Redis; is redis-server running?");
        e
    })?;
    tracing::info!(%url, "connected to Redis");
    Ok(conn)
}
