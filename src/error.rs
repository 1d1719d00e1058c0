use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Redis error {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis connection error {0}")]
    RedisPool(#[from] deadpool::managed::PoolError<::redis::RedisError>),

    #[error("Redis pool creation error {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
