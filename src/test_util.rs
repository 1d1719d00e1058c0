use crate::{namespace::Namespace, pool::RedisPool, settings::WorkerSettings};

/// Connect a pool for one test, keyed under a unique namespace so parallel
/// tests never collide. Requires a reachable Redis (REDIS_URL or localhost).
pub(crate) fn test_pool() -> (RedisPool, Namespace, String) {
    dotenv::dotenv().ok();
    let prefix = format!("resq-test-{}:", uuid::Uuid::new_v4());
    let settings = WorkerSettings {
        namespace: prefix.clone(),
        ..WorkerSettings::default()
    };
    let pool = RedisPool::new(&settings).expect("Creating connection pool");
    let namespace = Namespace::new(prefix.clone());
    (pool, namespace, prefix)
}

/// Delete every key the test created.
pub(crate) async fn cleanup(pool: &RedisPool, prefix: &str) {
    let mut conn = pool.get().await.expect("Cleanup: acquiring connection");

    let keys: Vec<String> = redis::cmd("KEYS")
        .arg(format!("{}*", prefix))
        .query_async(&mut conn)
        .await
        .expect("Cleanup: listing keys");

    if !keys.is_empty() {
        let mut del = redis::cmd("DEL");
        for key in &keys {
            del.arg(key);
        }
        del.query_async::<_, ()>(&mut conn)
            .await
            .expect("Cleanup: deleting keys");
    }
}
