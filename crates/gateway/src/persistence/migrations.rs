use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use super::Db;
use crate::error::Result;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub async fn init_pool(database_url: &str) -> Result<Db> {
    let is_memory = database_url.starts_with("sqlite::memory");

    let mut opts = SqliteConnectOptions::from_str(database_url)
        .map_err(|err| crate::error::Error::from(err))?
        .create_if_missing(true);

    // With the default settings each connection to an in-memory SQLite URL
    // gets its own private database, so a pool would silently point queries
    // at different databases. A shared cache plus a single connection keeps
    // the in-memory database consistent for tests.
    let max_connections = if is_memory {
        opts = opts.shared_cache(true);
        1
    } else {
        opts = opts.journal_mode(SqliteJournalMode::Wal);
        5
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(opts)
        .await
        .map_err(crate::error::Error::from)?;

    Ok(pool)
}

pub async fn run_migrations(pool: &Db) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|err| crate::error::Error::internal("cannot run migrations").with_cause(err))?;
    Ok(())
}

/// The stable UUID this gateway reports as its own controller identity,
/// minted on first boot and persisted.
pub async fn ensure_controller_uuid(pool: &Db) -> Result<String> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO gateway_meta (key, value)
        VALUES ('controller-uuid', ?1)
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .execute(pool)
    .await
    .map_err(crate::error::Error::from)?;

    let value: String =
        sqlx::query_scalar("SELECT value FROM gateway_meta WHERE key = 'controller-uuid'")
            .fetch_one(pool)
            .await
            .map_err(crate::error::Error::from)?;
    Ok(value)
}

/// Convenience for tests: a migrated in-memory database.
pub async fn init_test_db() -> Db {
    let pool = init_pool("sqlite::memory:").await.expect("db init");
    run_migrations(&pool).await.expect("migrations");
    pool
}
