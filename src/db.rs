use std::path::Path;

use diesel::sqlite::SqliteConnection;
use diesel::Connection;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::error::{QuotaSentryError, Result};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub type SqliteAsyncConn = SyncConnectionWrapper<SqliteConnection>;
pub type SqlitePool = Pool<SqliteAsyncConn>;
pub type SqlitePooledConn<'a> = PooledConnection<'a, SqliteAsyncConn>;

pub fn ensure_parent_dir(path: &str) -> Result<()> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
    }
    Ok(())
}

pub fn open_sqlite_connection_sync(database_url: &str) -> Result<SqliteConnection> {
    SqliteConnection::establish(database_url)
        .map_err(|e| QuotaSentryError::Runtime(e.to_string()))
}

pub async fn run_migrations(database_url: &str) -> Result<()> {
    let database_url = database_url.to_string();
    tokio::task::spawn_blocking(move || {
        let mut conn = open_sqlite_connection_sync(&database_url)?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        Ok::<_, QuotaSentryError>(())
    })
    .await
    .map_err(|e| QuotaSentryError::Runtime(e.to_string()))??;
    Ok(())
}

pub async fn open_pool(database_url: &str) -> Result<SqlitePool> {
    ensure_parent_dir(database_url)?;
    run_migrations(database_url).await?;

    let manager = AsyncDieselConnectionManager::<SqliteAsyncConn>::new(database_url);
    Pool::builder()
        .build(manager)
        .await
        .map_err(|e| QuotaSentryError::Runtime(e.to_string()))
}
