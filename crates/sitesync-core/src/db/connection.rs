//! Database connection management

use crate::error::Result;
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use std::future::Future;
use std::path::Path;

use super::migrations;

/// Which table set a database file carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    /// Offline client: entities, outbox, conflict log, sync state
    Client,
    /// Remote authority: canonical records, change feed, applied operations
    Authority,
}

/// Database wrapper for libSQL connections
pub struct Database {
    // Keeps the underlying database alive for the connection's lifetime.
    _db: LibSqlDatabase,
    conn: Connection,
    schema: Schema,
}

impl Database {
    /// Open a local client database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_schema(path, Schema::Client).await
    }

    /// Open an in-memory client database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_schema(Schema::Client).await
    }

    /// Open a database file carrying the given schema
    pub async fn open_with_schema(path: impl AsRef<Path>, schema: Schema) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        Self::from_libsql(db, schema).await
    }

    /// Open an in-memory database carrying the given schema
    pub async fn open_in_memory_with_schema(schema: Schema) -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::from_libsql(db, schema).await
    }

    async fn from_libsql(db: LibSqlDatabase, schema: Schema) -> Result<Self> {
        let conn = db.connect()?;
        let database = Self {
            _db: db,
            conn,
            schema,
        };
        database.configure().await?;
        database.migrate().await?;
        Ok(database)
    }

    /// Configure `SQLite` for optimal performance
    async fn configure(&self) -> Result<()> {
        // WAL is unavailable for in-memory databases; ignore the failure there.
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA synchronous = NORMAL;", ())
            .await
            .ok();
        self.conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        self.conn
            .execute("PRAGMA cache_size = 10000;", ())
            .await
            .ok();
        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        match self.schema {
            Schema::Client => migrations::run(&self.conn).await,
            Schema::Authority => migrations::run_authority(&self.conn).await,
        }
    }

    /// Schema this database was opened with
    pub const fn schema(&self) -> Schema {
        self.schema
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Start an explicit write transaction
pub async fn begin(conn: &Connection) -> Result<()> {
    conn.execute("BEGIN IMMEDIATE TRANSACTION", ()).await?;
    Ok(())
}

/// Commit, rolling back if the commit itself fails
pub async fn commit(conn: &Connection) -> Result<()> {
    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }
    Ok(())
}

/// Roll back, ignoring errors (the connection may already be outside a transaction)
pub async fn rollback(conn: &Connection) {
    conn.execute("ROLLBACK", ()).await.ok();
}

/// Run `work` between `BEGIN` and `COMMIT`, rolling back when it fails.
///
/// `work` must only use `conn`; it is not polled until the transaction is open.
pub async fn transaction<T>(
    conn: &Connection,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    begin(conn).await?;
    match work.await {
        Ok(value) => {
            commit(conn).await?;
            Ok(value)
        }
        Err(error) => {
            rollback(conn).await;
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_in_memory() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(db.schema(), Schema::Client);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_file_persists_across_reopen() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("client.db");

        {
            let db = Database::open(&db_path).await.unwrap();
            db.connection()
                .execute(
                    "INSERT INTO sync_state (key, value) VALUES ('probe', 'yes')",
                    (),
                )
                .await
                .unwrap();
        }

        let db = Database::open(&db_path).await.unwrap();
        let mut rows = db
            .connection()
            .query("SELECT value FROM sync_state WHERE key = 'probe'", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<String>(0).unwrap(), "yes");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rollback_discards_writes() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();

        begin(conn).await.unwrap();
        conn.execute(
            "INSERT INTO sync_state (key, value) VALUES ('temp', '1')",
            (),
        )
        .await
        .unwrap();
        rollback(conn).await;

        let mut rows = conn
            .query("SELECT COUNT(*) FROM sync_state WHERE key = 'temp'", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();

        let result: Result<()> = transaction(conn, async {
            conn.execute("INSERT INTO sync_state (key, value) VALUES ('a', '1')", ())
                .await?;
            Err(crate::Error::InvalidInput("abort".into()))
        })
        .await;
        assert!(result.is_err());

        let mut rows = conn
            .query("SELECT COUNT(*) FROM sync_state", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 0);
    }
}
