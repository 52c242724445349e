use crate::schema::*;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::debug;
use sessioncore::store::error::{Result, StoreError};
use sessioncore::store::traits::{KeyValueStore, RecentMessageStore};
use sessioncore::types::InboundMessage;
use std::sync::Arc;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;
type SqlitePooledConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

#[derive(Clone)]
pub struct SqliteStore {
    pub(crate) pool: SqlitePool,
    /// RwLock for database operations:
    /// - Read lock: Multiple concurrent reads allowed (WAL mode supports this)
    /// - Write lock: Serializes writes to prevent SQLITE_BUSY errors
    pub(crate) db_lock: Arc<tokio::sync::RwLock<()>>,
}

#[derive(Debug, Clone, Copy)]
struct ConnectionOptions;

impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error>
    for ConnectionOptions
{
    fn on_acquire(
        &self,
        conn: &mut SqliteConnection,
    ) -> std::result::Result<(), diesel::r2d2::Error> {
        diesel::sql_query("PRAGMA busy_timeout = 30000;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;
        diesel::sql_query("PRAGMA synchronous = FULL;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;
        diesel::sql_query("PRAGMA temp_store = memory;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;
        Ok(())
    }
}

fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> std::result::Result<Self, StoreError> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);

        let pool = Pool::builder()
            .max_size(4)
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let pool_clone = pool.clone();
        tokio::task::spawn_blocking(move || -> std::result::Result<(), StoreError> {
            let mut conn = pool_clone
                .get()
                .map_err(|e| StoreError::Connection(e.to_string()))?;

            diesel::sql_query("PRAGMA journal_mode = WAL;")
                .execute(&mut conn)
                .map_err(|e| StoreError::Database(e.to_string()))?;

            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| StoreError::Migration(e.to_string()))?;

            Ok(())
        })
        .await
        .map_err(|e| StoreError::Database(e.to_string()))??;

        debug!(target: "Store/Sqlite", "Opened {database_url}");

        Ok(Self {
            pool,
            db_lock: Arc::new(tokio::sync::RwLock::new(())),
        })
    }

    fn connection(pool: &SqlitePool) -> Result<SqlitePooledConnection> {
        pool.get()
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    /// Execute a read operation with shared read lock.
    /// Multiple reads can proceed concurrently (WAL mode allows this).
    async fn with_read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let guard = self.db_lock.read().await;
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = Self::connection(&pool)?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| StoreError::Database(e.to_string()))??;
        drop(guard);
        Ok(result)
    }

    /// Execute a write operation with exclusive write lock.
    /// Writes are serialized to prevent SQLITE_BUSY errors.
    async fn with_write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let guard = self.db_lock.write().await;
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = Self::connection(&pool)?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| StoreError::Database(e.to_string()))??;
        drop(guard);
        Ok(result)
    }

    /// Number of messages currently in the message log.
    pub async fn message_count(&self) -> Result<i64> {
        self.with_read(|conn| {
            messages::table
                .count()
                .get_result(conn)
                .map_err(|e| StoreError::Database(e.to_string()))
        })
        .await
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.with_read(move |conn| {
            kv_store::table
                .filter(kv_store::key.eq(&key))
                .select(kv_store::value)
                .first::<Vec<u8>>(conn)
                .optional()
                .map_err(|e| StoreError::Database(e.to_string()))
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let key = key.to_string();
        let value = value.to_vec();
        let now = chrono::Utc::now().timestamp_millis();
        self.with_write(move |conn| {
            diesel::insert_into(kv_store::table)
                .values((
                    kv_store::key.eq(&key),
                    kv_store::value.eq(&value),
                    kv_store::updated_at.eq(now),
                ))
                .on_conflict(kv_store::key)
                .do_update()
                .set((kv_store::value.eq(&value), kv_store::updated_at.eq(now)))
                .execute(conn)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_write(move |conn| {
            let removed = diesel::delete(kv_store::table.filter(kv_store::key.eq(&key)))
                .execute(conn)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(removed > 0)
        })
        .await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let pattern = escape_like(prefix);
        self.with_write(move |conn| {
            conn.transaction::<usize, diesel::result::Error, _>(|conn| {
                diesel::delete(kv_store::table.filter(kv_store::key.like(&pattern).escape('\\')))
                    .execute(conn)
            })
            .map_err(|e| StoreError::Database(e.to_string()))
        })
        .await
    }

    async fn probe(&self) -> Result<()> {
        self.with_read(|conn| {
            diesel::sql_query("SELECT 1;")
                .execute(conn)
                .map(|_| ())
                .map_err(|e| StoreError::Unavailable(e.to_string()))
        })
        .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[async_trait]
impl RecentMessageStore for SqliteStore {
    async fn persist_message(&self, message: &InboundMessage) -> Result<()> {
        let message = message.clone();
        let stored_at = chrono::Utc::now().timestamp_millis();
        self.with_write(move |conn| {
            diesel::insert_into(messages::table)
                .values((
                    messages::id.eq(&message.id),
                    messages::chat.eq(&message.chat),
                    messages::sender.eq(&message.sender),
                    messages::content.eq(message.content.as_deref()),
                    messages::timestamp.eq(message.timestamp.timestamp()),
                    messages::is_self_sent.eq(message.is_self_sent),
                    messages::stored_at.eq(stored_at),
                ))
                .on_conflict(messages::id)
                .do_nothing()
                .execute(conn)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn contains_recent(&self, message_id: &str, scan_limit: usize) -> Result<bool> {
        let message_id = message_id.to_string();
        let limit = i64::try_from(scan_limit).unwrap_or(i64::MAX);
        self.with_read(move |conn| {
            let recent: Vec<String> = messages::table
                .select(messages::id)
                .order(messages::stored_at.desc())
                .limit(limit)
                .load(conn)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(recent.iter().any(|id| *id == message_id))
        })
        .await
    }
}
