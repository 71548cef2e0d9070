use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension as _, params};

use super::{ExistingFlow, FlowStore, StoreError, StoredFlowEntry};
use crate::fingerprint::Fingerprint;

const SCHEMA_VERSION: i32 = 1;
const CREATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Embedded flow store backed by a single SQLite connection.
///
/// The table mirrors the MySQL `flow` layout, including its column widths, which are enforced
/// with `CHECK` constraints so oversized fields fail the same way they do in strict MySQL.
#[derive(Debug)]
pub struct SqliteFlowStore {
    db_path: PathBuf,
    conn: Option<Connection>,
}

impl SqliteFlowStore {
    pub fn open(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create flow store dir {}", parent.display()))?;
        }

        let mut conn = open_connection(&db_path)?;
        migrate(&mut conn)?;
        Ok(Self {
            db_path,
            conn: Some(conn),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Runs `op` on the owned connection from the blocking pool and hands the connection back.
    async fn with_connection<T, F>(&mut self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| StoreError::Internal("sqlite connection already closed".to_owned()))?;

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = op(&conn);
            (conn, result)
        })
        .await
        .map_err(|err| StoreError::Internal(format!("join sqlite task failed: {err}")))?;

        self.conn = Some(conn);
        result
    }
}

impl FlowStore for SqliteFlowStore {
    async fn exists(
        &mut self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ExistingFlow>, StoreError> {
        let fingerprint = fingerprint.as_str().to_owned();
        self.with_connection(move |conn| exists_blocking(conn, &fingerprint))
            .await
    }

    async fn insert(&mut self, entry: &StoredFlowEntry) -> Result<i64, StoreError> {
        let entry = entry.clone();
        self.with_connection(move |conn| insert_blocking(conn, &entry))
            .await
    }

    async fn reconnect(&mut self) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let conn = tokio::task::spawn_blocking(move || open_connection(&db_path))
            .await
            .map_err(|err| StoreError::Internal(format!("join sqlite task failed: {err}")))?
            .map_err(|err| StoreError::Unavailable(format!("{err:#}")))?;

        tracing::info!(path = %self.db_path.display(), "reopened flow store");
        self.conn = Some(conn);
        Ok(())
    }

    async fn close(mut self) -> Result<(), StoreError> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        conn.close()
            .map_err(|(_, err)| store_error("close sqlite connection", err))
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")
        .context("set PRAGMA synchronous=FULL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            tracing::info!("flow table not found, creating");
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS flow (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  "req.method" TEXT CHECK (length("req.method") <= 8),
                  "req.scheme" TEXT CHECK (length("req.scheme") <= 10),
                  "req.host" TEXT CHECK (length("req.host") <= 512),
                  "req.port" INTEGER,
                  "req.path" TEXT CHECK (length(CAST("req.path" AS BLOB)) <= 65535),
                  "req.headers" TEXT CHECK (length(CAST("req.headers" AS BLOB)) <= 65535),
                  "req.content" BLOB CHECK (length("req.content") <= 65535),
                  "req.start" REAL,
                  "req.keys" TEXT CHECK (length("req.keys") <= 256),
                  "req.hash" TEXT CHECK (length("req.hash") <= 64),
                  "resp.code" INTEGER,
                  "resp.reason" TEXT CHECK (length("resp.reason") <= 128),
                  "resp.headers" TEXT CHECK (length(CAST("resp.headers" AS BLOB)) <= 65535),
                  "resp.content" BLOB CHECK (length("resp.content") <= 65535),
                  created TEXT,
                  updated TEXT
                );

                CREATE INDEX IF NOT EXISTS flow_req_hash_idx ON flow("req.hash");
                "#,
            )
            .context("create sqlite flow schema v1")?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported flow store schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn exists_blocking(conn: &Connection, fingerprint: &str) -> Result<Option<ExistingFlow>, StoreError> {
    conn.query_row(
        r#"
        SELECT id, "req.keys"
        FROM flow
        WHERE "req.hash" = ?1
        ORDER BY id
        LIMIT 1
        "#,
        params![fingerprint],
        |row| {
            Ok(ExistingFlow {
                id: row.get(0)?,
                keys: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            })
        },
    )
    .optional()
    .map_err(|err| store_error("select flow by fingerprint", err))
}

fn insert_blocking(conn: &Connection, entry: &StoredFlowEntry) -> Result<i64, StoreError> {
    conn.execute(
        r#"
        INSERT INTO flow (
          "req.method",
          "req.scheme",
          "req.host",
          "req.port",
          "req.path",
          "req.headers",
          "req.content",
          "req.start",
          "req.keys",
          "req.hash",
          "resp.code",
          "resp.reason",
          "resp.headers",
          "resp.content",
          created
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
        params![
            entry.method,
            entry.scheme,
            entry.host,
            i64::from(entry.port),
            entry.path,
            entry.request_headers,
            entry.request_content,
            entry.request_start,
            entry.keys,
            entry.fingerprint.as_str(),
            i64::from(entry.response_code),
            entry.response_reason,
            entry.response_headers,
            entry.response_content,
            entry.created.format(CREATED_FORMAT).to_string(),
        ],
    )
    .map_err(|err| store_error("insert flow", err))?;

    Ok(conn.last_insert_rowid())
}

fn store_error(action: &str, err: rusqlite::Error) -> StoreError {
    let message = format!("{action}: {err}");
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation | ErrorCode::TooBig) => StoreError::Data(message),
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure,
        ) => StoreError::Unavailable(message),
        _ => StoreError::Internal(message),
    }
}
