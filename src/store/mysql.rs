use envconfig::Envconfig;
use sqlx::{
    Connection as _, MySqlConnection,
    mysql::{MySqlConnectOptions, MySqlDatabaseError},
};

use super::{ExistingFlow, FLOW_TABLE, FlowStore, StoreError, StoredFlowEntry};
use crate::fingerprint::Fingerprint;

/// MySQL error numbers that mean the row itself was rejected (strict mode data errors).
const DATA_ERROR_NUMBERS: &[u16] = &[
    1264, // ER_WARN_DATA_OUT_OF_RANGE
    1292, // ER_TRUNCATED_WRONG_VALUE
    1366, // ER_TRUNCATED_WRONG_VALUE_FOR_FIELD
    1367, // ER_ILLEGAL_VALUE_FOR_TYPE
    1406, // ER_DATA_TOO_LONG
];

const CREATE_FLOW_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS `flow` (
  `id` int(11) unsigned NOT NULL AUTO_INCREMENT,
  `req.method` varchar(8) DEFAULT NULL,
  `req.scheme` varchar(10) DEFAULT NULL,
  `req.host` varchar(512) DEFAULT NULL,
  `req.port` int(11) DEFAULT NULL,
  `req.path` text,
  `req.headers` text,
  `req.content` blob,
  `req.start` double DEFAULT NULL,
  `req.keys` varchar(256) DEFAULT NULL,
  `req.hash` char(64) DEFAULT NULL,
  `resp.code` smallint(6) DEFAULT NULL,
  `resp.reason` varchar(128) DEFAULT NULL,
  `resp.headers` text,
  `resp.content` blob,
  `created` datetime DEFAULT NULL,
  `updated` datetime DEFAULT NULL,
  PRIMARY KEY (`id`),
  KEY `req.hash` (`req.hash`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#;

/// Connection parameters for the MySQL flow store, read from the process environment.
#[derive(Envconfig, Clone)]
pub struct DatabaseSettings {
    #[envconfig(from = "host")]
    pub host: String,

    #[envconfig(from = "port", default = "3306")]
    pub port: u16,

    #[envconfig(from = "user")]
    pub user: String,

    #[envconfig(from = "password")]
    pub password: String,

    #[envconfig(from = "database")]
    pub database: String,
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .finish()
    }
}

impl DatabaseSettings {
    fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .charset("utf8mb4")
    }
}

/// MySQL error numbers sent when the server ends the session.
const CONNECTION_LOST_NUMBERS: &[u16] = &[
    1053, // ER_SERVER_SHUTDOWN
    1927, // ER_CONNECTION_KILLED
];

/// Flow store backed by one long-lived MySQL connection.
///
/// A call that fails with `StoreError::Unavailable` drops the connection. The next call, or an
/// explicit `reconnect`, opens a fresh one with the original options.
pub struct MySqlFlowStore {
    options: MySqlConnectOptions,
    conn: Option<MySqlConnection>,
}

impl std::fmt::Debug for MySqlFlowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlFlowStore")
            .field("connected", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

impl MySqlFlowStore {
    /// Connects and creates the `flow` table when it does not exist yet.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        tracing::info!(
            host = %settings.host,
            port = settings.port,
            database = %settings.database,
            "connecting to flow database"
        );
        let options = settings.connect_options();
        let conn = MySqlConnection::connect_with(&options)
            .await
            .map_err(|err| store_error("connect to mysql", err))?;

        let mut store = Self {
            options,
            conn: Some(conn),
        };
        store.bootstrap().await?;
        Ok(store)
    }

    #[cfg(test)]
    fn disconnected(settings: &DatabaseSettings) -> Self {
        Self {
            options: settings.connect_options(),
            conn: None,
        }
    }

    async fn connection(&mut self) -> Result<&mut MySqlConnection, StoreError> {
        if self.conn.is_none() {
            self.reconnect().await?;
        }
        self.conn
            .as_mut()
            .ok_or_else(|| StoreError::Internal("mysql connection missing".to_owned()))
    }

    /// Forgets the connection when `result` shows it is no longer usable.
    fn track<T>(&mut self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(StoreError::Unavailable(_)) = &result {
            self.conn = None;
        }
        result
    }

    async fn bootstrap(&mut self) -> Result<(), StoreError> {
        let conn = self.connection().await?;
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(FLOW_TABLE)
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| store_error("check flow table", err))?;

        if tables == 0 {
            tracing::info!(table = FLOW_TABLE, "flow table not found, creating");
            sqlx::query(CREATE_FLOW_TABLE)
                .execute(conn)
                .await
                .map_err(|err| store_error("create flow table", err))?;
        }
        Ok(())
    }
}

impl FlowStore for MySqlFlowStore {
    async fn exists(
        &mut self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ExistingFlow>, StoreError> {
        let conn = self.connection().await?;
        let result: Result<Option<(u32, Option<String>)>, _> = sqlx::query_as(
            "SELECT `id`, `req.keys` FROM `flow` WHERE `req.hash` = ? ORDER BY `id` LIMIT 1",
        )
        .bind(fingerprint.as_str())
        .fetch_optional(conn)
        .await
        .map_err(|err| store_error("select flow by fingerprint", err));

        let row = self.track(result)?;
        Ok(row.map(|(id, keys)| ExistingFlow {
            id: i64::from(id),
            keys: keys.unwrap_or_default(),
        }))
    }

    async fn insert(&mut self, entry: &StoredFlowEntry) -> Result<i64, StoreError> {
        let conn = self.connection().await?;
        let result = sqlx::query(
            r#"INSERT INTO `flow` (
              `req.method`,
              `req.scheme`,
              `req.host`,
              `req.port`,
              `req.path`,
              `req.headers`,
              `req.content`,
              `req.start`,
              `req.keys`,
              `req.hash`,
              `resp.code`,
              `resp.reason`,
              `resp.headers`,
              `resp.content`,
              `created`
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&entry.method)
        .bind(&entry.scheme)
        .bind(&entry.host)
        .bind(entry.port)
        .bind(&entry.path)
        .bind(&entry.request_headers)
        .bind(&entry.request_content)
        .bind(entry.request_start)
        .bind(&entry.keys)
        .bind(entry.fingerprint.as_str())
        .bind(entry.response_code)
        .bind(&entry.response_reason)
        .bind(&entry.response_headers)
        .bind(&entry.response_content)
        .bind(entry.created)
        .execute(conn)
        .await
        .map_err(|err| store_error("insert flow", err));

        let done = self.track(result)?;
        i64::try_from(done.last_insert_id())
            .map_err(|_| StoreError::Internal("flow id exceeds i64 range".to_owned()))
    }

    async fn reconnect(&mut self) -> Result<(), StoreError> {
        self.conn = None;
        let conn = MySqlConnection::connect_with(&self.options)
            .await
            .map_err(|err| store_error("reconnect to mysql", err))?;
        tracing::info!("reconnected to flow database");
        self.conn = Some(conn);
        Ok(())
    }

    async fn close(self) -> Result<(), StoreError> {
        let Some(conn) = self.conn else {
            return Ok(());
        };
        conn.close()
            .await
            .map_err(|err| store_error("close mysql connection", err))
    }
}

fn store_error(action: &str, err: sqlx::Error) -> StoreError {
    let message = format!("{action}: {err}");
    match &err {
        sqlx::Error::Database(db_err) => {
            let number = db_err
                .try_downcast_ref::<MySqlDatabaseError>()
                .map(MySqlDatabaseError::number);
            let data_state = db_err.code().is_some_and(|code| code.starts_with("22"));
            if number.is_some_and(|number| CONNECTION_LOST_NUMBERS.contains(&number)) {
                StoreError::Unavailable(message)
            } else if data_state
                || number.is_some_and(|number| DATA_ERROR_NUMBERS.contains(&number))
            {
                StoreError::Data(message)
            } else {
                StoreError::Internal(message)
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(message),
        sqlx::Error::Encode(_) => StoreError::Data(message),
        _ => StoreError::Internal(message),
    }
}
