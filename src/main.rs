use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::Parser;
use envconfig::Envconfig;
use flowstash::{
    config::{Config, StoreBackend},
    ingest::Ingestor,
    logging,
    store::{
        FlowStore,
        mysql::{DatabaseSettings, MySqlFlowStore},
        sqlite::SqliteFlowStore,
    },
    tail::TailReader,
};

const MISSING_DATABASE_ENV_HINT: &str = "database settings are read from the environment; \
     set host, user, password and database (port defaults to 3306), ex: export host=127.0.0.1";

/// Tail a proxy capture file and store one record per distinct endpoint.
#[derive(Debug, Parser)]
#[command(name = "flowstash", version)]
struct Cli {
    /// Capture file written by the proxy, one JSON flow per line.
    capture_file: PathBuf,
    /// Optional path to config TOML. Built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long)]
    log_level: Option<String>,
    /// Override how often the capture file is checked for new lines.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval_ms: Option<u64>,
    /// Store flows in this SQLite file instead of MySQL.
    #[arg(long, value_name = "PATH")]
    sqlite: Option<PathBuf>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(poll_interval_ms) = self.poll_interval_ms {
            config.tail.poll_interval_ms = poll_interval_ms;
        }
        if let Some(path) = &self.sqlite {
            config.store.backend = StoreBackend::Sqlite;
            config.store.sqlite_path = Some(path.clone());
        }
    }
}

#[derive(Debug)]
enum Backend {
    Mysql(DatabaseSettings),
    Sqlite(PathBuf),
}

fn resolve_backend(config: &Config) -> anyhow::Result<Backend> {
    match config.store.backend {
        StoreBackend::Mysql => DatabaseSettings::init_from_env()
            .map(Backend::Mysql)
            .context(MISSING_DATABASE_ENV_HINT),
        StoreBackend::Sqlite => config
            .store
            .sqlite_path
            .clone()
            .map(Backend::Sqlite)
            .context("sqlite backend needs `[store] sqlite_path` in config or `--sqlite PATH`"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    logging::init(&config, cli.log_level.as_deref())?;

    let backend = resolve_backend(&config)?;
    tracing::info!("{}", startup_summary(&config, &cli.capture_file, &backend));

    match backend {
        Backend::Mysql(settings) => {
            let store = MySqlFlowStore::connect(&settings)
                .await
                .context("connect to flow database")?;
            ingest_with(store, &cli.capture_file, &config).await
        }
        Backend::Sqlite(path) => {
            let store = SqliteFlowStore::open(path)?;
            ingest_with(store, &cli.capture_file, &config).await
        }
    }
}

async fn ingest_with<S: FlowStore + Send>(
    store: S,
    capture_file: &Path,
    config: &Config,
) -> anyhow::Result<()> {
    let mut source = TailReader::open(capture_file, config.tail_options()).await?;
    let mut ingestor = Ingestor::new(store, config.retry_policy());

    let result = ingestor.run(&mut source, shutdown_signal()).await;
    if let Err(err) = ingestor.into_store().close().await {
        tracing::warn!("failed to close flow store: {err}");
    }
    let stats = result?;

    tracing::info!(
        inserted = stats.inserted,
        skipped = stats.skipped,
        dropped = stats.dropped,
        malformed = source.malformed_total(),
        "stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to register SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}

fn startup_summary(config: &Config, capture_file: &Path, backend: &Backend) -> String {
    let store = match backend {
        Backend::Mysql(settings) => format!(
            "mysql://{}@{}:{}/{}",
            settings.user, settings.host, settings.port, settings.database
        ),
        Backend::Sqlite(path) => format!("sqlite:{}", path.display()),
    };
    let retry = config.retry_policy();

    format!(
        "startup config: capture_file={}, store={}, poll_interval_ms={}, malformed_lines={:?}, retry_attempts={}",
        capture_file.display(),
        store,
        config.tail.poll_interval_ms,
        config.ingest.malformed_lines,
        retry.max_attempts()
    )
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, path::PathBuf};

    use clap::Parser;
    use envconfig::Envconfig;
    use flowstash::{
        config::{Config, StoreBackend},
        store::mysql::DatabaseSettings,
    };

    use super::{Backend, Cli, resolve_backend, startup_summary};

    #[test]
    fn parses_capture_file_only() {
        let cli = Cli::try_parse_from(["flowstash", "proxy.mitm"]).unwrap();
        assert_eq!(cli.capture_file, PathBuf::from("proxy.mitm"));
        assert_eq!(cli.config, None);
        assert_eq!(cli.log_level, None);
        assert_eq!(cli.poll_interval_ms, None);
        assert_eq!(cli.sqlite, None);
    }

    #[test]
    fn capture_file_is_required() {
        let err = Cli::try_parse_from(["flowstash"]).unwrap_err();
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn overrides_replace_config_values() {
        let cli = Cli::try_parse_from([
            "flowstash",
            "--config",
            "flowstash.toml",
            "--log-level",
            "debug",
            "--poll-interval-ms",
            "20",
            "--sqlite",
            "flows.sqlite",
            "proxy.mitm",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("flowstash.toml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));

        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.tail.poll_interval_ms, 20);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.sqlite_path, Some(PathBuf::from("flows.sqlite")));

        match resolve_backend(&config).unwrap() {
            Backend::Sqlite(path) => assert_eq!(path, PathBuf::from("flows.sqlite")),
            other => panic!("expected sqlite backend, got {other:?}"),
        }
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        assert!(Cli::try_parse_from(["flowstash", "--poll-interval-ms", "0", "proxy.mitm"]).is_err());
    }

    #[test]
    fn sqlite_backend_without_path_is_an_error() {
        let config = Config::from_toml_str("[store]\nbackend = \"sqlite\"\n").unwrap();
        let err = resolve_backend(&config).unwrap_err();
        assert!(err.to_string().contains("sqlite_path"), "error: {err}");
    }

    #[test]
    fn startup_summary_never_prints_the_password() {
        let settings = DatabaseSettings::init_from_hashmap(&HashMap::from([
            ("host".to_owned(), "db.internal".to_owned()),
            ("user".to_owned(), "stash".to_owned()),
            ("password".to_owned(), "hunter2".to_owned()),
            ("database".to_owned(), "proxy".to_owned()),
        ]))
        .unwrap();

        let summary = startup_summary(
            &Config::default(),
            std::path::Path::new("proxy.mitm"),
            &Backend::Mysql(settings),
        );
        assert!(summary.contains("mysql://stash@db.internal:3306/proxy"), "{summary}");
        assert!(summary.contains("capture_file=proxy.mitm"), "{summary}");
        assert!(!summary.contains("hunter2"), "{summary}");
    }
}
