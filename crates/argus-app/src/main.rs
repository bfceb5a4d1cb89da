//! Argus - traffic interception and filtering engine.
//!
//! This is the main binary that runs the full application:
//! - MITM proxy (rule enforcement and traffic capture)
//! - HTTP/WebSocket API server (dashboard backend)

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use argus_core::DEFAULT_BODY_CAPTURE_LIMIT;
use argus_proxy::{
    ProxyConfig, ProxyServer, TrafficRecorder, DEFAULT_MAX_BODY_SIZE, DEFAULT_PROXY_PORT,
    DEFAULT_UPSTREAM_TIMEOUT,
};
use argus_server::{AppState, Server, ServerConfig, DEFAULT_HOST, DEFAULT_PORT};
use argus_storage::{BlocklistWatch, Database, RuleStore};
use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Crates whose log level follows `--log-level`; everything else logs warnings.
const LOG_TARGETS: [&str; 5] = [
    "argus",
    "argus_core",
    "argus_storage",
    "argus_proxy",
    "argus_server",
];

/// How often the blocklist file is checked for changes.
const BLOCKLIST_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Argus - intercepting proxy with domain/keyword blocking and a live dashboard API
#[derive(Parser, Debug)]
#[command(name = "argus", version, about)]
struct Args {
    /// Address both listeners bind to
    #[arg(long, default_value = DEFAULT_HOST)]
    host: IpAddr,

    /// Port for the dashboard API
    #[arg(long, default_value_t = DEFAULT_PORT)]
    api_port: u16,

    /// Port for the intercepting proxy
    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    proxy_port: u16,

    /// Directory holding the database, CA files and logs
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Upstream connect and read timeout, in seconds
    #[arg(long, default_value_t = DEFAULT_UPSTREAM_TIMEOUT.as_secs())]
    upstream_timeout_secs: u64,

    /// Bytes of each request/response body kept in the traffic log
    #[arg(long, default_value_t = DEFAULT_BODY_CAPTURE_LIMIT)]
    max_body_capture: usize,

    /// Largest request or response body the proxy buffers, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_SIZE)]
    max_body_size: usize,

    /// Import blocked domains from a file (one per line), re-importing it
    /// whenever it changes
    #[arg(long, value_name = "FILE")]
    blocklist: Option<PathBuf>,

    /// Recompute hourly statistics from the traffic log before starting
    #[arg(long)]
    rebuild_stats: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn data_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Database::default_data_dir().context("could not determine data directory"),
        }
    }

    fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs.max(1))
    }
}

fn log_filter(level: &str) -> String {
    let mut directives: Vec<String> = LOG_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect();
    directives.push("warn".to_string());
    directives.join(",")
}

/// Initialize logging with file rotation.
fn init_logging(
    args: &Args,
    log_dir: &Path,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_filter(log_level)));

    if std::fs::create_dir_all(log_dir).is_ok() {
        // Rotates daily, keeps the last five files.
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(5)
            .filename_prefix("argus")
            .filename_suffix("log")
            .build(log_dir)
            .ok();

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::info!("Logging to {:?}", log_dir);
            return Some(guard);
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Runs the optional maintenance steps requested on the command line.
/// Returns the blocklist watch once its first import has succeeded.
fn prepare(
    args: &Args,
    db: &Database,
    rules: &RuleStore,
) -> anyhow::Result<Option<BlocklistWatch>> {
    if args.rebuild_stats {
        let buckets = db.rebuild_stats().context("failed to rebuild statistics")?;
        tracing::info!(buckets, "Rebuilt hourly statistics from traffic log");
    }

    let Some(path) = &args.blocklist else {
        return Ok(None);
    };

    let mut watch = BlocklistWatch::new(path);
    match watch
        .poll(rules)
        .with_context(|| format!("failed to import blocklist {:?}", path))?
    {
        Some(added) => tracing::info!(added, "Imported blocklist {:?}", path),
        None => tracing::warn!("Blocklist {:?} does not exist yet", path),
    }
    Ok(Some(watch))
}

/// Re-imports the blocklist whenever its modification time changes.
fn spawn_blocklist_reload(
    mut watch: BlocklistWatch,
    rules: RuleStore,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let rules = rules.clone();
            let polled = tokio::task::spawn_blocking(move || {
                let result = watch.poll(&rules);
                (watch, result)
            })
            .await;

            match polled {
                Ok((returned, result)) => {
                    match result {
                        Ok(Some(added)) => {
                            tracing::info!(added, "Reloaded blocklist {:?}", returned.path())
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!("Failed to reload blocklist {:?}: {}", returned.path(), e)
                        }
                    }
                    watch = returned;
                }
                Err(e) => {
                    tracing::error!("Blocklist reload stopped: {}", e);
                    return;
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let data_dir = args.data_dir()?;

    // Keep the guard alive for the duration of the program.
    let _log_guard = init_logging(&args, &data_dir.join("logs"));

    tracing::info!("Starting Argus...");
    tracing::debug!("Args: {:?}", args);

    let db_path = data_dir.join("argus.db");
    let db = Arc::new(
        Database::with_path(&db_path).with_context(|| format!("failed to open {:?}", db_path))?,
    );
    let rules = RuleStore::load(db.clone()).context("failed to load rules")?;
    if let Some(watch) = prepare(&args, &db, &rules)? {
        spawn_blocklist_reload(watch, rules.clone(), BLOCKLIST_POLL_INTERVAL);
    }

    let recorder = TrafficRecorder::new(db);

    let proxy_config = ProxyConfig::new(data_dir.join("ca"))
        .with_addr(SocketAddr::new(args.host, args.proxy_port))
        .with_upstream_timeout(args.upstream_timeout())
        .with_max_body_capture(args.max_body_capture)
        .with_max_body_size(args.max_body_size);
    let proxy = ProxyServer::new(proxy_config, rules.clone(), recorder.clone())
        .context("failed to initialize proxy")?;
    tracing::info!("Install the root certificate from {:?}", proxy.ca_cert_path());

    let state = AppState::new(rules, recorder, proxy.certificate_authority());
    let server_config = ServerConfig::default()
        .with_host(args.host.to_string())
        .with_port(args.api_port);
    let server = Server::with_state(server_config, state).context("failed to create API server")?;

    tokio::select! {
        result = proxy.run() => result.context("proxy server failed")?,
        result = server.run() => result.context("API server failed")?,
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!("Shutdown signal received");
        }
    }

    tracing::info!("Argus shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["argus"]).unwrap();

        assert_eq!(args.host.to_string(), "127.0.0.1");
        assert_eq!(args.api_port, 5000);
        assert_eq!(args.proxy_port, 8080);
        assert_eq!(args.upstream_timeout(), Duration::from_secs(30));
        assert_eq!(args.max_body_capture, DEFAULT_BODY_CAPTURE_LIMIT);
        assert_eq!(args.max_body_size, DEFAULT_MAX_BODY_SIZE);
        assert!(!args.rebuild_stats);
        assert!(args.blocklist.is_none());
    }

    #[test]
    fn explicit_options() {
        let args = Args::try_parse_from([
            "argus",
            "--host",
            "0.0.0.0",
            "--api-port",
            "5050",
            "--proxy-port",
            "9090",
            "--data-dir",
            "/tmp/argus",
            "--upstream-timeout-secs",
            "0",
            "--blocklist",
            "hosts.txt",
            "--rebuild-stats",
            "--max-body-size",
            "1048576",
        ])
        .unwrap();

        assert_eq!(args.api_port, 5050);
        assert_eq!(args.max_body_size, 1_048_576);
        assert_eq!(args.proxy_port, 9090);
        assert_eq!(args.data_dir().unwrap(), PathBuf::from("/tmp/argus"));
        assert_eq!(args.upstream_timeout(), Duration::from_secs(1));
        assert_eq!(args.blocklist, Some(PathBuf::from("hosts.txt")));
        assert!(args.rebuild_stats);
    }

    #[test]
    fn invalid_host_rejected() {
        assert!(Args::try_parse_from(["argus", "--host", "localhost:80"]).is_err());
    }

    #[test]
    fn log_filter_covers_workspace_crates() {
        let filter = log_filter("debug");
        assert!(filter.starts_with("argus=debug,argus_core=debug"));
        assert!(filter.ends_with(",warn"));
    }

    #[test]
    fn prepare_imports_blocklist() {
        let dir = tempfile::TempDir::new().unwrap();
        let list = dir.path().join("blocklist.txt");
        std::fs::write(&list, "# ads\nads.example.com\n\ntracker.net\n").unwrap();

        let args = Args::try_parse_from([
            "argus",
            "--blocklist",
            list.to_str().unwrap(),
            "--rebuild-stats",
        ])
        .unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        let rules = RuleStore::load(db.clone()).unwrap();

        let watch = prepare(&args, &db, &rules).unwrap();

        assert!(watch.is_some());
        assert_eq!(
            rules.list_rules().domains,
            vec!["ads.example.com".to_string(), "tracker.net".to_string()]
        );
    }

    #[test]
    fn prepare_without_blocklist() {
        let args = Args::try_parse_from(["argus"]).unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        let rules = RuleStore::load(db.clone()).unwrap();

        assert!(prepare(&args, &db, &rules).unwrap().is_none());
    }

    #[tokio::test]
    async fn blocklist_changes_are_picked_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let list = dir.path().join("blocklist.txt");
        std::fs::write(&list, "ads.example.com\n").unwrap();

        let db = Arc::new(Database::in_memory().unwrap());
        let rules = RuleStore::load(db).unwrap();
        let mut watch = BlocklistWatch::new(&list);
        watch.poll(&rules).unwrap();

        let task = spawn_blocklist_reload(watch, rules.clone(), Duration::from_millis(20));

        std::fs::write(&list, "ads.example.com\nnew-tracker.net\n").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&list)
            .unwrap()
            .set_modified(std::time::SystemTime::now() + Duration::from_secs(5))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !rules
                .list_rules()
                .domains
                .contains(&"new-tracker.net".to_string())
            {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        task.abort();
    }
}
