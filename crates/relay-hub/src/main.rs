mod hub;
mod upstream;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use hub::{HubConfig, HubState, DEFAULT_FALLBACK_REPLY};
use relay_core::wire::DEFAULT_MAX_INBOUND_BYTES;
use relay_core::{ReasoningExtractor, ReasoningMarkers, SessionStore};
use relay_storage::{ChatStore, FailoverStore, MemoryChatStore};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use upstream::{parse_endpoints, UpstreamClient, UpstreamConfig, DEFAULT_UPSTREAM_URL};

const DEFAULT_ADDR: &str = "127.0.0.1:8765";
const DEFAULT_DB_PATH: &str = ".relay/chat.sqlite3";
const DEFAULT_LOG_DIR: &str = ".relay/logs";
const DEFAULT_UPSTREAM_USER: &str = "local-user";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    /// Empty keeps everything in memory.
    db_path: String,
    debug: bool,
    log_dir: String,
    hub: HubConfig,
    upstream: UpstreamConfig,
}

#[derive(Parser, Debug)]
#[command(name = "relay-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long)]
    db_path: Option<String>,
    /// Upstream chat endpoint; repeat to list fallbacks in priority order.
    #[arg(long = "upstream-url")]
    upstream_urls: Vec<String>,
    #[arg(long, default_value = "")]
    api_key: String,
    #[arg(long, default_value = "")]
    upstream_user: String,
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,
    #[arg(long, default_value_t = 120)]
    idle_timeout: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    fallback_reply: String,
    #[arg(long, default_value_t = 256)]
    max_connections: usize,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config(Args::parse());
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let (store, backend) = open_store(&config.db_path);
    let upstream = match UpstreamClient::new(config.upstream.clone()) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };
    let hub = Arc::new(HubState::new(
        config.hub.clone(),
        store,
        upstream,
        ReasoningExtractor::new(ReasoningMarkers::default()),
    ));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        store = backend,
        upstream_candidates = config.upstream.endpoints.len(),
        max_connections = config.hub.max_connections
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }
    info!(event = "hub_stop", active = hub.connection_count().await);
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr).await;
    })
}

/// Opens the configured store. A database that cannot be opened leaves the
/// process on the in-memory store for good.
fn open_store(db_path: &str) -> (Arc<dyn SessionStore>, &'static str) {
    if db_path.trim().is_empty() {
        info!(event = "store_open", backend = "memory");
        return (Arc::new(MemoryChatStore::new()), "memory");
    }
    match ChatStore::open(db_path) {
        Ok(store) => {
            info!(event = "store_open", backend = "sqlite", path = %db_path);
            (Arc::new(FailoverStore::new(Box::new(store))), "sqlite")
        }
        Err(err) => {
            error!(
                event = "store_failover",
                path = %db_path,
                error = %err,
                "database unavailable; continuing with in-memory store"
            );
            (Arc::new(MemoryChatStore::new()), "memory")
        }
    }
}

fn load_config(args: Args) -> Config {
    let debug = args.debug || env_true("RELAY_DEBUG");
    let api_key = resolve_string(&args.api_key, "RELAY_API_KEY", "");
    let fallback_reply = resolve_string(
        &args.fallback_reply,
        "RELAY_FALLBACK_REPLY",
        DEFAULT_FALLBACK_REPLY,
    );
    Config {
        addr: resolve_string(&args.addr, "RELAY_ADDR", DEFAULT_ADDR),
        db_path: resolve_db_path(args.db_path.as_deref()),
        debug,
        log_dir: resolve_string(&args.log_dir, "RELAY_LOG_DIR", DEFAULT_LOG_DIR),
        hub: HubConfig {
            max_connections: args.max_connections,
            max_inbound_bytes: DEFAULT_MAX_INBOUND_BYTES,
            write_timeout: Duration::from_secs(args.write_timeout),
            fallback_reply,
            debug,
        },
        upstream: UpstreamConfig {
            endpoints: resolve_endpoints(&args.upstream_urls),
            api_key: (!api_key.trim().is_empty()).then_some(api_key),
            user: resolve_string(
                &args.upstream_user,
                "RELAY_UPSTREAM_USER",
                DEFAULT_UPSTREAM_USER,
            ),
            connect_timeout: Duration::from_secs(args.connect_timeout),
            idle_timeout: Duration::from_secs(args.idle_timeout),
        },
    }
}

fn resolve_string(flag: &str, key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

/// An explicitly empty flag or variable selects the in-memory store.
fn resolve_db_path(flag: Option<&str>) -> String {
    if let Some(value) = flag {
        return value.trim().to_string();
    }
    if let Ok(value) = std::env::var("RELAY_DB_PATH") {
        return value.trim().to_string();
    }
    DEFAULT_DB_PATH.to_string()
}

fn resolve_endpoints(flags: &[String]) -> Vec<String> {
    let from_flags = parse_endpoints(flags.iter().map(String::as_str));
    if !from_flags.is_empty() {
        return from_flags;
    }
    if let Ok(value) = std::env::var("RELAY_UPSTREAM_URLS") {
        let from_env = parse_endpoints([value.as_str()]);
        if !from_env.is_empty() {
            return from_env;
        }
    }
    vec![DEFAULT_UPSTREAM_URL.to_string()]
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if let Ok(level) = std::env::var("RELAY_LOG_LEVEL") {
        level
    } else if config.debug {
        "debug".to_string()
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Tees every log line to stdout and the hub log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("relay-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn explicit_flags_win_and_keep_candidate_order() {
        let args = Args::try_parse_from([
            "relay-hub",
            "--addr",
            "0.0.0.0:9000",
            "--db-path",
            "",
            "--upstream-url",
            "http://primary/v1/chat-messages",
            "--upstream-url",
            "http://secondary/chat-messages,http://primary/v1/chat-messages",
            "--api-key",
            "secret",
            "--upstream-user",
            "tester",
            "--fallback-reply",
            "try later",
            "--max-connections",
            "8",
            "--idle-timeout",
            "0",
        ])
        .expect("parse args");
        let config = load_config(args);

        assert_eq!(config.addr, "0.0.0.0:9000");
        assert_eq!(config.db_path, "");
        assert_eq!(
            config.upstream.endpoints,
            vec![
                "http://primary/v1/chat-messages".to_string(),
                "http://secondary/chat-messages".to_string(),
            ]
        );
        assert_eq!(config.upstream.api_key.as_deref(), Some("secret"));
        assert_eq!(config.upstream.user, "tester");
        assert!(config.upstream.idle_timeout.is_zero());
        assert_eq!(config.hub.fallback_reply, "try later");
        assert_eq!(config.hub.max_connections, 8);
    }

    #[test]
    fn db_path_flag_is_trimmed() {
        assert_eq!(resolve_db_path(Some("  data/chat.db ")), "data/chat.db");
        assert_eq!(resolve_db_path(Some("")), "");
    }

    #[test]
    fn empty_db_path_uses_memory_store() {
        let (_, backend) = open_store("");
        assert_eq!(backend, "memory");
    }

    #[test]
    fn unusable_database_falls_back_to_memory() {
        let blocker = NamedTempFile::new().expect("temp file");
        let path = blocker.path().join("chat.sqlite3");
        let (store, backend) = open_store(path.to_str().expect("utf8 path"));
        assert_eq!(backend, "memory");
        store
            .create_conversation("u-1", None)
            .expect("memory store serves requests");
    }

    #[test]
    fn sqlite_database_is_opened_behind_failover() {
        let file = NamedTempFile::new().expect("temp file");
        let (store, backend) = open_store(file.path().to_str().expect("utf8 path"));
        assert_eq!(backend, "sqlite");
        let conversation = store
            .create_conversation("u-1", Some("Persisted"))
            .expect("create");
        assert_eq!(conversation.title, "Persisted");
    }
}
