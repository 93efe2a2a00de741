use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    handlers::{create_secret, health, retrieve_secret, run_cleanup},
    lifecycle::{Limits, SecretService, DEFAULT_MAX_CONTENT_CHARS, DEFAULT_MAX_TTL_MINUTES},
    store::{crypto, crypto::EncryptionKey, MemoryStore, RedbStore, SecretStore},
    AppState,
};

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Where secret records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// redb database file `cinder.db` in the data directory.
    #[default]
    Redb,
    /// Process memory. Everything is lost on restart.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redb" => Ok(Self::Redb),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown storage backend {other:?} (expected redb or memory)"),
        }
    }
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Passphrase the encryption key is derived from. When absent a random key
    /// is generated once and persisted as `cinder.key`.
    pub master_key: Option<String>,
    pub storage: StorageBackend,
    pub limits: Limits,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            data_dir: None,
            master_key: None,
            storage: StorageBackend::default(),
            limits: Limits::default(),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            cors_origins: None,
            public_url: None,
        }
    }
}

impl ServerConfig {
    /// Build a config from `CINDER_*` environment variables, falling back to
    /// defaults for unset ones. A variable that is set but does not parse is an
    /// error rather than a silent fallback.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let cfg = Self {
            host: lookup("CINDER_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "CINDER_PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("CINDER_DATA_DIR").map(PathBuf::from),
            master_key: None,
            storage: parse_var(&lookup, "CINDER_STORAGE")?.unwrap_or(defaults.storage),
            limits: Limits {
                max_content_chars: parse_var(&lookup, "CINDER_MAX_CONTENT_CHARS")?
                    .unwrap_or(DEFAULT_MAX_CONTENT_CHARS),
                max_ttl_minutes: parse_var(&lookup, "CINDER_MAX_TTL_MINUTES")?
                    .unwrap_or(DEFAULT_MAX_TTL_MINUTES),
            },
            sweep_interval: parse_var(&lookup, "CINDER_SWEEP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            cors_origins: lookup("CINDER_CORS_ORIGINS"),
            public_url: lookup("CINDER_PUBLIC_URL"),
        };
        cfg.check()?;
        Ok(cfg)
    }

    fn check(&self) -> Result<()> {
        self.limits.check().context("invalid limits")?;
        if self.sweep_interval.is_zero() {
            anyhow::bail!("CINDER_SWEEP_INTERVAL_SECS must be at least 1");
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {name}={raw:?}: {e}"))
        })
        .transpose()
}

/// Read a master key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the master key from `CINDER_MASTER_KEY_FILE` (preferred) or `CINDER_MASTER_KEY`.
/// Returns `None` when neither is set.
pub fn resolve_master_key() -> Result<Option<String>> {
    if let Ok(path) = std::env::var("CINDER_MASTER_KEY_FILE") {
        let key = read_key_file(Path::new(&path))?;
        if std::env::var("CINDER_MASTER_KEY").is_ok() {
            warn!("both CINDER_MASTER_KEY and CINDER_MASTER_KEY_FILE are set; using file");
        }
        return Ok(Some(key));
    }
    match std::env::var("CINDER_MASTER_KEY") {
        Ok(key) if key.trim().is_empty() => anyhow::bail!("CINDER_MASTER_KEY must not be empty"),
        Ok(key) => Ok(Some(key)),
        Err(_) => Ok(None),
    }
}

/// Resolve (and create) the directory holding `cinder.db`, `cinder.key` and
/// `cinder.salt`. Without an explicit directory the platform data directory is
/// used (`~/.local/share/cinder/` on Linux).
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let path = match data_dir {
        Some(d) => d.clone(),
        None => ProjectDirs::from("", "", "cinder")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir: {}", path.display()))?;
    Ok(path)
}

/// Open the configured store and load its key material.
fn open_store(cfg: &ServerConfig) -> Result<(Arc<dyn SecretStore>, EncryptionKey)> {
    match cfg.storage {
        StorageBackend::Memory => {
            let key = match &cfg.master_key {
                // Nothing is persisted, so a per-process salt is enough.
                Some(master) => crypto::derive_key(master, &crypto::generate_salt())?,
                None => crypto::generate_key(),
            };
            info!("using in-memory storage; secrets will not survive a restart");
            Ok((Arc::new(MemoryStore::new()), key))
        }
        StorageBackend::Redb => {
            let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
            info!(data_dir = %data_dir.display(), "using data directory");

            let key = match &cfg.master_key {
                Some(master) => {
                    let salt = load_or_create_salt(&data_dir)?;
                    crypto::derive_key(master, &salt).context("derive encryption key")?
                }
                None => load_or_create_key(&data_dir)?,
            };

            let store = RedbStore::open(&data_dir.join("cinder.db")).context("open store")?;
            Ok((Arc::new(store), key))
        }
    }
}

/// Build the HTTP application around `state`.
pub fn app(state: AppState, cors_origins: Option<&str>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/secrets", post(create_secret))
        .route("/secrets/{id}", get(retrieve_secret))
        .route("/cleanup", post(run_cleanup))
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    cfg.check()?;
    let (store, key) = open_store(&cfg)?;
    let service = Arc::new(SecretService::new(store, key, cfg.limits));

    service.clone().spawn_sweep(cfg.sweep_interval);

    let state = AppState {
        service,
        public_url: cfg
            .public_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_owned()),
    };

    let app = app(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "cinder server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn load_or_create_key(data_dir: &Path) -> Result<EncryptionKey> {
    let key_path = data_dir.join("cinder.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read cinder.key")?;
        crypto::load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "cinder.key is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let key = crypto::generate_key();
        write_private(&key_path, key.as_bytes()).context("write cinder.key")?;
        info!("generated new encryption key");
        Ok(key)
    }
}

fn load_or_create_salt(data_dir: &Path) -> Result<[u8; 32]> {
    let salt_path = data_dir.join("cinder.salt");
    if salt_path.exists() {
        let bytes = std::fs::read(&salt_path).context("read cinder.salt")?;
        bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "cinder.salt is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let salt = crypto::generate_salt();
        write_private(&salt_path, &salt).context("write cinder.salt")?;
        info!("generated new key derivation salt");
        Ok(salt)
    }
}

/// Write `bytes` to `path`, readable only by the owner on Unix.
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
