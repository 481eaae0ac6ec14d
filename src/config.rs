//! Configuration loading, validation, and hot reload.
//!
//! Mirrors the pairing the surrounding system uses everywhere else it needs
//! live-reloadable TOML: an [`arc_swap::ArcSwap`] holding the current
//! snapshot, and a [`notify`] filesystem watcher that debounces writes and
//! republishes a new snapshot. The piece specific to this crate is that the
//! republished value is a [`ConfigChange`] carrying the set of affected
//! top-level keys alongside the snapshot, so [`crate::stream::StreamingClient`]
//! can ignore reloads that don't touch `usenet.*` settings.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors encountered while loading or watching configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    ValidationError(String),

    #[error("failed to watch configuration file: {0}")]
    WatchError(#[from] notify::Error),
}

fn default_port() -> u16 {
    119
}

fn default_connections() -> u32 {
    10
}

fn default_readiness_timeout_secs() -> u64 {
    30
}

fn default_cache_capacity() -> usize {
    8192
}

fn default_prefetch_degree() -> usize {
    4
}

/// One configured Usenet provider: display name, endpoint, credentials, and
/// a per-provider connection cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default = "default_connections")]
    pub connections: u32,
}

impl ProviderRecord {
    /// Connection cap, clamped to at least 1 per the data model invariant.
    pub fn max_connections(&self) -> u32 {
        self.connections.max(1)
    }
}

/// The `[usenet]` section of the configuration file: the primary provider
/// plus any additional backup providers, and the pool-level knobs this
/// crate owns (readiness timeout, cache size, default prefetch degree).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsenetSection {
    #[serde(default = "default_primary_name")]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, rename = "use-ssl")]
    pub use_ssl: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default = "default_connections")]
    pub connections: u32,
    /// Additional providers beyond the primary one above.
    #[serde(default)]
    pub providers: Vec<ProviderRecord>,
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_prefetch_degree")]
    pub stream_prefetch_degree: usize,
}

fn default_primary_name() -> String {
    "primary".to_string()
}

impl Default for UsenetSection {
    fn default() -> Self {
        Self {
            name: default_primary_name(),
            host: String::new(),
            port: default_port(),
            use_ssl: false,
            user: String::new(),
            pass: String::new(),
            connections: default_connections(),
            providers: Vec::new(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            cache_capacity: default_cache_capacity(),
            stream_prefetch_degree: default_prefetch_degree(),
        }
    }
}

/// Top-level configuration snapshot. Only the `usenet` section matters to
/// this crate; the surrounding system's config file carries many more
/// sections that are simply ignored here (`#[serde(default)]` everywhere
/// means unrelated keys never fail parsing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NntpConfig {
    #[serde(default)]
    pub usenet: UsenetSection,
}

/// The set of top-level keys that, if touched by a config reload, should
/// trigger a pool rebuild. Matches spec.md's external-interface key list.
pub const WATCHED_KEYS: &[&str] = &[
    "usenet.host",
    "usenet.port",
    "usenet.use-ssl",
    "usenet.user",
    "usenet.pass",
    "usenet.connections",
    "usenet.providers",
];

impl NntpConfig {
    /// Load and validate a configuration snapshot from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        let config: NntpConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants that serde's defaults alone can't
    /// express (non-empty host, non-zero caps).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.usenet.host.is_empty() {
            return Err(ConfigError::ValidationError(
                "usenet.host must not be empty".into(),
            ));
        }
        for provider in &self.usenet.providers {
            if provider.host.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "provider '{}' has an empty host",
                    provider.name
                )));
            }
        }
        Ok(())
    }

    /// The ordered provider list the allocator consumes: the primary
    /// `[usenet]` endpoint first, followed by any additional providers.
    pub fn provider_records(&self) -> Vec<ProviderRecord> {
        let mut records = Vec::with_capacity(1 + self.usenet.providers.len());
        records.push(ProviderRecord {
            name: self.usenet.name.clone(),
            host: self.usenet.host.clone(),
            port: self.usenet.port,
            use_ssl: self.usenet.use_ssl,
            user: self.usenet.user.clone(),
            pass: self.usenet.pass.clone(),
            connections: self.usenet.connections,
        });
        records.extend(self.usenet.providers.iter().cloned());
        records
    }

    /// Diff two snapshots down to the watched-key vocabulary, returning the
    /// subset of [`WATCHED_KEYS`] whose underlying value actually changed.
    fn changed_keys(&self, other: &NntpConfig) -> HashSet<String> {
        let mut keys = HashSet::new();
        let (a, b) = (&self.usenet, &other.usenet);
        if a.host != b.host {
            keys.insert("usenet.host".to_string());
        }
        if a.port != b.port {
            keys.insert("usenet.port".to_string());
        }
        if a.use_ssl != b.use_ssl {
            keys.insert("usenet.use-ssl".to_string());
        }
        if a.user != b.user {
            keys.insert("usenet.user".to_string());
        }
        if a.pass != b.pass {
            keys.insert("usenet.pass".to_string());
        }
        if a.connections != b.connections {
            keys.insert("usenet.connections".to_string());
        }
        if a.providers != b.providers {
            keys.insert("usenet.providers".to_string());
        }
        keys
    }
}

/// A config-reload notification: the keys that changed, and the new
/// snapshot to rebuild from. This is the language-neutral rendering of "the
/// config layer's observer callback" spec.md §9 describes.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub keys: HashSet<String>,
    pub snapshot: NntpConfig,
}

impl ConfigChange {
    /// Whether any changed key is one [`StreamingClient`](crate::stream::StreamingClient)
    /// needs to act on (a pool-affecting key).
    pub fn touches_usenet_pool(&self) -> bool {
        self.keys.iter().any(|k| WATCHED_KEYS.contains(&k.as_str()))
    }
}

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches a TOML file on disk, republishing [`ConfigChange`] notifications
/// whenever it's modified. Modeled on the surrounding system's config
/// manager: an `ArcSwap` for lock-free reads of the latest snapshot, a
/// debounced filesystem watcher, and an `mpsc` channel carrying reload
/// events to whoever owns the pool.
pub struct ConfigWatcher {
    path: PathBuf,
    current: Arc<ArcSwap<NntpConfig>>,
    watcher: RwLock<Option<notify::RecommendedWatcher>>,
}

impl ConfigWatcher {
    /// Load the initial snapshot and construct a watcher for it. Does not
    /// start watching until [`ConfigWatcher::start`] is called.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let initial = NntpConfig::load(&path)?;
        Ok(Self {
            path,
            current: Arc::new(ArcSwap::from_pointee(initial)),
            watcher: RwLock::new(None),
        })
    }

    /// The current configuration snapshot, read without locking.
    pub fn config(&self) -> Arc<NntpConfig> {
        self.current.load_full()
    }

    /// Start watching the backing file, returning a channel that receives a
    /// [`ConfigChange`] on every debounced modification. The returned
    /// receiver yields changes even for keys outside `usenet.*`; callers
    /// filter with [`ConfigChange::touches_usenet_pool`].
    pub fn start(&self) -> Result<mpsc::UnboundedReceiver<ConfigChange>, ConfigError> {
        use notify::{RecursiveMode, Watcher};

        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = fs_tx.send(());
                }
            }
        })?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        *self.watcher.write() = Some(watcher);

        let (change_tx, change_rx) = mpsc::unbounded_channel::<ConfigChange>();
        let path = self.path.clone();
        let current = Arc::clone(&self.current);

        tokio::spawn(async move {
            while fs_rx.recv().await.is_some() {
                // Debounce: drain any events that arrive in quick succession
                // and settle before re-reading the file.
                tokio::time::sleep(DEBOUNCE).await;
                while fs_rx.try_recv().is_ok() {}

                let old = current.load_full();
                match NntpConfig::load(&path) {
                    Ok(new_config) => {
                        let keys = old.changed_keys(&new_config);
                        if keys.is_empty() {
                            debug!(path = %path.display(), "config reload produced no change");
                            continue;
                        }
                        info!(path = %path.display(), ?keys, "config changed");
                        current.store(Arc::new(new_config.clone()));
                        if change_tx
                            .send(ConfigChange {
                                keys,
                                snapshot: new_config,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to reload config, keeping previous snapshot");
                    }
                }
            }
        });

        Ok(change_rx)
    }

    /// Stop watching the backing file. Idempotent.
    pub fn stop(&self) {
        *self.watcher.write() = None;
    }
}
