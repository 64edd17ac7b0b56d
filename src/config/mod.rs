use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock, Weak};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub web: WebConfig,
    pub database: DatabaseConfig,
    pub proxy: ProxyConfig,
    pub bilibili: PlatformConfig,
    pub missevan: PlatformConfig,
    pub recorder: RecorderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    /// External base URL used when generating proxy playlist links
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

/// Outbound proxy used for every upstream request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub enabled: bool,
    /// Use the system environment proxy instead of an explicit host
    pub system_proxy: bool,
    /// "http" or "socks5"
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Per-platform authentication material
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub cookie: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Directory that rendered filename patterns are rooted at
    pub output_dir: PathBuf,
    /// Filename template; `{Sequence}` and `{Ext}` are appended when missing
    pub filename_pattern: String,
    /// Rotate the output file past this size, in MiB. 0 disables.
    pub max_filesize: u64,
    /// Rotate the output file past this duration, in minutes. 0 disables.
    pub max_duration: u64,
    /// External muxer binary
    pub ffmpeg_command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 8090,
                base_url: "http://localhost:8090".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://./liveroom-proxy.db".to_string(),
                max_connections: Some(10),
            },
            proxy: ProxyConfig {
                protocol: "http".to_string(),
                ..ProxyConfig::default()
            },
            bilibili: PlatformConfig::default(),
            missevan: PlatformConfig::default(),
            recorder: RecorderConfig {
                output_dir: PathBuf::from("./data/records"),
                filename_pattern:
                    "{Username}/{Year}-{Month}-{Day}_{Hour}-{Minute}-{Second}_{Sequence}.{Ext}"
                        .to_string(),
                max_filesize: 2048,
                max_duration: 0,
                ffmpeg_command: "ffmpeg".to_string(),
            },
        }
    }
}

impl Config {
    /// Load the configuration from a toml file, writing the defaults out when
    /// the file does not exist yet.
    pub fn load(path: &str) -> Result<Self> {
        if std::path::Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            if let Some(dir) = std::path::Path::new(path).parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)?;
                }
            }
            std::fs::write(path, contents)?;
            info!("wrote default configuration to {}", path);
            Ok(default_config)
        }
    }
}

/// Receives one-shot synchronous notifications when a configuration key
/// changes. Implementors must not block or re-enter the settings facade.
pub trait ConfigSubscriber: Send + Sync {
    fn on_config_update(&self, key: &str, value: &str);
}

/// Mutable key/value configuration shared across the process.
///
/// Seeded from the config file and the config table at startup; the web layer
/// persists updates through the repository and then publishes them here so
/// subscribers (streamers holding cookies) pick them up without a restart.
pub struct RuntimeSettings {
    values: RwLock<HashMap<String, String>>,
    subscribers: Mutex<Vec<Weak<dyn ConfigSubscriber>>>,
}

impl RuntimeSettings {
    pub fn new(initial: HashMap<String, String>) -> Self {
        Self {
            values: RwLock::new(initial),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .expect("settings lock poisoned")
            .get(key)
            .cloned()
    }

    /// Update a key and notify every live subscriber synchronously.
    pub fn set(&self, key: &str, value: &str) {
        self.values
            .write()
            .expect("settings lock poisoned")
            .insert(key.to_string(), value.to_string());

        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        subscribers.retain(|weak| match weak.upgrade() {
            Some(subscriber) => {
                subscriber.on_config_update(key, value);
                true
            }
            None => false,
        });
        debug!("configuration updated: {} ({} subscribers)", key, subscribers.len());
    }

    /// Register a subscriber. Held weakly so a stopped manager's streamer
    /// drops out of the list on its own.
    pub fn add_subscriber(&self, subscriber: Weak<dyn ConfigSubscriber>) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(subscriber);
    }

    /// All current key/value pairs, for the config listing endpoint.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values
            .read()
            .expect("settings lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSubscriber {
        seen: AtomicUsize,
    }

    impl ConfigSubscriber for CountingSubscriber {
        fn on_config_update(&self, _key: &str, _value: &str) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn set_notifies_live_subscribers_and_drops_dead_ones() {
        let settings = RuntimeSettings::new(HashMap::new());

        let alive = Arc::new(CountingSubscriber {
            seen: AtomicUsize::new(0),
        });
        let dead = Arc::new(CountingSubscriber {
            seen: AtomicUsize::new(0),
        });

        let alive_weak: Weak<dyn ConfigSubscriber> =
            Arc::downgrade(&(alive.clone() as Arc<dyn ConfigSubscriber>));
        let dead_weak: Weak<dyn ConfigSubscriber> =
            Arc::downgrade(&(dead.clone() as Arc<dyn ConfigSubscriber>));
        settings.add_subscriber(alive_weak);
        settings.add_subscriber(dead_weak);
        drop(dead);

        settings.set("bilibili.cookie", "abc");

        assert_eq!(alive.seen.load(Ordering::SeqCst), 1);
        assert_eq!(settings.get("bilibili.cookie").as_deref(), Some("abc"));
        assert_eq!(
            settings
                .subscribers
                .lock()
                .expect("subscriber lock poisoned")
                .len(),
            1
        );
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).expect("serialize");
        let parsed: Config = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.web.port, config.web.port);
        assert_eq!(parsed.recorder.ffmpeg_command, "ffmpeg");
    }
}
