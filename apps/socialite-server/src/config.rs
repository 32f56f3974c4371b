use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use socialite_presence::PresenceConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub service_name: String,
    pub bind: String,
    pub port: u16,
    pub database_path: PathBuf,
    #[serde(with = "humantime_serde")]
    pub status_ttl: Duration,
    pub status_capacity: u64,
    pub queue_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub queue_overflow_wait: Duration,
    pub session_outbound_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub friends_refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub party_refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub refresh_retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub party_poll_interval: Duration,
}

impl ServerConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("service_name", "socialite")?
            .set_default("bind", "0.0.0.0")?
            .set_default("port", 8080)?
            .set_default("database_path", "data/socialite.db")?
            .set_default("status_ttl", "10s")?
            .set_default("status_capacity", 100_000)?
            .set_default("queue_capacity", 1_000)?
            .set_default("queue_overflow_wait", "50ms")?
            .set_default("session_outbound_capacity", 64)?
            .set_default("friends_refresh_interval", "60s")?
            .set_default("party_refresh_interval", "60s")?
            .set_default("refresh_retry_delay", "5s")?
            .set_default("party_poll_interval", "5s")?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // .env files feed the SOCIALITE_ environment source below.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("SOCIALITE").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    /// Rejects settings the server cannot start with.
    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Message("service_name must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Message("port must be non-zero".into()));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::Message("database_path must not be empty".into()));
        }
        self.presence()
            .validate()
            .map_err(|err| ConfigError::Message(err.to_string()))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn presence(&self) -> PresenceConfig {
        PresenceConfig {
            status_ttl: self.status_ttl,
            status_capacity: self.status_capacity,
            queue_capacity: self.queue_capacity,
            queue_overflow_wait: self.queue_overflow_wait,
            session_outbound_capacity: self.session_outbound_capacity,
            friends_refresh_interval: self.friends_refresh_interval,
            party_refresh_interval: self.party_refresh_interval,
            refresh_retry_delay: self.refresh_retry_delay,
            party_poll_interval: self.party_poll_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<F>(vars: &[(&str, &str)], test: F)
    where
        F: FnOnce(),
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut old = Vec::new();
        for (k, v) in vars {
            old.push((k.to_string(), env::var(k).ok()));
            env::set_var(k, v);
        }

        test();

        for (k, maybe_old) in old {
            match maybe_old {
                Some(val) => env::set_var(k, val),
                None => env::remove_var(k),
            }
        }
    }

    #[test]
    fn defaults_are_applied() {
        with_env(&[], || {
            let cfg = ServerConfig::new(None).expect("failed to build config");

            assert_eq!(cfg.service_name, "socialite");
            assert_eq!(cfg.listen_addr(), "0.0.0.0:8080");
            assert_eq!(cfg.database_path, PathBuf::from("data/socialite.db"));
            assert_eq!(cfg.status_ttl, Duration::from_secs(10));
            assert_eq!(cfg.queue_overflow_wait, Duration::from_millis(50));
            assert_eq!(cfg.party_poll_interval, Duration::from_secs(5));
            cfg.verify().expect("defaults verify");

            let presence = cfg.presence();
            assert_eq!(presence.queue_capacity, 1_000);
            assert_eq!(presence.friends_refresh_interval, Duration::from_secs(60));
        });
    }

    #[test]
    fn env_vars_override_defaults() {
        with_env(
            &[
                ("SOCIALITE_PORT", "9191"),
                ("SOCIALITE_SERVICE_NAME", "presence-eu"),
                ("SOCIALITE_QUEUE_CAPACITY", "42"),
                ("SOCIALITE_STATUS_TTL", "2m30s"),
            ],
            || {
                let cfg = ServerConfig::new(None).expect("failed to build config");
                assert_eq!(cfg.port, 9191);
                assert_eq!(cfg.service_name, "presence-eu");
                assert_eq!(cfg.queue_capacity, 42);
                assert_eq!(cfg.status_ttl, Duration::from_secs(150));
            },
        );
    }

    #[test]
    fn file_values_yield_to_env() {
        use std::io::Write;

        let mut tmp = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            tmp,
            r#"
service_name = "from-file"
port = 4242
party_poll_interval = "1s"
"#
        )
        .expect("write to temp file");

        with_env(&[("SOCIALITE_PORT", "9999")], || {
            let cfg = ServerConfig::new(Some(PathBuf::from(tmp.path()))).expect("load config");
            assert_eq!(cfg.service_name, "from-file");
            assert_eq!(cfg.port, 9999);
            assert_eq!(cfg.party_poll_interval, Duration::from_secs(1));
        });
    }

    #[test]
    fn verify_rejects_unusable_values() {
        with_env(&[("SOCIALITE_PORT", "0")], || {
            let cfg = ServerConfig::new(None).expect("load config");
            assert!(cfg.verify().is_err());
        });
        with_env(&[("SOCIALITE_STATUS_TTL", "0s")], || {
            let cfg = ServerConfig::new(None).expect("load config");
            let err = cfg.verify().unwrap_err();
            assert!(err.to_string().contains("status_ttl"));
        });
        with_env(&[("SOCIALITE_SERVICE_NAME", " ")], || {
            let cfg = ServerConfig::new(None).expect("load config");
            assert!(cfg.verify().is_err());
        });
    }
}
