use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use murmur_hub::{HubConfig, RoomConfig};

/// Which backend serves a store contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Sqlite,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "sqlite" => Ok(Backend::Sqlite),
            other => bail!("unknown store backend {other:?} (expected memory or sqlite)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// TTL of rooms and sessions, refreshed on activity.
    pub room_age: Duration,
    pub session_cookie: String,
    pub room_id_length: usize,
    pub max_peers_per_room: usize,
    pub max_message_length: usize,
    pub peer_queue_capacity: usize,
    pub room_store: Backend,
    pub message_store: Backend,
    pub db_path: PathBuf,
    pub cleanup_interval: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables take their
    /// defaults; set but malformed ones are errors.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            host: lookup("MURMUR_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: var(&lookup, "MURMUR_PORT", 9000)?,
            room_age: Duration::from_secs(var(&lookup, "MURMUR_ROOM_AGE_SECS", 86_400)?),
            session_cookie: lookup("MURMUR_SESSION_COOKIE").unwrap_or_else(|| "murmur_session".into()),
            room_id_length: var(&lookup, "MURMUR_ROOM_ID_LENGTH", 10)?,
            max_peers_per_room: var(&lookup, "MURMUR_MAX_PEERS_PER_ROOM", 100)?,
            max_message_length: var(&lookup, "MURMUR_MAX_MESSAGE_LENGTH", 2048)?,
            peer_queue_capacity: var(&lookup, "MURMUR_PEER_QUEUE_CAPACITY", 64)?,
            room_store: var(&lookup, "MURMUR_ROOM_STORE", Backend::Memory)?,
            message_store: var(&lookup, "MURMUR_MESSAGE_STORE", Backend::Sqlite)?,
            db_path: lookup("MURMUR_DB_PATH").unwrap_or_else(|| "murmur.db".into()).into(),
            cleanup_interval: Duration::from_secs(var(&lookup, "MURMUR_CLEANUP_INTERVAL_SECS", 300)?),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.room_age.is_zero() {
            bail!("MURMUR_ROOM_AGE_SECS must be greater than zero");
        }
        if self.cleanup_interval.is_zero() {
            bail!("MURMUR_CLEANUP_INTERVAL_SECS must be greater than zero");
        }
        if self.room_id_length < 4 {
            bail!("MURMUR_ROOM_ID_LENGTH must be at least 4");
        }
        for (key, value) in [
            ("MURMUR_MAX_PEERS_PER_ROOM", self.max_peers_per_room),
            ("MURMUR_MAX_MESSAGE_LENGTH", self.max_message_length),
            ("MURMUR_PEER_QUEUE_CAPACITY", self.peer_queue_capacity),
        ] {
            if value == 0 {
                bail!("{key} must be greater than zero");
            }
        }
        if self.session_cookie.trim().is_empty() {
            bail!("MURMUR_SESSION_COOKIE must not be empty");
        }
        Ok(())
    }

    pub fn uses_sqlite(&self) -> bool {
        self.room_store == Backend::Sqlite || self.message_store == Backend::Sqlite
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            room_age: self.room_age,
            room_id_length: self.room_id_length,
            room: RoomConfig {
                queue_capacity: self.peer_queue_capacity,
                max_peers: self.max_peers_per_room,
                max_message_length: self.max_message_length,
            },
        }
    }
}

fn var<T, F>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid {key}={raw:?}")),
        _ => Ok(default),
    }
}
