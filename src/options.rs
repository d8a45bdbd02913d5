//! Connect options
//!
//! Options accepted by [`AsyncClient::connect`](crate::AsyncClient::connect).
//! Constructible in code via `Default` and struct update syntax, or loaded
//! from TOML:
//!
//! ```toml
//! clean_session = false
//! keep_alive = "30s"
//! automatic_reconnect = true
//! server_uris = ["tcp://primary:1883", "tcp://fallback:1883"]
//!
//! [buffer]
//! enabled = true
//! size = 1000
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::{ClientError, ErrorKind};
use crate::protocol::QoS;
use crate::topic::validate_topic_name;

/// Options governing a connection attempt and the session it creates
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Clean session flag; false retains QoS 1/2 state across reconnects
    pub clean_session: bool,
    /// Keep alive interval (0 disables keep alive)
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Per-endpoint handshake timeout
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
    /// Reconnect automatically after a lost connection
    pub automatic_reconnect: bool,
    /// Upper bound for the doubling reconnect delay
    #[serde(with = "humantime_serde")]
    pub max_reconnect_delay: Duration,
    /// Maximum number of QoS 1/2 publishes in flight at once
    pub max_inflight: usize,
    /// Will message registered with the server at connect
    pub will: Option<WillOptions>,
    /// Username for authentication
    pub username: Option<String>,
    /// Password for authentication (requires username)
    pub password: Option<String>,
    /// Candidate server URIs tried in order; empty means use the URI the
    /// client was created with
    pub server_uris: Vec<String>,
    /// Offline publish buffering
    pub buffer: BufferOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            clean_session: true,
            keep_alive: default_keep_alive(),
            connection_timeout: default_connection_timeout(),
            automatic_reconnect: false,
            max_reconnect_delay: default_max_reconnect_delay(),
            max_inflight: default_max_inflight(),
            will: None,
            username: None,
            password: None,
            server_uris: Vec::new(),
            buffer: BufferOptions::default(),
        }
    }
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_reconnect_delay() -> Duration {
    Duration::from_secs(128)
}

fn default_max_inflight() -> usize {
    10
}

impl ConnectOptions {
    /// Parse options from a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self, ClientError> {
        let options: ConnectOptions = toml::from_str(s)
            .map_err(|e| ClientError::with_cause(ErrorKind::InvalidOptions, e))?;
        options.validate()?;
        Ok(options)
    }

    /// Validate option combinations before any network activity
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.max_inflight == 0 {
            return Err(ClientError::with_detail(
                ErrorKind::InvalidOptions,
                "max_inflight must be at least 1",
            ));
        }
        if self.keep_alive.as_secs() > u16::MAX as u64 {
            return Err(ClientError::with_detail(
                ErrorKind::InvalidOptions,
                "keep_alive exceeds 65535 seconds",
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ClientError::with_detail(
                ErrorKind::InvalidOptions,
                "password requires a username",
            ));
        }
        if let Some(ref will) = self.will {
            validate_topic_name(&will.topic)
                .map_err(|e| ClientError::with_detail(ErrorKind::InvalidTopic, e))?;
            if QoS::from_u8(will.qos).is_none() {
                return Err(ClientError::with_detail(
                    ErrorKind::InvalidOptions,
                    "will qos must be 0, 1 or 2",
                ));
            }
        }
        Ok(())
    }

    /// Keep alive in whole seconds as carried in CONNECT
    pub(crate) fn keep_alive_secs(&self) -> u16 {
        self.keep_alive.as_secs().min(u16::MAX as u64) as u16
    }
}

/// Will message registered with the server at connect
#[derive(Debug, Clone, Deserialize)]
pub struct WillOptions {
    /// Will topic (a topic name, no wildcards)
    pub topic: String,
    /// Will payload
    #[serde(default)]
    pub payload: String,
    /// Will QoS (0, 1 or 2)
    #[serde(default)]
    pub qos: u8,
    /// Will retain flag
    #[serde(default)]
    pub retained: bool,
}

/// Offline publish buffering options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferOptions {
    /// Buffer publishes submitted while not connected
    pub enabled: bool,
    /// Maximum number of buffered publishes
    pub size: usize,
    /// Persist buffered publishes so they survive a restart
    pub persist: bool,
    /// When full, evict the oldest entry instead of rejecting the new one
    pub delete_oldest: bool,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            size: default_buffer_size(),
            persist: false,
            delete_oldest: false,
        }
    }
}

fn default_buffer_size() -> usize {
    5000
}
