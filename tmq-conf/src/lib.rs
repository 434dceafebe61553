#![deny(unsafe_code)]

use std::fmt;
use std::num::NonZeroU16;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::de::{self, Deserializer};
use serde::Deserialize;

use tmq_utils::deserialize_duration;

use self::logging::Log;

pub use self::options::Options;

pub mod logging;
pub mod options;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/tmq/tmq").required(false))
            .add_source(File::with_name("tmq").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        //TMQ__MQTT__MAX_INFLIGHT=10 overrides every file
        builder = builder.add_source(config::Environment::with_prefix("tmq").separator("__").try_parsing(true));

        let mut inner: Inner = builder.build()?.try_deserialize()?;
        inner.mqtt.check()?;
        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    /// Build settings from an in-memory toml document, no files or environment involved.
    pub fn from_toml(doc: &str) -> Result<Self> {
        let mut inner: Inner = Config::builder()
            .add_source(File::from_str(doc, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        inner.mqtt.check()?;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("max_inflight is {}", self.mqtt.max_inflight);
        log::info!("max_mqueue_len is {}", self.mqtt.max_mqueue_len);
        log::info!("max_outbound_len is {}", self.mqtt.max_outbound_len);
        log::info!("keepalive_backoff is {}", self.mqtt.keepalive_backoff);
        log::info!(
            "retry_interval is {:?}, max_retries is {}",
            self.mqtt.retry_interval,
            self.mqtt.max_retries
        );
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    //Maximum number of unacknowledged QoS 1/2 deliveries per session.
    #[serde(default = "Mqtt::max_inflight_default")]
    pub max_inflight: NonZeroU16,
    //Maximum number of in-flight plus queued deliveries per session.
    #[serde(default = "Mqtt::max_mqueue_len_default")]
    pub max_mqueue_len: usize,
    //Packets buffered towards one connection's writer, a full buffer backs up into the session queue.
    #[serde(default = "Mqtt::max_outbound_len_default")]
    pub max_outbound_len: usize,
    //A session expires once `keepalive * keepalive_backoff` passes without inbound packets.
    #[serde(default = "Mqtt::keepalive_backoff_default", deserialize_with = "Mqtt::deserialize_backoff")]
    pub keepalive_backoff: f32,
    #[serde(default = "Mqtt::max_keepalive_default")]
    pub max_keepalive: u16,
    #[serde(default = "Mqtt::allow_zero_keepalive_default")]
    pub allow_zero_keepalive: bool,
    #[serde(default = "Mqtt::retry_interval_default", deserialize_with = "deserialize_duration")]
    pub retry_interval: Duration,
    //0 retries forever.
    #[serde(default)]
    pub max_retries: usize,
    #[serde(default = "Mqtt::tick_interval_default", deserialize_with = "deserialize_duration")]
    pub tick_interval: Duration,
    #[serde(default = "Mqtt::retain_enable_default")]
    pub retain_enable: bool,
}

impl Default for Mqtt {
    #[inline]
    fn default() -> Self {
        Self {
            max_inflight: Self::max_inflight_default(),
            max_mqueue_len: Self::max_mqueue_len_default(),
            max_outbound_len: Self::max_outbound_len_default(),
            keepalive_backoff: Self::keepalive_backoff_default(),
            max_keepalive: Self::max_keepalive_default(),
            allow_zero_keepalive: Self::allow_zero_keepalive_default(),
            retry_interval: Self::retry_interval_default(),
            max_retries: 0,
            tick_interval: Self::tick_interval_default(),
            retain_enable: Self::retain_enable_default(),
        }
    }
}

impl Mqtt {
    pub const MAX_KEEPALIVE_BACKOFF: f32 = 100.0;

    #[inline]
    fn max_inflight_default() -> NonZeroU16 {
        if let Some(max_inflight) = NonZeroU16::new(20) {
            max_inflight
        } else {
            unreachable!()
        }
    }
    #[inline]
    fn max_mqueue_len_default() -> usize {
        99_999
    }
    #[inline]
    fn max_outbound_len_default() -> usize {
        1_000
    }
    #[inline]
    fn keepalive_backoff_default() -> f32 {
        1.5
    }
    #[inline]
    fn max_keepalive_default() -> u16 {
        u16::MAX
    }
    #[inline]
    fn allow_zero_keepalive_default() -> bool {
        true
    }
    #[inline]
    fn retry_interval_default() -> Duration {
        Duration::from_secs(20)
    }
    #[inline]
    fn tick_interval_default() -> Duration {
        Duration::from_secs(1)
    }
    #[inline]
    fn retain_enable_default() -> bool {
        true
    }

    #[inline]
    fn deserialize_backoff<'de, D>(deserializer: D) -> std::result::Result<f32, D::Error>
    where
        D: Deserializer<'de>,
    {
        let backoff = f32::deserialize(deserializer)?;
        if !(1.0..=Self::MAX_KEEPALIVE_BACKOFF).contains(&backoff) {
            return Err(de::Error::custom(format!(
                "keepalive_backoff must be within 1.0..={}, got {backoff}",
                Self::MAX_KEEPALIVE_BACKOFF
            )));
        }
        Ok(backoff)
    }

    fn check(&self) -> Result<()> {
        if self.max_mqueue_len < self.max_inflight.get() as usize {
            return Err(anyhow!(
                "mqtt.max_mqueue_len ({}) must not be less than mqtt.max_inflight ({})",
                self.max_mqueue_len,
                self.max_inflight
            ));
        }
        if self.max_outbound_len == 0 {
            return Err(anyhow!("mqtt.max_outbound_len must be greater than zero"));
        }
        if self.tick_interval.is_zero() {
            return Err(anyhow!("mqtt.tick_interval must be greater than zero"));
        }
        Ok(())
    }

    /// Milliseconds until a session with the given keepalive (seconds) is considered gone,
    /// `None` when keepalive is disabled.
    #[inline]
    pub fn keepalive_timeout_millis(&self, keepalive: u16) -> Option<i64> {
        if keepalive == 0 {
            None
        } else {
            Some((keepalive as f64 * 1000.0 * self.keepalive_backoff as f64) as i64)
        }
    }
}
