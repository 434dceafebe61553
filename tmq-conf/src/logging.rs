use std::ops::Deref;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default = "Log::level_default")]
    pub level: Level,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Self {
            to: Self::to_default(),
            level: Self::level_default(),
            dir: Self::dir_default(),
            file: Self::file_default(),
        }
    }
}

impl Log {
    #[inline]
    fn to_default() -> To {
        To::Console
    }
    #[inline]
    fn level_default() -> Level {
        Level { inner: slog::Level::Info }
    }
    #[inline]
    fn dir_default() -> String {
        "/var/log/tmq".into()
    }
    #[inline]
    fn file_default() -> String {
        "tmq.log".into()
    }

    /// Full path of the log file, empty when no file is configured.
    #[inline]
    pub fn filename(&self) -> String {
        if self.file.is_empty() {
            return String::new();
        }
        if self.dir.is_empty() {
            return self.file.clone();
        }
        format!("{}/{}", self.dir.trim_end_matches(['/', '\\']), self.file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

impl FromStr for To {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(To::Off),
            "file" => Ok(To::File),
            "console" => Ok(To::Console),
            "both" => Ok(To::Both),
            other => Err(format!("unknown log target {other:?}, expected off|file|console|both")),
        }
    }
}

impl<'de> Deserialize<'de> for To {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        To::from_str(&String::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Level {
    inner: slog::Level,
}

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.inner
    }
}

impl Deref for Level {
    type Target = slog::Level;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'de> Deserialize<'de> for Level {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        let inner = slog::Level::from_str(&level)
            .map_err(|_| de::Error::custom(format!("invalid log level {level:?}")))?;
        Ok(Level { inner })
    }
}
