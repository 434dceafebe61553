//! Topic names and topic filters, split into levels.
//!
//! A `$` prefix marks the reserved namespace only on the first level; `a/$b` is a
//! plain two level name. Wildcards must occupy a whole level and `#` must be last.

use std::fmt::{self, Write};
use std::{ops, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::MqttError;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("InvalidTopic({0})")]
    InvalidTopic(String),
    #[error("InvalidLevel({0})")]
    InvalidLevel(String),
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    Metadata(String), // $SYS
    Blank,
    SingleWildcard, // Single level wildcard +
    MultiWildcard,  // Multi-level wildcard #
}

impl Level {
    #[inline]
    fn parse_at(s: &str, pos: usize) -> Result<Level, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ if s.contains(['+', '#']) => {
                Err(TopicError::InvalidLevel(format!("invalid level `{s}` contains +|#")))
            }
            _ if pos == 0 && s.starts_with('$') => Ok(Level::Metadata(String::from(s))),
            _ => Ok(Level::Normal(String::from(s))),
        }
    }

    #[inline]
    pub fn value(&self) -> Option<&str> {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(*self, Level::Metadata(_))
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(*self, Level::SingleWildcard | Level::MultiWildcard)
    }
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    #[inline]
    fn is_valid(&self) -> bool {
        let last = self.0.len().saturating_sub(1);
        self.0.iter().enumerate().all(|(pos, level)| match level {
            Level::MultiWildcard => pos == last,
            Level::Metadata(_) => pos == 0,
            _ => true,
        })
    }

    ///True when no level is a wildcard, i.e. the topic can be published to
    #[inline]
    pub fn is_name(&self) -> bool {
        !self.0.iter().any(Level::is_wildcard)
    }

    ///Segment-wise match of this filter against a concrete topic name.
    pub fn matches_str<S: AsRef<str> + ?Sized>(&self, topic: &S) -> bool {
        let mut names = topic.as_ref().split('/');
        let mut filters = self.0.iter();
        let mut first = true;
        loop {
            match (filters.next(), names.next()) {
                (Some(Level::MultiWildcard), Some(name)) => return !(first && name.starts_with('$')),
                (Some(Level::MultiWildcard), None) => return true,
                (Some(Level::SingleWildcard), Some(name)) => {
                    if first && name.starts_with('$') {
                        return false;
                    }
                }
                (Some(Level::Blank), Some("")) => {}
                (Some(Level::Normal(f)), Some(name)) | (Some(Level::Metadata(f)), Some(name)) => {
                    if f != name {
                        return false;
                    }
                }
                (None, None) => return true,
                _ => return false,
            }
            first = false;
        }
    }

    /// Parse and validate a SUBSCRIBE topic filter.
    #[inline]
    pub fn filter(s: &str) -> Result<Topic, MqttError> {
        Topic::from_str(s).map_err(|e| MqttError::InvalidTopicFilter(e.to_string()))
    }

    /// Parse and validate a PUBLISH topic name, wildcards are rejected.
    #[inline]
    pub fn name(s: &str) -> Result<Topic, MqttError> {
        match Topic::from_str(s) {
            Ok(t) if t.is_name() => Ok(t),
            Ok(_) => Err(MqttError::InvalidTopicName(format!("`{s}` contains wildcards"))),
            Err(e) => Err(MqttError::InvalidTopicName(e.to_string())),
        }
    }
}

impl From<Vec<Level>> for Topic {
    fn from(v: Vec<Level>) -> Self {
        Topic(v)
    }
}

impl ops::Deref for Topic {
    type Target = Vec<Level>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[macro_export]
macro_rules! topic {
    ($s:expr) => {
        $s.parse::<$crate::topic::Topic>()
    };
}

impl FromStr for Topic {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        if s.is_empty() {
            return Err(TopicError::InvalidTopic("empty topic".into()));
        }
        let topic = s
            .split('/')
            .enumerate()
            .map(|(pos, l)| Level::parse_at(l, pos))
            .collect::<Result<Vec<_>, TopicError>>()
            .map(Topic)?;
        if topic.is_valid() {
            Ok(topic)
        } else {
            Err(TopicError::InvalidTopic(format!("invalid topic `{s}`")))
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => f.write_str(s.as_str()),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for level in &self.0 {
            if first {
                first = false;
            } else {
                f.write_char('/')?;
            }
            level.fmt(f)?;
        }
        Ok(())
    }
}
