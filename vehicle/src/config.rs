//! Vehicle configuration
//!
//! The configuration is a flat properties file (`key=value` per line). It is
//! loaded once per `start()` into an immutable [`VehicleConfig`] snapshot.

use std::collections::HashMap;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;
use std::time::Duration;

use mq_client::BrokerAddress;

use crate::error::ConfigError;

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "conf/provisioning.properties";

/// Reconnect delay used when the configuration does not set one.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

pub const KEY_TRAIN_ID: &str = "trainId";
pub const KEY_CONNECTION_ADDRESS: &str = "mqConnectionAddress";
pub const KEY_TOPIC_CONTENT: &str = "mqTopicContent";
pub const KEY_TOPIC_MESSAGES: &str = "mqTopicMessages";
pub const KEY_TOPIC_REALTIME: &str = "mqTopicRealtime";
pub const KEY_TOPIC_GTFS: &str = "mqTopicGTFS";
pub const KEY_RECONNECT_TIMEOUT: &str = "reconnectTimeoutOnConnectionFailure";

/// The role a configured topic plays for the vehicle.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum TopicRole {
    /// Content packages persisted to the work directory
    Content,
    /// Human-readable operator messages
    Messages,
    /// Realtime feed (reserved, not subscribed)
    Realtime,
    /// GTFS feed (reserved, not subscribed)
    Gtfs,
}

impl TopicRole {
    /// All roles, in subscription order.
    pub const ALL: [TopicRole; 4] = [
        TopicRole::Content,
        TopicRole::Messages,
        TopicRole::Realtime,
        TopicRole::Gtfs,
    ];

    /// Whether topics of this role are subscribed on connect.
    ///
    /// Realtime and GTFS are parsed for forward compatibility but have no sink.
    pub fn is_active(self) -> bool {
        matches!(self, TopicRole::Content | TopicRole::Messages)
    }

    /// The configuration key naming the topic for this role.
    pub fn config_key(self) -> &'static str {
        match self {
            TopicRole::Content => KEY_TOPIC_CONTENT,
            TopicRole::Messages => KEY_TOPIC_MESSAGES,
            TopicRole::Realtime => KEY_TOPIC_REALTIME,
            TopicRole::Gtfs => KEY_TOPIC_GTFS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TopicRole::Content => "content",
            TopicRole::Messages => "messages",
            TopicRole::Realtime => "realtime",
            TopicRole::Gtfs => "gtfs",
        }
    }
}

impl std::fmt::Display for TopicRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic names for each role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub content: String,
    pub messages: String,
    pub realtime: String,
    pub gtfs: String,
}

impl Topics {
    pub fn name(&self, role: TopicRole) -> &str {
        match role {
            TopicRole::Content => &self.content,
            TopicRole::Messages => &self.messages,
            TopicRole::Realtime => &self.realtime,
            TopicRole::Gtfs => &self.gtfs,
        }
    }
}

/// Immutable configuration snapshot for one vehicle run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleConfig {
    /// Unique vehicle identifier (`trainId`)
    pub vehicle_id: String,
    /// Broker to connect to
    pub broker_address: BrokerAddress,
    /// Fixed wait between failed connection attempts
    pub reconnect_delay: Duration,
    /// Topic names per role
    pub topics: Topics,
}

impl VehicleConfig {
    /// Build a configuration from parsed properties.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingKey` for the first required key that is
    /// absent or empty, and `ConfigError::InvalidValue` for an unparsable broker
    /// address or reconnect timeout.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let vehicle_id = required(properties, KEY_TRAIN_ID)?;

        let raw_address = required(properties, KEY_CONNECTION_ADDRESS)?;
        let broker_address =
            BrokerAddress::parse(&raw_address).map_err(|e| ConfigError::InvalidValue {
                key: KEY_CONNECTION_ADDRESS,
                value: raw_address.clone(),
                reason: e.to_string(),
            })?;

        let topics = Topics {
            content: topic(properties, KEY_TOPIC_CONTENT)?,
            messages: topic(properties, KEY_TOPIC_MESSAGES)?,
            realtime: topic(properties, KEY_TOPIC_REALTIME)?,
            gtfs: topic(properties, KEY_TOPIC_GTFS)?,
        };

        let reconnect_delay = match properties.get(KEY_RECONNECT_TIMEOUT).map(|v| v.trim()) {
            None | Some("") => DEFAULT_RECONNECT_DELAY,
            Some(raw) => parse_delay(raw)?,
        };

        Ok(Self {
            vehicle_id,
            broker_address,
            reconnect_delay,
            topics,
        })
    }

    /// Topics that are subscribed on connect, in subscription order.
    pub fn active_topics(&self) -> Vec<(TopicRole, &str)> {
        TopicRole::ALL
            .into_iter()
            .filter(|role| role.is_active())
            .map(|role| (role, self.topics.name(role)))
            .collect()
    }

    /// Topics that are configured but intentionally left unsubscribed.
    pub fn inactive_topics(&self) -> Vec<(TopicRole, &str)> {
        TopicRole::ALL
            .into_iter()
            .filter(|role| !role.is_active())
            .map(|role| (role, self.topics.name(role)))
            .collect()
    }
}

fn required(properties: &HashMap<String, String>, key: &'static str) -> Result<String, ConfigError> {
    properties
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::MissingKey { key })
}

/// A required topic name. Deliveries are matched to topics by exact name, so
/// MQTT wildcards (`+`, `#`) are rejected. Levels separated by `/` are fine.
fn topic(properties: &HashMap<String, String>, key: &'static str) -> Result<String, ConfigError> {
    let name = required(properties, key)?;
    if name.contains(['+', '#']) {
        return Err(ConfigError::InvalidValue {
            key,
            value: name,
            reason: "wildcard topics are not supported".to_string(),
        });
    }
    Ok(name)
}

fn parse_delay(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: KEY_RECONNECT_TIMEOUT,
        value: raw.to_string(),
        reason,
    };
    let seconds: u64 = raw.parse().map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?;
    if seconds == 0 {
        return Err(invalid("must be at least 1 second".to_string()));
    }
    Ok(Duration::from_secs(seconds))
}

/// Parse properties text into key/value pairs.
///
/// Follows the usual properties file rules: lines starting with `#` or `!`
/// are comments, a line ending in an odd number of backslashes continues on
/// the next one, and the key ends at the first unescaped `=`, `:` or
/// whitespace. `\t`, `\n`, `\r`, `\f` and `\uXXXX` are decoded and any other
/// escaped character stands for itself, so `tcp\://host\:61616` reads as
/// `tcp://host:61616`. Trailing unescaped whitespace is dropped from values.
/// Later keys override earlier ones.
pub fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    for line in logical_lines(text) {
        let (key, value) = split_entry(&line);
        if !key.is_empty() {
            properties.insert(key, value);
        }
    }
    properties
}

/// Join continued lines and drop blanks and comments.
fn logical_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut pending: Option<String> = None;

    for raw in text.lines() {
        let raw = raw.trim_start();
        let mut line = match pending.take() {
            Some(mut joined) => {
                joined.push_str(raw);
                joined
            }
            None if raw.is_empty() || raw.starts_with(['#', '!']) => continue,
            None => raw.to_string(),
        };

        let backslashes = line.chars().rev().take_while(|&c| c == '\\').count();
        if backslashes % 2 == 1 {
            line.pop();
            pending = Some(line);
        } else {
            lines.push(line);
        }
    }
    // A continuation on the last line has nothing to join
    lines.extend(pending);
    lines
}

fn split_entry(line: &str) -> (String, String) {
    let mut chars = line.chars().peekable();

    let mut key = String::new();
    while let Some(c) = chars.next() {
        match c {
            '\\' => push_escaped(&mut key, &mut chars),
            '=' | ':' => break,
            c if c.is_whitespace() => {
                while chars.next_if(|c| c.is_whitespace()).is_some() {}
                chars.next_if(|&c| c == '=' || c == ':');
                break;
            }
            c => key.push(c),
        }
    }
    while chars.next_if(|c| c.is_whitespace()).is_some() {}

    let mut value = String::new();
    let mut significant = 0;
    while let Some(c) = chars.next() {
        if c == '\\' {
            push_escaped(&mut value, &mut chars);
            significant = value.len();
        } else {
            value.push(c);
            if !c.is_whitespace() {
                significant = value.len();
            }
        }
    }
    value.truncate(significant);

    (key, value)
}

/// Decode the escape sequence following a backslash.
fn push_escaped(out: &mut String, chars: &mut Peekable<Chars<'_>>) {
    match chars.next() {
        Some('t') => out.push('\t'),
        Some('n') => out.push('\n'),
        Some('r') => out.push('\r'),
        Some('f') => out.push('\u{000c}'),
        Some('u') => {
            let digits: String = chars.clone().take(4).collect();
            let code = (digits.len() == 4 && digits.chars().all(|c| c.is_ascii_hexdigit()))
                .then(|| u32::from_str_radix(&digits, 16).ok())
                .flatten();
            match code {
                Some(code) => {
                    chars.nth(3);
                    out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                }
                // Malformed escapes are kept as written
                None => out.push_str("\\u"),
            }
        }
        Some(c) => out.push(c),
        None => {}
    }
}

/// Source of vehicle configuration, re-read on every start.
pub trait ConfigSource: Send + Sync {
    /// Load a fresh configuration snapshot.
    fn load(&self) -> Result<VehicleConfig, ConfigError>;

    /// Human-readable description of where the configuration comes from.
    fn describe(&self) -> String;
}

/// Configuration stored in a properties file on disk.
#[derive(Debug, Clone)]
pub struct PropertiesFile {
    path: PathBuf,
}

impl PropertiesFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for PropertiesFile {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_PATH)
    }
}

impl ConfigSource for PropertiesFile {
    fn load(&self) -> Result<VehicleConfig, ConfigError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        VehicleConfig::from_properties(&parse_properties(&text))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// A fixed configuration, useful for embedding and tests.
impl ConfigSource for VehicleConfig {
    fn load(&self) -> Result<VehicleConfig, ConfigError> {
        Ok(self.clone())
    }

    fn describe(&self) -> String {
        format!("static configuration for {}", self.vehicle_id)
    }
}
