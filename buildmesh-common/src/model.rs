// Copyright 2025 Buildmesh Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use subtle::ConstantTimeEq;

/// Number of random bytes behind every access token (worker and build).
pub const TOKEN_SECRET_BYTES: usize = 32;

/// Opaque build identifier. Nanoid, 21 URL-safe characters.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, poem_openapi::NewType,
)]
pub struct BuildId(pub String);

impl BuildId {
    pub fn new() -> Self {
        Self(nanoid::nanoid!())
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BuildId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker identifier: client-chosen or server-assigned.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, poem_openapi::NewType,
)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A secret credential. Comparison against presented material must go through
/// [`TokenSecret::ct_eq`]; `Debug` masks the value so it cannot leak into logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenSecret {
    pub value: String,
}

impl TokenSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Fresh 32-byte random secret, URL-safe-base64 without padding.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_SECRET_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        Self {
            value: URL_SAFE_NO_PAD.encode(bytes),
        }
    }

    /// Constant-time equality on the encoded form. Differing lengths short
    /// circuit, which leaks nothing beyond the length itself.
    pub fn ct_eq(&self, presented: &str) -> bool {
        self.value.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

impl fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "TokenSecret(****)")
    }
}

impl FromStr for TokenSecret {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err("empty token".to_string())
        } else {
            Ok(TokenSecret::new(s))
        }
    }
}

/// Target platform of a build.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, poem_openapi::Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }

    /// File extension of a finished artifact on this platform.
    pub fn result_extension(&self) -> &'static str {
        match self {
            Platform::Ios => "ipa",
            Platform::Android => "apk",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            other => Err(format!("Unknown platform: {other}")),
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a build.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, poem_openapi::Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Assigned,
    Building,
    Completed,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Assigned => "assigned",
            BuildStatus::Building => "building",
            BuildStatus::Completed => "completed",
            BuildStatus::Failed => "failed",
        }
    }

    /// A build a worker currently holds.
    pub fn is_active(&self) -> bool {
        matches!(self, BuildStatus::Assigned | BuildStatus::Building)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Completed | BuildStatus::Failed)
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "assigned" => Ok(BuildStatus::Assigned),
            "building" => Ok(BuildStatus::Building),
            "completed" => Ok(BuildStatus::Completed),
            "failed" => Ok(BuildStatus::Failed),
            other => Err(format!("Unknown build status: {other}")),
        }
    }
}

impl Display for BuildStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Registry state of a worker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, poem_openapi::Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Building,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Building => "building",
            WorkerStatus::Offline => "offline",
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerStatus::Idle),
            "building" => Ok(WorkerStatus::Building),
            "offline" => Ok(WorkerStatus::Offline),
            other => Err(format!("Unknown worker status: {other}")),
        }
    }
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity of a build log entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, poem_openapi::Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("Unknown log level: {other}")),
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deserialization helpers for timestamps that arrive either as epoch-millis
/// integers or as ISO-8601 strings. Responses always serialize ISO-8601 UTC.
pub mod flexible_timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::de::{Error, Visitor};
    use serde::{Deserializer, Serialize, Serializer};
    use std::fmt;

    struct FlexibleTimestampVisitor;

    impl Visitor<'_> for FlexibleTimestampVisitor {
        type Value = DateTime<Utc>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an epoch-millis integer or an ISO-8601 timestamp string")
        }

        fn visit_i64<E: Error>(self, millis: i64) -> Result<Self::Value, E> {
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| E::custom(format!("epoch millis out of range: {millis}")))
        }

        fn visit_u64<E: Error>(self, millis: u64) -> Result<Self::Value, E> {
            let millis = i64::try_from(millis)
                .map_err(|_| E::custom(format!("epoch millis out of range: {millis}")))?;
            self.visit_i64(millis)
        }

        fn visit_str<E: Error>(self, value: &str) -> Result<Self::Value, E> {
            DateTime::parse_from_rfc3339(value)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| E::custom(format!("invalid timestamp {value:?}: {e}")))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        deserializer.deserialize_any(FlexibleTimestampVisitor)
    }

    /// Parses an already-decoded JSON value (epoch millis or ISO-8601 text).
    pub fn parse_value(value: &serde_json::Value) -> Option<DateTime<Utc>> {
        match value {
            serde_json::Value::Number(millis) => millis
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
            serde_json::Value::String(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            _ => None,
        }
    }

    pub fn serialize<S: Serializer>(
        timestamp: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        timestamp.to_rfc3339().serialize(serializer)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::de::{Deserialize, IntoDeserializer};
        use serde::{Deserializer, Serialize, Serializer};

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
            match raw {
                None | Some(serde_json::Value::Null) => Ok(None),
                Some(value) => super::deserialize(value.into_deserializer())
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }

        pub fn serialize<S: Serializer>(
            timestamp: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            timestamp.map(|ts| ts.to_rfc3339()).serialize(serializer)
        }
    }
}
