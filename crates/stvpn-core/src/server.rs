//! Server Descriptors
//!
//! Identity and routing metadata for every exit server in the catalog.
//!
//! # Catalog Fields
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `tier` | `free` or `premium` entitlement required |
//! | `status` | `online`, `offline` or `maintenance` |
//! | `ping` | Latest latency sample (ms), if measured |
//! | `load` | Utilization 0-100, if reported |
//! | `core_type` | Transport protocol family (`xray` / `v2fly`) |
//!
//! Descriptors are plain values. A session clones the descriptor it was
//! admitted with, so a catalog refresh never changes a running attempt.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Entitlement tier, shared by servers and subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Premium,
}

/// Server availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Online,
    Offline,
    Maintenance,
}

/// Transport protocol family spoken by a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreType {
    #[default]
    Xray,
    V2fly,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
            ServerStatus::Maintenance => "maintenance",
        }
    }
}

impl CoreType {
    /// All protocol families known to the core
    pub fn all() -> &'static [CoreType] {
        &[CoreType::Xray, CoreType::V2fly]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoreType::Xray => "xray",
            CoreType::V2fly => "v2fly",
        }
    }
}

macro_rules! display_and_parse {
    ($ty:ty, $kind:literal, [$($variant:expr),+]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseValueError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().to_lowercase();
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str() == wanted)
                    .ok_or_else(|| ParseValueError {
                        kind: $kind,
                        value: s.to_string(),
                    })
            }
        }
    };
}

display_and_parse!(Tier, "tier", [Tier::Free, Tier::Premium]);
display_and_parse!(
    ServerStatus,
    "server status",
    [ServerStatus::Online, ServerStatus::Offline, ServerStatus::Maintenance]
);
display_and_parse!(CoreType, "core type", [CoreType::Xray, CoreType::V2fly]);

/// Error for unrecognized tier/status/core strings
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {kind}: {value}")]
pub struct ParseValueError {
    kind: &'static str,
    value: String,
}

/// A server as issued by the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique, stable identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// City or site
    #[serde(default)]
    pub location: String,
    /// Country display name
    #[serde(default)]
    pub country: String,
    /// ISO country code (lowercase in the stock catalog)
    #[serde(default, alias = "countryCode")]
    pub country_code: String,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub status: ServerStatus,
    /// Latency sample (ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<u32>,
    /// Utilization 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<u8>,
    #[serde(default, alias = "coreType")]
    pub core_type: CoreType,
}

impl ServerDescriptor {
    /// Create an online free-tier xray server with no location metadata
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            location: String::new(),
            country: String::new(),
            country_code: String::new(),
            tier: Tier::Free,
            status: ServerStatus::Online,
            ping: None,
            load: None,
            core_type: CoreType::Xray,
        }
    }

    pub fn with_location(
        mut self,
        location: impl Into<String>,
        country: impl Into<String>,
        country_code: impl Into<String>,
    ) -> Self {
        self.location = location.into();
        self.country = country.into();
        self.country_code = country_code.into();
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_status(mut self, status: ServerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_ping(mut self, ping_ms: u32) -> Self {
        self.ping = Some(ping_ms);
        self
    }

    pub fn with_load(mut self, load: u8) -> Self {
        self.load = Some(load.min(100));
        self
    }

    pub fn with_core(mut self, core_type: CoreType) -> Self {
        self.core_type = core_type;
        self
    }

    /// Is the server accepting connections?
    pub fn is_online(&self) -> bool {
        self.status == ServerStatus::Online
    }

    pub fn is_premium(&self) -> bool {
        self.tier == Tier::Premium
    }

    /// Case-insensitive match against name, location and country.
    /// An empty needle matches everything.
    pub fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        [&self.name, &self.location, &self.country]
            .iter()
            .any(|field| field.to_lowercase().contains(&needle))
    }

    /// The six servers of the stock catalog
    pub fn default_catalog() -> Vec<ServerDescriptor> {
        vec![
            ServerDescriptor::new("1", "US East")
                .with_location("New York", "United States", "us")
                .with_ping(120)
                .with_load(65),
            ServerDescriptor::new("2", "Japan Central")
                .with_location("Tokyo", "Japan", "jp")
                .with_ping(180)
                .with_load(45)
                .with_core(CoreType::V2fly),
            ServerDescriptor::new("3", "Germany")
                .with_location("Frankfurt", "Germany", "de")
                .with_status(ServerStatus::Offline)
                .with_ping(90)
                .with_load(30),
            ServerDescriptor::new("4", "UK London")
                .with_location("London", "United Kingdom", "gb")
                .with_tier(Tier::Premium)
                .with_status(ServerStatus::Maintenance)
                .with_ping(85)
                .with_load(20)
                .with_core(CoreType::V2fly),
            ServerDescriptor::new("5", "Singapore")
                .with_location("Singapore", "Singapore", "sg")
                .with_tier(Tier::Premium)
                .with_ping(140)
                .with_load(50),
            ServerDescriptor::new("6", "Australia")
                .with_location("Sydney", "Australia", "au")
                .with_tier(Tier::Premium)
                .with_ping(200)
                .with_load(35)
                .with_core(CoreType::V2fly),
        ]
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.id)
    }
}

/// Predicate over tier, status, core type and search text.
///
/// Unset fields match everything, so `ServerFilter::default()` selects
/// the whole catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFilter {
    pub tier: Option<Tier>,
    pub status: Option<ServerStatus>,
    pub core_type: Option<CoreType>,
    pub search: Option<String>,
}

impl ServerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn status(mut self, status: ServerStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn core_type(mut self, core_type: CoreType) -> Self {
        self.core_type = Some(core_type);
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn matches(&self, server: &ServerDescriptor) -> bool {
        self.tier.is_none_or(|t| server.tier == t)
            && self.status.is_none_or(|s| server.status == s)
            && self.core_type.is_none_or(|c| server.core_type == c)
            && self
                .search
                .as_deref()
                .is_none_or(|text| server.matches_search(text))
    }
}

/// Servers sharing one country, in catalog order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountryGroup {
    pub country: String,
    pub country_code: String,
    pub servers: Vec<ServerDescriptor>,
}
