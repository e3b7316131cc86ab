use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::lease::{ConnectorRequest, LeaseRequest};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/drm-lease-manager.toml";

/// Lease layout read from the configuration file.
///
/// ```toml
/// [[lease]]
/// name = "lease 1"
/// connectors = ["HDMI-A-1", 42, { name = "VGA-1", optional = true, planes = [40, 41] }]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default, rename = "lease")]
    pub leases: Vec<LeaseEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseEntry {
    pub name: String,
    #[serde(default)]
    pub connectors: Vec<ConnectorEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ConnectorEntry {
    Id(u32),
    Name(String),
    Table(ConnectorTable),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectorTable {
    pub name: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub planes: Option<Vec<u32>>,
}

impl Config {
    /// Reads `path`. A missing or unreadable file gives an empty
    /// configuration.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                debug!(path = %path.display(), ?err, "No lease configuration");
                return Self::default();
            }
        };

        match Self::parse(&content) {
            Ok(config) => config,
            Err(err) => {
                warn!("Failed to parse {}: {err}", path.display());
                Self::default()
            }
        }
    }

    /// Parses a configuration, dropping malformed lease entries.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut value = content.parse::<toml::Value>()?;
        sanitize_leases(&mut value);
        value.try_into()
    }

    /// Lease requests for the manager, or `None` when no lease is configured
    /// and the defaults should be used.
    pub fn lease_requests(&self) -> Option<Vec<LeaseRequest>> {
        if self.leases.is_empty() {
            return None;
        }

        Some(
            self.leases
                .iter()
                .map(|lease| {
                    let connectors = lease
                        .connectors
                        .iter()
                        .map(ConnectorEntry::to_request)
                        .collect();
                    LeaseRequest::new(lease.name.clone(), connectors)
                })
                .collect(),
        )
    }
}

impl ConnectorEntry {
    fn to_request(&self) -> ConnectorRequest {
        match self {
            ConnectorEntry::Id(id) => ConnectorRequest::id(*id),
            ConnectorEntry::Name(name) => ConnectorRequest::named(name.as_str()),
            ConnectorEntry::Table(table) => {
                let request = ConnectorRequest::named(table.name.as_str()).optional(table.optional);
                match &table.planes {
                    Some(planes) => request.with_planes(planes.clone()),
                    None => request,
                }
            }
        }
    }
}

fn sanitize_leases(value: &mut toml::Value) {
    let toml::Value::Table(table) = value else {
        return;
    };

    let Some(leases) = table.get_mut("lease") else {
        warn!("Invalid config - cannot find any 'lease' configs");
        return;
    };

    let toml::Value::Array(entries) = leases else {
        warn!("ignoring malformed lease list");
        table.remove("lease");
        return;
    };

    let mut index = 0;
    entries.retain(|entry| {
        index += 1;
        match lease_entry_problem(entry) {
            None => true,
            Some(problem) => {
                let name = entry.get("name").and_then(toml::Value::as_str);
                warn!(entry = index, name, "ignoring lease entry: {problem}");
                false
            }
        }
    });
}

fn lease_entry_problem(entry: &toml::Value) -> Option<&'static str> {
    let toml::Value::Table(entry) = entry else {
        return Some("not a table");
    };

    match entry.get("name") {
        Some(toml::Value::String(name)) if !name.is_empty() => {}
        _ => return Some("invalid lease name"),
    }

    match entry.get("connectors") {
        None => None,
        Some(toml::Value::Array(connectors)) => connectors.iter().find_map(connector_problem),
        Some(_) => Some("connectors must be a list"),
    }
}

fn connector_problem(connector: &toml::Value) -> Option<&'static str> {
    match connector {
        toml::Value::String(_) => None,
        toml::Value::Integer(id) if is_object_id(*id) => None,
        toml::Value::Integer(_) => Some("connector id out of range"),
        toml::Value::Table(table) => {
            if !matches!(table.get("name"), Some(toml::Value::String(_))) {
                return Some("non string connector name");
            }
            if !matches!(table.get("optional"), None | Some(toml::Value::Boolean(_))) {
                return Some("connector 'optional' must be a boolean");
            }
            match table.get("planes") {
                None => None,
                Some(toml::Value::Array(planes))
                    if planes
                        .iter()
                        .all(|plane| plane.as_integer().is_some_and(is_object_id)) =>
                {
                    None
                }
                Some(_) => Some("invalid plane id"),
            }
        }
        _ => Some("non string connector name"),
    }
}

fn is_object_id(value: i64) -> bool {
    u32::try_from(value).is_ok()
}
