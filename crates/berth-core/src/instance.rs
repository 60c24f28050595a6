//! Persisted instance records and the filters used to address them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceClass {
    Application,
    Database,
    Storage,
}

impl ServiceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceClass::Application => "application",
            ServiceClass::Database => "database",
            ServiceClass::Storage => "storage",
        }
    }
}

impl fmt::Display for ServiceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "application" => Ok(ServiceClass::Application),
            "database" => Ok(ServiceClass::Database),
            "storage" => Ok(ServiceClass::Storage),
            other => Err(format!("unknown service class '{other}'")),
        }
    }
}

/// Runtime variant of an instance. Every kind belongs to exactly one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Python,
    Node,
    Static,
    Mysql,
    Mongodb,
    Lizardfs,
}

impl Kind {
    pub const ALL: [Kind; 6] = [
        Kind::Python,
        Kind::Node,
        Kind::Static,
        Kind::Mysql,
        Kind::Mongodb,
        Kind::Lizardfs,
    ];

    pub fn class(&self) -> ServiceClass {
        match self {
            Kind::Python | Kind::Node | Kind::Static => ServiceClass::Application,
            Kind::Mysql | Kind::Mongodb => ServiceClass::Database,
            Kind::Lizardfs => ServiceClass::Storage,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Python => "python",
            Kind::Node => "node",
            Kind::Static => "static",
            Kind::Mysql => "mysql",
            Kind::Mongodb => "mongodb",
            Kind::Lizardfs => "lizardfs",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown instance kind '{s}'"))
    }
}

/// Class-specific part of an instance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    App {
        source_url: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        build_args: Vec<String>,
    },
    Database {
        data_dir: String,
    },
    Storage {
        volume: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub class: ServiceClass,
    pub kind: Kind,
    pub container_id: String,
    pub host_address: String,
    pub port: u16,
    /// Seconds since the unix epoch.
    pub created_at: u64,
    pub payload: Payload,
}

impl Instance {
    /// `host:port` under which the instance is published.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host_address, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredInstance {
    pub id: RecordId,
    pub instance: Instance,
}

/// Conjunction of equality constraints; `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub name: Option<String>,
    pub class: Option<ServiceClass>,
    pub kind: Option<Kind>,
    pub host_address: Option<String>,
}

impl InstanceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn on_host(address: impl Into<String>) -> Self {
        Self {
            host_address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn with_class(mut self, class: ServiceClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        self.name.as_ref().is_none_or(|n| *n == instance.name)
            && self.class.is_none_or(|c| c == instance.class)
            && self.kind.is_none_or(|k| k == instance.kind)
            && self
                .host_address
                .as_ref()
                .is_none_or(|h| *h == instance.host_address)
    }
}

/// Fields to overwrite on every matching record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstancePatch {
    pub container_id: Option<String>,
    pub host_address: Option<String>,
    pub port: Option<u16>,
    pub payload: Option<Payload>,
}

impl InstancePatch {
    pub fn host_address(address: impl Into<String>) -> Self {
        Self {
            host_address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.container_id.is_none()
            && self.host_address.is_none()
            && self.port.is_none()
            && self.payload.is_none()
    }

    pub fn apply(&self, instance: &mut Instance) {
        if let Some(id) = &self.container_id {
            instance.container_id = id.clone();
        }
        if let Some(addr) = &self.host_address {
            instance.host_address = addr.clone();
        }
        if let Some(port) = self.port {
            instance.port = port;
        }
        if let Some(payload) = &self.payload {
            instance.payload = payload.clone();
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, kind: Kind, host: &str) -> Instance {
        Instance {
            name: name.into(),
            class: kind.class(),
            kind,
            container_id: "c".into(),
            host_address: host.into(),
            port: 8080,
            created_at: 0,
            payload: Payload::Storage { volume: "v".into() },
        }
    }

    #[test]
    fn filter_is_a_conjunction() {
        let inst = sample("alpha", Kind::Python, "10.0.0.5");
        assert!(InstanceFilter::all().matches(&inst));
        assert!(InstanceFilter::named("alpha").with_kind(Kind::Python).matches(&inst));
        assert!(!InstanceFilter::named("alpha").with_class(ServiceClass::Database).matches(&inst));
        assert!(!InstanceFilter::on_host("10.0.0.9").matches(&inst));
    }

    #[test]
    fn patch_only_touches_set_fields() {
        let mut inst = sample("alpha", Kind::Mysql, "10.0.0.5");
        InstancePatch::host_address("10.0.0.9").apply(&mut inst);
        assert_eq!(inst.host_address, "10.0.0.9");
        assert_eq!(inst.port, 8080);
        assert_eq!(inst.container_id, "c");
    }

    #[test]
    fn kinds_parse_back() {
        for kind in Kind::ALL {
            assert_eq!(kind.as_str().parse::<Kind>().unwrap(), kind);
        }
        assert!("ruby".parse::<Kind>().is_err());
        assert_eq!(Kind::Lizardfs.class(), ServiceClass::Storage);
    }
}
