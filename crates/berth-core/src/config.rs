use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::instance::{Kind, ServiceClass};
use crate::runtime::ResourceLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Node-wide settings. Every section falls back to its defaults when absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BerthConfig {
    pub images: ImageConfig,
    pub ports: PortConfig,
    pub deadlines: DeadlineConfig,
    pub paths: PathConfig,
    pub plugin: PluginConfig,
    pub databases: DatabaseConfig,
    pub limits: LimitConfig,
}

impl BerthConfig {
    /// Load from a TOML file; `None` yields defaults. Credentials may be
    /// overridden from the environment afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.databases.apply_env();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reject settings no deployment could work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (label, port) in [
            ("mysql", self.ports.mysql),
            ("mongodb", self.ports.mongodb),
            ("lizardfs", self.ports.lizardfs),
        ] {
            if port == 0 {
                return Err(ConfigError::Invalid(format!("port for {label} must be non-zero")));
            }
        }
        for kind in Kind::ALL {
            if self.images.for_kind(kind).trim().is_empty() {
                return Err(ConfigError::Invalid(format!("image for {kind} is empty")));
            }
        }
        if self.images.python2.trim().is_empty() {
            return Err(ConfigError::Invalid("image for python2 is empty".into()));
        }
        if self.plugin.remote.trim().is_empty() {
            return Err(ConfigError::Invalid("plugin.remote is empty".into()));
        }
        if self.deadlines.runtime_secs == 0 || self.deadlines.pull_secs == 0 {
            return Err(ConfigError::Invalid("deadlines must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub python2: String,
    pub python3: String,
    pub node: String,
    #[serde(rename = "static")]
    pub static_site: String,
    pub mysql: String,
    pub mongodb: String,
    pub lizardfs: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            python2: "docker.io/library/python:2.7".into(),
            python3: "docker.io/library/python:3.11".into(),
            node: "docker.io/library/node:20".into(),
            static_site: "docker.io/library/nginx:stable".into(),
            mysql: "docker.io/library/mysql:5.7".into(),
            mongodb: "docker.io/library/mongo:4.4".into(),
            lizardfs: "docker.io/kadimasolutions/lizardfs:latest".into(),
        }
    }
}

impl ImageConfig {
    /// Default image per kind; python resolves to python3.
    pub fn for_kind(&self, kind: Kind) -> &str {
        match kind {
            Kind::Python => &self.python3,
            Kind::Node => &self.node,
            Kind::Static => &self.static_site,
            Kind::Mysql => &self.mysql,
            Kind::Mongodb => &self.mongodb,
            Kind::Lizardfs => &self.lizardfs,
        }
    }

    pub fn all(&self) -> Vec<String> {
        vec![
            self.python2.clone(),
            self.python3.clone(),
            self.node.clone(),
            self.static_site.clone(),
            self.mysql.clone(),
            self.mongodb.clone(),
            self.lizardfs.clone(),
        ]
    }
}

/// Host ports published by backing services.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub mysql: u16,
    pub mongodb: u16,
    pub lizardfs: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            mysql: 3306,
            mongodb: 27017,
            lizardfs: 9421,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeadlineConfig {
    pub runtime_secs: u64,
    pub pull_secs: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            runtime_secs: 30,
            pull_secs: 600,
        }
    }
}

impl DeadlineConfig {
    pub fn runtime(&self) -> Duration {
        Duration::from_secs(self.runtime_secs)
    }

    pub fn pull(&self) -> Duration {
        Duration::from_secs(self.pull_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Host directory holding one workspace per application.
    pub workspace_root: PathBuf,
    /// Host directory holding database data directories.
    pub data_root: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/var/lib/berth/apps"),
            data_root: PathBuf::from("/var/lib/berth/data"),
        }
    }
}

/// Distributed-storage volume plugin required by storage instances.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub remote: String,
    pub tag: String,
    pub args: Vec<String>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            remote: "kadimasolutions/lizardfs-volume-plugin".into(),
            tag: "latest".into(),
            args: vec![
                "HOST=0.0.0.0".into(),
                "PORT=9421".into(),
                "REMOTE_PATH=/".into(),
            ],
        }
    }
}

impl PluginConfig {
    /// `remote:tag`, the name the engine lists the plugin under.
    pub fn qualified(&self) -> String {
        format!("{}:{}", self.remote, self.tag)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub mysql_root_password: String,
    pub mongodb_root_user: String,
    pub mongodb_root_password: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            mysql_root_password: "berth".into(),
            mongodb_root_user: "root".into(),
            mongodb_root_password: "berth".into(),
        }
    }
}

impl DatabaseConfig {
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("BERTH_MYSQL_ROOT_PASSWORD") {
            self.mysql_root_password = v;
        }
        if let Ok(v) = std::env::var("BERTH_MONGODB_ROOT_PASSWORD") {
            self.mongodb_root_password = v;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassLimits {
    pub memory_mb: u64,
    pub cpus: f64,
}

impl ClassLimits {
    pub fn to_limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_bytes: (self.memory_mb > 0).then(|| self.memory_mb * 1024 * 1024),
            cpus: (self.cpus > 0.0).then_some(self.cpus),
        }
    }
}

impl Default for ClassLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpus: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    pub application: ClassLimits,
    pub database: ClassLimits,
    pub storage: ClassLimits,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            application: ClassLimits::default(),
            database: ClassLimits {
                memory_mb: 1024,
                cpus: 1.0,
            },
            storage: ClassLimits::default(),
        }
    }
}

impl LimitConfig {
    pub fn for_class(&self, class: ServiceClass) -> ResourceLimits {
        match class {
            ServiceClass::Application => self.application.to_limits(),
            ServiceClass::Database => self.database.to_limits(),
            ServiceClass::Storage => self.storage.to_limits(),
        }
    }
}
