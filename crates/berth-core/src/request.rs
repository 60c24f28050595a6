//! Typed provisioning requests, one variant per instance kind.
//!
//! Requests are decoded and validated once at the boundary; the pipeline
//! only ever sees a request that passed [`ProvisionRequest::validate`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;
use crate::instance::Kind;

const NAME_MIN: usize = 3;
const NAME_MAX: usize = 40;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvisionRequest {
    Python(PythonApp),
    Node(NodeApp),
    Static(StaticApp),
    Mysql(DatabaseRequest),
    Mongodb(DatabaseRequest),
    Lizardfs(StorageRequest),
}

/// Entry point and port of an application process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppContext {
    pub index: String,
    pub port: u16,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PythonVersion {
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PythonApp {
    pub name: String,
    pub url: String,
    pub context: AppContext,
    pub python_version: PythonVersion,
    /// Path of the requirements file inside the source tree.
    #[serde(default)]
    pub requirements: Option<String>,
    /// Run `manage.py runserver` instead of `context.index`.
    #[serde(default)]
    pub django: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeApp {
    pub name: String,
    pub url: String,
    pub context: AppContext,
    /// Extra arguments for `npm install`.
    #[serde(default)]
    pub build_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticApp {
    pub name: String,
    pub url: String,
    pub port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRequest {
    pub name: String,
    /// Host port; defaults to the configured port for the engine.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRequest {
    pub name: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Plugin-backed volume name; defaults to `<name>-data`.
    #[serde(default)]
    pub volume: Option<String>,
}

impl ProvisionRequest {
    pub fn name(&self) -> &str {
        match self {
            ProvisionRequest::Python(r) => &r.name,
            ProvisionRequest::Node(r) => &r.name,
            ProvisionRequest::Static(r) => &r.name,
            ProvisionRequest::Mysql(r) | ProvisionRequest::Mongodb(r) => &r.name,
            ProvisionRequest::Lizardfs(r) => &r.name,
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            ProvisionRequest::Python(_) => Kind::Python,
            ProvisionRequest::Node(_) => Kind::Node,
            ProvisionRequest::Static(_) => Kind::Static,
            ProvisionRequest::Mysql(_) => Kind::Mysql,
            ProvisionRequest::Mongodb(_) => Kind::Mongodb,
            ProvisionRequest::Lizardfs(_) => Kind::Lizardfs,
        }
    }

    /// Decode a JSON request body and validate it.
    pub fn from_json(body: &str) -> Result<Self, ProvisionError> {
        let request: Self = serde_json::from_str(body)
            .map_err(|e| ProvisionError::Validation(format!("malformed request: {e}")))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        validate_name(self.name())?;
        match self {
            ProvisionRequest::Python(r) => {
                validate_url(&r.url)?;
                validate_context(&r.context, r.django)?;
                if let Some(path) = &r.requirements {
                    if path.trim().is_empty() {
                        return invalid("requirements path is empty");
                    }
                }
                validate_env(&r.env)
            }
            ProvisionRequest::Node(r) => {
                validate_url(&r.url)?;
                validate_context(&r.context, false)?;
                validate_env(&r.env)
            }
            ProvisionRequest::Static(r) => {
                validate_url(&r.url)?;
                validate_port(r.port)?;
                validate_env(&r.env)
            }
            ProvisionRequest::Mysql(r) | ProvisionRequest::Mongodb(r) => {
                if let Some(port) = r.port {
                    validate_port(port)?;
                }
                validate_env(&r.env)
            }
            ProvisionRequest::Lizardfs(r) => {
                if let Some(port) = r.port {
                    validate_port(port)?;
                }
                if let Some(volume) = &r.volume {
                    validate_name(volume)?;
                }
                Ok(())
            }
        }
    }
}

fn invalid<T>(msg: impl Into<String>) -> Result<T, ProvisionError> {
    Err(ProvisionError::Validation(msg.into()))
}

fn validate_name(name: &str) -> Result<(), ProvisionError> {
    let len = name.chars().count();
    if !(NAME_MIN..=NAME_MAX).contains(&len) {
        return invalid(format!(
            "name '{name}' must be {NAME_MIN} to {NAME_MAX} characters"
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return invalid(format!("name '{name}' must be alphanumeric"));
    }
    Ok(())
}

fn validate_url(raw: &str) -> Result<(), ProvisionError> {
    match url::Url::parse(raw) {
        Ok(_) => Ok(()),
        Err(e) => invalid(format!("url '{raw}' is not valid: {e}")),
    }
}

fn validate_port(port: u16) -> Result<(), ProvisionError> {
    if port == 0 {
        return invalid("port must be non-zero");
    }
    Ok(())
}

fn validate_context(context: &AppContext, index_optional: bool) -> Result<(), ProvisionError> {
    validate_port(context.port)?;
    if !index_optional && context.index.trim().is_empty() {
        return invalid("context.index is required");
    }
    Ok(())
}

fn validate_env(env: &BTreeMap<String, String>) -> Result<(), ProvisionError> {
    for key in env.keys() {
        if key.is_empty() || key.contains('=') {
            return invalid(format!("invalid environment variable name '{key}'"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn decodes_python_request() {
        let request = ProvisionRequest::from_json(
            r#"{
                "kind": "python",
                "name": "alpha",
                "url": "https://example.com/alpha.git",
                "python_version": "3",
                "requirements": "requirements.txt",
                "context": { "index": "main.py", "port": 8000, "args": ["--debug"] }
            }"#,
        )
        .unwrap();
        assert_eq!(request.kind(), Kind::Python);
        assert_eq!(request.name(), "alpha");
        let ProvisionRequest::Python(app) = request else {
            panic!("expected python request");
        };
        assert_eq!(app.python_version, PythonVersion::Three);
        assert!(!app.django);
    }

    #[test]
    fn rejects_bad_names() {
        let long = "x".repeat(41);
        for name in ["ab", "has-dash", long.as_str()] {
            let request = ProvisionRequest::Mysql(DatabaseRequest {
                name: name.to_string(),
                port: None,
                env: BTreeMap::new(),
            });
            let err = request.validate().unwrap_err();
            assert_eq!(err.class(), ErrorClass::Validation, "{name}");
        }
    }

    #[test]
    fn rejects_missing_fields_and_bad_urls() {
        assert!(ProvisionRequest::from_json(r#"{"kind":"static","name":"site"}"#).is_err());
        let err = ProvisionRequest::from_json(
            r#"{"kind":"static","name":"site","url":"not a url","port":80}"#,
        )
        .unwrap_err();
        assert!(err.is_client_error());
        assert!(ProvisionRequest::from_json(r#"{"kind":"ruby","name":"gem"}"#).is_err());
    }

    #[test]
    fn django_does_not_need_an_index() {
        let request = ProvisionRequest::Python(PythonApp {
            name: "blog".into(),
            url: "https://example.com/blog.git".into(),
            context: AppContext {
                index: String::new(),
                port: 8000,
                args: vec![],
            },
            python_version: PythonVersion::Two,
            requirements: None,
            django: true,
            env: BTreeMap::new(),
        });
        request.validate().unwrap();
    }
}
