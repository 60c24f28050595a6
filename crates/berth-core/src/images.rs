//! Base image readiness.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::runtime::{ContainerRuntime, RuntimeResult, with_deadline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Present,
    Pulled,
}

/// Spellings under which the engine may list `reference` locally.
///
/// `docker.io/library/python:3` is listed as `python:3`, and an untagged
/// reference means `:latest`.
pub fn local_aliases(reference: &str) -> Vec<String> {
    let mut base = vec![reference.to_string()];
    if let Some(rest) = reference.strip_prefix("docker.io/") {
        base.push(rest.to_string());
        if let Some(official) = rest.strip_prefix("library/") {
            base.push(official.to_string());
        }
    }

    let mut aliases = Vec::with_capacity(base.len() * 2);
    for name in base {
        let last = name.rsplit('/').next().unwrap_or(&name);
        let untagged = !last.contains(':') && !name.contains('@');
        if untagged {
            aliases.push(format!("{name}:latest"));
        }
        aliases.push(name);
    }
    aliases
}

pub struct ImageManager {
    runtime: Arc<dyn ContainerRuntime>,
    list_deadline: Duration,
    pull_deadline: Duration,
}

impl ImageManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        list_deadline: Duration,
        pull_deadline: Duration,
    ) -> Self {
        Self {
            runtime,
            list_deadline,
            pull_deadline,
        }
    }

    /// Pull `reference` unless a local copy exists. Pull failures are returned,
    /// never retried here.
    pub async fn ensure(&self, reference: &str) -> RuntimeResult<ImageStatus> {
        let available =
            with_deadline(self.list_deadline, "list images", self.runtime.list_images()).await?;
        if is_available(&available, reference) {
            return Ok(ImageStatus::Present);
        }
        info!(image = %reference, "image not present locally; pulling");
        with_deadline(
            self.pull_deadline,
            "pull image",
            self.runtime.pull_image(reference),
        )
        .await?;
        Ok(ImageStatus::Pulled)
    }

    /// Startup variant: try every image, log failures, keep going.
    pub async fn ensure_all(&self, references: &[String]) -> Vec<(String, RuntimeResult<ImageStatus>)> {
        let mut results = Vec::with_capacity(references.len());
        for reference in references {
            let result = self.ensure(reference).await;
            if let Err(err) = &result {
                warn!(image = %reference, error = %err, "failed to prepare image");
            }
            results.push((reference.clone(), result));
        }
        results
    }
}

fn is_available(available: &[String], reference: &str) -> bool {
    local_aliases(reference)
        .iter()
        .any(|alias| available.iter().any(|tag| tag == alias))
}
