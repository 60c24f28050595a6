//! Volume plugin bootstrap for storage-backed containers.
//!
//! Install and enable are separate steps. An install failure is logged and
//! the enable check still runs, so a plugin installed concurrently by another
//! path is tolerated; if the plugin really is missing the enable check fails.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::PluginConfig;
use crate::error::ProvisionError;
use crate::runtime::{ContainerRuntime, PluginInstall, with_deadline};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginReport {
    pub installed: bool,
    pub enabled: bool,
    /// Install error that was tolerated on the way to an enabled plugin.
    pub install_error: Option<String>,
}

pub struct PluginBootstrap {
    runtime: Arc<dyn ContainerRuntime>,
    deadline: Duration,
}

impl PluginBootstrap {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, deadline: Duration) -> Self {
        Self { runtime, deadline }
    }

    /// Leave the plugin installed and enabled. Safe to call repeatedly.
    pub async fn ensure_ready(&self, plugin: &PluginConfig) -> Result<PluginReport, ProvisionError> {
        let qualified = plugin.qualified();
        let mut report = PluginReport::default();

        let installed = with_deadline(self.deadline, "list plugins", self.runtime.list_plugins())
            .await
            .map_err(|e| ProvisionError::BootstrapFailed(format!("cannot list plugins: {e}")))?;

        if !installed.iter().any(|p| *p == qualified) {
            info!(plugin = %qualified, "volume plugin not found on host; installing");
            let opts = PluginInstall {
                remote: qualified.clone(),
                args: plugin.args.clone(),
                grant_all_permissions: true,
                disabled: true,
            };
            match with_deadline(self.deadline, "install plugin", self.runtime.install_plugin(&opts))
                .await
            {
                Ok(()) => report.installed = true,
                Err(err) => {
                    warn!(plugin = %qualified, error = %err, "plugin install failed; checking enable state anyway");
                    report.install_error = Some(err.to_string());
                }
            }
        }

        let enabled = with_deadline(
            self.deadline,
            "inspect plugin",
            self.runtime.is_plugin_enabled(&qualified),
        )
        .await
        .map_err(|e| bootstrap_failure(&qualified, "cannot read enabled state", e, &report))?;

        if !enabled {
            with_deadline(
                self.deadline,
                "enable plugin",
                self.runtime.enable_plugin(&qualified),
            )
            .await
            .map_err(|e| bootstrap_failure(&qualified, "enable failed", e, &report))?;
            report.enabled = true;
            info!(plugin = %qualified, "volume plugin enabled");
        }

        Ok(report)
    }
}

fn bootstrap_failure(
    plugin: &str,
    what: &str,
    err: impl std::fmt::Display,
    report: &PluginReport,
) -> ProvisionError {
    let mut msg = format!("{plugin}: {what}: {err}");
    if let Some(install) = &report.install_error {
        msg.push_str(&format!(" (install had failed: {install})"));
    }
    ProvisionError::BootstrapFailed(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::fixtures::{FailPoint, MockRuntime, RuntimeCall};

    const PLUGIN: &str = "kadimasolutions/lizardfs-volume-plugin:latest";

    fn bootstrap(runtime: &Arc<MockRuntime>) -> PluginBootstrap {
        PluginBootstrap::new(runtime.clone(), Duration::from_secs(5))
    }

    fn installs(runtime: &MockRuntime) -> usize {
        runtime.count(|c| matches!(c, RuntimeCall::InstallPlugin(_)))
    }

    #[tokio::test]
    async fn converges_from_not_installed() {
        let runtime = Arc::new(MockRuntime::new());
        let report = bootstrap(&runtime)
            .ensure_ready(&PluginConfig::default())
            .await
            .unwrap();
        assert!(report.installed && report.enabled);
        assert_eq!(runtime.plugin_enabled(PLUGIN), Some(true));
        assert_eq!(installs(&runtime), 1);
    }

    #[tokio::test]
    async fn converges_from_installed_disabled() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_plugin(PLUGIN, false);
        let report = bootstrap(&runtime)
            .ensure_ready(&PluginConfig::default())
            .await
            .unwrap();
        assert!(!report.installed && report.enabled);
        assert_eq!(runtime.plugin_enabled(PLUGIN), Some(true));
        assert_eq!(installs(&runtime), 0);
    }

    #[tokio::test]
    async fn converges_from_installed_enabled() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_plugin(PLUGIN, true);
        let report = bootstrap(&runtime)
            .ensure_ready(&PluginConfig::default())
            .await
            .unwrap();
        assert_eq!(report, PluginReport::default());
        assert_eq!(installs(&runtime), 0);
        assert_eq!(runtime.count(|c| matches!(c, RuntimeCall::EnablePlugin(_))), 0);
    }

    #[tokio::test]
    async fn install_failure_surfaces_through_enable_check() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail(FailPoint::InstallPlugin);
        let err = bootstrap(&runtime)
            .ensure_ready(&PluginConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::BootstrapFailed);
        assert!(err.to_string().contains("install had failed"));
    }

    #[tokio::test]
    async fn enable_failure_is_distinct_from_install() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail(FailPoint::EnablePlugin);
        let err = bootstrap(&runtime)
            .ensure_ready(&PluginConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("enable failed"));
        assert_eq!(runtime.plugin_enabled(PLUGIN), Some(false));
    }
}
