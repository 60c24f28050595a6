//! Idempotent "make sure this named container is running".
//!
//! Decision table, re-evaluated against the engine on every call:
//!
//! | observed                  | action                                   |
//! |---------------------------|------------------------------------------|
//! | absent                    | create                                   |
//! | present, inspect fails    | delete, then create exactly once         |
//! | present, not running      | start (a failed start is not retried)    |
//! | present, running          | nothing                                  |
//!
//! After a create (first or recreation) the container is not re-inspected:
//! the create function is trusted to have started it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::locks::NameLocks;
use crate::runtime::{ContainerId, ContainerRuntime, RuntimeResult, with_deadline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureAction {
    Created,
    /// Existing container was unreadable and has been replaced.
    Recreated,
    Started,
    AlreadyRunning,
}

impl EnsureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnsureAction::Created => "created",
            EnsureAction::Recreated => "recreated",
            EnsureAction::Started => "started",
            EnsureAction::AlreadyRunning => "already_running",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub container_id: ContainerId,
    pub action: EnsureAction,
}

pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    locks: NameLocks,
    deadline: Duration,
}

impl LifecycleManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, deadline: Duration) -> Self {
        Self {
            runtime,
            locks: NameLocks::new(),
            deadline,
        }
    }

    /// Ensure `name` has a running container, calling `create` when one must
    /// be built. Concurrent calls for the same name are serialized.
    pub async fn ensure_running<F, Fut>(&self, name: &str, create: F) -> RuntimeResult<EnsureOutcome>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RuntimeResult<ContainerId>>,
    {
        let _guard = self.locks.acquire(name).await;
        self.ensure_locked(name, &create).await
    }

    async fn ensure_locked<F, Fut>(&self, name: &str, create: &F) -> RuntimeResult<EnsureOutcome>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RuntimeResult<ContainerId>>,
    {
        let containers = with_deadline(
            self.deadline,
            "list containers",
            self.runtime.list_containers(),
        )
        .await?;

        if !containers.iter().any(|c| c == name) {
            info!(name = %name, "no container found; building it");
            let container_id = with_deadline(self.deadline, "create container", create()).await?;
            info!(name = %name, container = %container_id, "container deployed");
            return Ok(EnsureOutcome {
                container_id,
                action: EnsureAction::Created,
            });
        }

        let state = match with_deadline(
            self.deadline,
            "inspect container",
            self.runtime.inspect_container(name),
        )
        .await
        {
            Ok(state) => state,
            Err(err) => return self.recreate(name, create, err).await,
        };

        if state.running {
            debug!(name = %name, container = %state.id, "container already running");
            return Ok(EnsureOutcome {
                container_id: state.id,
                action: EnsureAction::AlreadyRunning,
            });
        }

        info!(name = %name, container = %state.id, "container stopped; starting it");
        with_deadline(
            self.deadline,
            "start container",
            self.runtime.start_container(name),
        )
        .await?;
        Ok(EnsureOutcome {
            container_id: state.id,
            action: EnsureAction::Started,
        })
    }

    async fn recreate<F, Fut>(
        &self,
        name: &str,
        create: &F,
        cause: RuntimeError,
    ) -> RuntimeResult<EnsureOutcome>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RuntimeResult<ContainerId>>,
    {
        warn!(name = %name, error = %cause, "container state unreadable; deleting and deploying again");
        if let Err(err) = with_deadline(
            self.deadline,
            "delete container",
            self.runtime.delete_container(name),
        )
        .await
        {
            warn!(name = %name, error = %err, "delete before recreation failed");
        }

        let container_id = with_deadline(self.deadline, "create container", create())
            .await
            .inspect_err(|err| {
                warn!(name = %name, error = %err, "recreation failed; giving up for this call");
            })?;
        info!(name = %name, container = %container_id, "container redeployed");
        Ok(EnsureOutcome {
            container_id,
            action: EnsureAction::Recreated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{FailPoint, MockRuntime, RuntimeCall};
    use crate::runtime::ContainerSpec;

    fn manager(runtime: &Arc<MockRuntime>) -> LifecycleManager {
        LifecycleManager::new(runtime.clone(), Duration::from_secs(5))
    }

    async fn ensure(
        lifecycle: &LifecycleManager,
        runtime: &Arc<MockRuntime>,
        name: &str,
    ) -> RuntimeResult<EnsureOutcome> {
        let spec = ContainerSpec::new(name, "img:v1");
        lifecycle
            .ensure_running(name, || {
                let runtime = runtime.clone();
                let spec = spec.clone();
                async move {
                    let id = runtime.create_container(&spec).await?;
                    runtime.start_container(&spec.name).await?;
                    Ok(id)
                }
            })
            .await
    }

    #[tokio::test]
    async fn second_call_only_inspects() {
        let runtime = Arc::new(MockRuntime::new());
        let lifecycle = manager(&runtime);

        let first = ensure(&lifecycle, &runtime, "alpha").await.unwrap();
        assert_eq!(first.action, EnsureAction::Created);

        let second = ensure(&lifecycle, &runtime, "alpha").await.unwrap();
        assert_eq!(second.action, EnsureAction::AlreadyRunning);
        assert_eq!(second.container_id, first.container_id);

        assert_eq!(runtime.count(|c| matches!(c, RuntimeCall::Create(_))), 1);
        assert_eq!(runtime.count(|c| matches!(c, RuntimeCall::Delete(_))), 0);
    }

    #[tokio::test]
    async fn stopped_container_is_started_not_recreated() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_container("alpha", false);
        let lifecycle = manager(&runtime);

        let outcome = ensure(&lifecycle, &runtime, "alpha").await.unwrap();
        assert_eq!(outcome.action, EnsureAction::Started);
        assert!(runtime.is_running("alpha"));
        assert_eq!(runtime.count(|c| matches!(c, RuntimeCall::Create(_))), 0);
    }

    #[tokio::test]
    async fn failed_start_is_reported_once() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_container("alpha", false);
        runtime.fail(FailPoint::Start);
        let lifecycle = manager(&runtime);

        let err = ensure(&lifecycle, &runtime, "alpha").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(_)));
        assert_eq!(runtime.count(|c| matches!(c, RuntimeCall::Start(_))), 1);
    }

    #[tokio::test]
    async fn unreadable_container_is_replaced() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_corrupt_container("alpha");
        let lifecycle = manager(&runtime);

        let outcome = ensure(&lifecycle, &runtime, "alpha").await.unwrap();
        assert_eq!(outcome.action, EnsureAction::Recreated);
        assert_eq!(
            runtime.calls_matching(|c| matches!(c, RuntimeCall::Delete(_) | RuntimeCall::Create(_))),
            vec![
                RuntimeCall::Delete("alpha".into()),
                RuntimeCall::Create("alpha".into()),
            ]
        );
        // Trusted without re-inspection.
        assert_eq!(runtime.count(|c| matches!(c, RuntimeCall::Inspect(_))), 1);
    }

    #[tokio::test]
    async fn recreation_is_attempted_at_most_once() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_corrupt_container("alpha");
        runtime.fail(FailPoint::Create);
        let lifecycle = manager(&runtime);

        let err = ensure(&lifecycle, &runtime, "alpha").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(_)));
        assert_eq!(runtime.count(|c| matches!(c, RuntimeCall::Create(_))), 1);
    }

    #[tokio::test]
    async fn delete_failure_does_not_block_recreation() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_corrupt_container("alpha");
        runtime.fail(FailPoint::Delete);
        let lifecycle = manager(&runtime);

        let outcome = ensure(&lifecycle, &runtime, "alpha").await;
        // The mock refuses to create over a container it still holds.
        assert!(outcome.is_err());
        assert_eq!(runtime.count(|c| matches!(c, RuntimeCall::Create(_))), 1);
    }

    #[tokio::test]
    async fn concurrent_calls_for_one_name_create_once() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_latency(Duration::from_millis(10));
        let lifecycle = Arc::new(manager(&runtime));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lifecycle = lifecycle.clone();
            let runtime = runtime.clone();
            handles.push(tokio::spawn(async move {
                ensure(&lifecycle, &runtime, "alpha").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(runtime.count(|c| matches!(c, RuntimeCall::Create(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_runtime_hits_the_deadline() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_latency(Duration::from_secs(60));
        let lifecycle = manager(&runtime);

        let err = ensure(&lifecycle, &runtime, "alpha").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { op: "list containers", .. }));
    }
}
