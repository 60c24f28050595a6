use std::time::Duration;

use super::*;
use crate::directory::ServiceDirectory;
use crate::error::ErrorClass;
use crate::fixtures::{
    FailPoint, RuntimeCall, StoreOp, TEST_HOST, TEST_IMAGE, TestNode, mysql_request,
    python_request, sample_instance, static_request, storage_request, test_config,
};
use crate::reconciler::ReconcileOutcome;
use crate::runtime::MountSource;
use crate::store::MetadataStore;

fn creates(node: &TestNode) -> usize {
    node.runtime
        .count(|c| matches!(c, RuntimeCall::Create(_)))
}

fn assert_nothing_recorded(node: &TestNode) {
    assert!(node.store.records().is_empty());
    assert_eq!(node.store.insert_calls(), 0);
    assert!(node.directory.registrations().is_empty());
}

#[tokio::test]
async fn first_deploy_then_redeploy_of_a_running_app() {
    let node = TestNode::new();
    node.runtime.add_image(TEST_IMAGE);

    let first = node.pipeline.provision(python_request("alpha")).await.unwrap();
    assert_eq!(first.action, EnsureAction::Created);
    assert_eq!(first.address, "10.0.0.5:8000");
    assert_eq!(creates(&node), 1);

    let execs = node.runtime.execs();
    assert_eq!(execs.len(), 2);
    assert!(execs[0][2].contains("pip install"));
    assert!(execs[1][2].contains("exec python main.py"));

    let records = node.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].instance.name, "alpha");
    assert_eq!(records[0].instance.host_address, TEST_HOST);
    assert_eq!(records[0].instance.container_id, first.container_id.to_string());
    assert_eq!(
        node.directory.registrations(),
        vec![(Kind::Python, "10.0.0.5:8000".to_string())]
    );

    let second = node.pipeline.provision(python_request("alpha")).await.unwrap();
    assert_eq!(second.action, EnsureAction::AlreadyRunning);
    assert_eq!(second.id, first.id);
    assert_eq!(creates(&node), 1);
    assert_eq!(node.store.insert_calls(), 1);
    assert_eq!(node.store.records().len(), 1);
    assert_eq!(node.directory.registrations().len(), 2);
    assert_eq!(
        node.directory.entries(Kind::Python).await.unwrap(),
        vec![("10.0.0.5:8000".to_string(), 2)]
    );
}

#[tokio::test]
async fn invalid_request_touches_nothing() {
    let node = TestNode::new();
    let err = node.pipeline.provision(python_request("a-b")).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
    assert!(node.runtime.calls().is_empty());
    assert_nothing_recorded(&node);
}

#[tokio::test]
async fn image_failure_records_nothing() {
    let node = TestNode::new();
    node.runtime.fail(FailPoint::Pull);
    let err = node.pipeline.provision(python_request("alpha")).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::RuntimeUnavailable);
    assert_eq!(err.step(), Step::Image);
    assert_eq!(creates(&node), 0);
    assert_nothing_recorded(&node);
}

#[tokio::test]
async fn container_failure_records_nothing() {
    let node = TestNode::new();
    node.runtime.fail(FailPoint::Create);
    let err = node.pipeline.provision(python_request("alpha")).await.unwrap_err();
    assert_eq!(err.step(), Step::Container);
    assert_nothing_recorded(&node);
}

#[tokio::test]
async fn dependency_step_failure_records_nothing() {
    let node = TestNode::new();
    node.runtime.fail(FailPoint::Exec);
    let err = node.pipeline.provision(python_request("alpha")).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::DependencyInstallFailed);
    assert!(node.runtime.is_running("alpha"));
    assert_nothing_recorded(&node);
}

#[tokio::test]
async fn launch_step_failure_records_nothing() {
    let node = TestNode::new();
    node.runtime.fail_exec_after(1);
    let err = node.pipeline.provision(python_request("alpha")).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::LaunchFailed);
    assert_eq!(node.runtime.execs().len(), 2);
    assert_nothing_recorded(&node);
}

#[tokio::test]
async fn plugin_failure_blocks_only_storage() {
    let node = TestNode::new();
    node.runtime.fail(FailPoint::EnablePlugin);

    let err = node
        .pipeline
        .provision(storage_request("chunks"))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::BootstrapFailed);
    assert_eq!(creates(&node), 0);
    assert_nothing_recorded(&node);

    node.pipeline.provision(mysql_request("orders")).await.unwrap();
    assert_eq!(node.store.records().len(), 1);
}

#[tokio::test]
async fn storage_gets_plugin_before_its_container() {
    let node = TestNode::new();
    let handle = node.pipeline.provision(storage_request("chunks")).await.unwrap();
    assert_eq!(handle.address, "10.0.0.5:9421");

    let calls = node.runtime.calls();
    let enabled = calls
        .iter()
        .position(|c| matches!(c, RuntimeCall::EnablePlugin(_)))
        .unwrap();
    let created = calls
        .iter()
        .position(|c| matches!(c, RuntimeCall::Create(_)))
        .unwrap();
    assert!(enabled < created);

    let spec = node.runtime.container_spec("chunks").unwrap();
    assert!(matches!(
        &spec.mounts[0].source,
        MountSource::Volume { driver, .. } if driver == "kadimasolutions/lizardfs-volume-plugin:latest"
    ));
}

#[tokio::test]
async fn metadata_write_failure_is_flagged_and_container_kept() {
    let node = TestNode::new();
    node.store.fail(StoreOp::Insert);
    let err = node.pipeline.provision(python_request("alpha")).await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::PersistenceFailed);
    assert_eq!(err.step(), Step::Persist);
    assert!(err.leaves_inconsistency());
    assert!(node.runtime.is_running("alpha"));
    assert!(node.store.records().is_empty());
    assert!(node.directory.registrations().is_empty());
}

#[tokio::test]
async fn directory_failure_is_flagged_after_the_record_is_written() {
    let node = TestNode::new();
    node.directory.set_failing(true);
    let err = node.pipeline.provision(static_request("site")).await.unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::PersistenceFailed {
            stage: PersistStage::Directory,
            ..
        }
    ));
    assert!(err.leaves_inconsistency());
    assert_eq!(node.store.records().len(), 1);
}

#[tokio::test]
async fn unreadable_store_stops_before_any_container_work() {
    let node = TestNode::new();
    node.store.fail(StoreOp::Find);
    let err = node.pipeline.provision(python_request("alpha")).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::MetadataUnavailable);
    assert!(node.runtime.calls().is_empty());
}

#[tokio::test]
async fn name_taken_by_another_kind_is_a_conflict() {
    let node = TestNode::new();
    node.pipeline.provision(mysql_request("shared")).await.unwrap();

    let err = node.pipeline.provision(python_request("shared")).await.unwrap_err();
    assert!(err.is_client_error());
    assert!(matches!(
        err,
        ProvisionError::ResourceConflict {
            existing_kind: Kind::Mysql,
            existing_class: ServiceClass::Database,
            requested: Kind::Python,
            ..
        }
    ));
    assert_eq!(creates(&node), 1);
}

#[tokio::test]
async fn concurrent_requests_for_one_name_create_once() {
    let node = TestNode::new();
    node.runtime.set_latency(Duration::from_millis(5));

    let (a, b) = tokio::join!(
        node.pipeline.provision(python_request("alpha")),
        node.pipeline.provision(python_request("alpha")),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(creates(&node), 1);
    assert_eq!(node.store.records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_runtime_is_reported_as_timeout() {
    let node = TestNode::new();
    node.runtime.set_latency(Duration::from_secs(60));
    let err = node.pipeline.provision(python_request("alpha")).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Timeout);
    assert_eq!(err.step(), Step::Image);
    assert_nothing_recorded(&node);
}

#[tokio::test]
async fn host_address_change_repoints_only_local_records() {
    let node = TestNode::new();
    for name in ["alpha", "beta", "gamma"] {
        node.pipeline.provision(python_request(name)).await.unwrap();
    }
    node.store
        .insert(&sample_instance("remote", Kind::Node, "10.0.0.7"))
        .await
        .unwrap();

    let outcome = node.reconciler.reconcile("10.0.0.9").await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Repointed {
            from: TEST_HOST.into(),
            to: "10.0.0.9".into(),
            records: 3,
        }
    );
    let moved = node
        .pipeline
        .instances(&InstanceFilter::on_host("10.0.0.9"))
        .await
        .unwrap();
    assert_eq!(moved.len(), 3);
    let remote = node
        .pipeline
        .instances(&InstanceFilter::named("remote"))
        .await
        .unwrap();
    assert_eq!(remote[0].instance.host_address, "10.0.0.7");

    // New deployments are published under the new address.
    let handle = node.pipeline.provision(python_request("delta")).await.unwrap();
    assert_eq!(handle.address, "10.0.0.9:8000");
}

#[tokio::test]
async fn failed_reconcile_is_retried_by_the_next_call() {
    let node = TestNode::new();
    for name in ["alpha", "beta", "gamma"] {
        node.pipeline.provision(python_request(name)).await.unwrap();
    }

    node.store.fail(StoreOp::Update);
    assert!(node.reconciler.reconcile("10.0.0.9").await.is_err());
    assert_eq!(node.reconciler.address().current(), TEST_HOST);
    assert_eq!(
        node.pipeline
            .instances(&InstanceFilter::on_host(TEST_HOST))
            .await
            .unwrap()
            .len(),
        3
    );

    node.store.heal(StoreOp::Update);
    let outcome = node.reconciler.reconcile("10.0.0.9").await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Repointed { records: 3, .. }));
    assert_eq!(node.reconciler.address().current(), "10.0.0.9");
}

#[tokio::test]
async fn republish_registers_local_records_without_touching_load() {
    let node = TestNode::new();
    node.pipeline.provision(python_request("alpha")).await.unwrap();
    node.pipeline.provision(mysql_request("orders")).await.unwrap();
    node.store
        .insert(&sample_instance("remote", Kind::Node, "10.0.0.7"))
        .await
        .unwrap();

    assert_eq!(node.pipeline.republish().await.unwrap(), 2);
    assert_eq!(node.directory.registrations().len(), 4);
    assert_eq!(
        node.directory.entries(Kind::Mysql).await.unwrap(),
        vec![("10.0.0.5:3306".to_string(), 1)]
    );
}

#[tokio::test]
async fn prepare_host_pulls_images_and_readies_the_plugin() {
    let node = TestNode::with_config(test_config());
    node.runtime.fail(FailPoint::Pull);
    node.runtime.add_image(TEST_IMAGE);

    let report = node.pipeline.prepare_host().await;
    assert!(report.plugin.is_ok());
    // python2/python3/node/static share the local test image.
    assert_eq!(report.images.iter().filter(|(_, r)| r.is_ok()).count(), 4);
    assert_eq!(
        node.runtime
            .plugin_enabled("kadimasolutions/lizardfs-volume-plugin:latest"),
        Some(true)
    );
}

#[tokio::test]
async fn same_name_on_another_host_is_a_conflict() {
    let node = TestNode::new();
    node.store
        .insert(&sample_instance("alpha", Kind::Python, "10.0.0.7"))
        .await
        .unwrap();

    let err = node.pipeline.provision(python_request("alpha")).await.unwrap_err();
    match &err {
        ProvisionError::ResourceConflict {
            existing_kind,
            existing_host,
            requested,
            ..
        } => {
            assert_eq!(*existing_kind, Kind::Python);
            assert_eq!(existing_host, "10.0.0.7");
            assert_eq!(*requested, Kind::Python);
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
    assert_eq!(creates(&node), 0);
    assert_eq!(node.store.update_calls(), 0);

    let records = node.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].instance.host_address, "10.0.0.7");
    assert_eq!(records[0].instance.container_id, "c-alpha");
}

#[tokio::test]
async fn redeploy_updates_only_the_local_record() {
    let node = TestNode::new();
    node.pipeline.provision(python_request("alpha")).await.unwrap();
    node.store
        .insert(&sample_instance("beta", Kind::Python, "10.0.0.7"))
        .await
        .unwrap();

    let handle = node.pipeline.provision(python_request("alpha")).await.unwrap();
    let alpha = node
        .pipeline
        .instances(&InstanceFilter::named("alpha"))
        .await
        .unwrap();
    assert_eq!(alpha.len(), 1);
    assert_eq!(alpha[0].id, handle.id);
    assert_eq!(alpha[0].instance.host_address, TEST_HOST);
    let beta = node
        .pipeline
        .instances(&InstanceFilter::named("beta"))
        .await
        .unwrap();
    assert_eq!(beta[0].instance.container_id, "c-beta");
}

#[tokio::test]
async fn address_change_moves_directory_entries_with_their_load() {
    let node = TestNode::new();
    node.pipeline.provision(python_request("alpha")).await.unwrap();
    node.pipeline.provision(mysql_request("orders")).await.unwrap();

    let outcome = node.reconciler.reconcile("10.0.0.9").await.unwrap();
    let ReconcileOutcome::Repointed { from, .. } = outcome else {
        panic!("address should have moved");
    };
    assert_eq!(node.pipeline.move_published(&from).await.unwrap(), 2);

    assert_eq!(
        node.directory.entries(Kind::Python).await.unwrap(),
        vec![("10.0.0.9:8000".to_string(), 1)]
    );
    assert_eq!(
        node.directory.entries(Kind::Mysql).await.unwrap(),
        vec![("10.0.0.9:3306".to_string(), 1)]
    );
    assert_eq!(
        node.directory.least_loaded(Kind::Python).await.unwrap().as_deref(),
        Some("10.0.0.9:8000")
    );
}

#[tokio::test]
async fn moving_entries_registers_ones_the_directory_lost() {
    let node = TestNode::new();
    node.store
        .insert(&sample_instance("alpha", Kind::Python, "10.0.0.9"))
        .await
        .unwrap();
    node.reconciler.reconcile("10.0.0.9").await.unwrap();

    assert_eq!(node.pipeline.move_published(TEST_HOST).await.unwrap(), 1);
    assert_eq!(
        node.directory.entries(Kind::Python).await.unwrap(),
        vec![("10.0.0.9:8000".to_string(), 0)]
    );
}
