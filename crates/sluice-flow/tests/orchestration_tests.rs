//! End-to-end orchestration tests over the in-memory backends.
//!
//! These exercise the full control loop: ingress, worker feed, result
//! handling, join fan-in, and the maintenance sweeps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;

use sluice_core::MemoryBackend;
use sluice_flow::action::{ActionResult, ReinjectChild};
use sluice_flow::config::{JoinConfig, OrchestratorConfig, QueueConfig, SweepConfig};
use sluice_flow::deltafile::{ActionState, SourceInfo, Stage};
use sluice_flow::error::Result;
use sluice_flow::join::memory::InMemoryJoinRepository;
use sluice_flow::join::JoinCoordinator;
use sluice_flow::maintenance::{DeleteSweep, JoinSweep, RequeueSweep};
use sluice_flow::orchestrator::{FlowAction, FlowPlan, JoinSpec, Orchestrator, JOIN_GROUP_KEY, JOIN_INDEX_KEY};
use sluice_flow::queue::memory::MemoryQueueBackend;
use sluice_flow::queue::ActionQueue;
use sluice_flow::segment::{Content, ContentStore};
use sluice_flow::store::memory::InMemoryDeltaFileStore;
use sluice_flow::store::DeltaFileStore;

const TAKE: Option<Duration> = Some(Duration::from_millis(200));

struct Harness {
    store: Arc<InMemoryDeltaFileStore>,
    backend: Arc<MemoryBackend>,
    content: ContentStore,
    queue: ActionQueue,
    joins: Arc<InMemoryJoinRepository>,
    orchestrator: Arc<Orchestrator>,
    sweep_config: SweepConfig,
}

fn harness(plans: Vec<FlowPlan>) -> Harness {
    let store = Arc::new(InMemoryDeltaFileStore::new());
    let backend = Arc::new(MemoryBackend::new());
    let content = ContentStore::new(backend.clone());
    let queue = ActionQueue::new(Arc::new(MemoryQueueBackend::new()), QueueConfig::default());
    let joins = Arc::new(InMemoryJoinRepository::new());
    let join_config = JoinConfig {
        retry_delay: Duration::from_millis(1),
        acquire_timeout: Duration::from_secs(5),
        lock_staleness: Duration::from_secs(300),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        queue.clone(),
        JoinCoordinator::new(joins.clone(), join_config),
        content.clone(),
        plans,
        OrchestratorConfig::default(),
    ));

    let sweep_config = SweepConfig {
        requeue_interval: Duration::from_millis(50),
        requeue_after: Duration::from_secs(60),
        delete_interval: Duration::from_millis(50),
        age_off: Duration::from_secs(3600),
        completed_age_off: Duration::from_secs(3600),
        join_interval: Duration::from_millis(50),
        long_running_after: Duration::from_secs(3600),
    };

    Harness {
        store,
        backend,
        content,
        queue,
        joins,
        orchestrator,
        sweep_config,
    }
}

fn passthrough_plan() -> FlowPlan {
    FlowPlan::new(
        "passthrough",
        vec![
            FlowAction::new("Transform", "transform"),
            FlowAction::new("Egress", "egress"),
        ],
    )
}

#[tokio::test]
async fn unit_flows_ingress_to_complete() -> Result<()> {
    let h = harness(vec![passthrough_plan()]);

    let did = h
        .orchestrator
        .ingress_bytes(
            SourceInfo::new("input.bin", "passthrough"),
            Bytes::from_static(b"hello"),
        )
        .await?;

    // The transform worker picks up the first action.
    let (envelope, input) = h
        .orchestrator
        .take_work(&["transform"], TAKE)
        .await?
        .expect("transform work should be queued");
    assert_eq!(envelope.action, "Transform");
    let bytes = h.content.load(&input.content.expect("input content")).await?;
    assert_eq!(&bytes[..], b"hello");

    let transformed = h.content.save(did, Bytes::from_static(b"HELLO")).await?;
    h.orchestrator
        .handle_result(
            &envelope,
            ActionResult::Transform {
                content: transformed,
                metadata: HashMap::from([("step".to_string(), "upper".to_string())]),
            },
        )
        .await?;

    let snapshot = h.store.get(did).await?.unwrap();
    assert_eq!(
        snapshot.action("Transform").unwrap().state,
        ActionState::Complete
    );
    assert_eq!(snapshot.action("Egress").unwrap().state, ActionState::Queued);
    assert_eq!(snapshot.protocol_stack.len(), 2);
    assert_eq!(
        snapshot.last_content().unwrap().metadata.get("step"),
        Some(&"upper".to_string())
    );

    // The egress worker finishes the flow.
    let (envelope, input) = h
        .orchestrator
        .take_work(&["egress"], TAKE)
        .await?
        .expect("egress work should be queued");
    assert_eq!(envelope.action, "Egress");
    let bytes = h.content.load(&input.content.expect("input content")).await?;
    assert_eq!(&bytes[..], b"HELLO");

    h.orchestrator
        .handle_result(&envelope, ActionResult::Egress)
        .await?;

    let snapshot = h.store.get(did).await?.unwrap();
    assert_eq!(snapshot.stage, Stage::Complete);
    assert!(snapshot.terminal());

    // No further work anywhere.
    assert!(h
        .orchestrator
        .take_work(&["transform", "egress"], TAKE)
        .await?
        .is_none());

    Ok(())
}

#[tokio::test]
async fn error_results_are_recorded_and_operator_retryable() -> Result<()> {
    let h = harness(vec![passthrough_plan()]);

    let did = h
        .orchestrator
        .ingress(
            SourceInfo::new("input.bin", "passthrough"),
            Content::default(),
        )
        .await?;

    let (envelope, _input) = h
        .orchestrator
        .take_work(&["transform"], TAKE)
        .await?
        .expect("transform work should be queued");

    h.orchestrator
        .handle_result(
            &envelope,
            ActionResult::Error {
                cause: "parse failure".into(),
                context: "line 7".into(),
            },
        )
        .await?;

    let snapshot = h.store.get(did).await?.unwrap();
    let action = snapshot.action("Transform").unwrap();
    assert_eq!(action.state, ActionState::Error);
    assert_eq!(action.error_cause.as_deref(), Some("parse failure"));
    assert_eq!(action.error_context.as_deref(), Some("line 7"));

    // The flow did not advance.
    assert!(h.orchestrator.take_work(&["egress"], TAKE).await?.is_none());

    // Operator retry re-queues and re-enqueues.
    let requeued = h.orchestrator.retry(did).await?;
    assert_eq!(requeued, vec!["Transform".to_string()]);

    let (envelope, _input) = h
        .orchestrator
        .take_work(&["transform"], TAKE)
        .await?
        .expect("retried work should be queued");
    assert_eq!(envelope.action, "Transform");

    let snapshot = h.store.get(did).await?.unwrap();
    assert!(snapshot.action("Transform").unwrap().error_cause.is_none());

    Ok(())
}

#[tokio::test]
async fn filter_result_short_circuits_the_flow() -> Result<()> {
    let h = harness(vec![passthrough_plan()]);

    let did = h
        .orchestrator
        .ingress(
            SourceInfo::new("input.bin", "passthrough"),
            Content::default(),
        )
        .await?;

    let (envelope, _input) = h
        .orchestrator
        .take_work(&["transform"], TAKE)
        .await?
        .expect("transform work should be queued");

    h.orchestrator
        .handle_result(
            &envelope,
            ActionResult::Filter {
                message: "not subscribed".into(),
            },
        )
        .await?;

    let snapshot = h.store.get(did).await?.unwrap();
    assert_eq!(snapshot.stage, Stage::Complete);
    let action = snapshot.action("Transform").unwrap();
    assert!(action.filtered);
    assert_eq!(action.filter_message.as_deref(), Some("not subscribed"));

    // Egress never queues.
    assert!(h.orchestrator.take_work(&["egress"], TAKE).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn requeue_sweep_recovers_lost_work() -> Result<()> {
    let h = harness(vec![passthrough_plan()]);

    let did = h
        .orchestrator
        .ingress(
            SourceInfo::new("input.bin", "passthrough"),
            Content::default(),
        )
        .await?;

    // A worker drains the queue and then crashes without ever starting.
    h.queue.take(&["transform"], TAKE).await?.expect("envelope");

    // Backdate the queued action past the requeue threshold, with stale
    // error fields from an earlier attempt.
    let mut snapshot = h.store.get(did).await?.unwrap();
    snapshot.actions[0].modified = Utc::now() - chrono::Duration::seconds(120);
    snapshot.actions[0].error_cause = Some("stale".into());
    assert!(h.store.save(&mut snapshot).await?.is_success());

    let sweep = RequeueSweep::new(
        h.store.clone(),
        h.queue.clone(),
        h.orchestrator.clone(),
        h.sweep_config,
    );
    let summary = sweep.run_once(Utc::now()).await?;
    assert_eq!(summary.reclaimed, 1);
    assert_eq!(summary.enqueued, 1);
    assert!(summary.errors.is_empty());

    // The reclaimed action is clean and dispatchable again.
    let snapshot = h.store.get(did).await?.unwrap();
    let action = snapshot.action("Transform").unwrap();
    assert_eq!(action.state, ActionState::Queued);
    assert!(action.error_cause.is_none());

    let (envelope, _input) = h
        .orchestrator
        .take_work(&["transform"], TAKE)
        .await?
        .expect("reclaimed work should be queued");
    assert_eq!(envelope.did, did);

    // A fresh action is not reclaimed twice.
    let summary = sweep.run_once(Utc::now()).await?;
    assert_eq!(summary.reclaimed, 0);

    Ok(())
}

fn fanin_plan(max_entries: usize, min_entries: usize) -> FlowPlan {
    FlowPlan::new(
        "fanin",
        vec![
            FlowAction::new("Transform", "transform"),
            FlowAction::new("Join", "join").with_join(JoinSpec {
                max_entries,
                min_entries,
                max_age: Duration::from_secs(300),
            }),
        ],
    )
}

fn member_source(index: u32) -> SourceInfo {
    let mut source = SourceInfo::new(format!("part-{index}.bin"), "fanin");
    source
        .metadata
        .insert(JOIN_INDEX_KEY.to_string(), index.to_string());
    source
        .metadata
        .insert(JOIN_GROUP_KEY.to_string(), "batch-1".to_string());
    source
}

#[tokio::test]
async fn join_group_releases_one_aggregated_continuation() -> Result<()> {
    let h = harness(vec![fanin_plan(3, 2)]);

    // Ingest members out of index order.
    let mut dids = HashMap::new();
    for index in [2u32, 0, 1] {
        let did = h
            .orchestrator
            .ingress(member_source(index), Content::default())
            .await?;
        dids.insert(index, did);
    }

    // Each member's transform completes, contributing it to the barrier.
    for _ in 0..3 {
        let (envelope, _input) = h
            .orchestrator
            .take_work(&["transform"], TAKE)
            .await?
            .expect("transform work should be queued");
        h.orchestrator
            .handle_result(&envelope, ActionResult::Egress)
            .await?;
    }

    // Exactly one aggregated envelope, ordered by contribution index.
    let (envelope, _input) = h
        .orchestrator
        .take_work(&["join"], TAKE)
        .await?
        .expect("aggregated join work should be queued");
    assert_eq!(envelope.action, "Join");
    assert_eq!(envelope.did, dids[&0]);
    assert_eq!(
        envelope.joined_dids,
        vec![dids[&0], dids[&1], dids[&2]]
    );
    assert!(h.orchestrator.take_work(&["join"], TAKE).await?.is_none());

    // The barrier is gone.
    assert_eq!(h.joins.count()?, 0);

    // The join action's result completes every member.
    h.orchestrator
        .handle_result(&envelope, ActionResult::Egress)
        .await?;
    for did in dids.values() {
        let snapshot = h.store.get(*did).await?.unwrap();
        assert_eq!(snapshot.stage, Stage::Complete);
        assert_eq!(snapshot.action("Join").unwrap().state, ActionState::Complete);
    }

    Ok(())
}

#[tokio::test]
async fn join_sweep_fails_groups_forced_below_minimum() -> Result<()> {
    let h = harness(vec![fanin_plan(3, 2)]);

    let did = h
        .orchestrator
        .ingress(member_source(0), Content::default())
        .await?;

    let (envelope, _input) = h
        .orchestrator
        .take_work(&["transform"], TAKE)
        .await?
        .expect("transform work should be queued");
    h.orchestrator
        .handle_result(&envelope, ActionResult::Egress)
        .await?;

    // One of three contributed; force the barrier well past its deadline.
    let sweep = JoinSweep::new(
        JoinCoordinator::new(
            h.joins.clone(),
            JoinConfig {
                retry_delay: Duration::from_millis(1),
                acquire_timeout: Duration::from_secs(1),
                lock_staleness: Duration::from_secs(300),
            },
        ),
        h.orchestrator.clone(),
        h.sweep_config,
    );
    let summary = sweep
        .run_once(Utc::now() + chrono::Duration::minutes(10))
        .await?;
    assert_eq!(summary.forced, 1);
    assert!(summary.errors.is_empty());

    // Below the minimum, the member's join action errors instead of
    // emitting an undersized aggregate.
    let snapshot = h.store.get(did).await?.unwrap();
    let action = snapshot.action("Join").unwrap();
    assert_eq!(action.state, ActionState::Error);
    assert!(action.error_cause.as_deref().unwrap().contains("timed out"));
    assert!(h.orchestrator.take_work(&["join"], TAKE).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn join_sweep_aggregates_groups_forced_above_minimum() -> Result<()> {
    let h = harness(vec![fanin_plan(3, 1)]);

    let did = h
        .orchestrator
        .ingress(member_source(0), Content::default())
        .await?;

    let (envelope, _input) = h
        .orchestrator
        .take_work(&["transform"], TAKE)
        .await?
        .expect("transform work should be queued");
    h.orchestrator
        .handle_result(&envelope, ActionResult::Egress)
        .await?;

    let sweep = JoinSweep::new(
        JoinCoordinator::new(h.joins.clone(), JoinConfig::default()),
        h.orchestrator.clone(),
        h.sweep_config,
    );
    let summary = sweep
        .run_once(Utc::now() + chrono::Duration::minutes(10))
        .await?;
    assert_eq!(summary.forced, 1);

    // The undersized-but-above-minimum group still aggregates.
    let (envelope, _input) = h
        .orchestrator
        .take_work(&["join"], TAKE)
        .await?
        .expect("forced join work should be queued");
    assert_eq!(envelope.joined_dids, vec![did]);

    Ok(())
}

#[tokio::test]
async fn reinject_fans_out_children() -> Result<()> {
    let h = harness(vec![
        FlowPlan::new("csv", vec![FlowAction::new("Split", "split")]),
        fanin_plan(2, 2),
    ]);

    let parent = h
        .orchestrator
        .ingress(SourceInfo::new("input.csv", "csv"), Content::default())
        .await?;

    let (envelope, _input) = h
        .orchestrator
        .take_work(&["split"], TAKE)
        .await?
        .expect("split work should be queued");

    h.orchestrator
        .handle_result(
            &envelope,
            ActionResult::Reinject {
                children: vec![
                    ReinjectChild {
                        filename: "part-0.csv".into(),
                        flow: "fanin".into(),
                        content: Content::default(),
                    },
                    ReinjectChild {
                        filename: "part-1.csv".into(),
                        flow: "fanin".into(),
                        content: Content::default(),
                    },
                ],
            },
        )
        .await?;

    // The parent is done; the children entered the fan-in flow.
    let snapshot = h.store.get(parent).await?.unwrap();
    assert_eq!(snapshot.stage, Stage::Complete);

    for _ in 0..2 {
        let (envelope, input) = h
            .orchestrator
            .take_work(&["transform"], TAKE)
            .await?
            .expect("child transform should be queued");
        assert_eq!(envelope.flow, "fanin");
        assert!(input.metadata.contains_key(JOIN_INDEX_KEY));
        h.orchestrator
            .handle_result(&envelope, ActionResult::Egress)
            .await?;
    }

    // Both children joined; the aggregate is ready.
    let (envelope, _input) = h
        .orchestrator
        .take_work(&["join"], TAKE)
        .await?
        .expect("aggregated join work should be queued");
    assert_eq!(envelope.joined_dids.len(), 2);

    Ok(())
}

#[tokio::test]
async fn delete_policy_marks_every_unit_created_before_cutoff() -> Result<()> {
    let h = harness(vec![passthrough_plan()]);

    let old_a = h
        .orchestrator
        .ingress(SourceInfo::new("a.bin", "passthrough"), Content::default())
        .await?;
    let old_b = h
        .orchestrator
        .ingress(SourceInfo::new("b.bin", "passthrough"), Content::default())
        .await?;
    let recent = h
        .orchestrator
        .ingress(SourceInfo::new("c.bin", "passthrough"), Content::default())
        .await?;

    let cutoff = Utc::now() - chrono::Duration::hours(1);
    for did in [old_a, old_b] {
        let mut snapshot = h.store.get(did).await?.unwrap();
        snapshot.created = cutoff - chrono::Duration::hours(1);
        assert!(h.store.save(&mut snapshot).await?.is_success());
    }

    let marked = h
        .orchestrator
        .mark_for_delete_matching(Some(cutoff), None, None, "retention-p1")
        .await?;
    assert_eq!(marked.len(), 2);
    assert!(marked.contains(&old_a) && marked.contains(&old_b));

    for did in [old_a, old_b] {
        let snapshot = h.store.get(did).await?.unwrap();
        assert_eq!(snapshot.stage, Stage::Delete);
        let transform = snapshot.action("Transform").unwrap();
        assert_eq!(transform.state, ActionState::Error);
        assert!(transform
            .error_cause
            .as_deref()
            .unwrap()
            .contains("retention-p1"));
        assert_eq!(
            snapshot.action("DeleteContent").unwrap().state,
            ActionState::Queued
        );
    }

    // The recent unit is untouched, and a second pass finds nothing new.
    assert_eq!(h.store.get(recent).await?.unwrap().stage, Stage::Ingress);
    let again = h
        .orchestrator
        .mark_for_delete_matching(Some(cutoff), None, None, "retention-p1")
        .await?;
    assert!(again.is_empty());

    Ok(())
}

#[tokio::test]
async fn delete_sweep_marks_ages_off_and_purges() -> Result<()> {
    let h = harness(vec![passthrough_plan()]);

    let did = h
        .orchestrator
        .ingress_bytes(
            SourceInfo::new("input.bin", "passthrough"),
            Bytes::from_static(b"payload"),
        )
        .await?;

    // Backdate creation past the age-off window.
    let mut snapshot = h.store.get(did).await?.unwrap();
    snapshot.created = Utc::now() - chrono::Duration::hours(2);
    assert!(h.store.save(&mut snapshot).await?.is_success());

    let sweep = DeleteSweep::new(
        h.store.clone(),
        h.content.clone(),
        h.orchestrator.clone(),
        h.sweep_config,
    );

    let summary = sweep.run_once(Utc::now()).await?;
    assert_eq!(summary.marked, 1);
    assert_eq!(summary.purged, 0);

    let snapshot = h.store.get(did).await?.unwrap();
    assert_eq!(snapshot.stage, Stage::Delete);
    let transform = snapshot.action("Transform").unwrap();
    assert_eq!(transform.state, ActionState::Error);
    assert!(transform.error_cause.as_deref().unwrap().contains("ageOff"));
    assert_eq!(
        snapshot.action("DeleteContent").unwrap().state,
        ActionState::Queued
    );

    // The delete worker runs the delete action.
    let (envelope, _input) = h
        .orchestrator
        .take_work(&["delete"], TAKE)
        .await?
        .expect("delete work should be queued");
    assert_eq!(envelope.action, "DeleteContent");
    h.orchestrator
        .handle_result(&envelope, ActionResult::Egress)
        .await?;

    let snapshot = h.store.get(did).await?.unwrap();
    assert_eq!(snapshot.stage, Stage::Delete);
    assert!(snapshot.terminal());

    // The next pass purges content and record.
    let summary = sweep.run_once(Utc::now()).await?;
    assert_eq!(summary.purged, 1);
    assert!(summary.objects_deleted >= 1);
    assert!(h.store.get(did).await?.is_none());
    assert_eq!(h.backend.object_count()?, 0);

    Ok(())
}

#[tokio::test]
async fn sweep_loops_stop_on_shutdown() -> Result<()> {
    let h = harness(vec![passthrough_plan()]);

    let sweep = Arc::new(RequeueSweep::new(
        h.store.clone(),
        h.queue.clone(),
        h.orchestrator.clone(),
        h.sweep_config,
    ));

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = {
        let sweep = sweep.clone();
        tokio::spawn(async move { sweep.run(rx).await })
    };

    // Let it complete at least one pass, then signal shutdown.
    tokio::time::sleep(Duration::from_millis(120)).await;
    tx.send(true).expect("sweep loop should be listening");

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("sweep loop should stop after shutdown")
        .expect("sweep task should not panic");

    Ok(())
}
