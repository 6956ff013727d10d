//! Contract tests for the event store: append-only ordering, run-scoped
//! node identity, acyclicity, lifecycle gating and the display filter.

use agentflow_core::dag::{DagNode, NodeStatus, NodeType};
use agentflow_core::error::FlowError;
use agentflow_core::event::{EventBody, EventSubtype, EventType, ExecutionEvent, FileArtifact};
use agentflow_core::lifecycle::RunStatus;
use agentflow_core::model::{RunMode, SessionRecord, WorkflowRun};
use agentflow_store::{EventFilter, EventStore, Page};

async fn store_with_run() -> (EventStore, WorkflowRun) {
    let store = EventStore::in_memory().await.unwrap();
    let session = SessionRecord::new("contract-tests");
    store.create_session(&session).await.unwrap();
    let run = WorkflowRun::new(&session.id, "task", RunMode::OneShot);
    store.create_run(&run).await.unwrap();
    (store, run)
}

fn event(run: &WorkflowRun, body: EventBody) -> ExecutionEvent {
    ExecutionEvent::new(&run.id, &run.session_id, body)
}

#[tokio::test]
async fn append_assigns_contiguous_total_order() {
    let (store, run) = store_with_run().await;

    let mut orders = Vec::new();
    for _ in 0..5 {
        let mut e = event(&run, EventBody::Heartbeat);
        orders.push(store.append_event(&mut e).await.unwrap());
    }
    assert_eq!(orders, vec![1, 2, 3, 4, 5]);

    let events = store
        .events_for_run(&run.id, &EventFilter::raw())
        .await
        .unwrap();
    let read_orders: Vec<i64> = events.iter().map(|e| e.execution_order).collect();
    assert_eq!(read_orders, orders);
}

#[tokio::test]
async fn append_is_immutable_and_retrievable_forever() {
    let (store, run) = store_with_run().await;

    let mut e = event(
        &run,
        EventBody::AgentCall {
            agent: "coder".into(),
            content: "hello".into(),
        },
    )
    .with_subtype(EventSubtype::Complete)
    .with_agent("coder");
    store.append_event(&mut e).await.unwrap();

    // Later appends do not disturb it.
    for _ in 0..3 {
        let mut hb = event(&run, EventBody::Heartbeat);
        store.append_event(&mut hb).await.unwrap();
    }

    let fetched = store.event_by_id(&e.id).await.unwrap();
    assert_eq!(fetched.execution_order, 1);
    assert_eq!(fetched.agent_name.as_deref(), Some("coder"));
    match fetched.body {
        EventBody::AgentCall { ref content, .. } => assert_eq!(content, "hello"),
        ref other => panic!("wrong body: {other:?}"),
    }
}

#[tokio::test]
async fn stale_supplied_order_is_a_conflict() {
    let (store, run) = store_with_run().await;

    let mut first = event(&run, EventBody::Heartbeat);
    store.append_event(&mut first).await.unwrap();

    let mut stale = event(&run, EventBody::Heartbeat);
    stale.execution_order = 1; // already taken
    let err = store.append_event(&mut stale).await.unwrap_err();
    assert!(matches!(err, FlowError::Conflict { .. }));
}

#[tokio::test]
async fn concurrent_appends_never_collide() {
    let (store, run) = store_with_run().await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let run = run.clone();
        handles.push(tokio::spawn(async move {
            let mut orders = Vec::new();
            for _ in 0..10 {
                let mut e =
                    ExecutionEvent::new(&run.id, &run.session_id, EventBody::Heartbeat);
                orders.push(store.append_event(&mut e).await.unwrap());
            }
            orders
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort_unstable();
    let expected: Vec<i64> = (1..=40).collect();
    assert_eq!(all, expected);
}

#[tokio::test]
async fn independent_runs_have_independent_orders() {
    let (store, run_a) = store_with_run().await;
    let session = SessionRecord::new("other");
    store.create_session(&session).await.unwrap();
    let run_b = WorkflowRun::new(&session.id, "task", RunMode::OneShot);
    store.create_run(&run_b).await.unwrap();

    let mut a = event(&run_a, EventBody::Heartbeat);
    let mut b = event(&run_b, EventBody::Heartbeat);
    assert_eq!(store.append_event(&mut a).await.unwrap(), 1);
    assert_eq!(store.append_event(&mut b).await.unwrap(), 1);
}

#[tokio::test]
async fn default_view_hides_starts_and_node_lifecycle() {
    let (store, run) = store_with_run().await;

    let bodies = [
        (
            EventBody::WorkflowStarted {
                task: "task".into(),
                mode: RunMode::OneShot,
            },
            None,
        ),
        (
            EventBody::NodeStarted {
                label: "step_1".into(),
                attempt: 0,
            },
            None,
        ),
        (
            EventBody::AgentCall {
                agent: "coder".into(),
                content: String::new(),
            },
            Some(EventSubtype::Start),
        ),
        (
            EventBody::AgentCall {
                agent: "coder".into(),
                content: "done".into(),
            },
            Some(EventSubtype::Complete),
        ),
        (
            EventBody::NodeCompleted {
                label: "step_1".into(),
                status: NodeStatus::Completed,
                error: None,
            },
            None,
        ),
    ];
    for (body, subtype) in bodies {
        let mut e = event(&run, body);
        e.subtype = subtype;
        store.append_event(&mut e).await.unwrap();
    }

    let visible = store
        .events_for_run(&run.id, &EventFilter::default())
        .await
        .unwrap();
    let tags: Vec<EventType> = visible.iter().map(|e| e.event_type()).collect();
    assert_eq!(tags, vec![EventType::WorkflowStarted, EventType::AgentCall]);

    let raw = store
        .events_for_run(&run.id, &EventFilter::raw())
        .await
        .unwrap();
    assert_eq!(raw.len(), 5);
}

#[tokio::test]
async fn node_queries_require_run_scope() {
    let (store, run) = store_with_run().await;

    let err = store
        .events_for_node("step_1", "", &EventFilter::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Fatal(_)));

    // Scoped query works and only sees its own run.
    let node = DagNode::new("step_1", &run.id, "step_1", NodeType::Agent);
    store.upsert_node(&node).await.unwrap();
    let mut e = event(
        &run,
        EventBody::AgentCall {
            agent: "coder".into(),
            content: "hi".into(),
        },
    )
    .with_node("step_1")
    .with_subtype(EventSubtype::Complete);
    store.append_event(&mut e).await.unwrap();

    let events = store
        .events_for_node("step_1", &run.id, &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn persisted_edges_stay_acyclic() {
    let (store, run) = store_with_run().await;
    for id in ["a", "b", "c"] {
        store
            .upsert_node(&DagNode::new(id, &run.id, id, NodeType::Agent))
            .await
            .unwrap();
    }
    store.upsert_edge(&run.id, "a", "b").await.unwrap();
    store.upsert_edge(&run.id, "b", "c").await.unwrap();
    // Idempotent re-add.
    store.upsert_edge(&run.id, "a", "b").await.unwrap();

    let err = store.upsert_edge(&run.id, "c", "a").await.unwrap_err();
    assert!(matches!(err, FlowError::InvalidTopology { .. }));

    let dag = store.load_dag(&run.id).await.unwrap();
    assert_eq!(dag.edges().len(), 2);
    assert_eq!(dag.ready_set(), vec!["a"]);
}

#[tokio::test]
async fn run_state_machine_is_gated() {
    let (store, run) = store_with_run().await;

    // Draft cannot jump straight to executing.
    let err = store
        .update_run_state(&run.id, RunStatus::Draft, RunStatus::Executing)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::IllegalTransition { .. }));

    store
        .update_run_state(&run.id, RunStatus::Draft, RunStatus::Planning)
        .await
        .unwrap();
    store
        .update_run_state(&run.id, RunStatus::Planning, RunStatus::Executing)
        .await
        .unwrap();

    // Stale actor: still believes the run is draft.
    let err = store
        .update_run_state(&run.id, RunStatus::Draft, RunStatus::Planning)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::IllegalTransition { .. }));

    store
        .update_run_state(&run.id, RunStatus::Executing, RunStatus::Completed)
        .await
        .unwrap();
    let run = store.get_run(&run.id).await.unwrap();
    assert!(run.is_terminal());
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn file_view_projects_file_gen_events() {
    let (store, run) = store_with_run().await;

    let artifact = FileArtifact {
        path: "out.txt".into(),
        file_type: "text".into(),
        size_bytes: 5,
        content: Some("hello".into()),
        truncated: false,
    };
    let mut e = event(&run, EventBody::FileGen(artifact))
        .with_node("step_1")
        .with_agent("coder");
    store.append_event(&mut e).await.unwrap();
    let mut other = event(&run, EventBody::Heartbeat);
    store.append_event(&mut other).await.unwrap();

    let files = store.files_for_run(&run.id).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].artifact.path, "out.txt");
    assert_eq!(files[0].artifact.content.as_deref(), Some("hello"));
    assert_eq!(files[0].agent_name.as_deref(), Some("coder"));
}

#[tokio::test]
async fn session_cascade_deletes_owned_runs() {
    let (store, run) = store_with_run().await;
    let mut e = event(&run, EventBody::Heartbeat);
    store.append_event(&mut e).await.unwrap();

    assert!(store.delete_session(&run.session_id).await.unwrap());
    assert!(matches!(
        store.get_run(&run.id).await.unwrap_err(),
        FlowError::NotFound { .. }
    ));
    // Idempotent second delete.
    assert!(!store.delete_session(&run.session_id).await.unwrap());
}

#[tokio::test]
async fn list_runs_requires_session_and_paginates() {
    let (store, run) = store_with_run().await;
    for _ in 0..3 {
        let extra = WorkflowRun::new(&run.session_id, "more", RunMode::OneShot);
        store.create_run(&extra).await.unwrap();
    }

    assert!(store
        .list_runs("", None, &Page::default())
        .await
        .is_err());

    let all = store
        .list_runs(&run.session_id, None, &Page::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 4);

    let page = store
        .list_runs(&run.session_id, None, &Page { limit: 2, offset: 2 })
        .await
        .unwrap();
    assert_eq!(page.len(), 2);

    let session = store.get_session(&run.session_id).await.unwrap();
    assert_eq!(session.run_count, 4);
}
