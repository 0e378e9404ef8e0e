#![cfg(feature = "sqlite")]

//! End-to-end: a workflow run worker driving real HTTP task services
//! against the SQLite store.

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;

use capstan_core::driver::HttpTaskDriver;
use capstan_core::models::{
    ExecutorId, ExecutorRegistration, TaskRequest, TaskStatus, WorkflowRequest, WorkflowRunId,
    WorkflowRunStatus, WorkflowTaskRequest,
};
use capstan_core::run_worker::WorkflowRunWorker;
use capstan_core::store::{ExecutorStore, RunStore, WorkflowStore};
use capstan_state::SqliteStore;

async fn spawn_task_service() -> SocketAddr {
    let app = Router::new()
        .route(
            "/steps/extract",
            post(|| async {
                concat!(
                    "{\"type\":\"Progress\",\"percent\":25}\n",
                    "{\"type\":\"Rule\",\"name\":\"row count\",\"failed\":false,\"message\":null}\n",
                    "{\"type\":\"Progress\",\"percent\":90}\n",
                    "{\"type\":\"Done\",\"paused\":false,\"message\":\"extracted 42 rows\"}\n",
                )
            }),
        )
        .route(
            "/steps/load",
            post(|| async { "{\"type\":\"Done\",\"paused\":false,\"message\":null}\n" }),
        )
        .route(
            "/steps/explode",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "service on fire") }),
        );
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind task service");
    let addr = listener.local_addr().expect("task service addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve task service");
    });
    addr
}

async fn test_store() -> SqliteStore {
    let store = SqliteStore::connect(":memory:")
        .await
        .expect("connect in-memory store");
    store.run_migrations().await.expect("run migrations");
    store
}

async fn seed(store: &SqliteStore, addr: SocketAddr, name: &str, urls: &[&str]) -> WorkflowRunId {
    let service = store
        .create_task_service(&format!("{name} service"), &format!("http://{addr}/"))
        .await
        .expect("create service");
    let mut tasks = Vec::new();
    for url in urls {
        let task = store
            .create_task(&TaskRequest {
                name: format!("{name} {url}"),
                description: "remote step".into(),
                task_service_id: service.service_id,
                url: (*url).to_owned(),
            })
            .await
            .expect("create task");
        tasks.push(WorkflowTaskRequest {
            task_id: task.task_id,
            parameters: Some(serde_json::json!({"batch": 7})),
        });
    }
    let workflow = store
        .create_workflow(&WorkflowRequest {
            name: name.to_owned(),
            tasks,
        })
        .await
        .expect("create workflow");
    store
        .initialize_workflow_run(workflow.workflow_id)
        .await
        .expect("initialize run")
        .workflow_run_id
}

async fn lease(store: &SqliteStore, executor_id: ExecutorId, run_id: WorkflowRunId) {
    store.schedule_workflow_run(run_id).await.expect("schedule");
    let leased = store
        .next_workflow_run(executor_id)
        .await
        .expect("lease")
        .expect("run should be available");
    assert_eq!(leased.workflow_run_id, run_id);
}

#[tokio::test]
async fn worker_drives_run_to_completion_over_http() {
    let addr = spawn_task_service().await;
    let store = test_store().await;
    let executor_id = store
        .register_executor(&ExecutorRegistration::local("capstan-tests"))
        .await
        .unwrap();

    let run_id = seed(&store, addr, "http load", &["steps/extract", "steps/load"]).await;
    lease(&store, executor_id, run_id).await;

    WorkflowRunWorker::new(run_id, store.clone(), HttpTaskDriver::new())
        .run()
        .await
        .expect("worker should finish");

    let run = store.read_workflow_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowRunStatus::Complete);
    assert_eq!(run.progress, Some(100));
    assert_eq!(run.executor_id, None);

    let extract = &run.tasks[0];
    assert_eq!(extract.task_status, TaskStatus::Complete);
    assert_eq!(extract.output.as_deref(), Some("extracted 42 rows"));
    assert_eq!(extract.progress, Some(100));
    let rules = extract.rules.as_ref().expect("rule recorded");
    assert_eq!(rules[0].name, "row count");
    assert!(!rules[0].failed);

    assert_eq!(run.tasks[1].task_status, TaskStatus::Complete);
}

#[tokio::test]
async fn worker_records_transport_failures_and_halts() {
    let addr = spawn_task_service().await;
    let store = test_store().await;
    let executor_id = store
        .register_executor(&ExecutorRegistration::local("capstan-tests"))
        .await
        .unwrap();

    let run_id = seed(
        &store,
        addr,
        "http failure",
        &["steps/explode", "steps/load"],
    )
    .await;
    lease(&store, executor_id, run_id).await;

    WorkflowRunWorker::new(run_id, store.clone(), HttpTaskDriver::new())
        .run()
        .await
        .expect("worker settles the run even when a task fails");

    let run = store.read_workflow_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowRunStatus::Failed);

    let exploded = &run.tasks[0];
    assert_eq!(exploded.task_status, TaskStatus::Failed);
    let output = exploded.output.as_deref().expect("failure recorded");
    assert!(output.contains("task service returned status"));

    // The second task was never reached.
    assert_eq!(run.tasks[1].task_status, TaskStatus::Waiting);
}
