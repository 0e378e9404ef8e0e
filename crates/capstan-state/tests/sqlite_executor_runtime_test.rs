#![cfg(feature = "sqlite")]

//! The executor runtime loop against the SQLite store: leases scheduled
//! runs, works them over HTTP and honors store-mediated shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio::time::sleep;

use capstan_core::config::EngineConfig;
use capstan_core::driver::HttpTaskDriver;
use capstan_core::executor::Executor;
use capstan_core::models::{
    ExecutorStatus, TaskRequest, WorkflowRequest, WorkflowRunId, WorkflowRunStatus,
    WorkflowTaskRequest,
};
use capstan_core::store::{ExecutorStore, RunStore, WorkflowStore};
use capstan_state::SqliteStore;

fn fast_config() -> EngineConfig {
    EngineConfig {
        database_url: String::new(),
        application_name: "capstan-runtime-tests".into(),
        poll_interval_secs: 0.05,
        heartbeat_interval_secs: 1,
        reap_interval_secs: 3600,
        max_concurrent_runs: 2,
        db_pool_size: 1,
        acting_principal: None,
    }
}

async fn spawn_task_service() -> SocketAddr {
    let app = Router::new().route(
        "/steps/run",
        post(|| async { "{\"type\":\"Done\",\"paused\":false,\"message\":\"ok\"}\n" }),
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

async fn seed_run(store: &SqliteStore, addr: SocketAddr, name: &str) -> WorkflowRunId {
    let service = store
        .create_task_service(&format!("{name} service"), &format!("http://{addr}"))
        .await
        .expect("create service");
    let task = store
        .create_task(&TaskRequest {
            name: format!("{name} step"),
            description: "remote step".into(),
            task_service_id: service.service_id,
            url: "steps/run".into(),
        })
        .await
        .expect("create task");
    let workflow = store
        .create_workflow(&WorkflowRequest {
            name: name.to_owned(),
            tasks: vec![WorkflowTaskRequest {
                task_id: task.task_id,
                parameters: None,
            }],
        })
        .await
        .expect("create workflow");
    store
        .initialize_workflow_run(workflow.workflow_id)
        .await
        .expect("initialize run")
        .workflow_run_id
}

async fn wait_for_status(
    store: &SqliteStore,
    run_id: WorkflowRunId,
    wanted: WorkflowRunStatus,
) -> bool {
    for _ in 0..200 {
        let run = store
            .read_workflow_run(run_id)
            .await
            .expect("read run")
            .expect("run exists");
        if run.status == wanted {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn executor_runtime_works_scheduled_runs_and_shuts_down() {
    let addr = spawn_task_service().await;
    let store = SqliteStore::connect(":memory:").await.expect("connect");
    store.run_migrations().await.expect("migrations");

    let executor = Executor::register(store.clone(), HttpTaskDriver::new(), fast_config())
        .await
        .expect("register executor runtime");
    let executor_id = executor.id();
    let runtime = tokio::spawn(executor.run());

    let first_run = seed_run(&store, addr, "runtime first").await;
    store
        .schedule_workflow_run(first_run)
        .await
        .expect("schedule first run");
    assert!(
        wait_for_status(&store, first_run, WorkflowRunStatus::Complete).await,
        "first run should complete"
    );

    // A second run is picked up without an explicit nudge.
    let second_run = seed_run(&store, addr, "runtime second").await;
    store
        .schedule_workflow_run(second_run)
        .await
        .expect("schedule second run");
    assert!(
        wait_for_status(&store, second_run, WorkflowRunStatus::Complete).await,
        "second run should complete"
    );

    store
        .shutdown_executor(executor_id)
        .await
        .expect("request shutdown");
    let result = tokio::time::timeout(Duration::from_secs(10), runtime)
        .await
        .expect("runtime should exit after shutdown")
        .expect("runtime task should not panic");
    result.expect("runtime should close cleanly");

    let closed = store
        .read_executor(executor_id)
        .await
        .unwrap()
        .expect("executor record");
    assert_eq!(closed.status, ExecutorStatus::Shutdown);
    assert!(closed.exec_end.is_some());
}

#[tokio::test]
async fn executor_runtime_cancel_is_forced() {
    let store = SqliteStore::connect(":memory:").await.expect("connect");
    store.run_migrations().await.expect("migrations");

    let executor = Executor::register(store.clone(), HttpTaskDriver::new(), fast_config())
        .await
        .expect("register executor runtime");
    let executor_id = executor.id();
    let runtime = tokio::spawn(executor.run());

    // Give the loop a moment to come up, then cancel it outright.
    sleep(Duration::from_millis(100)).await;
    store
        .cancel_executor(executor_id)
        .await
        .expect("request cancel");

    let result = tokio::time::timeout(Duration::from_secs(10), runtime)
        .await
        .expect("runtime should exit after cancel")
        .expect("runtime task should not panic");
    result.expect("runtime should close cleanly");

    let closed = store
        .read_executor(executor_id)
        .await
        .unwrap()
        .expect("executor record");
    assert_eq!(closed.status, ExecutorStatus::Canceled);
    assert!(closed.exec_end.is_some());
}
