#![cfg(feature = "sqlite")]

use capstan_core::error::EngineError;
use capstan_core::listener::ChangeListener;
use capstan_core::models::{
    ExecutorRegistration, TaskId, TaskRequest, TaskStatus, WorkflowRequest, WorkflowRunStatus,
    WorkflowTaskRequest,
};
use capstan_core::store::{ExecutorStore, RunStore, TaskQueueStore, WorkflowStore};
use capstan_state::SqliteStore;

async fn test_store() -> SqliteStore {
    let store = SqliteStore::connect(":memory:")
        .await
        .expect("connect in-memory store");
    store.run_migrations().await.expect("run migrations");
    store
}

#[tokio::test]
async fn task_registry_joins_service_urls() {
    let store = test_store().await;
    let service = store
        .create_task_service("warehouse", "http://warehouse.local/api/")
        .await
        .expect("create service");
    assert_eq!(service.name, "warehouse");

    let services = store.read_task_services().await.unwrap();
    assert_eq!(services.len(), 1);

    let task = store
        .create_task(&TaskRequest {
            name: "vacuum".into(),
            description: "vacuum the fact tables".into(),
            task_service_id: service.service_id,
            url: "/maintenance/vacuum".into(),
        })
        .await
        .expect("create task");
    assert_eq!(task.url, "http://warehouse.local/api/maintenance/vacuum");
    assert_eq!(task.task_service_name, "warehouse");

    let updated = store
        .update_task(
            task.task_id,
            &TaskRequest {
                name: "vacuum full".into(),
                description: "vacuum the fact tables".into(),
                task_service_id: service.service_id,
                url: "maintenance/vacuum-full".into(),
            },
        )
        .await
        .expect("update task")
        .expect("task exists");
    assert_eq!(updated.name, "vacuum full");
    assert_eq!(
        updated.url,
        "http://warehouse.local/api/maintenance/vacuum-full"
    );

    assert!(store
        .update_task(
            TaskId::from(999),
            &TaskRequest {
                name: "ghost".into(),
                description: String::new(),
                task_service_id: service.service_id,
                url: "nowhere".into(),
            }
        )
        .await
        .unwrap()
        .is_none());

    assert_eq!(store.read_tasks().await.unwrap().len(), 1);
    assert!(store.read_task(TaskId::from(999)).await.unwrap().is_none());
}

#[tokio::test]
async fn workflow_templates_keep_dense_order() {
    let store = test_store().await;
    let service = store
        .create_task_service("etl", "http://etl.local")
        .await
        .unwrap();
    let mut tasks = Vec::new();
    for name in ["extract", "transform", "load"] {
        let task = store
            .create_task(&TaskRequest {
                name: name.into(),
                description: format!("{name} step"),
                task_service_id: service.service_id,
                url: format!("steps/{name}"),
            })
            .await
            .unwrap();
        tasks.push(WorkflowTaskRequest {
            task_id: task.task_id,
            parameters: Some(serde_json::json!({"step": name})),
        });
    }

    let workflow = store
        .create_workflow(&WorkflowRequest {
            name: "warehouse refresh".into(),
            tasks,
        })
        .await
        .expect("create workflow");
    let orders: Vec<i32> = workflow.tasks.iter().map(|t| t.task_order).collect();
    assert_eq!(orders, vec![1, 2, 3]);
    assert_eq!(workflow.tasks[0].name, "extract");
    assert_eq!(
        workflow.tasks[2].parameters,
        Some(serde_json::json!({"step": "load"}))
    );

    assert_eq!(store.read_workflows().await.unwrap().len(), 1);

    assert!(matches!(
        store
            .create_workflow(&WorkflowRequest {
                name: "empty".into(),
                tasks: vec![]
            })
            .await,
        Err(EngineError::Precondition(_))
    ));
}

#[tokio::test]
async fn run_views_and_progress_updates() {
    let store = test_store().await;
    let service = store
        .create_task_service("views", "http://views.local")
        .await
        .unwrap();
    let mut tasks = Vec::new();
    for index in 1..=4 {
        let task = store
            .create_task(&TaskRequest {
                name: format!("step {index}"),
                description: String::new(),
                task_service_id: service.service_id,
                url: format!("steps/{index}"),
            })
            .await
            .unwrap();
        tasks.push(WorkflowTaskRequest {
            task_id: task.task_id,
            parameters: None,
        });
    }
    let workflow = store
        .create_workflow(&WorkflowRequest {
            name: "progress math".into(),
            tasks,
        })
        .await
        .unwrap();
    let executor_id = store
        .register_executor(&ExecutorRegistration::local("capstan-tests"))
        .await
        .unwrap();

    let run = store
        .initialize_workflow_run(workflow.workflow_id)
        .await
        .unwrap();
    store.schedule_workflow_run(run.workflow_run_id).await.unwrap();
    let leased = store
        .next_workflow_run(executor_id)
        .await
        .unwrap()
        .unwrap();

    let owned = store.executor_workflow_runs(executor_id).await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].workflow_run_id, leased.workflow_run_id);
    assert!(owned[0].is_valid);

    let mut progress_updates = store.progress_listener().await.unwrap();
    let task = store
        .acquire_next_task(leased.workflow_run_id)
        .await
        .unwrap()
        .unwrap();
    let entry = store
        .read_task_queue_entry(leased.workflow_run_id, task.task_order)
        .await
        .unwrap()
        .expect("entry readable");
    assert_eq!(entry.status, TaskStatus::Running);

    store
        .complete_task_run(leased.workflow_run_id, task.task_order, false, None)
        .await
        .unwrap();
    // 1 of 4 complete rounds to 25.
    let update = progress_updates.recv().await.unwrap();
    assert_eq!(update.0, Some(leased.workflow_run_id));
    let run = store
        .read_workflow_run(leased.workflow_run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.progress, Some(25));
    assert_eq!(run.status, WorkflowRunStatus::Running);

    let all_runs = store.read_workflow_runs().await.unwrap();
    assert_eq!(all_runs.len(), 1);
    assert_eq!(all_runs[0].tasks.len(), 4);

    let executors = store.read_executors().await.unwrap();
    assert_eq!(executors.len(), 1);
    assert_eq!(executors[0].workflow_run_count, 1);
    assert_eq!(store.read_active_executors().await.unwrap().len(), 1);
}
