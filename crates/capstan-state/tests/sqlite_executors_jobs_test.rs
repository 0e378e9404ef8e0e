#![cfg(feature = "sqlite")]

use chrono::{Datelike, Duration, NaiveTime, Timelike, Utc, Weekday};
use capstan_core::error::EngineError;
use capstan_core::listener::{ChangeListener, ExecutorSignal, JobsNotification};
use capstan_core::models::{
    ExecutorId, ExecutorRegistration, ExecutorStatus, JobRequest, JobType, ScheduleEntry,
    TaskRequest, WorkflowId, WorkflowRequest, WorkflowRunStatus, WorkflowTaskRequest,
};
use capstan_core::store::{ExecutorStore, JobStore, RunStore, TaskQueueStore, WorkflowStore};
use capstan_state::SqliteStore;

async fn test_store() -> SqliteStore {
    let store = SqliteStore::connect(":memory:")
        .await
        .expect("connect in-memory store");
    store.run_migrations().await.expect("run migrations");
    store
}

async fn seed_workflow(store: &SqliteStore, name: &str) -> WorkflowId {
    let service = store
        .create_task_service(&format!("{name} service"), "http://tasks.local")
        .await
        .expect("create task service");
    let task = store
        .create_task(&TaskRequest {
            name: format!("{name} step"),
            description: "single step".into(),
            task_service_id: service.service_id,
            url: "steps/1".into(),
        })
        .await
        .expect("create task");
    store
        .create_workflow(&WorkflowRequest {
            name: name.to_owned(),
            tasks: vec![WorkflowTaskRequest {
                task_id: task.task_id,
                parameters: None,
            }],
        })
        .await
        .expect("create workflow")
        .workflow_id
}

async fn register(store: &SqliteStore) -> ExecutorId {
    store
        .register_executor(&ExecutorRegistration::local("capstan-tests"))
        .await
        .expect("register executor")
}

/// Drive a job's current run to Complete on the given executor.
async fn finish_current_run(store: &SqliteStore, executor_id: ExecutorId) {
    let leased = store
        .next_workflow_run(executor_id)
        .await
        .unwrap()
        .expect("run should be scheduled");
    assert!(leased.is_valid);
    let task = store
        .acquire_next_task(leased.workflow_run_id)
        .await
        .unwrap()
        .expect("task should be available");
    store
        .complete_task_run(leased.workflow_run_id, task.task_order, false, None)
        .await
        .unwrap();
    store
        .complete_workflow_run(leased.workflow_run_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn executor_registration_and_signals() {
    let store = test_store().await;
    let executor_id = register(&store).await;

    let executor = store.read_executor(executor_id).await.unwrap().unwrap();
    assert_eq!(executor.status, ExecutorStatus::Active);
    assert!(executor.session_active);
    assert!(executor.exec_end.is_none());
    assert_eq!(executor.workflow_run_count, 0);
    assert!(executor.pid > 0);

    let mut signals = store
        .status_listener(executor_id)
        .await
        .expect("status listener");
    store
        .shutdown_executor(executor_id)
        .await
        .expect("shutdown executor");
    assert_eq!(signals.recv().await.unwrap(), ExecutorSignal::Shutdown);
    assert_eq!(
        store.executor_status(executor_id).await.unwrap(),
        Some(ExecutorStatus::Shutdown)
    );

    // A forced cancel is its own signal.
    let second = register(&store).await;
    let mut signals = store.status_listener(second).await.unwrap();
    store.cancel_executor(second).await.expect("cancel executor");
    assert_eq!(signals.recv().await.unwrap(), ExecutorSignal::Cancel);
    assert_eq!(
        store.executor_status(second).await.unwrap(),
        Some(ExecutorStatus::Canceled)
    );

    store
        .post_executor_error(second, "lost database connection")
        .await;
    let errored = store.read_executor(second).await.unwrap().unwrap();
    assert_eq!(
        errored.error_message.as_deref(),
        Some("lost database connection")
    );
}

#[tokio::test]
async fn next_executor_prefers_the_least_loaded_live_session() {
    let store = test_store().await;
    assert!(store.next_executor().await.unwrap().is_none());

    let first = register(&store).await;
    let second = register(&store).await;

    // Tie: the balancing pick is free to choose either; ours is stable.
    assert!(store.next_executor().await.unwrap().is_some());

    let workflow_id = seed_workflow(&store, "balancing").await;
    let run = store.initialize_workflow_run(workflow_id).await.unwrap();
    store
        .schedule_workflow_run_with_executor(run.workflow_run_id, first)
        .await
        .unwrap();

    assert_eq!(store.next_executor().await.unwrap(), Some(second));

    // A dead session is never picked, even while still marked Active.
    sqlx::query("UPDATE executors SET last_heartbeat = ? WHERE executor_id = ?")
        .bind(Utc::now() - Duration::seconds(3600))
        .bind(second)
        .execute(store.pool())
        .await
        .unwrap();
    assert_eq!(store.next_executor().await.unwrap(), Some(first));

    // Heartbeats revive a session.
    store.heartbeat_executor(second).await.unwrap();
    assert_eq!(store.next_executor().await.unwrap(), Some(second));
}

#[tokio::test]
async fn close_executor_releases_scheduled_and_running_work() {
    let store = test_store().await;
    let executor_id = register(&store).await;

    let running_workflow = seed_workflow(&store, "running work").await;
    let running_run = store
        .initialize_workflow_run(running_workflow)
        .await
        .unwrap();
    store
        .schedule_workflow_run(running_run.workflow_run_id)
        .await
        .unwrap();
    let leased = store
        .next_workflow_run(executor_id)
        .await
        .unwrap()
        .unwrap();
    store
        .acquire_next_task(leased.workflow_run_id)
        .await
        .unwrap()
        .unwrap();

    let scheduled_workflow = seed_workflow(&store, "scheduled work").await;
    let scheduled_run = store
        .initialize_workflow_run(scheduled_workflow)
        .await
        .unwrap();
    store
        .schedule_workflow_run_with_executor(scheduled_run.workflow_run_id, executor_id)
        .await
        .unwrap();

    store
        .close_executor(executor_id, true)
        .await
        .expect("close executor");

    let closed = store.read_executor(executor_id).await.unwrap().unwrap();
    assert_eq!(closed.status, ExecutorStatus::Canceled);
    assert!(closed.exec_end.is_some());

    let canceled = store
        .read_workflow_run(leased.workflow_run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(canceled.status, WorkflowRunStatus::Canceled);
    assert_eq!(canceled.executor_id, None);

    // The scheduled run survives, back in the pool without an owner (no
    // other executor is live to claim it).
    let released = store
        .read_workflow_run(scheduled_run.workflow_run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(released.status, WorkflowRunStatus::Scheduled);
    assert_eq!(released.executor_id, None);
}

#[tokio::test]
async fn weekly_job_fires_and_settles_clean() {
    let store = test_store().await;
    let workflow_id = seed_workflow(&store, "weekly report").await;
    let executor_id = register(&store).await;

    let schedule = vec![
        ScheduleEntry {
            day_of_week: 1,
            time_of_day: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        },
        ScheduleEntry {
            day_of_week: 2,
            time_of_day: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        },
    ];
    let job = store
        .create_job(&JobRequest {
            workflow_id,
            maintainer: "reports@example.com".into(),
            job_type: JobType::Scheduled {
                schedule: schedule.clone(),
            },
            next_run: None,
        })
        .await
        .expect("create weekly job");

    assert!(job.next_run > Utc::now());
    assert!(matches!(
        job.next_run.weekday(),
        Weekday::Mon | Weekday::Tue
    ));
    assert_eq!(job.next_run.time().hour(), 0);
    assert_eq!(job.next_run.time().minute(), 0);

    // The job sits in the due-queue until it has a live run.
    let queued = store.read_queued_jobs().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].job_id, job.job_id);

    let fired = store.run_job(job.job_id).await.expect("run job");
    let run_id = fired
        .current_workflow_run_id
        .expect("job should reference its run");
    assert_eq!(fired.workflow_run_status, Some(WorkflowRunStatus::Scheduled));
    assert!(fired.next_run > job.next_run || fired.next_run == job.next_run);
    assert!(store.read_queued_jobs().await.unwrap().is_empty());

    let mut jobs_channel = store.jobs_listener().await.expect("jobs listener");
    finish_current_run(&store, executor_id).await;

    // The terminal run pings the jobs topic with the owning job id.
    let mut settle_seen = false;
    for _ in 0..4 {
        match jobs_channel.recv().await.unwrap() {
            JobsNotification::Settle(job_id) if job_id == job.job_id => {
                settle_seen = true;
                break;
            }
            _ => {}
        }
    }
    assert!(settle_seen, "expected a settle notification for the job");

    let run = store.read_workflow_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowRunStatus::Complete);

    let (settled, reason) = store.complete_job(job.job_id).await.expect("settle job");
    assert!(reason.is_none());
    assert!(settled.current_workflow_run_id.is_none());
    assert!(!settled.is_paused);
    assert_eq!(store.read_queued_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn interval_job_advances_from_its_previous_slot() {
    let store = test_store().await;
    let workflow_id = seed_workflow(&store, "hourly sync").await;
    register(&store).await;

    let job = store
        .create_job(&JobRequest {
            workflow_id,
            maintainer: "sync@example.com".into(),
            job_type: JobType::Interval {
                interval_seconds: 3600,
            },
            next_run: None,
        })
        .await
        .expect("create interval job");
    let first_slot = job.next_run;

    let fired = store.run_job(job.job_id).await.expect("run job");
    assert_eq!(fired.next_run, first_slot + Duration::seconds(3600));
}

#[tokio::test]
async fn failed_run_pauses_its_job_with_a_reason() {
    let store = test_store().await;
    let workflow_id = seed_workflow(&store, "fragile job").await;
    let executor_id = register(&store).await;

    let job = store
        .create_job(&JobRequest {
            workflow_id,
            maintainer: "owner@example.com".into(),
            job_type: JobType::Interval {
                interval_seconds: 600,
            },
            next_run: None,
        })
        .await
        .unwrap();
    store.run_job(job.job_id).await.unwrap();

    let leased = store
        .next_workflow_run(executor_id)
        .await
        .unwrap()
        .expect("job run should be scheduled");
    let task = store
        .acquire_next_task(leased.workflow_run_id)
        .await
        .unwrap()
        .unwrap();

    // Settling is refused while the run is still live.
    assert!(matches!(
        store.complete_job(job.job_id).await,
        Err(EngineError::Precondition(_))
    ));

    store
        .fail_task_run(leased.workflow_run_id, task.task_order, "upstream outage")
        .await
        .unwrap();
    store
        .complete_workflow_run(leased.workflow_run_id)
        .await
        .unwrap();

    let (paused, reason) = store.complete_job(job.job_id).await.expect("settle job");
    assert!(paused.is_paused);
    assert_eq!(paused.current_workflow_run_id, Some(leased.workflow_run_id));
    let reason = reason.expect("a failed run should pause with a reason");
    assert!(reason.contains("Failed"));

    // Paused jobs leave the due-queue and refuse to fire.
    assert!(store.read_queued_jobs().await.unwrap().is_empty());
    assert!(matches!(
        store.run_job(job.job_id).await,
        Err(EngineError::Precondition(_))
    ));
}

#[tokio::test]
async fn job_requests_are_validated() {
    let store = test_store().await;
    let workflow_id = seed_workflow(&store, "validated job").await;

    assert!(matches!(
        store
            .create_job(&JobRequest {
                workflow_id,
                maintainer: "  ".into(),
                job_type: JobType::Interval {
                    interval_seconds: 60
                },
                next_run: None,
            })
            .await,
        Err(EngineError::Precondition(_))
    ));
    assert!(matches!(
        store
            .create_job(&JobRequest {
                workflow_id,
                maintainer: "owner@example.com".into(),
                job_type: JobType::Interval {
                    interval_seconds: 0
                },
                next_run: None,
            })
            .await,
        Err(EngineError::InvalidSchedule(_))
    ));
    assert!(matches!(
        store
            .create_job(&JobRequest {
                workflow_id,
                maintainer: "owner@example.com".into(),
                job_type: JobType::Scheduled { schedule: vec![] },
                next_run: None,
            })
            .await,
        Err(EngineError::InvalidSchedule(_))
    ));
    assert!(matches!(
        store
            .create_job(&JobRequest {
                workflow_id,
                maintainer: "owner@example.com".into(),
                job_type: JobType::Scheduled {
                    schedule: vec![ScheduleEntry {
                        day_of_week: 9,
                        time_of_day: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                    }]
                },
                next_run: None,
            })
            .await,
        Err(EngineError::InvalidSchedule(_))
    ));
    assert!(matches!(
        store
            .create_job(&JobRequest {
                workflow_id,
                maintainer: "owner@example.com".into(),
                job_type: JobType::Interval {
                    interval_seconds: 60
                },
                next_run: Some(Utc::now() - Duration::seconds(30)),
            })
            .await,
        Err(EngineError::Precondition(_))
    ));
    assert!(matches!(
        store.run_job(capstan_core::models::JobId::from(424_242)).await,
        Err(EngineError::NotFound { .. })
    ));
}
