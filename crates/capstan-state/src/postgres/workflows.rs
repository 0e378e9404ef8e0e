use async_trait::async_trait;
use serde_json::Value;

use capstan_core::error::{EngineError, EngineResult};
use capstan_core::models::{
    Task, TaskId, TaskRequest, TaskService, Workflow, WorkflowDeprecationRequest, WorkflowId,
    WorkflowRequest, WorkflowTask,
};
use capstan_core::store::WorkflowStore;

use super::core::PostgresStore;

const TASK_SELECT: &str = r#"
    SELECT t.task_id, t.name, t.description,
           rtrim(ts.base_url, '/') || '/' || ltrim(t.url, '/') AS url,
           ts.name AS task_service_name
    FROM tasks t
    JOIN task_services ts ON ts.service_id = t.task_service_id"#;

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: i64,
    name: String,
    description: String,
    url: String,
    task_service_name: String,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Self {
            task_id: row.task_id.into(),
            name: row.name,
            description: row.description,
            url: row.url,
            task_service_name: row.task_service_name,
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowTaskRow {
    task_order: i32,
    task_id: i64,
    name: String,
    description: String,
    parameters: Option<Value>,
    service_name: String,
    url: String,
}

impl PostgresStore {
    pub(super) async fn read_workflow_tasks(
        &self,
        workflow_id: WorkflowId,
    ) -> EngineResult<Vec<WorkflowTask>> {
        let rows: Vec<WorkflowTaskRow> = sqlx::query_as(
            r#"
            SELECT wt.task_order, wt.task_id, t.name, t.description, wt.parameters,
                   ts.name AS service_name,
                   rtrim(ts.base_url, '/') || '/' || ltrim(t.url, '/') AS url
            FROM workflow_tasks wt
            JOIN tasks t ON t.task_id = wt.task_id
            JOIN task_services ts ON ts.service_id = t.task_service_id
            WHERE wt.workflow_id = $1
            ORDER BY wt.task_order"#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| WorkflowTask {
                task_order: row.task_order,
                task_id: row.task_id.into(),
                name: row.name,
                description: row.description,
                parameters: row.parameters,
                service_name: row.service_name,
                url: row.url,
            })
            .collect())
    }
}

#[async_trait]
impl WorkflowStore for PostgresStore {
    async fn create_task_service(&self, name: &str, base_url: &str) -> EngineResult<TaskService> {
        if name.trim().is_empty() {
            return Err(EngineError::precondition("task service name cannot be blank"));
        }
        let (service_id, name, base_url): (i64, String, String) = sqlx::query_as(
            r#"
            INSERT INTO task_services (name, base_url)
            VALUES ($1, $2)
            RETURNING service_id, name, base_url"#,
        )
        .bind(name)
        .bind(base_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(TaskService {
            service_id: service_id.into(),
            name,
            base_url,
        })
    }

    async fn read_task_services(&self) -> EngineResult<Vec<TaskService>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT service_id, name, base_url FROM task_services ORDER BY service_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(service_id, name, base_url)| TaskService {
                service_id: service_id.into(),
                name,
                base_url,
            })
            .collect())
    }

    async fn create_task(&self, request: &TaskRequest) -> EngineResult<Task> {
        if request.name.trim().is_empty() {
            return Err(EngineError::precondition("task name cannot be blank"));
        }
        let task_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO tasks (name, description, task_service_id, url)
            VALUES ($1, $2, $3, $4)
            RETURNING task_id"#,
        )
        .bind(&request.name)
        .bind(&request.description)
        .bind(request.task_service_id)
        .bind(&request.url)
        .fetch_one(&self.pool)
        .await?;
        self.read_task(task_id.into()).await?.ok_or(EngineError::NotFound {
            entity: "task",
            pk: task_id.to_string(),
        })
    }

    async fn read_task(&self, task_id: TaskId) -> EngineResult<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("{TASK_SELECT}\n    WHERE t.task_id = $1"))
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Task::from))
    }

    async fn read_tasks(&self) -> EngineResult<Vec<Task>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as(&format!("{TASK_SELECT}\n    ORDER BY t.task_id"))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn update_task(
        &self,
        task_id: TaskId,
        request: &TaskRequest,
    ) -> EngineResult<Option<Task>> {
        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET name = $1, description = $2, task_service_id = $3, url = $4
            WHERE task_id = $5"#,
        )
        .bind(&request.name)
        .bind(&request.description)
        .bind(request.task_service_id)
        .bind(&request.url)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.read_task(task_id).await
    }

    async fn create_workflow(&self, request: &WorkflowRequest) -> EngineResult<Workflow> {
        if request.name.trim().is_empty() {
            return Err(EngineError::precondition("workflow name cannot be blank"));
        }
        if request.tasks.is_empty() {
            return Err(EngineError::precondition(
                "a workflow requires at least one task",
            ));
        }
        let mut tx = self.pool.begin().await?;
        let workflow_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO workflows (name, modified_by)
            VALUES ($1, $2)
            RETURNING workflow_id"#,
        )
        .bind(&request.name)
        .bind(self.principal())
        .fetch_one(&mut *tx)
        .await?;
        for (index, task) in request.tasks.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO workflow_tasks (workflow_id, task_order, task_id, parameters)
                VALUES ($1, $2, $3, $4)"#,
            )
            .bind(workflow_id)
            .bind(index as i32 + 1)
            .bind(task.task_id)
            .bind(task.parameters.as_ref())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        self.read_workflow(workflow_id.into())
            .await?
            .ok_or(EngineError::NotFound {
                entity: "workflow",
                pk: workflow_id.to_string(),
            })
    }

    async fn read_workflow(&self, workflow_id: WorkflowId) -> EngineResult<Option<Workflow>> {
        let row: Option<(i64, String, bool, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT workflow_id, name, is_deprecated, new_workflow
            FROM workflows
            WHERE workflow_id = $1"#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some((workflow_id, name, is_deprecated, new_workflow)) = row else {
            return Ok(None);
        };
        let tasks = self.read_workflow_tasks(workflow_id.into()).await?;
        Ok(Some(Workflow {
            workflow_id: workflow_id.into(),
            name,
            is_deprecated,
            new_workflow: new_workflow.map(WorkflowId::from),
            tasks,
        }))
    }

    async fn read_workflows(&self) -> EngineResult<Vec<Workflow>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT workflow_id FROM workflows ORDER BY workflow_id")
                .fetch_all(&self.pool)
                .await?;
        let mut workflows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(workflow) = self.read_workflow(id.into()).await? {
                workflows.push(workflow);
            }
        }
        Ok(workflows)
    }

    async fn deprecate_workflow(
        &self,
        request: &WorkflowDeprecationRequest,
    ) -> EngineResult<WorkflowId> {
        if let Some(new_workflow_id) = request.new_workflow_id {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT workflow_id FROM workflows WHERE workflow_id = $1")
                    .bind(new_workflow_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Err(EngineError::NotFound {
                    entity: "workflow",
                    pk: new_workflow_id.to_string(),
                });
            }
        }
        let updated = sqlx::query(
            r#"
            UPDATE workflows
            SET is_deprecated = true, new_workflow = $1,
                modified_by = coalesce($2, modified_by)
            WHERE workflow_id = $3"#,
        )
        .bind(request.new_workflow_id)
        .bind(self.principal())
        .bind(request.workflow_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::NotFound {
                entity: "workflow",
                pk: request.workflow_id.to_string(),
            });
        }
        Ok(request.workflow_id)
    }
}
