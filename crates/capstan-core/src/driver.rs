//! Contract between the executor runtime and the remote services that host
//! task bodies. A dispatched task answers with a stream of events — zero or
//! more progress updates and rule results, closed by a single done message
//! carrying the paused flag and optional output text. The wire encoding
//! here is newline-delimited JSON; the rest of the engine only sees
//! [`TaskResponse`] values.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::models::{TaskQueueRecord, TaskRule};

/// One event streamed back from a task service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskResponse {
    Progress { percent: i16 },
    Rule(TaskRule),
    Done {
        paused: bool,
        message: Option<String>,
    },
}

/// Handle on one in-flight task execution. `next_event` yields events until
/// the service closes its stream; a stream that closes before a
/// [`TaskResponse::Done`] is treated as a failed task by the caller.
#[async_trait]
pub trait TaskRunHandle: Send {
    async fn next_event(&mut self) -> EngineResult<Option<TaskResponse>>;
}

/// Dispatches task queue records to the remote services that execute them.
#[async_trait]
pub trait TaskDriver: Clone + Send + Sync + 'static {
    type Handle: TaskRunHandle;

    async fn dispatch(&self, task: &TaskQueueRecord) -> EngineResult<Self::Handle>;
}

/// HTTP driver: POSTs the JSON-encoded record to the task's effective URL
/// and reads the response body as newline-delimited JSON events.
#[derive(Debug, Clone, Default)]
pub struct HttpTaskDriver {
    client: reqwest::Client,
}

impl HttpTaskDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskDriver for HttpTaskDriver {
    type Handle = HttpTaskRunHandle;

    async fn dispatch(&self, task: &TaskQueueRecord) -> EngineResult<Self::Handle> {
        let response = self.client.post(&task.url).json(task).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Generic(format!(
                "task service returned status {status}: {body}"
            )));
        }
        Ok(HttpTaskRunHandle {
            stream: response.bytes_stream().boxed(),
            buffer: Vec::new(),
            exhausted: false,
        })
    }
}

pub struct HttpTaskRunHandle {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Vec<u8>,
    exhausted: bool,
}

impl std::fmt::Debug for HttpTaskRunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTaskRunHandle")
            .field("buffer", &self.buffer)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

#[async_trait]
impl TaskRunHandle for HttpTaskRunHandle {
    async fn next_event(&mut self) -> EngineResult<Option<TaskResponse>> {
        loop {
            if let Some(line) = take_line(&mut self.buffer) {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(serde_json::from_slice(&line)?));
            }
            if self.exhausted {
                return Ok(None);
            }
            match self.stream.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => {
                    self.exhausted = true;
                    let rest = std::mem::take(&mut self.buffer);
                    if !rest.iter().all(u8::is_ascii_whitespace) {
                        return Ok(Some(serde_json::from_slice(&rest)?));
                    }
                    return Ok(None);
                }
            }
        }
    }
}

fn take_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let position = buffer.iter().position(|byte| *byte == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=position).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(line)
}

#[cfg(test)]
mod tests {
    use axum::routing::post;
    use axum::Router;
    use axum::http::StatusCode;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    use super::*;
    use crate::models::TaskStatus;

    async fn spawn_test_server(app: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve test app");
        });
        addr
    }

    fn record(url: String) -> TaskQueueRecord {
        TaskQueueRecord {
            workflow_run_id: 1.into(),
            task_order: 1,
            task_id: 1.into(),
            status: TaskStatus::Running,
            parameters: Some(serde_json::json!({"limit": 10})),
            url,
        }
    }

    #[test]
    fn response_events_round_trip_as_tagged_json() {
        let done: TaskResponse = serde_json::from_str(
            r#"{"type":"Done","paused":false,"message":"all rows moved"}"#,
        )
        .expect("done event should deserialize");
        assert_eq!(
            done,
            TaskResponse::Done {
                paused: false,
                message: Some("all rows moved".to_owned())
            }
        );

        let progress: TaskResponse =
            serde_json::from_str(r#"{"type":"Progress","percent":40}"#).unwrap();
        assert_eq!(progress, TaskResponse::Progress { percent: 40 });

        let rule: TaskResponse = serde_json::from_str(
            r#"{"type":"Rule","name":"limit","failed":true,"message":null}"#,
        )
        .unwrap();
        assert!(matches!(rule, TaskResponse::Rule(r) if r.failed));
    }

    #[tokio::test]
    async fn dispatch_streams_events_until_done() {
        let app = Router::new().route(
            "/etl/load",
            post(|| async {
                concat!(
                    "{\"type\":\"Progress\",\"percent\":50}\n",
                    "{\"type\":\"Rule\",\"name\":\"row count\",\"failed\":false,\"message\":null}\n",
                    "{\"type\":\"Done\",\"paused\":false,\"message\":null}\n",
                )
            }),
        );
        let addr = spawn_test_server(app).await;
        let driver = HttpTaskDriver::new();

        let mut handle = driver
            .dispatch(&record(format!("http://{addr}/etl/load")))
            .await
            .expect("dispatch should succeed");

        assert_eq!(
            handle.next_event().await.unwrap(),
            Some(TaskResponse::Progress { percent: 50 })
        );
        assert!(matches!(
            handle.next_event().await.unwrap(),
            Some(TaskResponse::Rule(_))
        ));
        assert!(matches!(
            handle.next_event().await.unwrap(),
            Some(TaskResponse::Done { paused: false, .. })
        ));
        assert_eq!(handle.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn dispatch_surfaces_http_errors() {
        let app = Router::new().route(
            "/etl/load",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let addr = spawn_test_server(app).await;
        let driver = HttpTaskDriver::new();

        let error = driver
            .dispatch(&record(format!("http://{addr}/etl/load")))
            .await
            .expect_err("dispatch should fail on 500");
        assert!(error.to_string().contains("task service returned status"));
    }

    #[tokio::test]
    async fn missing_trailing_newline_still_yields_final_event() {
        let app = Router::new().route(
            "/etl/load",
            post(|| async { "{\"type\":\"Done\",\"paused\":true,\"message\":\"waiting on review\"}" }),
        );
        let addr = spawn_test_server(app).await;
        let driver = HttpTaskDriver::new();

        let mut handle = driver
            .dispatch(&record(format!("http://{addr}/etl/load")))
            .await
            .unwrap();
        assert!(matches!(
            handle.next_event().await.unwrap(),
            Some(TaskResponse::Done { paused: true, .. })
        ));
        assert_eq!(handle.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_ending_without_done_returns_none() {
        let app = Router::new().route(
            "/etl/load",
            post(|| async { "{\"type\":\"Progress\",\"percent\":10}\n" }),
        );
        let addr = spawn_test_server(app).await;
        let driver = HttpTaskDriver::new();

        let mut handle = driver
            .dispatch(&record(format!("http://{addr}/etl/load")))
            .await
            .unwrap();
        assert!(matches!(
            handle.next_event().await.unwrap(),
            Some(TaskResponse::Progress { .. })
        ));
        assert_eq!(handle.next_event().await.unwrap(), None);
    }
}
