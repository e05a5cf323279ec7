//! Coordinator wire format
//!
//! DTOs mirror the JSON the coordinator speaks (camelCase). Inbound payloads are
//! converted into validated core types with `TryFrom`; nothing unvalidated leaves
//! this module.

use chrono::{DateTime, Utc};
use kiln_core::{
    ClaimedTask, Completion, CompletionStatus, KilnError, LogLevel, PollOutcome, Priority, Run,
    Task,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// `200` body of `POST /nodes/poll`
#[derive(Debug, Clone, Deserialize)]
pub struct PollResponse {
    pub request: RequestDto,
    pub run: RunDto,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDto {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub todo_id: Option<String>,
    #[serde(default)]
    pub todo: Option<TodoDto>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_priority")]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TodoDto {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDto {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
}

/// Accepts `"HIGH"`, `"high"`, `1`, `null` or nothing. Unknown values fall back to `None`.
fn lenient_priority<'de, D>(deserializer: D) -> Result<Option<Priority>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.as_u64().and_then(|n| n.to_string().parse().ok()),
        _ => None,
    })
}

fn required(field: &str, value: Option<String>) -> Result<String, KilnError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(KilnError::Protocol(format!(
            "poll response missing required field '{}'",
            field
        ))),
    }
}

impl TryFrom<PollResponse> for ClaimedTask {
    type Error = KilnError;

    fn try_from(response: PollResponse) -> Result<Self, Self::Error> {
        let PollResponse { request, run } = response;
        let todo = request.todo.unwrap_or(TodoDto {
            title: None,
            description: None,
        });

        let started_at = required("run.startedAt", run.started_at)?;
        let started_at = DateTime::parse_from_rfc3339(&started_at)
            .map_err(|e| {
                KilnError::Protocol(format!("run.startedAt '{}' is not RFC 3339: {}", started_at, e))
            })?
            .with_timezone(&Utc);

        let task = Task {
            id: required("request.id", request.id)?,
            todo_id: request.todo_id.unwrap_or_default(),
            title: required("request.todo.title", todo.title)?,
            description: todo.description.filter(|d| !d.trim().is_empty()),
            repo_url: required("request.repoUrl", request.repo_url)?,
            branch_name: required("request.branchName", request.branch_name)?,
            priority: request.priority.unwrap_or_default(),
        };

        Ok(ClaimedTask {
            task,
            run: Run {
                id: required("run.id", run.id)?,
                started_at,
            },
        })
    }
}

/// Interpret a `200` poll body.
///
/// A body that fails validation but names a run becomes [`PollOutcome::Rejected`], since
/// the coordinator already opened that run and expects a completion for it. Without a
/// run id there is nothing to report against and the error is returned as is.
pub fn poll_outcome(body: Value) -> Result<PollOutcome, KilnError> {
    let run_id = body
        .pointer("/run/id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let claimed = serde_json::from_value::<PollResponse>(body)
        .map_err(|e| KilnError::Protocol(format!("Malformed poll response: {}", e)))
        .and_then(ClaimedTask::try_from);

    match (claimed, run_id) {
        (Ok(claimed), _) => Ok(PollOutcome::Claimed(claimed)),
        (Err(e), Some(run_id)) => Ok(PollOutcome::Rejected {
            run_id,
            reason: e.to_string(),
        }),
        (Err(e), None) => Err(e),
    }
}

/// Body of `POST /nodes/heartbeat`. `currentJobId` is always present, `null` when idle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatBody<'a> {
    pub current_job_id: Option<&'a str>,
}

/// Body of `POST /runs/{runId}/logs`
#[derive(Debug, Clone, Serialize)]
pub struct LogBody<'a> {
    pub level: LogLevel,
    pub message: &'a str,
}

/// Body of `POST /runs/{runId}/complete`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionBody<'a> {
    pub status: CompletionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<&'a str>,
}

impl<'a> From<&'a Completion> for CompletionBody<'a> {
    fn from(completion: &'a Completion) -> Self {
        Self {
            status: completion.status,
            pr_url: completion.pr_url.as_deref(),
            error_message: completion.error_message.as_deref(),
        }
    }
}
