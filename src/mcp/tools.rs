//! The four job tools and the resource reads.

use serde_json::{json, Value};

use crate::domain::{ArtifactKind, JobId, JobSpec, JobState, JobStatus};
use crate::store::Storage;

use super::server::McpServer;

const LIST_DEFAULT_LIMIT: u32 = 20;
const LIST_MAX_LIMIT: u32 = 100;

/// Tool metadata for `tools/list`.
pub fn tool_definitions() -> Value {
    json!({
        "tools": [
            {
                "name": "jobs_submit",
                "description": "Submit a job spec for execution. Idempotent per idempotencyKey.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "spec": {"type": "object", "description": "The JobSpec to run"}
                    },
                    "required": ["spec"]
                }
            },
            {
                "name": "jobs_get",
                "description": "Get a job's status view.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "jobId": {"type": "string"}
                    },
                    "required": ["jobId"]
                }
            },
            {
                "name": "jobs_list",
                "description": "List jobs, optionally filtered by state.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "state": {"type": "string"},
                        "limit": {"type": "integer", "default": 20, "maximum": 100},
                        "offset": {"type": "integer", "default": 0}
                    }
                }
            },
            {
                "name": "jobs_cancel",
                "description": "Cancel a job. Terminal jobs are reported unchanged.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "jobId": {"type": "string"}
                    },
                    "required": ["jobId"]
                }
            }
        ]
    })
}

/// Dispatch a `tools/call` by name.
pub async fn dispatch(server: &McpServer, name: &str, args: Value) -> Result<Value, String> {
    match name {
        "jobs_submit" => jobs_submit(server, args).await,
        "jobs_get" => jobs_get(server, args).await,
        "jobs_list" => jobs_list(server, args).await,
        "jobs_cancel" => jobs_cancel(server, args).await,
        other => Err(format!("Unknown tool: {other}")),
    }
}

async fn jobs_submit(server: &McpServer, args: Value) -> Result<Value, String> {
    let spec_value = args
        .get("spec")
        .cloned()
        .ok_or_else(|| "jobs_submit requires a spec".to_string())?;
    let spec: JobSpec =
        serde_json::from_value(spec_value).map_err(|e| format!("Invalid spec: {e}"))?;
    let job_id = server
        .manager
        .submit(spec)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({"jobId": job_id}))
}

async fn jobs_get(server: &McpServer, args: Value) -> Result<Value, String> {
    let job_id = require_job_id(&args)?;
    let status = server
        .manager
        .get_status(&job_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Job {job_id} not found"))?;
    Ok(serde_json::to_value(&status).map_err(|e| e.to_string())?)
}

async fn jobs_list(server: &McpServer, args: Value) -> Result<Value, String> {
    let state = match args.get("state").and_then(Value::as_str) {
        Some(raw) => Some(
            raw.parse::<JobState>()
                .map_err(|e| format!("Invalid state filter: {e}"))?,
        ),
        None => None,
    };
    let limit = args
        .get("limit")
        .and_then(Value::as_u64)
        .map(|n| n as u32)
        .unwrap_or(LIST_DEFAULT_LIMIT)
        .min(LIST_MAX_LIMIT);
    let offset = args
        .get("offset")
        .and_then(Value::as_u64)
        .map(|n| n as u32)
        .unwrap_or(0);

    let page = server
        .manager
        .list(state, limit, offset)
        .await
        .map_err(|e| e.to_string())?;
    let items: Vec<JobStatus> = page.items.iter().map(JobStatus::from_job).collect();
    Ok(json!({
        "items": items,
        "total": page.total,
        "hasMore": page.has_more,
    }))
}

async fn jobs_cancel(server: &McpServer, args: Value) -> Result<Value, String> {
    let job_id = require_job_id(&args)?;
    let outcome = server
        .manager
        .cancel(&job_id)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({"ok": outcome.ok, "state": outcome.state}))
}

fn require_job_id(args: &Value) -> Result<JobId, String> {
    args.get("jobId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(JobId::new)
        .ok_or_else(|| "jobId is required".to_string())
}

/// Read `mcp://jobs/{id}/status` or `mcp://jobs/{id}/artifacts/{kind}`.
pub async fn read_resource(server: &McpServer, uri: &str) -> Result<(String, String), String> {
    let rest = uri
        .strip_prefix("mcp://jobs/")
        .ok_or_else(|| format!("Unsupported resource uri: {uri}"))?;
    let mut parts = rest.splitn(2, '/');
    let job_id = JobId::new(
        parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Resource uri is missing a job id".to_string())?,
    );
    let tail = parts.next().unwrap_or("");

    if tail == "status" {
        let status = server
            .manager
            .get_status(&job_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("Job {job_id} not found"))?;
        let text = serde_json::to_string_pretty(&status).map_err(|e| e.to_string())?;
        return Ok(("application/json".to_string(), text));
    }

    if let Some(kind_str) = tail.strip_prefix("artifacts/") {
        let kind: ArtifactKind = kind_str
            .parse()
            .map_err(|e: String| format!("Invalid artifact kind: {e}"))?;
        server
            .manager
            .store()
            .get_artifact(&job_id, kind)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("Artifact {kind} not recorded for job {job_id}"))?;
        let bytes = server
            .artifacts
            .read(&job_id, kind)
            .await
            .map_err(|e| format!("Artifact read failed: {e}"))?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        return Ok((kind.mime().to_string(), text));
    }

    Err(format!("Unsupported resource uri: {uri}"))
}
