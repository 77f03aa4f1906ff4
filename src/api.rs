//! HTTP request framing and JSON response shapes for the server binary.

use crate::error::AgentError;
use crate::executor::{ExecutionOutcome, QueryResult, RepairOutcome};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub const SESSION_HEADER: &str = "x-session-id";
pub const MAX_HEADER_BYTES: usize = 16 * 1024;
pub const MAX_HEADERS: usize = 100;
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Non-blank string field from a JSON body.
    pub fn body_field(&self, field: &str) -> Option<String> {
        let value: Value = serde_json::from_slice(&self.body).ok()?;
        value
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// Read one request. The request line and headers together may not exceed
/// `MAX_HEADER_BYTES`, nor hold more than `MAX_HEADERS` header lines.
pub async fn read_request<R>(reader: &mut R) -> io::Result<HttpRequest>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEADER_BYTES;
    let request_line = read_head_line(reader, &mut budget).await?;

    let mut parts = request_line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next()) {
        (Some(m), Some(t)) => (m.to_string(), t.to_string()),
        _ => return Err(invalid("malformed request line")),
    };

    // Remove query parameters, normalize trailing slash
    let path = target.split('?').next().unwrap_or("/").trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path }.to_string();

    let mut headers = HashMap::new();
    let mut count = 0;
    loop {
        let line = read_head_line(reader, &mut budget).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        count += 1;
        if count > MAX_HEADERS {
            return Err(invalid("too many request headers"));
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if length > MAX_BODY_BYTES {
        return Err(invalid("request body too large"));
    }

    let mut body = vec![0; length];
    reader.read_exact(&mut body).await?;

    Ok(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Read a line without consuming more than `budget` bytes. An empty string
/// means end of input.
async fn read_head_line<R>(reader: &mut R, budget: &mut usize) -> io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    if *budget == 0 {
        return Err(invalid("request headers too large"));
    }

    let mut line = String::new();
    let read = (&mut *reader)
        .take(*budget as u64)
        .read_line(&mut line)
        .await?;
    *budget -= read;

    if *budget == 0 && !line.ends_with('\n') {
        return Err(invalid("request headers too large"));
    }
    Ok(line)
}

/// JSON body for a successful execution.
pub fn outcome_json(outcome: &ExecutionOutcome) -> Value {
    let mut body = match &outcome.result {
        QueryResult::Rows { results } => json!({"type": "select", "results": results}),
        QueryResult::Acknowledged { rows_affected } => json!({
            "type": "action",
            "message": "Query executed successfully.",
            "rows_affected": rows_affected,
        }),
    };
    body["sql"] = json!(outcome.statement);
    if let Some(repaired) = &outcome.repaired_from {
        body["repaired_from"] = json!(repaired);
    }
    body
}

/// Status code and JSON body for a failed request.
pub fn error_response(e: &AgentError) -> (u16, Value) {
    let status = if e.is_user_error() { 400 } else { 500 };

    let body = match e {
        AgentError::Execution(failure) => {
            let mut body = json!({
                "error": format!("SQL execution failed: {}", failure.error),
                "sql": failure.statement,
            });
            match &failure.repair {
                Some(RepairOutcome::NoStatement { reply }) => body["ai_response"] = json!(reply),
                Some(RepairOutcome::UpstreamFailed { error }) => {
                    body["retry_error"] = json!(format!("Retry with AI failed: {}", error))
                }
                Some(RepairOutcome::RetryFailed { statement, error }) => {
                    body["retry_sql"] = json!(statement);
                    body["retry_error"] = json!(error);
                }
                None => {}
            }
            body
        }
        other => json!({"error": other.to_string()}),
    };

    (status, body)
}

/// Serialize a complete HTTP/1.1 response. The session key, when given, is
/// echoed in the `X-Session-Id` header.
pub fn create_response(status: u16, body: &Value, session_key: Option<&str>) -> String {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let body = body.to_string();
    let session = session_key
        .map(|key| format!("X-Session-Id: {}\r\n", key))
        .unwrap_or_default();

    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n{}",
        status,
        status_text,
        body.len(),
        session,
        body
    )
}
