//! stdio transport for the MCP server.
//!
//! Framing is auto-detected once per process from the first line: a line
//! starting with `{` means newline-delimited JSON, a `Content-Length:` (or
//! `Content-Type:`) header means MCP header framing. Responses always use
//! the detected framing.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Stdin, Stdout};
use tracing::debug;

use super::server::{json_rpc_error, JsonRpcRequest, McpServer};

const MAX_CONTENT_LENGTH_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StdioMode {
    NewlineJson,
    ContentLength,
}

fn detect_mode(line: &str) -> Option<StdioMode> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(StdioMode::NewlineJson);
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("content-length:") || lower.starts_with("content-type:") {
        return Some(StdioMode::ContentLength);
    }
    None
}

fn parse_content_length(line: &str) -> Option<usize> {
    let (key, value) = line.trim().split_once(':')?;
    if !key.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse().ok()
}

/// Run the stdio loop until EOF or shutdown.
pub async fn run_stdio(
    server: &McpServer,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut mode: Option<StdioMode> = None;

    loop {
        let mut line = String::new();
        let read = tokio::select! {
            read = reader.read_line(&mut line) => read?,
            _ = shutdown.changed() => {
                debug!("MCP stdio loop stopping");
                return Ok(());
            }
        };
        if read == 0 {
            return Ok(());
        }

        let effective = match mode {
            Some(mode) => mode,
            None => match detect_mode(&line) {
                Some(detected) => {
                    mode = Some(detected);
                    detected
                }
                None => continue,
            },
        };

        match effective {
            StdioMode::NewlineJson => {
                let raw = line.trim();
                if raw.is_empty() {
                    continue;
                }
                if let Some(response) = handle_raw(server, raw.as_bytes()).await {
                    write_newline(&mut stdout, &response).await?;
                }
            }
            StdioMode::ContentLength => {
                let Some(body) = read_framed_body(&mut reader, line).await? else {
                    return Ok(());
                };
                if let Some(response) = handle_raw(server, &body).await {
                    write_framed(&mut stdout, &response).await?;
                }
            }
        }
    }
}

/// Consume the remaining headers after `first_header`, then the body.
async fn read_framed_body(
    reader: &mut BufReader<Stdin>,
    mut header: String,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut content_length = parse_content_length(&header);

    loop {
        if header.trim_end().is_empty() {
            break;
        }
        header.clear();
        let read = reader.read_line(&mut header).await?;
        if read == 0 {
            return Ok(None);
        }
        if content_length.is_none() {
            content_length = parse_content_length(&header);
        }
    }

    let Some(len) = content_length else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        ));
    };
    if len > MAX_CONTENT_LENGTH_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Content-Length exceeds max allowed size",
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Parse and dispatch one raw frame, mapping malformed input to JSON-RPC
/// protocol errors.
async fn handle_raw(server: &McpServer, raw: &[u8]) -> Option<Value> {
    let data: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(e) => return Some(json_rpc_error(None, -32700, &format!("Parse error: {e}"))),
    };

    let (id, has_method) = match data.as_object() {
        Some(obj) => (obj.get("id").cloned(), obj.contains_key("method")),
        None => return Some(json_rpc_error(None, -32600, "Invalid Request")),
    };
    if !has_method {
        return Some(json_rpc_error(id, -32600, "Invalid Request"));
    }

    let request: JsonRpcRequest = match serde_json::from_value(data) {
        Ok(request) => request,
        Err(e) => return Some(json_rpc_error(id, -32600, &format!("Invalid Request: {e}"))),
    };

    server.handle(request).await
}

async fn write_newline(stdout: &mut Stdout, response: &Value) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(response)?;
    bytes.push(b'\n');
    stdout.write_all(&bytes).await?;
    stdout.flush().await
}

async fn write_framed(stdout: &mut Stdout, response: &Value) -> std::io::Result<()> {
    let body = serde_json::to_vec(response)?;
    stdout
        .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
        .await?;
    stdout.write_all(&body).await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests_support::memory_manager;
    use crate::worker::ArtifactStore;
    use std::sync::Arc;

    #[test]
    fn mode_detection() {
        assert_eq!(detect_mode("{\"id\":1}"), Some(StdioMode::NewlineJson));
        assert_eq!(
            detect_mode("Content-Length: 42\r\n"),
            Some(StdioMode::ContentLength)
        );
        assert_eq!(
            detect_mode("content-type: application/json"),
            Some(StdioMode::ContentLength)
        );
        assert_eq!(detect_mode("   "), None);
        assert_eq!(detect_mode("garbage"), None);
    }

    #[test]
    fn content_length_parsing() {
        assert_eq!(parse_content_length("Content-Length: 10"), Some(10));
        assert_eq!(parse_content_length("content-length:7"), Some(7));
        assert_eq!(parse_content_length("Content-Type: json"), None);
        assert_eq!(parse_content_length("Content-Length: x"), None);
    }

    #[tokio::test]
    async fn malformed_json_maps_to_parse_error() {
        let (manager, _bus) = memory_manager().await;
        let dir = tempfile::tempdir().unwrap();
        let server = McpServer::new(manager, Arc::new(ArtifactStore::new(dir.path())));

        let response = handle_raw(&server, b"{not json").await.unwrap();
        assert_eq!(response["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn missing_method_maps_to_invalid_request() {
        let (manager, _bus) = memory_manager().await;
        let dir = tempfile::tempdir().unwrap();
        let server = McpServer::new(manager, Arc::new(ArtifactStore::new(dir.path())));

        let response = handle_raw(&server, br#"{"id": 1}"#).await.unwrap();
        assert_eq!(response["error"]["code"], -32600);

        let response = handle_raw(&server, b"[1, 2]").await.unwrap();
        assert_eq!(response["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn valid_request_dispatches() {
        let (manager, _bus) = memory_manager().await;
        let dir = tempfile::tempdir().unwrap();
        let server = McpServer::new(manager, Arc::new(ArtifactStore::new(dir.path())));

        let response = handle_raw(
            &server,
            br#"{"jsonrpc": "2.0", "id": 7, "method": "tools/list"}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["id"], 7);
        assert!(response["result"]["tools"].is_array());
    }
}
