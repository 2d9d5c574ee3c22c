//! Dataverse MCP Server
//!
//! Entry point for the MCP server binary.
//! Implements MCP over stdio using JSON-RPC 2.0; logs go to stderr.

use anyhow::Result;
use dataverse_mcp::config::Config;
use dataverse_mcp::dataverse::DataverseClient;
use dataverse_mcp::mcp::{
    CallToolParams, CallToolResult, DataverseMcpServer, InitializeResult, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, ServerCapabilities, ServerInfo, ToolsCapability,
};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout is the protocol channel; everything observable goes to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    tracing::info!("Starting Dataverse MCP Server...");

    let config = Config::load()?;
    if !config.is_configured() {
        tracing::warn!("Running unconfigured: only 'health' will report anything useful");
    }

    let client = Arc::new(DataverseClient::from_config(config));
    let server = DataverseMcpServer::new(client);

    tracing::info!("MCP Server ready, listening on stdio...");

    run_stdio_loop(server).await
}

async fn run_stdio_loop(server: DataverseMcpServer) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        tracing::debug!("Received: {}", line);

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let response = JsonRpcResponse::error(None, -32700, &format!("Parse error: {}", e));
                send_response(&mut stdout, &response)?;
                continue;
            }
        };

        let response = handle_request(&server, request).await;
        send_response(&mut stdout, &response)?;
    }

    Ok(())
}

async fn handle_request(server: &DataverseMcpServer, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone();

    match request.method.as_str() {
        "initialize" => {
            let result = InitializeResult {
                protocol_version: "2024-11-05".to_string(),
                capabilities: ServerCapabilities {
                    tools: Some(ToolsCapability {
                        list_changed: Some(false),
                    }),
                },
                server_info: ServerInfo {
                    name: "dataverse-mcp".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            };
            match serde_json::to_value(result) {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(e) => JsonRpcResponse::error(id, -32603, &e.to_string()),
            }
        }

        "initialized" => JsonRpcResponse::success(id, serde_json::json!({})),

        "tools/list" => {
            let result = ListToolsResult {
                tools: DataverseMcpServer::get_tools(),
            };
            match serde_json::to_value(result) {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(e) => JsonRpcResponse::error(id, -32603, &e.to_string()),
            }
        }

        "tools/call" => {
            let params: CallToolParams = match request.params {
                Some(p) => match serde_json::from_value(p) {
                    Ok(params) => params,
                    Err(e) => {
                        return JsonRpcResponse::error(id, -32602, &format!("Invalid params: {}", e))
                    }
                },
                None => return JsonRpcResponse::error(id, -32602, "Missing params"),
            };

            let args = params.arguments.unwrap_or_default();
            let result: CallToolResult = server.call_tool(&params.name, &args).await;
            match serde_json::to_value(result) {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(e) => JsonRpcResponse::error(id, -32603, &e.to_string()),
            }
        }

        "ping" => JsonRpcResponse::success(id, serde_json::json!({})),

        _ => JsonRpcResponse::error(id, -32601, &format!("Method not found: {}", request.method)),
    }
}

fn send_response(stdout: &mut io::Stdout, response: &JsonRpcResponse) -> io::Result<()> {
    let json = serde_json::to_string(response)?;
    tracing::debug!("Sending: {}", json);
    writeln!(stdout, "{}", json)?;
    stdout.flush()?;
    Ok(())
}
