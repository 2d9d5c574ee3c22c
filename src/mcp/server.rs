//! MCP server implementation for Dataverse
//!
//! Maps named tool invocations onto DataverseClient calls, validating
//! arguments at the boundary and normalizing every outcome into a uniform
//! ToolResult shape.

use crate::dataverse::{DataverseClient, DataverseError, QuerySpec};
use crate::mcp::protocol::{tool_schema, CallToolResult, ParamKind, Tool};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Uniform tool outcome: success with data, or a kinded failure.
/// Never both; the protocol layer serializes it as-is.
#[derive(Debug, Serialize)]
pub struct ToolResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ToolResult {
    fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error_kind: None,
            message: None,
        }
    }

    fn fail(error_kind: &'static str, message: String) -> Self {
        Self {
            ok: false,
            data: None,
            error_kind: Some(error_kind),
            message: Some(message),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::fail("validation", message.into())
    }
}

impl From<DataverseError> for ToolResult {
    fn from(e: DataverseError) -> Self {
        Self::fail(e.kind(), e.to_string())
    }
}

impl From<ToolResult> for CallToolResult {
    fn from(result: ToolResult) -> Self {
        CallToolResult::json(&result, !result.ok)
    }
}

/// The closed set of tools this server exposes. Dispatch is a match, so a
/// new tool that misses a handler fails to compile rather than at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolKind {
    Health,
    ListTables,
    DescribeTable,
    ReadQuery,
    CreateRecord,
    UpdateRecord,
    DeleteRecord,
}

impl ToolKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "health" => Some(Self::Health),
            "list_tables" => Some(Self::ListTables),
            "describe_table" => Some(Self::DescribeTable),
            "read_query" => Some(Self::ReadQuery),
            "create_record" => Some(Self::CreateRecord),
            "update_record" => Some(Self::UpdateRecord),
            "delete_record" => Some(Self::DeleteRecord),
            _ => None,
        }
    }
}

/// MCP server for the Dataverse Web API
pub struct DataverseMcpServer {
    client: Arc<DataverseClient>,
}

impl DataverseMcpServer {
    pub fn new(client: Arc<DataverseClient>) -> Self {
        Self { client }
    }

    /// Tool declarations for tools/list
    pub fn get_tools() -> Vec<Tool> {
        vec![
            Tool {
                name: "health".to_string(),
                description: "Check Dataverse configuration and connectivity. Never fails; reports configured/reachable booleans.".to_string(),
                input_schema: tool_schema(&[]),
            },
            Tool {
                name: "list_tables".to_string(),
                description: "List Dataverse tables (entities). Use this to discover what tables exist before querying.".to_string(),
                input_schema: tool_schema(&[
                    ("filter_query", "OData filter over entity metadata, e.g. \"IsActivity eq false\"", ParamKind::String, false),
                    ("top", "Maximum tables to return (default 100)", ParamKind::Integer, false),
                    ("custom_only", "Only return custom tables", ParamKind::Boolean, false),
                ]),
            },
            Tool {
                name: "describe_table".to_string(),
                description: "Get a table's schema: entity metadata plus its columns with types, primary key, and required flags.".to_string(),
                input_schema: tool_schema(&[
                    ("table_name", "Table logical name, e.g. 'account'", ParamKind::String, true),
                ]),
            },
            Tool {
                name: "read_query".to_string(),
                description: "Query records from a table with OData options. Returns matching records as JSON.".to_string(),
                input_schema: tool_schema(&[
                    ("table_name", "Table logical name, e.g. 'account'", ParamKind::String, true),
                    ("select", "Comma-separated column logical names, e.g. 'name,revenue'", ParamKind::String, false),
                    ("filter_query", "OData filter, e.g. \"revenue gt 100000\"", ParamKind::String, false),
                    ("order_by", "OData orderby, e.g. 'name asc'", ParamKind::String, false),
                    ("top", "Maximum records to return (default 100, max 5000)", ParamKind::Integer, false),
                ]),
            },
            Tool {
                name: "create_record".to_string(),
                description: "Create a record. Returns the new record's GUID.".to_string(),
                input_schema: tool_schema(&[
                    ("table_name", "Table logical name, e.g. 'account'", ParamKind::String, true),
                    ("data", "Column values, e.g. {\"name\": \"Contoso\"}", ParamKind::Object, true),
                ]),
            },
            Tool {
                name: "update_record".to_string(),
                description: "Update columns on an existing record by GUID.".to_string(),
                input_schema: tool_schema(&[
                    ("table_name", "Table logical name, e.g. 'account'", ParamKind::String, true),
                    ("record_id", "Record GUID", ParamKind::String, true),
                    ("data", "Column values to change", ParamKind::Object, true),
                ]),
            },
            Tool {
                name: "delete_record".to_string(),
                description: "Delete a record by GUID.".to_string(),
                input_schema: tool_schema(&[
                    ("table_name", "Table logical name, e.g. 'account'", ParamKind::String, true),
                    ("record_id", "Record GUID", ParamKind::String, true),
                ]),
            },
        ]
    }

    /// Dispatch a tool call by name
    pub async fn call_tool(&self, name: &str, args: &HashMap<String, Value>) -> CallToolResult {
        let Some(kind) = ToolKind::from_name(name) else {
            return ToolResult::invalid(format!("Unknown tool: {}", name)).into();
        };

        let result = match kind {
            ToolKind::Health => self.health().await,
            ToolKind::ListTables => self.list_tables(args).await,
            ToolKind::DescribeTable => self.describe_table(args).await,
            ToolKind::ReadQuery => self.read_query(args).await,
            ToolKind::CreateRecord => self.create_record(args).await,
            ToolKind::UpdateRecord => self.update_record(args).await,
            ToolKind::DeleteRecord => self.delete_record(args).await,
        };
        result.into()
    }

    async fn health(&self) -> ToolResult {
        let health = self.client.health().await;
        match serde_json::to_value(health) {
            Ok(data) => ToolResult::ok(data),
            Err(e) => ToolResult::fail("api", e.to_string()),
        }
    }

    async fn list_tables(&self, args: &HashMap<String, Value>) -> ToolResult {
        let filter_query = opt_str(args, "filter_query");
        let custom_only = opt_bool(args, "custom_only").unwrap_or(false);
        let top = match opt_top(args) {
            Ok(top) => top.unwrap_or(100),
            Err(result) => return result,
        };

        match self.client.list_tables(filter_query, top, custom_only).await {
            Ok(tables) => {
                let count = tables.len();
                ToolResult::ok(serde_json::json!({
                    "tables": tables,
                    "count": count,
                }))
            }
            Err(e) => e.into(),
        }
    }

    async fn describe_table(&self, args: &HashMap<String, Value>) -> ToolResult {
        let table_name = match require_str(args, "table_name") {
            Ok(name) => name,
            Err(result) => return result,
        };

        match self.client.describe_table(table_name).await {
            Ok(schema) => match serde_json::to_value(schema) {
                Ok(data) => ToolResult::ok(data),
                Err(e) => ToolResult::fail("api", e.to_string()),
            },
            Err(e) => e.into(),
        }
    }

    async fn read_query(&self, args: &HashMap<String, Value>) -> ToolResult {
        let table_name = match require_str(args, "table_name") {
            Ok(name) => name,
            Err(result) => return result,
        };

        let mut spec = QuerySpec::new(table_name);
        spec.select = parse_select(args);
        spec.filter_query = opt_str(args, "filter_query").map(String::from);
        spec.order_by = opt_str(args, "order_by").map(String::from);
        match opt_top(args) {
            Ok(Some(top)) => spec.top = top,
            Ok(None) => {}
            Err(result) => return result,
        }

        match self.client.read_query(&spec).await {
            Ok(records) => {
                let count = records.len();
                ToolResult::ok(serde_json::json!({
                    "table_name": spec.table_name,
                    "records": records,
                    "count": count,
                }))
            }
            Err(e) => e.into(),
        }
    }

    async fn create_record(&self, args: &HashMap<String, Value>) -> ToolResult {
        let table_name = match require_str(args, "table_name") {
            Ok(name) => name,
            Err(result) => return result,
        };
        let data = match require_object(args, "data") {
            Ok(data) => data,
            Err(result) => return result,
        };

        match self.client.create_record(table_name, data).await {
            Ok(record_id) => ToolResult::ok(serde_json::json!({
                "table_name": table_name,
                "record_id": record_id,
            })),
            Err(e) => e.into(),
        }
    }

    async fn update_record(&self, args: &HashMap<String, Value>) -> ToolResult {
        let table_name = match require_str(args, "table_name") {
            Ok(name) => name,
            Err(result) => return result,
        };
        let record_id = match require_str(args, "record_id") {
            Ok(id) => id,
            Err(result) => return result,
        };
        let data = match require_object(args, "data") {
            Ok(data) => data,
            Err(result) => return result,
        };

        match self.client.update_record(table_name, record_id, data).await {
            Ok(()) => ToolResult::ok(serde_json::json!({
                "table_name": table_name,
                "record_id": record_id,
            })),
            Err(e) => e.into(),
        }
    }

    async fn delete_record(&self, args: &HashMap<String, Value>) -> ToolResult {
        let table_name = match require_str(args, "table_name") {
            Ok(name) => name,
            Err(result) => return result,
        };
        let record_id = match require_str(args, "record_id") {
            Ok(id) => id,
            Err(result) => return result,
        };

        match self.client.delete_record(table_name, record_id).await {
            Ok(()) => ToolResult::ok(serde_json::json!({
                "table_name": table_name,
                "record_id": record_id,
            })),
            Err(e) => e.into(),
        }
    }
}

fn require_str<'a>(args: &'a HashMap<String, Value>, key: &str) -> Result<&'a str, ToolResult> {
    match args.get(key).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(ToolResult::invalid(format!(
            "Missing required parameter: {}",
            key
        ))),
    }
}

fn require_object<'a>(args: &'a HashMap<String, Value>, key: &str) -> Result<&'a Value, ToolResult> {
    match args.get(key) {
        Some(v) if v.is_object() => Ok(v),
        _ => Err(ToolResult::invalid(format!(
            "Parameter '{}' must be a JSON object",
            key
        ))),
    }
}

fn opt_str<'a>(args: &'a HashMap<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn opt_bool(args: &HashMap<String, Value>, key: &str) -> Option<bool> {
    args.get(key)
        .and_then(|v| v.as_bool().or_else(|| v.as_str().map(|s| s == "true")))
}

/// Parse `top`, rejecting zero and negative values before any network call.
/// Numbers arrive as JSON numbers or (from some hosts) as strings.
fn opt_top(args: &HashMap<String, Value>) -> Result<Option<usize>, ToolResult> {
    let Some(value) = args.get("top") else {
        return Ok(None);
    };
    let parsed = value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()));
    match parsed {
        Some(n) if n > 0 => Ok(Some(n as usize)),
        _ => Err(ToolResult::invalid("top must be a positive integer")),
    }
}

/// `select` accepts a comma-separated string or an array of strings
fn parse_select(args: &HashMap<String, Value>) -> Vec<String> {
    match args.get("select") {
        Some(Value::String(s)) => s
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn unconfigured_server() -> DataverseMcpServer {
        let config = Config::resolve(None, None, None, None);
        DataverseMcpServer::new(Arc::new(DataverseClient::from_config(config)))
    }

    #[test]
    fn every_declared_tool_dispatches() {
        for tool in DataverseMcpServer::get_tools() {
            assert!(
                ToolKind::from_name(&tool.name).is_some(),
                "undeclared tool {}",
                tool.name
            );
        }
    }

    #[test]
    fn select_parses_string_and_array() {
        let from_string = parse_select(&args(&[("select", json!("name, revenue"))]));
        assert_eq!(from_string, vec!["name", "revenue"]);

        let from_array = parse_select(&args(&[("select", json!(["name", "revenue"]))]));
        assert_eq!(from_array, vec!["name", "revenue"]);

        assert!(parse_select(&args(&[])).is_empty());
    }

    #[test]
    fn top_rejects_non_positive_values() {
        assert!(opt_top(&args(&[("top", json!(0))])).is_err());
        assert!(opt_top(&args(&[("top", json!(-5))])).is_err());
        assert_eq!(opt_top(&args(&[("top", json!(10))])).unwrap(), Some(10));
        assert_eq!(opt_top(&args(&[("top", json!("25"))])).unwrap(), Some(25));
        assert_eq!(opt_top(&args(&[])).unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_validation_failure() {
        let server = unconfigured_server();
        let result = server.call_tool("drop_database", &HashMap::new()).await;
        assert_eq!(result.is_error, Some(true));
        assert!(result.content[0].text.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn unconfigured_read_query_fails_with_config_kind() {
        let server = unconfigured_server();
        let result = server
            .call_tool("read_query", &args(&[("table_name", json!("account"))]))
            .await;
        assert_eq!(result.is_error, Some(true));
        assert!(result.content[0].text.contains("\"error_kind\": \"config\""));
    }

    #[tokio::test]
    async fn unconfigured_health_reports_booleans_without_error() {
        let server = unconfigured_server();
        let result = server.call_tool("health", &HashMap::new()).await;
        assert_eq!(result.is_error, None);
        let text = &result.content[0].text;
        assert!(text.contains("\"configured\": false"));
        assert!(text.contains("\"reachable\": false"));
    }

    #[tokio::test]
    async fn missing_required_argument_is_rejected_before_io() {
        let server = unconfigured_server();
        let result = server.call_tool("describe_table", &HashMap::new()).await;
        assert_eq!(result.is_error, Some(true));
        assert!(result.content[0].text.contains("table_name"));
    }

    #[tokio::test]
    async fn create_record_requires_object_data() {
        let server = unconfigured_server();
        let result = server
            .call_tool(
                "create_record",
                &args(&[("table_name", json!("account")), ("data", json!("oops"))]),
            )
            .await;
        assert_eq!(result.is_error, Some(true));
        assert!(result.content[0].text.contains("JSON object"));
    }
}
