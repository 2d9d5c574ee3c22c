//! Dataverse Web API client
//!
//! Authenticated HTTP layer over the Dataverse Web API v9.2: table metadata,
//! OData queries, and record CRUD. Composes the token cache with the query
//! builder and normalizes responses into typed results.

use crate::auth::{AuthError, TokenCache};
use crate::config::{Config, ConfigError};
use crate::dataverse::query::{is_guid, EntitySetMap, QuerySpec, MAX_TOP};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const API_VERSION: &str = "v9.2";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Dataverse client errors
#[derive(Error, Debug)]
pub enum DataverseError {
    #[error("Not configured: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Dataverse API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl DataverseError {
    /// Stable machine-readable kind, surfaced in tool results
    pub fn kind(&self) -> &'static str {
        match self {
            DataverseError::Config(_) => "config",
            DataverseError::Auth(AuthError::Timeout(_)) => "timeout",
            DataverseError::Auth(_) => "auth",
            DataverseError::Validation(_) => "validation",
            DataverseError::NotFound(_) => "not_found",
            DataverseError::Timeout(_) => "timeout",
            DataverseError::Api { .. } | DataverseError::Http(_) | DataverseError::Parse(_) => {
                "api"
            }
        }
    }
}

/// OData collection envelope; only the `value` array matters here
#[derive(Debug, Deserialize)]
struct ODataCollection {
    #[serde(default)]
    value: Vec<Value>,
}

/// Read-only projection of a table's entity metadata
#[derive(Debug, Clone, Serialize)]
pub struct TableDescriptor {
    pub logical_name: String,
    pub display_name: Option<String>,
    pub entity_set_name: String,
    pub is_custom: bool,
}

impl TableDescriptor {
    fn from_metadata(value: &Value) -> Self {
        Self {
            logical_name: str_field(value, "LogicalName"),
            display_name: localized_label(value),
            entity_set_name: str_field(value, "EntitySetName"),
            is_custom: value
                .get("IsCustomEntity")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

/// Read-only projection of an attribute's metadata
#[derive(Debug, Clone, Serialize)]
pub struct ColumnDescriptor {
    pub logical_name: String,
    pub display_name: Option<String>,
    pub column_type: String,
    pub is_primary_key: bool,
    pub is_required: bool,
}

impl ColumnDescriptor {
    fn from_attribute(value: &Value) -> Self {
        let required_level = value
            .pointer("/RequiredLevel/Value")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Self {
            logical_name: str_field(value, "LogicalName"),
            display_name: localized_label(value),
            column_type: str_field(value, "AttributeType"),
            is_primary_key: value
                .get("IsPrimaryId")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            is_required: matches!(required_level, "ApplicationRequired" | "SystemRequired"),
        }
    }
}

/// Full schema for one table: entity metadata plus its attribute collection
#[derive(Debug, Serialize)]
pub struct TableSchema {
    pub table: TableDescriptor,
    pub columns: Vec<ColumnDescriptor>,
}

/// Diagnostic probe result; never raises
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Health {
    pub configured: bool,
    pub reachable: bool,
}

#[derive(Debug)]
enum Connection {
    Configured {
        auth: Arc<TokenCache>,
        api_base: String,
    },
    Unconfigured,
}

/// Client for the Dataverse Web API
#[derive(Debug)]
pub struct DataverseClient {
    config: Config,
    connection: Connection,
    entity_sets: EntitySetMap,
    http_client: Client,
}

impl DataverseClient {
    /// Create a client from configuration, building the token cache when
    /// credentials are present. An unconfigured client still answers
    /// `health()`; every other operation fails fast with a config error.
    pub fn from_config(config: Config) -> Self {
        Self::new(config, None)
    }

    /// Create a client with an externally constructed token cache
    /// (sovereign-cloud authority overrides, test doubles).
    pub fn new(config: Config, auth: Option<Arc<TokenCache>>) -> Self {
        let connection = match config.credentials().ok() {
            Some(creds) => Connection::Configured {
                api_base: format!("{}/api/data/{}/", creds.host, API_VERSION),
                auth: auth.unwrap_or_else(|| Arc::new(TokenCache::new(creds.clone()))),
            },
            None => Connection::Unconfigured,
        };

        Self {
            config,
            connection,
            entity_sets: EntitySetMap::new(),
            http_client: Client::builder().timeout(REQUEST_TIMEOUT).build().unwrap(),
        }
    }

    /// Register irregular plural mappings for tables whose entity-set name
    /// does not follow English pluralization.
    pub fn with_entity_sets(mut self, entity_sets: EntitySetMap) -> Self {
        self.entity_sets = entity_sets;
        self
    }

    fn connection(&self) -> Result<(&TokenCache, &str), DataverseError> {
        match &self.connection {
            Connection::Configured { auth, api_base } => Ok((auth.as_ref(), api_base.as_str())),
            // Unconfigured iff credentials() errs, naming the missing variables
            Connection::Unconfigured => Err(self.config.credentials().unwrap_err().into()),
        }
    }

    /// Issue an authenticated request. A 401 triggers exactly one token
    /// invalidation and one retry; a second 401 surfaces as an auth error.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        prefer: Option<&'static str>,
    ) -> Result<Response, DataverseError> {
        let (auth, _) = self.connection()?;
        let mut reauth_attempted = false;

        loop {
            let token = auth.get_token().await?;

            let mut request = self
                .http_client
                .request(method.clone(), url)
                .header("Authorization", format!("Bearer {}", token))
                .header("Accept", "application/json")
                .header("OData-MaxVersion", "4.0")
                .header("OData-Version", "4.0");

            if let Some(prefer) = prefer {
                request = request.header("Prefer", prefer);
            }

            if let Some(body) = body {
                request = request.json(body);
            }

            tracing::debug!("{} {}", method, url);
            let response = request.send().await.map_err(transport_error)?;

            match response.status() {
                status if status.is_success() => return Ok(response),
                StatusCode::UNAUTHORIZED if !reauth_attempted => {
                    reauth_attempted = true;
                    tracing::warn!("401 from Dataverse, refreshing token and retrying once");
                    auth.invalidate().await;
                }
                StatusCode::UNAUTHORIZED => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(DataverseError::Auth(AuthError::Rejected {
                        status: 401,
                        body,
                    }));
                }
                StatusCode::NOT_FOUND => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(DataverseError::NotFound(body));
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(DataverseError::Api {
                        status: status.as_u16(),
                        body,
                    });
                }
            }
        }
    }

    /// List tables from the entity-metadata endpoint.
    ///
    /// `custom_only` contributes an `IsCustomEntity eq true` clause,
    /// AND-combined with any caller-supplied filter.
    pub async fn list_tables(
        &self,
        filter_query: Option<&str>,
        top: usize,
        custom_only: bool,
    ) -> Result<Vec<TableDescriptor>, DataverseError> {
        if top == 0 {
            return Err(DataverseError::Validation(
                "top must be a positive integer".to_string(),
            ));
        }
        let (_, api_base) = self.connection()?;

        let mut url = format!(
            "{}EntityDefinitions?$select=LogicalName,DisplayName,EntitySetName,IsCustomEntity",
            api_base
        );
        if let Some(filter) = combine_custom_filter(filter_query, custom_only) {
            url.push_str(&format!("&$filter={}", filter));
        }
        url.push_str(&format!("&$top={}", top.min(MAX_TOP)));

        let response = self.send(Method::GET, &url, None, None).await?;
        let collection: ODataCollection = response
            .json()
            .await
            .map_err(|e| DataverseError::Parse(format!("Failed to parse table list: {}", e)))?;

        Ok(collection
            .value
            .iter()
            .map(TableDescriptor::from_metadata)
            .collect())
    }

    /// Fetch one table's entity definition with its attribute collection
    pub async fn describe_table(&self, table_name: &str) -> Result<TableSchema, DataverseError> {
        if table_name.trim().is_empty() {
            return Err(DataverseError::Validation(
                "table_name must not be empty".to_string(),
            ));
        }
        let (_, api_base) = self.connection()?;

        let url = format!(
            "{}EntityDefinitions(LogicalName='{}')?$expand=Attributes",
            api_base,
            table_name.to_lowercase()
        );

        let metadata: Value = match self.send(Method::GET, &url, None, None).await {
            Ok(response) => response.json().await.map_err(|e| {
                DataverseError::Parse(format!("Failed to parse entity definition: {}", e))
            })?,
            Err(DataverseError::NotFound(_)) => {
                return Err(DataverseError::NotFound(format!(
                    "Table '{}' not found",
                    table_name
                )))
            }
            Err(e) => return Err(e),
        };

        let columns = metadata
            .get("Attributes")
            .and_then(Value::as_array)
            .map(|attrs| attrs.iter().map(ColumnDescriptor::from_attribute).collect())
            .unwrap_or_default();

        Ok(TableSchema {
            table: TableDescriptor::from_metadata(&metadata),
            columns,
        })
    }

    /// Query records; returns the response `value` array verbatim,
    /// no schema coercion.
    pub async fn read_query(&self, spec: &QuerySpec) -> Result<Vec<Value>, DataverseError> {
        spec.validate()?;
        let (_, api_base) = self.connection()?;

        let url = format!(
            "{}{}",
            self.entity_sets.entity_url(api_base, &spec.table_name, None),
            spec.query_string()
        );

        let response = self.send(Method::GET, &url, None, None).await?;
        let collection: ODataCollection = response
            .json()
            .await
            .map_err(|e| DataverseError::Parse(format!("Failed to parse query result: {}", e)))?;

        Ok(collection.value)
    }

    /// Create a record; returns the new record's primary-key GUID
    pub async fn create_record(
        &self,
        table_name: &str,
        fields: &Value,
    ) -> Result<String, DataverseError> {
        validate_table_and_fields(table_name, fields)?;
        let (_, api_base) = self.connection()?;

        let url = self.entity_sets.entity_url(api_base, table_name, None);
        let response = self
            .send(
                Method::POST,
                &url,
                Some(fields),
                Some("return=representation"),
            )
            .await?;

        // Prefer the OData-EntityId header; fall back to the representation
        let header_id = response
            .headers()
            .get("OData-EntityId")
            .and_then(|v| v.to_str().ok())
            .and_then(guid_from_entity_id);
        if let Some(id) = header_id {
            return Ok(id);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| DataverseError::Parse(format!("Failed to parse created record: {}", e)))?;
        let id_field = format!("{}id", table_name.to_lowercase());
        body.get(&id_field)
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| {
                DataverseError::Parse(format!(
                    "Created record response carries neither OData-EntityId header nor '{}'",
                    id_field
                ))
            })
    }

    /// Update a record in place; 204 from Dataverse means success
    pub async fn update_record(
        &self,
        table_name: &str,
        record_id: &str,
        fields: &Value,
    ) -> Result<(), DataverseError> {
        validate_table_and_fields(table_name, fields)?;
        validate_record_id(record_id)?;
        let (_, api_base) = self.connection()?;

        let url = self
            .entity_sets
            .entity_url(api_base, table_name, Some(record_id));
        self.send(Method::PATCH, &url, Some(fields), None).await?;
        Ok(())
    }

    /// Delete a record by primary key
    pub async fn delete_record(
        &self,
        table_name: &str,
        record_id: &str,
    ) -> Result<(), DataverseError> {
        if table_name.trim().is_empty() {
            return Err(DataverseError::Validation(
                "table_name must not be empty".to_string(),
            ));
        }
        validate_record_id(record_id)?;
        let (_, api_base) = self.connection()?;

        let url = self
            .entity_sets
            .entity_url(api_base, table_name, Some(record_id));
        self.send(Method::DELETE, &url, None, None).await?;
        Ok(())
    }

    /// Diagnostic probe: reports configuration and reachability as booleans.
    /// This is the one operation that swallows downstream errors.
    pub async fn health(&self) -> Health {
        if !self.config.is_configured() {
            return Health {
                configured: false,
                reachable: false,
            };
        }

        let reachable = match self.list_tables(None, 1, false).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Health probe failed: {}", e);
                false
            }
        };

        Health {
            configured: true,
            reachable,
        }
    }
}

fn transport_error(e: reqwest::Error) -> DataverseError {
    if e.is_timeout() {
        DataverseError::Timeout(REQUEST_TIMEOUT)
    } else {
        DataverseError::Http(e)
    }
}

fn combine_custom_filter(filter_query: Option<&str>, custom_only: bool) -> Option<String> {
    match (filter_query, custom_only) {
        (Some(filter), true) => Some(format!("({}) and IsCustomEntity eq true", filter)),
        (Some(filter), false) => Some(filter.to_string()),
        (None, true) => Some("IsCustomEntity eq true".to_string()),
        (None, false) => None,
    }
}

/// Extract the trailing parenthesized GUID from an OData-EntityId URL,
/// e.g. "https://org.crm.dynamics.com/api/data/v9.2/accounts(GUID)"
fn guid_from_entity_id(header: &str) -> Option<String> {
    let (_, tail) = header.rsplit_once('(')?;
    let id = tail.trim_end_matches(')');
    is_guid(id).then(|| id.to_string())
}

fn validate_table_and_fields(table_name: &str, fields: &Value) -> Result<(), DataverseError> {
    if table_name.trim().is_empty() {
        return Err(DataverseError::Validation(
            "table_name must not be empty".to_string(),
        ));
    }
    if !fields.is_object() {
        return Err(DataverseError::Validation(
            "fields must be a JSON object of column values".to_string(),
        ));
    }
    Ok(())
}

fn validate_record_id(record_id: &str) -> Result<(), DataverseError> {
    if !is_guid(record_id) {
        return Err(DataverseError::Validation(format!(
            "record_id '{}' is not a GUID",
            record_id
        )));
    }
    Ok(())
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn localized_label(value: &Value) -> Option<String> {
    value
        .pointer("/DisplayName/UserLocalizedLabel/Label")
        .and_then(Value::as_str)
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn custom_filter_combination() {
        assert_eq!(combine_custom_filter(None, false), None);
        assert_eq!(
            combine_custom_filter(None, true).as_deref(),
            Some("IsCustomEntity eq true")
        );
        assert_eq!(
            combine_custom_filter(Some("IsActivity eq false"), true).as_deref(),
            Some("(IsActivity eq false) and IsCustomEntity eq true")
        );
        assert_eq!(
            combine_custom_filter(Some("IsActivity eq false"), false).as_deref(),
            Some("IsActivity eq false")
        );
    }

    #[test]
    fn entity_id_header_parsing() {
        assert_eq!(
            guid_from_entity_id(
                "https://org.crm.dynamics.com/api/data/v9.2/accounts(11111111-2222-3333-4444-555555555555)"
            )
            .as_deref(),
            Some("11111111-2222-3333-4444-555555555555")
        );
        assert_eq!(guid_from_entity_id("no parens here"), None);
        assert_eq!(guid_from_entity_id("accounts(not-a-guid)"), None);
    }

    #[test]
    fn table_descriptor_from_metadata() {
        let metadata = json!({
            "LogicalName": "account",
            "DisplayName": { "UserLocalizedLabel": { "Label": "Account" } },
            "EntitySetName": "accounts",
            "IsCustomEntity": false
        });
        let table = TableDescriptor::from_metadata(&metadata);
        assert_eq!(table.logical_name, "account");
        assert_eq!(table.display_name.as_deref(), Some("Account"));
        assert_eq!(table.entity_set_name, "accounts");
        assert!(!table.is_custom);
    }

    #[test]
    fn table_descriptor_tolerates_null_display_name() {
        let metadata = json!({
            "LogicalName": "new_widget",
            "DisplayName": null,
            "EntitySetName": "new_widgets",
            "IsCustomEntity": true
        });
        let table = TableDescriptor::from_metadata(&metadata);
        assert_eq!(table.display_name, None);
        assert!(table.is_custom);
    }

    #[test]
    fn column_descriptor_required_levels() {
        let required = json!({
            "LogicalName": "name",
            "AttributeType": "String",
            "IsPrimaryId": false,
            "RequiredLevel": { "Value": "ApplicationRequired" }
        });
        assert!(ColumnDescriptor::from_attribute(&required).is_required);

        let optional = json!({
            "LogicalName": "description",
            "AttributeType": "Memo",
            "IsPrimaryId": false,
            "RequiredLevel": { "Value": "None" }
        });
        assert!(!ColumnDescriptor::from_attribute(&optional).is_required);

        let primary = json!({
            "LogicalName": "accountid",
            "AttributeType": "Uniqueidentifier",
            "IsPrimaryId": true,
            "RequiredLevel": { "Value": "SystemRequired" }
        });
        let column = ColumnDescriptor::from_attribute(&primary);
        assert!(column.is_primary_key);
        assert!(column.is_required);
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(
            DataverseError::Validation("x".to_string()).kind(),
            "validation"
        );
        assert_eq!(DataverseError::NotFound("x".to_string()).kind(), "not_found");
        assert_eq!(
            DataverseError::Api {
                status: 500,
                body: String::new()
            }
            .kind(),
            "api"
        );
        assert_eq!(DataverseError::Timeout(REQUEST_TIMEOUT).kind(), "timeout");
        // a timed-out token request is a timeout, not an auth rejection
        assert_eq!(
            DataverseError::Auth(AuthError::Timeout(REQUEST_TIMEOUT)).kind(),
            "timeout"
        );
        assert_eq!(
            DataverseError::Auth(AuthError::Rejected {
                status: 401,
                body: String::new()
            })
            .kind(),
            "auth"
        );
    }
}
