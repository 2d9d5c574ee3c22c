//! OData query construction
//!
//! Translates tool-level query parameters into Dataverse Web API URLs.
//! Filter and orderby expressions are passed through unvalidated; Dataverse
//! is the sole judge of OData syntax and of table/column existence.

use super::client::DataverseError;
use std::collections::HashMap;

pub const DEFAULT_TOP: usize = 100;
pub const MAX_TOP: usize = 5000;

/// Query parameters for a single read against an entity set.
/// Built per call, discarded after the request it produces.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub table_name: String,
    pub select: Vec<String>,
    pub filter_query: Option<String>,
    pub order_by: Option<String>,
    pub top: usize,
}

impl QuerySpec {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            select: Vec::new(),
            filter_query: None,
            order_by: None,
            top: DEFAULT_TOP,
        }
    }

    /// Reject malformed input before any network call
    pub fn validate(&self) -> Result<(), DataverseError> {
        if self.table_name.trim().is_empty() {
            return Err(DataverseError::Validation(
                "table_name must not be empty".to_string(),
            ));
        }
        if self.top == 0 {
            return Err(DataverseError::Validation(
                "top must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }

    /// Assemble the query string in fixed parameter order:
    /// $select, $filter, $orderby, $top. Dataverse does not care about the
    /// order but tests do.
    pub fn query_string(&self) -> String {
        let mut params = Vec::new();

        if !self.select.is_empty() {
            params.push(format!("$select={}", self.select.join(",")));
        }

        if let Some(ref filter) = self.filter_query {
            params.push(format!("$filter={}", filter));
        }

        if let Some(ref order_by) = self.order_by {
            params.push(format!("$orderby={}", order_by));
        }

        params.push(format!("$top={}", self.top.min(MAX_TOP)));

        format!("?{}", params.join("&"))
    }
}

/// Maps table logical names to entity-set (plural) names.
/// Explicit overrides win; everything else goes through English
/// pluralization of the lower-cased logical name.
#[derive(Debug, Clone, Default)]
pub struct EntitySetMap {
    overrides: HashMap<String, String>,
}

impl EntitySetMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(
        mut self,
        table_name: impl Into<String>,
        entity_set: impl Into<String>,
    ) -> Self {
        self.overrides
            .insert(table_name.into().to_lowercase(), entity_set.into());
        self
    }

    pub fn resolve(&self, table_name: &str) -> String {
        let lower = table_name.to_lowercase();
        match self.overrides.get(&lower) {
            Some(entity_set) => entity_set.clone(),
            None => pluralize(&lower),
        }
    }

    /// URL of an entity set, or of a single record when `record_id` is given
    pub fn entity_url(&self, api_base: &str, table_name: &str, record_id: Option<&str>) -> String {
        let entity_set = self.resolve(table_name);
        match record_id {
            Some(id) => format!("{}{}({})", api_base, entity_set, id),
            None => format!("{}{}", api_base, entity_set),
        }
    }
}

fn pluralize(name: &str) -> String {
    if name.ends_with('s')
        || name.ends_with('x')
        || name.ends_with('z')
        || name.ends_with("ch")
        || name.ends_with("sh")
    {
        format!("{}es", name)
    } else if name.ends_with('y') && !ends_with_vowel_y(name) {
        format!("{}ies", &name[..name.len() - 1])
    } else {
        format!("{}s", name)
    }
}

fn ends_with_vowel_y(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() < 2 {
        return false;
    }
    matches!(bytes[bytes.len() - 2], b'a' | b'e' | b'i' | b'o' | b'u')
}

/// Dataverse record keys are GUIDs: 8-4-4-4-12 hex groups
pub fn is_guid(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return false;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}
