//! Dataverse Web API module
//!
//! Token-authenticated client and OData query construction

pub mod client;
pub mod query;

pub use client::{
    ColumnDescriptor, DataverseClient, DataverseError, Health, TableDescriptor, TableSchema,
};
pub use query::{EntitySetMap, QuerySpec};
