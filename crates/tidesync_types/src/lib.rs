//! # TideSync Types
//!
//! Shared domain types for the TideSync offline sync engine.
//!
//! This crate provides:
//! - JSON item records and system-property handling
//! - Queries with a minimal comparison predicate model
//! - Config-table rows and delta-token identity
//! - UTC timestamps with stable ISO-8601 rendering

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config_value;
pub mod error;
pub mod item;
pub mod properties;
pub mod query;
pub mod time;

pub use config_value::{ConfigKind, ConfigValue};
pub use error::{TypeError, TypeResult};
pub use item::Item;
pub use properties::{
    is_system_field, SystemProperties, SystemProperty, CREATED_AT_FIELD, DELETED_FIELD,
    UPDATED_AT_FIELD, VERSION_FIELD,
};
pub use query::{compare_values, is_valid_query_id, CompareOp, Predicate, Query, SortDirection};
pub use time::Timestamp;
