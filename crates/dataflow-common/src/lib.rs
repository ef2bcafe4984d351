//! DataFlow Common Library
//!
//! Shared types, utilities, and error handling for the DataFlow workspace.
//!
//! # Overview
//!
//! - **Types**: the raw and typed value model every pipeline stage exchanges
//! - **Error Handling**: common error type and result alias
//! - **Fingerprints**: stable content hashes used for change detection and sharding
//! - **Logging**: tracing subscriber setup shared by all binaries
//!
//! # Example
//!
//! ```
//! use dataflow_common::types::{FieldValue, RawRecord, RawValue};
//! use dataflow_common::fingerprint::stable_shard;
//!
//! let row = RawRecord::from_pairs([("SKU", RawValue::text("ABC123"))]);
//! assert!(row.get("sku").is_some());
//!
//! let value = FieldValue::Text("ABC123".to_string());
//! assert_eq!(value.key_fragment(), "abc123");
//! assert!(stable_shard("product|abc123", 4) < 4);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{DataflowError, Result};
pub use types::{FieldType, FieldValue, RawRecord, RawValue, RecordType};
