//! # skiff-id
//!
//! Typed identifiers for the skiff cluster manager.
//!
//! ## Design Principles
//!
//! - IDs generated by the system (slaves, frameworks, executor runs,
//!   status updates, offers) are ULID-backed: 128 bits, time-ordered,
//!   globally unique
//! - IDs chosen by frameworks (executor ids, task ids) are opaque names;
//!   they are validated but otherwise carried verbatim
//! - All IDs are typed to prevent mixing different resource kinds
//! - All IDs roundtrip through their canonical string representation
//!
//! ## ID Format
//!
//! System-generated IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `slave_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `fw_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `upd_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The ULID payload doubles as the 128-bit uuid the wire protocol uses
//! to key status-update acknowledgements and executor incarnations.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
