//! Typed ID definitions for the cluster manager.
//!
//! System-generated IDs are ULID-based for sortability and uniqueness;
//! framework-chosen IDs wrap validated opaque names.

use crate::{define_id, define_name_id};

// =============================================================================
// System-generated IDs
// =============================================================================

define_id!(SlaveId, "slave");
define_id!(FrameworkId, "fw");
define_id!(OfferId, "offer");

// One incarnation of an executor: two executors with the same ExecutorId
// on the same slave are told apart by their run id.
define_id!(RunId, "run");

// The acknowledgement key of a status update, unique per update within a
// (framework, task) stream.
define_id!(UpdateId, "upd");

// =============================================================================
// Framework-chosen IDs
// =============================================================================

define_name_id!(ExecutorId);
define_name_id!(TaskId);

// =============================================================================
// Tests
// =============================================================================
