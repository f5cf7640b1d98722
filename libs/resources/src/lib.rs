//! # skiff-resources
//!
//! The resource algebra shared by the allocator and the node agent.
//!
//! A [`Resources`] bundle is a multiset-like collection of named,
//! typed quantities:
//!
//! - **scalar**: a real amount (`cpus:4`, `mem:2048`)
//! - **ranges**: disjoint integer intervals (`ports:[31000-32000]`)
//! - **set**: a finite set of labels (`disks:{sda1,sda2}`)
//!
//! Arithmetic is componentwise per (name, type). Bundles parse from and
//! print to the same textual form, so advertised resources roundtrip
//! through configuration.
//!
//! # Invariants
//!
//! - Addition is commutative and associative
//! - `r - r` is empty for every bundle `r`
//! - Subtraction of ranges and sets saturates at empty; scalar
//!   subtraction may go negative (the allocator's total pool relies on
//!   this during re-advertisement). Callers that must not underflow use
//!   [`Resources::checked_sub`].

mod error;
mod resources;
mod value;

pub use error::ResourceError;
pub use resources::{Resource, Resources};
pub use value::{Ranges, Value, ValueKind};
