//! Shared types for the inventory deduction service.
//!
//! Everything that crosses a crate boundary lives here: typed identifiers,
//! the per-request context that carries correlation headers and cancellation,
//! and the error-kind taxonomy every crate classifies its failures into.

pub mod context;
pub mod error;
pub mod ids;
pub mod metadata;

pub use context::{BranchOp, Interrupted, RequestContext, SagaBranch};
pub use error::{ErrorClassification, ErrorKind};
pub use ids::{OrderId, ProductId, VariantId};
pub use metadata::{Metadata, headers};
