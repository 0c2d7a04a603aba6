//! Compiler from dbt manifests to policy drafts
//!
//! This crate turns the access annotations of a manifest into named
//! grant, filter and mask drafts, resolving declared owners along the way.

pub mod builder;
pub mod error;
pub mod owners;

pub use builder::{DraftBuild, PolicyDraftBuilder};
pub use error::{OwnerLookupFailure, OwnerResolutionError, ValidationError, ValidationErrors};
pub use owners::{OwnerResolver, ResolvedOwners};
