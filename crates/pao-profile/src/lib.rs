//! PerformanceProfile handling
//!
//! - [`conversion`]: the version gate. Every served version converts to and
//!   from the canonical `v2` form, with defaulting and validation.
//! - [`components`]: renders the objects a profile owns.
//! - [`controller`]: leader-gated reconciliation of profiles into children
//!   and status.

#![deny(missing_docs)]

pub mod components;
pub mod controller;
pub mod conversion;
pub mod cpuset;

pub use components::{manifests, render, Child, ChildKey, ChildKind, DesiredChildren};
pub use controller::{error_policy, reconcile, Context, ContextBuilder, ControllerMetrics};
pub use conversion::{canonicalize, convert, normalize, validate, SourceVersion, VersionRegistry};
pub use cpuset::CpuSet;
