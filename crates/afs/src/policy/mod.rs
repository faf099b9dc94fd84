//! Access policy for mounted modules.
//!
//! A policy is checked before a call reaches a module. It enforces
//! pre-configured rules and never prompts; a denied call fails with
//! [`AfsError::PermissionDenied`](crate::AfsError::PermissionDenied).
//!
//! ```rust,ignore
//! use afs::policy::{GuardedModule, PolicyBuilder};
//!
//! let policy = PolicyBuilder::new()
//!     .allow_read("/**")
//!     .allow_write("/scratch/**")
//!     .build();
//! let guarded = GuardedModule::new(Arc::new(module), Arc::new(policy));
//! ```

mod guard;
mod handler;

pub use guard::GuardedModule;
pub use handler::{
    AllowAllPolicy, DenyAllPolicy, Operation, Policy, PolicyBuilder, PolicyDecision,
    PolicyHandler, ReadOnlyPolicy,
};
