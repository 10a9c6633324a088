//! `stockroom-auth` — caller identity & role boundary.
//!
//! Authentication itself (sessions, credentials) is an external
//! collaborator: every service call receives a fully resolved [`Principal`]
//! and is trusted to be who it says it is. This crate only answers the
//! question "may this caller perform this action?" — pure policy, no IO,
//! decoupled from HTTP and storage.

pub mod authorize;
pub mod permissions;
pub mod policy;
pub mod principal;
pub mod roles;

pub use authorize::{AuthzError, authorize, authorize_with};
pub use permissions::Permission;
pub use policy::role_permissions;
pub use principal::Principal;
pub use roles::Role;
