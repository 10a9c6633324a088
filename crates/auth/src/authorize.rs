use std::collections::HashSet;

use thiserror::Error;

use crate::{Permission, Principal, policy};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Authorize a principal against the default role policy.
///
/// - No IO
/// - No panics
/// - No business logic (pure policy check)
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    authorize_with(principal, required, policy::role_permissions)
}

/// Authorize a principal with an explicit role → permission mapping.
///
/// The effective permission set is the union of every role's grants; a
/// wildcard grant (`"*"`) allows everything.
pub fn authorize_with<F>(
    principal: &Principal,
    required: &Permission,
    role_permissions: F,
) -> Result<(), AuthzError>
where
    F: Fn(&str) -> Vec<Permission>,
{
    let mut effective: HashSet<Permission> = HashSet::new();
    for role in &principal.roles {
        effective.extend(role_permissions(role.as_str()));
    }

    if effective.iter().any(|p| p.is_wildcard()) || effective.contains(required) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}
