//! Static role → permission policy.
//!
//! The original deployment knows three roles that touch the borrowing
//! subsystem: `admin` (full access), `sao` (staff running the stockroom),
//! and `student` (borrowers). Unknown roles get no permissions.

use crate::Permission;

// Inventory ledger surface.
pub const INVENTORY_READ: &str = "inventory.read";
pub const INVENTORY_MANAGE: &str = "inventory.manage";

// Borrow transaction surface.
pub const BORROWING_READ: &str = "borrowing.read";
pub const BORROWING_REQUEST: &str = "borrowing.request";
pub const BORROWING_REVIEW: &str = "borrowing.review";
pub const BORROWING_CANCEL_OWN: &str = "borrowing.cancel.own";
pub const BORROWING_CANCEL_ANY: &str = "borrowing.cancel.any";

/// Permissions granted to a role.
pub fn role_permissions(role: &str) -> Vec<Permission> {
    let grants: &[&'static str] = match role {
        "admin" => &["*"],
        "sao" => &[
            INVENTORY_READ,
            INVENTORY_MANAGE,
            BORROWING_READ,
            BORROWING_REVIEW,
            BORROWING_CANCEL_ANY,
        ],
        "student" => &[
            INVENTORY_READ,
            BORROWING_READ,
            BORROWING_REQUEST,
            BORROWING_CANCEL_OWN,
        ],
        _ => &[],
    };

    grants.iter().map(|p| Permission::new(*p)).collect()
}
