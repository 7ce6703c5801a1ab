use relay_core::error::{RelayError, Result};
use relay_core::session::Role;

use crate::registry::Connection;

/// Capability guards evaluated before a frame handler runs.
///
/// Plain predicates composed at the call site; there is no middleware chain.

/// The connection must have an attached identity.
pub fn requires_auth(conn: &Connection) -> Result<()> {
    if conn.is_authenticated() {
        Ok(())
    } else {
        Err(RelayError::ChannelAccessDenied(
            "authentication required".to_string(),
        ))
    }
}

/// The connection's role must be at or above `role`.
pub fn requires_role(conn: &Connection, role: Role) -> Result<()> {
    if conn.role() >= role {
        Ok(())
    } else {
        Err(RelayError::AuthorizationFailed(format!(
            "requires role {}",
            role
        )))
    }
}

/// The attached identity must carry `permission`.
pub fn requires_permission(conn: &Connection, permission: &str) -> Result<()> {
    if conn.has_permission(permission) {
        Ok(())
    } else {
        Err(RelayError::AuthorizationFailed(format!(
            "requires permission {}",
            permission
        )))
    }
}
