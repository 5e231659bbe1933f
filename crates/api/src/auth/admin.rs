//! Operator privileges

use retouch_billing::UserProfile;
use serde_json::Value;

const ADMIN_ROLES: [&str; 3] = ["admin", "owner", "superuser"];

fn is_admin_role(role: &str) -> bool {
    ADMIN_ROLES.contains(&role.to_lowercase().as_str())
}

/// Whether `profile` may perform operator actions such as granting credits.
///
/// Only `app_metadata.roles` and the configured admin email list count. Users
/// can write their own `user_metadata`, so nothing in it grants privileges.
pub fn is_admin_user(profile: &UserProfile, admin_emails: &[String]) -> bool {
    match profile.app_metadata.get("roles") {
        Some(Value::Array(roles)) if roles.iter().filter_map(Value::as_str).any(is_admin_role) => {
            return true;
        }
        Some(Value::String(role)) if is_admin_role(role) => return true,
        _ => {}
    }

    profile
        .email
        .as_deref()
        .is_some_and(|email| admin_emails.contains(&email.to_lowercase()))
}
