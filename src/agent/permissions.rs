//! Tool permissions by user group.
//!
//! Consulted before every tool dispatch. A denial is reported to the
//! stream as a structured error and to the LLM as a tool error; the
//! agent loop continues either way.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::knowledge::UserGroup;

/// Per-group permission entry.
#[derive(Debug, Clone)]
struct GroupPermissions {
    /// Allowed tool names; "*" allows everything.
    allowed: Vec<String>,
    /// Explicitly denied tool names; checked first.
    restricted: Vec<String>,
}

/// Manager of per-group tool permissions.
pub struct ToolPermissionManager {
    permissions: RwLock<HashMap<UserGroup, GroupPermissions>>,
}

impl ToolPermissionManager {
    /// Create a manager with the default policy: admin gets everything,
    /// everyone else gets the two analysis tools.
    pub fn new() -> Self {
        let mut permissions = HashMap::new();
        permissions.insert(
            UserGroup::Admin,
            GroupPermissions {
                allowed: vec!["*".to_string()],
                restricted: Vec::new(),
            },
        );
        for group in [UserGroup::Expert, UserGroup::User, UserGroup::Guest] {
            permissions.insert(
                group,
                GroupPermissions {
                    allowed: vec!["run_sql".to_string(), "visualize_data".to_string()],
                    restricted: Vec::new(),
                },
            );
        }
        Self {
            permissions: RwLock::new(permissions),
        }
    }

    /// Check whether a group may use a tool.
    pub fn check(&self, group: UserGroup, tool_name: &str) -> Result<(), String> {
        let permissions = self.permissions.read();
        let entry = permissions
            .get(&group)
            .or_else(|| permissions.get(&UserGroup::User));

        let Some(entry) = entry else {
            return Err(format!("no permissions configured for group {:?}", group));
        };

        if entry.restricted.iter().any(|t| t == tool_name) {
            return Err(format!(
                "tool '{}' is restricted for group {}",
                tool_name,
                group.as_str()
            ));
        }
        if entry.allowed.iter().any(|t| t == "*" || t == tool_name) {
            return Ok(());
        }
        Err(format!(
            "tool '{}' is not allowed for group {}",
            tool_name,
            group.as_str()
        ))
    }

    /// Replace a group's permission entry.
    pub fn set_group(&self, group: UserGroup, allowed: Vec<String>, restricted: Vec<String>) {
        let mut permissions = self.permissions.write();
        permissions.insert(group, GroupPermissions { allowed, restricted });
    }
}

impl Default for ToolPermissionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_gets_everything() {
        let manager = ToolPermissionManager::new();
        assert!(manager.check(UserGroup::Admin, "run_sql").is_ok());
        assert!(manager.check(UserGroup::Admin, "anything_else").is_ok());
    }

    #[test]
    fn test_default_groups_get_analysis_tools_only() {
        let manager = ToolPermissionManager::new();
        for group in [UserGroup::Expert, UserGroup::User, UserGroup::Guest] {
            assert!(manager.check(group, "run_sql").is_ok());
            assert!(manager.check(group, "visualize_data").is_ok());
            assert!(manager.check(group, "delete_everything").is_err());
        }
    }

    #[test]
    fn test_restricted_overrides_allowed() {
        let manager = ToolPermissionManager::new();
        manager.set_group(
            UserGroup::Guest,
            vec!["*".to_string()],
            vec!["run_sql".to_string()],
        );
        assert!(manager.check(UserGroup::Guest, "run_sql").is_err());
        assert!(manager.check(UserGroup::Guest, "visualize_data").is_ok());
    }
}
