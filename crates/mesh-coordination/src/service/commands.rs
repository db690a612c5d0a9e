//! # Command Executor
//!
//! Remote operations a peer may request: `update_config`, `change_role`
//! and `restart`. Every request gets exactly one `CommandResult`.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::domain::{CommandRequest, CommandResult, Role, RoleSet};
use crate::service::core::{NodeInner, SecurityNode};

pub const UPDATE_CONFIG: &str = "update_config";
pub const CHANGE_ROLE: &str = "change_role";
pub const RESTART: &str = "restart";

/// A parsed command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Partial config, deep-merged into the current one.
    UpdateConfig(Map<String, Value>),
    /// Replacement role set.
    ChangeRole(RoleSet),
    Restart,
}

impl Command {
    /// Parse a request, or return the failure to send back.
    pub fn parse(request: &CommandRequest) -> Result<Self, CommandResult> {
        match request.command.as_str() {
            UPDATE_CONFIG => match request.params.get("config") {
                Some(Value::Object(changes)) => Ok(Self::UpdateConfig(changes.clone())),
                Some(_) => Err(CommandResult::failed("config must be an object")),
                None => Err(CommandResult::failed("missing config")),
            },
            CHANGE_ROLE => {
                let names = match request.params.get("roles") {
                    Some(Value::Array(names)) => names,
                    Some(_) => return Err(CommandResult::failed("roles must be a list")),
                    None => return Err(CommandResult::failed("no roles supplied")),
                };
                if names.is_empty() {
                    return Err(CommandResult::failed("no roles supplied"));
                }
                let mut roles = RoleSet::new();
                for name in names {
                    let role = name
                        .as_str()
                        .and_then(|s| s.parse::<Role>().ok())
                        .ok_or_else(|| CommandResult::failed(format!("invalid role: {}", name)))?;
                    roles.insert(role);
                }
                Ok(Self::ChangeRole(roles))
            }
            RESTART => Ok(Self::Restart),
            _ => Err(CommandResult::failed("unknown command")),
        }
    }
}

impl NodeInner {
    pub(crate) fn execute_command(self: &Arc<Self>, request: &CommandRequest) -> CommandResult {
        let command = match Command::parse(request) {
            Ok(command) => command,
            Err(result) => {
                warn!(
                    node_id = %self.node_id,
                    command = %request.command,
                    reason = %result.message,
                    "rejected command"
                );
                return result;
            }
        };

        match command {
            Command::UpdateConfig(changes) => self.update_config(&changes),
            Command::ChangeRole(roles) => self.change_roles(roles),
            Command::Restart => self.schedule_restart(),
        }
    }

    fn update_config(&self, changes: &Map<String, Value>) -> CommandResult {
        let (before, after) = {
            let mut config = self.config.write();
            let updated = match config.merged_with(changes) {
                Ok(updated) => updated,
                Err(e) => return CommandResult::failed(e.to_string()),
            };
            let before = config.roles.clone();
            let after = updated.roles.clone();
            *config = updated;
            (before, after)
        };
        self.activate_roles(&before, &after);
        info!(node_id = %self.node_id, keys = changes.len(), "configuration updated");
        CommandResult::ok("configuration updated")
    }

    fn change_roles(&self, roles: RoleSet) -> CommandResult {
        let before = {
            let mut config = self.config.write();
            std::mem::replace(&mut config.roles, roles.clone())
        };
        self.activate_roles(&before, &roles);
        info!(node_id = %self.node_id, from = %before, to = %roles, "roles changed");
        CommandResult::ok(format!("roles changed to {}", roles))
    }

    /// Stop after `restart_delay` so the response goes out first, then
    /// start again after another `restart_delay`.
    fn schedule_restart(self: &Arc<Self>) -> CommandResult {
        let node = SecurityNode::from_inner(Arc::clone(self));
        let delay = self.timing().restart_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!(node_id = %node.node_id(), "restarting");
            if let Err(e) = node.stop().await {
                error!(node_id = %node.node_id(), error = %e, "restart: stop failed");
                return;
            }
            tokio::time::sleep(delay).await;
            if let Err(e) = node.start().await {
                error!(node_id = %node.node_id(), error = %e, "restart: start failed");
            }
        });
        CommandResult::ok("restart scheduled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(command: &str, params: Value) -> CommandRequest {
        CommandRequest::new(command, params.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_parse_change_role() {
        let parsed = Command::parse(&request(CHANGE_ROLE, json!({"roles": ["logger", "protector"]})));
        assert_eq!(
            parsed,
            Ok(Command::ChangeRole(RoleSet::from([Role::Logger, Role::Protector])))
        );
    }

    #[test]
    fn test_change_role_requires_roles() {
        let empty = Command::parse(&request(CHANGE_ROLE, json!({"roles": []}))).unwrap_err();
        assert!(!empty.success);
        assert_eq!(empty.message, "no roles supplied");

        let missing = Command::parse(&request(CHANGE_ROLE, json!({}))).unwrap_err();
        assert_eq!(missing.message, "no roles supplied");

        let bad = Command::parse(&request(CHANGE_ROLE, json!({"roles": ["janitor"]}))).unwrap_err();
        assert!(bad.message.contains("invalid role"));
    }

    #[test]
    fn test_update_config_needs_object() {
        let ok = Command::parse(&request(UPDATE_CONFIG, json!({"config": {"associated_devices": ["cam"]}})));
        assert!(matches!(ok, Ok(Command::UpdateConfig(_))));

        let bad = Command::parse(&request(UPDATE_CONFIG, json!({"config": 7}))).unwrap_err();
        assert!(!bad.success);
    }

    #[test]
    fn test_unknown_command() {
        let result = Command::parse(&request("self_destruct", json!({}))).unwrap_err();
        assert_eq!(result, CommandResult::failed("unknown command"));
        assert_eq!(Command::parse(&request(RESTART, json!({}))), Ok(Command::Restart));
    }
}
