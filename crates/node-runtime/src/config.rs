//! Configuration loading for the node binary.
//!
//! The file (first CLI argument or `SENTINEL_CONFIG`) is optional. The
//! `SENTINEL_*` variables are applied on top of it, roles are narrowed to
//! the ones this binary hosts, and the result is validated.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{info, warn};

use mesh_coordination::{NodeConfig, NodeId, NodeType, Role, RoleSet, TomlConfigLoader};

pub const CONFIG_PATH_VAR: &str = "SENTINEL_CONFIG";

/// Roles the binary has a collaborator for. Only the tracing alert logger
/// ships here; detectors and protection engines are wired by embedders of
/// `mesh-coordination`.
pub const HOSTED_ROLES: [Role; 1] = [Role::Logger];

/// Path of the config file, if one was given.
pub fn config_path(args: &[String], env: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    args.get(1)
        .cloned()
        .or_else(|| env(CONFIG_PATH_VAR))
        .map(PathBuf::from)
}

/// Load the file (or defaults), apply environment overrides and validate.
pub fn load_config(args: &[String], env: impl Fn(&str) -> Option<String>) -> Result<NodeConfig> {
    let mut config = match config_path(args, &env) {
        Some(path) => {
            info!(path = %path.display(), "loading configuration file");
            TomlConfigLoader::read(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
        }
        None => NodeConfig::default(),
    };

    apply_env_overrides(&mut config, &env)?;
    restrict_to_hosted_roles(&mut config);
    config.validate().context("invalid node configuration")?;
    Ok(config)
}

/// Drop roles the runtime cannot back, falling back to `logger` when none
/// remain.
pub fn restrict_to_hosted_roles(config: &mut NodeConfig) {
    let (hosted, dropped): (Vec<Role>, Vec<Role>) = config
        .roles
        .iter()
        .partition(|role| HOSTED_ROLES.contains(role));
    for role in dropped {
        warn!(role = %role, "no collaborator for role in node-runtime, dropping it");
    }
    config.roles = if hosted.is_empty() {
        RoleSet::from(HOSTED_ROLES)
    } else {
        hosted.into_iter().collect()
    };
}

/// Apply `SENTINEL_*` overrides. Unset variables leave the field alone.
pub fn apply_env_overrides(
    config: &mut NodeConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(id) = env("SENTINEL_NODE_ID") {
        config.node_id = Some(NodeId::new(id));
    }
    if let Some(kind) = env("SENTINEL_NODE_TYPE") {
        config.node_type = kind
            .parse::<NodeType>()
            .context("SENTINEL_NODE_TYPE must be coordinator or worker")?;
    }
    if let Some(roles) = env("SENTINEL_ROLES") {
        config.roles = RoleSet::parse_list(&roles).context("SENTINEL_ROLES")?;
    }
    if let Some(host) = env("SENTINEL_HOST") {
        config.network.host = host;
    }
    if let Some(port) = env("SENTINEL_PORT") {
        config.network.port = port.parse().context("SENTINEL_PORT must be a port number")?;
    }
    if let Some(port) = env("SENTINEL_DISCOVERY_PORT") {
        config.network.discovery_port = port
            .parse()
            .context("SENTINEL_DISCOVERY_PORT must be a port number")?;
    }
    if let Some(coordinator) = env("SENTINEL_COORDINATOR") {
        config.network.coordinator = Some(coordinator);
    }
    Ok(())
}
