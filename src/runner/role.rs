//! Role definitions — named, versioned prompt templates.
//!
//! Built-in roles are embedded at compile time; a `roles/` directory under
//! the config dir may add or override definitions.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::AskType;
use crate::error::RunnerError;

/// Per-role limits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleLimits {
    pub max_tokens: Option<u32>,
    pub timeout_s: Option<u64>,
}

/// A role definition loaded from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleDefinition {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub purpose: String,
    pub system_prompt: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub tool_whitelist: Vec<String>,
    #[serde(default)]
    pub limits: RoleLimits,
    #[serde(default)]
    pub guardrails: Vec<String>,
}

/// Built-in role sources, embedded from `roles/`.
static BUILTIN_ROLES: &[(&str, &str)] = &[
    ("clarifier.yaml", include_str!("../../roles/clarifier.yaml")),
    ("finder.yaml", include_str!("../../roles/finder.yaml")),
    (
        "policy_decider.yaml",
        include_str!("../../roles/policy_decider.yaml"),
    ),
];

/// Default role per ask type.
fn default_role_id(ask_type: AskType) -> &'static str {
    match ask_type {
        AskType::Clarification | AskType::Choice => "role.clarifier",
        AskType::ResourceFetch => "role.finder",
        AskType::PolicyDecision | AskType::Approval => "role.policy_decider",
    }
}

/// In-memory library of role definitions keyed by id.
pub struct RoleLibrary {
    roles: HashMap<String, RoleDefinition>,
}

impl RoleLibrary {
    /// Load built-ins, then any overrides from `<config_dir>/roles/*.yaml`.
    pub fn load(config_dir: Option<&Path>) -> Result<Self, RunnerError> {
        let mut roles = HashMap::new();

        for (name, source) in BUILTIN_ROLES {
            let role: RoleDefinition =
                serde_yaml::from_str(source).map_err(|e| RunnerError::RoleParse {
                    path: format!("builtin:{name}"),
                    message: e.to_string(),
                })?;
            roles.insert(role.id.clone(), role);
        }

        if let Some(dir) = config_dir {
            let roles_dir = dir.join("roles");
            if roles_dir.is_dir() {
                for entry in std::fs::read_dir(&roles_dir)
                    .map_err(|e| RunnerError::RoleParse {
                        path: roles_dir.display().to_string(),
                        message: e.to_string(),
                    })?
                    .flatten()
                {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                        continue;
                    }
                    match std::fs::read_to_string(&path) {
                        Ok(source) => match serde_yaml::from_str::<RoleDefinition>(&source) {
                            Ok(role) => {
                                debug!(role_id = %role.id, path = %path.display(), "Role loaded");
                                roles.insert(role.id.clone(), role);
                            }
                            Err(e) => {
                                return Err(RunnerError::RoleParse {
                                    path: path.display().to_string(),
                                    message: e.to_string(),
                                })
                            }
                        },
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Role file unreadable");
                        }
                    }
                }
            }
        }

        Ok(Self { roles })
    }

    /// Resolve a role: an explicit id must exist; otherwise the ask type's
    /// default applies (which may itself be absent if overridden away).
    pub fn resolve(
        &self,
        explicit: Option<&str>,
        ask_type: AskType,
    ) -> Result<&RoleDefinition, RunnerError> {
        match explicit {
            Some(id) => self.roles.get(id).ok_or_else(|| RunnerError::RoleNotFound {
                role_id: id.to_string(),
            }),
            None => {
                let id = default_role_id(ask_type);
                self.roles.get(id).ok_or_else(|| RunnerError::RoleNotFound {
                    role_id: id.to_string(),
                })
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&RoleDefinition> {
        self.roles.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_parse_and_load() {
        let library = RoleLibrary::load(None).unwrap();
        for id in ["role.clarifier", "role.finder", "role.policy_decider"] {
            let role = library.get(id).unwrap_or_else(|| panic!("missing {id}"));
            assert!(!role.system_prompt.is_empty());
            assert_eq!(role.version, "1.0.0");
        }
    }

    #[test]
    fn default_role_table() {
        let library = RoleLibrary::load(None).unwrap();
        assert_eq!(
            library.resolve(None, AskType::Clarification).unwrap().id,
            "role.clarifier"
        );
        assert_eq!(
            library.resolve(None, AskType::Choice).unwrap().id,
            "role.clarifier"
        );
        assert_eq!(
            library.resolve(None, AskType::ResourceFetch).unwrap().id,
            "role.finder"
        );
        assert_eq!(
            library.resolve(None, AskType::PolicyDecision).unwrap().id,
            "role.policy_decider"
        );
        assert_eq!(
            library.resolve(None, AskType::Approval).unwrap().id,
            "role.policy_decider"
        );
    }

    #[test]
    fn explicit_unknown_role_is_an_error() {
        let library = RoleLibrary::load(None).unwrap();
        let err = library
            .resolve(Some("role.nonexistent"), AskType::Clarification)
            .unwrap_err();
        assert!(matches!(err, RunnerError::RoleNotFound { .. }));
    }

    #[test]
    fn config_dir_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let roles_dir = dir.path().join("roles");
        std::fs::create_dir_all(&roles_dir).unwrap();
        std::fs::write(
            roles_dir.join("custom.yaml"),
            "id: role.clarifier\nversion: \"2.0.0\"\nsystem_prompt: overridden\n",
        )
        .unwrap();

        let library = RoleLibrary::load(Some(dir.path())).unwrap();
        let role = library.get("role.clarifier").unwrap();
        assert_eq!(role.version, "2.0.0");
        assert_eq!(role.system_prompt.trim(), "overridden");
    }

    #[test]
    fn malformed_role_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let roles_dir = dir.path().join("roles");
        std::fs::create_dir_all(&roles_dir).unwrap();
        std::fs::write(roles_dir.join("bad.yaml"), "id: [not, a, string").unwrap();

        assert!(RoleLibrary::load(Some(dir.path())).is_err());
    }
}
