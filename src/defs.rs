//! Service-definition file model.
//!
//! The launcher reads a YAML definitions file and registers the result
//! with the controller over the wire. The YAML shapes here are the
//! human-facing form; [`wire::messages`] is the registered form.

use crate::error::{Error, Result};
use crate::wire::messages as wire;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefs {
    #[serde(default)]
    pub services: Vec<ServiceDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDef {
    pub name: String,
    #[serde(default)]
    pub r#type: ServiceKind,
    pub launch: CommandDef,
    #[serde(default)]
    pub stop: Option<CommandDef>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub health_checks: Vec<HealthCheckDef>,
    #[serde(default)]
    pub version_files: Vec<String>,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    #[default]
    Daemon,
    Task,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandDef {
    pub cmd: String,
    /// Environment overrides; values may reference `$VAR` / `${VAR}`
    /// from the parent environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheckDef {
    Command { cmd: String },
    Http { url: String },
}

impl ServiceDefs {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "cannot read service definitions {}: {}",
                path.display(),
                e
            ))
        })?;
        let defs: ServiceDefs = serde_yaml::from_str(&raw)?;
        Ok(defs)
    }

    /// Convert to the registration request. `$VAR` references in
    /// environment overrides travel unexpanded; the daemon expands them
    /// against its own environment when it builds the command.
    pub fn to_create_batch(&self) -> wire::CreateBatchReq {
        wire::CreateBatchReq {
            services: self.services.iter().map(ServiceDef::to_wire).collect(),
        }
    }
}

impl ServiceDef {
    fn to_wire(&self) -> wire::Service {
        wire::Service {
            service_name: self.name.clone(),
            service_type: match self.r#type {
                ServiceKind::Daemon => wire::ServiceType::Daemon as i32,
                ServiceKind::Task => wire::ServiceType::Task as i32,
            },
            launch_cmd: Some(self.launch.to_wire()),
            stop_cmd: self.stop.as_ref().map(CommandDef::to_wire),
            dependencies: self.dependencies.clone(),
            health_checks: self
                .health_checks
                .iter()
                .map(|hc| match hc {
                    HealthCheckDef::Command { cmd } => wire::HealthCheck {
                        check_type: wire::HealthCheckType::Command as i32,
                        cmd: Some(wire::Command {
                            cmd: cmd.clone(),
                            env_vars: vec![],
                        }),
                        http_health_check: None,
                    },
                    HealthCheckDef::Http { url } => wire::HealthCheck {
                        check_type: wire::HealthCheckType::Http as i32,
                        cmd: None,
                        http_health_check: Some(wire::HttpHealthCheck { url: url.clone() }),
                    },
                })
                .collect(),
            version_files: self.version_files.clone(),
            owner: self.owner.clone(),
            verbose: self.verbose,
        }
    }
}

impl CommandDef {
    fn to_wire(&self) -> wire::Command {
        wire::Command {
            cmd: self.cmd.clone(),
            env_vars: self
                .env
                .iter()
                .map(|(key, value)| wire::EnvVar {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }
}

/// Expand `$VAR` and `${VAR}` references from the process environment.
/// Unknown variables expand to the empty string.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices();
    while let Some((idx, ch)) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        let rest = &input[idx + 1..];
        if let Some(stripped) = rest.strip_prefix('{') {
            if let Some(end) = stripped.find('}') {
                let name = &stripped[..end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                for _ in 0..name.chars().count() + 2 {
                    chars.next();
                }
                continue;
            }
        }
        // Bare references only accept [A-Za-z0-9_], so bytes == chars.
        let name_len = rest
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        if name_len == 0 {
            out.push('$');
            continue;
        }
        let name = &rest[..name_len];
        out.push_str(&std::env::var(name).unwrap_or_default());
        for _ in 0..name_len {
            chars.next();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_daemon() {
        let yaml = r#"
services:
  - name: echo
    launch:
      cmd: "echo_server --port 1234"
    health_checks:
      - type: command
        cmd: "echo_client --port 1234 ping"
"#;
        let defs: ServiceDefs = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(defs.services.len(), 1);
        let svc = &defs.services[0];
        assert_eq!(svc.name, "echo");
        assert_eq!(svc.r#type, ServiceKind::Daemon);
        assert_eq!(svc.health_checks.len(), 1);
    }

    #[test]
    fn parses_task_with_dependencies() {
        let yaml = r#"
services:
  - name: migrate
    type: task
    owner: storage
    launch: { cmd: "run_migrations" }
    dependencies: [db]
  - name: db
    launch: { cmd: "start_db" }
    version_files: [db/version]
"#;
        let defs: ServiceDefs = serde_yaml::from_str(yaml).unwrap();
        let migrate = &defs.services[0];
        assert_eq!(migrate.r#type, ServiceKind::Task);
        assert_eq!(migrate.dependencies, vec!["db".to_string()]);
        let batch = defs.to_create_batch();
        assert_eq!(batch.services[0].service_type, wire::ServiceType::Task as i32);
        assert_eq!(batch.services[1].version_files, vec!["db/version".to_string()]);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let yaml = r#"
services:
  - name: echo
    launch: { cmd: "true" }
    not_a_field: 1
"#;
        assert!(serde_yaml::from_str::<ServiceDefs>(yaml).is_err());
    }

    #[test]
    fn expand_env_handles_braced_and_bare_refs() {
        std::env::set_var("SVCCTL_TEST_EXPANSION", "value");
        assert_eq!(expand_env("x-$SVCCTL_TEST_EXPANSION-y"), "x-value-y");
        assert_eq!(expand_env("${SVCCTL_TEST_EXPANSION}"), "value");
        assert_eq!(expand_env("no refs"), "no refs");
        assert_eq!(expand_env("trailing $"), "trailing $");
        assert_eq!(expand_env("$SVCCTL_TEST_UNSET_VAR_XYZ"), "");
    }
}
