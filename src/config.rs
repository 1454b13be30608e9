//! Startup configuration: the YAML policy document describing the bastion's
//! global options, backend servers, groups, ACLs and users.
//!
//! The document is loaded exactly once, resolved (group files merged, ACLs
//! expanded, `file:` references inlined, private keys parsed) and handed to
//! the server as an immutable [`Config`] behind an `Arc`. Nothing mutates it
//! afterwards.

use crate::BoxError;
use derive_more::Display;
use russh::keys::PrivateKey;
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

/// The error type returned when loading or resolving the configuration.
/// Always fatal at startup.
#[derive(Debug, Error)]
#[error("config error: {kind}")]
pub struct ConfigError {
    kind: ConfigErrorKind,
    #[source]
    source: Option<BoxError>,
}

/// Categories of configuration failures, each naming the offending file or
/// field so the operator can fix the document without spelunking.
#[derive(Debug, Display, Eq, PartialEq)]
pub enum ConfigErrorKind {
    /// A referenced file could not be read.
    #[display("Failed to open {}", path)]
    FileRead {
        /// Path of the unreadable file.
        path: String,
    },
    /// A YAML document failed to parse.
    #[display("Unable to parse YAML document {}", path)]
    Yaml {
        /// Path of the malformed document.
        path: String,
    },
    /// A bastion private key could not be decoded.
    #[display("Unable to load key {}", name)]
    Key {
        /// The key reference as written in the document.
        name: String,
    },
    /// A `file:` reference was syntactically invalid.
    #[display("Bad key description {}", name)]
    KeyRef {
        /// The offending value.
        name: String,
    },
    /// The configured `auth_type` is not provided by this build.
    #[display("Unsupported auth_type {:?}", value)]
    AuthType {
        /// The rejected value.
        value: String,
    },
}

impl ConfigError {
    fn new(kind: ConfigErrorKind) -> Self {
        ConfigError { kind, source: None }
    }

    fn with_source(kind: ConfigErrorKind, source: impl Into<BoxError>) -> Self {
        ConfigError {
            kind,
            source: Some(source.into()),
        }
    }

    /// Return the inner error kind.
    pub fn kind(&self) -> &ConfigErrorKind {
        &self.kind
    }
}

/// Global bastion options, the `global:` mapping of the root document.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalOptions {
    /// Directory holding one `<group>.yaml` server map per group name.
    #[serde(default)]
    pub group_path: PathBuf,
    /// Message-of-the-day file served before target selection.
    #[serde(default)]
    pub motd_path: Option<PathBuf>,
    /// Root of the per-session audit file tree.
    pub log_path: PathBuf,
    /// Root of the per-user staging directories.
    pub storage_path: PathBuf,
    /// Bastion host/client private keys, inline or `file:` references.
    #[serde(default)]
    pub bastion_private_keys: Vec<String>,
    /// Offer the bastion keys as public-key auth towards targets.
    #[serde(default)]
    pub auth_with_bastion_keys: bool,
    /// Accept any target host key instead of checking the allow-list.
    #[serde(default)]
    pub ignore_hosts_pubkeys: bool,
    /// Honor `auth-agent-req@openssh.com` from inbound clients.
    #[serde(default)]
    pub allow_agent_forwarding: bool,
    /// Credential verification backend. Only `local` ships in this build;
    /// other providers plug in behind the `Authenticator` trait.
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
    /// Replay the inbound password towards the target instead of prompting.
    #[serde(default)]
    pub pass_password: bool,
    /// Listen endpoint, `host:port`.
    pub listen_path: String,
    /// Force an IPv4 listener.
    #[serde(default)]
    pub disable_ipv6_bind: bool,
    /// Target dial timeout, e.g. `45s`. Invalid values fall back to 30s.
    #[serde(default)]
    pub connect_timeout: Option<String>,
    /// Remote audit collector URL. When set, session text and request
    /// records are POSTed there instead of written to disk.
    #[serde(default)]
    pub audit_collector: Option<String>,
}

fn default_auth_type() -> String {
    "local".to_string()
}

/// A backend host users can be relayed to.
#[derive(Debug, Clone, Deserialize)]
pub struct Remote {
    /// Accepted host public keys, authorized-key lines or `file:` references.
    /// Trust-on-config: anything else fails the dial.
    #[serde(default)]
    pub host_pubkeys: Vec<String>,
    /// Dial address, `host:port`.
    pub connect_path: String,
    /// Override for the login name; defaults to the inbound username.
    #[serde(default)]
    pub login_user: Option<String>,
    /// The group file this entry came from, if any.
    #[serde(skip)]
    pub group: Option<String>,
}

/// A named access-control list. After [`Config::load`] the group references
/// are folded away and `allow_servers` is the complete flat list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Acl {
    /// Explicitly allowed server names.
    #[serde(default)]
    pub allow_servers: Vec<String>,
    /// Groups whose members are allowed wholesale.
    #[serde(default)]
    pub allow_groups: Vec<String>,
}

/// A principal allowed to log in to the bastion.
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    /// Name of the ACL governing this user's targets.
    pub acl: String,
    /// Inline authorized-key line.
    #[serde(default)]
    pub authorized_key: Option<String>,
    /// Path to an authorized-keys file, checked line by line.
    #[serde(default)]
    pub authorized_keys_file: Option<PathBuf>,
    /// Plaintext password for the local authenticator.
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    global: GlobalOptions,
    #[serde(default)]
    servers: HashMap<String, Remote>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    acls: HashMap<String, Acl>,
    #[serde(default)]
    users: HashMap<String, User>,
}

/// The fully resolved policy handed to the server.
#[derive(Debug)]
pub struct Config {
    /// Global options.
    pub global: GlobalOptions,
    /// All known backend servers, root document and group files merged.
    pub servers: HashMap<String, Remote>,
    /// ACLs with group membership expanded into `allow_servers`.
    pub acls: HashMap<String, Acl>,
    /// The user table.
    pub users: HashMap<String, User>,
    /// Parsed bastion private keys, used as host keys for the inbound side
    /// and optionally for public-key auth towards targets.
    pub host_keys: Vec<PrivateKey>,
}

impl Config {
    /// Load and resolve the configuration from `path`.
    ///
    /// Synchronous on purpose: this runs once in `main` before the runtime
    /// services any connection.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = read_file(path)?;
        let raw: RawConfig = serde_yaml::from_str(&text).map_err(|e| {
            ConfigError::with_source(
                ConfigErrorKind::Yaml {
                    path: path.display().to_string(),
                },
                e,
            )
        })?;

        let RawConfig {
            global,
            mut servers,
            groups,
            mut acls,
            users,
        } = raw;

        if global.auth_type != "local" {
            return Err(ConfigError::new(ConfigErrorKind::AuthType {
                value: global.auth_type.clone(),
            }));
        }

        let mut host_keys = Vec::with_capacity(global.bastion_private_keys.len());
        for key_ref in &global.bastion_private_keys {
            let material = load_value(key_ref)?;
            let key = russh::keys::decode_secret_key(&material, None).map_err(|e| {
                ConfigError::with_source(ConfigErrorKind::Key { name: key_ref.clone() }, e)
            })?;
            host_keys.push(key);
        }

        for group in &groups {
            let group_file = global.group_path.join(format!("{group}.yaml"));
            let text = read_file(&group_file)?;
            let members: HashMap<String, Remote> = serde_yaml::from_str(&text).map_err(|e| {
                ConfigError::with_source(
                    ConfigErrorKind::Yaml {
                        path: group_file.display().to_string(),
                    },
                    e,
                )
            })?;
            for (name, mut remote) in members {
                remote.group = Some(group.clone());
                for acl in acls.values_mut() {
                    if acl.allow_groups.iter().any(|g| g == group) && !acl.allow_servers.contains(&name) {
                        acl.allow_servers.push(name.clone());
                    }
                }
                servers.insert(name, remote);
            }
        }

        for remote in servers.values_mut() {
            for key in remote.host_pubkeys.iter_mut() {
                *key = load_value(key)?;
            }
        }

        Ok(Config {
            global,
            servers,
            acls,
            users,
            host_keys,
        })
    }

    /// The staging directory backing `username`'s chroot and transfer buffer.
    pub fn user_staging(&self, username: &str) -> PathBuf {
        self.global.storage_path.join(username)
    }

    /// The configured target dial timeout. `Err` carries the raw string when
    /// it does not parse; callers log it and fall back to 30 seconds.
    pub fn connect_timeout(&self) -> Result<Duration, &str> {
        match self.global.connect_timeout.as_deref() {
            None | Some("") => Ok(DEFAULT_CONNECT_TIMEOUT),
            Some(raw) => parse_duration(raw).ok_or(raw),
        }
    }
}

/// Fallback dial timeout when none is configured or the value is invalid.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| {
        ConfigError::with_source(
            ConfigErrorKind::FileRead {
                path: path.display().to_string(),
            },
            e,
        )
    })
}

// Resolves the `file:` indirection: a value of the form `file:<path>` is
// replaced by the contents of <path>; anything else passes through verbatim.
fn load_value(value: &str) -> Result<String, ConfigError> {
    match value.strip_prefix("file:") {
        None => Ok(value.to_string()),
        Some("") => Err(ConfigError::new(ConfigErrorKind::KeyRef {
            name: value.to_string(),
        })),
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            ConfigError::with_source(ConfigErrorKind::Key { name: value.to_string() }, e)
        }),
    }
}

// Duration strings in the `time.ParseDuration` tradition: a decimal number
// with a unit of ms, s, m or h. A bare number means seconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = digits.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
global:
  log_path: /var/log/bastion
  storage_path: /var/lib/bastion/staging
  listen_path: "0.0.0.0:2222"
acls:
  admins:
    allow_servers: [web1]
    allow_groups: [edge]
users:
  alice:
    acl: admins
servers:
  web1:
    connect_path: "10.0.0.10:22"
"#;

    #[test]
    fn minimal_document_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.users["alice"].acl, "admins");
        assert_eq!(config.user_staging("alice"), PathBuf::from("/var/lib/bastion/staging/alice"));
    }

    #[test]
    fn group_members_union_into_acls() {
        let dir = tempfile::tempdir().unwrap();
        let groups = dir.path().join("groups");
        std::fs::create_dir_all(&groups).unwrap();
        std::fs::write(
            groups.join("edge.yaml"),
            "edge1:\n  connect_path: \"10.0.1.1:22\"\nedge2:\n  connect_path: \"10.0.1.2:22\"\n",
        )
        .unwrap();
        let doc = format!(
            r#"
global:
  log_path: /tmp/log
  storage_path: /tmp/staging
  listen_path: "0.0.0.0:2222"
  group_path: {}
groups: [edge]
acls:
  admins:
    allow_servers: [web1]
    allow_groups: [edge]
  viewers:
    allow_servers: []
servers:
  web1:
    connect_path: "10.0.0.10:22"
users: {{}}
"#,
            groups.display()
        );
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, doc).unwrap();

        let config = Config::load(&path).unwrap();
        // Every server declared in group `edge` lands in every ACL that
        // allows the group, and nowhere else.
        let admins = &config.acls["admins"].allow_servers;
        assert!(admins.contains(&"web1".to_string()));
        assert!(admins.contains(&"edge1".to_string()));
        assert!(admins.contains(&"edge2".to_string()));
        assert!(config.acls["viewers"].allow_servers.is_empty());
        assert_eq!(config.servers["edge1"].group.as_deref(), Some("edge"));
    }

    #[test]
    fn file_indirection_inlines_contents() {
        let dir = tempfile::tempdir().unwrap();
        let keyfile = dir.path().join("web1.pub");
        std::fs::write(&keyfile, "ssh-ed25519 AAAATESTKEY web1\n").unwrap();
        let doc = format!(
            r#"
global:
  log_path: /tmp/log
  storage_path: /tmp/staging
  listen_path: "0.0.0.0:2222"
servers:
  web1:
    connect_path: "10.0.0.10:22"
    host_pubkeys: ["file:{}"]
"#,
            keyfile.display()
        );
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, doc).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.servers["web1"].host_pubkeys[0], "ssh-ed25519 AAAATESTKEY web1\n");
    }

    #[test]
    fn missing_group_file_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let doc = format!(
            r#"
global:
  log_path: /tmp/log
  storage_path: /tmp/staging
  listen_path: "0.0.0.0:2222"
  group_path: {}
groups: [absent]
"#,
            dir.path().display()
        );
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, doc).unwrap();

        let err = Config::load(&path).unwrap_err();
        match err.kind() {
            ConfigErrorKind::FileRead { path } => assert!(path.ends_with("absent.yaml")),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn unsupported_auth_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let doc = r#"
global:
  log_path: /tmp/log
  storage_path: /tmp/staging
  listen_path: "0.0.0.0:2222"
  auth_type: ldap
"#;
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, doc).unwrap();
        let err = Config::load(&path).unwrap_err();
        assert_eq!(
            err.kind(),
            &ConfigErrorKind::AuthType { value: "ldap".to_string() }
        );
    }

    #[test]
    fn duration_strings() {
        assert_eq!(parse_duration("45s"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("10 s"), None);
    }
}
