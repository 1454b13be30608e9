//! End-to-end configuration loading against a realistic on-disk tree:
//! root document, group files, `file:` indirections and the ACL expansion
//! that has to hold before any session is served.

use bastiond::config::{Config, ConfigErrorKind};
use std::path::Path;

fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn load_tree(root: &Path) -> Config {
    write(
        &root.join("groups/edge.yaml"),
        r#"
edge1:
  connect_path: "10.1.0.1:22"
  host_pubkeys: ["ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIEDGE1 edge1"]
edge2:
  connect_path: "10.1.0.2:22"
"#,
    );
    write(
        &root.join("groups/db.yaml"),
        r#"
db1:
  connect_path: "10.2.0.1:5432"
  login_user: postgres
"#,
    );
    write(&root.join("keys/web1.pub"), "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIWEB1 web1\n");
    write(
        &root.join("config.yaml"),
        &format!(
            r#"
global:
  group_path: {root}/groups
  log_path: {root}/log
  storage_path: {root}/staging
  listen_path: "127.0.0.1:2222"
  disable_ipv6_bind: true
  connect_timeout: 45s
groups: [edge, db]
servers:
  web1:
    connect_path: "10.0.0.1:22"
    host_pubkeys: ["file:{root}/keys/web1.pub"]
acls:
  admins:
    allow_servers: [web1]
    allow_groups: [edge, db]
  web-only:
    allow_servers: [web1]
  edge-operators:
    allow_groups: [edge]
users:
  alice:
    acl: admins
    authorized_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIALICE alice@laptop"
  bob:
    acl: missing
    password: hunter2
"#,
            root = root.display()
        ),
    );
    Config::load(root.join("config.yaml")).unwrap()
}

#[test]
fn acl_expansion_holds_for_every_group_member() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_tree(dir.path());

    // Every server declared in a group is unioned into every ACL allowing
    // that group.
    for (acl_name, groups, expected) in [
        ("admins", vec!["edge", "db"], vec!["web1", "edge1", "edge2", "db1"]),
        ("web-only", vec![], vec!["web1"]),
        ("edge-operators", vec!["edge"], vec!["edge1", "edge2"]),
    ] {
        let acl = &config.acls[acl_name];
        for server in &expected {
            assert!(
                acl.allow_servers.iter().any(|s| s == server),
                "{acl_name} should allow {server}"
            );
        }
        for (name, remote) in &config.servers {
            let in_allowed_group = remote.group.as_deref().is_some_and(|g| groups.contains(&g));
            let explicitly_allowed = expected.contains(&name.as_str());
            assert_eq!(
                acl.allow_servers.contains(name),
                in_allowed_group || explicitly_allowed,
                "{acl_name} / {name}"
            );
        }
    }
}

#[test]
fn group_servers_carry_their_group_and_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_tree(dir.path());

    assert_eq!(config.servers["edge1"].group.as_deref(), Some("edge"));
    assert_eq!(config.servers["db1"].login_user.as_deref(), Some("postgres"));
    assert_eq!(config.servers["web1"].group, None);
    assert_eq!(config.connect_timeout().unwrap(), std::time::Duration::from_secs(45));
}

#[test]
fn file_references_are_inlined_at_load() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_tree(dir.path());

    assert_eq!(
        config.servers["web1"].host_pubkeys[0],
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIWEB1 web1\n"
    );
    // Inline values pass through untouched.
    assert!(config.servers["edge1"].host_pubkeys[0].starts_with("ssh-ed25519 "));
}

#[test]
fn broken_file_reference_is_fatal_and_names_the_reference() {
    let dir = tempfile::tempdir().unwrap();
    write(
        &dir.path().join("config.yaml"),
        r#"
global:
  log_path: /tmp/log
  storage_path: /tmp/staging
  listen_path: "127.0.0.1:2222"
servers:
  web1:
    connect_path: "10.0.0.1:22"
    host_pubkeys: ["file:/nonexistent/key.pub"]
"#,
    );
    let err = Config::load(dir.path().join("config.yaml")).unwrap_err();
    match err.kind() {
        ConfigErrorKind::Key { name } => assert_eq!(name, "file:/nonexistent/key.pub"),
        other => panic!("unexpected kind: {other:?}"),
    }
}
