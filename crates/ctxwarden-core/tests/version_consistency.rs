//! Ensures all workspace crates use `version.workspace = true` and that
//! the internal path dependencies pin the workspace version.

use std::path::{Path, PathBuf};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .expect("crate lives two levels below the workspace root")
        .to_path_buf()
}

fn read_toml(path: &Path) -> toml::Value {
    let raw = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("cannot read {}: {e}", path.display()));
    raw.parse()
        .unwrap_or_else(|e| panic!("cannot parse {}: {e}", path.display()))
}

fn workspace_version() -> String {
    let doc = read_toml(&workspace_root().join("Cargo.toml"));
    doc["workspace"]["package"]["version"]
        .as_str()
        .unwrap()
        .to_string()
}

fn members() -> Vec<String> {
    let doc = read_toml(&workspace_root().join("Cargo.toml"));
    doc["workspace"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap().to_string())
        .collect()
}

#[test]
fn all_crates_use_workspace_version() {
    let members = members();
    assert!(members.len() >= 3);

    for member in &members {
        let doc = read_toml(&workspace_root().join(member).join("Cargo.toml"));
        let inherits = doc["package"]["version"]
            .as_table()
            .and_then(|t| t.get("workspace"))
            .and_then(|v| v.as_bool());
        assert_eq!(
            inherits,
            Some(true),
            "{member} should use version.workspace = true"
        );
    }
}

#[test]
fn internal_dependencies_pin_workspace_version() {
    let version = workspace_version();
    let doc = read_toml(&workspace_root().join("Cargo.toml"));
    let deps = doc["workspace"]["dependencies"].as_table().unwrap();

    for name in ["ctxwarden-core", "ctxwarden-state"] {
        let pinned = deps[name]["version"].as_str().unwrap();
        assert_eq!(pinned, version, "{name} pins {pinned}, workspace is {version}");
    }
}

#[test]
fn workspace_version_matches_cargo_pkg() {
    assert_eq!(workspace_version(), env!("CARGO_PKG_VERSION"));
    assert_eq!(ctxwarden_core::VERSION, env!("CARGO_PKG_VERSION"));
}
