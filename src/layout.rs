//! On-disk layout conventions shared by every binary: directory/file
//! names under a service directory, the `active`/`all` split under a
//! base directory, and the permission bits each entry is created with.

use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;

pub const DEFAULT_BASE: &str = "/services";
pub const ENV_SRVCTL_BASE: &str = "SRVCTL_BASE";

pub const DIR_ACTIVE: &str = "active";
pub const DIR_ALL: &str = "all";
pub const DIR_MONITOR: &str = "monitor";
pub const DIR_TAINLOG: &str = "tainlog";

pub const FILE_RUN: &str = "run";
pub const FILE_LOG: &str = "log";
pub const FILE_PRIORITY: &str = "priority";
pub const FILE_LOCK: &str = "monitor/lock";
pub const FILE_STATUS: &str = "monitor/status";
pub const FILE_UP: &str = "monitor/up";
pub const PIPE_CONTROL: &str = "monitor/control";
pub const PIPE_STDIN: &str = "monitor/stdin";
pub const FILE_CURRENT: &str = "current";

/// Longest active-link name the scanner will create verbatim; longer
/// names are truncated with a trailing `...` marker, matching the
/// original's `VALUE_NAME_LEN`.
pub const VALUE_NAME_LEN: usize = 80;

/// drwxr-xr-x
pub fn mode_dir_active() -> Mode {
    Mode::from_bits_truncate(0o755)
}

/// drwxr-x---
pub fn mode_dir_private() -> Mode {
    Mode::from_bits_truncate(0o750)
}

/// -rw-r-----
pub fn mode_file_shared_read() -> Mode {
    Mode::from_bits_truncate(0o640)
}

/// -rw-------
pub fn mode_file_private() -> Mode {
    Mode::from_bits_truncate(0o600)
}

/// Resolves the base directory from an explicit flag, falling back to
/// `SRVCTL_BASE`, falling back to `DEFAULT_BASE`.
pub fn resolve_base(flag: Option<&str>) -> PathBuf {
    if let Some(b) = flag {
        return PathBuf::from(b);
    }
    if let Ok(b) = std::env::var(ENV_SRVCTL_BASE) {
        return PathBuf::from(b);
    }
    PathBuf::from(DEFAULT_BASE)
}

pub fn active_dir(base: &Path) -> PathBuf {
    base.join(DIR_ACTIVE)
}

pub fn all_dir(base: &Path) -> PathBuf {
    base.join(DIR_ALL)
}

pub fn service_dir(base: &Path, service: &str) -> PathBuf {
    all_dir(base).join(service)
}

pub fn active_link(base: &Path, link_name: &str) -> PathBuf {
    active_dir(base).join(link_name)
}

/// Relative target an active-link should point at, as written by
/// `symlink()` — `../all/<service>`, resolved relative to `active/`.
pub fn active_link_target(service: &str) -> PathBuf {
    PathBuf::from("..").join(DIR_ALL).join(service)
}

/// The priority file's content (if present and all-ASCII-digit) is used
/// as the active-link name in place of the service's own directory name.
pub fn read_priority(service_dir: &Path) -> Option<String> {
    let content = std::fs::read_to_string(service_dir.join(FILE_PRIORITY)).ok()?;
    let trimmed = content.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

/// Truncates an overlong link/display name to `VALUE_NAME_LEN`,
/// appending `...` as the original scanner does.
pub fn truncate_name(name: &str) -> String {
    if name.len() <= VALUE_NAME_LEN {
        return name.to_string();
    }
    let mut truncated: String = name.chars().take(VALUE_NAME_LEN.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_resolution_prefers_flag_then_env_then_default() {
        std::env::remove_var(ENV_SRVCTL_BASE);
        assert_eq!(resolve_base(Some("/x")), PathBuf::from("/x"));
        assert_eq!(resolve_base(None), PathBuf::from(DEFAULT_BASE));
    }

    #[test]
    fn truncate_name_leaves_short_names_alone() {
        assert_eq!(truncate_name("short"), "short");
    }

    #[test]
    fn truncate_name_caps_long_names() {
        let long = "a".repeat(200);
        let t = truncate_name(&long);
        assert_eq!(t.len(), VALUE_NAME_LEN);
        assert!(t.ends_with("..."));
    }

    #[test]
    fn priority_rejects_non_digit_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FILE_PRIORITY), "not-a-number\n").unwrap();
        assert_eq!(read_priority(dir.path()), None);
    }

    #[test]
    fn priority_accepts_digit_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FILE_PRIORITY), "042\n").unwrap();
        assert_eq!(read_priority(dir.path()), Some("042".to_string()));
    }
}
