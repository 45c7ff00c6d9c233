//! Command tree configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skein_core::KIB;

/// Command tree configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CmdFsConfig {
    /// Name of the tree, reported by the control file
    pub name: String,
    /// Interpreter used to run command scripts
    pub shell: String,
    /// Arguments placed before the script
    pub shell_args: Vec<String>,
    /// Time between term and kill when restarting a command
    pub restart_grace_ms: u64,
    /// Largest chunk sent by a single `get`
    pub chunk_size: usize,
    /// User and group owning every file
    pub owner: String,
    /// Initial working directory of new environments; the process's when unset
    pub cwd: Option<PathBuf>,
}

impl Default for CmdFsConfig {
    fn default() -> Self {
        Self {
            name: "cmds".to_string(),
            shell: "/bin/sh".to_string(),
            shell_args: vec!["-c".to_string()],
            restart_grace_ms: 100,
            chunk_size: 16 * KIB,
            owner: std::env::var("USER").unwrap_or_else(|_| "none".to_string()),
            cwd: None,
        }
    }
}

impl CmdFsConfig {
    /// Returns the restart grace period.
    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    /// Returns the working directory new environments start in.
    pub fn initial_cwd(&self) -> PathBuf {
        self.cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = CmdFsConfig::default();
        assert_eq!(c.shell, "/bin/sh");
        assert_eq!(c.shell_args, vec!["-c"]);
        assert_eq!(c.restart_grace(), Duration::from_millis(100));
        assert_eq!(c.chunk_size, 16 * 1024);
    }

    #[test]
    fn test_initial_cwd() {
        let mut c = CmdFsConfig::default();
        c.cwd = Some(PathBuf::from("/tmp"));
        assert_eq!(c.initial_cwd(), PathBuf::from("/tmp"));
        c.cwd = None;
        assert!(c.initial_cwd().is_absolute());
    }
}
