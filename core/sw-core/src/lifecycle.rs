//! Worker lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Meta key holding the version of the worker that last activated.
pub const ACTIVE_VERSION_KEY: &str = "active_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Parsed,
    Installing,
    /// Installed and waiting for the previous version to let go.
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: WorkerState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: WorkerState::Parsed,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Activated
    }

    /// Returns false if install already ran.
    pub fn begin_install(&mut self) -> bool {
        if self.state != WorkerState::Parsed {
            return false;
        }
        self.state = WorkerState::Installing;
        true
    }

    pub fn finish_install(&mut self, succeeded: bool) {
        if self.state == WorkerState::Installing {
            self.state = if succeeded {
                WorkerState::Installed
            } else {
                WorkerState::Redundant
            };
        }
    }

    /// Only a waiting worker can start activating.
    pub fn begin_activate(&mut self) -> bool {
        if self.state != WorkerState::Installed {
            return false;
        }
        self.state = WorkerState::Activating;
        true
    }

    pub fn finish_activate(&mut self, succeeded: bool) {
        if self.state == WorkerState::Activating {
            self.state = if succeeded {
                WorkerState::Activated
            } else {
                WorkerState::Installed
            };
        }
    }
}

/// A fresh install, or a restart of the version already in control, takes
/// over immediately. A different version waits for `SKIP_WAITING`.
pub fn should_activate_immediately(active_version: Option<&str>, version: &str) -> bool {
    match active_version {
        None => true,
        Some(active) => active == version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_install());
        assert_eq!(lifecycle.state(), WorkerState::Installing);
        lifecycle.finish_install(true);
        assert_eq!(lifecycle.state(), WorkerState::Installed);
        assert!(lifecycle.begin_activate());
        lifecycle.finish_activate(true);
        assert!(lifecycle.is_active());
    }

    #[test]
    fn failed_install_is_redundant() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.begin_install();
        lifecycle.finish_install(false);
        assert_eq!(lifecycle.state(), WorkerState::Redundant);
        assert!(!lifecycle.begin_activate());
        assert!(!lifecycle.begin_install());
    }

    #[test]
    fn failed_activation_returns_to_waiting() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.begin_install();
        lifecycle.finish_install(true);
        lifecycle.begin_activate();
        lifecycle.finish_activate(false);
        assert_eq!(lifecycle.state(), WorkerState::Installed);
    }

    #[test]
    fn activation_gate() {
        assert!(should_activate_immediately(None, "0.3.0"));
        assert!(should_activate_immediately(Some("0.3.0"), "0.3.0"));
        assert!(!should_activate_immediately(Some("0.2.9"), "0.3.0"));
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&WorkerState::Activated).expect("serialize");
        assert_eq!(json, "\"activated\"");
        assert_eq!(WorkerState::Redundant.to_string(), "redundant");
    }
}
