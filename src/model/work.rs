//! The tagged-variant work specification a phase executor runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What shell a [`WorkSpec::Shell`] command should run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ShellKind {
    /// Resolve the platform default: `cmd.exe`/`powershell.exe`/`pwsh` on
    /// Windows (in that preference order, first found wins), `bash` falling
    /// back to `sh` on Unix.
    Auto,
    Cmd,
    PowerShell,
    Pwsh,
    Bash,
    Sh,
}

/// One of the three work kinds a node's prechecks/work/postchecks can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkSpec {
    Shell {
        command: String,
        #[serde(default)]
        shell: ShellKindDefault,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default, with = "duration_millis_opt")]
        timeout: Option<Duration>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    Process {
        executable: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default, with = "duration_millis_opt")]
        timeout: Option<Duration>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    Agent {
        instructions: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        context_files: Vec<PathBuf>,
        #[serde(default)]
        max_turns: Option<u32>,
        #[serde(default)]
        allowed_folders: Vec<PathBuf>,
        #[serde(default)]
        allowed_urls: Vec<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// Wrapper so `#[serde(default)]` on `ShellKind` can produce `Auto` without
/// requiring `ShellKind: Default` to leak into the public API's ergonomics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShellKindDefault(pub ShellKind);

impl Default for ShellKindDefault {
    fn default() -> Self {
        Self(ShellKind::Auto)
    }
}

impl WorkSpec {
    /// Normalize a raw instruction string into a [`WorkSpec`]: a leading
    /// `@agent ` prefix produces an `Agent` spec, otherwise a `Shell` spec
    /// using the platform default shell.
    pub fn from_raw(raw: &str) -> Self {
        if let Some(instructions) = raw.strip_prefix("@agent ") {
            WorkSpec::Agent {
                instructions: instructions.trim().to_string(),
                model: None,
                context_files: Vec::new(),
                max_turns: None,
                allowed_folders: Vec::new(),
                allowed_urls: Vec::new(),
                session_id: None,
            }
        } else {
            WorkSpec::Shell {
                command: raw.to_string(),
                shell: ShellKindDefault::default(),
                env: BTreeMap::new(),
                timeout: None,
                cwd: None,
            }
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, WorkSpec::Agent { .. })
    }
}

mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        v.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_with_agent_prefix_becomes_agent_spec() {
        let spec = WorkSpec::from_raw("@agent fix the failing test");
        match spec {
            WorkSpec::Agent { instructions, .. } => assert_eq!(instructions, "fix the failing test"),
            _ => panic!("expected Agent variant"),
        }
    }

    #[test]
    fn raw_without_prefix_becomes_shell_spec() {
        let spec = WorkSpec::from_raw("cargo test");
        match spec {
            WorkSpec::Shell { command, shell, .. } => {
                assert_eq!(command, "cargo test");
                assert_eq!(shell.0, ShellKind::Auto);
            }
            _ => panic!("expected Shell variant"),
        }
    }

    #[test]
    fn work_spec_round_trips_through_json() {
        let spec = WorkSpec::from_raw("@agent do the thing");
        let json = serde_json::to_string(&spec).unwrap();
        let back: WorkSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }
}
