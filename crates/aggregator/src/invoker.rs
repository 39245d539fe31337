//! Platform-specific composition of script invocations.
//!
//! Unix-like hosts execute a script directly; Windows hosts run it through
//! `bash.exe`. The composer is chosen once by [`host_composer`] and handed to
//! the [`ProcessRunner`](crate::runner::ProcessRunner).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;

use crate::error::RunnerError;

/// Builds the command that runs a script on one platform family.
pub trait CommandComposer: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Program and arguments used to run `script`.
    fn argv(&self, script: &Path) -> Vec<OsString>;

    /// Build a command for `script` without any stdio configuration.
    fn compose(&self, script: &Path) -> Command {
        let mut argv = self.argv(script).into_iter();
        // argv always carries at least the program
        let program = argv.next().unwrap_or_else(|| script.as_os_str().to_owned());
        let mut command = Command::new(program);
        command.args(argv);
        command
    }
}

/// Executes the script itself (Unix-like hosts).
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectComposer;

impl CommandComposer for DirectComposer {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn argv(&self, script: &Path) -> Vec<OsString> {
        vec![script.as_os_str().to_owned()]
    }
}

/// Runs the script through a bash interpreter (Windows hosts).
#[derive(Debug, Clone)]
pub struct BashComposer {
    /// Interpreter to launch, `bash.exe` by default.
    pub shell: PathBuf,
}

impl Default for BashComposer {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("bash.exe"),
        }
    }
}

impl CommandComposer for BashComposer {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn argv(&self, script: &Path) -> Vec<OsString> {
        vec![
            self.shell.as_os_str().to_owned(),
            script.as_os_str().to_owned(),
        ]
    }
}

/// Select the composer for the host platform.
pub fn host_composer() -> Result<Arc<dyn CommandComposer>, RunnerError> {
    if cfg!(unix) {
        Ok(Arc::new(DirectComposer))
    } else if cfg!(windows) {
        Ok(Arc::new(BashComposer::default()))
    } else {
        Err(RunnerError::UnsupportedPlatform(std::env::consts::OS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_composer_runs_script_itself() {
        let argv = DirectComposer.argv(Path::new("/opt/agg/run_aggregator"));
        assert_eq!(argv, vec![OsString::from("/opt/agg/run_aggregator")]);
    }

    #[test]
    fn test_bash_composer_wraps_script() {
        let argv = BashComposer::default().argv(Path::new("run_aggregator"));
        assert_eq!(
            argv,
            vec![OsString::from("bash.exe"), OsString::from("run_aggregator")]
        );
    }

    #[test]
    fn test_bash_composer_custom_shell() {
        let composer = BashComposer {
            shell: PathBuf::from("/usr/bin/bash"),
        };
        assert_eq!(composer.argv(Path::new("x"))[0], OsString::from("/usr/bin/bash"));
        assert_eq!(composer.name(), "bash");
    }

    #[cfg(unix)]
    #[test]
    fn test_host_composer_is_direct_on_unix() {
        let composer = host_composer().expect("unix is supported");
        assert_eq!(composer.name(), "direct");
    }
}
