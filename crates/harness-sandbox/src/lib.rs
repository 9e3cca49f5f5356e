//! Process execution for the harness: acceptance and verification commands
//! through the shell, and version control through the `git` binary.

pub mod git;
pub mod shell;

pub use git::GitCli;
pub use shell::{CommandLimits, ShellCommandRunner, TIMEOUT_EXIT_CODE};
