//! CLI argument parsing (clap derive), in the idiom of the teacher's own
//! `cli/args.rs`: a flat struct, one `resolve_workspace()` helper.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "lower")]
pub enum ApprovalModeArg {
    Strict,
    Standard,
    Trusted,
}

impl From<ApprovalModeArg> for turnloop_policy::ApprovalMode {
    fn from(value: ApprovalModeArg) -> Self {
        match value {
            ApprovalModeArg::Strict => turnloop_policy::ApprovalMode::Strict,
            ApprovalModeArg::Standard => turnloop_policy::ApprovalMode::Standard,
            ApprovalModeArg::Trusted => turnloop_policy::ApprovalMode::Trusted,
        }
    }
}

/// Turnloop CLI - headless interface to the turnloop agent runtime.
#[derive(Parser, Debug, Clone)]
#[command(name = "turnloop")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Project directory (default: current directory)
    #[arg(default_value = ".")]
    pub workspace: PathBuf,

    /// Execute a single prompt and exit
    #[arg(short = 'e', long)]
    pub execute: Option<String>,

    /// Resume an existing session id instead of starting a new one
    #[arg(long)]
    pub session: Option<String>,

    /// Approval mode governing which tool calls pause for human approval
    #[arg(long, value_enum, default_value_t = ApprovalModeArg::Standard)]
    pub approval_mode: ApprovalModeArg,

    /// Seal spec/ against tool writes regardless of approval mode
    #[arg(long)]
    pub spec_sealed: bool,

    /// Output events as JSON lines (for scripting)
    #[arg(long)]
    pub json: bool,

    /// Show verbose (debug-level) logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Args {
    /// Resolves the workspace to an absolute, existing directory.
    pub fn resolve_workspace(&self) -> anyhow::Result<PathBuf> {
        let canonical = self.workspace.canonicalize().map_err(|e| {
            anyhow::anyhow!("workspace '{}' does not exist or is not accessible: {}", self.workspace.display(), e)
        })?;
        if !canonical.is_dir() {
            anyhow::bail!("workspace '{}' is not a directory", canonical.display());
        }
        Ok(canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_current_dir_and_standard_mode() {
        let args = Args::parse_from(["turnloop"]);
        assert_eq!(args.workspace, PathBuf::from("."));
        assert_eq!(args.approval_mode, ApprovalModeArg::Standard);
        assert!(!args.json);
        assert!(args.execute.is_none());
    }

    #[test]
    fn parses_execute_and_approval_mode() {
        let args = Args::parse_from(["turnloop", "-e", "hello", "--approval-mode", "trusted"]);
        assert_eq!(args.execute.as_deref(), Some("hello"));
        assert_eq!(args.approval_mode, ApprovalModeArg::Trusted);
    }
}
