//! status command - show the persisted state of a run

use std::fmt::Write;
use std::path::PathBuf;

use clap::Args;

use crate::run::RunState;
use crate::Result;

/// Show a run's state
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Workspace or archive directory, or the run file itself
    pub path: PathBuf,

    /// Print the raw run state as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: StatusArgs) -> Result<()> {
    let state = RunState::load(&args.path)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print!("{}", format_status(&state));
    }
    Ok(())
}

/// Human readable summary of a run
pub fn format_status(state: &RunState) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Cluster:     {}", state.cluster_name);
    let _ = writeln!(out, "State:       {}", state.state);
    if let Some(phase) = state.pivot_phase {
        let _ = writeln!(out, "Pivot phase: {}", phase);
    }
    if let Some(endpoint) = state.authoritative() {
        let _ = writeln!(
            out,
            "Authority:   {} ({})",
            endpoint.name,
            endpoint.kubeconfig.display()
        );
    }
    if let Some(repo) = &state.repository {
        let _ = writeln!(out, "Repository:  {}", repo.html_url);
    }
    let _ = writeln!(out, "Updated:     {}", state.updated_at.to_rfc3339());
    if let Some(aborted) = &state.aborted {
        let _ = writeln!(out, "Aborted at:  {} [{}]", aborted.at, aborted.kind);
        let _ = writeln!(out, "Error:       {}", aborted.error);
    }
    out
}
