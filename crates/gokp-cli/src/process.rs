//! External tool invocation
//!
//! Every CLI the installer drives (kind, clusterctl, clusterawsadm,
//! kustomize, docker) goes through these helpers so failures carry the tool
//! name and its stderr.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use gokp_common::{Error, Result};

/// Tools the installer shells out to
pub const REQUIRED_TOOLS: [&str; 7] = [
    "kubectl",
    "docker",
    "git",
    "kind",
    "clusterctl",
    "clusterawsadm",
    "kustomize",
];

/// Whether `tool` resolves to a file on `PATH`
pub fn tool_available(tool: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(tool).is_file())
}

/// Warn about every required tool missing from `PATH`. Never fails.
pub fn warn_missing_tools() -> Vec<&'static str> {
    info!("Running checks");
    let missing: Vec<&'static str> = REQUIRED_TOOLS
        .into_iter()
        .filter(|tool| !tool_available(tool))
        .collect();
    for tool in &missing {
        warn!(tool = %tool, "Nonfatal: tool not found on PATH");
    }
    missing
}

fn spawn_error(program: &str, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::infrastructure(program, format!("{} not found on PATH", program))
    } else {
        Error::infrastructure(program, format!("failed to start {}: {}", program, err))
    }
}

/// Run a tool, streaming each stdout line to the log.
///
/// `kubeconfig` is exported as `KUBECONFIG` when given.
pub async fn run_streaming<I, K, V>(
    program: &str,
    args: &[&str],
    envs: I,
    kubeconfig: Option<&Path>,
) -> Result<()>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(kubeconfig) = kubeconfig {
        command.env("KUBECONFIG", kubeconfig);
    }

    let mut child = command.spawn().map_err(|e| spawn_error(program, e))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stream_stdout = async {
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                info!("{}", line);
            }
        }
        Ok::<_, std::io::Error>(())
    };
    let collect_stderr = async {
        let mut buf = String::new();
        if let Some(mut stderr) = stderr {
            stderr.read_to_string(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };

    let (streamed, stderr_text) = tokio::join!(stream_stdout, collect_stderr);
    streamed.map_err(|e| Error::infrastructure(program, format!("reading output: {}", e)))?;
    let stderr_text = stderr_text.unwrap_or_default();

    let status = child
        .wait()
        .await
        .map_err(|e| Error::infrastructure(program, e.to_string()))?;
    if !status.success() {
        return Err(Error::infrastructure(
            program,
            format!("{} {} failed: {}", program, args.join(" "), stderr_text.trim()),
        ));
    }

    Ok(())
}

/// Run a tool to completion and return its stdout
pub async fn run_captured<I, K, V>(
    program: &str,
    args: &[&str],
    envs: I,
    kubeconfig: Option<&Path>,
) -> Result<String>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args).envs(envs).stdin(Stdio::null());
    if let Some(kubeconfig) = kubeconfig {
        command.env("KUBECONFIG", kubeconfig);
    }

    let output = command.output().await.map_err(|e| spawn_error(program, e))?;
    if !output.status.success() {
        return Err(Error::infrastructure(
            program,
            format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }

    String::from_utf8(output.stdout)
        .map_err(|e| Error::infrastructure(program, format!("output is not UTF-8: {}", e)))
}

/// Arguments without extra environment
pub const NO_ENV: [(&str, &str); 0] = [];

#[cfg(test)]
mod tests {
    use super::*;
    use gokp_common::ErrorKind;

    #[test]
    fn shell_is_available() {
        assert!(tool_available("sh"));
        assert!(!tool_available("gokp-definitely-not-installed"));
    }

    #[tokio::test]
    async fn captured_output_is_returned() {
        let out = run_captured("sh", &["-c", "echo $GOKP_TEST"], [("GOKP_TEST", "hi")], None)
            .await
            .unwrap();
        assert_eq!(out, "hi\n");
    }

    #[tokio::test]
    async fn kubeconfig_is_exported() {
        let out = run_captured("sh", &["-c", "echo $KUBECONFIG"], NO_ENV, Some(Path::new("/tmp/k")))
            .await
            .unwrap();
        assert_eq!(out.trim(), "/tmp/k");
    }

    #[tokio::test]
    async fn failing_tool_reports_stderr() {
        let err = run_streaming("sh", &["-c", "echo boom >&2; exit 3"], NO_ENV, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn streaming_succeeds_on_zero_exit() {
        run_streaming("sh", &["-c", "echo one; echo two"], NO_ENV, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_binary_is_infrastructure_error() {
        let err = run_captured("gokp-definitely-not-installed", &[], NO_ENV, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(err.to_string().contains("not found"));
    }
}
