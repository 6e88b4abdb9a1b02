//! Overlay rendering through kustomize

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use gokp_common::{Error, Result};

use crate::manifest::{split, ManifestSet};

/// Turns an overlay directory into one multi-document YAML stream
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestRenderer: Send + Sync {
    /// Render `overlay` to concatenated YAML in a deterministic order
    async fn render(&self, overlay: &Path) -> Result<String>;
}

/// Renders with `kustomize build`
#[derive(Debug, Clone)]
pub struct KustomizeRenderer {
    binary: String,
}

impl Default for KustomizeRenderer {
    fn default() -> Self {
        Self {
            binary: "kustomize".to_string(),
        }
    }
}

impl KustomizeRenderer {
    /// Use a specific kustomize binary
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ManifestRenderer for KustomizeRenderer {
    async fn render(&self, overlay: &Path) -> Result<String> {
        if !overlay.is_dir() {
            return Err(Error::render(overlay, "overlay directory does not exist"));
        }

        let output = Command::new(&self.binary)
            .arg("build")
            .arg(overlay)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::render(overlay, format!("{} not found on PATH", self.binary))
                } else {
                    Error::render(overlay, format!("failed to run {}: {}", self.binary, e))
                }
            })?;

        if !output.status.success() {
            return Err(Error::render(
                overlay,
                format!(
                    "{} build failed: {}",
                    self.binary,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| Error::render(overlay, format!("output is not UTF-8: {}", e)))
    }
}

/// Render `overlay`, keep the concatenated output in `out_file` and split it
/// into `out_dir`. The split files are named after `out_file`'s stem.
pub async fn render_to_workspace(
    renderer: &dyn ManifestRenderer,
    overlay: &Path,
    out_file: &Path,
    out_dir: &Path,
) -> Result<ManifestSet> {
    info!(overlay = %overlay.display(), "Rendering overlay");
    let rendered = renderer.render(overlay).await?;

    std::fs::write(out_file, &rendered)
        .map_err(|e| Error::resource(out_file, format!("failed to write render: {}", e)))?;

    let stem = out_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "manifest".to_string());
    let set = split(&rendered, &stem);
    set.write_to(out_dir)?;

    info!(documents = set.len(), dir = %out_dir.display(), "Split rendered manifests");
    Ok(set)
}
