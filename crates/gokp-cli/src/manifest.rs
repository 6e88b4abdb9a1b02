//! Ordered manifest sets and the multi-document splitter
//!
//! Rendered output is split into one file per document with a zero-padded
//! sequence prefix, so a lexical directory listing replays the render order.

use std::path::{Path, PathBuf};

use gokp_common::{Error, Result};
use tracing::debug;

/// One resource document and the file it lives in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDocument {
    /// File name, `NN.<stem>.yaml` for split output
    pub file_name: String,
    /// Raw YAML text of a single document
    pub content: String,
}

impl ManifestDocument {
    /// Create a document
    pub fn new(file_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            content: content.into(),
        }
    }
}

/// Documents in apply order. The order is never changed after construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestSet {
    documents: Vec<ManifestDocument>,
}

impl ManifestSet {
    /// Wrap documents that are already in apply order
    pub fn new(documents: Vec<ManifestDocument>) -> Self {
        Self { documents }
    }

    /// Documents in apply order
    pub fn documents(&self) -> &[ManifestDocument] {
        &self.documents
    }

    /// Number of documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether the set holds no documents
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Write every document into `dir`, creating it if needed
    pub fn write_to(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::resource(dir, format!("failed to create directory: {}", e)))?;

        let mut written = Vec::with_capacity(self.documents.len());
        for doc in &self.documents {
            let path = dir.join(&doc.file_name);
            std::fs::write(&path, &doc.content)
                .map_err(|e| Error::resource(&path, format!("failed to write manifest: {}", e)))?;
            written.push(path);
        }

        debug!(dir = %dir.display(), files = written.len(), "Wrote manifest set");
        Ok(written)
    }

    /// Read every `*.yaml` file in `dir` in lexical order
    pub fn read_from(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::resource(dir, format!("failed to read directory: {}", e)))?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| Error::resource(dir, format!("failed to read entry: {}", e)))?
                .path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "yaml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| Error::resource(&path, format!("failed to read manifest: {}", e)))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            documents.push(ManifestDocument { file_name, content });
        }

        Ok(Self { documents })
    }
}

impl<'a> IntoIterator for &'a ManifestSet {
    type Item = &'a ManifestDocument;
    type IntoIter = std::slice::Iter<'a, ManifestDocument>;

    fn into_iter(self) -> Self::IntoIter {
        self.documents.iter()
    }
}

/// Split a multi-document YAML stream into `NN.<stem>.yaml` documents.
///
/// A separator is a line that is `---`, or starts with `--- ` or `---\t`,
/// ignoring trailing whitespace. Anything after the marker on that line
/// opens the next document. Fragments holding only blank lines and
/// comments are dropped. The prefix is zero-padded to the width of the
/// document count, never less than two digits.
pub fn split(doc: &str, stem: &str) -> ManifestSet {
    let mut fragments: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in doc.lines() {
        if let Some(rest) = separator(line) {
            fragments.push(std::mem::take(&mut current));
            if !rest.is_empty() {
                current.push_str(rest);
                current.push('\n');
            }
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    fragments.push(current);

    let fragments: Vec<String> = fragments
        .into_iter()
        .filter(|f| has_content(f))
        .collect();

    let width = fragments.len().to_string().len().max(2);
    let documents = fragments
        .into_iter()
        .enumerate()
        .map(|(index, content)| ManifestDocument {
            file_name: format!("{:0width$}.{}.yaml", index, stem, width = width),
            content,
        })
        .collect();

    ManifestSet { documents }
}

/// The remainder of a separator line, `None` if `line` is not a separator
fn separator(line: &str) -> Option<&str> {
    let rest = line.trim_end().strip_prefix("---")?;
    if rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\t') {
        Some(rest.trim_start())
    } else {
        None
    }
}

fn has_content(fragment: &str) -> bool {
    fragment.lines().any(|line| {
        let trimmed = line.trim();
        !trimmed.is_empty() && !trimmed.starts_with('#')
    })
}
