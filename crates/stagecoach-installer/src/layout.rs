use std::path::{Component, Path, PathBuf};

use stagecoach_core::Upload;

/// Directory holding engine state inside an install folder. Never listed as
/// an installed file and never touched by ghost removal.
pub const INSTALL_STATE_DIR: &str = ".stagecoach";

/// Paths inside an operation's staging folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    root: PathBuf,
}

impl StagingLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn operation_marker_path(&self) -> PathBuf {
        self.root.join("operation.json")
    }

    pub fn records_dir(&self) -> PathBuf {
        self.root.join("records")
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.records_dir().join(format!("{name}.json"))
    }

    pub fn install_source_dir(&self) -> PathBuf {
        self.root.join("install-source")
    }

    pub fn install_source_path(&self, file_name: &str) -> PathBuf {
        self.install_source_dir().join(file_name)
    }

    pub fn nested_install_source_dir(&self) -> PathBuf {
        self.root.join("nested-install-source")
    }

    pub fn nested_install_source_path(&self, file_name: &str) -> PathBuf {
        self.nested_install_source_dir().join(file_name)
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.root.join("extract")
    }
}

/// Paths inside the folder a game gets installed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallFolderLayout {
    root: PathBuf,
}

impl InstallFolderLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(INSTALL_STATE_DIR)
    }

    pub fn receipt_path(&self) -> PathBuf {
        self.state_dir().join("receipt.json")
    }

    /// Resolves a manifest entry against the install folder, refusing
    /// anything that would land outside it or inside the state directory.
    pub fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let relative = validated_relative_path(relative)?;
        if relative
            .components()
            .next()
            .is_some_and(|first| first.as_os_str() == INSTALL_STATE_DIR)
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

pub(crate) fn validated_relative_path(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let path = Path::new(trimmed);
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if normalized.as_os_str().is_empty() {
        return None;
    }
    Some(normalized)
}

/// File name used for an upload's local copy in the staging folder. Derived
/// from the upload alone so a resumed operation finds the same path before
/// any source is opened.
pub fn install_source_file_name(upload: &Upload) -> String {
    sanitize_file_name(&upload.filename).unwrap_or_else(|| format!("upload-{}", upload.id))
}

pub(crate) fn sanitize_file_name(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    Some(cleaned)
}
