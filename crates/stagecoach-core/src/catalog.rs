use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVER: &str = "https://itch.io";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStorage {
    #[default]
    Hosted,
    Build,
    External,
}

impl UploadStorage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hosted => "hosted",
            Self::Build => "build",
            Self::External => "external",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    pub id: i64,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub display_name: String,
    /// Size of the full package in bytes. For build-backed uploads this is the
    /// archive size, which is what patch chains are weighed against.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub storage: UploadStorage,
}

impl Upload {
    pub fn is_probably_external(&self) -> bool {
        self.storage == UploadStorage::External
    }

    pub fn label(&self) -> String {
        if !self.display_name.is_empty() {
            return format!("{} (#{})", self.display_name, self.id);
        }
        if !self.filename.is_empty() {
            return format!("{} (#{})", self.filename, self.id);
        }
        format!("upload #{}", self.id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub id: i64,
    #[serde(default)]
    pub parent_build_id: i64,
    #[serde(default)]
    pub user_version: String,
}

impl Build {
    pub fn label(&self) -> String {
        if self.user_version.is_empty() {
            format!("build #{}", self.id)
        } else {
            format!("build #{} ({})", self.id, self.user_version)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_key: Option<i64>,
}

impl GameCredentials {
    pub fn server_or_default(&self) -> &str {
        match self.server.as_deref().map(str::trim) {
            Some(server) if !server.is_empty() => server,
            _ => DEFAULT_SERVER,
        }
    }
}

/// The game/upload/build triple an operation brings an install folder to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallTarget {
    pub game: Game,
    pub upload: Upload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,
}

impl InstallTarget {
    pub fn describe(&self) -> String {
        match &self.build {
            Some(build) => format!("{}, {}", self.upload.label(), build.label()),
            None => self.upload.label(),
        }
    }
}
