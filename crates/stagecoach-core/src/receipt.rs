use serde::{Deserialize, Serialize};

use crate::{Build, Game, InstallTarget, Upload};

/// Files written by one backend run, relative to the install folder.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallResult {
    pub files: Vec<String>,
}

impl InstallResult {
    pub fn new(files: Vec<String>) -> Self {
        Self { files }
    }

    pub fn single_file(&self) -> Option<&str> {
        match self.files.as_slice() {
            [single] => Some(single.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    #[serde(default)]
    pub game: Option<Game>,
    #[serde(default)]
    pub upload: Option<Upload>,
    #[serde(default)]
    pub build: Option<Build>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub installer_name: String,
    #[serde(default)]
    pub installed_at_unix: u64,
}

impl Receipt {
    pub fn for_target(
        target: &InstallTarget,
        result: &InstallResult,
        installer_name: &str,
        installed_at_unix: u64,
    ) -> Self {
        Self {
            game: Some(target.game.clone()),
            upload: Some(target.upload.clone()),
            build: target.build.clone(),
            files: result.files.clone(),
            installer_name: installer_name.to_string(),
            installed_at_unix,
        }
    }

    pub fn upload_id(&self) -> Option<i64> {
        self.upload.as_ref().map(|upload| upload.id)
    }

    pub fn build_id(&self) -> Option<i64> {
        self.build.as_ref().map(|build| build.id)
    }
}
