use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::fs_utils::write_atomically;
use crate::StagingLayout;

const RECORD_FORMAT_VERSION: u32 = 1;

/// A named, independently persisted slice of operation state.
pub trait Subcontext: Serialize + DeserializeOwned + Default {
    const NAME: &'static str;
}

/// Object-safe view of a subcontext, used when retiring a staging folder to
/// make sure nothing in memory is newer than what was flushed.
pub trait RecordState {
    fn record_name(&self) -> &'static str;
    fn snapshot(&self) -> Result<String, StagingError>;
    fn default_snapshot(&self) -> Result<String, StagingError>;
}

impl<T: Subcontext> RecordState for T {
    fn record_name(&self) -> &'static str {
        T::NAME
    }

    fn snapshot(&self) -> Result<String, StagingError> {
        canonical_payload(T::NAME, self).map(|(_, rendered)| rendered)
    }

    fn default_snapshot(&self) -> Result<String, StagingError> {
        canonical_payload(T::NAME, &T::default()).map(|(_, rendered)| rendered)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("invalid operation id '{0}': must be non-empty without path separators")]
    InvalidOperationId(String),
    #[error(
        "staging folder {} belongs to operation '{found}', not '{expected}'",
        path.display()
    )]
    OperationMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("staging record '{name}' is corrupt ({}): {reason}", path.display())]
    Corrupt {
        name: String,
        path: PathBuf,
        reason: String,
    },
    #[error("staging record '{name}' has unflushed changes; refusing to retire")]
    Unflushed { name: String },
    #[error("staging I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StagingError {
    /// Flushed state that can no longer be trusted. Unlike I/O failures these
    /// do not go away on retry.
    pub fn is_inconsistency(&self) -> bool {
        matches!(
            self,
            Self::OperationMismatch { .. } | Self::Corrupt { .. } | Self::Unflushed { .. }
        )
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationMarker {
    version: u32,
    operation_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordEnvelope {
    version: u32,
    operation_id: String,
    name: String,
    checksum: String,
    payload: serde_json::Value,
}

/// Durable per-operation state kept in the staging folder. One JSON record
/// per subcontext, each written with tmp-then-rename and checksummed, so a
/// crash leaves either the previous or the new version of a record.
#[derive(Debug)]
pub struct StagingStore {
    operation_id: String,
    layout: StagingLayout,
}

impl StagingStore {
    /// Opens or creates the staging folder for `operation_id`. Reopening the
    /// same folder with the same id is a no-op; a different id is refused.
    pub fn open(
        operation_id: &str,
        staging_folder: impl Into<PathBuf>,
    ) -> Result<Self, StagingError> {
        if operation_id.trim().is_empty()
            || operation_id.contains(['/', '\\'])
            || operation_id == "."
            || operation_id == ".."
        {
            return Err(StagingError::InvalidOperationId(operation_id.to_string()));
        }

        let layout = StagingLayout::new(staging_folder);
        for dir in [layout.root().to_path_buf(), layout.records_dir()] {
            fs::create_dir_all(&dir).map_err(|err| StagingError::io(&dir, err))?;
        }

        let marker_path = layout.operation_marker_path();
        match fs::read(&marker_path) {
            Ok(raw) => {
                let marker: OperationMarker =
                    serde_json::from_slice(&raw).map_err(|err| StagingError::Corrupt {
                        name: "operation".to_string(),
                        path: marker_path.clone(),
                        reason: err.to_string(),
                    })?;
                if marker.operation_id != operation_id {
                    return Err(StagingError::OperationMismatch {
                        path: layout.root().to_path_buf(),
                        expected: operation_id.to_string(),
                        found: marker.operation_id,
                    });
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let marker = OperationMarker {
                    version: RECORD_FORMAT_VERSION,
                    operation_id: operation_id.to_string(),
                };
                let raw = serde_json::to_vec_pretty(&marker).map_err(|err| {
                    StagingError::Corrupt {
                        name: "operation".to_string(),
                        path: marker_path.clone(),
                        reason: err.to_string(),
                    }
                })?;
                write_atomically(&marker_path, &raw)
                    .map_err(|err| StagingError::io(&marker_path, err))?;
            }
            Err(err) => return Err(StagingError::io(&marker_path, err)),
        }

        Ok(Self {
            operation_id: operation_id.to_string(),
            layout,
        })
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    /// Returns the last flushed version of `T`, or `None` when it was never
    /// saved. Damaged records are reported, never silently reset.
    pub fn load<T: Subcontext>(&self) -> Result<Option<T>, StagingError> {
        let Some(payload) = self.read_payload(T::NAME)? else {
            return Ok(None);
        };
        let path = self.layout.record_path(T::NAME);
        let record = serde_json::from_value(payload).map_err(|err| StagingError::Corrupt {
            name: T::NAME.to_string(),
            path,
            reason: format!("payload does not match record shape: {err}"),
        })?;
        Ok(Some(record))
    }

    pub fn save<T: Subcontext>(&self, record: &T) -> Result<(), StagingError> {
        let path = self.layout.record_path(T::NAME);
        let (payload, rendered) = canonical_payload(T::NAME, record)?;
        let envelope = RecordEnvelope {
            version: RECORD_FORMAT_VERSION,
            operation_id: self.operation_id.clone(),
            name: T::NAME.to_string(),
            checksum: checksum(&rendered),
            payload,
        };
        let raw = serde_json::to_vec_pretty(&envelope).map_err(|err| StagingError::Corrupt {
            name: T::NAME.to_string(),
            path: path.clone(),
            reason: err.to_string(),
        })?;
        write_atomically(&path, &raw).map_err(|err| StagingError::io(&path, err))
    }

    /// Deletes the staging folder. Every live subcontext must match what is
    /// on disk; otherwise a change would be lost and retiring is refused.
    pub fn retire(self, live: &[&dyn RecordState]) -> Result<(), StagingError> {
        for record in live {
            let name = record.record_name();
            let in_memory = record.snapshot()?;
            let on_disk = match self.read_payload(name)? {
                Some(payload) => render(name, &self.layout.record_path(name), &payload)?,
                None => record.default_snapshot()?,
            };
            if in_memory != on_disk {
                return Err(StagingError::Unflushed {
                    name: name.to_string(),
                });
            }
        }

        let root = self.layout.root();
        match fs::remove_dir_all(root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StagingError::io(root, err)),
        }
    }

    fn read_payload(&self, name: &str) -> Result<Option<serde_json::Value>, StagingError> {
        let path = self.layout.record_path(name);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StagingError::io(&path, err)),
        };

        let corrupt = |reason: String| StagingError::Corrupt {
            name: name.to_string(),
            path: path.clone(),
            reason,
        };
        let envelope: RecordEnvelope =
            serde_json::from_slice(&raw).map_err(|err| corrupt(err.to_string()))?;
        if envelope.name != name {
            return Err(corrupt(format!("record is named '{}'", envelope.name)));
        }
        if envelope.operation_id != self.operation_id {
            return Err(corrupt(format!(
                "record belongs to operation '{}'",
                envelope.operation_id
            )));
        }
        let rendered = render(name, &path, &envelope.payload)?;
        if checksum(&rendered) != envelope.checksum {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        Ok(Some(envelope.payload))
    }
}

fn canonical_payload<T: Serialize>(
    name: &str,
    record: &T,
) -> Result<(serde_json::Value, String), StagingError> {
    let payload = serde_json::to_value(record).map_err(|err| StagingError::Corrupt {
        name: name.to_string(),
        path: PathBuf::new(),
        reason: format!("record cannot be serialized: {err}"),
    })?;
    let rendered = render(name, Path::new(""), &payload)?;
    Ok((payload, rendered))
}

fn render(name: &str, path: &Path, payload: &serde_json::Value) -> Result<String, StagingError> {
    serde_json::to_string(payload).map_err(|err| StagingError::Corrupt {
        name: name.to_string(),
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn checksum(rendered: &str) -> String {
    hex::encode(Sha256::digest(rendered.as_bytes()))
}
