//! Directory-backed model registry.
//!
//! Layout: `<root>/<model_name>/v<version>/model.json`, with an optional
//! `model.json.sha256` sidecar holding the hex SHA-256 of the artifact.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ModelRef;
use crate::predictor::LagLinearModel;

pub const MODEL_ARTIFACT_FILE: &str = "model.json";
pub const MODEL_CHECKSUM_SUFFIX: &str = ".sha256";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    pub version: u32,
    pub dir: PathBuf,
    pub model_path: PathBuf,
    pub checksum_verified: bool,
}

#[derive(Debug, Error)]
pub enum ModelRegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("model {name} has no registered versions under {root}")]
    ModelNotFound { name: String, root: PathBuf },
    #[error("model {name} has no version {version}")]
    VersionNotFound { name: String, version: u32 },
    #[error("invalid checksum payload at {path}: {payload}")]
    InvalidChecksumPayload { path: PathBuf, payload: String },
    #[error("checksum mismatch for {path}: expected {expected}, actual {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("invalid model artifact JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRegistry {
    root: PathBuf,
}

impl ModelRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn list_versions(&self, name: &str) -> Result<Vec<u32>, ModelRegistryError> {
        let model_dir = self.root.join(name);
        if !model_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(&model_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(version) = file_name
                .to_str()
                .and_then(|raw| raw.strip_prefix('v'))
                .and_then(|raw| raw.parse::<u32>().ok())
            else {
                continue;
            };
            if entry.path().join(MODEL_ARTIFACT_FILE).is_file() {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Resolves a pinned version, or the highest registered one when unpinned.
    pub fn resolve(&self, model: &ModelRef) -> Result<ModelArtifact, ModelRegistryError> {
        let versions = self.list_versions(&model.name)?;
        let version = match model.version {
            Some(version) if versions.contains(&version) => version,
            Some(version) => {
                return Err(ModelRegistryError::VersionNotFound {
                    name: model.name.clone(),
                    version,
                })
            }
            None => *versions
                .last()
                .ok_or_else(|| ModelRegistryError::ModelNotFound {
                    name: model.name.clone(),
                    root: self.root.clone(),
                })?,
        };

        let dir = self.root.join(&model.name).join(format!("v{version}"));
        let model_path = dir.join(MODEL_ARTIFACT_FILE);
        Ok(ModelArtifact {
            name: model.name.clone(),
            version,
            dir,
            model_path,
            checksum_verified: false,
        })
    }

    pub fn load_lag_linear(
        &self,
        model: &ModelRef,
    ) -> Result<(ModelArtifact, LagLinearModel), ModelRegistryError> {
        let mut artifact = self.resolve(model)?;
        let bytes = fs::read(&artifact.model_path)?;
        artifact.checksum_verified = verify_sidecar(&artifact.model_path, &bytes)?;
        let parsed: LagLinearModel = serde_json::from_slice(&bytes)?;

        info!(
            component = "registry",
            event = "registry.model.loaded",
            model = %artifact.name,
            version = artifact.version,
            path = %artifact.model_path.display(),
            lag_weights = parsed.lag_weights.len(),
            checksum_verified = artifact.checksum_verified
        );

        Ok((artifact, parsed))
    }

    /// Writes an artifact and its checksum sidecar as version `version`.
    pub fn register_lag_linear(
        &self,
        name: &str,
        version: u32,
        model: &LagLinearModel,
    ) -> Result<ModelArtifact, ModelRegistryError> {
        let dir = self.root.join(name).join(format!("v{version}"));
        fs::create_dir_all(&dir)?;
        let model_path = dir.join(MODEL_ARTIFACT_FILE);
        let bytes = serde_json::to_vec_pretty(model)?;
        write_atomic(&model_path, &bytes)?;
        write_atomic(
            &checksum_path(&model_path),
            format!("{}  {MODEL_ARTIFACT_FILE}\n", sha256_hex(&bytes)).as_bytes(),
        )?;

        Ok(ModelArtifact {
            name: name.to_string(),
            version,
            dir,
            model_path,
            checksum_verified: true,
        })
    }
}

fn verify_sidecar(model_path: &Path, bytes: &[u8]) -> Result<bool, ModelRegistryError> {
    let sidecar = checksum_path(model_path);
    if !sidecar.is_file() {
        return Ok(false);
    }

    let payload = fs::read(&sidecar)?;
    let expected = parse_checksum_payload(&sidecar, &payload)?;
    let actual = sha256_hex(bytes);
    if !actual.eq_ignore_ascii_case(&expected) {
        warn!(
            component = "registry",
            event = "registry.model.checksum_failed",
            path = %model_path.display(),
            expected = %expected,
            actual = %actual
        );
        return Err(ModelRegistryError::ChecksumMismatch {
            path: model_path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(true)
}

fn checksum_path(model_path: &Path) -> PathBuf {
    let mut raw = model_path.as_os_str().to_owned();
    raw.push(MODEL_CHECKSUM_SUFFIX);
    PathBuf::from(raw)
}

fn parse_checksum_payload(path: &Path, payload: &[u8]) -> Result<String, ModelRegistryError> {
    let text = String::from_utf8_lossy(payload);
    let token = text.split_whitespace().next().ok_or_else(|| {
        ModelRegistryError::InvalidChecksumPayload {
            path: path.to_path_buf(),
            payload: text.trim().to_string(),
        }
    })?;

    if token.len() != 64 || hex::decode(token).is_err() {
        return Err(ModelRegistryError::InvalidChecksumPayload {
            path: path.to_path_buf(),
            payload: text.trim().to_string(),
        });
    }

    Ok(token.to_ascii_lowercase())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ModelRegistryError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    fs::write(&tmp_path, bytes)?;
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn model_ref(version: Option<u32>) -> ModelRef {
        ModelRef {
            name: "demand".to_string(),
            version,
        }
    }

    #[test]
    fn unpinned_reference_resolves_latest_version() {
        let temp = tempdir().unwrap();
        let registry = ModelRegistry::new(temp.path());
        registry
            .register_lag_linear("demand", 1, &LagLinearModel::new(0.0, vec![1.0]))
            .unwrap();
        registry
            .register_lag_linear("demand", 3, &LagLinearModel::new(1.0, vec![0.5]))
            .unwrap();
        fs::create_dir_all(temp.path().join("demand").join("v9")).unwrap();
        fs::create_dir_all(temp.path().join("demand").join("notes")).unwrap();

        assert_eq!(registry.list_versions("demand").unwrap(), vec![1, 3]);

        let (artifact, model) = registry.load_lag_linear(&model_ref(None)).unwrap();
        assert_eq!(artifact.version, 3);
        assert!(artifact.checksum_verified);
        assert_eq!(model.intercept, 1.0);

        let (pinned, _) = registry.load_lag_linear(&model_ref(Some(1))).unwrap();
        assert_eq!(pinned.version, 1);
    }

    #[test]
    fn missing_model_or_version_is_reported() {
        let temp = tempdir().unwrap();
        let registry = ModelRegistry::new(temp.path());
        assert!(matches!(
            registry.resolve(&model_ref(None)),
            Err(ModelRegistryError::ModelNotFound { .. })
        ));

        registry
            .register_lag_linear("demand", 1, &LagLinearModel::new(0.0, vec![1.0]))
            .unwrap();
        assert!(matches!(
            registry.resolve(&model_ref(Some(2))),
            Err(ModelRegistryError::VersionNotFound { version: 2, .. })
        ));
    }

    #[test]
    fn tampered_artifact_fails_checksum() {
        let temp = tempdir().unwrap();
        let registry = ModelRegistry::new(temp.path());
        let artifact = registry
            .register_lag_linear("demand", 1, &LagLinearModel::new(0.0, vec![1.0]))
            .unwrap();
        fs::write(
            &artifact.model_path,
            br#"{"intercept": 100.0, "lag_weights": [1.0]}"#,
        )
        .unwrap();

        let err = registry.load_lag_linear(&model_ref(Some(1))).unwrap_err();
        assert!(matches!(err, ModelRegistryError::ChecksumMismatch { .. }));
    }

    #[test]
    fn artifact_without_sidecar_loads_unverified() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("demand").join("v2");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(MODEL_ARTIFACT_FILE),
            br#"{"intercept": 0.5, "lag_weights": [1.0, 0.0]}"#,
        )
        .unwrap();

        let registry = ModelRegistry::new(temp.path());
        let (artifact, model) = registry.load_lag_linear(&model_ref(None)).unwrap();
        assert!(!artifact.checksum_verified);
        assert_eq!(model.lag_weights, vec![1.0, 0.0]);
        assert_eq!(model.feature_schema_fingerprint, None);
    }

    #[test]
    fn malformed_sidecar_is_rejected() {
        let temp = tempdir().unwrap();
        let registry = ModelRegistry::new(temp.path());
        let artifact = registry
            .register_lag_linear("demand", 1, &LagLinearModel::new(0.0, vec![1.0]))
            .unwrap();
        fs::write(checksum_path(&artifact.model_path), b"not-a-digest\n").unwrap();

        let err = registry.load_lag_linear(&model_ref(Some(1))).unwrap_err();
        assert!(matches!(
            err,
            ModelRegistryError::InvalidChecksumPayload { .. }
        ));
    }
}
