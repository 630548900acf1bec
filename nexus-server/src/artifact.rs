//! Multi-step artifact upload: create the artifact, stage its manifest,
//! upload member files, then the manifest itself, then commit.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use camino::Utf8PathBuf;
use md5::{Digest, Md5};
use serde::Serialize;

use crate::graphql::GraphQlError;
use crate::graphql::GraphQlClient;
use crate::proto::ArtifactRecord;
use crate::uploader::{UploadError, Uploader};

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error(transparent)]
    GraphQl(#[from] GraphQlError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("failed to write manifest to {path}: {source}")]
    WriteManifest {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing manifest: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct StoragePolicyConfig {
    #[serde(rename = "storageLayout")]
    storage_layout: &'static str,
}

#[derive(Debug, Serialize)]
struct ManifestEntry {
    digest: String,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none", rename = "birthArtifactID")]
    birth_artifact_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ManifestV1 {
    version: u32,
    #[serde(rename = "storagePolicy")]
    storage_policy: &'static str,
    #[serde(rename = "storagePolicyConfig")]
    storage_policy_config: StoragePolicyConfig,
    contents: BTreeMap<String, ManifestEntry>,
}

pub struct ArtifactSaver<'a> {
    graphql: &'a GraphQlClient,
    uploader: &'a Uploader,
    files_dir: &'a camino::Utf8Path,
}

impl<'a> ArtifactSaver<'a> {
    pub fn new(graphql: &'a GraphQlClient, uploader: &'a Uploader, files_dir: &'a camino::Utf8Path) -> Self {
        Self {
            graphql,
            uploader,
            files_dir,
        }
    }

    pub async fn save(&self, artifact: &ArtifactRecord) -> Result<(), ArtifactError> {
        let created = self.graphql.create_artifact(&artifact.artifact_type, &artifact.name).await?;

        // Reserve the manifest row before we know its digest; the backend
        // issues no upload URL on this pass.
        self.graphql
            .create_manifest(&created.artifact_id, created.base_id.as_deref(), "", false)
            .await?;

        if !artifact.manifest.is_empty() {
            let paths: Vec<String> = artifact.manifest.iter().map(|entry| entry.path.clone()).collect();
            let upload_urls = self.graphql.create_artifact_files(&created.artifact_id, &paths).await?;

            for entry in &artifact.manifest {
                let Some((_, url)) = upload_urls.iter().find(|(name, _)| name == &entry.path) else {
                    warn!(path = %entry.path, "backend did not return an upload url for artifact file");
                    continue;
                };
                self.uploader
                    .upload_file(Utf8PathBuf::from(&entry.local_path), url.clone(), Vec::new())
                    .await?;
            }
        }

        let manifest = ManifestV1 {
            version: 1,
            storage_policy: "wandb-storage-policy-v1",
            storage_policy_config: StoragePolicyConfig { storage_layout: "V2" },
            contents: artifact
                .manifest
                .iter()
                .map(|entry| {
                    (
                        entry.path.clone(),
                        ManifestEntry {
                            digest: entry.digest.clone(),
                            size: entry.size,
                            birth_artifact_id: Some(created.artifact_id.clone()),
                        },
                    )
                })
                .collect(),
        };

        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        let digest = BASE64.encode(Md5::digest(&manifest_json));

        let manifest_path = self.files_dir.join(format!("{}_manifest.json", artifact.name));
        if let Some(parent) = manifest_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ArtifactError::WriteManifest {
                path: manifest_path.clone(),
                source,
            })?;
        }
        std::fs::write(&manifest_path, &manifest_json).map_err(|source| ArtifactError::WriteManifest {
            path: manifest_path.clone(),
            source,
        })?;

        let upload = self
            .graphql
            .create_manifest(&created.artifact_id, created.base_id.as_deref(), &digest, true)
            .await?;

        if let Some(url) = upload.upload_url {
            self.uploader.upload_file(manifest_path, url, upload.upload_headers).await?;
        }

        self.graphql.commit_artifact(&created.artifact_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_serializes_with_expected_shape() {
        let mut contents = BTreeMap::new();
        contents.insert(
            "model.pt".to_owned(),
            ManifestEntry {
                digest: "abc123".to_owned(),
                size: 42,
                birth_artifact_id: Some("artifact-1".to_owned()),
            },
        );
        let manifest = ManifestV1 {
            version: 1,
            storage_policy: "wandb-storage-policy-v1",
            storage_policy_config: StoragePolicyConfig { storage_layout: "V2" },
            contents,
        };

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["storagePolicyConfig"]["storageLayout"], "V2");
        assert_eq!(json["contents"]["model.pt"]["digest"], "abc123");
    }
}
