//! GraphQL operations against the backend. Consumed as typed operations per
//! the scope notes: no schema design happens here beyond the shapes these
//! operations need.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::retry::{RetryError, RetryingTransport};

#[derive(Debug, thiserror::Error)]
pub enum GraphQlError {
    #[error(transparent)]
    Transport(#[from] RetryError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("graphql errors: {0:?}")]
    Remote(Vec<String>),
    #[error("unexpected response shape: {0}")]
    Shape(&'static str),
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlRemoteError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlRemoteError {
    message: String,
}

pub struct GraphQlClient {
    transport: RetryingTransport,
    endpoint: String,
}

#[derive(Debug, Default, Clone)]
pub struct UpsertedBucket {
    pub display_name: String,
    pub project: String,
    pub entity: String,
}

#[derive(Debug, Default, Clone)]
pub struct ArtifactIds {
    pub artifact_id: String,
    pub base_id: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ManifestUpload {
    pub manifest_id: String,
    pub upload_url: Option<String>,
    pub upload_headers: Vec<(String, String)>,
}

impl GraphQlClient {
    pub fn new(transport: RetryingTransport, base_url: &str) -> Self {
        Self {
            transport,
            endpoint: format!("{}/graphql", base_url.trim_end_matches('/')),
        }
    }

    async fn execute<T: for<'de> Deserialize<'de>>(&self, body: Value) -> Result<T, GraphQlError> {
        let response = self.transport.post_json(&self.endpoint, body).await?;
        let envelope: GraphQlEnvelope<T> = response.json().await?;
        if !envelope.errors.is_empty() {
            return Err(GraphQlError::Remote(envelope.errors.into_iter().map(|e| e.message).collect()));
        }
        envelope.data.ok_or(GraphQlError::Shape("missing data field"))
    }

    pub async fn upsert_bucket(
        &self,
        run_id: &str,
        config_json: &str,
        tags: &[String],
    ) -> Result<UpsertedBucket, GraphQlError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "upsertBucket")]
            upsert_bucket: Bucket,
        }
        #[derive(Deserialize)]
        struct Bucket {
            #[serde(rename = "displayName")]
            display_name: String,
            project: String,
            entity: String,
        }

        let body = json!({
            "query": "mutation UpsertBucket($runId: String!, $config: JSONString, $tags: [String!]) { upsertBucket(input: {name: $runId, config: $config, tags: $tags}) { displayName project entity } }",
            "variables": { "runId": run_id, "config": config_json, "tags": tags },
        });

        let data: Data = self.execute(body).await?;
        Ok(UpsertedBucket {
            display_name: data.upsert_bucket.display_name,
            project: data.upsert_bucket.project,
            entity: data.upsert_bucket.entity,
        })
    }

    pub async fn run_upload_urls(&self, run_id: &str, paths: &[String]) -> Result<Vec<(String, String)>, GraphQlError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "runUploadUrls")]
            urls: Vec<UploadUrl>,
        }
        #[derive(Deserialize)]
        struct UploadUrl {
            name: String,
            url: String,
        }

        let body = json!({
            "query": "query RunUploadUrls($runId: String!, $paths: [String!]) { runUploadUrls(runId: $runId, paths: $paths) { name url } }",
            "variables": { "runId": run_id, "paths": paths },
        });

        let data: Data = self.execute(body).await?;
        Ok(data.urls.into_iter().map(|u| (u.name, u.url)).collect())
    }

    pub async fn notify_scriptable_run_alert(&self, run_id: &str, title: &str, text: &str) -> Result<(), GraphQlError> {
        let body = json!({
            "query": "mutation NotifyScriptableRunAlert($runId: String!, $title: String!, $text: String!) { notifyScriptableRunAlert(input: {runId: $runId, title: $title, text: $text}) { success } }",
            "variables": { "runId": run_id, "title": title, "text": text },
        });
        let _: Value = self.execute(body).await?;
        Ok(())
    }

    pub async fn create_artifact(&self, artifact_type: &str, name: &str) -> Result<ArtifactIds, GraphQlError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "createArtifact")]
            created: Created,
        }
        #[derive(Deserialize)]
        struct Created {
            #[serde(rename = "artifactId")]
            artifact_id: String,
            #[serde(rename = "baseId")]
            base_id: Option<String>,
        }

        let body = json!({
            "query": "mutation CreateArtifact($type: String!, $name: String!) { createArtifact(input: {artifactTypeName: $type, artifactCollectionName: $name}) { artifactId baseId } }",
            "variables": { "type": artifact_type, "name": name },
        });

        let data: Data = self.execute(body).await?;
        Ok(ArtifactIds {
            artifact_id: data.created.artifact_id,
            base_id: data.created.base_id,
        })
    }

    pub async fn create_manifest(
        &self,
        artifact_id: &str,
        base_id: Option<&str>,
        digest: &str,
        include_upload: bool,
    ) -> Result<ManifestUpload, GraphQlError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "createArtifactManifest")]
            created: Created,
        }
        #[derive(Deserialize)]
        struct Created {
            id: String,
            #[serde(rename = "uploadUrl")]
            upload_url: Option<String>,
            #[serde(rename = "uploadHeaders", default)]
            upload_headers: Vec<String>,
        }

        let body = json!({
            "query": "mutation CreateArtifactManifest($artifactId: String!, $baseId: String, $digest: String!, $includeUpload: Boolean!) { createArtifactManifest(input: {artifactId: $artifactId, baseArtifactId: $baseId, digest: $digest, includeUpload: $includeUpload}) { id uploadUrl uploadHeaders } }",
            "variables": { "artifactId": artifact_id, "baseId": base_id, "digest": digest, "includeUpload": include_upload },
        });

        let data: Data = self.execute(body).await?;
        let upload_headers = data
            .created
            .upload_headers
            .into_iter()
            .filter_map(|h| h.split_once(':').map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned())))
            .collect();

        Ok(ManifestUpload {
            manifest_id: data.created.id,
            upload_url: data.created.upload_url,
            upload_headers,
        })
    }

    pub async fn create_artifact_files(
        &self,
        artifact_id: &str,
        paths: &[String],
    ) -> Result<Vec<(String, String)>, GraphQlError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "createArtifactFiles")]
            files: Vec<File>,
        }
        #[derive(Deserialize)]
        struct File {
            name: String,
            #[serde(rename = "uploadUrl")]
            upload_url: String,
        }

        let body = json!({
            "query": "mutation CreateArtifactFiles($artifactId: String!, $paths: [String!]) { createArtifactFiles(input: {artifactId: $artifactId, paths: $paths}) { name uploadUrl } }",
            "variables": { "artifactId": artifact_id, "paths": paths },
        });

        let data: Data = self.execute(body).await?;
        Ok(data.files.into_iter().map(|f| (f.name, f.upload_url)).collect())
    }

    pub async fn commit_artifact(&self, artifact_id: &str) -> Result<(), GraphQlError> {
        let body = json!({
            "query": "mutation CommitArtifact($artifactId: String!) { commitArtifact(input: {artifactId: $artifactId}) { success } }",
            "variables": { "artifactId": artifact_id },
        });
        let _: Value = self.execute(body).await?;
        Ok(())
    }
}
