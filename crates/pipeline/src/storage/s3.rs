//! S3-compatible store (Cloudflare R2, MinIO, AWS).

use super::{
    partial_path, ListPage, ObjectInfo, ObjectStore, PutOptions, StorageError, StorageResult,
};
use crate::config::StorageConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Object store client bound to one bucket.
///
/// Built once per batch and shared by every job in it.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Create a client from the `[storage]` config section.
    pub fn new(config: &StorageConfig) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::config_error("storage.bucket is empty"));
        }
        if config.endpoint_url.is_empty() {
            return Err(StorageError::config_error("storage.endpoint_url is empty"));
        }
        if config.access_key_id.is_empty() || config.secret_access_key.is_empty() {
            return Err(StorageError::config_error("storage credentials are empty"));
        }

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "hls-forge",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_page(&self, prefix: &str, token: Option<String>) -> StorageResult<ListPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix);
        if let Some(token) = token {
            request = request.continuation_token(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StorageError::ListFailed(e.to_string()))?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|obj| {
                obj.key().map(|key| ObjectInfo {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                })
            })
            .collect();

        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(String::from)
        } else {
            None
        };

        Ok(ListPage {
            objects,
            next_token,
        })
    }

    async fn put_file(&self, key: &str, path: &Path, options: &PutOptions) -> StorageResult<u64> {
        let size = tokio::fs::metadata(path).await?.len();
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(&options.content_type);
        if let Some(cache_control) = &options.cache_control {
            request = request.cache_control(cache_control);
        }

        request
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        debug!(key, bytes = size, "Uploaded object");
        Ok(size)
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> StorageResult<u64> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::not_found(key)
                } else {
                    StorageError::download_failed(e.to_string())
                }
            })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = partial_path(path);
        let mut file = tokio::fs::File::create(&part).await?;
        let mut body = response.body;
        let mut written = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| StorageError::download_failed(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&part, path).await?;

        debug!(key, bytes = written, "Downloaded object");
        Ok(written)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::delete_failed(e.to_string()))?;
        Ok(())
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectInfo>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0).max(0) as u64,
            })),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(StorageError::HeadFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_incomplete_config() {
        let config = StorageConfig::default();
        assert!(matches!(
            S3Store::new(&config),
            Err(StorageError::ConfigError(_))
        ));

        let config = StorageConfig {
            bucket: "media".into(),
            ..StorageConfig::default()
        };
        assert!(matches!(
            S3Store::new(&config),
            Err(StorageError::ConfigError(_))
        ));

        let config = StorageConfig {
            endpoint_url: "https://account.r2.cloudflarestorage.com".into(),
            bucket: "media".into(),
            access_key_id: "id".into(),
            ..StorageConfig::default()
        };
        assert!(matches!(
            S3Store::new(&config),
            Err(StorageError::ConfigError(_))
        ));
    }

    #[test]
    fn test_builds_client_without_network() {
        let config = StorageConfig {
            endpoint_url: "https://account.r2.cloudflarestorage.com".into(),
            bucket: "media".into(),
            access_key_id: "id".into(),
            secret_access_key: "secret".into(),
            ..StorageConfig::default()
        };
        let store = S3Store::new(&config).unwrap();
        assert_eq!(store.bucket(), "media");
    }
}
