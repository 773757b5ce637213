use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;

use crate::error::MatchServiceError;

#[async_trait]
pub trait ReferenceImageSource: Send + Sync {
    async fn fetch(&self, image_reference: &str) -> Result<RgbImage, MatchServiceError>;
}

pub struct HttpReferenceImages {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpReferenceImages {
    pub fn new(timeout: Duration) -> Result<Self, MatchServiceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl ReferenceImageSource for HttpReferenceImages {
    async fn fetch(&self, image_reference: &str) -> Result<RgbImage, MatchServiceError> {
        let response = self.client.get(image_reference).send().await.map_err(|err| {
            if err.is_timeout() {
                MatchServiceError::Timeout(self.timeout)
            } else {
                MatchServiceError::Http(err)
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(MatchServiceError::Status {
                status: status.as_u16(),
                body: image_reference.to_string(),
            });
        }
        let bytes = response.bytes().await?;
        Ok(image::load_from_memory(&bytes)?.to_rgb8())
    }
}

/// Resolves references as paths, relative to `root` unless absolute.
pub struct DirectoryReferenceImages {
    root: PathBuf,
}

impl DirectoryReferenceImages {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ReferenceImageSource for DirectoryReferenceImages {
    async fn fetch(&self, image_reference: &str) -> Result<RgbImage, MatchServiceError> {
        let path = self.root.join(image_reference);
        let image = tokio::task::spawn_blocking(move || image::open(path))
            .await
            .map_err(|err| MatchServiceError::Decode(err.to_string()))??;
        Ok(image.to_rgb8())
    }
}
