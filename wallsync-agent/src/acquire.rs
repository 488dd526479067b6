use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{Local, TimeDelta};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, warn};
use wallsync_core::{
    ImageFormat, Settings, SourceKind, artifact_file_name, classify_image_file,
};

pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_NAME_ATTEMPTS: u32 = 1_000;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("local image {path} is unavailable: {source}")]
    LocalFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("LocalImagePath is not set")]
    NoLocalPath,
    #[error("artifact write to {path} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} is not a recognised image")]
    NotAnImage { path: PathBuf },
}

/// A validated image ready to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub format: ImageFormat,
    /// `true` when the file lives in the managed artifact directory.
    pub managed: bool,
}

pub trait Acquire: Send + Sync {
    fn acquire(
        &self,
        settings: &Settings,
    ) -> impl Future<Output = Result<Artifact, AcquireError>> + Send;
}

impl<T: Acquire> Acquire for Arc<T> {
    fn acquire(
        &self,
        settings: &Settings,
    ) -> impl Future<Output = Result<Artifact, AcquireError>> + Send {
        (**self).acquire(settings)
    }
}

/// Downloads (or locates) the configured image and gates it through the validator.
#[derive(Debug, Clone)]
pub struct ImageAcquirer {
    client: reqwest::Client,
    artifact_dir: PathBuf,
}

impl ImageAcquirer {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Result<Self, AcquireError> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(AcquireError::Client)?;
        Ok(Self::with_client(client, artifact_dir))
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            artifact_dir: artifact_dir.into(),
        }
    }

    #[must_use]
    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    async fn download(&self, url: &str) -> Result<Artifact, AcquireError> {
        let response = self.client.get(url).send().await.map_err(|err| map_reqwest(url, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AcquireError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(|err| map_reqwest(url, err))?;

        let path = self.write_artifact(&body).await?;
        let format = classify_image_file(&path).unwrap_or(ImageFormat::Unknown);
        if !format.is_known() {
            if let Err(err) = fs::remove_file(&path).await {
                warn!(path = %path.display(), "failed to delete rejected download: {err}");
            }
            warn!(%url, bytes = body.len(), "downloaded payload is not an image");
            return Err(AcquireError::NotAnImage { path });
        }

        info!(%url, %format, path = %path.display(), "downloaded image");
        Ok(Artifact {
            path,
            format,
            managed: true,
        })
    }

    /// Writes `body` under a fresh timestamped name, stepping the timestamp by
    /// one millisecond while the name is taken.
    async fn write_artifact(&self, body: &[u8]) -> Result<PathBuf, AcquireError> {
        fs::create_dir_all(&self.artifact_dir)
            .await
            .map_err(|source| AcquireError::Write {
                path: self.artifact_dir.clone(),
                source,
            })?;

        let mut stamp = Local::now();
        let mut attempts = 0;
        loop {
            let path = self.artifact_dir.join(artifact_file_name(&stamp));
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let written = async {
                        file.write_all(body).await?;
                        file.flush().await
                    }
                    .await;
                    return match written {
                        Ok(()) => Ok(path),
                        Err(source) => {
                            let _ = fs::remove_file(&path).await;
                            Err(AcquireError::Write { path, source })
                        }
                    };
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    attempts += 1;
                    if attempts >= MAX_NAME_ATTEMPTS {
                        return Err(AcquireError::Write { path, source: err });
                    }
                    stamp += TimeDelta::milliseconds(1);
                }
                Err(source) => return Err(AcquireError::Write { path, source }),
            }
        }
    }
}

impl Acquire for ImageAcquirer {
    async fn acquire(&self, settings: &Settings) -> Result<Artifact, AcquireError> {
        match settings.source_kind {
            SourceKind::Url => self.download(settings.image_url.trim()).await,
            SourceKind::LocalFile => {
                let path = settings
                    .local_image_path
                    .clone()
                    .ok_or(AcquireError::NoLocalPath)?;
                acquire_local(path)
            }
        }
    }
}

/// The user's file is validated where it is and never copied or deleted.
fn acquire_local(path: PathBuf) -> Result<Artifact, AcquireError> {
    let format = match classify_image_file(&path) {
        Ok(format) => format,
        Err(source) => return Err(AcquireError::LocalFile { path, source }),
    };
    if !format.is_known() {
        return Err(AcquireError::NotAnImage { path });
    }
    info!(path = %path.display(), %format, "using local image");
    Ok(Artifact {
        path,
        format,
        managed: false,
    })
}

fn map_reqwest(url: &str, err: reqwest::Error) -> AcquireError {
    if err.is_timeout() {
        AcquireError::Timeout {
            url: url.to_owned(),
        }
    } else {
        AcquireError::Request {
            url: url.to_owned(),
            source: err,
        }
    }
}
