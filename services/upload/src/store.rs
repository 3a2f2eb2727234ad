use crate::config::StorageConfig;
use crate::image_transform::ImageTransform;
use crate::naming::{NameAllocator, ObjectRef};
use crate::validation::{self, SNIFF_LEN};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Errors produced while ingesting or retrieving an object
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No file provided")]
    NoFile,

    #[error("File is empty")]
    EmptyFile,

    #[error("File too large (limit {limit} bytes)")]
    TooLarge { limit: u64 },

    #[error("Unsupported media type: {}", .detected.as_deref().unwrap_or("unknown"))]
    UnsupportedType { detected: Option<String> },

    #[error("File content is {detected} but its extension says {declared}")]
    TypeMismatch {
        declared: &'static str,
        detected: &'static str,
    },

    #[error("Object not found")]
    NotFound,

    #[error("Upload stream failed: {0}")]
    Body(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Errors the client can fix by changing the request
    pub fn is_client_error(&self) -> bool {
        !matches!(self, StoreError::Io(_))
    }
}

/// An upload as handed over by the transport layer
pub struct UploadRequest<S> {
    /// Remote address of the uploader
    pub client: String,
    /// Filename declared by the client; only its extension is used
    pub filename: String,
    /// Raw bytes of the file part
    pub body: S,
}

/// A persisted upload
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub object: ObjectRef,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    /// Media type detected from the first bytes
    pub media_type: Option<&'static str>,
}

/// A stored object opened for reading
#[derive(Debug)]
pub struct StoredFile {
    pub file: File,
    pub size_bytes: u64,
    pub content_type: &'static str,
}

/// Validates, names and persists uploads under the sharded upload tree
pub struct Store {
    config: StorageConfig,
    names: NameAllocator,
    transform: Option<Arc<ImageTransform>>,
}

impl Store {
    pub fn new(config: StorageConfig, transform: Option<ImageTransform>) -> Self {
        let names = NameAllocator::new(config.upload_root.clone());

        Self {
            config,
            names,
            transform: transform.map(Arc::new),
        }
    }

    /// Create the upload root if it does not exist yet
    pub async fn init(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(self.root()).await?;
        info!(root = %self.root().display(), "Upload store ready");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        self.names.root()
    }

    pub fn max_file_size(&self) -> u64 {
        self.config.max_file_size_bytes
    }

    /// Persist one upload
    ///
    /// The caller has already passed the rate limiter. Bytes are streamed
    /// into a hidden temporary file and renamed into place only after the
    /// size and content checks pass, so a partial or rejected upload never
    /// appears under its final name.
    #[instrument(skip(self, request), fields(client = %request.client, filename = %request.filename))]
    pub async fn ingest<S>(&self, request: UploadRequest<S>) -> Result<StoredObject, StoreError>
    where
        S: Stream<Item = Result<Bytes, StoreError>>,
    {
        if request.filename.is_empty() {
            return Err(StoreError::NoFile);
        }

        let extension = validation::extension_of(&request.filename);
        let object = self.names.allocate(extension.as_deref()).await?;
        let temp_path = object.temp_path(self.root());
        let final_path = object.path(self.root());

        let written = match self.write_part(&temp_path, request.body).await {
            Ok(written) => written,
            Err(e) => {
                discard(&temp_path).await;
                return Err(e);
            }
        };

        if let Err(e) = self.check_content(&written, extension.as_deref()) {
            discard(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            discard(&temp_path).await;
            return Err(e.into());
        }

        debug!(object = %object, size_bytes = written.size, "Upload persisted");

        if let Some(transform) = &self.transform {
            if transform.applies_to(extension.as_deref()) {
                self.run_transform(transform.clone(), final_path.clone()).await;
            }
        }

        let metadata = tokio::fs::metadata(&final_path).await?;
        let created_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(StoredObject {
            object,
            size_bytes: metadata.len(),
            created_at,
            media_type: written.media_type,
        })
    }

    /// Open a stored object for reading
    pub async fn retrieve(&self, shard: &str, name: &str) -> Result<StoredFile, StoreError> {
        if !validation::is_valid_shard(shard) || !validation::is_valid_object_name(name) {
            return Err(StoreError::NotFound);
        }

        let path = self.root().join(shard).join(name);

        // The reaper may delete the file between any two of these calls
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound);
        }

        let extension = name.split_once('.').map(|(_, ext)| ext);

        Ok(StoredFile {
            file,
            size_bytes: metadata.len(),
            content_type: validation::content_type_for(extension),
        })
    }

    /// Stream the body into `path`, enforcing the size limit while reading
    async fn write_part<S>(&self, path: &Path, body: S) -> Result<WrittenPart, StoreError>
    where
        S: Stream<Item = Result<Bytes, StoreError>>,
    {
        let limit = self.config.max_file_size_bytes;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;

        let mut body = std::pin::pin!(body);
        let mut size: u64 = 0;
        let mut head = Vec::with_capacity(SNIFF_LEN);

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;

            size += chunk.len() as u64;
            if size > limit {
                return Err(StoreError::TooLarge { limit });
            }

            if head.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
            }

            file.write_all(&chunk).await?;
        }

        if size == 0 {
            return Err(StoreError::EmptyFile);
        }

        file.flush().await?;
        file.sync_all().await?;

        Ok(WrittenPart {
            size,
            media_type: validation::detect_media_type(&head),
        })
    }

    /// Sniffed type must be allowed and agree with what the extension serves as
    fn check_content(
        &self,
        written: &WrittenPart,
        extension: Option<&str>,
    ) -> Result<(), StoreError> {
        if !self.config.enforce_content_type {
            return Ok(());
        }

        let detected = written.media_type.filter(|detected| {
            self.config
                .allowed_mime_types
                .iter()
                .any(|m| m.eq_ignore_ascii_case(detected))
        });
        let Some(detected) = detected else {
            return Err(StoreError::UnsupportedType {
                detected: written.media_type.map(str::to_string),
            });
        };

        let declared = validation::content_type_for(extension);
        if validation::is_compatible_type(declared, detected) {
            Ok(())
        } else {
            Err(StoreError::TypeMismatch { declared, detected })
        }
    }

    async fn run_transform(&self, transform: Arc<ImageTransform>, path: PathBuf) {
        let shown = path.display().to_string();
        let result = tokio::task::spawn_blocking(move || transform.apply(&path)).await;

        match result {
            Ok(Ok(outcome)) => {
                metrics::counter!("images.transformed", "outcome" => outcome.label()).increment(1);
                debug!(path = %shown, outcome = outcome.label(), "Image transform finished");
            }
            Ok(Err(e)) => {
                metrics::counter!("images.transformed", "outcome" => "failed").increment(1);
                warn!(path = %shown, error = %e, "Image compression failed, keeping original");
            }
            Err(e) => {
                metrics::counter!("images.transformed", "outcome" => "failed").increment(1);
                warn!(path = %shown, error = %e, "Image transform task panicked");
            }
        }
    }
}

struct WrittenPart {
    size: u64,
    media_type: Option<&'static str>,
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial upload");
        }
    }
}
