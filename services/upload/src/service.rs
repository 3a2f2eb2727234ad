use crate::audit::{AuditLog, AuditOutcome};
use crate::config::Config;
use crate::image_transform::ImageTransform;
use crate::rate_limiter::{Admission, RateLimiter};
use crate::reaper::Reaper;
use crate::store::{Store, StoreError, StoredFile, StoredObject, UploadRequest};
use anyhow::Context;
use bytes::Bytes;
use futures::Stream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name recorded in the audit trail when no filename is known yet
const UNKNOWN_NAME: &str = "-";

/// Errors surfaced to the HTTP layer for an upload attempt
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Rate limit exceeded. Try again later.")]
    RateLimited { retry_after_secs: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Admission, ingestion, retrieval and background maintenance in one place
pub struct UploadService {
    config: Config,
    limiter: RateLimiter,
    store: Store,
    audit: AuditLog,
}

impl UploadService {
    pub fn new(config: Config, audit: AuditLog) -> Self {
        let transform = config
            .image
            .enabled
            .then(|| ImageTransform::new(&config.image));

        Self {
            limiter: RateLimiter::from_config(&config),
            store: Store::new(config.storage.clone(), transform),
            audit,
            config,
        }
    }

    /// Build the service, opening the audit file and the upload root
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let audit = match &config.audit.path {
            Some(path) => AuditLog::open(path)
                .with_context(|| format!("Failed to open audit log {}", path.display()))?,
            None => AuditLog::disabled(),
        };

        let service = Self::new(config, audit);
        service
            .store
            .init()
            .await
            .context("Failed to create upload root")?;

        Ok(service)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn max_file_size(&self) -> u64 {
        self.store.max_file_size()
    }

    /// Rate-limit check for `client`; must pass before the body is read
    pub fn admit(&self, client: &str) -> Result<(), UploadError> {
        match self.limiter.admit(client, Instant::now()) {
            Admission::Admitted => Ok(()),
            Admission::Rejected { retry_after_secs } => {
                metrics::counter!("uploads.rejected", "reason" => "rate_limited").increment(1);
                self.audit.record(client, UNKNOWN_NAME, AuditOutcome::Fail);
                Err(UploadError::RateLimited { retry_after_secs })
            }
        }
    }

    /// Record a request that was admitted but carried no file part
    pub fn reject(&self, client: &str, error: StoreError) -> UploadError {
        metrics::counter!("uploads.rejected", "reason" => reason_label(&error)).increment(1);
        self.audit.record(client, UNKNOWN_NAME, AuditOutcome::Fail);
        UploadError::Store(error)
    }

    /// Persist an admitted upload and audit the outcome
    pub async fn accept<S>(&self, request: UploadRequest<S>) -> Result<StoredObject, UploadError>
    where
        S: Stream<Item = Result<Bytes, StoreError>>,
    {
        let started = Instant::now();
        let client = request.client.clone();
        let filename = request.filename.clone();

        match self.store.ingest(request).await {
            Ok(stored) => {
                metrics::counter!("uploads.accepted").increment(1);
                metrics::counter!("uploads.bytes").increment(stored.size_bytes);
                metrics::histogram!("uploads.duration_seconds")
                    .record(started.elapsed().as_secs_f64());

                self.audit
                    .record(&client, &stored.object.to_string(), AuditOutcome::Success);
                info!(
                    client = %client,
                    object = %stored.object,
                    size_bytes = stored.size_bytes,
                    "Upload stored"
                );
                Ok(stored)
            }
            Err(e) => {
                metrics::counter!("uploads.rejected", "reason" => reason_label(&e)).increment(1);

                let name = if filename.is_empty() {
                    UNKNOWN_NAME
                } else {
                    filename.as_str()
                };
                self.audit.record(&client, name, AuditOutcome::Fail);

                if e.is_client_error() {
                    debug!(client = %client, error = %e, "Upload rejected");
                } else {
                    error!(client = %client, error = %e, "Upload failed");
                }
                Err(e.into())
            }
        }
    }

    /// Open a stored object; expired or unknown objects are `NotFound`
    pub async fn retrieve(&self, shard: &str, name: &str) -> Result<StoredFile, StoreError> {
        let result = self.store.retrieve(shard, name).await;

        match &result {
            Ok(_) => metrics::counter!("downloads.served").increment(1),
            Err(StoreError::NotFound) => metrics::counter!("downloads.not_found").increment(1),
            Err(e) => warn!(shard, name, error = %e, "Failed to open stored object"),
        }

        result
    }

    /// Start the expiry sweep and the rate-limiter purge loop
    pub fn start_background(self: &Arc<Self>) -> BackgroundTasks {
        let shutdown = CancellationToken::new();
        let reaper = Reaper::from_config(&self.config);

        let handles = vec![
            tokio::spawn(reaper.run(shutdown.clone())),
            tokio::spawn(purge_loop(
                self.clone(),
                self.config.purge_interval(),
                shutdown.clone(),
            )),
        ];

        BackgroundTasks { shutdown, handles }
    }
}

/// Handles to the long-lived maintenance tasks
pub struct BackgroundTasks {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signal every task to stop and wait for them, up to `grace`
    pub async fn shutdown(self, grace: Duration) {
        self.shutdown.cancel();

        for handle in self.handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Background task ended abnormally"),
                Err(_) => warn!("Background task did not stop within grace period"),
            }
        }

        info!("Background tasks stopped");
    }
}

async fn purge_loop(service: Arc<UploadService>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = service.limiter.purge_idle(Instant::now());
                if removed > 0 {
                    debug!(
                        removed,
                        tracked = service.limiter.tracked_clients(),
                        "Purged idle rate-limit entries"
                    );
                }
            }
        }
    }
}

fn reason_label(error: &StoreError) -> &'static str {
    match error {
        StoreError::NoFile => "no_file",
        StoreError::EmptyFile => "empty_file",
        StoreError::TooLarge { .. } => "too_large",
        StoreError::UnsupportedType { .. } => "unsupported_type",
        StoreError::TypeMismatch { .. } => "type_mismatch",
        StoreError::NotFound => "not_found",
        StoreError::Body(_) => "body",
        StoreError::Io(_) => "io",
    }
}
