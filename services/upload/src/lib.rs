//! Mediadrop Upload Service
//!
//! Anonymous, short-lived media sharing. Clients post a file, get back a URL,
//! and the file is deleted again once it is older than the retention period.
//!
//! ## Features
//!
//! - **Per-client rate limiting**: sliding-window admission keyed by remote
//!   address, safe under concurrent requests
//! - **Bounded ingestion**: uploads are streamed to a hidden temporary file,
//!   size-checked while reading, content-sniffed against an allow-list and
//!   renamed into place
//! - **Sharded random naming**: `<root>/<2 hex>/<32 hex>.<ext>`
//! - **Image bounding**: wide PNG/JPEG/GIF uploads are scaled down and
//!   re-encoded, best-effort
//! - **Expiry sweeps**: a background reaper deletes files past their age
//!
//! ## Architecture
//!
//! ```text
//!  POST /upload                                   GET /file/{shard}/{name}
//!       │                                                  │
//!       ▼                                                  ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐  ┌──────────────┐
//! │ Rate         │──▶│ Store        │──▶│ Image        │  │ Store        │
//! │ Limiter      │   │ (ingest)     │   │ Transform    │  │ (retrieve)   │
//! └──────────────┘   └──────────────┘   └──────────────┘  └──────────────┘
//!       │                   │                                     ▲
//!       ▼                   ▼                                     │
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐          │
//! │ Audit        │   │ uploads/     │◀──│ Reaper       │──────────┘
//! │ Log          │   │   {shard}/   │   │ (hourly)     │
//! └──────────────┘   └──────────────┘   └──────────────┘
//! ```

pub mod api;
pub mod audit;
pub mod config;
pub mod image_transform;
pub mod naming;
pub mod rate_limiter;
pub mod reaper;
pub mod service;
pub mod store;
pub mod validation;

pub use api::{create_router, AppState, UploadResponse};
pub use audit::{AuditLog, AuditOutcome, AuditRecord};
pub use config::Config;
pub use image_transform::{ImageTransform, TransformError, TransformOutcome};
pub use naming::{NameAllocator, ObjectRef};
pub use rate_limiter::{Admission, RateLimiter};
pub use reaper::{Reaper, SweepReport};
pub use service::{BackgroundTasks, UploadError, UploadService};
pub use store::{Store, StoreError, StoredFile, StoredObject, UploadRequest};
