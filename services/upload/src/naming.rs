use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How many times a colliding name is re-rolled before giving up
const MAX_ATTEMPTS: usize = 4;

/// Location of one stored object inside the upload tree
///
/// Layout: `<root>/<shard>/<object_id>[.<extension>]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ObjectRef {
    /// Two lower-case hex digits (8 random bits)
    pub shard: String,
    /// 32 lower-case hex digits (128 random bits)
    pub object_id: String,
    /// Sanitized extension as declared by the uploader
    pub extension: Option<String>,
}

impl ObjectRef {
    /// Leaf file name: `<object_id>` or `<object_id>.<extension>`
    pub fn file_name(&self) -> String {
        match &self.extension {
            Some(ext) => format!("{}.{}", self.object_id, ext),
            None => self.object_id.clone(),
        }
    }

    /// Full path under `root`
    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(&self.shard).join(self.file_name())
    }

    /// Hidden sibling the bytes are streamed into before the final rename
    pub fn temp_path(&self, root: &Path) -> PathBuf {
        root.join(&self.shard)
            .join(format!(".{}.part", self.object_id))
    }

    /// URL path relative to the service root: `file/<shard>/<leaf>`
    pub fn url_path(&self) -> String {
        format!("file/{}/{}", self.shard, self.file_name())
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.shard, self.file_name())
    }
}

/// Hands out random, collision-resistant storage locations
#[derive(Debug, Clone)]
pub struct NameAllocator {
    root: PathBuf,
}

impl NameAllocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pick a fresh location for an object and make sure its shard exists
    pub async fn allocate(&self, extension: Option<&str>) -> io::Result<ObjectRef> {
        let mut candidate = random_ref(extension);

        for attempt in 1..=MAX_ATTEMPTS {
            // Creating an existing directory is not an error
            tokio::fs::create_dir_all(self.root.join(&candidate.shard)).await?;

            let taken = tokio::fs::try_exists(candidate.path(&self.root)).await?
                || tokio::fs::try_exists(candidate.temp_path(&self.root)).await?;

            if !taken {
                debug!(object = %candidate, "Allocated storage name");
                return Ok(candidate);
            }

            warn!(object = %candidate, attempt, "Storage name collision, re-rolling");
            candidate = random_ref(extension);
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not allocate an unused storage name",
        ))
    }
}

fn random_ref(extension: Option<&str>) -> ObjectRef {
    let mut rng = rand::thread_rng();
    let shard: u8 = rng.gen();
    let object_id: u128 = rng.gen();

    ObjectRef {
        shard: format!("{shard:02x}"),
        object_id: format!("{object_id:032x}"),
        extension: extension.map(str::to_string),
    }
}
