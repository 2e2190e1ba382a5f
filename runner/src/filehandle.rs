use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{
    env, fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// tmp dir from the environment with default to /tmp
pub static TMP_DIR: Lazy<PathBuf> = Lazy::new(|| {
    env::var("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
});

/// environment variable pointing at the node-local mount of the shared file system
pub const SHARED_ENV: &str = "SHARED";

#[derive(Debug, Error)]
pub enum FileHandleError {
    #[error("File handler '{0}' must be one of 'tmp', 'shared' or 'memory'")]
    UnknownHandler(String),
    #[error("No shared directory configured and $SHARED is not set")]
    SharedNotSet,
    #[error("Failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FileHandleError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where file data lives while it is passed between kernels
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileHandlerKind {
    /// the host temp dir, only works if all workers share a host
    Tmp,
    /// some shared (e.g. NFS) file system mounted at $SHARED on every node
    Shared,
    /// no file system at all, bytes travel with the record
    #[default]
    Memory,
}

impl FromStr for FileHandlerKind {
    type Err = FileHandleError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_lowercase().as_str() {
            "tmp" => Ok(Self::Tmp),
            "shared" => Ok(Self::Shared),
            "memory" => Ok(Self::Memory),
            _ => Err(FileHandleError::UnknownHandler(name.to_string())),
        }
    }
}

/// File handling context of one workflow run.
///
/// Every handle created through a session is stored under a directory named after the
/// session id, so `purge` can drop all of them at once.
#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    kind: FileHandlerKind,
    shared_dir: Option<PathBuf>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(FileHandlerKind::default())
    }
}

impl Session {
    pub fn new(kind: FileHandlerKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            shared_dir: None,
        }
    }

    /// shared dir used when $SHARED is not set on a node
    pub fn with_shared_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shared_dir = Some(dir.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> FileHandlerKind {
        self.kind
    }

    pub fn shared_dir(&self) -> Option<&Path> {
        self.shared_dir.as_deref()
    }

    /// directory holding the files of this session, `None` for in-memory handling
    pub fn session_dir(&self) -> Result<Option<PathBuf>, FileHandleError> {
        match self.kind {
            FileHandlerKind::Tmp => Ok(Some(TMP_DIR.join(self.id.to_string()))),
            FileHandlerKind::Shared => {
                Ok(Some(shared_root(self.shared_dir.as_deref())?.join(self.id.to_string())))
            }
            FileHandlerKind::Memory => Ok(None),
        }
    }

    /// Create a handle for an existing file
    pub fn load(&self, path: impl AsRef<Path>) -> Result<FileHandle, FileHandleError> {
        let path = path.as_ref();
        let origin = fs::canonicalize(path).map_err(FileHandleError::io(path))?;

        let storage = match self.kind {
            FileHandlerKind::Memory => {
                let data = fs::read(&origin).map_err(FileHandleError::io(&origin))?;

                Storage::Memory(Arc::from(data))
            }
            FileHandlerKind::Tmp => {
                let target = self.copy_into(&TMP_DIR, &origin)?;

                Storage::Stored(Arc::new(OwnedFile {
                    location: Location::Absolute(target),
                }))
            }
            FileHandlerKind::Shared => {
                let root = shared_root(self.shared_dir.as_deref())?;
                let target = self.copy_into(&root, &origin)?;
                // keep only the part below the shared root, other nodes mount it elsewhere
                let relative = target
                    .strip_prefix(&root)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|_| target.clone());

                Storage::Stored(Arc::new(OwnedFile {
                    location: Location::Shared {
                        relative,
                        fallback: self.shared_dir.clone(),
                    },
                }))
            }
        };

        debug!(origin = ?origin, kind = ?self.kind, "Loaded file handle");

        Ok(FileHandle { origin, storage })
    }

    /// Remove all files stored for this session
    pub fn purge(&self) -> Result<(), FileHandleError> {
        if let Some(dir) = self.session_dir()? {
            match fs::remove_dir_all(&dir) {
                Ok(()) => debug!(dir = ?dir, "Purged session directory"),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(FileHandleError::Io { path: dir, source: error }),
            }
        }

        Ok(())
    }

    fn copy_into(&self, root: &Path, origin: &Path) -> Result<PathBuf, FileHandleError> {
        let dir = root.join(self.id.to_string());
        fs::create_dir_all(&dir).map_err(FileHandleError::io(&dir))?;

        let mut name = Uuid::new_v4().to_string();
        if let Some(extension) = origin.extension() {
            name.push('.');
            name.push_str(&extension.to_string_lossy());
        }

        let target = dir.join(name);
        fs::copy(origin, &target).map_err(FileHandleError::io(origin))?;

        Ok(target)
    }
}

fn shared_root(fallback: Option<&Path>) -> Result<PathBuf, FileHandleError> {
    env::var_os(SHARED_ENV)
        .map(PathBuf::from)
        .or_else(|| fallback.map(Path::to_path_buf))
        .ok_or(FileHandleError::SharedNotSet)
}

#[derive(Debug)]
enum Location {
    Absolute(PathBuf),
    Shared {
        relative: PathBuf,
        fallback: Option<PathBuf>,
    },
}

impl Location {
    fn resolve(&self) -> Result<PathBuf, FileHandleError> {
        match self {
            Self::Absolute(path) => Ok(path.clone()),
            Self::Shared { relative, fallback } => {
                Ok(shared_root(fallback.as_deref())?.join(relative))
            }
        }
    }
}

/// File owned by a handle, removed once the last clone of the handle is dropped
#[derive(Debug)]
struct OwnedFile {
    location: Location,
}

impl Drop for OwnedFile {
    fn drop(&mut self) {
        match self.location.resolve() {
            Ok(path) => match fs::remove_file(&path) {
                Ok(()) => debug!(path = ?path, "Removed file behind dropped handle"),
                Err(error) => debug!(path = ?path, error = ?error, "Failed to remove file behind handle"),
            },
            Err(error) => warn!(error = ?error, "Failed to locate file behind dropped handle"),
        }
    }
}

#[derive(Debug, Clone)]
enum Storage {
    Stored(Arc<OwnedFile>),
    Memory(Arc<[u8]>),
}

/// Opaque reference to file data that can be materialized on any worker
#[derive(Debug, Clone)]
pub struct FileHandle {
    origin: PathBuf,
    storage: Storage,
}

impl FileHandle {
    /// absolute path of the file the handle was created from
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// Write a copy of the file to `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<PathBuf, FileHandleError> {
        let path = path.as_ref();

        match &self.storage {
            Storage::Stored(file) => {
                let source = file.location.resolve()?;
                if source != path {
                    fs::copy(&source, path).map_err(FileHandleError::io(&source))?;
                }
            }
            Storage::Memory(data) => fs::write(path, data).map_err(FileHandleError::io(path))?,
        }

        Ok(path.to_path_buf())
    }

    /// Path pointing at the file data
    ///
    /// In-memory handles are written to a fresh file in the temp dir for this.
    pub fn as_file(&self) -> Result<PathBuf, FileHandleError> {
        match &self.storage {
            Storage::Stored(file) => file.location.resolve(),
            Storage::Memory(_) => {
                let suffix = self
                    .origin
                    .extension()
                    .map(|extension| format!(".{}", extension.to_string_lossy()))
                    .unwrap_or_default();
                let (_, path) = tempfile::Builder::new()
                    .prefix("xflow-")
                    .suffix(&suffix)
                    .tempfile_in(TMP_DIR.as_path())
                    .and_then(|file| file.keep().map_err(|error| error.error))
                    .map_err(FileHandleError::io(&TMP_DIR))?;

                self.save(path)
            }
        }
    }

    /// Read the whole file
    pub fn read(&self) -> Result<Vec<u8>, FileHandleError> {
        match &self.storage {
            Storage::Stored(file) => {
                let path = file.location.resolve()?;
                fs::read(&path).map_err(FileHandleError::io(&path))
            }
            Storage::Memory(data) => Ok(data.to_vec()),
        }
    }
}

impl PartialEq for FileHandle {
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin
            && match (&self.storage, &other.storage) {
                (Storage::Stored(left), Storage::Stored(right)) => Arc::ptr_eq(left, right),
                (Storage::Memory(left), Storage::Memory(right)) => left == right,
                _ => false,
            }
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.origin.display())
    }
}
