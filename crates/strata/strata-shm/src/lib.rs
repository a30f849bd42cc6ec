//! Named shared-memory segments.
//!
//! A segment is a file under a shared-memory directory (`/dev/shm` on Linux)
//! mapped into the address space of every process that opens it by name.
//! Two processes that open the same name with the same size see the same
//! physical pages.
//!
//! Writers open segments read-write: a missing segment is created, and an
//! existing segment of the wrong size is resized in place. Readers open
//! segments read-only and never create or resize anything.

use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// Longest segment name accepted (matches `NAME_MAX` on Linux).
pub const MAX_NAME_LEN: usize = 255;

/// How a process maps a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// What `SharedSegment::open` had to do to produce the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStatus {
    /// The segment did not exist and was created zero-filled.
    Created,
    /// An existing segment of the requested size was attached.
    Attached,
    /// An existing segment had the wrong size and was resized.
    Resized { previous: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("invalid segment name '{0}'")]
    InvalidName(String),

    #[error("segment '{}' does not exist", path.display())]
    NotFound { path: PathBuf },

    #[error("segment '{}' is {actual} bytes, expected {expected}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("failed to {op} segment '{}'", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where and how to open a named segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSpec {
    pub name: String,
    pub dir: PathBuf,
    pub access: Access,
}

impl SegmentSpec {
    /// A read-write spec for `name` in the default shared-memory directory.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: default_dir(),
            access: Access::ReadWrite,
        }
    }

    /// Places the segment in `dir` instead of the default directory.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Attach-only: never creates or resizes the backing file.
    pub fn read_only(mut self) -> Self {
        self.access = Access::ReadOnly;
        self
    }

    pub fn read_write(mut self) -> Self {
        self.access = Access::ReadWrite;
        self
    }

    /// Full path of the backing file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }
}

/// `/dev/shm` when it exists, otherwise the OS temp directory.
pub fn default_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Rejects names that would escape the segment directory or that the OS
/// would refuse.
pub fn validate_name(name: &str) -> Result<(), ShmError> {
    let bad = name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(ShmError::InvalidName(name.to_string()));
    }
    Ok(())
}

enum Mapping {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

/// A mapped named segment.
///
/// The mapping stays valid for the lifetime of this value; the backing file
/// outlives it and is only removed by [`unlink`].
pub struct SharedSegment {
    _file: File,
    _map: Mapping,
    /// Start of the mapping, captured once at open.
    base: *mut u8,
    len: usize,
    path: PathBuf,
    access: Access,
    status: OpenStatus,
}

// SAFETY: the mapping is owned by this value and never remapped; the raw
// pointer is only an address into it. Concurrent access to the mapped bytes
// is coordinated by the queue protocol layered on top.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Opens the segment described by `spec`, sized to exactly `size` bytes.
    ///
    /// # Errors
    /// - Invalid segment name
    /// - Read-only open of a file that does not exist (`NotFound`) or has
    ///   another size (`SizeMismatch`)
    /// - File creation, resizing or memory mapping fails
    pub fn open(spec: &SegmentSpec, size: u64) -> Result<Self, ShmError> {
        validate_name(&spec.name)?;
        match spec.access {
            Access::ReadWrite => Self::open_rw(spec, size),
            Access::ReadOnly => Self::open_ro(spec, size),
        }
    }

    fn open_rw(spec: &SegmentSpec, size: u64) -> Result<Self, ShmError> {
        let path = spec.path();
        let io_err = |op, source| ShmError::Io {
            op,
            path: path.clone(),
            source,
        };

        let (file, fresh) = match rw_options().create_new(true).open(&path) {
            Ok(file) => (file, true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                (rw_options().open(&path).map_err(|e| io_err("open", e))?, false)
            }
            Err(e) => return Err(io_err("create", e)),
        };

        let current = file.metadata().map_err(|e| io_err("stat", e))?.len();
        // a zero-length file is one another writer has not sized yet
        let status = if fresh || current == 0 {
            OpenStatus::Created
        } else if current != size {
            OpenStatus::Resized { previous: current }
        } else {
            OpenStatus::Attached
        };
        if current != size {
            file.set_len(size).map_err(|e| io_err("resize", e))?;
        }

        // SAFETY: the file is open read-write and sized above. Other
        // processes may shrink it concurrently, which is the documented
        // hazard of resizing a live segment.
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| io_err("map", e))?;
        let base = map.as_mut_ptr();
        let len = map.len();

        match status {
            OpenStatus::Created => info!(path = %path.display(), size, "created segment"),
            OpenStatus::Resized { previous } => {
                info!(path = %path.display(), previous, size, "resized segment")
            }
            OpenStatus::Attached => debug!(path = %path.display(), size, "attached segment"),
        }

        Ok(Self {
            _file: file,
            _map: Mapping::ReadWrite(map),
            base,
            len,
            path,
            access: Access::ReadWrite,
            status,
        })
    }

    fn open_ro(spec: &SegmentSpec, size: u64) -> Result<Self, ShmError> {
        let path = spec.path();
        let file = match OpenOptions::new().read(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ShmError::NotFound { path });
            }
            Err(source) => {
                return Err(ShmError::Io {
                    op: "open",
                    path,
                    source,
                });
            }
        };

        let actual = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(source) => {
                return Err(ShmError::Io {
                    op: "stat",
                    path,
                    source,
                });
            }
        };
        if actual != size {
            return Err(ShmError::SizeMismatch {
                path,
                expected: size,
                actual,
            });
        }

        // SAFETY: read-only mapping of a file we just validated the size of.
        let map = match unsafe { Mmap::map(&file) } {
            Ok(map) => map,
            Err(source) => {
                return Err(ShmError::Io {
                    op: "map",
                    path,
                    source,
                });
            }
        };
        let base = map.as_ptr() as *mut u8;
        let len = map.len();
        debug!(path = %path.display(), size, "attached segment read-only");

        Ok(Self {
            _file: file,
            _map: Mapping::ReadOnly(map),
            base,
            len,
            path,
            access: Access::ReadOnly,
            status: OpenStatus::Attached,
        })
    }

    /// Start of the mapping. Must not be written through unless
    /// [`is_writable`](Self::is_writable) is true.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.access == Access::ReadWrite
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// Whether this open created, attached to, or resized the file.
    pub fn status(&self) -> OpenStatus {
        self.status
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("access", &self.access)
            .field("status", &self.status)
            .finish()
    }
}

fn rw_options() -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    #[cfg(unix)]
    opts.mode(0o600);
    opts
}

/// Removes the backing file of a segment. Existing mappings stay valid until
/// their owners drop them.
///
/// # Errors
/// `NotFound` when there is no such file; `Io` for any other failure.
pub fn unlink(spec: &SegmentSpec) -> Result<(), ShmError> {
    validate_name(&spec.name)?;
    let path = spec.path();
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ShmError::NotFound { path }),
        Err(source) => Err(ShmError::Io {
            op: "unlink",
            path,
            source,
        }),
    }
}
