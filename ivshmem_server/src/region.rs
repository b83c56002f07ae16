//! Shared memory backing store.
//!
//! The region is created once at startup and its descriptor is handed to
//! every peer. Sizing rounds the requested size up to a power of two and,
//! if the store refuses that size (hugetlbfs only accepts multiples of its
//! page size), keeps doubling up to [`MAX_REGION_SIZE`].

use ivshmem_common::consts::MAX_REGION_SIZE;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Permission bits of the backing store (`S_IRWXU`).
const REGION_MODE: u32 = 0o700;

/// Errors raised while creating or removing the region.
#[derive(Error, Debug)]
pub enum RegionError {
    /// Backing store could not be opened or created.
    #[error("cannot open shm file {}: {source}", path.display())]
    Open {
        /// Backing store path.
        path: PathBuf,
        /// Source IO error
        #[source]
        source: std::io::Error,
    },

    /// Smallest power of two covering the request is above the ceiling.
    #[error("requested size {requested} exceeds the {max} byte limit")]
    SizeExceedsCeiling {
        /// Requested size in bytes.
        requested: u64,
        /// Ceiling in bytes.
        max: u64,
    },

    /// Every candidate size up to the ceiling was rejected.
    #[error("ftruncate({}) failed for {requested} bytes: {source}", path.display())]
    Resize {
        /// Backing store path.
        path: PathBuf,
        /// Requested size in bytes.
        requested: u64,
        /// Error of the last attempt.
        #[source]
        source: std::io::Error,
    },

    /// Backing store could not be removed.
    #[error("cannot remove shm file {}: {source}", path.display())]
    Remove {
        /// Backing store path.
        path: PathBuf,
        /// Source IO error
        #[source]
        source: std::io::Error,
    },
}

/// Kind of object backing the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionBacking {
    /// POSIX shared memory object (`shm_open`), e.g. `ivshmem`.
    PosixShm,
    /// Regular file, e.g. on hugetlbfs (`/dev/hugepages/ivshmem`).
    File,
}

impl RegionBacking {
    /// Pick the backing for `path`.
    ///
    /// A bare name, with or without one leading `/`, is a POSIX shared
    /// memory object; anything with an interior `/` is a file path.
    pub fn for_path(path: &Path) -> Self {
        let bytes = path.as_os_str().as_bytes();
        let name = bytes.strip_prefix(b"/").unwrap_or(bytes);
        if name.is_empty() || name.contains(&b'/') {
            Self::File
        } else {
            Self::PosixShm
        }
    }
}

/// The shared memory region held by the server for its whole lifetime.
#[derive(Debug)]
pub struct SharedRegion {
    file: File,
    size: u64,
    backing: RegionBacking,
    path: PathBuf,
}

impl SharedRegion {
    /// Size the backing store was set to.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Kind of backing store.
    pub fn backing(&self) -> RegionBacking {
        self.backing
    }

    /// Configured backing path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for SharedRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Candidate sizes for a request: the next power of two at or above
/// `requested`, then each doubling, up to [`MAX_REGION_SIZE`].
pub fn size_candidates(requested: u64) -> impl Iterator<Item = u64> {
    let first = requested
        .max(1)
        .checked_next_power_of_two()
        .filter(|size| *size <= MAX_REGION_SIZE);
    std::iter::successors(first, |size| {
        size.checked_mul(2).filter(|next| *next <= MAX_REGION_SIZE)
    })
}

/// Walk [`size_candidates`] until `resize` accepts one.
///
/// Returns the accepted size. `resize` is `ftruncate(2)` in production.
pub fn fit_region_size<F>(path: &Path, requested: u64, mut resize: F) -> Result<u64, RegionError>
where
    F: FnMut(u64) -> std::io::Result<()>,
{
    let mut last_error = None;
    for candidate in size_candidates(requested) {
        match resize(candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) => last_error = Some(e),
        }
    }

    match last_error {
        Some(source) => Err(RegionError::Resize {
            path: path.to_path_buf(),
            requested,
            source,
        }),
        None => Err(RegionError::SizeExceedsCeiling {
            requested,
            max: MAX_REGION_SIZE,
        }),
    }
}

/// Open or create the backing store at `path` and size it to at least
/// `requested` bytes.
pub fn create_region(path: &Path, requested: u64) -> Result<SharedRegion, RegionError> {
    let backing = RegionBacking::for_path(path);
    let file = open_backing(path, backing).map_err(|source| RegionError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let size = fit_region_size(path, requested, |candidate| file.set_len(candidate))?;

    Ok(SharedRegion {
        file,
        size,
        backing,
        path: path.to_path_buf(),
    })
}

/// Unlink the backing store. Existing mappings and descriptors stay valid.
pub fn remove_region(path: &Path) -> Result<(), RegionError> {
    let result = match RegionBacking::for_path(path) {
        RegionBacking::PosixShm => shm_unlink(&shm_name(path)).map_err(std::io::Error::from),
        RegionBacking::File => std::fs::remove_file(path),
    };
    result.map_err(|source| RegionError::Remove {
        path: path.to_path_buf(),
        source,
    })
}

fn open_backing(path: &Path, backing: RegionBacking) -> std::io::Result<File> {
    match backing {
        RegionBacking::PosixShm => {
            let fd = shm_open(
                &shm_name(path),
                OFlag::O_CREAT | OFlag::O_RDWR,
                Mode::S_IRWXU,
            )?;
            Ok(File::from(fd))
        }
        RegionBacking::File => OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(REGION_MODE)
            .open(path),
    }
}

/// POSIX shm names start with exactly one `/`.
fn shm_name(path: &Path) -> PathBuf {
    if path.as_os_str().as_bytes().starts_with(b"/") {
        path.to_path_buf()
    } else {
        Path::new("/").join(path)
    }
}
