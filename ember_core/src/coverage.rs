//! Shared coverage region and the supervisor's record of what has been seen.

use std::io;
use std::ptr::NonNull;
use thiserror::Error;

/// Size of the coverage region in bytes.
pub const MAP_SIZE: usize = 1 << 16;

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("Failed to create shared memory segment: {0}")]
    Create(io::Error),
    #[error("Failed to attach shared memory segment {id}: {source}")]
    Attach { id: i32, source: io::Error },
}

enum Backing {
    Shared {
        id: i32,
        ptr: NonNull<u8>,
        owner: bool,
    },
    Local(Box<[u8]>),
}

/// Fixed-size byte region written by the instrumented child and read by the
/// supervisor after the child exits.
///
/// There is no locking: at most one child writes at any instant and the
/// supervisor only reads once that child is gone.
pub struct CoverageRegion {
    backing: Backing,
    len: usize,
}

// The region is only touched by one writer at a time; the pointer is valid
// for the lifetime of the attachment.
unsafe impl Send for CoverageRegion {}

impl CoverageRegion {
    /// Creates and attaches a private SysV segment. The segment is marked for
    /// removal when this handle is dropped.
    pub fn create(len: usize) -> Result<Self, CoverageError> {
        let id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                len,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if id < 0 {
            return Err(CoverageError::Create(io::Error::last_os_error()));
        }
        match Self::attach_raw(id, len, true) {
            Ok(region) => Ok(region),
            Err(e) => {
                unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
                Err(e)
            }
        }
    }

    /// Attaches a segment created by another process.
    pub fn attach(id: i32, len: usize) -> Result<Self, CoverageError> {
        Self::attach_raw(id, len, false)
    }

    fn attach_raw(id: i32, len: usize, owner: bool) -> Result<Self, CoverageError> {
        let raw = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if raw as isize == -1 {
            return Err(CoverageError::Attach { id, source: io::Error::last_os_error() });
        }
        let ptr = NonNull::new(raw as *mut u8).ok_or_else(|| CoverageError::Attach {
            id,
            source: io::Error::new(io::ErrorKind::Other, "shmat returned null"),
        })?;
        Ok(Self {
            backing: Backing::Shared { id, ptr, owner },
            len,
        })
    }

    /// A process-private region, used when no segment was handed over.
    /// Recording still works, nobody reads it.
    pub fn local(len: usize) -> Self {
        Self {
            backing: Backing::Local(vec![0u8; len].into_boxed_slice()),
            len,
        }
    }

    /// Segment id, if the region is shared.
    pub fn id(&self) -> Option<i32> {
        match self.backing {
            Backing::Shared { id, .. } => Some(id),
            Backing::Local(_) => None,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.id().is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Shared { ptr, .. } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), self.len)
            },
            Backing::Local(buf) => buf,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Shared { ptr, .. } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len)
            },
            Backing::Local(buf) => buf,
        }
    }

    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Drop for CoverageRegion {
    fn drop(&mut self) {
        if let Backing::Shared { id, ptr, owner } = self.backing {
            unsafe {
                libc::shmdt(ptr.as_ptr() as *const libc::c_void);
                if owner {
                    libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
                }
            }
        }
    }
}

impl std::fmt::Debug for CoverageRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageRegion")
            .field("id", &self.id())
            .field("len", &self.len)
            .finish()
    }
}

/// Outcome of comparing one trace against the virgin map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NewBits {
    None,
    /// Only hit counts of known locations changed.
    HitCount,
    /// At least one location was touched for the first time.
    NewLocation,
}

/// Bits not yet observed in any trace. A fresh map is all ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirginMap {
    bits: Vec<u8>,
}

impl VirginMap {
    pub fn new(len: usize) -> Self {
        Self { bits: vec![0xff; len] }
    }

    pub fn from_bytes(bits: Vec<u8>) -> Self {
        Self { bits }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Folds `trace` into the map and reports whether it contained anything new.
    pub fn has_new_bits(&mut self, trace: &[u8]) -> NewBits {
        let mut ret = NewBits::None;
        for (virgin, &hit) in self.bits.iter_mut().zip(trace) {
            if hit != 0 && (hit & *virgin) != 0 {
                let found = if *virgin == 0xff {
                    NewBits::NewLocation
                } else {
                    NewBits::HitCount
                };
                ret = ret.max(found);
                *virgin &= !hit;
            }
        }
        ret
    }

    /// Union of the knowledge of both maps.
    pub fn merge(&self, other: &VirginMap) -> VirginMap {
        let bits = self
            .bits
            .iter()
            .zip(other.bits.iter())
            .map(|(a, b)| a & b)
            .collect();
        VirginMap { bits }
    }

    /// Number of locations seen at least once.
    pub fn count_seen(&self) -> usize {
        self.bits.iter().filter(|&&b| b != 0xff).count()
    }
}
