//! Named shared-memory regions for the bridge transport.
//!
//! Regions are plain files in the OS shared-memory directory (`/dev/shm` on
//! Linux, the temp dir elsewhere), created by the server with a random
//! 6-character suffix and attached by the client using the same name. Uses
//! `UnsafeCell` for interior mutability since the mapping is shared between
//! processes and written through an immutable reference. This is safe
//! because every region has exactly one writer per byte range, fixed per
//! channel, and the semaphore rendezvous orders pool access.

use crate::error::{BridgeError, Result};
use crate::protocol::SHM_SUFFIX_LEN;
use memmap2::MmapMut;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;

pub struct ShmRegion {
    file: File,
    mmap: UnsafeCell<Option<MmapMut>>,
    name: String,
    suffix: String,
    size: usize,
    is_owner: bool,
}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("name", &self.name)
            .field("suffix", &self.suffix)
            .field("size", &self.size)
            .field("is_owner", &self.is_owner)
            .finish()
    }
}

// SAFETY: the UnsafeCell only provides interior mutability over the mapping.
// Writer/reader roles are fixed per channel at the layer above, and the
// underlying memory is already shared with another process at the OS level.
unsafe impl Sync for ShmRegion {}
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    /// Create a fresh region under `prefix` with a random suffix, retrying
    /// on name collisions until an unused name is found.
    pub fn create_temp(prefix: &str) -> Result<Self> {
        loop {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(SHM_SUFFIX_LEN)
                .map(char::from)
                .collect();
            let name = format!("{prefix}{suffix}");

            let mut options = OpenOptions::new();
            options.read(true).write(true).create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }

            match options.open(Self::region_path(&name)) {
                Ok(file) => {
                    return Ok(Self {
                        file,
                        mmap: UnsafeCell::new(None),
                        name,
                        suffix,
                        size: 0,
                        is_owner: true,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(BridgeError::ShmCreate(format!(
                        "cannot create region '{name}': {e}"
                    )));
                }
            }
        }
    }

    /// Attach to a region created by the other side.
    pub fn attach(name: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(Self::region_path(name))
            .map_err(|e| BridgeError::ShmAttach(format!("cannot open region '{name}': {e}")))?;

        let suffix = name
            .get(name.len().saturating_sub(SHM_SUFFIX_LEN)..)
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            file,
            mmap: UnsafeCell::new(None),
            name: name.to_string(),
            suffix,
            size: 0,
            is_owner: false,
        })
    }

    /// Map the region at `size` bytes. The owner grows the backing file
    /// first; the attaching side maps whatever the owner published. Any
    /// previous mapping is dropped, which is how resize works on both sides.
    pub fn map(&mut self, size: usize) -> Result<*mut u8> {
        if size == 0 {
            return Err(BridgeError::ShmMap("cannot map zero bytes".into()));
        }

        self.unmap();

        if self.is_owner {
            self.file
                .set_len(size as u64)
                .map_err(|e| BridgeError::ShmMap(format!("resize '{}': {e}", self.name)))?;
        }

        let mmap = unsafe { MmapMut::map_mut(&self.file) }
            .map_err(|e| BridgeError::ShmMap(format!("mmap '{}': {e}", self.name)))?;
        if mmap.len() < size {
            return Err(BridgeError::ShmMap(format!(
                "region '{}' is {} bytes, need {size}",
                self.name,
                mmap.len()
            )));
        }
        // Keep the RT path free of page faults where the OS allows it.
        #[cfg(unix)]
        let _ = mmap.lock();

        self.size = size;
        let slot = unsafe { &mut *self.mmap.get() };
        *slot = Some(mmap);
        Ok(slot.as_mut().map(|m| m.as_mut_ptr()).unwrap_or(std::ptr::null_mut()))
    }

    /// Drop the current mapping, if any. Idempotent.
    pub fn unmap(&mut self) {
        let slot = unsafe { &mut *self.mmap.get() };
        *slot = None;
        self.size = 0;
    }

    pub fn is_mapped(&self) -> bool {
        unsafe { (*self.mmap.get()).is_some() }
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        match unsafe { &mut *self.mmap.get() } {
            Some(m) => m.as_mut_ptr(),
            None => std::ptr::null_mut(),
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Full region name (prefix + suffix).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The random 6-character suffix handed to the child process.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    fn region_path(name: &str) -> PathBuf {
        Self::region_dir().join(name)
    }

    fn region_dir() -> PathBuf {
        #[cfg(target_os = "linux")]
        return PathBuf::from("/dev/shm");

        #[cfg(not(target_os = "linux"))]
        return std::env::temp_dir();
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        self.unmap();
        // Only the owner unlinks; both sides just unmap.
        if self.is_owner {
            let _ = std::fs::remove_file(Self::region_path(&self.name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_prefix(label: &str) -> String {
        format!("halcyon-test_{label}_{}_", std::process::id())
    }

    #[test]
    fn test_create_map_attach_round_trip() {
        let prefix = test_prefix("rt");
        let mut owner = ShmRegion::create_temp(&prefix).unwrap();
        assert!(owner.is_owner());
        assert_eq!(owner.suffix().len(), SHM_SUFFIX_LEN);

        let ptr = owner.map(4096).unwrap();
        assert!(!ptr.is_null());
        unsafe { std::ptr::write_bytes(ptr, 0, 4096) };
        unsafe { *ptr.add(100) = 0xAB };

        let mut other = ShmRegion::attach(owner.name()).unwrap();
        assert!(!other.is_owner());
        assert_eq!(other.suffix(), owner.suffix());
        other.map(4096).unwrap();
        assert_eq!(unsafe { *other.as_mut_ptr().add(100) }, 0xAB);
    }

    #[test]
    fn test_attach_missing_region_fails() {
        let err = ShmRegion::attach("halcyon-test_missing_zzzzzz").unwrap_err();
        assert!(matches!(err, BridgeError::ShmAttach(_)));
    }

    #[test]
    fn test_owner_unlinks_on_drop() {
        let prefix = test_prefix("unlink");
        let name;
        {
            let mut owner = ShmRegion::create_temp(&prefix).unwrap();
            owner.map(128).unwrap();
            name = owner.name().to_string();
            // A non-owner dropping must not unlink.
            let attached = ShmRegion::attach(&name).unwrap();
            drop(attached);
            assert!(ShmRegion::attach(&name).is_ok());
        }
        assert!(ShmRegion::attach(&name).is_err());
    }

    #[test]
    fn test_owner_remap_grows_region() {
        let prefix = test_prefix("grow");
        let mut owner = ShmRegion::create_temp(&prefix).unwrap();
        owner.map(1024).unwrap();
        assert_eq!(owner.len(), 1024);
        owner.map(8192).unwrap();
        assert_eq!(owner.len(), 8192);
        unsafe { *owner.as_mut_ptr().add(8000) = 1 };
    }

    #[test]
    fn test_map_zero_rejected() {
        let prefix = test_prefix("zero");
        let mut owner = ShmRegion::create_temp(&prefix).unwrap();
        assert!(matches!(owner.map(0), Err(BridgeError::ShmMap(_))));
    }
}
