//! Read-only access to the raw block device under examination.
//!
//! The reader keeps an observable current position, updated on every seek
//! and read, so callers that stream sequentially can recover the absolute
//! origin of what they just read.

use crate::error::DeviceError;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> io::Result<u64> {
    use std::os::unix::io::AsRawFd;

    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };

    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(size)
    }
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(_file: &File) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Not supported on this platform",
    ))
}

/// A raw block device (or disk image) opened read-only.
pub struct BlockDevice {
    file: File,
    path: PathBuf,
    position: u64,
    size: u64,
}

impl BlockDevice {
    /// Opens the device read-only. Size comes from file metadata for
    /// regular images, from the BLKGETSIZE64 ioctl for block nodes, with a
    /// seek-to-end probe as the last resort.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DeviceError::NotFound(path.display().to_string()));
        }

        let file = OpenOptions::new().read(true).open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                DeviceError::PermissionDenied(format!(
                    "{} - try running with elevated privileges",
                    path.display()
                ))
            } else {
                DeviceError::Io(e)
            }
        })?;

        let mut size = file.metadata()?.len();
        if size == 0 {
            if let Ok(device_size) = block_device_size(&file) {
                size = device_size;
            }
        }

        let mut file = file;
        if size == 0 {
            size = file.seek(SeekFrom::End(0))?;
            file.seek(SeekFrom::Start(0))?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            position: 0,
            size,
        })
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The current absolute byte position, as moved by seeks and reads.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute seek.
    pub fn seek_to(&mut self, offset: u64) -> Result<u64, DeviceError> {
        if offset > self.size {
            return Err(DeviceError::InvalidOffset {
                offset,
                device_size: self.size,
            });
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        Ok(offset)
    }

    /// Relative seek from the current position.
    pub fn seek_by(&mut self, delta: i64) -> Result<u64, DeviceError> {
        let target = self.position.checked_add_signed(delta).ok_or(
            DeviceError::InvalidOffset {
                offset: u64::MAX,
                device_size: self.size,
            },
        )?;
        self.seek_to(target)
    }

    /// Fills the buffer from the current position, advancing it.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        let offset = self.position;
        self.file.read_exact(buf).map_err(|source| DeviceError::Read {
            offset,
            source,
        })?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Absolute seek followed by an exact read.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.seek_to(offset)?;
        self.read_exact(buf)
    }

    /// Reads `length` bytes at `offset` into a fresh buffer.
    pub fn read_vec_at(&mut self, offset: u64, length: usize) -> Result<Vec<u8>, DeviceError> {
        let mut buf = vec![0u8; length];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}
