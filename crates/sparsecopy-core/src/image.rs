//! Read-only memory mapping of a container image.

use crate::error::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A memory-mapped container image.
///
/// The mapping is read-only and lives for the whole conversion; all format
/// structures are decoded as views over it.
///
/// # Example
///
/// ```no_run
/// use sparsecopy_core::image::SourceImage;
/// use std::path::Path;
///
/// let image = SourceImage::open(Path::new("disk.vhdx")).unwrap();
/// println!("Image size: {} bytes", image.len());
/// ```
pub struct SourceImage {
    mmap: Mmap,
    path: PathBuf,
}

impl SourceImage {
    /// Opens and maps the image at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped, or if it is
    /// empty.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;

        let metadata = file.metadata().map_err(|e| Error::io(e, path))?;
        if metadata.len() == 0 {
            return Err(Error::format(format!(
                "image '{}' is empty",
                path.display()
            )));
        }

        // Safety: the file is opened read-only and the mapping is never
        // written through. Concurrent modification of the image by another
        // process is a caller error.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };

        Ok(Self {
            mmap,
            path: path.to_path_buf(),
        })
    }

    /// Size of the mapped image in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Returns true if the mapping is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// The mapped bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    /// Path the image was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_and_len() {
        let mut file = NamedTempFile::new().unwrap();
        let pattern: Vec<u8> = (0u8..=255).cycle().take(1024).collect();
        file.write_all(&pattern).unwrap();
        file.flush().unwrap();

        let image = SourceImage::open(file.path()).unwrap();
        assert_eq!(image.len(), 1024);
        assert_eq!(image.data(), pattern.as_slice());
        assert_eq!(image.path(), file.path());
    }

    #[test]
    fn test_empty_file_rejected() {
        let file = NamedTempFile::new().unwrap();
        let err = SourceImage::open(file.path()).err().unwrap();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn test_nonexistent_file() {
        let result = SourceImage::open(Path::new("/nonexistent/path/disk.vhd"));
        assert!(matches!(result, Err(Error::Io { path: Some(_), .. })));
    }
}
