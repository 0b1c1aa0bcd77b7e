//! Filesystem abstraction used by the engine.
//!
//! Transactions keep their file open across many engine cycles, so unlike a
//! purely path-based abstraction the [VirtualFilestore] trait hands out file
//! handles. All operations can fail; the engine maps failures to a protocol
//! condition code on the owning transaction instead of propagating them
//! outward.
//!
//! Two implementations are provided: [NativeFilestore] on top of [std::fs]
//! and [InMemoryFilestore] for tests and RAM file systems.
use alloc::string::String;
use alloc::vec::Vec;

/// Errors produced by [VirtualFilestore] implementations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilestoreError {
    #[error("file does not exist")]
    FileDoesNotExist,
    #[error("file already exists")]
    FileAlreadyExists,
    #[error("directory does not exist")]
    DirDoesNotExist,
    #[error("permission denied")]
    PermissionDenied,
    #[error("generic filestore error")]
    Other,
}

#[cfg(feature = "std")]
impl From<std::io::Error> for FilestoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FilestoreError::FileDoesNotExist,
            std::io::ErrorKind::AlreadyExists => FilestoreError::FileAlreadyExists,
            std::io::ErrorKind::PermissionDenied => FilestoreError::PermissionDenied,
            _ => FilestoreError::Other,
        }
    }
}

/// Virtual filestore the engine performs all file I/O through.
pub trait VirtualFilestore {
    type File;

    fn open_for_read(&mut self, path: &str) -> Result<Self::File, FilestoreError>;

    /// Create the file, truncating any previous content. The handle must be
    /// readable as well: the receive side re-reads the file for its deferred
    /// checksum calculation.
    fn create(&mut self, path: &str) -> Result<Self::File, FilestoreError>;

    /// Open an existing file for reading and writing without truncation.
    fn open_for_update(&mut self, path: &str) -> Result<Self::File, FilestoreError>;

    fn close(&mut self, file: Self::File) -> Result<(), FilestoreError>;

    /// Position the handle for the next read or write.
    fn seek(&mut self, file: &mut Self::File, position: u64) -> Result<(), FilestoreError>;

    /// Read up to `buf.len()` bytes at the current position. Returns the
    /// number of bytes read, zero meaning end of file.
    fn read(&mut self, file: &mut Self::File, buf: &mut [u8]) -> Result<usize, FilestoreError>;

    /// Write the whole buffer at the current position.
    fn write(&mut self, file: &mut Self::File, data: &[u8]) -> Result<(), FilestoreError>;

    fn file_size(&mut self, file: &mut Self::File) -> Result<u64, FilestoreError>;

    fn rename(&mut self, from: &str, to: &str) -> Result<(), FilestoreError>;

    fn remove(&mut self, path: &str) -> Result<(), FilestoreError>;

    fn exists(&mut self, path: &str) -> bool;

    /// Append the paths of all plain files below `dir` to `out`, in a
    /// deterministic order.
    fn list_directory(
        &mut self,
        dir: &str,
        out: &mut Vec<String>,
    ) -> Result<(), FilestoreError>;
}

/// [VirtualFilestore] over [std::fs].
#[cfg(feature = "std")]
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeFilestore {}

#[cfg(feature = "std")]
impl VirtualFilestore for NativeFilestore {
    type File = std::fs::File;

    fn open_for_read(&mut self, path: &str) -> Result<Self::File, FilestoreError> {
        Ok(std::fs::File::open(path)?)
    }

    fn create(&mut self, path: &str) -> Result<Self::File, FilestoreError> {
        Ok(std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?)
    }

    fn open_for_update(&mut self, path: &str) -> Result<Self::File, FilestoreError> {
        Ok(std::fs::OpenOptions::new().read(true).write(true).open(path)?)
    }

    fn close(&mut self, file: Self::File) -> Result<(), FilestoreError> {
        drop(file);
        Ok(())
    }

    fn seek(&mut self, file: &mut Self::File, position: u64) -> Result<(), FilestoreError> {
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(position))?;
        Ok(())
    }

    fn read(&mut self, file: &mut Self::File, buf: &mut [u8]) -> Result<usize, FilestoreError> {
        use std::io::Read;
        Ok(file.read(buf)?)
    }

    fn write(&mut self, file: &mut Self::File, data: &[u8]) -> Result<(), FilestoreError> {
        use std::io::Write;
        file.write_all(data)?;
        Ok(())
    }

    fn file_size(&mut self, file: &mut Self::File) -> Result<u64, FilestoreError> {
        Ok(file.metadata()?.len())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), FilestoreError> {
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), FilestoreError> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn exists(&mut self, path: &str) -> bool {
        std::path::Path::new(path).exists()
    }

    fn list_directory(
        &mut self,
        dir: &str,
        out: &mut Vec<String>,
    ) -> Result<(), FilestoreError> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|_| FilestoreError::DirDoesNotExist)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(path) = entry.path().to_str() {
                    paths.push(String::from(path));
                }
            }
        }
        paths.sort();
        out.extend(paths);
        Ok(())
    }
}

/// Open handle into an [InMemoryFilestore].
#[derive(Debug, Clone)]
pub struct InMemoryFile {
    path: String,
    position: u64,
}

/// Map-backed [VirtualFilestore] without any real filesystem underneath.
///
/// Directory structure is implied by `/` separators in the stored paths.
#[derive(Debug, Default, Clone)]
pub struct InMemoryFilestore {
    files: alloc::collections::BTreeMap<String, Vec<u8>>,
}

impl InMemoryFilestore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file, typically test input.
    pub fn insert_file(&mut self, path: &str, data: &[u8]) {
        self.files.insert(String::from(path), data.to_vec());
    }

    /// Borrow the current content of a file.
    pub fn file_data(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|v| v.as_slice())
    }
}

impl VirtualFilestore for InMemoryFilestore {
    type File = InMemoryFile;

    fn open_for_read(&mut self, path: &str) -> Result<Self::File, FilestoreError> {
        if !self.files.contains_key(path) {
            return Err(FilestoreError::FileDoesNotExist);
        }
        Ok(InMemoryFile {
            path: String::from(path),
            position: 0,
        })
    }

    fn create(&mut self, path: &str) -> Result<Self::File, FilestoreError> {
        self.files.insert(String::from(path), Vec::new());
        Ok(InMemoryFile {
            path: String::from(path),
            position: 0,
        })
    }

    fn open_for_update(&mut self, path: &str) -> Result<Self::File, FilestoreError> {
        if !self.files.contains_key(path) {
            return Err(FilestoreError::FileDoesNotExist);
        }
        Ok(InMemoryFile {
            path: String::from(path),
            position: 0,
        })
    }

    fn close(&mut self, file: Self::File) -> Result<(), FilestoreError> {
        drop(file);
        Ok(())
    }

    fn seek(&mut self, file: &mut Self::File, position: u64) -> Result<(), FilestoreError> {
        file.position = position;
        Ok(())
    }

    fn read(&mut self, file: &mut Self::File, buf: &mut [u8]) -> Result<usize, FilestoreError> {
        let data = self
            .files
            .get(&file.path)
            .ok_or(FilestoreError::FileDoesNotExist)?;
        let start = (file.position as usize).min(data.len());
        let read_len = buf.len().min(data.len() - start);
        buf[..read_len].copy_from_slice(&data[start..start + read_len]);
        file.position += read_len as u64;
        Ok(read_len)
    }

    fn write(&mut self, file: &mut Self::File, data: &[u8]) -> Result<(), FilestoreError> {
        let content = self
            .files
            .get_mut(&file.path)
            .ok_or(FilestoreError::FileDoesNotExist)?;
        let start = file.position as usize;
        let end = start + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
        file.position = end as u64;
        Ok(())
    }

    fn file_size(&mut self, file: &mut Self::File) -> Result<u64, FilestoreError> {
        Ok(self
            .files
            .get(&file.path)
            .ok_or(FilestoreError::FileDoesNotExist)?
            .len() as u64)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), FilestoreError> {
        let data = self
            .files
            .remove(from)
            .ok_or(FilestoreError::FileDoesNotExist)?;
        self.files.insert(String::from(to), data);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), FilestoreError> {
        self.files
            .remove(path)
            .map(|_| ())
            .ok_or(FilestoreError::FileDoesNotExist)
    }

    fn exists(&mut self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn list_directory(
        &mut self,
        dir: &str,
        out: &mut Vec<String>,
    ) -> Result<(), FilestoreError> {
        let mut prefix = String::from(dir);
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        // BTreeMap iteration keeps the listing deterministic.
        out.extend(
            self.files
                .keys()
                .filter(|path| path.starts_with(prefix.as_str()))
                .cloned(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_read_write_seek() {
        let mut fs = InMemoryFilestore::new();
        let mut file = fs.create("a.bin").unwrap();
        fs.write(&mut file, &[1, 2, 3, 4]).unwrap();
        fs.seek(&mut file, 2).unwrap();
        fs.write(&mut file, &[9, 9, 9]).unwrap();
        assert_eq!(fs.file_size(&mut file).unwrap(), 5);
        fs.seek(&mut file, 0).unwrap();
        let mut buf = [0u8; 8];
        let read = fs.read(&mut file, &mut buf).unwrap();
        assert_eq!(&buf[..read], &[1, 2, 9, 9, 9]);
        assert_eq!(fs.read(&mut file, &mut buf).unwrap(), 0);
    }

    #[test]
    fn in_memory_sparse_write_zero_fills() {
        let mut fs = InMemoryFilestore::new();
        let mut file = fs.create("sparse.bin").unwrap();
        fs.seek(&mut file, 4).unwrap();
        fs.write(&mut file, &[7]).unwrap();
        assert_eq!(fs.file_data("sparse.bin").unwrap(), &[0, 0, 0, 0, 7]);
    }

    #[test]
    fn in_memory_rename_and_remove() {
        let mut fs = InMemoryFilestore::new();
        fs.insert_file("old", &[1]);
        fs.rename("old", "new").unwrap();
        assert!(!fs.exists("old"));
        assert!(fs.exists("new"));
        fs.remove("new").unwrap();
        assert_eq!(fs.remove("new").unwrap_err(), FilestoreError::FileDoesNotExist);
    }

    #[test]
    fn in_memory_missing_file_errors() {
        let mut fs = InMemoryFilestore::new();
        assert_eq!(
            fs.open_for_read("nope").unwrap_err(),
            FilestoreError::FileDoesNotExist
        );
        assert_eq!(
            fs.open_for_update("nope").unwrap_err(),
            FilestoreError::FileDoesNotExist
        );
    }

    #[test]
    fn in_memory_directory_listing() {
        let mut fs = InMemoryFilestore::new();
        fs.insert_file("dir/b", &[]);
        fs.insert_file("dir/a", &[]);
        fs.insert_file("other/c", &[]);
        let mut out = Vec::new();
        fs.list_directory("dir", &mut out).unwrap();
        assert_eq!(out, alloc::vec![String::from("dir/a"), String::from("dir/b")]);
    }

    #[cfg(feature = "std")]
    #[test]
    fn native_filestore_round_trip() {
        let base = std::env::temp_dir().join(std::format!(
            "cfdp-engine-fs-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&base).unwrap();
        let path = base.join("native.bin");
        let path = path.to_str().unwrap();

        let mut fs = NativeFilestore::default();
        let mut file = fs.create(path).unwrap();
        fs.write(&mut file, &[5, 6, 7]).unwrap();
        fs.seek(&mut file, 1).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(fs.read(&mut file, &mut buf).unwrap(), 2);
        assert_eq!(buf, [6, 7]);
        assert_eq!(fs.file_size(&mut file).unwrap(), 3);
        fs.close(file).unwrap();

        let renamed = base.join("renamed.bin");
        let renamed = renamed.to_str().unwrap();
        fs.rename(path, renamed).unwrap();
        assert!(!fs.exists(path));
        assert!(fs.exists(renamed));
        fs.remove(renamed).unwrap();
        std::fs::remove_dir_all(&base).unwrap();
    }
}
