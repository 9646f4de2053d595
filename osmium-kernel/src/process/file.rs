//! Open files and the per-process descriptor table
//!
//! The VFS proper is an external collaborator; the process core only
//! needs reference-counted file objects with a shared read offset (so a
//! forked child and its parent advance the same cursor), a fixed-width
//! descriptor table, and inode references for the working directory.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use osmium_abi::{dirent, Errno, OPEN_MAX};

/// An inode reference handed out by the filesystem.
pub struct Inode {
    /// Inode number.
    pub ino: u32,
}

/// What an open file refers to.
pub enum FileKind {
    /// The system console; writes go to the kernel console driver.
    Console,
    /// A directory stream served to `getdents`.
    Directory(Vec<DirEntry>),
}

/// One directory entry as the filesystem reports it.
pub struct DirEntry {
    pub ino: u32,
    pub name: Vec<u8>,
}

/// An open file object; descriptors are `Arc` clones, so dup'ed and
/// inherited descriptors share this object and its offset.
pub struct File {
    pub kind: FileKind,
    /// Read cursor, shared across every descriptor to this object.
    offset: AtomicUsize,
}

impl File {
    /// Open the console.
    #[must_use]
    pub fn console() -> Arc<Self> {
        Arc::new(Self {
            kind: FileKind::Console,
            offset: AtomicUsize::new(0),
        })
    }

    /// Open a directory stream.
    #[must_use]
    pub fn directory(entries: Vec<DirEntry>) -> Arc<Self> {
        Arc::new(Self {
            kind: FileKind::Directory(entries),
            offset: AtomicUsize::new(0),
        })
    }

    /// Fill `buf` with directory records, advancing the shared cursor.
    ///
    /// Returns the number of bytes written; 0 means end of directory.
    pub fn getdents(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        let FileKind::Directory(entries) = &self.kind else {
            return Err(Errno::EINVAL);
        };

        let mut written = 0;
        loop {
            let at = self.offset.load(Ordering::Relaxed);
            let Some(entry) = entries.get(at) else {
                break;
            };

            match dirent::append(buf, written, entry.ino, &entry.name) {
                Some(next) => {
                    written = next;
                    self.offset.store(at + 1, Ordering::Relaxed);
                }
                None => {
                    if written == 0 {
                        // Caller's buffer cannot hold even one record.
                        return Err(Errno::EINVAL);
                    }
                    break;
                }
            }
        }

        Ok(written)
    }
}

/// Fixed-width table of open descriptors.
pub struct FileTable {
    files: [Option<Arc<File>>; OPEN_MAX],
}

impl FileTable {
    /// An empty table.
    #[must_use]
    pub const fn new() -> Self {
        const EMPTY: Option<Arc<File>> = None;
        Self {
            files: [EMPTY; OPEN_MAX],
        }
    }

    /// Install `file` in the lowest free slot.
    pub fn install(&mut self, file: Arc<File>) -> Result<usize, Errno> {
        let slot = self
            .files
            .iter()
            .position(Option::is_none)
            .ok_or(Errno::EMFILE)?;
        self.files[slot] = Some(file);
        Ok(slot)
    }

    /// Look up an open descriptor.
    pub fn get(&self, fd: usize) -> Result<Arc<File>, Errno> {
        self.files
            .get(fd)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or(Errno::EBADF)
    }

    /// Close a descriptor; the object is released with its last
    /// reference.
    pub fn close(&mut self, fd: usize) -> Result<(), Errno> {
        match self.files.get_mut(fd) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(Errno::EBADF),
        }
    }

    /// Duplicate every open descriptor into a new table (fork).
    ///
    /// Clones share the underlying file objects, offsets included.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        const EMPTY: Option<Arc<File>> = None;
        let mut files = [EMPTY; OPEN_MAX];
        for (i, f) in self.files.iter().enumerate() {
            files[i] = f.clone();
        }
        Self { files }
    }

    /// Drop every descriptor (process exit).
    pub fn close_all(&mut self) {
        for slot in &mut self.files {
            *slot = None;
        }
    }

    /// Number of open descriptors.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.files.iter().filter(|f| f.is_some()).count()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Root directory inode from the external filesystem.
#[must_use]
pub fn root_inode() -> Arc<Inode> {
    Arc::new(Inode { ino: 2 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn sample_dir() -> Arc<File> {
        File::directory(vec![
            DirEntry {
                ino: 2,
                name: b".".to_vec(),
            },
            DirEntry {
                ino: 2,
                name: b"..".to_vec(),
            },
            DirEntry {
                ino: 11,
                name: b"sbin".to_vec(),
            },
        ])
    }

    #[test]
    fn test_getdents_streams_all_entries() {
        let dir = sample_dir();
        let mut buf = [0u8; 128];

        let n = dir.getdents(&mut buf).unwrap();
        let names: Vec<_> = dirent::DirentIter::new(&buf[..n])
            .map(|(_, name)| name.to_vec())
            .collect();
        assert_eq!(names, vec![b".".to_vec(), b"..".to_vec(), b"sbin".to_vec()]);

        // Stream exhausted.
        assert_eq!(dir.getdents(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_getdents_resumes_across_small_buffers() {
        let dir = sample_dir();
        // Room for one record at a time.
        let mut buf = [0u8; 16];
        let mut names = Vec::new();

        loop {
            let n = dir.getdents(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            for (_, name) in dirent::DirentIter::new(&buf[..n]) {
                names.push(name.to_vec());
            }
        }
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_dup_shares_offset() {
        let dir = sample_dir();
        let dup = Arc::clone(&dir);
        let mut buf = [0u8; 16];

        dir.getdents(&mut buf).unwrap();
        let before = dup.offset.load(Ordering::Relaxed);
        assert!(before > 0, "offset advanced through the other handle");
    }

    #[test]
    fn test_table_install_close() {
        let mut table = FileTable::new();
        let fd = table.install(File::console()).unwrap();
        assert_eq!(fd, 0);
        assert!(table.get(fd).is_ok());

        table.close(fd).unwrap();
        assert!(matches!(table.get(fd), Err(Errno::EBADF)));
        assert_eq!(table.close(fd), Err(Errno::EBADF));
    }

    #[test]
    fn test_table_duplicate_shares_objects() {
        let mut table = FileTable::new();
        let fd = table.install(sample_dir()).unwrap();

        let copy = table.duplicate();
        let a = table.get(fd).unwrap();
        let b = copy.get(fd).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(copy.open_count(), 1);
    }
}
