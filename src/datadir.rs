//! Filesystem layout for a running node: one directory holding the identity
//! key, the sqlite store, and (on Unix) the admission socket's lock file.

use std::fs::DirBuilder;
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

#[derive(Debug, Clone)]
pub struct DataDirectory(PathBuf);

impl DataDirectory {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }

    /// Create the directory (and any missing parents) with mode `0700` on
    /// Unix. A no-op if it already exists.
    pub fn init(&self) -> io::Result<()> {
        #[cfg(unix)]
        {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&self.0)
        }
        #[cfg(not(unix))]
        {
            DirBuilder::new().recursive(true).create(&self.0)
        }
    }

    pub fn node_id_priv_path(&self) -> PathBuf {
        self.0.join("nodeid-priv")
    }

    pub fn sqlite_db_file_path(&self) -> PathBuf {
        self.0.join("oc.sqlite3")
    }
}

/// Write `contents` to `path`, creating the file with mode `0600` on Unix
/// (and whatever the platform default is elsewhere — there is no portable
/// equivalent, the same gap `lianad` leaves on non-Unix targets).
pub fn write_file_0600(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;

    #[cfg(unix)]
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    #[cfg(not(unix))]
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    file.write_all(contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDirectory::new(tmp.path().join("oc"));
        assert!(!dd.exists());
        dd.init().unwrap();
        assert!(dd.exists());
        assert_eq!(dd.node_id_priv_path().file_name().unwrap(), "nodeid-priv");
        assert_eq!(dd.sqlite_db_file_path().file_name().unwrap(), "oc.sqlite3");
    }
}
