//! Filesystem capabilities.
//!
//! The pipeline reads project files through the read-only [`Fs`] trait and
//! stages deploy artifacts through [`DeployFs`]. Callers inject either the
//! local backend or an in-memory one; nothing in the crate touches
//! `std::fs` outside of [`LocalFs`].

use std::collections::BTreeMap;
use std::io;
use std::sync::RwLock;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::InputError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: Utf8PathBuf,
    pub size: u64,
    pub is_dir: bool,
}

/// Read side. Paths handed to these methods are absolute within the
/// backend's namespace.
pub trait Fs: Send + Sync {
    fn open(&self, path: &Utf8Path) -> Result<Vec<u8>, InputError>;
    fn stat(&self, path: &Utf8Path) -> Result<FileInfo, InputError>;
    /// Direct children of a directory, sorted.
    fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, InputError>;
    fn uri(&self) -> String;

    /// Content hash of a file, used for change detection and staged-copy
    /// comparison.
    fn content_hash(&self, path: &Utf8Path) -> Result<blake3::Hash, InputError> {
        Ok(blake3::hash(&self.open(path)?))
    }
}

/// Write side of the deploy filesystem.
pub trait DeployFs: Fs {
    fn write_bytes(&self, path: &Utf8Path, data: &[u8]) -> Result<(), InputError>;

    /// Copies a file or directory tree from another filesystem. `src` is a
    /// path on `from`; `dst` is the target path here. Files whose content
    /// hash already matches are skipped.
    fn copy_from(&self, from: &dyn Fs, src: &Utf8Path, dst: &Utf8Path) -> Result<(), InputError> {
        let info = from.stat(src)?;
        if info.is_dir {
            for child in from.list(src)? {
                let name = child.file_name().unwrap_or_default();
                self.copy_from(from, &child, &dst.join(name))?;
            }
            return Ok(());
        }
        if let Ok(existing) = self.content_hash(dst)
            && existing == from.content_hash(src)?
        {
            return Ok(());
        }
        self.write_bytes(dst, &from.open(src)?)
    }
}

/// Lexically resolves `.` and `..` segments. Virtual backends have no
/// `canonicalize`, so normalization never consults the filesystem.
pub fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    use camino::Utf8Component;

    let mut out: Vec<Utf8Component> = Vec::new();
    for comp in path.components() {
        match comp {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => match out.last() {
                Some(Utf8Component::Normal(_)) => {
                    out.pop();
                }
                Some(Utf8Component::RootDir) => {}
                _ => out.push(comp),
            },
            other => out.push(other),
        }
    }
    out.iter().map(|c| c.as_str()).collect()
}

/// Rebases `path` (which must live under `base`) onto `/`. This is how
/// local paths are stripped before they reach a deploy filesystem.
pub fn rebase(base: &Utf8Path, path: &Utf8Path) -> Result<Utf8PathBuf, InputError> {
    match path.strip_prefix(base) {
        Ok(rel) => Ok(Utf8PathBuf::from("/").join(rel)),
        Err(_) => Err(InputError::InputInvalid(format!(
            "path `{path}` is outside of `{base}`"
        ))),
    }
}

/// The local disk.
#[derive(Debug, Default)]
pub struct LocalFs;

impl LocalFs {
    fn io_err(path: &Utf8Path, source: io::Error) -> InputError {
        if source.kind() == io::ErrorKind::NotFound {
            InputError::FileNotFound(path.to_owned())
        } else {
            InputError::Fs {
                path: path.to_owned(),
                source,
            }
        }
    }
}

impl Fs for LocalFs {
    fn open(&self, path: &Utf8Path) -> Result<Vec<u8>, InputError> {
        std::fs::read(path).map_err(|e| Self::io_err(path, e))
    }

    fn stat(&self, path: &Utf8Path) -> Result<FileInfo, InputError> {
        let meta = std::fs::metadata(path).map_err(|e| Self::io_err(path, e))?;
        Ok(FileInfo {
            path: path.to_owned(),
            size: meta.len(),
            is_dir: meta.is_dir(),
        })
    }

    fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, InputError> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(path).map_err(|e| Self::io_err(path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_err(path, e))?;
            match Utf8PathBuf::from_path_buf(entry.path()) {
                Ok(p) => out.push(p),
                Err(p) => {
                    return Err(InputError::InputInvalid(format!(
                        "non-UTF-8 path: {}",
                        p.display()
                    )));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn uri(&self) -> String {
        "file://".to_string()
    }
}

/// An in-memory filesystem. Serves as the deploy staging target and as the
/// project source in tests.
#[derive(Debug, Default)]
pub struct MemFs {
    files: RwLock<BTreeMap<Utf8PathBuf, Vec<u8>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file, creating implicit parent directories.
    pub fn insert(&self, path: impl Into<Utf8PathBuf>, data: impl Into<Vec<u8>>) {
        self.files
            .write()
            .expect("mem fs lock poisoned")
            .insert(path.into(), data.into());
    }

    pub fn paths(&self) -> Vec<Utf8PathBuf> {
        self.files
            .read()
            .expect("mem fs lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn is_dir_of(files: &BTreeMap<Utf8PathBuf, Vec<u8>>, path: &Utf8Path) -> bool {
        let prefix = format!("{}/", path.as_str().trim_end_matches('/'));
        files.keys().any(|k| k.as_str().starts_with(&prefix))
    }
}

impl Fs for MemFs {
    fn open(&self, path: &Utf8Path) -> Result<Vec<u8>, InputError> {
        let files = self.files.read().expect("mem fs lock poisoned");
        files
            .get(path)
            .cloned()
            .ok_or_else(|| InputError::FileNotFound(path.to_owned()))
    }

    fn stat(&self, path: &Utf8Path) -> Result<FileInfo, InputError> {
        let files = self.files.read().expect("mem fs lock poisoned");
        if let Some(data) = files.get(path) {
            return Ok(FileInfo {
                path: path.to_owned(),
                size: data.len() as u64,
                is_dir: false,
            });
        }
        if Self::is_dir_of(&files, path) {
            return Ok(FileInfo {
                path: path.to_owned(),
                size: 0,
                is_dir: true,
            });
        }
        Err(InputError::FileNotFound(path.to_owned()))
    }

    fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, InputError> {
        let files = self.files.read().expect("mem fs lock poisoned");
        let prefix = format!("{}/", path.as_str().trim_end_matches('/'));
        let mut out: Vec<Utf8PathBuf> = Vec::new();
        for key in files.keys() {
            let Some(rest) = key.as_str().strip_prefix(&prefix) else {
                continue;
            };
            // Only direct children; deeper entries surface as their
            // first-level directory.
            let child = match rest.split_once('/') {
                Some((dir, _)) => Utf8PathBuf::from(prefix.as_str()).join(dir),
                None => key.clone(),
            };
            if !out.contains(&child) {
                out.push(child);
            }
        }
        if out.is_empty() && !Self::is_dir_of(&files, path) && !files.contains_key(path) {
            return Err(InputError::FileNotFound(path.to_owned()));
        }
        out.sort();
        Ok(out)
    }

    fn uri(&self) -> String {
        "mem://".to_string()
    }
}

impl DeployFs for MemFs {
    fn write_bytes(&self, path: &Utf8Path, data: &[u8]) -> Result<(), InputError> {
        self.insert(path.to_owned(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_fs_round_trip() {
        let fs = MemFs::new();
        fs.insert("/p/metadata.yaml", "main: main.mcl\n");
        assert_eq!(
            fs.open("/p/metadata.yaml".into()).unwrap(),
            b"main: main.mcl\n"
        );
        assert!(fs.stat("/p".into()).unwrap().is_dir);
        assert!(!fs.stat("/p/metadata.yaml".into()).unwrap().is_dir);
        assert!(matches!(
            fs.open("/missing".into()),
            Err(InputError::FileNotFound(_))
        ));
    }

    #[test]
    fn mem_fs_lists_direct_children() {
        let fs = MemFs::new();
        fs.insert("/p/a.mcl", "");
        fs.insert("/p/files/one.txt", "");
        fs.insert("/p/files/sub/two.txt", "");
        let children = fs.list("/p".into()).unwrap();
        assert_eq!(
            children,
            vec![Utf8PathBuf::from("/p/a.mcl"), Utf8PathBuf::from("/p/files")]
        );
        let files = fs.list("/p/files".into()).unwrap();
        assert_eq!(
            files,
            vec![
                Utf8PathBuf::from("/p/files/one.txt"),
                Utf8PathBuf::from("/p/files/sub"),
            ]
        );
    }

    #[test]
    fn normalize_resolves_dots() {
        assert_eq!(
            normalize("/a/b/../c/./d".into()),
            Utf8PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize("/a/../../b".into()), Utf8PathBuf::from("/b"));
        assert_eq!(normalize("a/../b".into()), Utf8PathBuf::from("b"));
    }

    #[test]
    fn rebase_strips_base() {
        let got = rebase("/home/me/proj".into(), "/home/me/proj/files/x".into()).unwrap();
        assert_eq!(got, Utf8PathBuf::from("/files/x"));
        assert!(rebase("/home/me/proj".into(), "/etc/passwd".into()).is_err());
    }

    #[test]
    fn copy_from_copies_trees_and_skips_identical() {
        let src = MemFs::new();
        src.insert("/proj/files/a.txt", "alpha");
        src.insert("/proj/files/sub/b.txt", "beta");
        let dst = MemFs::new();
        dst.copy_from(&src, "/proj/files".into(), "/files".into())
            .unwrap();
        assert_eq!(dst.open("/files/a.txt".into()).unwrap(), b"alpha");
        assert_eq!(dst.open("/files/sub/b.txt".into()).unwrap(), b"beta");
        // Second copy is a no-op (hashes match), not an error.
        dst.copy_from(&src, "/proj/files".into(), "/files".into())
            .unwrap();
    }

    #[test]
    fn local_fs_reads_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, b"content").unwrap();
        let fs = LocalFs;
        let upath = Utf8PathBuf::from_path_buf(path).unwrap();
        assert_eq!(fs.open(&upath).unwrap(), b"content");
        assert_eq!(fs.stat(&upath).unwrap().size, 7);
    }
}
