//! Input resolution and project loading.
//!
//! Takes the single user-supplied input string, decides what form it takes
//! (metadata file, entry source, directory, raw code) and assembles a
//! [`ParsedInput`] rooted at a [`Metadata`] descriptor. Resolution rules
//! are tried in a fixed order; the first match wins.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::InputError;
use crate::fs::{DeployFs, Fs, rebase};

/// Environment variable supplying the default module-search root.
pub const MODULE_PATH_ENV: &str = "MGMT_MODULE_PATH";

/// Name of the module descriptor file.
pub const METADATA_FILENAME: &str = "metadata.yaml";

/// Default entry source filename.
pub const MAIN_FILENAME: &str = "main.mcl";

/// Source file extension.
pub const FILE_EXTENSION: &str = ".mcl";

/// The module descriptor found at `<base>/metadata.yaml`.
///
/// Unknown keys are ignored for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    /// Relative path of the entry source inside the module.
    pub main: String,
    /// Optional relative directory of data files to stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<String>,
    /// Optional module-search root override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Where this descriptor was loaded from. Set after loading, never
    /// serialized.
    #[serde(skip)]
    pub self_path: Option<Utf8PathBuf>,
}

impl Metadata {
    pub fn with_main(main: impl Into<String>) -> Self {
        Self {
            main: main.into(),
            files: None,
            path: None,
            license: None,
            self_path: None,
        }
    }

    fn parse(data: &[u8], path: &Utf8Path) -> Result<Self, InputError> {
        let meta: Metadata =
            serde_yaml::from_slice(data).map_err(|e| InputError::MetadataInvalid {
                path: path.to_owned(),
                reason: e.to_string(),
            })?;
        if meta.main.is_empty() {
            return Err(InputError::MetadataInvalid {
                path: path.to_owned(),
                reason: "`main` must not be empty".to_string(),
            });
        }
        if meta.main.split('/').any(|part| part == "..") {
            return Err(InputError::MetadataInvalid {
                path: path.to_owned(),
                reason: "`main` must not escape the module".to_string(),
            });
        }
        Ok(meta)
    }
}

/// A deferred staging operation that copies data into the deploy
/// filesystem once the compile has succeeded.
pub type DeployWorker = Box<dyn FnOnce(&dyn DeployFs) -> anyhow::Result<()> + Send>;

/// The canonical result of input resolution.
pub struct ParsedInput {
    /// Absolute directory the module is rooted at.
    pub base: Utf8PathBuf,
    /// Raw bytes of the entry source.
    pub main: Vec<u8>,
    /// Absolute paths referenced by this input (sources, `files/` dirs).
    pub files: Vec<Utf8PathBuf>,
    pub metadata: Metadata,
    /// Deferred copies that stage data into the deploy filesystem.
    pub workers: Vec<DeployWorker>,
}

impl std::fmt::Debug for ParsedInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsedInput")
            .field("base", &self.base)
            .field("main", &String::from_utf8_lossy(&self.main))
            .field("files", &self.files)
            .field("metadata", &self.metadata)
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// Validates a module-search root: it must begin and end with a slash.
pub fn validate_module_path(path: &Utf8Path) -> Result<(), InputError> {
    let s = path.as_str();
    if !s.starts_with('/') || !s.ends_with('/') {
        return Err(InputError::ModulePathNotAbsolute(path.to_owned()));
    }
    Ok(())
}

/// Classifies `input` and loads the project it designates. `cwd` is the
/// base used for raw-code inputs.
pub fn resolve(input: &str, fs: &Arc<dyn Fs>, cwd: &Utf8Path) -> Result<ParsedInput, InputError> {
    if input.is_empty() {
        return Err(InputError::InputEmpty);
    }
    // Reserved for stdin; callers that support it pre-read and pass raw
    // code instead.
    if input == "-" {
        return Err(InputError::StdinNotSupported);
    }
    if let Some(dir) = input.strip_suffix(&format!("/{METADATA_FILENAME}")) {
        return from_metadata_file(fs, Utf8Path::new(dir), Utf8Path::new(input));
    }
    if input.ends_with(FILE_EXTENSION) {
        return from_entry_file(fs, Utf8Path::new(input));
    }
    if input.ends_with('/') {
        return from_directory(fs, Utf8Path::new(input));
    }
    Ok(from_raw_code(input.as_bytes().to_vec(), cwd))
}

fn from_metadata_file(
    fs: &Arc<dyn Fs>,
    base: &Utf8Path,
    metadata_path: &Utf8Path,
) -> Result<ParsedInput, InputError> {
    let raw = fs.open(metadata_path)?;
    let mut metadata = Metadata::parse(&raw, metadata_path)?;
    metadata.self_path = Some(metadata_path.to_owned());

    let main_path = base.join(&metadata.main);
    let main = fs.open(&main_path)?;

    let mut files = vec![metadata_path.to_owned(), main_path.clone()];
    let mut workers: Vec<DeployWorker> = Vec::new();

    {
        let raw = raw.clone();
        let metadata_rel = rebase(base, metadata_path)?;
        let main_rel = rebase(base, &main_path)?;
        let main_bytes = main.clone();
        workers.push(Box::new(move |deploy| {
            deploy.write_bytes(&metadata_rel, &raw)?;
            deploy.write_bytes(&main_rel, &main_bytes)?;
            Ok(())
        }));
    }

    if let Some(files_dir) = &metadata.files {
        let dir = base.join(files_dir);
        if let Ok(info) = fs.stat(&dir)
            && info.is_dir
        {
            files.push(dir.clone());
            let fs = fs.clone();
            let rel = rebase(base, &dir)?;
            workers.push(Box::new(move |deploy| {
                deploy.copy_from(fs.as_ref(), &dir, &rel)?;
                Ok(())
            }));
        }
    }

    tracing::debug!("resolved module at `{base}` (main: {})", metadata.main);
    Ok(ParsedInput {
        base: base.to_owned(),
        main,
        files,
        metadata,
        workers,
    })
}

fn from_entry_file(fs: &Arc<dyn Fs>, path: &Utf8Path) -> Result<ParsedInput, InputError> {
    let main = fs.open(path)?;
    let base = path
        .parent()
        .ok_or_else(|| InputError::InputInvalid(format!("`{path}` has no parent directory")))?
        .to_owned();
    let basename = path
        .file_name()
        .ok_or_else(|| InputError::InputInvalid(format!("`{path}` has no file name")))?
        .to_string();

    let metadata = Metadata::with_main(basename.clone());
    let mut workers: Vec<DeployWorker> = Vec::new();
    {
        let metadata = metadata.clone();
        let main_bytes = main.clone();
        workers.push(Box::new(move |deploy| {
            let yaml = serde_yaml::to_string(&metadata)?;
            deploy.write_bytes(
                Utf8Path::new("/").join(METADATA_FILENAME).as_path(),
                yaml.as_bytes(),
            )?;
            deploy.write_bytes(Utf8Path::new("/").join(&basename).as_path(), &main_bytes)?;
            Ok(())
        }));
    }

    Ok(ParsedInput {
        base,
        files: vec![path.to_owned()],
        main,
        metadata,
        workers,
    })
}

fn from_directory(fs: &Arc<dyn Fs>, dir: &Utf8Path) -> Result<ParsedInput, InputError> {
    let dir = Utf8Path::new(dir.as_str().trim_end_matches('/'));
    let info = fs.stat(dir)?;
    if !info.is_dir {
        return Err(InputError::InputInvalid(format!(
            "`{dir}` is not a directory"
        )));
    }
    let metadata_path = dir.join(METADATA_FILENAME);
    if fs.stat(&metadata_path).is_ok() {
        return from_metadata_file(fs, dir, &metadata_path);
    }
    let main_path = dir.join(MAIN_FILENAME);
    if fs.stat(&main_path).is_ok() {
        return from_entry_file(fs, &main_path);
    }
    Err(InputError::FileNotFound(metadata_path))
}

fn from_raw_code(main: Vec<u8>, cwd: &Utf8Path) -> ParsedInput {
    let metadata = Metadata::with_main(MAIN_FILENAME);
    let mut workers: Vec<DeployWorker> = Vec::new();
    {
        let metadata = metadata.clone();
        let main_bytes = main.clone();
        workers.push(Box::new(move |deploy| {
            let yaml = serde_yaml::to_string(&metadata)?;
            deploy.write_bytes(
                Utf8Path::new("/").join(METADATA_FILENAME).as_path(),
                yaml.as_bytes(),
            )?;
            deploy.write_bytes(
                Utf8Path::new("/").join(MAIN_FILENAME).as_path(),
                &main_bytes,
            )?;
            Ok(())
        }));
    }
    ParsedInput {
        base: cwd.to_owned(),
        main,
        files: Vec::new(),
        metadata,
        workers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;

    fn memfs() -> Arc<dyn Fs> {
        let fs = MemFs::new();
        fs.insert("/proj/metadata.yaml", "main: main.mcl\n");
        fs.insert("/proj/main.mcl", "noop \"n1\" {}\n");
        fs.insert("/proj/files/data.txt", "payload");
        Arc::new(fs)
    }

    #[test]
    fn empty_input_errors() {
        let fs = memfs();
        assert!(matches!(
            resolve("", &fs, "/cwd".into()),
            Err(InputError::InputEmpty)
        ));
    }

    #[test]
    fn stdin_reserved() {
        let fs = memfs();
        assert!(matches!(
            resolve("-", &fs, "/cwd".into()),
            Err(InputError::StdinNotSupported)
        ));
    }

    #[test]
    fn metadata_file_input() {
        let fs = memfs();
        let parsed = resolve("/proj/metadata.yaml", &fs, "/cwd".into()).unwrap();
        assert_eq!(parsed.base, Utf8PathBuf::from("/proj"));
        assert_eq!(parsed.main, b"noop \"n1\" {}\n");
        assert_eq!(parsed.metadata.main, "main.mcl");
        assert_eq!(
            parsed.metadata.self_path.as_deref(),
            Some(Utf8Path::new("/proj/metadata.yaml"))
        );
    }

    #[test]
    fn metadata_with_files_dir_schedules_staging() {
        let fs = MemFs::new();
        fs.insert("/proj/metadata.yaml", "main: main.mcl\nfiles: files/\n");
        fs.insert("/proj/main.mcl", "noop \"n1\" {}\n");
        fs.insert("/proj/files/data.txt", "payload");
        let fs: Arc<dyn Fs> = Arc::new(fs);
        let parsed = resolve("/proj/metadata.yaml", &fs, "/cwd".into()).unwrap();
        assert!(parsed.files.iter().any(|p| p.as_str() == "/proj/files"));

        // Run the workers against a deploy fs and check rebasing.
        let deploy = MemFs::new();
        for worker in parsed.workers {
            worker(&deploy).unwrap();
        }
        assert_eq!(deploy.open("/files/data.txt".into()).unwrap(), b"payload");
        assert!(deploy.open("/metadata.yaml".into()).is_ok());
    }

    #[test]
    fn entry_file_input_synthesizes_metadata() {
        let fs = memfs();
        let parsed = resolve("/proj/main.mcl", &fs, "/cwd".into()).unwrap();
        assert_eq!(parsed.base, Utf8PathBuf::from("/proj"));
        assert_eq!(parsed.metadata.main, "main.mcl");

        let deploy = MemFs::new();
        for worker in parsed.workers {
            worker(&deploy).unwrap();
        }
        let meta = deploy.open("/metadata.yaml".into()).unwrap();
        assert!(String::from_utf8(meta).unwrap().contains("main: main.mcl"));
    }

    #[test]
    fn directory_input_prefers_metadata() {
        let fs = memfs();
        let parsed = resolve("/proj/", &fs, "/cwd".into()).unwrap();
        assert_eq!(parsed.metadata.main, "main.mcl");
        assert!(parsed.metadata.self_path.is_some());
    }

    #[test]
    fn directory_input_falls_back_to_main_mcl() {
        let fs = MemFs::new();
        fs.insert("/proj/main.mcl", "noop \"n1\" {}\n");
        let fs: Arc<dyn Fs> = Arc::new(fs);
        let parsed = resolve("/proj/", &fs, "/cwd".into()).unwrap();
        assert_eq!(parsed.metadata.main, "main.mcl");
        assert!(parsed.metadata.self_path.is_none());
    }

    #[test]
    fn missing_directory_errors() {
        let fs = memfs();
        assert!(matches!(
            resolve("/nope/", &fs, "/cwd".into()),
            Err(InputError::FileNotFound(_))
        ));
    }

    #[test]
    fn raw_code_input() {
        let fs = memfs();
        let parsed = resolve("noop \"n1\" {}", &fs, "/cwd".into()).unwrap();
        assert_eq!(parsed.base, Utf8PathBuf::from("/cwd"));
        assert_eq!(parsed.main, b"noop \"n1\" {}");
        assert_eq!(parsed.metadata.main, "main.mcl");
    }

    #[test]
    fn metadata_must_not_escape_base() {
        let fs = MemFs::new();
        fs.insert("/proj/metadata.yaml", "main: ../../etc/passwd\n");
        fs.insert("/etc/passwd", "nope");
        let fs: Arc<dyn Fs> = Arc::new(fs);
        assert!(matches!(
            resolve("/proj/metadata.yaml", &fs, "/cwd".into()),
            Err(InputError::MetadataInvalid { .. })
        ));
    }

    #[test]
    fn module_path_validation() {
        assert!(validate_module_path("/mods/".into()).is_ok());
        assert!(validate_module_path("/mods".into()).is_err());
        assert!(validate_module_path("mods/".into()).is_err());
    }
}
