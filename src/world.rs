//! External collaborator capabilities.
//!
//! The pipeline never talks to the outside world directly; it is handed a
//! [`World`] (hostname, distributed KV, staged-project access) and a
//! [`Downloader`] (remote module fetching). The in-crate implementations
//! are deliberately small: a local world backed by process state and an
//! in-memory KV, and a downloader that only honors no-op mode.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{InputError, ScopeError};
use crate::fs::Fs;

/// Host-side capabilities used by facts and by the deploy-mode driver.
pub trait World: Send + Sync {
    fn hostname(&self) -> String;

    fn kv_get(&self, key: &str) -> Option<String>;

    /// Subscribes to changes of a key. The current value, if any, is
    /// delivered first.
    fn kv_watch(&self, key: &str) -> Receiver<String>;

    /// Opens an already-staged project by URI.
    fn fs(&self, uri: &str) -> Result<Arc<dyn Fs>, InputError>;
}

/// A `World` backed by process state and an in-memory KV store.
pub struct LocalWorld {
    hostname: String,
    kv: Mutex<KvStore>,
    staged: Mutex<HashMap<String, Arc<dyn Fs>>>,
}

#[derive(Default)]
struct KvStore {
    values: HashMap<String, String>,
    watchers: HashMap<String, Vec<Sender<String>>>,
}

impl LocalWorld {
    pub fn new() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self::with_hostname(hostname)
    }

    pub fn with_hostname(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            kv: Mutex::new(KvStore::default()),
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// Sets a key and notifies watchers. Dead watchers are dropped.
    pub fn kv_set(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let mut kv = self.kv.lock().expect("kv lock poisoned");
        kv.values.insert(key.to_string(), value.clone());
        if let Some(watchers) = kv.watchers.get_mut(key) {
            watchers.retain(|tx| tx.send(value.clone()).is_ok());
        }
    }

    /// Registers a staged project under a URI for later [`World::fs`]
    /// lookup.
    pub fn stage(&self, uri: impl Into<String>, fs: Arc<dyn Fs>) {
        self.staged
            .lock()
            .expect("staged lock poisoned")
            .insert(uri.into(), fs);
    }
}

impl Default for LocalWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl World for LocalWorld {
    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn kv_get(&self, key: &str) -> Option<String> {
        self.kv
            .lock()
            .expect("kv lock poisoned")
            .values
            .get(key)
            .cloned()
    }

    fn kv_watch(&self, key: &str) -> Receiver<String> {
        let (tx, rx) = channel();
        let mut kv = self.kv.lock().expect("kv lock poisoned");
        if let Some(current) = kv.values.get(key) {
            // Receiver not yet dropped; the send cannot fail.
            let _ = tx.send(current.clone());
        }
        kv.watchers.entry(key.to_string()).or_default().push(tx);
        rx
    }

    fn fs(&self, uri: &str) -> Result<Arc<dyn Fs>, InputError> {
        self.staged
            .lock()
            .expect("staged lock poisoned")
            .get(uri)
            .cloned()
            .ok_or_else(|| InputError::InputInvalid(format!("no staged project at `{uri}`")))
    }
}

/// Settings handed to a downloader before first use.
pub struct DownloadInfo {
    pub fs: Arc<dyn Fs>,
    /// Pretend mode: report what would be fetched without fetching.
    pub noop: bool,
    /// Maximum concurrent fetches.
    pub sema: usize,
    /// Force-refresh modules that already exist locally.
    pub update: bool,
    /// Maximum recursion depth; `-1` means unlimited.
    pub depth: i64,
    /// Maximum retries per module; `-1` means unlimited.
    pub retry: i64,
}

/// Fetches remote modules into the module path.
pub trait Downloader: Send + Sync {
    fn init(&mut self, info: DownloadInfo) -> Result<(), ScopeError>;

    /// Fetches `import_path` and returns the local directory it was
    /// placed in under `base`.
    fn get(&self, import_path: &str, base: &Utf8Path) -> Result<Utf8PathBuf, ScopeError>;
}

/// A downloader that never downloads. In no-op mode it reports success
/// without touching anything, otherwise it fails with a clear message;
/// real fetching lives with the embedding application.
#[derive(Default)]
pub struct NoopDownloader {
    noop: bool,
}

impl Downloader for NoopDownloader {
    fn init(&mut self, info: DownloadInfo) -> Result<(), ScopeError> {
        self.noop = info.noop;
        Ok(())
    }

    fn get(&self, import_path: &str, base: &Utf8Path) -> Result<Utf8PathBuf, ScopeError> {
        if self.noop {
            tracing::info!("would download `{import_path}` into `{base}`");
            return Ok(base.join(import_path));
        }
        Err(ScopeError::Download {
            path: import_path.to_string(),
            reason: "downloading is not enabled".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_watch_delivers_current_then_updates() {
        let world = LocalWorld::with_hostname("h1");
        world.kv_set("k", "v1");
        let rx = world.kv_watch("k");
        assert_eq!(rx.recv().unwrap(), "v1");
        world.kv_set("k", "v2");
        assert_eq!(rx.recv().unwrap(), "v2");
    }

    #[test]
    fn kv_watch_without_value_blocks_until_set() {
        let world = LocalWorld::with_hostname("h1");
        let rx = world.kv_watch("later");
        assert!(rx.try_recv().is_err());
        world.kv_set("later", "now");
        assert_eq!(rx.recv().unwrap(), "now");
    }

    #[test]
    fn staged_fs_lookup() {
        let world = LocalWorld::with_hostname("h1");
        let fs = Arc::new(crate::fs::MemFs::new());
        fs.insert("/metadata.yaml", "main: main.mcl\n");
        world.stage("mem://deploy", fs);
        assert!(world.fs("mem://deploy").is_ok());
        assert!(world.fs("mem://other").is_err());
    }
}
