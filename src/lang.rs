//! The top-level driver.
//!
//! [`Lang::init`] runs input resolution, parsing, interpolation, scope
//! construction, type inference and function-graph construction, but does
//! not start anything. [`Lang::run`] installs the graph into the engine
//! transactionally and blocks until the context is cancelled, reversing
//! the transaction on the way out. [`Lang::interpret`] turns the current
//! value-table snapshot into a resource graph; it is guarded by a
//! non-blocking check that the engine has loaded.

use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;

use crate::ast::Ast;
use crate::engine::{Context, Engine, FuncGraph, StreamMsg, build_graph};
use crate::error::{InputError, LifecycleError, MclError};
use crate::fs::{DeployFs, Fs};
use crate::funcs::FuncRegistry;
use crate::input::{self, DeployWorker, Metadata};
use crate::interpolate;
use crate::interpret::{Interpreter, ResourceGraph};
use crate::parse;
use crate::resources;
use crate::scope::{Resolutions, ScopeBuilder};
use crate::types::unify;
use crate::world::{Downloader, World};

/// Everything the driver needs injected.
pub struct LangConfig {
    /// The user-supplied input string (file, directory, metadata path or
    /// raw code).
    pub input: String,
    pub fs: Arc<dyn Fs>,
    pub world: Arc<dyn World>,
    /// Base directory for raw-code inputs.
    pub cwd: Utf8PathBuf,
    /// Module-search root; defaults to `MGMT_MODULE_PATH` when set.
    pub module_path: Option<Utf8PathBuf>,
    pub downloader: Option<Box<dyn Downloader>>,
    /// Unification strategy key.
    pub strategy: String,
}

impl LangConfig {
    pub fn new(input: impl Into<String>, fs: Arc<dyn Fs>, world: Arc<dyn World>) -> Self {
        let module_path = std::env::var(input::MODULE_PATH_ENV)
            .ok()
            .map(Utf8PathBuf::from);
        Self {
            input: input.into(),
            fs,
            world,
            cwd: Utf8PathBuf::from("/"),
            module_path,
            downloader: None,
            strategy: unify::DEFAULT_STRATEGY.to_string(),
        }
    }
}

struct Compiled {
    ast: Arc<Ast>,
    res: Arc<Resolutions>,
    funcs: Arc<FuncRegistry>,
    engine: Engine,
    /// Built during init, consumed by the first `run`.
    graph: Mutex<Option<FuncGraph>>,
    metadata: Metadata,
    files: Vec<Utf8PathBuf>,
    workers: Mutex<Vec<DeployWorker>>,
}

/// The compile-and-stream pipeline, end to end.
pub struct Lang {
    config: LangConfig,
    compiled: Option<Compiled>,
}

impl Lang {
    pub fn new(config: LangConfig) -> Self {
        Self {
            config,
            compiled: None,
        }
    }

    /// Runs the compile pipeline and builds (but does not start) the
    /// function graph.
    pub fn init(&mut self) -> Result<(), MclError> {
        if self.compiled.is_some() {
            return Err(LifecycleError::DoubleInit.into());
        }
        if let Some(path) = &self.config.module_path {
            input::validate_module_path(path).map_err(MclError::Input)?;
        }

        let parsed = input::resolve(&self.config.input, &self.config.fs, &self.config.cwd)?;
        let src = String::from_utf8(parsed.main.clone())
            .map_err(|e| InputError::InputInvalid(format!("entry source is not UTF-8: {e}")))?;

        let mut ast = Ast::new();
        let stmts = parse::parse(&src, &mut ast)?;
        interpolate::interpolate(&mut ast, &stmts)?;
        ast.root = stmts;

        let funcs = Arc::new(FuncRegistry::with_defaults());
        let root = ast.root.clone();
        let builder = ScopeBuilder::new(
            &mut ast,
            self.config.fs.clone(),
            self.config.world.clone(),
            &funcs,
            self.config.downloader.as_deref(),
            self.config.module_path.clone(),
        );
        let scoped = builder.run(&root, &parsed.base)?;

        unify::infer(
            &self.config.strategy,
            &mut ast,
            &root,
            &scoped.resolutions,
            &funcs,
            resources::registry(),
        )?;

        let ast = Arc::new(ast);
        let res = Arc::new(scoped.resolutions);
        let engine = Engine::new(
            ast.clone(),
            res.clone(),
            funcs.clone(),
            self.config.world.clone(),
            self.config.fs.clone(),
        );
        let graph = build_graph(&ast, &res, &funcs, &engine.fact_runtime())?;
        tracing::info!(
            "compiled `{}`: {} function vertices, {} modules",
            self.config.input,
            graph.node_count(),
            scoped.modules.len(),
        );

        let mut files = parsed.files;
        files.extend(scoped.files);
        files.dedup();

        self.compiled = Some(Compiled {
            ast,
            res,
            funcs,
            engine,
            graph: Mutex::new(Some(graph)),
            metadata: parsed.metadata,
            files,
            workers: Mutex::new(parsed.workers),
        });
        Ok(())
    }

    fn compiled(&self) -> Result<&Compiled, MclError> {
        self.compiled
            .as_ref()
            .ok_or_else(|| LifecycleError::NotInitialized.into())
    }

    /// The loaded module descriptor.
    pub fn metadata(&self) -> Result<&Metadata, MclError> {
        Ok(&self.compiled()?.metadata)
    }

    /// Files referenced by the project, for the staging step.
    pub fn file_list(&self) -> Result<&[Utf8PathBuf], MclError> {
        Ok(&self.compiled()?.files)
    }

    /// Runs the deferred staging workers against a deploy filesystem.
    pub fn stage(&self, deploy: &dyn DeployFs) -> Result<(), MclError> {
        let compiled = self.compiled()?;
        let workers = std::mem::take(&mut *compiled.workers.lock().expect("workers lock"));
        for worker in workers {
            worker(deploy).map_err(|e| MclError::Input(InputError::InputInvalid(e.to_string())))?;
        }
        Ok(())
    }

    /// Adds the program graph to the engine transactionally and blocks
    /// until `ctx` is cancelled; the transaction is reversed on exit.
    pub fn run(&self, ctx: &Context) -> Result<(), MclError> {
        let compiled = self.compiled()?;
        let graph = compiled
            .graph
            .lock()
            .expect("graph lock")
            .take()
            .ok_or(LifecycleError::DoubleInit)?;
        let committed = compiled.engine.txn().add_graph(graph).commit()?;
        let result = compiled.engine.run(ctx);
        committed.reverse()?;
        result.map_err(MclError::Engine)
    }

    /// Takes the engine's event stream. One `Ok` per coherent snapshot.
    pub fn stream(&self) -> Result<std::sync::mpsc::Receiver<StreamMsg>, MclError> {
        self.compiled()?
            .engine
            .stream()
            .ok_or_else(|| LifecycleError::StreamTaken.into())
    }

    /// Whether every fact has produced at least one value.
    pub fn loaded(&self) -> Result<bool, MclError> {
        Ok(self.compiled()?.engine.loaded())
    }

    /// Produces a fresh resource graph from the current snapshot. Errors
    /// here do not tear the engine down; callers may retry after the next
    /// stream event.
    pub fn interpret(&self) -> Result<ResourceGraph, MclError> {
        let compiled = self.compiled()?;
        if !compiled.engine.loaded() {
            return Err(LifecycleError::InterpretBeforeLoad.into());
        }
        let table = compiled.engine.snapshot();
        let interpreter = Interpreter {
            ast: &compiled.ast,
            res: &compiled.res,
            funcs: &compiled.funcs,
            kinds: resources::registry(),
        };
        Ok(interpreter.interpret(&table)?)
    }

    /// Releases per-node resources. The driver may be re-inited afterward
    /// by constructing a fresh `Lang`.
    pub fn cleanup(&mut self) -> Result<(), MclError> {
        if let Some(compiled) = &self.compiled {
            compiled.engine.cleanup();
        }
        Ok(())
    }
}

/// Convenience for callers on a local checkout: `run` with defaults for
/// everything but the input string.
pub fn local_config(input: impl Into<String>) -> LangConfig {
    let cwd = std::env::current_dir()
        .ok()
        .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("/"));
    let mut config = LangConfig::new(
        input,
        Arc::new(crate::fs::LocalFs),
        Arc::new(crate::world::LocalWorld::new()),
    );
    config.cwd = cwd;
    config
}
