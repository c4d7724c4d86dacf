//! The function graph engine.
//!
//! A dataflow DAG built from the typed tree: every top-level function
//! application becomes a vertex, facts are input-less vertices fed by the
//! outside world. The engine runs facts on their own threads and a
//! scheduler on the caller's; whenever a fact pushes a changed value the
//! dirty downstream subgraph is re-evaluated in topological waves
//! (independent vertices in parallel) and a fresh value-table snapshot is
//! published, followed by one message on the stream.
//!
//! Mutation goes through the transactional API: a transaction installs
//! the program graph, its receipt reverses the installation on shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use rayon::prelude::*;

use crate::ast::{Ast, ExprId, ExprKind};
use crate::error::EngineError;
use crate::eval::{self, EvalCtx, ValueTable};
use crate::fs::Fs;
use crate::funcs::{FactDef, FactRuntime, FuncEntry, FuncRegistry};
use crate::scope::{CallTarget, Resolutions};
use crate::value::Value;
use crate::world::World;

/// Cooperative cancellation token threaded through the engine and every
/// fact watcher.
#[derive(Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps up to `d`, waking early on cancellation. Returns whether
    /// the context was cancelled.
    pub fn sleep(&self, d: Duration) -> bool {
        let step = Duration::from_millis(25);
        let mut remaining = d;
        while !remaining.is_zero() {
            if self.is_cancelled() {
                return true;
            }
            let nap = remaining.min(step);
            std::thread::sleep(nap);
            remaining -= nap;
        }
        self.is_cancelled()
    }
}

/// One vertex of the function graph.
pub struct Node {
    pub expr: ExprId,
    pub name: String,
    pub kind: NodeKind,
}

pub enum NodeKind {
    /// Evaluated from upstream values; side-effect free.
    Pure,
    /// A long-lived producer with statically evaluated constructor
    /// arguments.
    Fact {
        def: Arc<dyn FactDef>,
        args: Vec<Value>,
    },
}

impl Node {
    pub fn pure(&self) -> bool {
        matches!(self.kind, NodeKind::Pure)
    }
}

/// The dataflow DAG. Vertices are arena-indexed; edges run from producer
/// to consumer.
pub struct FuncGraph {
    pub graph: DiGraph<Node, ()>,
    pub by_expr: HashMap<ExprId, NodeIndex>,
}

impl std::fmt::Debug for FuncGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncGraph")
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}

impl FuncGraph {
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    fn fact_indices(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&i| !self.graph[i].pure())
            .collect()
    }
}

/// Builds the function graph from the scoped, typed tree.
pub fn build_graph(
    ast: &Ast,
    res: &Resolutions,
    funcs: &FuncRegistry,
    rt: &FactRuntime,
) -> Result<FuncGraph, EngineError> {
    let mut builder = GraphBuilder {
        ast,
        res,
        funcs,
        rt,
        graph: DiGraph::new(),
        by_expr: HashMap::new(),
        walked: HashSet::new(),
    };
    builder.walk_stmts(&ast.root)?;
    builder.wire_edges();
    Ok(FuncGraph {
        graph: builder.graph,
        by_expr: builder.by_expr,
    })
}

struct GraphBuilder<'a> {
    ast: &'a Ast,
    res: &'a Resolutions,
    funcs: &'a FuncRegistry,
    rt: &'a FactRuntime,
    graph: DiGraph<Node, ()>,
    by_expr: HashMap<ExprId, NodeIndex>,
    walked: HashSet<ExprId>,
}

impl<'a> GraphBuilder<'a> {
    fn walk_stmts(&mut self, stmts: &[crate::ast::StmtId]) -> Result<(), EngineError> {
        use crate::ast::StmtKind;
        for &sid in stmts {
            match &self.ast.stmt(sid).kind {
                StmtKind::Import { .. } | StmtKind::Class { .. } => {}
                StmtKind::Bind { value, .. } => self.walk_expr(*value, false)?,
                StmtKind::Include { args, expanded, .. } => {
                    for &arg in args {
                        self.walk_expr(arg, false)?;
                    }
                    self.walk_stmts(expanded)?;
                }
                StmtKind::Res {
                    name,
                    fields,
                    edges,
                    ..
                } => {
                    self.walk_expr(*name, false)?;
                    for field in fields {
                        self.walk_expr(field.value, false)?;
                    }
                    for edge in edges {
                        self.walk_expr(edge.target.name, false)?;
                    }
                }
                StmtKind::Edge { from, to } => {
                    self.walk_expr(from.res.name, false)?;
                    self.walk_expr(to.res.name, false)?;
                }
                // Both branches stay live: the condition is reactive and
                // the interpreter picks a side per snapshot.
                StmtKind::If { cond, then, els } => {
                    self.walk_expr(*cond, false)?;
                    self.walk_stmts(then)?;
                    self.walk_stmts(els)?;
                }
            }
        }
        Ok(())
    }

    /// Registers graph vertices for every top-level call in the subtree.
    /// Calls inside function literal bodies evaluate inline per call
    /// site and are not vertices.
    fn walk_expr(&mut self, id: ExprId, inside_func: bool) -> Result<(), EngineError> {
        if !self.walked.insert(id) {
            return Ok(());
        }
        match &self.ast.expr(id).kind {
            ExprKind::Bool(_) | ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Str(_) => Ok(()),
            ExprKind::List(items) => {
                for &e in items {
                    self.walk_expr(e, inside_func)?;
                }
                Ok(())
            }
            ExprKind::Map(pairs) => {
                for &(k, v) in pairs {
                    self.walk_expr(k, inside_func)?;
                    self.walk_expr(v, inside_func)?;
                }
                Ok(())
            }
            ExprKind::Struct(fields) => {
                for (_, e) in fields {
                    self.walk_expr(*e, inside_func)?;
                }
                Ok(())
            }
            ExprKind::Func { body, .. } => self.walk_expr(*body, true),
            ExprKind::Var { .. } => {
                if let Some(&target) = self.res.var_bindings.get(&id) {
                    // Binding expressions are top-level even when the
                    // reference sits inside a function literal.
                    self.walk_expr(target, false)?;
                }
                Ok(())
            }
            ExprKind::Call { target, args } => {
                for &arg in args {
                    self.walk_expr(arg, inside_func)?;
                }
                if let Some(CallTarget::Lambda(func)) = self.res.call_targets.get(&id) {
                    self.walk_expr(*func, inside_func)?;
                }
                if inside_func {
                    return Ok(());
                }
                self.register_call(id, target.clone())
            }
            ExprKind::BinOp { lhs, rhs, .. } => {
                self.walk_expr(*lhs, inside_func)?;
                self.walk_expr(*rhs, inside_func)
            }
            ExprKind::UnOp { operand, .. } => self.walk_expr(*operand, inside_func),
        }
    }

    fn register_call(&mut self, id: ExprId, name: String) -> Result<(), EngineError> {
        let kind = match self.res.call_targets.get(&id) {
            Some(CallTarget::Builtin(key)) => match self.funcs.lookup(key) {
                Some(FuncEntry::Fact(def)) => {
                    let args = self.static_args(id)?;
                    NodeKind::Fact {
                        def: def.clone(),
                        args,
                    }
                }
                _ => NodeKind::Pure,
            },
            _ => NodeKind::Pure,
        };
        if let NodeKind::Fact { def, args } = &kind {
            // Fail fast on unconstructible facts (bad arity slips past
            // here only if the type checker was skipped).
            def.make(args, self.rt).map_err(|e| EngineError::FactInit {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        }
        let idx = self.graph.add_node(Node {
            expr: id,
            name,
            kind,
        });
        self.by_expr.insert(id, idx);
        Ok(())
    }

    /// Fact constructor arguments must evaluate without the table.
    fn static_args(&self, id: ExprId) -> Result<Vec<Value>, EngineError> {
        let ExprKind::Call { args, .. } = &self.ast.expr(id).kind else {
            unreachable!("facts are calls");
        };
        let empty = ValueTable::new();
        let ctx = EvalCtx {
            ast: self.ast,
            res: self.res,
            funcs: self.funcs,
            table: &empty,
        };
        args.iter()
            .map(|&a| {
                eval::eval(&ctx, a).map_err(|_| EngineError::FactArgNotStatic {
                    span: self.ast.expr(a).span,
                })
            })
            .collect()
    }

    /// Adds producer → consumer edges by collecting, per vertex, the
    /// registered calls its evaluation reads.
    fn wire_edges(&mut self) {
        let indices: Vec<NodeIndex> = self.graph.node_indices().collect();
        for idx in indices {
            let id = self.graph[idx].expr;
            let mut deps = HashSet::new();
            let mut seen = HashSet::new();
            seen.insert(id);
            let ExprKind::Call { args, .. } = &self.ast.expr(id).kind else {
                continue;
            };
            for &arg in args {
                self.collect_deps(arg, &mut deps, &mut seen);
            }
            if let Some(CallTarget::Lambda(func)) = self.res.call_targets.get(&id)
                && let ExprKind::Func { body, .. } = &self.ast.expr(*func).kind
            {
                self.collect_deps(*body, &mut deps, &mut seen);
            }
            for dep in deps {
                if self.graph.find_edge(dep, idx).is_none() {
                    self.graph.add_edge(dep, idx, ());
                }
            }
        }
    }

    fn collect_deps(&self, id: ExprId, deps: &mut HashSet<NodeIndex>, seen: &mut HashSet<ExprId>) {
        if !seen.insert(id) {
            return;
        }
        match &self.ast.expr(id).kind {
            ExprKind::Bool(_) | ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Str(_) => {}
            ExprKind::List(items) => {
                for &e in items {
                    self.collect_deps(e, deps, seen);
                }
            }
            ExprKind::Map(pairs) => {
                for &(k, v) in pairs {
                    self.collect_deps(k, deps, seen);
                    self.collect_deps(v, deps, seen);
                }
            }
            ExprKind::Struct(fields) => {
                for (_, e) in fields {
                    self.collect_deps(*e, deps, seen);
                }
            }
            ExprKind::Func { body, .. } => self.collect_deps(*body, deps, seen),
            ExprKind::Var { .. } => {
                if let Some(&target) = self.res.var_bindings.get(&id) {
                    self.collect_deps(target, deps, seen);
                }
            }
            ExprKind::Call { args, .. } => {
                if let Some(&idx) = self.by_expr.get(&id) {
                    // The vertex's own upstream covers everything below.
                    deps.insert(idx);
                    return;
                }
                for &arg in args {
                    self.collect_deps(arg, deps, seen);
                }
                if let Some(CallTarget::Lambda(func)) = self.res.call_targets.get(&id) {
                    self.collect_deps(*func, deps, seen);
                }
            }
            ExprKind::BinOp { lhs, rhs, .. } => {
                self.collect_deps(*lhs, deps, seen);
                self.collect_deps(*rhs, deps, seen);
            }
            ExprKind::UnOp { operand, .. } => self.collect_deps(*operand, deps, seen),
        }
    }
}

/// A receipt for committed operations; reversing it undoes them.
pub struct Committed<'a> {
    engine: &'a Engine,
    installed: bool,
}

impl std::fmt::Debug for Committed<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Committed")
            .field("installed", &self.installed)
            .finish()
    }
}

impl<'a> Committed<'a> {
    pub fn reverse(self) -> Result<(), EngineError> {
        if self.installed {
            self.engine.remove_graph();
        }
        Ok(())
    }
}

/// A pending transaction against the engine's graph.
pub struct Txn<'a> {
    engine: &'a Engine,
    add: Option<FuncGraph>,
}

impl<'a> Txn<'a> {
    pub fn add_graph(mut self, graph: FuncGraph) -> Self {
        self.add = Some(graph);
        self
    }

    pub fn commit(self) -> Result<Committed<'a>, EngineError> {
        let installed = match self.add {
            Some(graph) => {
                self.engine.install_graph(graph)?;
                true
            }
            None => false,
        };
        Ok(Committed {
            engine: self.engine,
            installed,
        })
    }
}

pub type StreamMsg = Result<(), EngineError>;

/// The reactive engine. One program graph at a time; `run` drives it
/// until the supplied context is cancelled.
pub struct Engine {
    ast: Arc<Ast>,
    res: Arc<Resolutions>,
    funcs: Arc<FuncRegistry>,
    world: Arc<dyn World>,
    fs: Arc<dyn Fs>,

    graph: Mutex<Option<Arc<FuncGraph>>>,
    table: RwLock<Arc<ValueTable>>,
    loaded: AtomicBool,
    stream_tx: Sender<StreamMsg>,
    stream_rx: Mutex<Option<Receiver<StreamMsg>>>,
}

impl Engine {
    pub fn new(
        ast: Arc<Ast>,
        res: Arc<Resolutions>,
        funcs: Arc<FuncRegistry>,
        world: Arc<dyn World>,
        fs: Arc<dyn Fs>,
    ) -> Self {
        let (stream_tx, stream_rx) = channel();
        Self {
            ast,
            res,
            funcs,
            world,
            fs,
            graph: Mutex::new(None),
            table: RwLock::new(Arc::new(ValueTable::new())),
            loaded: AtomicBool::new(false),
            stream_tx,
            stream_rx: Mutex::new(Some(stream_rx)),
        }
    }

    pub fn fact_runtime(&self) -> FactRuntime {
        FactRuntime {
            world: self.world.clone(),
            fs: self.fs.clone(),
        }
    }

    pub fn txn(&self) -> Txn<'_> {
        Txn {
            engine: self,
            add: None,
        }
    }

    /// Validates and installs a graph. Part of transaction commit.
    fn install_graph(&self, graph: FuncGraph) -> Result<(), EngineError> {
        if toposort(&graph.graph, None).is_err() {
            return Err(EngineError::NotDag);
        }
        for idx in graph.graph.node_indices() {
            let node = &graph.graph[idx];
            if self.ast.expr(node.expr).typ.is_none() {
                return Err(EngineError::Txn(format!(
                    "vertex `{}` has no solved type",
                    node.name
                )));
            }
        }
        let mut slot = self.graph.lock().expect("graph lock poisoned");
        if slot.is_some() {
            return Err(EngineError::Txn("a graph is already installed".into()));
        }
        *slot = Some(Arc::new(graph));
        Ok(())
    }

    fn remove_graph(&self) {
        *self.graph.lock().expect("graph lock poisoned") = None;
        *self.table.write().expect("table lock poisoned") = Arc::new(ValueTable::new());
        self.loaded.store(false, Ordering::SeqCst);
    }

    /// Whether every fact has produced at least one value. Non-blocking;
    /// interpret is guarded on this.
    pub fn loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// The current coherent snapshot.
    pub fn snapshot(&self) -> Arc<ValueTable> {
        self.table.read().expect("table lock poisoned").clone()
    }

    /// Takes the event stream. Yields `Ok(())` once per published
    /// snapshot, `Err` on an engine failure that aborted the session.
    pub fn stream(&self) -> Option<Receiver<StreamMsg>> {
        self.stream_rx.lock().expect("stream lock poisoned").take()
    }

    /// Releases per-node resources. Idempotent; call after `run` has
    /// returned.
    pub fn cleanup(&self) {
        self.remove_graph();
    }

    /// Runs facts and the scheduler until `ctx` is cancelled. Blocks.
    pub fn run(&self, ctx: &Context) -> Result<(), EngineError> {
        let graph = self
            .graph
            .lock()
            .expect("graph lock poisoned")
            .clone()
            .ok_or_else(|| EngineError::Txn("no graph installed".into()))?;

        let fact_ctx = Context::new();
        let (fact_tx, fact_rx) = channel::<(NodeIndex, anyhow::Result<Value>)>();
        let rt = self.fact_runtime();

        let facts = graph.fact_indices();
        let mut handles = Vec::with_capacity(facts.len());
        for &idx in &facts {
            let NodeKind::Fact { def, args } = &graph.graph[idx].kind else {
                unreachable!("fact_indices returned a pure vertex");
            };
            let name = graph.graph[idx].name.clone();
            let stream = def.make(args, &rt).map_err(|e| EngineError::FactInit {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            let outer_tx = fact_tx.clone();
            let (inner_tx, inner_rx) = channel::<anyhow::Result<Value>>();
            std::thread::Builder::new()
                .name(format!("fact-tag:{name}"))
                .spawn(move || {
                    for msg in inner_rx {
                        if outer_tx.send((idx, msg)).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| EngineError::FactInit {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            let fact_ctx = fact_ctx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("fact:{name}"))
                .spawn(move || stream.run(inner_tx, &fact_ctx))
                .map_err(|e| EngineError::FactInit {
                    name,
                    reason: e.to_string(),
                })?;
            handles.push(handle);
        }
        drop(fact_tx);

        tracing::info!(
            "engine running: {} vertices, {} facts",
            graph.node_count(),
            facts.len()
        );

        let result = self.scheduler(ctx, &graph, &facts, fact_rx);

        fact_ctx.cancel();
        for handle in handles {
            let _ = handle.join();
        }
        result
    }

    /// The event loop: collect fact updates, re-evaluate the dirty
    /// downstream subgraph, publish a snapshot, emit one stream message.
    fn scheduler(
        &self,
        ctx: &Context,
        graph: &FuncGraph,
        facts: &[NodeIndex],
        fact_rx: Receiver<(NodeIndex, anyhow::Result<Value>)>,
    ) -> Result<(), EngineError> {
        let mut fact_values: HashMap<NodeIndex, Value> = HashMap::new();
        let mut working = ValueTable::new();

        // Graphs without facts settle immediately: evaluate everything
        // once, publish, and idle until cancellation.
        if facts.is_empty() {
            let dirty: HashSet<NodeIndex> = graph.graph.node_indices().collect();
            if let Err(e) = self
                .propagate(graph, &dirty, &mut working)
                .and_then(|()| Self::check_table(graph, &working))
            {
                let _ = self.stream_tx.send(Err(e));
                return Ok(());
            }
            self.publish(&working);
        }

        loop {
            if ctx.is_cancelled() {
                tracing::debug!("engine context cancelled, shutting down");
                return Ok(());
            }
            let first = match fact_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    // All facts gone; nothing further can change.
                    ctx.sleep(Duration::from_millis(100));
                    continue;
                }
            };

            let mut batch = vec![first];
            batch.extend(fact_rx.try_iter());

            let mut dirty_facts = HashSet::new();
            for (idx, result) in batch {
                let value = match result {
                    Ok(v) => v,
                    Err(e) => {
                        let err = EngineError::FactRun {
                            name: graph.graph[idx].name.clone(),
                            reason: e.to_string(),
                        };
                        tracing::error!("{err}");
                        let _ = self.stream_tx.send(Err(err));
                        return Ok(());
                    }
                };
                // Only a changed value dirties the subgraph.
                if fact_values.get(&idx) != Some(&value) {
                    fact_values.insert(idx, value);
                    dirty_facts.insert(idx);
                }
            }

            let all_loaded = fact_values.len() == facts.len();
            if !all_loaded {
                continue;
            }

            let dirty: HashSet<NodeIndex> = if self.loaded() {
                if dirty_facts.is_empty() {
                    continue;
                }
                // Downstream closure of the changed facts.
                let mut dirty = HashSet::new();
                for &start in &dirty_facts {
                    let mut dfs = petgraph::visit::Dfs::new(&graph.graph, start);
                    while let Some(nx) = dfs.next(&graph.graph) {
                        dirty.insert(nx);
                    }
                }
                dirty
            } else {
                // First coherent wave covers the whole graph.
                graph.graph.node_indices().collect()
            };

            for (&idx, value) in &fact_values {
                working.insert(graph.graph[idx].expr, value.clone());
            }

            if let Err(e) = self
                .propagate(graph, &dirty, &mut working)
                .and_then(|()| Self::check_table(graph, &working))
            {
                let _ = self.stream_tx.send(Err(e));
                return Ok(());
            }
            self.publish(&working);
        }
    }

    /// A snapshot about to be published must hold a value for every
    /// vertex of the installed graph; anything less would let a consumer
    /// observe a half-evaluated wave. The working table only ever gains
    /// keys from the current graph, so no stale-key check is needed.
    fn check_table(graph: &FuncGraph, working: &ValueTable) -> Result<(), EngineError> {
        for idx in graph.graph.node_indices() {
            let node = &graph.graph[idx];
            if !working.contains_key(&node.expr) {
                return Err(EngineError::TableInconsistent {
                    name: node.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Evaluates the dirty pure vertices in topological waves; vertices
    /// within one wave run in parallel. The working table is only merged
    /// between waves, so every vertex reads a consistent prefix.
    fn propagate(
        &self,
        graph: &FuncGraph,
        dirty: &HashSet<NodeIndex>,
        working: &mut ValueTable,
    ) -> Result<(), EngineError> {
        let order = toposort(&graph.graph, None).map_err(|_| EngineError::NotDag)?;

        let mut level: HashMap<NodeIndex, usize> = HashMap::new();
        let mut waves: Vec<Vec<NodeIndex>> = Vec::new();
        for idx in order {
            if !dirty.contains(&idx) || !graph.graph[idx].pure() {
                continue;
            }
            let depth = graph
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .filter_map(|dep| level.get(&dep).map(|&l| l + 1))
                .max()
                .unwrap_or(0);
            level.insert(idx, depth);
            if waves.len() <= depth {
                waves.resize_with(depth + 1, Vec::new);
            }
            waves[depth].push(idx);
        }

        for wave in waves {
            let snapshot = &*working;
            let results: Vec<(ExprId, anyhow::Result<Value>)> = wave
                .par_iter()
                .map(|&idx| {
                    let node = &graph.graph[idx];
                    let ctx = EvalCtx {
                        ast: &self.ast,
                        res: &self.res,
                        funcs: &self.funcs,
                        table: snapshot,
                    };
                    (node.expr, eval::eval_call_uncached(&ctx, node.expr))
                })
                .collect();
            for (expr, result) in results {
                let value = result.map_err(|e| EngineError::FuncRun {
                    name: node_name(graph, expr),
                    reason: e.to_string(),
                })?;
                working.insert(expr, value);
            }
        }
        Ok(())
    }

    fn publish(&self, working: &ValueTable) {
        *self.table.write().expect("table lock poisoned") = Arc::new(working.clone());
        let first = !self.loaded.swap(true, Ordering::SeqCst);
        if first {
            tracing::info!("engine loaded: all facts have produced a value");
        }
        let _ = self.stream_tx.send(Ok(()));
    }
}

fn node_name(graph: &FuncGraph, expr: ExprId) -> String {
    graph
        .by_expr
        .get(&expr)
        .map(|&idx| graph.graph[idx].name.clone())
        .unwrap_or_else(|| format!("expr#{expr}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use crate::types::unify;
    use crate::world::LocalWorld;
    use crate::{interpolate, parse, resources, scope};
    use camino::Utf8Path;

    struct Compiled {
        ast: Arc<Ast>,
        res: Arc<Resolutions>,
        funcs: Arc<FuncRegistry>,
        world: Arc<LocalWorld>,
        fs: Arc<MemFs>,
    }

    fn compile(src: &str) -> Compiled {
        let mut ast = Ast::new();
        let stmts = parse::parse(src, &mut ast).unwrap();
        interpolate::interpolate(&mut ast, &stmts).unwrap();
        ast.root = stmts;
        let funcs = Arc::new(FuncRegistry::with_defaults());
        let world = Arc::new(LocalWorld::with_hostname("testhost"));
        let fs = Arc::new(MemFs::new());
        let root = ast.root.clone();
        let builder =
            scope::ScopeBuilder::new(&mut ast, fs.clone(), world.clone(), &funcs, None, None);
        let out = builder.run(&root, Utf8Path::new("/proj")).unwrap();
        unify::infer(
            unify::DEFAULT_STRATEGY,
            &mut ast,
            &root,
            &out.resolutions,
            &funcs,
            resources::registry(),
        )
        .unwrap();
        Compiled {
            ast: Arc::new(ast),
            res: Arc::new(out.resolutions),
            funcs,
            world,
            fs,
        }
    }

    fn graph_of(c: &Compiled) -> FuncGraph {
        let rt = FactRuntime {
            world: c.world.clone(),
            fs: c.fs.clone(),
        };
        build_graph(&c.ast, &c.res, &c.funcs, &rt).unwrap()
    }

    fn engine_of(c: &Compiled) -> Engine {
        Engine::new(
            c.ast.clone(),
            c.res.clone(),
            c.funcs.clone(),
            c.world.clone(),
            c.fs.clone(),
        )
    }

    #[test]
    fn graph_has_vertices_for_calls_and_facts() {
        let c = compile("$h = sys.hostname()\n$u = strings.to_upper($h)");
        let g = graph_of(&c);
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.graph.edge_count(), 1);
        assert_eq!(g.fact_indices().len(), 1);
    }

    #[test]
    fn lambda_body_calls_are_not_vertices() {
        let c = compile("$f = func($x) { strings.to_upper($x) }\n$y = f(\"a\")");
        let g = graph_of(&c);
        // Only the outer call is a vertex.
        assert_eq!(g.node_count(), 1);
    }

    #[test]
    fn fact_args_must_be_static() {
        let c = compile("$h = sys.hostname()\n$f = world.getval($h)");
        let rt = FactRuntime {
            world: c.world.clone(),
            fs: c.fs.clone(),
        };
        let err = build_graph(&c.ast, &c.res, &c.funcs, &rt).unwrap_err();
        assert!(matches!(err, EngineError::FactArgNotStatic { .. }));
    }

    #[test]
    fn cyclic_bindings_fail_commit() {
        let c = compile("$a = strings.to_upper($b)\n$b = strings.to_lower($a)");
        let g = graph_of(&c);
        let engine = engine_of(&c);
        let err = engine.txn().add_graph(g).commit().unwrap_err();
        assert!(matches!(err, EngineError::NotDag));
    }

    #[test]
    fn run_streams_and_loads() {
        let c = compile("$h = sys.hostname()\n$u = strings.to_upper($h)");
        let engine = engine_of(&c);
        let committed = engine.txn().add_graph(graph_of(&c)).commit().unwrap();
        let stream = engine.stream().unwrap();
        assert!(!engine.loaded());

        let ctx = Context::new();
        std::thread::scope(|s| {
            let engine_ref = &engine;
            let ctx_clone = ctx.clone();
            s.spawn(move || engine_ref.run(&ctx_clone).unwrap());

            let msg = stream.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(msg.is_ok());
            assert!(engine_ref.loaded());

            let table = engine_ref.snapshot();
            assert!(table.values().any(|v| *v == Value::Str("TESTHOST".into())));
            ctx.cancel();
        });
        committed.reverse().unwrap();
        assert!(!engine.loaded());
    }

    #[test]
    fn kv_change_refires_stream() {
        let c = compile("$v = world.getval(\"k\")\n$u = strings.to_upper($v)");
        c.world.kv_set("k", "one");
        let engine = engine_of(&c);
        let _committed = engine.txn().add_graph(graph_of(&c)).commit().unwrap();
        let stream = engine.stream().unwrap();

        let ctx = Context::new();
        std::thread::scope(|s| {
            let engine_ref = &engine;
            let ctx_clone = ctx.clone();
            s.spawn(move || engine_ref.run(&ctx_clone).unwrap());

            stream
                .recv_timeout(Duration::from_secs(5))
                .unwrap()
                .unwrap();
            let before = engine_ref.snapshot();
            assert!(before.values().any(|v| *v == Value::Str("ONE".into())));

            c.world.kv_set("k", "two");
            stream
                .recv_timeout(Duration::from_secs(5))
                .unwrap()
                .unwrap();
            let after = engine_ref.snapshot();
            assert!(after.values().any(|v| *v == Value::Str("TWO".into())));
            ctx.cancel();
        });
    }

    #[test]
    fn factless_graph_settles_immediately() {
        let c = compile("$s = strings.to_upper(\"quiet\")");
        let engine = engine_of(&c);
        let _committed = engine.txn().add_graph(graph_of(&c)).commit().unwrap();
        let stream = engine.stream().unwrap();

        let ctx = Context::new();
        std::thread::scope(|s| {
            let engine_ref = &engine;
            let ctx_clone = ctx.clone();
            s.spawn(move || engine_ref.run(&ctx_clone).unwrap());
            stream
                .recv_timeout(Duration::from_secs(5))
                .unwrap()
                .unwrap();
            assert!(engine_ref.loaded());
            ctx.cancel();
        });
    }

    #[test]
    fn snapshot_must_cover_every_vertex() {
        let c = compile("$h = sys.hostname()\n$u = strings.to_upper($h)");
        let g = graph_of(&c);

        let err = Engine::check_table(&g, &ValueTable::new()).unwrap_err();
        assert!(matches!(err, EngineError::TableInconsistent { .. }));

        let mut full = ValueTable::new();
        for idx in g.graph.node_indices() {
            full.insert(g.graph[idx].expr, Value::Str("x".into()));
        }
        assert!(Engine::check_table(&g, &full).is_ok());
    }

    #[test]
    fn stream_can_only_be_taken_once() {
        let c = compile("$s = strings.to_upper(\"x\")");
        let engine = engine_of(&c);
        assert!(engine.stream().is_some());
        assert!(engine.stream().is_none());
    }

    #[test]
    fn double_install_rejected() {
        let c = compile("$s = strings.to_upper(\"x\")");
        let engine = engine_of(&c);
        engine.txn().add_graph(graph_of(&c)).commit().unwrap();
        let err = engine.txn().add_graph(graph_of(&c)).commit().unwrap_err();
        assert!(matches!(err, EngineError::Txn(_)));
    }

    #[test]
    fn context_sleep_wakes_on_cancel() {
        let ctx = Context::new();
        let ctx2 = ctx.clone();
        let start = std::time::Instant::now();
        let handle = std::thread::spawn(move || ctx2.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(50));
        ctx.cancel();
        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
