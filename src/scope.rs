//! Scope construction.
//!
//! Propagates the lexical scope of variables, functions and classes
//! through the tree, resolving every name to its binding. Along the way it
//! loads imported modules (recursively, through the input resolver),
//! maintains the acyclic import graph, expands `include` statements by
//! copying class bodies, and collects the file list for deploy staging.
//!
//! Binding is out-of-order within a block: `$x` may be referenced above
//! its `$x = …` statement. Each block is therefore processed in two
//! passes, bindings first, references second.

use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::ast::{Ast, ExprId, ExprKind, Span, StmtId, StmtKind};
use crate::error::{MclError, ScopeError};
use crate::fs::Fs;
use crate::funcs::{FuncEntry, FuncRegistry};
use crate::input;
use crate::interpolate;
use crate::parse;
use crate::world::{Downloader, World};

/// Variable bound into the seed scope of every module.
const MAGIC_VAR: (&str, &str) = ("purpleidea", "hello world!");

/// The lexical bindings visible at a program point.
pub struct Scope {
    parent: Option<Rc<Scope>>,
    pub variables: HashMap<String, ExprId>,
    pub classes: HashMap<String, Rc<ClassDef>>,
    /// Import alias to the module's exported scope.
    pub imports: HashMap<String, Rc<Scope>>,
    /// Function names visible here; values are registry keys.
    pub functions: HashMap<String, String>,
}

impl Scope {
    fn lookup_var(&self, name: &str) -> Option<ExprId> {
        match self.variables.get(name) {
            Some(&id) => Some(id),
            None => self.parent.as_ref()?.lookup_var(name),
        }
    }

    fn lookup_class(&self, name: &str) -> Option<Rc<ClassDef>> {
        match self.classes.get(name) {
            Some(c) => Some(c.clone()),
            None => self.parent.as_ref()?.lookup_class(name),
        }
    }

    fn lookup_import(&self, alias: &str) -> Option<Rc<Scope>> {
        match self.imports.get(alias) {
            Some(s) => Some(s.clone()),
            None => self.parent.as_ref()?.lookup_import(alias),
        }
    }

    fn lookup_func(&self, name: &str) -> Option<String> {
        match self.functions.get(name) {
            Some(key) => Some(key.clone()),
            None => self.parent.as_ref()?.lookup_func(name),
        }
    }
}

/// A class definition together with its captured scope.
pub struct ClassDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<StmtId>,
    /// The scope at the definition point. Weak to break the cycle with
    /// the scope's own class map; always upgradable while the pass runs.
    captured: Weak<Scope>,
    /// Module base, so imports inside the body resolve relative to the
    /// defining module.
    base: Utf8PathBuf,
    /// Identity used for recursion detection.
    stmt: StmtId,
}

/// How a call site resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// A builtin, by registry key.
    Builtin(String),
    /// A user function literal, by its expression id.
    Lambda(ExprId),
}

/// Name-resolution tables produced by the pass, keyed by node id.
#[derive(Debug, Default)]
pub struct Resolutions {
    /// Variable reference to the expression it is bound to.
    pub var_bindings: HashMap<ExprId, ExprId>,
    /// Variable reference to the function literal parameter it names.
    pub param_vars: HashMap<ExprId, (ExprId, usize)>,
    /// Call expression to its target.
    pub call_targets: HashMap<ExprId, CallTarget>,
}

#[derive(Debug)]
pub struct ScopeOutput {
    pub resolutions: Resolutions,
    /// Files referenced by all loaded modules, for deploy staging.
    pub files: Vec<Utf8PathBuf>,
    /// Bases of all loaded modules, in import order.
    pub modules: Vec<Utf8PathBuf>,
}

pub struct ScopeBuilder<'a> {
    ast: &'a mut Ast,
    fs: Arc<dyn Fs>,
    world: Arc<dyn World>,
    registry: &'a FuncRegistry,
    downloader: Option<&'a dyn Downloader>,
    module_path: Option<Utf8PathBuf>,

    graph: DiGraph<Utf8PathBuf, ()>,
    nodes: HashMap<Utf8PathBuf, NodeIndex>,
    loaded: HashMap<Utf8PathBuf, Rc<Scope>>,

    res: Resolutions,
    files: Vec<Utf8PathBuf>,
    modules: Vec<Utf8PathBuf>,
    include_stack: Vec<StmtId>,
    /// Parameter environments of enclosing function literals.
    params: Vec<HashMap<String, (ExprId, usize)>>,
}

impl<'a> ScopeBuilder<'a> {
    pub fn new(
        ast: &'a mut Ast,
        fs: Arc<dyn Fs>,
        world: Arc<dyn World>,
        registry: &'a FuncRegistry,
        downloader: Option<&'a dyn Downloader>,
        module_path: Option<Utf8PathBuf>,
    ) -> Self {
        Self {
            ast,
            fs,
            world,
            registry,
            downloader,
            module_path,
            graph: DiGraph::new(),
            nodes: HashMap::new(),
            loaded: HashMap::new(),
            res: Resolutions::default(),
            files: Vec::new(),
            modules: Vec::new(),
            include_stack: Vec::new(),
            params: Vec::new(),
        }
    }

    /// Runs the pass over the entry module's statement list.
    pub fn run(mut self, root: &[StmtId], base: &Utf8Path) -> Result<ScopeOutput, MclError> {
        if let Some(path) = &self.module_path {
            input::validate_module_path(path).map_err(MclError::Input)?;
        }
        let seed = self.seed_scope();
        self.node_for(base);
        self.modules.push(base.to_owned());
        self.scope_block(root, seed, base)?;
        // Repeated expansions of one class reference the same files.
        let mut seen = std::collections::HashSet::new();
        self.files.retain(|p| seen.insert(p.clone()));
        Ok(ScopeOutput {
            resolutions: self.res,
            files: self.files,
            modules: self.modules,
        })
    }

    /// The scope every module starts from: magic variables, the hostname,
    /// and all registered builtins.
    fn seed_scope(&mut self) -> Rc<Scope> {
        let span = Span::default();
        let mut variables = HashMap::new();
        variables.insert(
            MAGIC_VAR.0.to_string(),
            self.ast
                .add_expr(span, ExprKind::Str(MAGIC_VAR.1.to_string())),
        );
        variables.insert(
            "hostname".to_string(),
            self.ast
                .add_expr(span, ExprKind::Str(self.world.hostname())),
        );
        let functions = self
            .registry
            .names()
            .map(|n| (n.to_string(), n.to_string()))
            .collect();
        Rc::new(Scope {
            parent: None,
            variables,
            classes: HashMap::new(),
            imports: HashMap::new(),
            functions,
        })
    }

    fn node_for(&mut self, base: &Utf8Path) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(base) {
            return idx;
        }
        let idx = self.graph.add_node(base.to_owned());
        self.nodes.insert(base.to_owned(), idx);
        idx
    }

    /// Scopes one statement block. Returns the block scope so callers can
    /// export it (module top level) or chain it (nested blocks).
    fn scope_block(
        &mut self,
        stmts: &[StmtId],
        parent: Rc<Scope>,
        base: &Utf8Path,
    ) -> Result<Rc<Scope>, MclError> {
        // First pass: imports, then bindings and class definitions, so
        // references anywhere in the block can see them.
        let mut variables: HashMap<String, ExprId> = HashMap::new();
        let mut imports: HashMap<String, Rc<Scope>> = HashMap::new();
        let mut functions: HashMap<String, String> = HashMap::new();
        let mut class_stmts: Vec<(String, Vec<String>, Vec<StmtId>, StmtId)> = Vec::new();
        let mut merged_classes: HashMap<String, Rc<ClassDef>> = HashMap::new();

        for &sid in stmts {
            let span = self.ast.stmt(sid).span;
            match self.ast.stmt(sid).kind.clone() {
                StmtKind::Import { path, alias } => {
                    let (module_scope, _module_base) = self.load_module(&path, base)?;
                    let alias = alias.unwrap_or_else(|| default_alias(&path));
                    if alias == "*" {
                        for (name, &id) in &module_scope.variables {
                            variables.insert(name.clone(), id);
                        }
                        for (name, class) in &module_scope.classes {
                            merged_classes.insert(name.clone(), class.clone());
                        }
                        for (name, key) in &module_scope.functions {
                            functions.insert(name.clone(), key.clone());
                        }
                    } else {
                        imports.insert(alias, module_scope);
                    }
                }
                StmtKind::Bind { name, value } => {
                    if variables.insert(name.clone(), value).is_some() {
                        return Err(ScopeError::DuplicateBinding { name, span }.into());
                    }
                }
                StmtKind::Class { name, params, body } => {
                    if class_stmts.iter().any(|(n, ..)| *n == name) {
                        return Err(ScopeError::DuplicateBinding { name, span }.into());
                    }
                    class_stmts.push((name, params, body, sid));
                }
                _ => {}
            }
        }

        let base_owned = base.to_owned();
        let scope = Rc::new_cyclic(|weak: &Weak<Scope>| {
            let mut classes = merged_classes;
            for (name, params, body, sid) in class_stmts {
                classes.insert(
                    name.clone(),
                    Rc::new(ClassDef {
                        name,
                        params,
                        body,
                        captured: weak.clone(),
                        base: base_owned.clone(),
                        stmt: sid,
                    }),
                );
            }
            Scope {
                parent: Some(parent),
                variables,
                classes,
                imports,
                functions,
            }
        });

        // Second pass: resolve references and expand includes.
        for &sid in stmts {
            self.resolve_stmt(sid, &scope, base)?;
        }
        Ok(scope)
    }

    fn resolve_stmt(
        &mut self,
        sid: StmtId,
        scope: &Rc<Scope>,
        base: &Utf8Path,
    ) -> Result<(), MclError> {
        let span = self.ast.stmt(sid).span;
        match self.ast.stmt(sid).kind.clone() {
            StmtKind::Import { .. } => Ok(()),
            StmtKind::Bind { value, .. } => self.resolve_expr(value, scope, base),
            // Class bodies are templates; they are scoped per expansion.
            StmtKind::Class { .. } => Ok(()),
            StmtKind::Include { name, args, .. } => {
                for &arg in &args {
                    self.resolve_expr(arg, scope, base)?;
                }
                self.expand_include(sid, &name, &args, scope, span)
            }
            StmtKind::Res {
                name,
                fields,
                edges,
                ..
            } => {
                self.resolve_expr(name, scope, base)?;
                for field in &fields {
                    self.resolve_expr(field.value, scope, base)?;
                    // A field naming a staged file is a staging trigger.
                    let lit = match &self.ast.expr(field.value).kind {
                        ExprKind::Str(s) => Some(s.clone()),
                        _ => None,
                    };
                    if let Some(lit) = lit {
                        self.collect_file_ref(&lit, base);
                    }
                }
                for edge in &edges {
                    self.resolve_expr(edge.target.name, scope, base)?;
                }
                Ok(())
            }
            StmtKind::Edge { from, to } => {
                self.resolve_expr(from.res.name, scope, base)?;
                self.resolve_expr(to.res.name, scope, base)
            }
            StmtKind::If { cond, then, els } => {
                self.resolve_expr(cond, scope, base)?;
                self.scope_block(&then, scope.clone(), base)?;
                self.scope_block(&els, scope.clone(), base)?;
                Ok(())
            }
        }
    }

    /// Records a module-relative reference to a staged file. Only
    /// literal `files/` paths can be collected statically; interpolated
    /// references are the deploy driver's concern.
    fn collect_file_ref(&mut self, lit: &str, base: &Utf8Path) {
        if lit.starts_with("files/") {
            self.files.push(crate::fs::normalize(&base.join(lit)));
        }
    }

    fn expand_include(
        &mut self,
        sid: StmtId,
        name: &str,
        args: &[ExprId],
        scope: &Rc<Scope>,
        span: Span,
    ) -> Result<(), MclError> {
        let class = scope
            .lookup_class(name)
            .ok_or_else(|| ScopeError::UnknownClass {
                name: name.to_string(),
                span,
            })?;
        if class.params.len() != args.len() {
            return Err(ScopeError::ClassArityMismatch {
                name: name.to_string(),
                expected: class.params.len(),
                actual: args.len(),
                span,
            }
            .into());
        }
        if self.include_stack.contains(&class.stmt) {
            return Err(ScopeError::RecursiveClass {
                name: name.to_string(),
                span,
            }
            .into());
        }

        let copied: Vec<StmtId> = class.body.iter().map(|&s| self.ast.copy_stmt(s)).collect();

        // Parameters bind as ordinary variables in a child of the class's
        // captured scope: the body sees its lexical environment, not the
        // caller's.
        let captured = class
            .captured
            .upgrade()
            .expect("captured scope outlives the pass");
        let param_scope = Rc::new(Scope {
            parent: Some(captured),
            variables: class
                .params
                .iter()
                .cloned()
                .zip(args.iter().copied())
                .collect(),
            classes: HashMap::new(),
            imports: HashMap::new(),
            functions: HashMap::new(),
        });

        self.include_stack.push(class.stmt);
        let base = class.base.clone();
        let result = self.scope_block(&copied, param_scope, &base);
        self.include_stack.pop();
        result?;

        let StmtKind::Include { expanded, .. } = &mut self.ast.stmt_mut(sid).kind else {
            unreachable!("expand_include called on a non-include");
        };
        *expanded = copied;
        Ok(())
    }

    fn resolve_expr(
        &mut self,
        id: ExprId,
        scope: &Rc<Scope>,
        base: &Utf8Path,
    ) -> Result<(), MclError> {
        let span = self.ast.expr(id).span;
        match self.ast.expr(id).kind.clone() {
            ExprKind::Bool(_) | ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Str(_) => Ok(()),
            ExprKind::List(items) => {
                for e in items {
                    self.resolve_expr(e, scope, base)?;
                }
                Ok(())
            }
            ExprKind::Map(pairs) => {
                for (k, v) in pairs {
                    self.resolve_expr(k, scope, base)?;
                    self.resolve_expr(v, scope, base)?;
                }
                Ok(())
            }
            ExprKind::Struct(fields) => {
                for (_, e) in fields {
                    self.resolve_expr(e, scope, base)?;
                }
                Ok(())
            }
            ExprKind::Func { params, body } => {
                let env = params
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (p.clone(), (id, i)))
                    .collect();
                self.params.push(env);
                let result = self.resolve_expr(body, scope, base);
                self.params.pop();
                result
            }
            ExprKind::Var { name } => self.resolve_var(id, &name, scope, span),
            ExprKind::Call { target, args } => {
                for &arg in &args {
                    self.resolve_expr(arg, scope, base)?;
                }
                self.resolve_call(id, &target, scope, base, span)
            }
            ExprKind::BinOp { lhs, rhs, .. } => {
                self.resolve_expr(lhs, scope, base)?;
                self.resolve_expr(rhs, scope, base)
            }
            ExprKind::UnOp { operand, .. } => self.resolve_expr(operand, scope, base),
        }
    }

    fn resolve_var(
        &mut self,
        id: ExprId,
        name: &str,
        scope: &Rc<Scope>,
        span: Span,
    ) -> Result<(), MclError> {
        // Function literal parameters shadow everything.
        for env in self.params.iter().rev() {
            if let Some(&slot) = env.get(name) {
                self.res.param_vars.insert(id, slot);
                return Ok(());
            }
        }
        if let Some((alias, rest)) = name.split_once('.') {
            let module = scope
                .lookup_import(alias)
                .ok_or_else(|| ScopeError::UnknownImport {
                    name: alias.to_string(),
                    span,
                })?;
            let target =
                module
                    .variables
                    .get(rest)
                    .copied()
                    .ok_or_else(|| ScopeError::UnboundName {
                        name: name.to_string(),
                        span,
                    })?;
            self.res.var_bindings.insert(id, target);
            return Ok(());
        }
        let target = scope
            .lookup_var(name)
            .ok_or_else(|| ScopeError::UnboundName {
                name: name.to_string(),
                span,
            })?;
        self.res.var_bindings.insert(id, target);
        Ok(())
    }

    fn resolve_call(
        &mut self,
        id: ExprId,
        target: &str,
        scope: &Rc<Scope>,
        base: &Utf8Path,
        span: Span,
    ) -> Result<(), MclError> {
        // A variable bound to a function literal shadows builtins.
        if let Some(bound) = scope.lookup_var(target)
            && matches!(self.ast.expr(bound).kind, ExprKind::Func { .. })
        {
            self.res.call_targets.insert(id, CallTarget::Lambda(bound));
            return Ok(());
        }
        if let Some(key) = scope.lookup_func(target) {
            // Facts are long-lived graph vertices; a function literal body
            // is re-evaluated per call site and cannot host one.
            if !self.params.is_empty()
                && matches!(self.registry.lookup(&key), Some(FuncEntry::Fact(_)))
            {
                return Err(ScopeError::FactInFunc {
                    name: target.to_string(),
                    span,
                }
                .into());
            }
            self.collect_fact_file_arg(&key, id, base);
            self.res.call_targets.insert(id, CallTarget::Builtin(key));
            return Ok(());
        }
        if let Some((alias, rest)) = target.split_once('.')
            && let Some(module) = scope.lookup_import(alias)
        {
            if let Some(&bound) = module.variables.get(rest)
                && matches!(self.ast.expr(bound).kind, ExprKind::Func { .. })
            {
                self.res.call_targets.insert(id, CallTarget::Lambda(bound));
                return Ok(());
            }
            if let Some(key) = module.functions.get(rest) {
                let key = key.clone();
                self.collect_fact_file_arg(&key, id, base);
                self.res.call_targets.insert(id, CallTarget::Builtin(key));
                return Ok(());
            }
        }
        Err(ScopeError::UnboundName {
            name: target.to_string(),
            span,
        }
        .into())
    }

    /// The file-reading fact is this dialect's template analog: its
    /// content flows into resource fields the way rendered templates
    /// would. A static path argument joins the staging list.
    fn collect_fact_file_arg(&mut self, key: &str, id: ExprId, base: &Utf8Path) {
        if key != "os.readfile" {
            return;
        }
        let lit = match &self.ast.expr(id).kind {
            ExprKind::Call { args, .. } => {
                args.first().and_then(|&a| match &self.ast.expr(a).kind {
                    ExprKind::Str(s) => Some(s.clone()),
                    _ => None,
                })
            }
            _ => None,
        };
        if let Some(lit) = lit {
            self.collect_file_ref(&lit, base);
        }
    }

    /// Loads (or reuses) the module designated by an import path and
    /// returns its exported scope.
    fn load_module(
        &mut self,
        path: &str,
        importer_base: &Utf8Path,
    ) -> Result<(Rc<Scope>, Utf8PathBuf), MclError> {
        let target = self.locate_module(path, importer_base)?;

        let from = self.node_for(importer_base);
        let to = self.node_for(&target.base);
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
        if is_cyclic_directed(&self.graph) {
            return Err(ScopeError::CyclicImport(target.base.clone()).into());
        }

        if let Some(scope) = self.loaded.get(&target.base) {
            return Ok((scope.clone(), target.base));
        }

        tracing::debug!("loading module `{}` from `{}`", path, target.base);
        let base = target.base.clone();
        let scope = self
            .load_module_inner(target)
            .map_err(|e| ScopeError::ModuleLoad {
                path: base.clone(),
                source: Box::new(e),
            })?;
        self.loaded.insert(base.clone(), scope.clone());
        self.modules.push(base.clone());
        Ok((scope, base))
    }

    fn load_module_inner(&mut self, parsed: input::ParsedInput) -> Result<Rc<Scope>, MclError> {
        let src = String::from_utf8_lossy(&parsed.main).into_owned();
        let stmts = parse::parse(&src, self.ast)?;
        interpolate::interpolate(self.ast, &stmts)?;
        self.files.extend(parsed.files.iter().cloned());
        let seed = self.seed_scope();
        self.scope_block(&stmts, seed, &parsed.base)
    }

    /// Resolves an import path to a loaded [`input::ParsedInput`]. Remote
    /// (URL-prefixed) paths resolve under the module path and may invoke
    /// the downloader; everything else is relative to the importer.
    fn locate_module(
        &mut self,
        path: &str,
        importer_base: &Utf8Path,
    ) -> Result<input::ParsedInput, MclError> {
        if let Some((_scheme, rest)) = path.split_once("://") {
            let module_path = self.module_path.clone().ok_or_else(|| {
                MclError::Input(crate::error::InputError::InputInvalid(format!(
                    "import `{path}` needs a module path"
                )))
            })?;
            let normalized = rest.trim_matches('/');
            let candidate = module_path.join(normalized);
            let dir = if self.fs.stat(&candidate).is_ok() {
                candidate
            } else {
                let downloader = self.downloader.ok_or_else(|| ScopeError::Download {
                    path: path.to_string(),
                    reason: "module is not present and no downloader is configured".to_string(),
                })?;
                downloader
                    .get(path, &module_path)
                    .map_err(MclError::Scope)?
            };
            let input = format!("{}/", dir.as_str().trim_end_matches('/'));
            return input::resolve(&input, &self.fs, importer_base).map_err(MclError::Input);
        }

        let joined = crate::fs::normalize(&importer_base.join(path));
        let input =
            if path.ends_with(input::FILE_EXTENSION) || path.ends_with(input::METADATA_FILENAME) {
                joined.to_string()
            } else {
                format!("{}/", joined.as_str().trim_end_matches('/'))
            };
        input::resolve(&input, &self.fs, importer_base).map_err(MclError::Input)
    }
}

/// The alias an unaliased import binds to: the last meaningful path
/// segment, minus any source extension.
fn default_alias(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    last.trim_end_matches(input::FILE_EXTENSION).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use crate::world::LocalWorld;

    fn build(src: &str) -> Result<(Ast, ScopeOutput), MclError> {
        build_with_fs(src, MemFs::new())
    }

    fn build_with_fs(src: &str, memfs: MemFs) -> Result<(Ast, ScopeOutput), MclError> {
        let mut ast = Ast::new();
        let stmts = parse::parse(src, &mut ast)?;
        interpolate::interpolate(&mut ast, &stmts)?;
        ast.root = stmts;
        let fs: Arc<dyn Fs> = Arc::new(memfs);
        let world: Arc<dyn World> = Arc::new(LocalWorld::with_hostname("h1"));
        let registry = FuncRegistry::with_defaults();
        let root = ast.root.clone();
        let builder = ScopeBuilder::new(&mut ast, fs, world, &registry, None, None);
        let out = builder.run(&root, Utf8Path::new("/proj"))?;
        Ok((ast, out))
    }

    #[test]
    fn binds_resolve_out_of_order() {
        let (_, out) = build("$a = $b\n$b = 42").unwrap();
        assert_eq!(out.resolutions.var_bindings.len(), 1);
    }

    #[test]
    fn seed_scope_is_visible() {
        assert!(build("$x = $purpleidea\n$y = $hostname").is_ok());
    }

    #[test]
    fn unbound_name_fails() {
        let err = build("$x = $missing").unwrap_err();
        assert!(matches!(
            err,
            MclError::Scope(ScopeError::UnboundName { ref name, .. }) if name == "missing"
        ));
    }

    #[test]
    fn duplicate_binding_fails() {
        let err = build("$x = 1\n$x = 2").unwrap_err();
        assert!(matches!(
            err,
            MclError::Scope(ScopeError::DuplicateBinding { .. })
        ));
    }

    #[test]
    fn shadowing_in_nested_block_is_allowed() {
        assert!(build("$x = 1\nif true { $x = 2 }").is_ok());
    }

    #[test]
    fn include_expands_body() {
        let src = r#"
            class c1($a, $b) { test $a { stringptr => $b, } }
            include c1("t1", "hello")
            include c1("t2", "world")
        "#;
        let (ast, _) = build(src).unwrap();
        let mut expansions = 0;
        for stmt in ast.root.clone() {
            if let StmtKind::Include { expanded, .. } = &ast.stmt(stmt).kind {
                assert_eq!(expanded.len(), 1);
                expansions += 1;
            }
        }
        assert_eq!(expansions, 2);
    }

    #[test]
    fn include_before_definition_is_allowed() {
        let src = r#"
            include c1("t1", "hello")
            class c1($a, $b) { test $a { stringptr => $b, } }
        "#;
        assert!(build(src).is_ok());
    }

    #[test]
    fn class_arity_mismatch_fails() {
        let src = r#"
            include c1("hello")
            class c1($a, $b) { test $a { stringptr => $b, } }
        "#;
        let err = build(src).unwrap_err();
        assert!(matches!(
            err,
            MclError::Scope(ScopeError::ClassArityMismatch {
                expected: 2,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn recursive_class_fails() {
        let src = r#"
            include c1(0)
            class c1($c) {
                if $c == 3 {
                    test "done" {}
                } else {
                    include c1($c + 1)
                }
            }
        "#;
        let err = build(src).unwrap_err();
        assert!(matches!(
            err,
            MclError::Scope(ScopeError::RecursiveClass { .. })
        ));
    }

    #[test]
    fn mutually_recursive_classes_fail() {
        let src = r#"
            class a() { include b() }
            class b() { include a() }
            include a()
        "#;
        let err = build(src).unwrap_err();
        assert!(matches!(
            err,
            MclError::Scope(ScopeError::RecursiveClass { .. })
        ));
    }

    #[test]
    fn class_captures_definition_scope() {
        // The class body sees $greeting from its defining scope even
        // though the include site does not rebind it.
        let src = r#"
            $greeting = "hello"
            class c1($a) { test $a { stringptr => $greeting, } }
            include c1("t1")
        "#;
        assert!(build(src).is_ok());
    }

    #[test]
    fn import_binds_alias() {
        let memfs = MemFs::new();
        memfs.insert("/proj/dir1/metadata.yaml", "main: main.mcl\n");
        memfs.insert("/proj/dir1/main.mcl", "$exported = \"from dir1\"\n");
        let src = "import \"dir1/\"\n$x = $dir1.exported";
        let (_, out) = build_with_fs(src, memfs).unwrap();
        assert_eq!(out.modules.len(), 2);
    }

    #[test]
    fn import_star_flat_merges() {
        let memfs = MemFs::new();
        memfs.insert("/proj/dir1/metadata.yaml", "main: main.mcl\n");
        memfs.insert("/proj/dir1/main.mcl", "$exported = \"from dir1\"\n");
        let src = "import \"dir1/\" as *\n$x = $exported";
        assert!(build_with_fs(src, memfs).is_ok());
    }

    #[test]
    fn cyclic_import_fails() {
        let memfs = MemFs::new();
        memfs.insert("/proj/dir1/metadata.yaml", "main: main.mcl\n");
        memfs.insert("/proj/dir1/main.mcl", "import \"../dir2/\"\n");
        memfs.insert("/proj/dir2/metadata.yaml", "main: main.mcl\n");
        memfs.insert("/proj/dir2/main.mcl", "import \"../dir1/\"\n");
        let err = build_with_fs("import \"dir1/\"", memfs).unwrap_err();
        let mut err: &dyn std::error::Error = &err;
        let mut found = false;
        loop {
            if err.to_string().contains("cyclic import") {
                found = true;
                break;
            }
            match err.source() {
                Some(next) => err = next,
                None => break,
            }
        }
        assert!(found, "expected a cyclic import in the chain");
    }

    #[test]
    fn module_files_are_collected() {
        let memfs = MemFs::new();
        memfs.insert(
            "/proj/dir1/metadata.yaml",
            "main: main.mcl\nfiles: files/\n",
        );
        memfs.insert("/proj/dir1/main.mcl", "$exported = 1\n");
        memfs.insert("/proj/dir1/files/data.txt", "payload");
        let (_, out) = build_with_fs("import \"dir1/\"", memfs).unwrap();
        assert!(out.files.iter().any(|p| p.as_str() == "/proj/dir1/files"));
    }

    #[test]
    fn resource_field_file_refs_are_collected() {
        let src = r#"
            test "t" { stringptr => "files/motd.txt", }
            test "u" { stringptr => "plain value", }
        "#;
        let (_, out) = build(src).unwrap();
        assert!(
            out.files
                .iter()
                .any(|p| p.as_str() == "/proj/files/motd.txt")
        );
        assert!(!out.files.iter().any(|p| p.as_str().contains("plain")));
    }

    #[test]
    fn file_fact_args_are_collected() {
        let src = "$c = os.readfile(\"files/data.txt\")\ntest \"t\" { stringptr => $c, }";
        let (_, out) = build(src).unwrap();
        assert!(
            out.files
                .iter()
                .any(|p| p.as_str() == "/proj/files/data.txt")
        );
    }

    #[test]
    fn file_refs_inside_includes_resolve_against_defining_module() {
        let src = r#"
            class c1($a) { test $a { stringptr => "files/tmpl.txt", } }
            include c1("t1")
        "#;
        let (_, out) = build(src).unwrap();
        assert!(
            out.files
                .iter()
                .any(|p| p.as_str() == "/proj/files/tmpl.txt")
        );
    }

    #[test]
    fn qualified_builtin_calls_resolve() {
        let (_, out) = build("$x = fmt.printf(\"%d\", 42)").unwrap();
        assert!(
            out.resolutions
                .call_targets
                .values()
                .any(|t| *t == CallTarget::Builtin("fmt.printf".to_string()))
        );
    }

    #[test]
    fn lambda_call_resolves_to_binding() {
        let (_, out) = build("$double = func($x) { $x + $x }\n$y = double(2)").unwrap();
        assert!(
            out.resolutions
                .call_targets
                .values()
                .any(|t| matches!(t, CallTarget::Lambda(_)))
        );
        assert!(!out.resolutions.param_vars.is_empty());
    }

    #[test]
    fn fact_inside_lambda_fails() {
        let err = build("$f = func($x) { datetime.now() + $x }\n$y = f(1)").unwrap_err();
        assert!(matches!(
            err,
            MclError::Scope(ScopeError::FactInFunc { .. })
        ));
    }
}
