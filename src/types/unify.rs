//! Type inference.
//!
//! A constraint solver over unification variables. The walk emits one
//! [`UnificationInvariant`] per expression (plus the constraints its
//! context imposes), the solver unifies them over an `ena` union-find
//! forest, and extraction replaces every variable with its concrete type.
//! Operators and polymorphic builtins register shape checks that run after
//! extraction, when every type is known.

use std::collections::HashMap;

use ena::unify::{InPlaceUnificationTable, NoError, UnifyKey, UnifyValue};

use crate::ast::{Ast, BinOp, ExprId, ExprKind, Span, StmtId, StmtKind, UnOp};
use crate::error::TypeError;
use crate::funcs::{FuncEntry, FuncRegistry};
use crate::resources::KindRegistry;
use crate::scope::{CallTarget, Resolutions};
use crate::types::{Type, TypeVar};

/// The registry key of the default solver.
pub const DEFAULT_STRATEGY: &str = "union-find";

/// One equality constraint, anchored to the expression it came from.
#[derive(Debug, Clone)]
pub struct UnificationInvariant {
    pub expr: ExprId,
    pub expected: Type,
    pub actual: Type,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TvKey(u32);

impl UnifyKey for TvKey {
    type Value = Partial;

    fn index(&self) -> u32 {
        self.0
    }

    fn from_index(u: u32) -> Self {
        TvKey(u)
    }

    fn tag() -> &'static str {
        "TvKey"
    }
}

/// Best-known partial type of a unification set. Structural merging of
/// two known types happens in [`Solver::unify`], which decomposes them
/// before unioning; by the time sets merge, picking either side is sound.
#[derive(Debug, Clone, PartialEq)]
struct Partial(Option<Type>);

impl UnifyValue for Partial {
    type Error = NoError;

    fn unify_values(a: &Self, b: &Self) -> Result<Self, NoError> {
        Ok(match (&a.0, &b.0) {
            (Some(_), _) => a.clone(),
            (None, _) => b.clone(),
        })
    }
}

/// A deferred check on solved types, for constraints plain equality
/// cannot express (operator operand sets, polymorphic builtin shapes).
struct ShapeCheck {
    expr: ExprId,
    span: Span,
    kind: ShapeCheckKind,
}

enum ShapeCheckKind {
    BinOp(BinOp),
    UnOp(UnOp),
    Builtin { key: String, args: Vec<ExprId> },
}

/// Infers a concrete type for every reachable expression and decorates
/// the tree with it. `strategy` selects a registered solver.
pub fn infer(
    strategy: &str,
    ast: &mut Ast,
    root: &[StmtId],
    res: &Resolutions,
    funcs: &FuncRegistry,
    kinds: &KindRegistry,
) -> Result<(), TypeError> {
    if strategy != DEFAULT_STRATEGY {
        return Err(TypeError::UnknownStrategy(strategy.to_string()));
    }
    let mut solver = Solver {
        ast,
        res,
        funcs,
        kinds,
        table: InPlaceUnificationTable::new(),
        expr_vars: HashMap::new(),
        param_vars: HashMap::new(),
        invariants: Vec::new(),
        checks: Vec::new(),
        visited: Vec::new(),
    };
    solver.collect_stmts(root)?;
    solver.solve()?;
    let types = solver.extract()?;
    solver.run_shape_checks(&types)?;
    for (id, typ) in types {
        ast.expr_mut(id).typ = Some(typ);
    }
    Ok(())
}

struct Solver<'a> {
    ast: &'a Ast,
    res: &'a Resolutions,
    funcs: &'a FuncRegistry,
    kinds: &'a KindRegistry,
    table: InPlaceUnificationTable<TvKey>,
    expr_vars: HashMap<ExprId, TvKey>,
    param_vars: HashMap<(ExprId, usize), TvKey>,
    invariants: Vec<UnificationInvariant>,
    checks: Vec<ShapeCheck>,
    visited: Vec<ExprId>,
}

impl<'a> Solver<'a> {
    fn fresh(&mut self) -> Type {
        Type::Var(TypeVar(self.table.new_key(Partial(None)).index()))
    }

    fn expr_type(&mut self, id: ExprId) -> Type {
        let key = match self.expr_vars.get(&id) {
            Some(&k) => k,
            None => {
                let k = self.table.new_key(Partial(None));
                self.expr_vars.insert(id, k);
                k
            }
        };
        Type::Var(TypeVar(key.index()))
    }

    fn param_type(&mut self, slot: (ExprId, usize)) -> Type {
        let key = match self.param_vars.get(&slot) {
            Some(&k) => k,
            None => {
                let k = self.table.new_key(Partial(None));
                self.param_vars.insert(slot, k);
                k
            }
        };
        Type::Var(TypeVar(key.index()))
    }

    fn want(&mut self, expr: ExprId, expected: Type, actual: Type) {
        let span = self.ast.expr(expr).span;
        self.invariants.push(UnificationInvariant {
            expr,
            expected,
            actual,
            span,
        });
    }

    // Constraint collection.

    fn collect_stmts(&mut self, stmts: &[StmtId]) -> Result<(), TypeError> {
        for &sid in stmts {
            self.collect_stmt(sid)?;
        }
        Ok(())
    }

    fn collect_stmt(&mut self, sid: StmtId) -> Result<(), TypeError> {
        match self.ast.stmt(sid).kind.clone() {
            StmtKind::Import { .. } => Ok(()),
            // Class bodies are templates; each expansion is typed
            // independently below the include that created it.
            StmtKind::Class { .. } => Ok(()),
            StmtKind::Bind { value, .. } => {
                self.visit_expr(value)?;
                Ok(())
            }
            StmtKind::Include { args, expanded, .. } => {
                for arg in args {
                    self.visit_expr(arg)?;
                }
                self.collect_stmts(&expanded)
            }
            StmtKind::Res {
                kind,
                name,
                fields,
                edges,
            } => {
                let span = self.ast.stmt(sid).span;
                let name_t = self.visit_expr(name)?;
                self.want(name, Type::Str, name_t);

                let Some(res_kind) = self.kinds.get(&kind) else {
                    return Err(TypeError::UnknownKind { kind, span });
                };
                let res_kind = res_kind.clone();
                for field in &fields {
                    let Some(spec) = res_kind.field(&field.name) else {
                        return Err(TypeError::UnknownField {
                            kind: kind.clone(),
                            field: field.name.clone(),
                            span: field.span,
                        });
                    };
                    let value_t = self.visit_expr(field.value)?;
                    self.want(field.value, spec.typ.clone(), value_t);

                    // Ranged fields reject overflowing literals at
                    // compile time; dynamic values are re-checked by the
                    // interpreter.
                    if let Some((lo, hi)) = spec.range
                        && let ExprKind::Int(i) = self.ast.expr(field.value).kind
                        && !(lo..=hi).contains(&i)
                    {
                        return Err(TypeError::IntOutOfRange {
                            field: field.name.clone(),
                            value: i,
                            lo,
                            hi,
                            span: field.span,
                        });
                    }
                }
                for edge in &edges {
                    let t = self.visit_expr(edge.target.name)?;
                    self.want(edge.target.name, Type::Str, t);
                }
                Ok(())
            }
            StmtKind::Edge { from, to } => {
                for ep in [&from, &to] {
                    let t = self.visit_expr(ep.res.name)?;
                    self.want(ep.res.name, Type::Str, t);
                }
                Ok(())
            }
            StmtKind::If { cond, then, els } => {
                let cond_t = self.visit_expr(cond)?;
                self.want(cond, Type::Bool, cond_t);
                self.collect_stmts(&then)?;
                self.collect_stmts(&els)
            }
        }
    }

    /// Emits the structural invariant for one expression and returns its
    /// type variable. Revisits (bindings reached through several
    /// references) return the variable without re-emitting.
    fn visit_expr(&mut self, id: ExprId) -> Result<Type, TypeError> {
        if self.expr_vars.contains_key(&id) {
            return Ok(self.expr_type(id));
        }
        let this = self.expr_type(id);
        self.visited.push(id);
        let span = self.ast.expr(id).span;

        match self.ast.expr(id).kind.clone() {
            ExprKind::Bool(_) => self.want(id, Type::Bool, this.clone()),
            ExprKind::Int(_) => self.want(id, Type::Int, this.clone()),
            ExprKind::Float(_) => self.want(id, Type::Float, this.clone()),
            ExprKind::Str(_) => self.want(id, Type::Str, this.clone()),
            ExprKind::List(items) => {
                let elem = self.fresh();
                for item in items {
                    let t = self.visit_expr(item)?;
                    self.want(item, elem.clone(), t);
                }
                self.want(id, Type::List(Box::new(elem)), this.clone());
            }
            ExprKind::Map(pairs) => {
                let key = self.fresh();
                let val = self.fresh();
                for (k, v) in pairs {
                    let kt = self.visit_expr(k)?;
                    self.want(k, key.clone(), kt);
                    let vt = self.visit_expr(v)?;
                    self.want(v, val.clone(), vt);
                }
                self.want(id, Type::Map(Box::new(key), Box::new(val)), this.clone());
            }
            ExprKind::Struct(fields) => {
                let mut field_types = Vec::with_capacity(fields.len());
                for (name, value) in fields {
                    let t = self.visit_expr(value)?;
                    field_types.push((name, t));
                }
                self.want(id, Type::Struct(field_types), this.clone());
            }
            ExprKind::Func { params, body } => {
                let args: Vec<(String, Type)> = params
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (p.clone(), self.param_type((id, i))))
                    .collect();
                let out = self.visit_expr(body)?;
                self.want(id, Type::Func(args, Box::new(out)), this.clone());
            }
            ExprKind::Var { .. } => {
                if let Some(&slot) = self.res.param_vars.get(&id) {
                    let t = self.param_type(slot);
                    self.want(id, t, this.clone());
                } else if let Some(&target) = self.res.var_bindings.get(&id) {
                    let t = self.visit_expr(target)?;
                    self.want(id, t, this.clone());
                } else {
                    // The scope pass resolves every name or fails; an
                    // unresolved reference here is a bug upstream.
                    return Err(TypeError::AmbiguousType { span });
                }
            }
            ExprKind::Call { target, args } => {
                let mut arg_types = Vec::with_capacity(args.len());
                for &arg in &args {
                    arg_types.push(self.visit_expr(arg)?);
                }
                self.collect_call(id, &target, &args, arg_types, this.clone(), span)?;
            }
            ExprKind::BinOp { op, lhs, rhs } => {
                let lt = self.visit_expr(lhs)?;
                let rt = self.visit_expr(rhs)?;
                match op {
                    BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                        self.want(rhs, lt.clone(), rt);
                        self.want(id, lt, this.clone());
                        self.checks.push(ShapeCheck {
                            expr: id,
                            span,
                            kind: ShapeCheckKind::BinOp(op),
                        });
                    }
                    BinOp::Eq | BinOp::Ne => {
                        self.want(rhs, lt, rt);
                        self.want(id, Type::Bool, this.clone());
                    }
                    BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                        self.want(rhs, lt, rt);
                        self.want(id, Type::Bool, this.clone());
                        self.checks.push(ShapeCheck {
                            expr: lhs,
                            span,
                            kind: ShapeCheckKind::BinOp(op),
                        });
                    }
                    BinOp::And | BinOp::Or => {
                        self.want(lhs, Type::Bool, lt);
                        self.want(rhs, Type::Bool, rt);
                        self.want(id, Type::Bool, this.clone());
                    }
                }
            }
            ExprKind::UnOp { op, operand } => {
                let ot = self.visit_expr(operand)?;
                match op {
                    UnOp::Not => {
                        self.want(operand, Type::Bool, ot);
                        self.want(id, Type::Bool, this.clone());
                    }
                    UnOp::Neg => {
                        self.want(id, ot, this.clone());
                        self.checks.push(ShapeCheck {
                            expr: id,
                            span,
                            kind: ShapeCheckKind::UnOp(op),
                        });
                    }
                }
            }
        }
        Ok(this)
    }

    fn collect_call(
        &mut self,
        id: ExprId,
        target: &str,
        args: &[ExprId],
        arg_types: Vec<Type>,
        this: Type,
        span: Span,
    ) -> Result<(), TypeError> {
        match self.res.call_targets.get(&id) {
            Some(CallTarget::Lambda(func)) => {
                let func = *func;
                // Type the literal (it may live in a not-yet-visited
                // binding) and tie arguments to its parameters.
                self.visit_expr(func)?;
                let ExprKind::Func { params, body } = self.ast.expr(func).kind.clone() else {
                    return Err(TypeError::AmbiguousType { span });
                };
                if params.len() != args.len() {
                    return Err(TypeError::Mismatch {
                        expected: format!("{} arguments", params.len()),
                        actual: format!("{} arguments", args.len()),
                        span,
                    });
                }
                for (i, (&arg, at)) in args.iter().zip(arg_types).enumerate() {
                    let pt = self.param_type((func, i));
                    self.want(arg, pt, at);
                }
                let out = self.expr_type(body);
                self.want(id, out, this);
                Ok(())
            }
            Some(CallTarget::Builtin(key)) => {
                let key = key.clone();
                let sig = match self.funcs.lookup(&key) {
                    Some(FuncEntry::Pure(f)) => {
                        let f = f.clone();
                        let mut minted = Vec::new();
                        let sig = {
                            // Polymorphic slots become fresh variables,
                            // shaped by this call site only.
                            let mut fresh = || {
                                let key = self.table.new_key(Partial(None));
                                let t = Type::Var(TypeVar(key.index()));
                                minted.push(t.clone());
                                t
                            };
                            f.signature(args.len(), &mut fresh)
                        };
                        if !minted.is_empty() {
                            self.checks.push(ShapeCheck {
                                expr: id,
                                span,
                                kind: ShapeCheckKind::Builtin {
                                    key: key.clone(),
                                    args: args.to_vec(),
                                },
                            });
                        }
                        sig
                    }
                    Some(FuncEntry::Fact(f)) => f.signature(args.len()),
                    None => None,
                };
                let Some(Type::Func(params, out)) = sig else {
                    return Err(TypeError::Mismatch {
                        expected: format!("a valid call of `{key}`"),
                        actual: format!("{} arguments", args.len()),
                        span,
                    });
                };
                for ((&arg, at), (_, pt)) in args.iter().zip(arg_types).zip(params) {
                    self.want(arg, pt, at);
                }
                self.want(id, *out, this);
                Ok(())
            }
            None => Err(TypeError::AmbiguousType { span }),
        }
    }

    // Solving.

    fn solve(&mut self) -> Result<(), TypeError> {
        let invariants = std::mem::take(&mut self.invariants);
        for inv in &invariants {
            self.unify(&inv.expected, &inv.actual, inv.span)?;
        }
        self.invariants = invariants;
        Ok(())
    }

    fn key_of(&self, v: TypeVar) -> TvKey {
        TvKey(v.0)
    }

    fn mismatch(&mut self, expected: &Type, actual: &Type, span: Span) -> TypeError {
        TypeError::Mismatch {
            expected: self.describe(expected),
            actual: self.describe(actual),
            span,
        }
    }

    /// Renders a type for diagnostics with known variables substituted.
    fn describe(&mut self, t: &Type) -> String {
        match t {
            Type::Var(v) => match self.table.probe_value(self.key_of(*v)).0 {
                Some(known) => self.describe(&known),
                None => t.to_string(),
            },
            other => other.to_string(),
        }
    }

    fn unify(&mut self, a: &Type, b: &Type, span: Span) -> Result<(), TypeError> {
        match (a, b) {
            (Type::Var(va), Type::Var(vb)) => {
                let ka = self.key_of(*va);
                let kb = self.key_of(*vb);
                if self.table.unioned(ka, kb) {
                    return Ok(());
                }
                let known_a = self.table.probe_value(ka).0;
                let known_b = self.table.probe_value(kb).0;
                self.table
                    .unify_var_var(ka, kb)
                    .expect("partial merging is total");
                if let (Some(ta), Some(tb)) = (known_a, known_b) {
                    self.unify(&ta, &tb, span)?;
                }
                Ok(())
            }
            (Type::Var(v), concrete) | (concrete, Type::Var(v)) => {
                let k = self.key_of(*v);
                match self.table.probe_value(k).0 {
                    Some(known) => self.unify(&known, concrete, span),
                    None => {
                        self.table
                            .unify_var_value(k, Partial(Some(concrete.clone())))
                            .expect("partial merging is total");
                        Ok(())
                    }
                }
            }
            (Type::Variant, _) | (_, Type::Variant) => Ok(()),
            (Type::Bool, Type::Bool)
            | (Type::Str, Type::Str)
            | (Type::Int, Type::Int)
            | (Type::Float, Type::Float) => Ok(()),
            (Type::List(ea), Type::List(eb)) => self.unify(ea, eb, span),
            (Type::Map(ka, va), Type::Map(kb, vb)) => {
                self.unify(ka, kb, span)?;
                self.unify(va, vb, span)
            }
            (Type::Struct(fa), Type::Struct(fb)) => {
                if fa.len() != fb.len() || fa.iter().zip(fb).any(|((na, _), (nb, _))| na != nb) {
                    return Err(self.mismatch(a, b, span));
                }
                for ((_, ta), (_, tb)) in fa.iter().zip(fb) {
                    self.unify(ta, tb, span)?;
                }
                Ok(())
            }
            (Type::Func(aa, oa), Type::Func(ab, ob)) => {
                if aa.len() != ab.len() {
                    return Err(self.mismatch(a, b, span));
                }
                for ((_, ta), (_, tb)) in aa.iter().zip(ab) {
                    self.unify(ta, tb, span)?;
                }
                self.unify(oa, ob, span)
            }
            (a, b) => Err(self.mismatch(a, b, span)),
        }
    }

    // Extraction.

    fn extract(&mut self) -> Result<Vec<(ExprId, Type)>, TypeError> {
        let visited = self.visited.clone();
        let mut out = Vec::with_capacity(visited.len());
        for id in visited {
            let span = self.ast.expr(id).span;
            let t = self.expr_type(id);
            let resolved = self.resolve(&t, &mut Vec::new(), span)?;
            if resolved.has_var() {
                return Err(TypeError::AmbiguousType { span });
            }
            out.push((id, resolved));
        }
        Ok(out)
    }

    /// Substitutes solved variables, guarding against reference cycles
    /// (`$x = [$x]` style), which read as ambiguous.
    fn resolve(
        &mut self,
        t: &Type,
        in_progress: &mut Vec<TvKey>,
        span: Span,
    ) -> Result<Type, TypeError> {
        Ok(match t {
            Type::Var(v) => {
                let root = self.table.find(self.key_of(*v));
                if in_progress.contains(&root) {
                    return Err(TypeError::AmbiguousType { span });
                }
                match self.table.probe_value(root).0 {
                    Some(known) => {
                        in_progress.push(root);
                        let resolved = self.resolve(&known, in_progress, span)?;
                        in_progress.pop();
                        resolved
                    }
                    None => Type::Var(*v),
                }
            }
            Type::List(e) => Type::List(Box::new(self.resolve(e, in_progress, span)?)),
            Type::Map(k, v) => Type::Map(
                Box::new(self.resolve(k, in_progress, span)?),
                Box::new(self.resolve(v, in_progress, span)?),
            ),
            Type::Struct(fields) => Type::Struct(
                fields
                    .iter()
                    .map(|(n, t)| Ok((n.clone(), self.resolve(t, in_progress, span)?)))
                    .collect::<Result<_, TypeError>>()?,
            ),
            Type::Func(args, out) => Type::Func(
                args.iter()
                    .map(|(n, t)| Ok((n.clone(), self.resolve(t, in_progress, span)?)))
                    .collect::<Result<_, TypeError>>()?,
                Box::new(self.resolve(out, in_progress, span)?),
            ),
            concrete => concrete.clone(),
        })
    }

    fn run_shape_checks(&mut self, types: &[(ExprId, Type)]) -> Result<(), TypeError> {
        let by_id: HashMap<ExprId, &Type> = types.iter().map(|(id, t)| (*id, t)).collect();
        let checks = std::mem::take(&mut self.checks);
        for check in &checks {
            let typ = by_id
                .get(&check.expr)
                .copied()
                .cloned()
                .unwrap_or(Type::Variant);
            match &check.kind {
                ShapeCheckKind::BinOp(op) => {
                    let ok = match op {
                        BinOp::Add => matches!(typ, Type::Int | Type::Float | Type::Str),
                        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                            matches!(typ, Type::Int | Type::Float)
                        }
                        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                            matches!(typ, Type::Int | Type::Float | Type::Str)
                        }
                        _ => true,
                    };
                    if !ok {
                        return Err(TypeError::BadOperand {
                            op: op.symbol().to_string(),
                            typ: typ.to_string(),
                            span: check.span,
                        });
                    }
                }
                ShapeCheckKind::UnOp(op) => {
                    if !matches!(typ, Type::Int | Type::Float) {
                        return Err(TypeError::BadOperand {
                            op: match op {
                                UnOp::Not => "!",
                                UnOp::Neg => "-",
                            }
                            .to_string(),
                            typ: typ.to_string(),
                            span: check.span,
                        });
                    }
                }
                ShapeCheckKind::Builtin { key, args } => {
                    let Some(FuncEntry::Pure(f)) = self.funcs.lookup(key) else {
                        continue;
                    };
                    let arg_types: Vec<Type> = args
                        .iter()
                        .map(|a| by_id.get(a).copied().cloned().unwrap_or(Type::Variant))
                        .collect();
                    f.check_arg_types(&arg_types)
                        .map_err(|reason| TypeError::BadOperand {
                            op: key.clone(),
                            typ: reason,
                            span: check.span,
                        })?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use crate::funcs::FuncRegistry;
    use crate::resources;
    use crate::scope::ScopeBuilder;
    use crate::world::LocalWorld;
    use crate::{interpolate, parse};
    use camino::Utf8Path;
    use std::sync::Arc;

    fn compile(src: &str) -> Result<Ast, crate::error::MclError> {
        let mut ast = Ast::new();
        let stmts = parse::parse(src, &mut ast)?;
        interpolate::interpolate(&mut ast, &stmts)?;
        ast.root = stmts;
        let registry = FuncRegistry::with_defaults();
        let root = ast.root.clone();
        let builder = ScopeBuilder::new(
            &mut ast,
            Arc::new(MemFs::new()),
            Arc::new(LocalWorld::with_hostname("h1")),
            &registry,
            None,
            None,
        );
        let out = builder.run(&root, Utf8Path::new("/proj"))?;
        infer(
            DEFAULT_STRATEGY,
            &mut ast,
            &root,
            &out.resolutions,
            &registry,
            resources::registry(),
        )?;
        Ok(ast)
    }

    fn type_of_bind(ast: &Ast, name: &str) -> Type {
        for sid in &ast.root {
            if let StmtKind::Bind { name: n, value } = &ast.stmt(*sid).kind
                && n == name
            {
                return ast.expr(*value).typ.clone().expect("typed");
            }
        }
        panic!("no bind named {name}");
    }

    #[test]
    fn literals_get_concrete_types() {
        let ast = compile("$a = 1\n$b = \"s\"\n$c = true\n$d = 1.5").unwrap();
        assert_eq!(type_of_bind(&ast, "a"), Type::Int);
        assert_eq!(type_of_bind(&ast, "b"), Type::Str);
        assert_eq!(type_of_bind(&ast, "c"), Type::Bool);
        assert_eq!(type_of_bind(&ast, "d"), Type::Float);
    }

    #[test]
    fn list_elements_unify() {
        let ast = compile("$l = [1, 2, 3]").unwrap();
        assert_eq!(type_of_bind(&ast, "l"), Type::List(Box::new(Type::Int)));
    }

    #[test]
    fn heterogeneous_list_fails() {
        let err = compile("$l = [1, \"two\"]").unwrap_err();
        assert!(matches!(
            err,
            crate::error::MclError::Type(TypeError::Mismatch { .. })
        ));
    }

    #[test]
    fn empty_list_alone_is_ambiguous() {
        let err = compile("$l = []").unwrap_err();
        assert!(matches!(
            err,
            crate::error::MclError::Type(TypeError::AmbiguousType { .. })
        ));
    }

    #[test]
    fn empty_list_constrained_through_use() {
        // The element type flows in from the sibling branch of the
        // binary operation.
        let ast = compile("$l = []\n$m = [1]\n$same = $l == $m").unwrap();
        assert_eq!(type_of_bind(&ast, "l"), Type::List(Box::new(Type::Int)));
    }

    #[test]
    fn var_types_flow_through_bindings() {
        let ast = compile("$a = $b\n$b = 42").unwrap();
        assert_eq!(type_of_bind(&ast, "a"), Type::Int);
    }

    #[test]
    fn operators_type_check() {
        let ast = compile("$s = \"a\" + \"b\"\n$n = 1 + 2\n$c = 1 < 2").unwrap();
        assert_eq!(type_of_bind(&ast, "s"), Type::Str);
        assert_eq!(type_of_bind(&ast, "n"), Type::Int);
        assert_eq!(type_of_bind(&ast, "c"), Type::Bool);
    }

    #[test]
    fn string_minus_fails_shape_check() {
        let err = compile("$x = \"a\" - \"b\"").unwrap_err();
        assert!(matches!(
            err,
            crate::error::MclError::Type(TypeError::BadOperand { .. })
        ));
    }

    #[test]
    fn mixed_arithmetic_fails() {
        let err = compile("$x = 1 + 1.5").unwrap_err();
        assert!(matches!(
            err,
            crate::error::MclError::Type(TypeError::Mismatch { .. })
        ));
    }

    #[test]
    fn printf_call_site_types() {
        let ast = compile("$s = fmt.printf(\"%s/%d\", \"a\", 1)").unwrap();
        assert_eq!(type_of_bind(&ast, "s"), Type::Str);
    }

    #[test]
    fn printf_format_must_be_string() {
        let err = compile("$s = fmt.printf(42)").unwrap_err();
        assert!(matches!(err, crate::error::MclError::Type(_)));
    }

    #[test]
    fn lambda_infers_from_call_site() {
        let ast = compile("$double = func($x) { $x + $x }\n$y = double(2)").unwrap();
        assert_eq!(type_of_bind(&ast, "y"), Type::Int);
        assert_eq!(
            type_of_bind(&ast, "double"),
            Type::Func(vec![("x".to_string(), Type::Int)], Box::new(Type::Int))
        );
    }

    #[test]
    fn len_polymorphic_over_shapes() {
        let ast = compile("$a = len(\"abc\")\n$b = len([1, 2])").unwrap();
        assert_eq!(type_of_bind(&ast, "a"), Type::Int);
        assert_eq!(type_of_bind(&ast, "b"), Type::Int);
    }

    #[test]
    fn len_of_int_fails_shape_check() {
        let err = compile("$a = len(42)").unwrap_err();
        assert!(matches!(
            err,
            crate::error::MclError::Type(TypeError::BadOperand { .. })
        ));
    }

    #[test]
    fn resource_fields_check_against_kind() {
        assert!(compile("test \"t1\" { stringptr => \"ok\", }").is_ok());
        let err = compile("test \"t1\" { stringptr => 42, }").unwrap_err();
        assert!(matches!(
            err,
            crate::error::MclError::Type(TypeError::Mismatch { .. })
        ));
    }

    #[test]
    fn int8_overflow_is_a_type_error() {
        let err = compile("test \"t1\" { int8 => 88888888, }").unwrap_err();
        assert!(matches!(
            err,
            crate::error::MclError::Type(TypeError::IntOutOfRange { .. })
        ));
        assert!(compile("test \"t1\" { int8 => 88, }").is_ok());
    }

    #[test]
    fn unknown_kind_and_field_fail() {
        assert!(matches!(
            compile("frob \"x\" {}").unwrap_err(),
            crate::error::MclError::Type(TypeError::UnknownKind { .. })
        ));
        assert!(matches!(
            compile("test \"x\" { nosuch => 1, }").unwrap_err(),
            crate::error::MclError::Type(TypeError::UnknownField { .. })
        ));
    }

    #[test]
    fn if_condition_must_be_bool() {
        let err = compile("if 1 { noop \"n\" {} }").unwrap_err();
        assert!(matches!(
            err,
            crate::error::MclError::Type(TypeError::Mismatch { .. })
        ));
    }

    #[test]
    fn include_expansions_type_independently() {
        // The copies get fresh ids, so each expansion carries its own
        // argument types.
        let src = r#"
            class c1($a, $b) { test $a { stringptr => $b, } }
            include c1("t1", "hello")
            include c1("t2", "world")
        "#;
        assert!(compile(src).is_ok());
    }

    #[test]
    fn self_referential_binding_is_ambiguous() {
        let err = compile("$x = [$x]").unwrap_err();
        assert!(matches!(
            err,
            crate::error::MclError::Type(TypeError::AmbiguousType { .. })
        ));
    }

    #[test]
    fn unknown_strategy_rejected() {
        let mut ast = Ast::new();
        let err = infer(
            "simulated-annealing",
            &mut ast,
            &[],
            &Resolutions::default(),
            &FuncRegistry::with_defaults(),
            resources::registry(),
        )
        .unwrap_err();
        assert!(matches!(err, TypeError::UnknownStrategy(_)));
    }

    #[test]
    fn interpolation_forces_string_parts() {
        assert!(compile("$x = 1\n$y = \"n=${$x}\"").is_err());
        assert!(compile("$x = \"one\"\n$y = \"n=${$x}\"").is_ok());
    }

    #[test]
    fn no_residual_vars_after_success() {
        let ast = compile("$a = [1]\n$b = {\"k\" => 1.5}\n$c = $a").unwrap();
        for expr in ast.exprs() {
            if let Some(t) = &expr.typ {
                assert!(!t.has_var(), "residual var in {t}");
            }
        }
    }
}
