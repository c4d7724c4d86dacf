//! The abstract syntax tree.
//!
//! All nodes live in two flat arenas owned by [`Ast`] and reference each
//! other through [`ExprId`] / [`StmtId`] indices. Passes annotate nodes in
//! place: the scope builder fills resolution tables keyed by id, the type
//! unifier writes the final [`Type`](crate::types::Type) into each
//! expression's `typ` slot. Back-references never hold pointers, only ids.

use std::fmt;
use std::fmt::Write;

use crate::types::Type;

/// Index of an expression in the [`Ast`] arena.
pub type ExprId = u32;
/// Index of a statement in the [`Ast`] arena.
pub type StmtId = u32;

/// A source position, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
}

/// A half-open source range used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: Pos,
    pub end: Pos,
}

impl Span {
    pub fn new(start: Pos, end: Pos) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start,
            end: other.end,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.start.line, self.start.col, self.end.line, self.end.col
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub id: ExprId,
    pub span: Span,
    pub kind: ExprKind,
    /// Concrete type, written by the unifier. `None` until then.
    pub typ: Option<Type>,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Bool(bool),
    Int(i64),
    Float(f64),
    /// String content with escapes resolved. `${…}` interpolation markers
    /// survive until the interpolation pass rewrites them away.
    Str(String),
    List(Vec<ExprId>),
    Map(Vec<(ExprId, ExprId)>),
    Struct(Vec<(String, ExprId)>),
    Func {
        params: Vec<String>,
        body: ExprId,
    },
    /// A `$name` reference. May be qualified (`alias.name`).
    Var {
        name: String,
    },
    /// A function application, `name(args…)` or `alias.name(args…)`.
    Call {
        target: String,
        args: Vec<ExprId>,
    },
    BinOp {
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    UnOp {
        op: UnOp,
        operand: ExprId,
    },
}

/// A `Kind["name"]` reference inside an edge statement or meta field.
#[derive(Debug, Clone)]
pub struct ResRef {
    pub kind: String,
    pub name: ExprId,
    pub span: Span,
}

/// One endpoint of an edge statement, optionally carrying a `.field`
/// suffix for send/recv plumbing.
#[derive(Debug, Clone)]
pub struct EdgeEndpoint {
    pub res: ResRef,
    pub field: Option<String>,
}

/// A `field => value` entry inside a resource body.
#[derive(Debug, Clone)]
pub struct ResField {
    pub name: String,
    pub value: ExprId,
    pub span: Span,
}

/// The relation a meta-edge field declares between its resource and the
/// referenced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaEdgeKind {
    /// This resource runs before the target.
    Before,
    /// This resource runs after the target.
    Depend,
    /// `Before` plus a notification on change.
    Notify,
    /// `Depend` plus a notification on change.
    Listen,
}

impl MetaEdgeKind {
    pub fn from_field(name: &str) -> Option<Self> {
        match name {
            "Before" => Some(Self::Before),
            "Depend" => Some(Self::Depend),
            "Notify" => Some(Self::Notify),
            "Listen" => Some(Self::Listen),
            _ => None,
        }
    }

    pub fn field_name(self) -> &'static str {
        match self {
            Self::Before => "Before",
            Self::Depend => "Depend",
            Self::Notify => "Notify",
            Self::Listen => "Listen",
        }
    }

    /// Whether the edge points from this resource to the target.
    pub fn outgoing(self) -> bool {
        matches!(self, Self::Before | Self::Notify)
    }

    pub fn notify(self) -> bool {
        matches!(self, Self::Notify | Self::Listen)
    }
}

#[derive(Debug, Clone)]
pub struct MetaEdge {
    pub kind: MetaEdgeKind,
    pub target: ResRef,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub id: StmtId,
    pub span: Span,
    pub kind: StmtKind,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Import {
        path: String,
        /// `Some("*")` flat-merges the module into the current namespace.
        alias: Option<String>,
    },
    Bind {
        name: String,
        value: ExprId,
    },
    Class {
        name: String,
        params: Vec<String>,
        body: Vec<StmtId>,
    },
    Include {
        name: String,
        args: Vec<ExprId>,
        /// Body copy produced by the scope builder, empty until then.
        expanded: Vec<StmtId>,
    },
    Res {
        kind: String,
        name: ExprId,
        fields: Vec<ResField>,
        edges: Vec<MetaEdge>,
    },
    Edge {
        from: EdgeEndpoint,
        to: EdgeEndpoint,
    },
    If {
        cond: ExprId,
        then: Vec<StmtId>,
        els: Vec<StmtId>,
    },
}

/// The arena holding every statement and expression of a compile,
/// including all imported modules and all include expansions.
#[derive(Debug, Default)]
pub struct Ast {
    exprs: Vec<Expr>,
    stmts: Vec<Stmt>,
    /// Top-level statements of the entry module.
    pub root: Vec<StmtId>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_expr(&mut self, span: Span, kind: ExprKind) -> ExprId {
        let id = self.exprs.len() as ExprId;
        self.exprs.push(Expr {
            id,
            span,
            kind,
            typ: None,
        });
        id
    }

    pub fn add_stmt(&mut self, span: Span, kind: StmtKind) -> StmtId {
        let id = self.stmts.len() as StmtId;
        self.stmts.push(Stmt { id, span, kind });
        id
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id as usize]
    }

    pub fn expr_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.exprs[id as usize]
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id as usize]
    }

    pub fn stmt_mut(&mut self, id: StmtId) -> &mut Stmt {
        &mut self.stmts[id as usize]
    }

    pub fn exprs(&self) -> impl Iterator<Item = &Expr> {
        self.exprs.iter()
    }

    /// Deep-copies an expression subtree, minting fresh ids.
    pub fn copy_expr(&mut self, id: ExprId) -> ExprId {
        let Expr { span, kind, .. } = self.exprs[id as usize].clone();
        let kind = match kind {
            ExprKind::List(items) => {
                ExprKind::List(items.into_iter().map(|e| self.copy_expr(e)).collect())
            }
            ExprKind::Map(pairs) => ExprKind::Map(
                pairs
                    .into_iter()
                    .map(|(k, v)| (self.copy_expr(k), self.copy_expr(v)))
                    .collect(),
            ),
            ExprKind::Struct(fields) => ExprKind::Struct(
                fields
                    .into_iter()
                    .map(|(n, e)| (n, self.copy_expr(e)))
                    .collect(),
            ),
            ExprKind::Func { params, body } => ExprKind::Func {
                params,
                body: self.copy_expr(body),
            },
            ExprKind::Call { target, args } => ExprKind::Call {
                target,
                args: args.into_iter().map(|e| self.copy_expr(e)).collect(),
            },
            ExprKind::BinOp { op, lhs, rhs } => ExprKind::BinOp {
                op,
                lhs: self.copy_expr(lhs),
                rhs: self.copy_expr(rhs),
            },
            ExprKind::UnOp { op, operand } => ExprKind::UnOp {
                op,
                operand: self.copy_expr(operand),
            },
            leaf @ (ExprKind::Bool(_)
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_)
            | ExprKind::Var { .. }) => leaf,
        };
        self.add_expr(span, kind)
    }

    fn copy_res_ref(&mut self, r: &ResRef) -> ResRef {
        ResRef {
            kind: r.kind.clone(),
            name: self.copy_expr(r.name),
            span: r.span,
        }
    }

    /// Deep-copies a statement subtree, minting fresh ids. Used by the
    /// scope builder to expand `include` bodies so each expansion types
    /// and evaluates independently.
    pub fn copy_stmt(&mut self, id: StmtId) -> StmtId {
        let Stmt { span, kind, .. } = self.stmts[id as usize].clone();
        let kind = match kind {
            StmtKind::Import { path, alias } => StmtKind::Import { path, alias },
            StmtKind::Bind { name, value } => StmtKind::Bind {
                name,
                value: self.copy_expr(value),
            },
            StmtKind::Class { name, params, body } => StmtKind::Class {
                name,
                params,
                body: body.into_iter().map(|s| self.copy_stmt(s)).collect(),
            },
            StmtKind::Include { name, args, .. } => StmtKind::Include {
                name,
                args: args.into_iter().map(|e| self.copy_expr(e)).collect(),
                expanded: Vec::new(),
            },
            StmtKind::Res {
                kind,
                name,
                fields,
                edges,
            } => {
                let fields = fields
                    .into_iter()
                    .map(|f| ResField {
                        name: f.name,
                        value: self.copy_expr(f.value),
                        span: f.span,
                    })
                    .collect();
                let edges = edges
                    .iter()
                    .map(|e| MetaEdge {
                        kind: e.kind,
                        target: self.copy_res_ref(&e.target),
                        span: e.span,
                    })
                    .collect();
                StmtKind::Res {
                    kind,
                    name: self.copy_expr(name),
                    fields,
                    edges,
                }
            }
            StmtKind::Edge { from, to } => StmtKind::Edge {
                from: EdgeEndpoint {
                    res: self.copy_res_ref(&from.res),
                    field: from.field.clone(),
                },
                to: EdgeEndpoint {
                    res: self.copy_res_ref(&to.res),
                    field: to.field.clone(),
                },
            },
            StmtKind::If { cond, then, els } => StmtKind::If {
                cond: self.copy_expr(cond),
                then: then.into_iter().map(|s| self.copy_stmt(s)).collect(),
                els: els.into_iter().map(|s| self.copy_stmt(s)).collect(),
            },
        };
        self.add_stmt(span, kind)
    }
}

/// Structural equality of two statement lists, ignoring ids, spans and
/// type annotations. This is the equivalence the parse → print → parse
/// round-trip is measured under.
pub fn stmts_equivalent(a: &Ast, a_stmts: &[StmtId], b: &Ast, b_stmts: &[StmtId]) -> bool {
    a_stmts.len() == b_stmts.len()
        && a_stmts
            .iter()
            .zip(b_stmts)
            .all(|(&x, &y)| stmt_equivalent(a, x, b, y))
}

fn stmt_equivalent(a: &Ast, x: StmtId, b: &Ast, y: StmtId) -> bool {
    use StmtKind::*;
    match (&a.stmt(x).kind, &b.stmt(y).kind) {
        (
            Import {
                path: p1,
                alias: a1,
            },
            Import {
                path: p2,
                alias: a2,
            },
        ) => p1 == p2 && a1 == a2,
        (
            Bind {
                name: n1,
                value: v1,
            },
            Bind {
                name: n2,
                value: v2,
            },
        ) => n1 == n2 && expr_equivalent(a, *v1, b, *v2),
        (
            Class {
                name: n1,
                params: p1,
                body: b1,
            },
            Class {
                name: n2,
                params: p2,
                body: b2,
            },
        ) => n1 == n2 && p1 == p2 && stmts_equivalent(a, b1, b, b2),
        (
            Include {
                name: n1, args: a1, ..
            },
            Include {
                name: n2, args: a2, ..
            },
        ) => {
            n1 == n2
                && a1.len() == a2.len()
                && a1
                    .iter()
                    .zip(a2)
                    .all(|(&x, &y)| expr_equivalent(a, x, b, y))
        }
        (
            Res {
                kind: k1,
                name: n1,
                fields: f1,
                edges: e1,
            },
            Res {
                kind: k2,
                name: n2,
                fields: f2,
                edges: e2,
            },
        ) => {
            k1 == k2
                && expr_equivalent(a, *n1, b, *n2)
                && f1.len() == f2.len()
                && f1
                    .iter()
                    .zip(f2)
                    .all(|(x, y)| x.name == y.name && expr_equivalent(a, x.value, b, y.value))
                && e1.len() == e2.len()
                && e1.iter().zip(e2).all(|(x, y)| {
                    x.kind == y.kind
                        && x.target.kind == y.target.kind
                        && expr_equivalent(a, x.target.name, b, y.target.name)
                })
        }
        (Edge { from: f1, to: t1 }, Edge { from: f2, to: t2 }) => {
            endpoint_equivalent(a, f1, b, f2) && endpoint_equivalent(a, t1, b, t2)
        }
        (
            If {
                cond: c1,
                then: t1,
                els: e1,
            },
            If {
                cond: c2,
                then: t2,
                els: e2,
            },
        ) => {
            expr_equivalent(a, *c1, b, *c2)
                && stmts_equivalent(a, t1, b, t2)
                && stmts_equivalent(a, e1, b, e2)
        }
        _ => false,
    }
}

fn endpoint_equivalent(a: &Ast, x: &EdgeEndpoint, b: &Ast, y: &EdgeEndpoint) -> bool {
    x.res.kind == y.res.kind && x.field == y.field && expr_equivalent(a, x.res.name, b, y.res.name)
}

fn expr_equivalent(a: &Ast, x: ExprId, b: &Ast, y: ExprId) -> bool {
    use ExprKind::*;
    match (&a.expr(x).kind, &b.expr(y).kind) {
        (Bool(v1), Bool(v2)) => v1 == v2,
        (Int(v1), Int(v2)) => v1 == v2,
        (Float(v1), Float(v2)) => v1 == v2,
        (Str(v1), Str(v2)) => v1 == v2,
        (List(l1), List(l2)) => {
            l1.len() == l2.len()
                && l1
                    .iter()
                    .zip(l2)
                    .all(|(&x, &y)| expr_equivalent(a, x, b, y))
        }
        (Map(m1), Map(m2)) => {
            m1.len() == m2.len()
                && m1.iter().zip(m2).all(|((k1, v1), (k2, v2))| {
                    expr_equivalent(a, *k1, b, *k2) && expr_equivalent(a, *v1, b, *v2)
                })
        }
        (Struct(f1), Struct(f2)) => {
            f1.len() == f2.len()
                && f1
                    .iter()
                    .zip(f2)
                    .all(|((n1, e1), (n2, e2))| n1 == n2 && expr_equivalent(a, *e1, b, *e2))
        }
        (
            Func {
                params: p1,
                body: b1,
            },
            Func {
                params: p2,
                body: b2,
            },
        ) => p1 == p2 && expr_equivalent(a, *b1, b, *b2),
        (Var { name: n1 }, Var { name: n2 }) => n1 == n2,
        (
            Call {
                target: t1,
                args: a1,
            },
            Call {
                target: t2,
                args: a2,
            },
        ) => {
            t1 == t2
                && a1.len() == a2.len()
                && a1
                    .iter()
                    .zip(a2)
                    .all(|(&x, &y)| expr_equivalent(a, x, b, y))
        }
        (
            BinOp {
                op: o1,
                lhs: l1,
                rhs: r1,
            },
            BinOp {
                op: o2,
                lhs: l2,
                rhs: r2,
            },
        ) => o1 == o2 && expr_equivalent(a, *l1, b, *l2) && expr_equivalent(a, *r1, b, *r2),
        (
            UnOp {
                op: o1,
                operand: e1,
            },
            UnOp {
                op: o2,
                operand: e2,
            },
        ) => o1 == o2 && expr_equivalent(a, *e1, b, *e2),
        _ => false,
    }
}

/// Pretty-prints a statement list back to mcl source.
pub fn print_stmts(ast: &Ast, stmts: &[StmtId]) -> String {
    let mut out = String::new();
    for &id in stmts {
        print_stmt(ast, id, 0, &mut out);
    }
    out
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
}

fn print_stmt(ast: &Ast, id: StmtId, depth: usize, out: &mut String) {
    indent(out, depth);
    match &ast.stmt(id).kind {
        StmtKind::Import { path, alias } => {
            let _ = write!(out, "import {}", quote(path));
            if let Some(alias) = alias {
                let _ = write!(out, " as {alias}");
            }
            out.push('\n');
        }
        StmtKind::Bind { name, value } => {
            let _ = write!(out, "${name} = ");
            print_expr(ast, *value, out);
            out.push('\n');
        }
        StmtKind::Class { name, params, body } => {
            let _ = write!(out, "class {name}");
            if !params.is_empty() {
                let params: Vec<_> = params.iter().map(|p| format!("${p}")).collect();
                let _ = write!(out, "({})", params.join(", "));
            }
            out.push_str(" {\n");
            for &s in body {
                print_stmt(ast, s, depth + 1, out);
            }
            indent(out, depth);
            out.push_str("}\n");
        }
        StmtKind::Include { name, args, .. } => {
            let _ = write!(out, "include {name}(");
            for (i, &arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_expr(ast, arg, out);
            }
            out.push_str(")\n");
        }
        StmtKind::Res {
            kind,
            name,
            fields,
            edges,
        } => {
            let _ = write!(out, "{kind} ");
            print_expr(ast, *name, out);
            out.push_str(" {\n");
            for f in fields {
                indent(out, depth + 1);
                let _ = write!(out, "{} => ", f.name);
                print_expr(ast, f.value, out);
                out.push_str(",\n");
            }
            for e in edges {
                indent(out, depth + 1);
                let _ = write!(out, "{} => {}[", e.kind.field_name(), e.target.kind);
                print_expr(ast, e.target.name, out);
                out.push_str("],\n");
            }
            indent(out, depth);
            out.push_str("}\n");
        }
        StmtKind::Edge { from, to } => {
            print_endpoint(ast, from, out);
            out.push_str(" -> ");
            print_endpoint(ast, to, out);
            out.push('\n');
        }
        StmtKind::If { cond, then, els } => {
            out.push_str("if ");
            print_expr(ast, *cond, out);
            out.push_str(" {\n");
            for &s in then {
                print_stmt(ast, s, depth + 1, out);
            }
            indent(out, depth);
            out.push('}');
            if !els.is_empty() {
                out.push_str(" else {\n");
                for &s in els {
                    print_stmt(ast, s, depth + 1, out);
                }
                indent(out, depth);
                out.push('}');
            }
            out.push('\n');
        }
    }
}

fn print_endpoint(ast: &Ast, ep: &EdgeEndpoint, out: &mut String) {
    let _ = write!(out, "{}[", ep.res.kind);
    print_expr(ast, ep.res.name, out);
    out.push(']');
    if let Some(field) = &ep.field {
        let _ = write!(out, ".{field}");
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn print_expr(ast: &Ast, id: ExprId, out: &mut String) {
    match &ast.expr(id).kind {
        ExprKind::Bool(v) => {
            let _ = write!(out, "{v}");
        }
        ExprKind::Int(v) => {
            let _ = write!(out, "{v}");
        }
        ExprKind::Float(v) => {
            let _ = write!(out, "{v:?}");
        }
        ExprKind::Str(v) => out.push_str(&quote(v)),
        ExprKind::List(items) => {
            out.push('[');
            for (i, &e) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_expr(ast, e, out);
            }
            out.push(']');
        }
        ExprKind::Map(pairs) => {
            out.push('{');
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_expr(ast, *k, out);
                out.push_str(" => ");
                print_expr(ast, *v, out);
            }
            out.push('}');
        }
        ExprKind::Struct(fields) => {
            out.push_str("struct{");
            for (i, (n, e)) in fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{n} => ");
                print_expr(ast, *e, out);
            }
            out.push('}');
        }
        ExprKind::Func { params, body } => {
            let params: Vec<_> = params.iter().map(|p| format!("${p}")).collect();
            let _ = write!(out, "func({})", params.join(", "));
            out.push_str(" { ");
            print_expr(ast, *body, out);
            out.push_str(" }");
        }
        ExprKind::Var { name } => {
            let _ = write!(out, "${name}");
        }
        ExprKind::Call { target, args } => {
            let _ = write!(out, "{target}(");
            for (i, &arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_expr(ast, arg, out);
            }
            out.push(')');
        }
        ExprKind::BinOp { op, lhs, rhs } => {
            out.push('(');
            print_expr(ast, *lhs, out);
            let _ = write!(out, " {} ", op.symbol());
            print_expr(ast, *rhs, out);
            out.push(')');
        }
        ExprKind::UnOp { op, operand } => {
            out.push(match op {
                UnOp::Not => '!',
                UnOp::Neg => '-',
            });
            print_expr(ast, *operand, out);
        }
    }
}
