//! String interpolation expansion.
//!
//! Runs once, after parsing and before scope construction. Every string
//! literal containing `${…}` markers is rewritten into an equivalent
//! `+`-concatenation of plain literals and the embedded expressions, so
//! later passes never see a marker. The embedded source is parsed with the
//! regular expression parser and re-spanned to the enclosing literal.

use crate::ast::{Ast, BinOp, ExprId, ExprKind, Span, StmtId, StmtKind};
use crate::error::{ParseError, ParseErrorKind};
use crate::parse;

pub fn interpolate(ast: &mut Ast, stmts: &[StmtId]) -> Result<(), ParseError> {
    for &id in stmts {
        interpolate_stmt(ast, id)?;
    }
    Ok(())
}

fn interpolate_stmt(ast: &mut Ast, id: StmtId) -> Result<(), ParseError> {
    let kind = ast.stmt(id).kind.clone();
    let kind = match kind {
        StmtKind::Import { .. } => return Ok(()),
        StmtKind::Bind { name, value } => StmtKind::Bind {
            name,
            value: rewrite(ast, value)?,
        },
        StmtKind::Class { name, params, body } => {
            // Templates are interpolated in place; include expansion later
            // copies the already-rewritten body.
            interpolate(ast, &body)?;
            StmtKind::Class { name, params, body }
        }
        StmtKind::Include {
            name,
            args,
            expanded,
        } => {
            let args = args
                .into_iter()
                .map(|a| rewrite(ast, a))
                .collect::<Result<_, _>>()?;
            StmtKind::Include {
                name,
                args,
                expanded,
            }
        }
        StmtKind::Res {
            kind,
            name,
            mut fields,
            mut edges,
        } => {
            let name = rewrite(ast, name)?;
            for field in &mut fields {
                field.value = rewrite(ast, field.value)?;
            }
            for edge in &mut edges {
                edge.target.name = rewrite(ast, edge.target.name)?;
            }
            StmtKind::Res {
                kind,
                name,
                fields,
                edges,
            }
        }
        StmtKind::Edge { mut from, mut to } => {
            from.res.name = rewrite(ast, from.res.name)?;
            to.res.name = rewrite(ast, to.res.name)?;
            StmtKind::Edge { from, to }
        }
        StmtKind::If { cond, then, els } => {
            let cond = rewrite(ast, cond)?;
            interpolate(ast, &then)?;
            interpolate(ast, &els)?;
            StmtKind::If { cond, then, els }
        }
    };
    ast.stmt_mut(id).kind = kind;
    Ok(())
}

/// Rewrites one expression, returning its (possibly new) id.
fn rewrite(ast: &mut Ast, id: ExprId) -> Result<ExprId, ParseError> {
    let kind = ast.expr(id).kind.clone();
    let span = ast.expr(id).span;
    match kind {
        ExprKind::Str(s) if s.contains("${") => expand_str(ast, &s, span),
        ExprKind::Str(_)
        | ExprKind::Bool(_)
        | ExprKind::Int(_)
        | ExprKind::Float(_)
        | ExprKind::Var { .. } => Ok(id),
        ExprKind::List(items) => {
            let items = items
                .into_iter()
                .map(|e| rewrite(ast, e))
                .collect::<Result<_, _>>()?;
            ast.expr_mut(id).kind = ExprKind::List(items);
            Ok(id)
        }
        ExprKind::Map(pairs) => {
            let pairs = pairs
                .into_iter()
                .map(|(k, v)| Ok((rewrite(ast, k)?, rewrite(ast, v)?)))
                .collect::<Result<_, ParseError>>()?;
            ast.expr_mut(id).kind = ExprKind::Map(pairs);
            Ok(id)
        }
        ExprKind::Struct(fields) => {
            let fields = fields
                .into_iter()
                .map(|(n, e)| Ok((n, rewrite(ast, e)?)))
                .collect::<Result<_, ParseError>>()?;
            ast.expr_mut(id).kind = ExprKind::Struct(fields);
            Ok(id)
        }
        ExprKind::Func { params, body } => {
            let body = rewrite(ast, body)?;
            ast.expr_mut(id).kind = ExprKind::Func { params, body };
            Ok(id)
        }
        ExprKind::Call { target, args } => {
            let args = args
                .into_iter()
                .map(|e| rewrite(ast, e))
                .collect::<Result<_, _>>()?;
            ast.expr_mut(id).kind = ExprKind::Call { target, args };
            Ok(id)
        }
        ExprKind::BinOp { op, lhs, rhs } => {
            let lhs = rewrite(ast, lhs)?;
            let rhs = rewrite(ast, rhs)?;
            ast.expr_mut(id).kind = ExprKind::BinOp { op, lhs, rhs };
            Ok(id)
        }
        ExprKind::UnOp { op, operand } => {
            let operand = rewrite(ast, operand)?;
            ast.expr_mut(id).kind = ExprKind::UnOp { op, operand };
            Ok(id)
        }
    }
}

enum Part {
    Lit(String),
    Embedded(String),
}

fn split_parts(s: &str, span: Span) -> Result<Vec<Part>, ParseError> {
    let mut parts = Vec::new();
    let mut lit = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            if !lit.is_empty() {
                parts.push(Part::Lit(std::mem::take(&mut lit)));
            }
            let mut depth = 1usize;
            let mut inner = String::new();
            loop {
                let Some(c) = chars.next() else {
                    return Err(ParseError {
                        span,
                        kind: ParseErrorKind::UnterminatedInterpolation,
                    });
                };
                match c {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
                inner.push(c);
            }
            parts.push(Part::Embedded(inner));
        } else {
            lit.push(c);
        }
    }
    if !lit.is_empty() {
        parts.push(Part::Lit(lit));
    }
    Ok(parts)
}

fn expand_str(ast: &mut Ast, s: &str, span: Span) -> Result<ExprId, ParseError> {
    let parts = split_parts(s, span)?;

    // Always anchor the chain on a literal so the whole expression is
    // forced to string type even when the marker stands alone.
    let mut ids: Vec<ExprId> = Vec::with_capacity(parts.len() + 1);
    if matches!(parts.first(), Some(Part::Embedded(_)) | None) {
        ids.push(ast.add_expr(span, ExprKind::Str(String::new())));
    }
    for part in parts {
        match part {
            Part::Lit(lit) => ids.push(ast.add_expr(span, ExprKind::Str(lit))),
            Part::Embedded(src) => {
                let embedded =
                    parse::parse_expr(&src, ast).map_err(|e| ParseError { span, kind: e.kind })?;
                respan(ast, embedded, span);
                // Embedded markers may themselves contain literals with
                // markers; expand them too.
                let embedded = rewrite(ast, embedded)?;
                ids.push(embedded);
            }
        }
    }

    let mut iter = ids.into_iter();
    let mut acc = iter.next().expect("at least one part");
    for next in iter {
        acc = ast.add_expr(
            span,
            ExprKind::BinOp {
                op: BinOp::Add,
                lhs: acc,
                rhs: next,
            },
        );
    }
    Ok(acc)
}

/// Rewrites the spans of a freshly parsed embedded subtree to point at the
/// enclosing literal, so diagnostics land on real source.
fn respan(ast: &mut Ast, id: ExprId, span: Span) {
    ast.expr_mut(id).span = span;
    let kind = ast.expr(id).kind.clone();
    match kind {
        ExprKind::List(items) => {
            for e in items {
                respan(ast, e, span);
            }
        }
        ExprKind::Map(pairs) => {
            for (k, v) in pairs {
                respan(ast, k, span);
                respan(ast, v, span);
            }
        }
        ExprKind::Struct(fields) => {
            for (_, e) in fields {
                respan(ast, e, span);
            }
        }
        ExprKind::Func { body, .. } => respan(ast, body, span),
        ExprKind::Call { args, .. } => {
            for e in args {
                respan(ast, e, span);
            }
        }
        ExprKind::BinOp { lhs, rhs, .. } => {
            respan(ast, lhs, span);
            respan(ast, rhs, span);
        }
        ExprKind::UnOp { operand, .. } => respan(ast, operand, span),
        _ => {}
    }
}
