//! The parser.
//!
//! A hand-written recursive-descent parser over the token stream from
//! [`lex`]. Nodes are appended to the caller's [`Ast`] arena so imported
//! modules share one id space with the entry module.

pub mod lex;

use self::lex::{Spanned, Token};
use crate::ast::{
    Ast, BinOp, EdgeEndpoint, ExprId, ExprKind, MetaEdge, MetaEdgeKind, ResField, ResRef, Span,
    StmtId, StmtKind, UnOp,
};
use crate::error::{ParseError, ParseErrorKind};

/// Parses a source file into the arena, returning its top-level
/// statement list.
pub fn parse(src: &str, ast: &mut Ast) -> Result<Vec<StmtId>, ParseError> {
    let toks = lex::lex(src)?;
    let mut parser = Parser {
        toks: &toks,
        pos: 0,
        ast,
    };
    let stmts = parser.stmt_list(false)?;
    if let Some(t) = parser.peek() {
        return Err(parser.unexpected(t.clone(), "a statement"));
    }
    Ok(stmts)
}

/// Parses a single expression (used by the interpolation pass for the
/// contents of `${…}` markers).
pub fn parse_expr(src: &str, ast: &mut Ast) -> Result<ExprId, ParseError> {
    let toks = lex::lex(src)?;
    let mut parser = Parser {
        toks: &toks,
        pos: 0,
        ast,
    };
    let expr = parser.expr()?;
    if let Some(t) = parser.peek() {
        return Err(parser.unexpected(t.clone(), "end of expression"));
    }
    Ok(expr)
}

struct Parser<'a> {
    toks: &'a [Spanned],
    pos: usize,
    ast: &'a mut Ast,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.pos).map(|s| &s.tok)
    }

    fn peek2(&self) -> Option<&Token> {
        self.toks.get(self.pos + 1).map(|s| &s.tok)
    }

    fn bump(&mut self) -> Option<Spanned> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn here(&self) -> Span {
        self.toks
            .get(self.pos)
            .or_else(|| self.toks.last())
            .map(|s| s.span)
            .unwrap_or_default()
    }

    fn prev_span(&self) -> Span {
        self.toks
            .get(self.pos.saturating_sub(1))
            .map(|s| s.span)
            .unwrap_or_default()
    }

    fn eof(&self, expected: &str) -> ParseError {
        ParseError {
            span: self.toks.last().map(|s| s.span).unwrap_or_default(),
            kind: ParseErrorKind::Unexpected {
                expected: expected.to_string(),
                found: "end of input".to_string(),
            },
        }
    }

    fn unexpected(&self, found: Token, expected: &str) -> ParseError {
        ParseError {
            span: self.here(),
            kind: ParseErrorKind::Unexpected {
                expected: expected.to_string(),
                found: found.to_string(),
            },
        }
    }

    fn expect(&mut self, want: Token, expected: &str) -> Result<Span, ParseError> {
        match self.peek() {
            Some(t) if *t == want => Ok(self.bump().unwrap().span),
            Some(t) => Err(self.unexpected(t.clone(), expected)),
            None => Err(self.eof(expected)),
        }
    }

    fn eat(&mut self, want: &Token) -> bool {
        if self.peek() == Some(want) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self, expected: &str) -> Result<(String, Span), ParseError> {
        match self.peek() {
            Some(Token::Ident(_)) => {
                let s = self.bump().unwrap();
                let Token::Ident(name) = s.tok else {
                    unreachable!()
                };
                Ok((name, s.span))
            }
            Some(t) => Err(self.unexpected(t.clone(), expected)),
            None => Err(self.eof(expected)),
        }
    }

    /// Statements until EOF (`in_block == false`) or a closing brace.
    fn stmt_list(&mut self, in_block: bool) -> Result<Vec<StmtId>, ParseError> {
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                None => {
                    if in_block {
                        return Err(self.eof("`}`"));
                    }
                    return Ok(stmts);
                }
                Some(Token::RBrace) if in_block => return Ok(stmts),
                _ => stmts.push(self.stmt()?),
            }
        }
    }

    fn stmt(&mut self) -> Result<StmtId, ParseError> {
        match self.peek() {
            Some(Token::Import) => self.import_stmt(),
            Some(Token::Var(_)) => self.bind_stmt(),
            Some(Token::Class) => self.class_stmt(),
            Some(Token::Include) => self.include_stmt(),
            Some(Token::If) => self.if_stmt(),
            Some(Token::Ident(_)) => {
                if self.peek2() == Some(&Token::LBracket) {
                    self.edge_stmt()
                } else {
                    self.res_stmt()
                }
            }
            Some(t) => Err(self.unexpected(t.clone(), "a statement")),
            None => Err(self.eof("a statement")),
        }
    }

    fn import_stmt(&mut self) -> Result<StmtId, ParseError> {
        let start = self.bump().unwrap().span;
        let path = match self.peek() {
            Some(Token::Str(_)) => {
                let s = self.bump().unwrap();
                let Token::Str(path) = s.tok else {
                    unreachable!()
                };
                path
            }
            Some(t) => return Err(self.unexpected(t.clone(), "an import path string")),
            None => return Err(self.eof("an import path string")),
        };
        let alias = if self.eat(&Token::As) {
            match self.peek() {
                Some(Token::Star) => {
                    self.bump();
                    Some("*".to_string())
                }
                Some(Token::Ident(_)) => {
                    let (name, _) = self.expect_ident("an alias")?;
                    Some(name)
                }
                Some(t) => return Err(self.unexpected(t.clone(), "an alias or `*`")),
                None => return Err(self.eof("an alias or `*`")),
            }
        } else {
            None
        };
        let span = start.merge(self.prev_span());
        Ok(self.ast.add_stmt(span, StmtKind::Import { path, alias }))
    }

    fn bind_stmt(&mut self) -> Result<StmtId, ParseError> {
        let s = self.bump().unwrap();
        let Token::Var(name) = s.tok else {
            unreachable!()
        };
        self.expect(Token::Assign, "`=`")?;
        let value = self.expr()?;
        let span = s.span.merge(self.ast.expr(value).span);
        Ok(self.ast.add_stmt(span, StmtKind::Bind { name, value }))
    }

    fn class_stmt(&mut self) -> Result<StmtId, ParseError> {
        let start = self.bump().unwrap().span;
        let (name, _) = self.expect_ident("a class name")?;
        let mut params = Vec::new();
        if self.eat(&Token::LParen) {
            loop {
                match self.peek() {
                    Some(Token::RParen) => {
                        self.bump();
                        break;
                    }
                    Some(Token::Var(_)) => {
                        let s = self.bump().unwrap();
                        let Token::Var(p) = s.tok else { unreachable!() };
                        params.push(p);
                        if !self.eat(&Token::Comma) {
                            self.expect(Token::RParen, "`)`")?;
                            break;
                        }
                    }
                    Some(t) => return Err(self.unexpected(t.clone(), "a `$parameter`")),
                    None => return Err(self.eof("a `$parameter`")),
                }
            }
        }
        self.expect(Token::LBrace, "`{`")?;
        let body = self.stmt_list(true)?;
        let end = self.expect(Token::RBrace, "`}`")?;
        Ok(self
            .ast
            .add_stmt(start.merge(end), StmtKind::Class { name, params, body }))
    }

    fn include_stmt(&mut self) -> Result<StmtId, ParseError> {
        let start = self.bump().unwrap().span;
        let (name, _) = self.expect_ident("a class name")?;
        self.expect(Token::LParen, "`(`")?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.expr()?);
                if self.eat(&Token::Comma) {
                    if self.eat(&Token::RParen) {
                        break;
                    }
                } else {
                    self.expect(Token::RParen, "`)`")?;
                    break;
                }
            }
        }
        let span = start.merge(self.prev_span());
        Ok(self.ast.add_stmt(
            span,
            StmtKind::Include {
                name,
                args,
                expanded: Vec::new(),
            },
        ))
    }

    fn if_stmt(&mut self) -> Result<StmtId, ParseError> {
        let start = self.bump().unwrap().span;
        let cond = self.expr()?;
        self.expect(Token::LBrace, "`{`")?;
        let then = self.stmt_list(true)?;
        self.expect(Token::RBrace, "`}`")?;
        let els = if self.eat(&Token::Else) {
            self.expect(Token::LBrace, "`{`")?;
            let els = self.stmt_list(true)?;
            self.expect(Token::RBrace, "`}`")?;
            els
        } else {
            Vec::new()
        };
        let span = start.merge(self.prev_span());
        Ok(self.ast.add_stmt(span, StmtKind::If { cond, then, els }))
    }

    fn res_ref(&mut self) -> Result<ResRef, ParseError> {
        let (kind, start) = self.expect_ident("a resource kind")?;
        self.expect(Token::LBracket, "`[`")?;
        let name = self.expr()?;
        let end = self.expect(Token::RBracket, "`]`")?;
        Ok(ResRef {
            kind,
            name,
            span: start.merge(end),
        })
    }

    fn edge_endpoint(&mut self) -> Result<EdgeEndpoint, ParseError> {
        let res = self.res_ref()?;
        let field = if self.eat(&Token::Dot) {
            let (f, _) = self.expect_ident("a field name")?;
            Some(f)
        } else {
            None
        };
        Ok(EdgeEndpoint { res, field })
    }

    fn edge_stmt(&mut self) -> Result<StmtId, ParseError> {
        let from = self.edge_endpoint()?;
        self.expect(Token::Arrow, "`->`")?;
        let to = self.edge_endpoint()?;
        let span = from.res.span.merge(self.prev_span());
        Ok(self.ast.add_stmt(span, StmtKind::Edge { from, to }))
    }

    fn res_stmt(&mut self) -> Result<StmtId, ParseError> {
        let (kind, start) = self.expect_ident("a resource kind")?;
        let name = self.expr()?;
        self.expect(Token::LBrace, "`{`")?;

        let mut fields: Vec<ResField> = Vec::new();
        let mut edges: Vec<MetaEdge> = Vec::new();
        loop {
            match self.peek() {
                Some(Token::RBrace) => break,
                Some(Token::Ident(_)) => {
                    let (fname, fspan) = self.expect_ident("a field name")?;
                    self.expect(Token::FatArrow, "`=>`")?;
                    if let Some(meta) = MetaEdgeKind::from_field(&fname) {
                        let target = self.res_ref()?;
                        let span = fspan.merge(target.span);
                        edges.push(MetaEdge {
                            kind: meta,
                            target,
                            span,
                        });
                    } else {
                        if fields.iter().any(|f| f.name == fname) {
                            return Err(ParseError {
                                span: fspan,
                                kind: ParseErrorKind::DuplicateField(fname),
                            });
                        }
                        let value = self.expr()?;
                        let span = fspan.merge(self.ast.expr(value).span);
                        fields.push(ResField {
                            name: fname,
                            value,
                            span,
                        });
                    }
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                Some(t) => return Err(self.unexpected(t.clone(), "a field name or `}`")),
                None => return Err(self.eof("a field name or `}`")),
            }
        }
        let end = self.expect(Token::RBrace, "`}`")?;
        Ok(self.ast.add_stmt(
            start.merge(end),
            StmtKind::Res {
                kind,
                name,
                fields,
                edges,
            },
        ))
    }

    // Expressions, precedence climbing.

    fn expr(&mut self) -> Result<ExprId, ParseError> {
        self.or_expr()
    }

    fn binop_level<F>(&mut self, next: F, ops: &[(Token, BinOp)]) -> Result<ExprId, ParseError>
    where
        F: Fn(&mut Self) -> Result<ExprId, ParseError>,
    {
        let mut lhs = next(self)?;
        while let Some(tok) = self.peek() {
            let Some(&(_, op)) = ops.iter().find(|(t, _)| t == tok) else {
                break;
            };
            self.bump();
            let rhs = next(self)?;
            let span = self.ast.expr(lhs).span.merge(self.ast.expr(rhs).span);
            lhs = self.ast.add_expr(span, ExprKind::BinOp { op, lhs, rhs });
        }
        Ok(lhs)
    }

    fn or_expr(&mut self) -> Result<ExprId, ParseError> {
        self.binop_level(Self::and_expr, &[(Token::OrOr, BinOp::Or)])
    }

    fn and_expr(&mut self) -> Result<ExprId, ParseError> {
        self.binop_level(Self::cmp_expr, &[(Token::AndAnd, BinOp::And)])
    }

    fn cmp_expr(&mut self) -> Result<ExprId, ParseError> {
        self.binop_level(
            Self::add_expr,
            &[
                (Token::EqEq, BinOp::Eq),
                (Token::Ne, BinOp::Ne),
                (Token::Le, BinOp::Le),
                (Token::Lt, BinOp::Lt),
                (Token::Ge, BinOp::Ge),
                (Token::Gt, BinOp::Gt),
            ],
        )
    }

    fn add_expr(&mut self) -> Result<ExprId, ParseError> {
        self.binop_level(
            Self::mul_expr,
            &[(Token::Plus, BinOp::Add), (Token::Minus, BinOp::Sub)],
        )
    }

    fn mul_expr(&mut self) -> Result<ExprId, ParseError> {
        self.binop_level(
            Self::unary_expr,
            &[
                (Token::Star, BinOp::Mul),
                (Token::Slash, BinOp::Div),
                (Token::Percent, BinOp::Mod),
            ],
        )
    }

    fn unary_expr(&mut self) -> Result<ExprId, ParseError> {
        let op = match self.peek() {
            Some(Token::Not) => Some(UnOp::Not),
            Some(Token::Minus) => Some(UnOp::Neg),
            _ => None,
        };
        if let Some(op) = op {
            let start = self.bump().unwrap().span;
            let operand = self.unary_expr()?;
            let span = start.merge(self.ast.expr(operand).span);
            return Ok(self.ast.add_expr(span, ExprKind::UnOp { op, operand }));
        }
        self.primary_expr()
    }

    fn qualified_name(&mut self, first: String) -> Result<String, ParseError> {
        let mut name = first;
        while self.peek() == Some(&Token::Dot) {
            self.bump();
            let (part, _) = self.expect_ident("an identifier after `.`")?;
            name.push('.');
            name.push_str(&part);
        }
        Ok(name)
    }

    fn primary_expr(&mut self) -> Result<ExprId, ParseError> {
        let Some(tok) = self.peek().cloned() else {
            return Err(self.eof("an expression"));
        };
        match tok {
            Token::Bool(v) => {
                let span = self.bump().unwrap().span;
                Ok(self.ast.add_expr(span, ExprKind::Bool(v)))
            }
            Token::Int(v) => {
                let span = self.bump().unwrap().span;
                Ok(self.ast.add_expr(span, ExprKind::Int(v)))
            }
            Token::Float(v) => {
                let span = self.bump().unwrap().span;
                Ok(self.ast.add_expr(span, ExprKind::Float(v)))
            }
            Token::Str(v) => {
                let span = self.bump().unwrap().span;
                Ok(self.ast.add_expr(span, ExprKind::Str(v)))
            }
            Token::Var(name) => {
                let start = self.bump().unwrap().span;
                let name = self.qualified_name(name)?;
                let span = start.merge(self.prev_span());
                Ok(self.ast.add_expr(span, ExprKind::Var { name }))
            }
            Token::Ident(name) => {
                let start = self.bump().unwrap().span;
                let target = self.qualified_name(name)?;
                self.expect(Token::LParen, "`(` to call a function")?;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.expr()?);
                        if self.eat(&Token::Comma) {
                            if self.eat(&Token::RParen) {
                                break;
                            }
                        } else {
                            self.expect(Token::RParen, "`)`")?;
                            break;
                        }
                    }
                }
                let span = start.merge(self.prev_span());
                Ok(self.ast.add_expr(span, ExprKind::Call { target, args }))
            }
            Token::LParen => {
                self.bump();
                let inner = self.expr()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(inner)
            }
            Token::LBracket => {
                let start = self.bump().unwrap().span;
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.expr()?);
                        if self.eat(&Token::Comma) {
                            if self.eat(&Token::RBracket) {
                                break;
                            }
                        } else {
                            self.expect(Token::RBracket, "`]`")?;
                            break;
                        }
                    }
                }
                let span = start.merge(self.prev_span());
                Ok(self.ast.add_expr(span, ExprKind::List(items)))
            }
            Token::LBrace => {
                let start = self.bump().unwrap().span;
                let mut pairs = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = self.expr()?;
                        self.expect(Token::FatArrow, "`=>`")?;
                        let value = self.expr()?;
                        pairs.push((key, value));
                        if self.eat(&Token::Comma) {
                            if self.eat(&Token::RBrace) {
                                break;
                            }
                        } else {
                            self.expect(Token::RBrace, "`}`")?;
                            break;
                        }
                    }
                }
                let span = start.merge(self.prev_span());
                Ok(self.ast.add_expr(span, ExprKind::Map(pairs)))
            }
            Token::StructKw => {
                let start = self.bump().unwrap().span;
                self.expect(Token::LBrace, "`{`")?;
                let mut fields: Vec<(String, ExprId)> = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let (name, fspan) = self.expect_ident("a struct field name")?;
                        if fields.iter().any(|(n, _)| *n == name) {
                            return Err(ParseError {
                                span: fspan,
                                kind: ParseErrorKind::DuplicateField(name),
                            });
                        }
                        self.expect(Token::FatArrow, "`=>`")?;
                        let value = self.expr()?;
                        fields.push((name, value));
                        if self.eat(&Token::Comma) {
                            if self.eat(&Token::RBrace) {
                                break;
                            }
                        } else {
                            self.expect(Token::RBrace, "`}`")?;
                            break;
                        }
                    }
                }
                let span = start.merge(self.prev_span());
                Ok(self.ast.add_expr(span, ExprKind::Struct(fields)))
            }
            Token::FuncKw => {
                let start = self.bump().unwrap().span;
                self.expect(Token::LParen, "`(`")?;
                let mut params = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        match self.peek() {
                            Some(Token::Var(_)) => {
                                let s = self.bump().unwrap();
                                let Token::Var(p) = s.tok else { unreachable!() };
                                params.push(p);
                            }
                            Some(t) => {
                                return Err(self.unexpected(t.clone(), "a `$parameter`"));
                            }
                            None => return Err(self.eof("a `$parameter`")),
                        }
                        if self.eat(&Token::Comma) {
                            if self.eat(&Token::RParen) {
                                break;
                            }
                        } else {
                            self.expect(Token::RParen, "`)`")?;
                            break;
                        }
                    }
                }
                self.expect(Token::LBrace, "`{`")?;
                let body = self.expr()?;
                let end = self.expect(Token::RBrace, "`}`")?;
                Ok(self
                    .ast
                    .add_expr(start.merge(end), ExprKind::Func { params, body }))
            }
            other => Err(self.unexpected(other, "an expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{print_stmts, stmts_equivalent};

    fn parse_ok(src: &str) -> (Ast, Vec<StmtId>) {
        let mut ast = Ast::new();
        let stmts = parse(src, &mut ast).unwrap();
        (ast, stmts)
    }

    #[test]
    fn parses_resource() {
        let (ast, stmts) = parse_ok(r#"noop "n1" {}"#);
        assert_eq!(stmts.len(), 1);
        let StmtKind::Res { kind, fields, .. } = &ast.stmt(stmts[0]).kind else {
            panic!("expected a resource");
        };
        assert_eq!(kind, "noop");
        assert!(fields.is_empty());
    }

    #[test]
    fn parses_resource_fields_and_meta_edges() {
        let (ast, stmts) = parse_ok(
            r#"pkg "x" {
                state => "installed",
                Before => Test["t1"],
            }"#,
        );
        let StmtKind::Res { fields, edges, .. } = &ast.stmt(stmts[0]).kind else {
            panic!("expected a resource");
        };
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "state");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, MetaEdgeKind::Before);
        assert_eq!(edges[0].target.kind, "Test");
    }

    #[test]
    fn parses_class_and_include() {
        let (ast, stmts) = parse_ok(
            "class c1($a, $b) { test $a { stringptr => $b, } }\ninclude c1(\"t1\", \"hello\")",
        );
        assert_eq!(stmts.len(), 2);
        let StmtKind::Class { name, params, body } = &ast.stmt(stmts[0]).kind else {
            panic!("expected a class");
        };
        assert_eq!(name, "c1");
        assert_eq!(params, &["a", "b"]);
        assert_eq!(body.len(), 1);
        let StmtKind::Include { name, args, .. } = &ast.stmt(stmts[1]).kind else {
            panic!("expected an include");
        };
        assert_eq!(name, "c1");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn parses_edge_with_send_recv() {
        let (ast, stmts) = parse_ok(r#"Test["t1"].hello -> Test["t2"].stringptr"#);
        let StmtKind::Edge { from, to } = &ast.stmt(stmts[0]).kind else {
            panic!("expected an edge");
        };
        assert_eq!(from.res.kind, "Test");
        assert_eq!(from.field.as_deref(), Some("hello"));
        assert_eq!(to.field.as_deref(), Some("stringptr"));
    }

    #[test]
    fn precedence() {
        let (ast, _) = {
            let mut ast = Ast::new();
            let id = parse_expr("1 + 2 * 3 == 7 && true", &mut ast).unwrap();
            (ast, id)
        };
        // Outermost must be `&&`.
        let top = ast.exprs().last().unwrap();
        let ExprKind::BinOp { op, .. } = &top.kind else {
            panic!("expected a binop");
        };
        assert_eq!(*op, BinOp::And);
    }

    #[test]
    fn parses_literals() {
        let mut ast = Ast::new();
        let id = parse_expr(r#"{"k" => [1, 2], "j" => []}"#, &mut ast).unwrap();
        let ExprKind::Map(pairs) = &ast.expr(id).kind else {
            panic!("expected a map");
        };
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn parses_func_literal() {
        let mut ast = Ast::new();
        let id = parse_expr("func($x) { $x + 1 }", &mut ast).unwrap();
        let ExprKind::Func { params, .. } = &ast.expr(id).kind else {
            panic!("expected a function literal");
        };
        assert_eq!(params, &["x"]);
    }

    #[test]
    fn qualified_call_and_var() {
        let mut ast = Ast::new();
        let id = parse_expr("fmt.printf(\"%s\", $pkg.name)", &mut ast).unwrap();
        let ExprKind::Call { target, args } = &ast.expr(id).kind else {
            panic!("expected a call");
        };
        assert_eq!(target, "fmt.printf");
        let ExprKind::Var { name } = &ast.expr(args[1]).kind else {
            panic!("expected a var");
        };
        assert_eq!(name, "pkg.name");
    }

    #[test]
    fn rejects_duplicate_field() {
        let mut ast = Ast::new();
        let err = parse(r#"test "t" { a => 1, a => 2 }"#, &mut ast).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::DuplicateField(_)));
    }

    #[test]
    fn error_has_position() {
        let mut ast = Ast::new();
        let err = parse("class {", &mut ast).unwrap_err();
        assert_eq!(err.span.start.line, 1);
        assert!(err.span.start.col > 1);
    }

    #[test]
    fn print_reparse_round_trip() {
        let src = r#"
            import "dir1/" as d
            $greeting = "hello"
            $n = 3 + 4 * 2
            class c1($a) {
                test $a {
                    stringptr => $greeting,
                    Notify => Test["other"],
                }
            }
            include c1("t1")
            if $n == 11 {
                noop "n1" {}
            } else {
                noop "n2" {}
            }
            Test["t1"].hello -> Test["other"].stringptr
        "#;
        let mut a = Ast::new();
        let a_stmts = parse(src, &mut a).unwrap();
        let printed = print_stmts(&a, &a_stmts);
        let mut b = Ast::new();
        let b_stmts = parse(&printed, &mut b).unwrap();
        assert!(
            stmts_equivalent(&a, &a_stmts, &b, &b_stmts),
            "round-trip mismatch:\n{printed}"
        );
    }
}
