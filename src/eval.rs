//! Expression evaluation against a value-table snapshot.
//!
//! Function applications that are vertices of the function graph resolve
//! through the table (the engine computed them in topological order);
//! everything else evaluates structurally. Both the engine (computing node
//! arguments) and the interpreter (resolving statement expressions) walk
//! through here, so the two always agree on semantics.

use std::collections::{BTreeMap, HashMap};

use crate::ast::{Ast, BinOp, ExprId, ExprKind, UnOp};
use crate::funcs::{FuncEntry, FuncRegistry};
use crate::scope::{CallTarget, Resolutions};
use crate::value::Value;

/// Most-recent output value per function-graph vertex, keyed by the call
/// expression's id. Snapshots are immutable once published.
pub type ValueTable = HashMap<ExprId, Value>;

pub struct EvalCtx<'a> {
    pub ast: &'a Ast,
    pub res: &'a Resolutions,
    pub funcs: &'a FuncRegistry,
    pub table: &'a ValueTable,
}

/// Call-time parameter bindings of enclosing function literals.
type Env = Vec<HashMap<String, Value>>;

pub fn eval(ctx: &EvalCtx, id: ExprId) -> anyhow::Result<Value> {
    eval_in(ctx, id, &mut Env::new())
}

fn eval_in(ctx: &EvalCtx, id: ExprId, env: &mut Env) -> anyhow::Result<Value> {
    match &ctx.ast.expr(id).kind {
        ExprKind::Bool(v) => Ok(Value::Bool(*v)),
        ExprKind::Int(v) => Ok(Value::Int(*v)),
        ExprKind::Float(v) => Ok(Value::Float(*v)),
        ExprKind::Str(v) => Ok(Value::Str(v.clone())),
        ExprKind::List(items) => {
            let items = items
                .iter()
                .map(|&e| eval_in(ctx, e, env))
                .collect::<anyhow::Result<_>>()?;
            Ok(Value::List(items))
        }
        ExprKind::Map(pairs) => {
            let mut map = BTreeMap::new();
            for (k, v) in pairs {
                let key = eval_in(ctx, *k, env)?;
                let value = eval_in(ctx, *v, env)?;
                if map.insert(key, value).is_some() {
                    anyhow::bail!("duplicate key in map literal");
                }
            }
            Ok(Value::Map(map))
        }
        ExprKind::Struct(fields) => {
            let fields = fields
                .iter()
                .map(|(n, e)| Ok((n.clone(), eval_in(ctx, *e, env)?)))
                .collect::<anyhow::Result<_>>()?;
            Ok(Value::Struct(fields))
        }
        ExprKind::Func { .. } => {
            anyhow::bail!("function values are not first-class; call the binding instead")
        }
        ExprKind::Var { name } => {
            for frame in env.iter().rev() {
                if let Some(v) = frame.get(name) {
                    return Ok(v.clone());
                }
            }
            let Some(&target) = ctx.res.var_bindings.get(&id) else {
                anyhow::bail!("variable `{name}` was not resolved");
            };
            eval_in(ctx, target, env)
        }
        ExprKind::Call { .. } => {
            if let Some(v) = ctx.table.get(&id) {
                return Ok(v.clone());
            }
            call_uncached(ctx, id, env)
        }
        ExprKind::BinOp { op, lhs, rhs } => {
            // Short-circuit before touching the right side.
            if matches!(op, BinOp::And | BinOp::Or) {
                let l = eval_in(ctx, *lhs, env)?
                    .as_bool()
                    .ok_or_else(|| anyhow::anyhow!("logical operand is not a bool"))?;
                return Ok(Value::Bool(match op {
                    BinOp::And if !l => false,
                    BinOp::Or if l => true,
                    _ => eval_in(ctx, *rhs, env)?
                        .as_bool()
                        .ok_or_else(|| anyhow::anyhow!("logical operand is not a bool"))?,
                }));
            }
            let l = eval_in(ctx, *lhs, env)?;
            let r = eval_in(ctx, *rhs, env)?;
            binop(*op, l, r)
        }
        ExprKind::UnOp { op, operand } => {
            let v = eval_in(ctx, *operand, env)?;
            match (op, v) {
                (UnOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnOp::Neg, Value::Int(i)) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| anyhow::anyhow!("integer negation overflow")),
                (UnOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
                (op, v) => anyhow::bail!("operator {op:?} is not defined for {v}"),
            }
        }
    }
}

/// Evaluates a call expression without consulting the table for the call
/// itself. The engine uses this to recompute a graph vertex whose
/// previous value is still in the snapshot.
pub fn eval_call_uncached(ctx: &EvalCtx, id: ExprId) -> anyhow::Result<Value> {
    call_uncached(ctx, id, &mut Env::new())
}

fn call_uncached(ctx: &EvalCtx, id: ExprId, env: &mut Env) -> anyhow::Result<Value> {
    let ExprKind::Call { target, args } = &ctx.ast.expr(id).kind else {
        anyhow::bail!("expression is not a call");
    };
    let arg_values: Vec<Value> = args
        .iter()
        .map(|&a| eval_in(ctx, a, env))
        .collect::<anyhow::Result<_>>()?;
    match ctx.res.call_targets.get(&id) {
        Some(CallTarget::Builtin(key)) => match ctx.funcs.lookup(key) {
            Some(FuncEntry::Pure(f)) => f.call(&arg_values),
            Some(FuncEntry::Fact(_)) => {
                anyhow::bail!("fact `{key}` has no value in the table")
            }
            None => anyhow::bail!("unknown builtin `{key}`"),
        },
        Some(CallTarget::Lambda(func)) => {
            let ExprKind::Func { params, body } = &ctx.ast.expr(*func).kind else {
                anyhow::bail!("call target is not a function literal");
            };
            let frame = params.iter().cloned().zip(arg_values).collect();
            env.push(frame);
            let out = eval_in(ctx, *body, env);
            env.pop();
            out
        }
        None => anyhow::bail!("call `{target}` was not resolved"),
    }
}

fn binop(op: BinOp, l: Value, r: Value) -> anyhow::Result<Value> {
    use BinOp::*;
    match op {
        Eq => return Ok(Value::Bool(l == r)),
        Ne => return Ok(Value::Bool(l != r)),
        Lt => return Ok(Value::Bool(l < r)),
        Le => return Ok(Value::Bool(l <= r)),
        Gt => return Ok(Value::Bool(l > r)),
        Ge => return Ok(Value::Bool(l >= r)),
        _ => {}
    }
    match (op, l, r) {
        (Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (Add, Value::Int(a), Value::Int(b)) => a
            .checked_add(b)
            .map(Value::Int)
            .ok_or_else(|| anyhow::anyhow!("integer addition overflow")),
        (Sub, Value::Int(a), Value::Int(b)) => a
            .checked_sub(b)
            .map(Value::Int)
            .ok_or_else(|| anyhow::anyhow!("integer subtraction overflow")),
        (Mul, Value::Int(a), Value::Int(b)) => a
            .checked_mul(b)
            .map(Value::Int)
            .ok_or_else(|| anyhow::anyhow!("integer multiplication overflow")),
        (Div, Value::Int(a), Value::Int(b)) => a
            .checked_div(b)
            .map(Value::Int)
            .ok_or_else(|| anyhow::anyhow!("division by zero")),
        (Mod, Value::Int(a), Value::Int(b)) => a
            .checked_rem(b)
            .map(Value::Int)
            .ok_or_else(|| anyhow::anyhow!("remainder by zero")),
        (Add, Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        (Sub, Value::Float(a), Value::Float(b)) => Ok(Value::Float(a - b)),
        (Mul, Value::Float(a), Value::Float(b)) => Ok(Value::Float(a * b)),
        (Div, Value::Float(a), Value::Float(b)) => Ok(Value::Float(a / b)),
        (Mod, Value::Float(a), Value::Float(b)) => Ok(Value::Float(a % b)),
        (op, l, r) => anyhow::bail!("operator {} is not defined for {l} and {r}", op.symbol()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use crate::scope::ScopeBuilder;
    use crate::world::LocalWorld;
    use crate::{interpolate, parse};
    use camino::Utf8Path;
    use std::sync::Arc;

    struct Fixture {
        ast: Ast,
        res: Resolutions,
        funcs: FuncRegistry,
    }

    fn fixture(src: &str) -> Fixture {
        let mut ast = Ast::new();
        let stmts = parse::parse(src, &mut ast).unwrap();
        interpolate::interpolate(&mut ast, &stmts).unwrap();
        ast.root = stmts;
        let funcs = FuncRegistry::with_defaults();
        let root = ast.root.clone();
        let builder = ScopeBuilder::new(
            &mut ast,
            Arc::new(MemFs::new()),
            Arc::new(LocalWorld::with_hostname("h1")),
            &funcs,
            None,
            None,
        );
        let out = builder.run(&root, Utf8Path::new("/proj")).unwrap();
        Fixture {
            ast,
            res: out.resolutions,
            funcs,
        }
    }

    fn eval_bind(fixture: &Fixture, name: &str, table: &ValueTable) -> anyhow::Result<Value> {
        let ctx = EvalCtx {
            ast: &fixture.ast,
            res: &fixture.res,
            funcs: &fixture.funcs,
            table,
        };
        for sid in &fixture.ast.root {
            if let crate::ast::StmtKind::Bind { name: n, value } = &fixture.ast.stmt(*sid).kind
                && n == name
            {
                return eval(&ctx, *value);
            }
        }
        panic!("no bind named {name}");
    }

    #[test]
    fn arithmetic_and_concat() {
        let f = fixture("$a = 1 + 2 * 3\n$b = \"x\" + \"y\"");
        let table = ValueTable::new();
        assert_eq!(eval_bind(&f, "a", &table).unwrap(), Value::Int(7));
        assert_eq!(eval_bind(&f, "b", &table).unwrap(), Value::Str("xy".into()));
    }

    #[test]
    fn division_by_zero_errors() {
        let f = fixture("$a = 1 / 0");
        assert!(eval_bind(&f, "a", &ValueTable::new()).is_err());
    }

    #[test]
    fn short_circuit_skips_rhs() {
        // The right side divides by zero; short-circuiting must not
        // evaluate it.
        let f = fixture("$a = false && (1 / 0) == 1");
        assert_eq!(
            eval_bind(&f, "a", &ValueTable::new()).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn vars_follow_bindings() {
        let f = fixture("$a = $b\n$b = 40 + 2");
        assert_eq!(
            eval_bind(&f, "a", &ValueTable::new()).unwrap(),
            Value::Int(42)
        );
    }

    #[test]
    fn lambda_call_binds_params() {
        let f = fixture("$double = func($x) { $x + $x }\n$y = double(21)");
        assert_eq!(
            eval_bind(&f, "y", &ValueTable::new()).unwrap(),
            Value::Int(42)
        );
    }

    #[test]
    fn pure_builtin_called_inline_when_not_in_table() {
        let f = fixture("$s = fmt.printf(\"%d!\", 42)");
        assert_eq!(
            eval_bind(&f, "s", &ValueTable::new()).unwrap(),
            Value::Str("42!".into())
        );
    }

    #[test]
    fn call_prefers_table_value() {
        let f = fixture("$s = strings.to_upper(\"x\")");
        // Find the call expression id.
        let call = f
            .ast
            .exprs()
            .find(|e| matches!(e.kind, ExprKind::Call { .. }))
            .unwrap()
            .id;
        let mut table = ValueTable::new();
        table.insert(call, Value::Str("CACHED".into()));
        assert_eq!(
            eval_bind(&f, "s", &table).unwrap(),
            Value::Str("CACHED".into())
        );
    }

    #[test]
    fn fact_without_table_value_errors() {
        let f = fixture("$h = sys.hostname()");
        assert!(eval_bind(&f, "h", &ValueTable::new()).is_err());
    }

    #[test]
    fn interpolation_concatenates() {
        let f = fixture("$x = \"world\"\n$y = \"hello ${$x}!\"");
        assert_eq!(
            eval_bind(&f, "y", &ValueTable::new()).unwrap(),
            Value::Str("hello world!".into())
        );
    }
}
