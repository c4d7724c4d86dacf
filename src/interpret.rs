//! Interpretation: a typed tree plus one value-table snapshot in, a fresh
//! resource graph out.
//!
//! The walk collects resource and edge records, reconciles duplicate
//! `(kind, name)` pairs through the kind's capabilities, wires send/recv
//! plumbing, and ends with a topological sort that enforces the DAG
//! invariant. Each call owns its output; the caller re-invokes on every
//! stream event.

use std::collections::{BTreeMap, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::ast::{Ast, ExprId, Span, StmtId, StmtKind};
use crate::error::InterpretError;
use crate::eval::{EvalCtx, ValueTable, eval};
use crate::funcs::FuncRegistry;
use crate::resources::{KindRegistry, Resource};
use crate::scope::Resolutions;
use crate::value::Value;

/// Ordering / notification / plumbing annotations on one edge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EdgeMeta {
    pub notify: bool,
    pub send: Option<String>,
    pub recv: Option<String>,
}

/// The produced graph: vertices are reconciled resources, edges carry
/// ordering, notify and send/recv annotations.
#[derive(Debug)]
pub struct ResourceGraph {
    pub graph: DiGraph<Resource, EdgeMeta>,
}

impl ResourceGraph {
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.graph.node_weights()
    }

    pub fn find(&self, kind: &str, name: &str) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&i| self.graph[i].kind == kind && self.graph[i].name == name)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Vertex-and-edge equality under `(kind, name)` identity, the
    /// equivalence re-interpretation results are compared by.
    pub fn same(&self, other: &ResourceGraph) -> bool {
        let key =
            |g: &ResourceGraph, i: NodeIndex| (g.graph[i].kind.clone(), g.graph[i].name.clone());

        let mut a_nodes: Vec<&Resource> = self.graph.node_weights().collect();
        let mut b_nodes: Vec<&Resource> = other.graph.node_weights().collect();
        a_nodes.sort_by_key(|r| (r.kind.clone(), r.name.clone()));
        b_nodes.sort_by_key(|r| (r.kind.clone(), r.name.clone()));
        if a_nodes != b_nodes {
            return false;
        }

        let edge_set = |g: &ResourceGraph| {
            let mut edges: Vec<_> = g
                .graph
                .edge_indices()
                .map(|e| {
                    let (from, to) = g.graph.edge_endpoints(e).expect("edge exists");
                    (key(g, from), key(g, to), g.graph[e].clone())
                })
                .collect();
            edges.sort_by(|a, b| {
                (&a.0, &a.1)
                    .cmp(&(&b.0, &b.1))
                    .then(a.2.notify.cmp(&b.2.notify))
            });
            edges
        };
        edge_set(self) == edge_set(other)
    }
}

struct ResRecord {
    resource: Resource,
    span: Span,
}

struct EdgeRecord {
    from: (String, String),
    to: (String, String),
    notify: bool,
    send: Option<String>,
    recv: Option<String>,
    span: Span,
}

pub struct Interpreter<'a> {
    pub ast: &'a Ast,
    pub res: &'a Resolutions,
    pub funcs: &'a FuncRegistry,
    pub kinds: &'a KindRegistry,
}

impl<'a> Interpreter<'a> {
    /// Produces a resource graph from one snapshot.
    pub fn interpret(&self, table: &ValueTable) -> Result<ResourceGraph, InterpretError> {
        let mut resources: Vec<ResRecord> = Vec::new();
        let mut edges: Vec<EdgeRecord> = Vec::new();
        let ctx = EvalCtx {
            ast: self.ast,
            res: self.res,
            funcs: self.funcs,
            table,
        };
        self.walk_stmts(&self.ast.root, &ctx, &mut resources, &mut edges)?;

        let reconciled = self.reconcile(resources)?;
        self.build_graph(reconciled, edges)
    }

    fn eval_str(&self, ctx: &EvalCtx, id: ExprId) -> Result<String, InterpretError> {
        let span = self.ast.expr(id).span;
        let value = eval(ctx, id).map_err(|e| InterpretError::Eval {
            reason: e.to_string(),
            span,
        })?;
        match value {
            Value::Str(s) => Ok(s),
            other => Err(InterpretError::Eval {
                reason: format!("expected a string, got {other}"),
                span,
            }),
        }
    }

    fn walk_stmts(
        &self,
        stmts: &[StmtId],
        ctx: &EvalCtx,
        resources: &mut Vec<ResRecord>,
        edges: &mut Vec<EdgeRecord>,
    ) -> Result<(), InterpretError> {
        for &sid in stmts {
            let span = self.ast.stmt(sid).span;
            match &self.ast.stmt(sid).kind {
                StmtKind::Import { .. } | StmtKind::Bind { .. } | StmtKind::Class { .. } => {}
                StmtKind::Include { expanded, .. } => {
                    self.walk_stmts(expanded, ctx, resources, edges)?;
                }
                StmtKind::If { cond, then, els } => {
                    let picked = eval(ctx, *cond)
                        .map_err(|e| InterpretError::Eval {
                            reason: e.to_string(),
                            span,
                        })?
                        .as_bool()
                        .ok_or_else(|| InterpretError::Eval {
                            reason: "if condition is not a bool".to_string(),
                            span,
                        })?;
                    let branch = if picked { then } else { els };
                    self.walk_stmts(branch, ctx, resources, edges)?;
                }
                StmtKind::Res {
                    kind,
                    name,
                    fields,
                    edges: meta_edges,
                } => {
                    let kind = kind.to_lowercase();
                    if self.kinds.get(&kind).is_none() {
                        return Err(InterpretError::UnknownKind { kind, span });
                    }
                    let name = self.eval_str(ctx, *name)?;
                    let mut resource = Resource::new(kind.clone(), name.clone());
                    for field in fields {
                        let value = eval(ctx, field.value).map_err(|e| InterpretError::Eval {
                            reason: e.to_string(),
                            span: field.span,
                        })?;
                        resource.params.insert(field.name.clone(), value);
                    }
                    for meta in meta_edges {
                        let target_kind = meta.target.kind.to_lowercase();
                        let target_name = self.eval_str(ctx, meta.target.name)?;
                        let this = (kind.clone(), name.clone());
                        let target = (target_kind, target_name);
                        let (from, to) = if meta.kind.outgoing() {
                            (this, target)
                        } else {
                            (target, this)
                        };
                        edges.push(EdgeRecord {
                            from,
                            to,
                            notify: meta.kind.notify(),
                            send: None,
                            recv: None,
                            span: meta.span,
                        });
                    }
                    resources.push(ResRecord { resource, span });
                }
                StmtKind::Edge { from, to } => {
                    let send = from.field.clone();
                    let recv = to.field.clone();
                    if send.is_some() != recv.is_some() {
                        return Err(InterpretError::SendRecvMismatch { span });
                    }
                    edges.push(EdgeRecord {
                        from: (
                            from.res.kind.to_lowercase(),
                            self.eval_str(ctx, from.res.name)?,
                        ),
                        to: (to.res.kind.to_lowercase(), self.eval_str(ctx, to.res.name)?),
                        notify: false,
                        send,
                        recv,
                        span,
                    });
                }
            }
        }
        Ok(())
    }

    /// Folds identical `(kind, name)` pairs into one resource, or fails.
    fn reconcile(
        &self,
        records: Vec<ResRecord>,
    ) -> Result<BTreeMap<(String, String), ResRecord>, InterpretError> {
        let mut out: BTreeMap<(String, String), ResRecord> = BTreeMap::new();
        for record in records {
            let key = (record.resource.kind.clone(), record.resource.name.clone());
            let kind = self
                .kinds
                .get(&record.resource.kind)
                .expect("kind checked during the walk");
            match out.get_mut(&key) {
                None => {
                    out.insert(key, record);
                }
                Some(existing) => {
                    if let Some(compatible) = kind.as_compatible() {
                        compatible
                            .adapt_cmp(&existing.resource, &record.resource)
                            .and_then(|_| {
                                compatible.merge(&mut existing.resource, &record.resource)
                            })
                            .map_err(|reason| {
                                tracing::debug!("merge refused: {reason}");
                                InterpretError::IncompatibleDuplicate {
                                    kind: key.0.clone(),
                                    name: key.1.clone(),
                                    span: record.span,
                                }
                            })?;
                    } else if kind.cmp(&existing.resource, &record.resource).is_err() {
                        return Err(InterpretError::IncompatibleDuplicate {
                            kind: key.0.clone(),
                            name: key.1.clone(),
                            span: record.span,
                        });
                    }
                }
            }
        }

        for record in out.values() {
            let kind = self
                .kinds
                .get(&record.resource.kind)
                .expect("kind checked during the walk");
            kind.validate(&record.resource)
                .map_err(|reason| InterpretError::InvalidResource {
                    reason,
                    span: record.span,
                })?;
        }
        Ok(out)
    }

    fn build_graph(
        &self,
        reconciled: BTreeMap<(String, String), ResRecord>,
        edges: Vec<EdgeRecord>,
    ) -> Result<ResourceGraph, InterpretError> {
        let mut graph: DiGraph<Resource, EdgeMeta> = DiGraph::new();
        let mut nodes: HashMap<(String, String), NodeIndex> = HashMap::new();
        for (key, record) in reconciled {
            let idx = graph.add_node(record.resource);
            nodes.insert(key, idx);
        }

        // recv field → its single send source.
        let mut recv_sources: HashMap<(NodeIndex, String), (NodeIndex, String)> = HashMap::new();

        for edge in edges {
            let from =
                *nodes
                    .get(&edge.from)
                    .ok_or_else(|| InterpretError::EdgeEndpointMissing {
                        kind: edge.from.0.clone(),
                        name: edge.from.1.clone(),
                        span: edge.span,
                    })?;
            let to = *nodes
                .get(&edge.to)
                .ok_or_else(|| InterpretError::EdgeEndpointMissing {
                    kind: edge.to.0.clone(),
                    name: edge.to.1.clone(),
                    span: edge.span,
                })?;

            if let (Some(send), Some(recv)) = (&edge.send, &edge.recv) {
                self.check_send_recv(&graph, from, to, send, recv, edge.span)?;
                match recv_sources.get(&(to, recv.clone())) {
                    Some(existing) if *existing == (from, send.clone()) => {
                        // Identical re-registration is idempotent.
                    }
                    Some(_) => {
                        return Err(InterpretError::RecvAlreadyWired {
                            kind: graph[to].kind.clone(),
                            name: graph[to].name.clone(),
                            field: recv.clone(),
                            span: edge.span,
                        });
                    }
                    None => {
                        recv_sources.insert((to, recv.clone()), (from, send.clone()));
                    }
                }
            }

            // The same endpoints with the same plumbing collapse to one
            // edge with OR-combined notify.
            let existing = graph
                .edges_connecting(from, to)
                .find(|e| {
                    let meta = e.weight();
                    meta.send == edge.send && meta.recv == edge.recv
                })
                .map(|e| e.id());
            match existing {
                Some(eid) => graph[eid].notify |= edge.notify,
                None => {
                    graph.add_edge(
                        from,
                        to,
                        EdgeMeta {
                            notify: edge.notify,
                            send: edge.send,
                            recv: edge.recv,
                        },
                    );
                }
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let node = &graph[cycle.node_id()];
            return Err(InterpretError::ResourceCycle {
                kind: node.kind.clone(),
                name: node.name.clone(),
            });
        }

        tracing::debug!(
            "interpreted {} resources, {} edges",
            graph.node_count(),
            graph.edge_count()
        );
        Ok(ResourceGraph { graph })
    }

    fn check_send_recv(
        &self,
        graph: &DiGraph<Resource, EdgeMeta>,
        from: NodeIndex,
        to: NodeIndex,
        send: &str,
        recv: &str,
        span: Span,
    ) -> Result<(), InterpretError> {
        let from_res = &graph[from];
        let to_res = &graph[to];
        let from_kind = self.kinds.get(&from_res.kind).expect("vertex kind exists");
        let to_kind = self.kinds.get(&to_res.kind).expect("vertex kind exists");

        let send_type = from_kind
            .as_sendable()
            .and_then(|s| {
                s.sends()
                    .into_iter()
                    .find(|(name, _)| *name == send)
                    .map(|(_, t)| t)
            })
            .ok_or_else(|| InterpretError::MissingSendField {
                kind: from_res.kind.clone(),
                name: from_res.name.clone(),
                field: send.to_string(),
                span,
            })?;
        let recv_type = to_kind
            .as_recvable()
            .and_then(|r| {
                r.recv_fields()
                    .into_iter()
                    .find(|(name, _)| *name == recv)
                    .map(|(_, t)| t)
            })
            .ok_or_else(|| InterpretError::MissingRecvField {
                kind: to_res.kind.clone(),
                name: to_res.name.clone(),
                field: recv.to_string(),
                span,
            })?;

        if !send_type.compat(&recv_type) {
            return Err(InterpretError::SendRecvTypeMismatch {
                send: send.to_string(),
                send_type: send_type.to_string(),
                recv: recv.to_string(),
                recv_type: recv_type.to_string(),
                span,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use crate::resources;
    use crate::types::unify;
    use crate::world::LocalWorld;
    use crate::{interpolate, parse, scope};
    use camino::Utf8Path;
    use std::sync::Arc;

    struct Compiled {
        ast: Ast,
        res: Resolutions,
        funcs: FuncRegistry,
    }

    fn compile(src: &str) -> Compiled {
        let mut ast = Ast::new();
        let stmts = parse::parse(src, &mut ast).unwrap();
        interpolate::interpolate(&mut ast, &stmts).unwrap();
        ast.root = stmts;
        let funcs = FuncRegistry::with_defaults();
        let root = ast.root.clone();
        let builder = scope::ScopeBuilder::new(
            &mut ast,
            Arc::new(MemFs::new()),
            Arc::new(LocalWorld::with_hostname("h1")),
            &funcs,
            None,
            None,
        );
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
            ast,
            res: out.resolutions,
            funcs,
        }
    }

    fn interpret(src: &str) -> Result<ResourceGraph, InterpretError> {
        let c = compile(src);
        let interp = Interpreter {
            ast: &c.ast,
            res: &c.res,
            funcs: &c.funcs,
            kinds: resources::registry(),
        };
        interp.interpret(&ValueTable::new())
    }

    #[test]
    fn single_noop_vertex() {
        let g = interpret("noop \"n1\" {}").unwrap();
        assert_eq!(g.node_count(), 1);
        assert_eq!(g.edge_count(), 0);
        assert!(g.find("noop", "n1").is_some());
    }

    #[test]
    fn two_noops_no_edges() {
        let g = interpret("noop \"n1\" {}\nnoop \"n2\" {}").unwrap();
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn class_includes_produce_two_vertices() {
        let src = r#"
            class c1($a, $b) { test $a { stringptr => $b, } }
            include c1("t1", "hello")
            include c1("t2", "world")
        "#;
        let g = interpret(src).unwrap();
        assert_eq!(g.node_count(), 2);
        let t1 = g.find("test", "t1").unwrap();
        assert_eq!(
            g.graph[t1].params.get("stringptr"),
            Some(&Value::Str("hello".into()))
        );
        let t2 = g.find("test", "t2").unwrap();
        assert_eq!(
            g.graph[t2].params.get("stringptr"),
            Some(&Value::Str("world".into()))
        );
    }

    #[test]
    fn incompatible_duplicate_fails() {
        let src = r#"
            include c1("t1", "hello")
            class c1($a, $b) { test $a { stringptr => $b, } }
            include c1("t1", "world")
        "#;
        let err = interpret(src).unwrap_err();
        assert!(matches!(err, InterpretError::IncompatibleDuplicate { .. }));
    }

    #[test]
    fn identical_duplicate_merges() {
        let src = r#"
            include c1("t1", "hello")
            class c1($a, $b) { test $a { stringptr => $b, } }
            include c1("t1", "hello")
        "#;
        let g = interpret(src).unwrap();
        assert_eq!(g.node_count(), 1);
    }

    #[test]
    fn compatible_kind_adapter_merges_with_edge_union() {
        let src = r#"
            test "t1" {}
            pkg "x" {
                state => "installed",
                Before => Test["t1"],
            }
            pkg "x" {
                version => "1.2",
                Notify => Test["t1"],
            }
        "#;
        let g = interpret(src).unwrap();
        assert_eq!(g.node_count(), 2);
        let pkg = g.find("pkg", "x").unwrap();
        assert_eq!(g.graph[pkg].params.len(), 2);
        // Both meta edges collapse onto the same endpoints with
        // OR-combined notify.
        assert_eq!(g.edge_count(), 1);
        let edge = g.graph.edge_indices().next().unwrap();
        assert!(g.graph[edge].notify);
    }

    #[test]
    fn adapter_rejects_conflicting_state() {
        let src = r#"
            pkg "x" { state => "installed", }
            pkg "x" { state => "absent", }
        "#;
        let err = interpret(src).unwrap_err();
        assert!(matches!(err, InterpretError::IncompatibleDuplicate { .. }));
    }

    #[test]
    fn meta_edge_directions() {
        let src = r#"
            noop "a" { Before => Noop["b"], }
            noop "b" {}
            noop "c" { Depend => Noop["b"], }
        "#;
        let g = interpret(src).unwrap();
        let a = g.find("noop", "a").unwrap();
        let b = g.find("noop", "b").unwrap();
        let c = g.find("noop", "c").unwrap();
        assert!(g.graph.find_edge(a, b).is_some());
        assert!(g.graph.find_edge(b, c).is_some());
    }

    #[test]
    fn edge_statement_with_send_recv() {
        let src = r#"
            test "t1" {}
            test "t2" {}
            Test["t1"].hello -> Test["t2"].stringptr
        "#;
        let g = interpret(src).unwrap();
        assert_eq!(g.edge_count(), 1);
        let edge = g.graph.edge_indices().next().unwrap();
        assert_eq!(g.graph[edge].send.as_deref(), Some("hello"));
        assert_eq!(g.graph[edge].recv.as_deref(), Some("stringptr"));
    }

    #[test]
    fn send_recv_must_be_paired() {
        let src = r#"
            test "t1" {}
            test "t2" {}
            Test["t1"].hello -> Test["t2"]
        "#;
        let err = interpret(src).unwrap_err();
        assert!(matches!(err, InterpretError::SendRecvMismatch { .. }));
    }

    #[test]
    fn send_field_must_exist() {
        let src = r#"
            test "t1" {}
            test "t2" {}
            Test["t1"].bogus -> Test["t2"].stringptr
        "#;
        let err = interpret(src).unwrap_err();
        assert!(matches!(err, InterpretError::MissingSendField { .. }));
    }

    #[test]
    fn recv_capability_checked() {
        // pkg is sendable but not recvable.
        let src = r#"
            test "t1" {}
            pkg "p" {}
            Test["t1"].hello -> Pkg["p"].state
        "#;
        let err = interpret(src).unwrap_err();
        assert!(matches!(err, InterpretError::MissingRecvField { .. }));
    }

    #[test]
    fn send_recv_types_must_unify() {
        let src = r#"
            test "t1" {}
            test "t2" {}
            Test["t1"].hello -> Test["t2"].boolptr
        "#;
        let err = interpret(src).unwrap_err();
        assert!(matches!(err, InterpretError::SendRecvTypeMismatch { .. }));
    }

    #[test]
    fn recv_allows_one_source_idempotently() {
        let ok = r#"
            test "t1" {}
            test "t2" {}
            Test["t1"].hello -> Test["t2"].stringptr
            Test["t1"].hello -> Test["t2"].stringptr
        "#;
        let g = interpret(ok).unwrap();
        assert_eq!(g.edge_count(), 1);

        let conflict = r#"
            test "t1" {}
            test "t2" {}
            test "t3" {}
            Test["t1"].hello -> Test["t3"].stringptr
            Test["t2"].hello -> Test["t3"].stringptr
        "#;
        let err = interpret(conflict).unwrap_err();
        assert!(matches!(err, InterpretError::RecvAlreadyWired { .. }));
    }

    #[test]
    fn edge_endpoint_must_exist() {
        let src = r#"
            noop "a" {}
            Noop["a"] -> Noop["ghost"]
        "#;
        let err = interpret(src).unwrap_err();
        assert!(matches!(err, InterpretError::EdgeEndpointMissing { .. }));
    }

    #[test]
    fn resource_cycle_detected() {
        let src = r#"
            noop "a" { Before => Noop["b"], }
            noop "b" { Before => Noop["a"], }
        "#;
        let err = interpret(src).unwrap_err();
        assert!(matches!(err, InterpretError::ResourceCycle { .. }));
    }

    #[test]
    fn if_branches_follow_condition() {
        let g = interpret("if true { noop \"yes\" {} } else { noop \"no\" {} }").unwrap();
        assert!(g.find("noop", "yes").is_some());
        assert!(g.find("noop", "no").is_none());
    }

    #[test]
    fn interpretation_is_deterministic() {
        let src = r#"
            noop "b" {}
            noop "a" { Before => Noop["b"], }
            test "t" { int8 => 5, }
        "#;
        let c = compile(src);
        let interp = Interpreter {
            ast: &c.ast,
            res: &c.res,
            funcs: &c.funcs,
            kinds: resources::registry(),
        };
        let g1 = interp.interpret(&ValueTable::new()).unwrap();
        let g2 = interp.interpret(&ValueTable::new()).unwrap();
        assert!(g1.same(&g2));
    }

    #[test]
    fn dynamic_int_overflow_caught_at_validate() {
        // A value that only becomes known at interpret time still hits
        // the range check.
        let src = r#"
            $v = 100 + 100
            test "t" { int8 => $v, }
        "#;
        let err = interpret(src).unwrap_err();
        assert!(matches!(err, InterpretError::InvalidResource { .. }));
    }
}
