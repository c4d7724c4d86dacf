//! Resource kinds and their capabilities.
//!
//! Kinds live in a global registry keyed by their name, initialized once.
//! Capabilities (compatibility merging, send/recv fields) are optional
//! trait implementations probed at interpret time via the `as_*` methods;
//! a kind that does not override them simply lacks the capability.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::types::Type;
use crate::value::Value;

/// An identified unit of desired state, keyed by `(kind, name)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub kind: String,
    pub name: String,
    pub params: BTreeMap<String, Value>,
    pub meta: ResMeta,
}

impl Resource {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            params: BTreeMap::new(),
            meta: ResMeta::default(),
        }
    }

    /// Display key, `kind[name]`.
    pub fn key(&self) -> String {
        format!("{}[{}]", self.kind, self.name)
    }
}

/// Engine-facing metadata attached to every resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResMeta {
    /// Converge without applying changes.
    pub noop: bool,
}

/// Static description of one settable field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub typ: Type,
    /// Inclusive bounds for ranged integer fields.
    pub range: Option<(i64, i64)>,
}

impl FieldSpec {
    const fn new(name: &'static str, typ: Type) -> Self {
        Self {
            name,
            typ,
            range: None,
        }
    }

    const fn ranged(name: &'static str, lo: i64, hi: i64) -> Self {
        Self {
            name,
            typ: Type::Int,
            range: Some((lo, hi)),
        }
    }
}

/// A registered resource kind.
pub trait ResKind: Send + Sync {
    fn kind(&self) -> &'static str;

    fn fields(&self) -> &[FieldSpec];

    fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields().iter().find(|f| f.name == name)
    }

    /// Structural comparison used for duplicate reconciliation of kinds
    /// without the compatibility capability.
    fn cmp(&self, a: &Resource, b: &Resource) -> Result<(), String> {
        if a.params == b.params {
            Ok(())
        } else {
            Err(format!("{} and {} differ in parameters", a.key(), b.key()))
        }
    }

    /// Validates a fully built resource. The default checks field names,
    /// value types and integer ranges against the specs.
    fn validate(&self, res: &Resource) -> Result<(), String> {
        for (name, value) in &res.params {
            let Some(spec) = self.field(name) else {
                return Err(format!("{} has no field `{name}`", self.kind()));
            };
            if !spec.typ.compat(&value.type_of()) {
                return Err(format!(
                    "field `{name}` of {} wants `{}`, got `{}`",
                    self.kind(),
                    spec.typ,
                    value.type_of()
                ));
            }
            if let Some((lo, hi)) = spec.range
                && let Value::Int(i) = value
                && !(lo..=hi).contains(i)
            {
                return Err(format!("value {i} overflows field `{name}` ({lo}..={hi})"));
            }
        }
        Ok(())
    }

    fn as_compatible(&self) -> Option<&dyn CompatibleKind> {
        None
    }

    fn as_sendable(&self) -> Option<&dyn Sendable> {
        None
    }

    fn as_recvable(&self) -> Option<&dyn Recvable> {
        None
    }
}

/// Safe merging of duplicate resources.
pub trait CompatibleKind: Send + Sync {
    /// Confirms two occurrences may merge.
    fn adapt_cmp(&self, a: &Resource, b: &Resource) -> Result<(), String>;

    /// Merges `other` into `into`; only called after `adapt_cmp` passed.
    fn merge(&self, into: &mut Resource, other: &Resource) -> Result<(), String>;
}

/// The kind exposes readable fields whose values can be sent to other
/// resources at runtime.
pub trait Sendable: Send + Sync {
    fn sends(&self) -> Vec<(&'static str, Type)>;
}

/// The kind exposes writable fields that can receive sent values.
pub trait Recvable: Send + Sync {
    fn recv_fields(&self) -> Vec<(&'static str, Type)>;
}

/// The global kind registry.
pub struct KindRegistry {
    kinds: HashMap<&'static str, Arc<dyn ResKind>>,
}

impl KindRegistry {
    pub fn with_defaults() -> Self {
        let mut reg = Self {
            kinds: HashMap::new(),
        };
        reg.register(Arc::new(NoopKind));
        reg.register(Arc::new(TestKind));
        reg.register(Arc::new(PkgKind));
        reg
    }

    pub fn register(&mut self, kind: Arc<dyn ResKind>) {
        self.kinds.insert(kind.kind(), kind);
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn ResKind>> {
        // Kinds are registered lowercase; edge statements reference them
        // capitalized (`Test["t1"]`).
        self.kinds.get(kind.to_lowercase().as_str())
    }
}

/// The registry is initialized once at first use and shared for the
/// lifetime of the process.
pub fn registry() -> &'static KindRegistry {
    static REGISTRY: OnceLock<KindRegistry> = OnceLock::new();
    REGISTRY.get_or_init(KindRegistry::with_defaults)
}

// Built-in kinds. The real catalog lives with the convergence engine;
// these three exist so the pipeline is complete and testable.

/// Does nothing, successfully.
struct NoopKind;

impl ResKind for NoopKind {
    fn kind(&self) -> &'static str {
        "noop"
    }

    fn fields(&self) -> &[FieldSpec] {
        static FIELDS: [FieldSpec; 1] = [FieldSpec::new("comment", Type::Str)];
        &FIELDS
    }
}

/// Exercises the type system: ranged integers, pointers for receiving,
/// and a `hello` field for sending.
struct TestKind;

impl ResKind for TestKind {
    fn kind(&self) -> &'static str {
        "test"
    }

    fn fields(&self) -> &[FieldSpec] {
        static FIELDS: [FieldSpec; 8] = [
            FieldSpec::ranged("int8", i8::MIN as i64, i8::MAX as i64),
            FieldSpec::ranged("int16", i16::MIN as i64, i16::MAX as i64),
            FieldSpec::ranged("int32", i32::MIN as i64, i32::MAX as i64),
            FieldSpec::new("int64", Type::Int),
            FieldSpec::new("stringptr", Type::Str),
            FieldSpec::new("boolptr", Type::Bool),
            FieldSpec::new("int64ptr", Type::Int),
            FieldSpec::new("hello", Type::Str),
        ];
        &FIELDS
    }

    fn as_sendable(&self) -> Option<&dyn Sendable> {
        Some(self)
    }

    fn as_recvable(&self) -> Option<&dyn Recvable> {
        Some(self)
    }
}

impl Sendable for TestKind {
    fn sends(&self) -> Vec<(&'static str, Type)> {
        vec![("hello", Type::Str)]
    }
}

impl Recvable for TestKind {
    fn recv_fields(&self) -> Vec<(&'static str, Type)> {
        vec![
            ("stringptr", Type::Str),
            ("boolptr", Type::Bool),
            ("int64ptr", Type::Int),
        ]
    }
}

/// A package. Duplicates merge when their states agree (or one side
/// leaves the state unset).
struct PkgKind;

impl ResKind for PkgKind {
    fn kind(&self) -> &'static str {
        "pkg"
    }

    fn fields(&self) -> &[FieldSpec] {
        static FIELDS: [FieldSpec; 2] = [
            FieldSpec::new("state", Type::Str),
            FieldSpec::new("version", Type::Str),
        ];
        &FIELDS
    }

    fn as_compatible(&self) -> Option<&dyn CompatibleKind> {
        Some(self)
    }

    fn as_sendable(&self) -> Option<&dyn Sendable> {
        Some(self)
    }
}

impl CompatibleKind for PkgKind {
    fn adapt_cmp(&self, a: &Resource, b: &Resource) -> Result<(), String> {
        for field in ["state", "version"] {
            match (a.params.get(field), b.params.get(field)) {
                (Some(x), Some(y)) if x != y => {
                    return Err(format!("{} and {} disagree on `{field}`", a.key(), b.key()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn merge(&self, into: &mut Resource, other: &Resource) -> Result<(), String> {
        for (name, value) in &other.params {
            into.params
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        into.meta.noop = into.meta.noop && other.meta.noop;
        Ok(())
    }
}

impl Sendable for PkgKind {
    fn sends(&self) -> Vec<(&'static str, Type)> {
        vec![("installed", Type::Bool)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_res(params: &[(&str, Value)]) -> Resource {
        let mut res = Resource::new("test", "t1");
        for (k, v) in params {
            res.params.insert(k.to_string(), v.clone());
        }
        res
    }

    #[test]
    fn registry_probes_capabilities() {
        let reg = registry();
        let test = reg.get("test").unwrap();
        assert!(test.as_sendable().is_some());
        assert!(test.as_compatible().is_none());
        let pkg = reg.get("pkg").unwrap();
        assert!(pkg.as_compatible().is_some());
        assert!(pkg.as_recvable().is_none());
        assert!(reg.get("bogus").is_none());
    }

    #[test]
    fn registry_accepts_capitalized_lookups() {
        assert!(registry().get("Test").is_some());
    }

    #[test]
    fn validate_checks_ranges() {
        let reg = registry();
        let test = reg.get("test").unwrap();
        assert!(
            test.validate(&test_res(&[("int8", Value::Int(88))]))
                .is_ok()
        );
        assert!(
            test.validate(&test_res(&[("int8", Value::Int(88_888_888))]))
                .is_err()
        );
        assert!(
            test.validate(&test_res(&[("bogus", Value::Int(0))]))
                .is_err()
        );
        assert!(
            test.validate(&test_res(&[("stringptr", Value::Int(0))]))
                .is_err()
        );
    }

    #[test]
    fn default_cmp_is_param_equality() {
        let reg = registry();
        let test = reg.get("test").unwrap();
        let a = test_res(&[("stringptr", Value::Str("x".into()))]);
        let b = test_res(&[("stringptr", Value::Str("x".into()))]);
        let c = test_res(&[("stringptr", Value::Str("y".into()))]);
        assert!(test.cmp(&a, &b).is_ok());
        assert!(test.cmp(&a, &c).is_err());
    }

    #[test]
    fn pkg_adapt_merge() {
        let reg = registry();
        let pkg = reg.get("pkg").unwrap();
        let compatible = pkg.as_compatible().unwrap();

        let mut a = Resource::new("pkg", "x");
        a.params
            .insert("state".into(), Value::Str("installed".into()));
        let mut b = Resource::new("pkg", "x");
        b.params.insert("version".into(), Value::Str("1.2".into()));

        compatible.adapt_cmp(&a, &b).unwrap();
        compatible.merge(&mut a, &b).unwrap();
        assert_eq!(a.params.len(), 2);

        let mut c = Resource::new("pkg", "x");
        c.params.insert("state".into(), Value::Str("absent".into()));
        assert!(compatible.adapt_cmp(&a, &c).is_err());
    }
}
