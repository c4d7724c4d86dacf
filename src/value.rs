//! Runtime values.
//!
//! Values are totally ordered so they can key maps and be compared during
//! duplicate-resource reconciliation. Floats order by `total_cmp`, which
//! keeps the ordering lawful without banning them from keys.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::types::Type;

#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<Value, Value>),
    /// Ordered named fields.
    Struct(Vec<(String, Value)>),
}

impl Value {
    fn tag(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::Str(_) => 3,
            Value::List(_) => 4,
            Value::Map(_) => 5,
            Value::Struct(_) => 6,
        }
    }

    /// The concrete type of this value. Empty containers fall back to
    /// `Variant` element types; the unifier, not the value, is the source
    /// of truth for static types.
    pub fn type_of(&self) -> Type {
        match self {
            Value::Bool(_) => Type::Bool,
            Value::Int(_) => Type::Int,
            Value::Float(_) => Type::Float,
            Value::Str(_) => Type::Str,
            Value::List(items) => Type::List(Box::new(
                items.first().map(Value::type_of).unwrap_or(Type::Variant),
            )),
            Value::Map(map) => match map.iter().next() {
                Some((k, v)) => Type::Map(Box::new(k.type_of()), Box::new(v.type_of())),
                None => Type::Map(Box::new(Type::Variant), Box::new(Type::Variant)),
            },
            Value::Struct(fields) => Type::Struct(
                fields
                    .iter()
                    .map(|(name, v)| (name.clone(), v.type_of()))
                    .collect(),
            ),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            (Value::Struct(a), Value::Struct(b)) => a.cmp(b),
            (a, b) => a.tag().cmp(&b.tag()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} => {v}")?;
                }
                write!(f, "}}")
            }
            Value::Struct(fields) => {
                write!(f, "struct{{")?;
                for (i, (name, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name} => {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_total_across_tags() {
        let mut values = vec![
            Value::Str("b".into()),
            Value::Int(1),
            Value::Bool(true),
            Value::Str("a".into()),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Bool(true),
                Value::Int(1),
                Value::Str("a".into()),
                Value::Str("b".into()),
            ]
        );
    }

    #[test]
    fn map_keys_accept_values() {
        let mut map = BTreeMap::new();
        map.insert(Value::Str("k".into()), Value::Int(1));
        map.insert(Value::Str("k".into()), Value::Int(2));
        assert_eq!(map.len(), 1);
        assert_eq!(map[&Value::Str("k".into())], Value::Int(2));
    }

    #[test]
    fn type_of_containers() {
        let v = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(v.type_of(), Type::List(Box::new(Type::Int)));
        let empty = Value::List(vec![]);
        assert_eq!(empty.type_of(), Type::List(Box::new(Type::Variant)));
    }

    #[test]
    fn float_ordering_total() {
        assert_eq!(
            Value::Float(f64::NAN).cmp(&Value::Float(f64::NAN)),
            Ordering::Equal
        );
        assert!(Value::Float(1.0) < Value::Float(2.0));
    }
}
