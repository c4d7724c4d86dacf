//! Built-in functions and facts.
//!
//! Pure functions compute a value from argument values. Facts are
//! long-lived producers fed by the outside world (hostname, clock, file
//! content, KV store); each one runs on its own thread under the engine
//! and pushes values on change. Both are looked up by their dotted name
//! through a [`FuncRegistry`] that the scope builder seeds into the root
//! scope.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::engine::Context;
use crate::fs::Fs;
use crate::types::Type;
use crate::value::Value;
use crate::world::World;

/// A side-effect-free builtin.
pub trait PureFunc: Send + Sync {
    fn name(&self) -> &'static str;

    /// The call-site signature for a call with `arity` arguments. `fresh`
    /// mints a new unification variable for each polymorphic slot.
    /// Returns `None` when the arity is unacceptable.
    fn signature(&self, arity: usize, fresh: &mut dyn FnMut() -> Type) -> Option<Type>;

    fn call(&self, args: &[Value]) -> anyhow::Result<Value>;

    /// Post-solve validation of polymorphic argument slots.
    fn check_arg_types(&self, _args: &[Type]) -> Result<(), String> {
        Ok(())
    }
}

/// Everything a fact may need to talk to the outside world.
pub struct FactRuntime {
    pub world: Arc<dyn World>,
    pub fs: Arc<dyn Fs>,
}

/// A builtin that constructs fact streams. The constructor arguments must
/// be static (known at graph build time).
pub trait FactDef: Send + Sync {
    fn name(&self) -> &'static str;

    /// Signature of the constructor call; `None` rejects the arity.
    fn signature(&self, arity: usize) -> Option<Type>;

    fn make(&self, args: &[Value], rt: &FactRuntime) -> anyhow::Result<Box<dyn FactStream>>;
}

/// A running fact. `run` blocks, pushing values until cancellation; it
/// must send its first value promptly so the engine can report loaded.
pub trait FactStream: Send {
    fn run(self: Box<Self>, tx: Sender<anyhow::Result<Value>>, ctx: &Context);
}

#[derive(Clone)]
pub enum FuncEntry {
    Pure(Arc<dyn PureFunc>),
    Fact(Arc<dyn FactDef>),
}

/// The builtin lookup table, keyed by dotted name.
pub struct FuncRegistry {
    entries: HashMap<&'static str, FuncEntry>,
}

impl FuncRegistry {
    pub fn with_defaults() -> Self {
        let mut entries: HashMap<&'static str, FuncEntry> = HashMap::new();
        let pures: Vec<Arc<dyn PureFunc>> = vec![
            Arc::new(Printf),
            Arc::new(ToLower),
            Arc::new(ToUpper),
            Arc::new(Len),
        ];
        for p in pures {
            entries.insert(p.name(), FuncEntry::Pure(p));
        }
        let facts: Vec<Arc<dyn FactDef>> = vec![
            Arc::new(Hostname),
            Arc::new(DateTimeNow),
            Arc::new(ReadFile),
            Arc::new(GetVal),
        ];
        for f in facts {
            entries.insert(f.name(), FuncEntry::Fact(f));
        }
        Self { entries }
    }

    pub fn lookup(&self, name: &str) -> Option<&FuncEntry> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }
}

// Pure builtins.

struct Printf;

impl PureFunc for Printf {
    fn name(&self) -> &'static str {
        "fmt.printf"
    }

    fn signature(&self, arity: usize, fresh: &mut dyn FnMut() -> Type) -> Option<Type> {
        if arity == 0 {
            return None;
        }
        let mut args = vec![("format".to_string(), Type::Str)];
        for i in 1..arity {
            args.push((format!("a{i}"), fresh()));
        }
        Some(Type::Func(args, Box::new(Type::Str)))
    }

    fn call(&self, args: &[Value]) -> anyhow::Result<Value> {
        let Some(Value::Str(format)) = args.first() else {
            anyhow::bail!("printf needs a format string");
        };
        let mut rest = args[1..].iter();
        let mut out = String::new();
        let mut chars = format.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            let Some(verb) = chars.next() else {
                anyhow::bail!("format string ends with a bare `%`");
            };
            if verb == '%' {
                out.push('%');
                continue;
            }
            let Some(arg) = rest.next() else {
                anyhow::bail!("not enough arguments for format `{format}`");
            };
            match (verb, arg) {
                ('s', Value::Str(s)) => out.push_str(s),
                ('d', Value::Int(i)) => out.push_str(&i.to_string()),
                ('f', Value::Float(f)) => out.push_str(&format!("{f:?}")),
                ('t', Value::Bool(b)) => out.push_str(&b.to_string()),
                ('v', v) => out.push_str(&v.to_string()),
                (verb, arg) => {
                    anyhow::bail!("format verb `%{verb}` does not accept {arg}")
                }
            }
        }
        if rest.next().is_some() {
            anyhow::bail!("too many arguments for format `{format}`");
        }
        Ok(Value::Str(out))
    }
}

struct ToLower;

impl PureFunc for ToLower {
    fn name(&self) -> &'static str {
        "strings.to_lower"
    }

    fn signature(&self, arity: usize, _fresh: &mut dyn FnMut() -> Type) -> Option<Type> {
        (arity == 1).then(|| Type::Func(vec![("s".to_string(), Type::Str)], Box::new(Type::Str)))
    }

    fn call(&self, args: &[Value]) -> anyhow::Result<Value> {
        match args {
            [Value::Str(s)] => Ok(Value::Str(s.to_lowercase())),
            _ => anyhow::bail!("to_lower needs one string"),
        }
    }
}

struct ToUpper;

impl PureFunc for ToUpper {
    fn name(&self) -> &'static str {
        "strings.to_upper"
    }

    fn signature(&self, arity: usize, _fresh: &mut dyn FnMut() -> Type) -> Option<Type> {
        (arity == 1).then(|| Type::Func(vec![("s".to_string(), Type::Str)], Box::new(Type::Str)))
    }

    fn call(&self, args: &[Value]) -> anyhow::Result<Value> {
        match args {
            [Value::Str(s)] => Ok(Value::Str(s.to_uppercase())),
            _ => anyhow::bail!("to_upper needs one string"),
        }
    }
}

struct Len;

impl PureFunc for Len {
    fn name(&self) -> &'static str {
        "len"
    }

    fn signature(&self, arity: usize, fresh: &mut dyn FnMut() -> Type) -> Option<Type> {
        (arity == 1).then(|| Type::Func(vec![("of".to_string(), fresh())], Box::new(Type::Int)))
    }

    fn check_arg_types(&self, args: &[Type]) -> Result<(), String> {
        match args {
            [Type::Str | Type::List(_) | Type::Map(_, _)] => Ok(()),
            [other] => Err(format!("len is not defined for `{other}`")),
            _ => Err("len needs one argument".to_string()),
        }
    }

    fn call(&self, args: &[Value]) -> anyhow::Result<Value> {
        let n = match args {
            [Value::Str(s)] => s.chars().count(),
            [Value::List(l)] => l.len(),
            [Value::Map(m)] => m.len(),
            _ => anyhow::bail!("len is not defined for this value"),
        };
        Ok(Value::Int(n as i64))
    }
}

// Facts.

struct Hostname;

impl FactDef for Hostname {
    fn name(&self) -> &'static str {
        "sys.hostname"
    }

    fn signature(&self, arity: usize) -> Option<Type> {
        (arity == 0).then(|| Type::Func(vec![], Box::new(Type::Str)))
    }

    fn make(&self, _args: &[Value], rt: &FactRuntime) -> anyhow::Result<Box<dyn FactStream>> {
        Ok(Box::new(HostnameStream {
            hostname: rt.world.hostname(),
        }))
    }
}

struct HostnameStream {
    hostname: String,
}

impl FactStream for HostnameStream {
    fn run(self: Box<Self>, tx: Sender<anyhow::Result<Value>>, ctx: &Context) {
        let _ = tx.send(Ok(Value::Str(self.hostname)));
        // The hostname does not change over a run; just park until
        // shutdown.
        while !ctx.sleep(Duration::from_secs(1)) {}
    }
}

struct DateTimeNow;

impl FactDef for DateTimeNow {
    fn name(&self) -> &'static str {
        "datetime.now"
    }

    fn signature(&self, arity: usize) -> Option<Type> {
        (arity == 0).then(|| Type::Func(vec![], Box::new(Type::Int)))
    }

    fn make(&self, _args: &[Value], _rt: &FactRuntime) -> anyhow::Result<Box<dyn FactStream>> {
        Ok(Box::new(DateTimeNowStream))
    }
}

struct DateTimeNowStream;

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl FactStream for DateTimeNowStream {
    fn run(self: Box<Self>, tx: Sender<anyhow::Result<Value>>, ctx: &Context) {
        loop {
            if tx.send(Ok(Value::Int(unix_now()))).is_err() {
                return;
            }
            if ctx.sleep(Duration::from_secs(1)) {
                return;
            }
        }
    }
}

struct ReadFile;

impl FactDef for ReadFile {
    fn name(&self) -> &'static str {
        "os.readfile"
    }

    fn signature(&self, arity: usize) -> Option<Type> {
        (arity == 1).then(|| Type::Func(vec![("path".to_string(), Type::Str)], Box::new(Type::Str)))
    }

    fn make(&self, args: &[Value], rt: &FactRuntime) -> anyhow::Result<Box<dyn FactStream>> {
        let [Value::Str(path)] = args else {
            anyhow::bail!("os.readfile needs one static path argument");
        };
        Ok(Box::new(ReadFileStream {
            fs: rt.fs.clone(),
            path: Utf8PathBuf::from(path),
        }))
    }
}

struct ReadFileStream {
    fs: Arc<dyn Fs>,
    path: Utf8PathBuf,
}

impl ReadFileStream {
    fn read(&self) -> anyhow::Result<Value> {
        let bytes = self.fs.open(&self.path)?;
        Ok(Value::Str(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Poll loop used when no native watcher is available. Re-reads on a
    /// short interval and only reports when the content hash moves.
    fn poll(self, tx: Sender<anyhow::Result<Value>>, ctx: &Context) {
        let mut last = self.fs.content_hash(&self.path).ok();
        loop {
            if ctx.sleep(Duration::from_millis(500)) {
                return;
            }
            let current = self.fs.content_hash(&self.path).ok();
            if current != last {
                last = current;
                if tx.send(self.read()).is_err() {
                    return;
                }
            }
        }
    }
}

impl FactStream for ReadFileStream {
    #[cfg(feature = "live")]
    fn run(self: Box<Self>, tx: Sender<anyhow::Result<Value>>, ctx: &Context) {
        use notify::RecursiveMode;
        use notify_debouncer_full::new_debouncer;

        if tx.send(self.read()).is_err() {
            return;
        }

        // The notify backend only understands the real filesystem; other
        // backends fall back to hash polling.
        if self.fs.uri() != "file://" {
            return self.poll(tx, ctx);
        }

        let (ev_tx, ev_rx) = std::sync::mpsc::channel();
        let mut debouncer = match new_debouncer(Duration::from_millis(250), None, ev_tx) {
            Ok(d) => d,
            Err(e) => {
                let _ = tx.send(Err(e.into()));
                return;
            }
        };
        // Watch the parent so atomic renames are caught.
        let watch_root = self.path.parent().unwrap_or(&self.path).as_std_path();
        if let Err(e) = debouncer.watch(watch_root, RecursiveMode::NonRecursive) {
            let _ = tx.send(Err(e.into()));
            return;
        }

        loop {
            match ev_rx.recv_timeout(Duration::from_millis(250)) {
                Ok(Ok(events)) => {
                    let relevant = events.iter().any(|e| {
                        e.event
                            .paths
                            .iter()
                            .any(|p| p.as_path() == self.path.as_std_path())
                    });
                    if relevant && tx.send(self.read()).is_err() {
                        return;
                    }
                }
                Ok(Err(errors)) => {
                    tracing::warn!("file watch errors on {}: {errors:?}", self.path);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
            }
            if ctx.is_cancelled() {
                return;
            }
        }
    }

    #[cfg(not(feature = "live"))]
    fn run(self: Box<Self>, tx: Sender<anyhow::Result<Value>>, ctx: &Context) {
        if tx.send(self.read()).is_err() {
            return;
        }
        self.poll(tx, ctx);
    }
}

struct GetVal;

impl FactDef for GetVal {
    fn name(&self) -> &'static str {
        "world.getval"
    }

    fn signature(&self, arity: usize) -> Option<Type> {
        (arity == 1).then(|| Type::Func(vec![("key".to_string(), Type::Str)], Box::new(Type::Str)))
    }

    fn make(&self, args: &[Value], rt: &FactRuntime) -> anyhow::Result<Box<dyn FactStream>> {
        let [Value::Str(key)] = args else {
            anyhow::bail!("world.getval needs one static key argument");
        };
        Ok(Box::new(GetValStream {
            world: rt.world.clone(),
            key: key.clone(),
        }))
    }
}

struct GetValStream {
    world: Arc<dyn World>,
    key: String,
}

impl FactStream for GetValStream {
    fn run(self: Box<Self>, tx: Sender<anyhow::Result<Value>>, ctx: &Context) {
        let rx = self.world.kv_watch(&self.key);
        // An unset key still produces a first value so the engine can
        // report loaded; it reads as the empty string.
        let initial = self.world.kv_get(&self.key).unwrap_or_default();
        if tx.send(Ok(Value::Str(initial))).is_err() {
            return;
        }
        loop {
            match rx.recv_timeout(Duration::from_millis(250)) {
                Ok(value) => {
                    if tx.send(Ok(Value::Str(value))).is_err() {
                        return;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
            }
            if ctx.is_cancelled() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printf_formats() {
        let out = Printf
            .call(&[
                Value::Str("%s is %d%% done, %v".into()),
                Value::Str("job".into()),
                Value::Int(40),
                Value::Bool(true),
            ])
            .unwrap();
        assert_eq!(out, Value::Str("job is 40% done, true".into()));
    }

    #[test]
    fn printf_rejects_bad_verb_and_arity() {
        assert!(
            Printf
                .call(&[Value::Str("%d".into()), Value::Str("x".into())])
                .is_err()
        );
        assert!(Printf.call(&[Value::Str("%s".into())]).is_err());
        assert!(
            Printf
                .call(&[Value::Str("plain".into()), Value::Int(1)])
                .is_err()
        );
    }

    #[test]
    fn printf_signature_tracks_arity() {
        let mut n = 0u32;
        let mut fresh = || {
            n += 1;
            Type::Var(crate::types::TypeVar(n))
        };
        let Some(Type::Func(args, out)) = Printf.signature(3, &mut fresh) else {
            panic!("expected a signature");
        };
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].1, Type::Str);
        assert!(matches!(args[1].1, Type::Var(_)));
        assert_eq!(*out, Type::Str);
        assert!(Printf.signature(0, &mut fresh).is_none());
    }

    #[test]
    fn len_checks_shapes() {
        assert!(Len.check_arg_types(&[Type::Str]).is_ok());
        assert!(Len.check_arg_types(&[Type::Int]).is_err());
        assert_eq!(
            Len.call(&[Value::List(vec![Value::Int(1), Value::Int(2)])])
                .unwrap(),
            Value::Int(2)
        );
    }

    #[test]
    fn registry_has_defaults() {
        let reg = FuncRegistry::with_defaults();
        assert!(matches!(reg.lookup("fmt.printf"), Some(FuncEntry::Pure(_))));
        assert!(matches!(
            reg.lookup("sys.hostname"),
            Some(FuncEntry::Fact(_))
        ));
        assert!(reg.lookup("nope").is_none());
    }
}
