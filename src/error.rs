use camino::Utf8PathBuf;
use thiserror::Error;

use crate::ast::Span;

/// Top-level error for the whole compile pipeline.
///
/// Each stage of the pipeline has its own error enum; this type chains them
/// so callers get a single value with the failing stage attached.
#[derive(Debug, Error)]
pub enum MclError {
    #[error("input error: {0}")]
    Input(#[from] InputError),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("scope error: {0}")]
    Scope(#[from] ScopeError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("interpret error: {0}")]
    Interpret(#[from] InterpretError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("input is empty")]
    InputEmpty,

    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("reading from stdin is not supported here")]
    StdinNotSupported,

    #[error("file not found: {0}")]
    FileNotFound(Utf8PathBuf),

    #[error("invalid metadata in `{path}`: {reason}")]
    MetadataInvalid { path: Utf8PathBuf, reason: String },

    #[error("module path `{0}` must begin and end with a slash")]
    ModulePathNotAbsolute(Utf8PathBuf),

    #[error("filesystem error on `{path}`: {source}")]
    Fs {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
#[error("{span}: {kind}")]
pub struct ParseError {
    pub span: Span,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Error)]
pub enum ParseErrorKind {
    #[error("unexpected character `{0}`")]
    UnexpectedChar(char),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("invalid escape sequence `\\{0}`")]
    InvalidEscape(char),

    #[error("invalid number literal `{0}`")]
    InvalidNumber(String),

    #[error("expected {expected}, found {found}")]
    Unexpected { expected: String, found: String },

    #[error("duplicate key in map literal")]
    DuplicateMapKey,

    #[error("duplicate field `{0}`")]
    DuplicateField(String),

    #[error("unterminated interpolation in string literal")]
    UnterminatedInterpolation,
}

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("{span}: unbound name `{name}`")]
    UnboundName { name: String, span: Span },

    #[error("cyclic import of module `{0}`")]
    CyclicImport(Utf8PathBuf),

    #[error("{span}: recursive include of class `{name}`")]
    RecursiveClass { name: String, span: Span },

    #[error("{span}: class `{name}` takes {expected} arguments, got {actual}")]
    ClassArityMismatch {
        name: String,
        expected: usize,
        actual: usize,
        span: Span,
    },

    #[error("{span}: duplicate binding of `{name}`")]
    DuplicateBinding { name: String, span: Span },

    #[error("{span}: unknown class `{name}`")]
    UnknownClass { name: String, span: Span },

    #[error("{span}: unknown import alias `{name}`")]
    UnknownImport { name: String, span: Span },

    #[error("failed to load module `{path}`: {source}")]
    ModuleLoad {
        path: Utf8PathBuf,
        #[source]
        source: Box<MclError>,
    },

    #[error("module download failed for `{path}`: {reason}")]
    Download { path: String, reason: String },

    #[error("{span}: fact `{name}` cannot be used inside a function literal")]
    FactInFunc { name: String, span: Span },
}

#[derive(Debug, Error)]
pub enum TypeError {
    #[error("{span}: type mismatch: expected `{expected}`, found `{actual}`")]
    Mismatch {
        expected: String,
        actual: String,
        span: Span,
    },

    #[error("{span}: ambiguous type: cannot infer a concrete type")]
    AmbiguousType { span: Span },

    #[error("{span}: operator `{op}` is not defined for `{typ}`")]
    BadOperand { op: String, typ: String, span: Span },

    #[error("{span}: unknown resource kind `{kind}`")]
    UnknownKind { kind: String, span: Span },

    #[error("{span}: resource kind `{kind}` has no field `{field}`")]
    UnknownField {
        kind: String,
        field: String,
        span: Span,
    },

    #[error("{span}: value {value} overflows field `{field}` ({lo}..={hi})")]
    IntOutOfRange {
        field: String,
        value: i64,
        lo: i64,
        hi: i64,
        span: Span,
    },

    #[error("unknown unification strategy `{0}`")]
    UnknownStrategy(String),
}

#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("{span}: duplicate resource {kind}[{name}] is not compatible")]
    IncompatibleDuplicate {
        kind: String,
        name: String,
        span: Span,
    },

    #[error("{span}: edge endpoint {kind}[{name}] not found")]
    EdgeEndpointMissing {
        kind: String,
        name: String,
        span: Span,
    },

    #[error("{span}: resource {kind}[{name}] does not send field `{field}`")]
    MissingSendField {
        kind: String,
        name: String,
        field: String,
        span: Span,
    },

    #[error("{span}: resource {kind}[{name}] cannot receive on field `{field}`")]
    MissingRecvField {
        kind: String,
        name: String,
        field: String,
        span: Span,
    },

    #[error(
        "{span}: send field `{send}` ({send_type}) is incompatible with recv field `{recv}` ({recv_type})"
    )]
    SendRecvTypeMismatch {
        send: String,
        send_type: String,
        recv: String,
        recv_type: String,
        span: Span,
    },

    #[error("{span}: both or neither of send and recv must be set on an edge")]
    SendRecvMismatch { span: Span },

    #[error("{span}: recv field `{field}` of {kind}[{name}] already has a send source")]
    RecvAlreadyWired {
        kind: String,
        name: String,
        field: String,
        span: Span,
    },

    #[error("resource graph contains a cycle through {kind}[{name}]")]
    ResourceCycle { kind: String, name: String },

    #[error("{span}: unknown resource kind `{kind}`")]
    UnknownKind { kind: String, span: Span },

    #[error("{span}: {reason}")]
    InvalidResource { reason: String, span: Span },

    #[error("{span}: evaluation failed: {reason}")]
    Eval { reason: String, span: Span },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("function graph is not a DAG")]
    NotDag,

    #[error("fact `{name}` failed to start: {reason}")]
    FactInit { name: String, reason: String },

    #[error("fact `{name}` failed: {reason}")]
    FactRun { name: String, reason: String },

    #[error("function `{name}` failed: {reason}")]
    FuncRun { name: String, reason: String },

    #[error("value table is missing a value for `{name}`")]
    TableInconsistent { name: String },

    #[error("{span}: fact arguments must be static")]
    FactArgNotStatic { span: Span },

    #[error("graph transaction error: {0}")]
    Txn(String),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("init called twice")]
    DoubleInit,

    #[error("not initialized")]
    NotInitialized,

    #[error("interpret called before the engine loaded")]
    InterpretBeforeLoad,

    #[error("stream already taken")]
    StreamTaken,
}
