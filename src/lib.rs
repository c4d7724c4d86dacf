#![deny(
    unsafe_code,
    // clippy::unwrap_used,
    // clippy::expect_used,
    clippy::panic,
)]

//! The front end of the mcl reactive configuration language.
//!
//! Source text goes in; a live, continuously re-emitted resource graph
//! comes out. The pipeline: input resolution → lex/parse → string
//! interpolation → scope construction (imports, classes, bindings) →
//! type unification → function-graph construction. After that the
//! [`engine`] keeps the program running: facts (hostname, clock, file
//! content, KV entries) push values over time, and every coherent
//! snapshot can be interpreted into a fresh [`interpret::ResourceGraph`]
//! for the convergence engine to consume.
//!
//! ```rust
//! use std::sync::Arc;
//! use mcl::{Lang, LangConfig, engine::Context};
//!
//! let fs = Arc::new(mcl::fs::MemFs::new());
//! let world = Arc::new(mcl::world::LocalWorld::with_hostname("host1"));
//! let mut lang = Lang::new(LangConfig::new("noop \"n1\" {}", fs, world));
//! lang.init().unwrap();
//!
//! let stream = lang.stream().unwrap();
//! let ctx = Context::new();
//! std::thread::scope(|s| {
//!     let lang = &lang;
//!     let run_ctx = ctx.clone();
//!     s.spawn(move || lang.run(&run_ctx).unwrap());
//!     stream.recv().unwrap().unwrap();
//!     let graph = lang.interpret().unwrap();
//!     assert_eq!(graph.node_count(), 1);
//!     ctx.cancel();
//! });
//! ```

pub mod ast;
pub mod engine;
pub mod error;
pub mod eval;
pub mod fs;
pub mod funcs;
pub mod input;
pub mod interpolate;
pub mod interpret;
pub mod lang;
pub mod parse;
pub mod resources;
pub mod scope;
pub mod types;
pub mod value;
pub mod world;

pub use camino;

pub use crate::error::MclError;
pub use crate::lang::{Lang, LangConfig};
pub use crate::types::Type;
pub use crate::value::Value;

/// Installs a `tracing` subscriber honoring `RUST_LOG`, for embedders
/// that do not bring their own.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*, registry};

    registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
}
