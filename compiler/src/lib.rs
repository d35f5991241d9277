//! PTX generation library for the cuflame fractal renderer.
//!
//! GPU kernels here are assembled from small reusable fragments rather
//! than written as monolithic source files, without giving up the
//! performance of a single hand-written module: fragments share registers
//! through lexically scoped namespaces instead of true assembly calls.
//! This crate implements the composition engine:
//! - dependency resolution and ordering between fragments
//! - scope tracking for symbols that cross fragment-function boundaries
//! - the module lifecycle, including bounded recompilation
//! - statement representation and rendering to PTX text

pub mod cache;
pub mod context;
pub mod error;
pub mod format;
pub mod fragment;
pub mod module;
pub mod resolve;
pub mod scope;
pub mod stmt;
pub mod symbol;

pub use cache::{CachedModule, ModuleCache};
pub use context::{EmitContext, Guard, Op};
pub use error::AsmError;
pub use format::Formatter;
pub use fragment::{Entry, EntryHandle, Fragment, FragmentHandle, FragmentKind};
pub use module::{BuildOptions, ModuleBuilder, PtxModule};
pub use stmt::{addr, vec_operand, Atom, Statement};
pub use symbol::{ArraySpec, Deferred, Value};
