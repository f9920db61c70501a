//! A managed-bytecode runtime for UAL, the stack-oriented intermediate
//! language described by the module format in [`raw::module`]: a loader, a
//! verifier that doubles as an IR builder, and a tree-walking code
//! generator targeting an abstract [`emitter::Emitter`] backend.
//!
//! The pipeline, leaf modules first:
//! `raw` (bounds-checked byte decoding) -> `module` (classes and methods,
//! compiled lazily) -> `verifier` (typed abstract interpretation into
//! `ir::IrGraph`) -> `codegen` (IR to `emitter::Emitter` calls) ->
//! `invoker` (entry-point hunt and call dispatch). `context::Runtime` ties
//! the type table, ABI registry, and GC together across all of it.

pub mod abi;
pub mod codegen;
pub mod constant_pool;
pub mod context;
pub mod emitter;
pub mod errors;
pub mod gc;
pub mod invoker;
pub mod ir;
pub mod module;
pub mod object_model;
pub mod opcode;
pub mod raw;
pub mod types;
pub(crate) mod utilities;
pub mod verifier;
