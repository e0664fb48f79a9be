//! The two-tier execution engine and compilation cache for the Avail
//! programming language.
//!
//! Avail source is compiled (elsewhere) to Level One nybblecodes: a
//! compact, stack-based instruction set over first-class, reifiable
//! continuations. This crate interprets Level One directly, and, once a
//! raw function's invocation countdown runs out, retranslates it into a
//! register-based Level Two chunk with primitive inlining, constant
//! folding, move elimination and dead-code removal. Method redefinition
//! invalidates every chunk whose inlining decisions it could change.
//! Compiled modules and their dependency digests persist in a
//! content-addressed repository, so rebuilds touch only what changed.
//!
//! The major pieces:
//!
//! - [`types::value`] and [`types::ty`]: the value model and the type
//!   lattice.
//! - [`types::code`]: raw functions, nybblecodes, continuations.
//! - [`primitive`]: the primitive framework and registry.
//! - [`runtime`]: methods, chunks, fibers, executors.
//! - [`interpreter`]: the Level One and Level Two stepping core.
//! - [`build_l2`] and [`l2_opt`]: the translator and optimiser.
//! - [`repository`] and [`serializer`]: the persistent compilation cache.
//! - [`config`]: the builder-facing configuration surface.

#![warn(missing_docs)]

pub mod build_l2;
pub mod config;
pub mod interpreter;
pub mod l2_opt;
pub mod primitive;
pub mod repository;
pub mod runtime;
pub mod serializer;
pub mod types;

pub use crate::runtime::Runtime;
pub use crate::types::ty::Ty;
pub use crate::types::value::Value;
