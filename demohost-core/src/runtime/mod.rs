//! Wasmtime-backed runtime glue for demohost-core.
//!
//! Responsibilities:
//! - Create a Wasmtime `Engine` with the proposal features guests commonly rely on.
//! - Provide the host import namespace (`libm`) the demos module links against.
//!
//! Linking, instantiation and entrypoint resolution live in `crate::loader` and
//! `crate::abi`.

pub mod imports;
pub mod runtime;

pub use imports::libm_namespace;
pub use runtime::new_engine;
