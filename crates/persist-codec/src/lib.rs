//! persist-codec — value model and graph-preserving codec for persisted
//! observable state.
//!
//! Observables hold a dynamic [`Value`]. Plain JSON cannot carry everything
//! a value may contain: maps and sets that must stay distinct from objects
//! and arrays, dates, regular expressions, and nodes that are shared
//! between several parents or that point back at themselves. The
//! [`GraphCodec`] encodes all of these into JSON text and restores them,
//! including node identity.
//!
//! The codec sits behind the [`Codec`] trait so callers can swap it out.

pub mod error;
pub mod graph;
pub mod value;

pub use error::{CodecError, CodecResult};
pub use graph::{Codec, GraphCodec, MAX_DEPTH};
pub use value::{SharedValue, Value};
