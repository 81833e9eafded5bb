#![forbid(unsafe_code, clippy::unwrap_used)]
#![allow(clippy::needless_return)]
#![warn(clippy::await_holding_lock, clippy::inefficient_to_string)]

mod builder;
mod compile;
mod condition;
mod geometry;
mod quote;

pub use builder::{AttrBuilder, all_of, any_of, attr, negate};
pub use compile::{CompileError, compile};
pub use condition::{
  Condition, ConditionError, CondValue, Leaf, LeafOp, ScalarOp, Source, SpatialOp, VarRef,
};
pub use geometry::GeometryFormat;
pub use quote::quote_literal;

/// Conventional name of the JSON context bind referenced by compiled fragments.
pub const CTX_VAR: &str = "p_ctx";
