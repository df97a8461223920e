//! Dynamic configuration lookup.
//!
//! A [`Client`] yields every constrained value stored for a key; a
//! [`Collection`] walks a precedence list of [`Constraints`] and returns the
//! first match converted to the requested type. Missing keys and values that
//! fail to convert fall back to the caller's default and are logged, never
//! surfaced as errors.

mod client;
mod collection;
mod constraints;
mod convert;

pub use client::{Client, ConstrainedValue, StaticClient};
pub use collection::{Collection, TypedConstrainedValue};
pub use constraints::{
    precedence_global, precedence_namespace, precedence_namespace_id,
    precedence_shard_id, precedence_task_queue, precedence_task_type,
    Constraints,
};
pub use convert::{
    convert_structure, parse_duration_default_seconds, ConvertError,
    FromConfigValue,
};
