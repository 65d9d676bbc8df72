//! # rscx-value
//!
//! Dynamic value model for rscx.
//!
//! This crate provides:
//! - The tagged [`Value`] type used for all state machine data
//! - Mutable [`Object`] and [`Array`] containers shared by reference
//! - A one-way access lattice (`Writable < ReadOnly < Constant`)
//! - Cycle-safe deep cloning and cycle-rejecting serialization

pub mod access;
pub mod array;
pub mod error;
pub mod object;
pub mod value;

pub use access::Access;
pub use array::Array;
pub use error::ValueError;
pub use object::{ChangeAction, ChangeHandler, Descriptor, Object};
pub use value::Value;

use std::collections::HashMap;

/// Tracks containers that were already cloned during a single deep clone.
///
/// Keys are container addresses, so self-referential graphs terminate and the
/// clone keeps the same reference topology as the source.
#[derive(Default)]
pub(crate) struct CloneMap {
    objects: HashMap<usize, Object>,
    arrays: HashMap<usize, Array>,
}
