// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A generational handle table with O(1) create, validate and delete.
//!
//! Objects are named by packed 32-bit [`Handle`] values instead of owning
//! references. The table stores objects in fixed-capacity *chunks* backed by
//! a reserve/commit [`vmem::Arena`]; each chunk keeps a *dense* array packing
//! the live handles into its prefix and a *state* array mapping slot indices
//! back to dense positions. Deleting a slot bumps its generation so stale
//! handles fail validation instead of aliasing a recycled slot.

mod handle;
mod table;

pub use handle::{Handle, MAX_GENERATIONS, MAX_NAMESPACE, Namespace};
pub use table::{
    CHUNK_CAPACITY, HandleTable, MAX_CHUNKS, MAX_OBJECTS, TableError, TableFlags, TableInit,
};
