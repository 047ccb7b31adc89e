// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shim that swaps the synchronization primitives used by the parking layer
//! for loom's checked versions under `cfg(loom)`.
//!
//! Only the park/unpark handshake is modeled; the rings and task slots live
//! in raw pool memory and use `core::sync::atomic` directly.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(loom)] {
        pub use loom::sync;
        pub use loom::thread;
        pub use loom::model;
    } else {
        pub mod sync {
            pub use std::sync::*;
        }

        #[cfg(test)]
        pub use std::thread;

        #[cfg(test)]
        #[inline(always)]
        pub fn model<R>(f: impl FnOnce() -> R) -> R {
            f()
        }
    }
}
