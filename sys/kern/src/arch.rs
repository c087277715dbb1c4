// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, tailored for the current target. Each
//! architecture support module must define the same set of names: the
//! `SavedState` register record, the user-memory copy primitives, the
//! interrupt controller mask operations, and the `klog!` macro.
//!
//! Bare-metal ports additionally own trap entry, context switch, the timer,
//! and the idle loop; none of that appears in the portable kernel, which
//! only ever expresses "switch away" through scheduling hints.

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        compile_error!("no bare-metal port is wired in; supply an arch module with the hosted module's interface");
    } else {
        #[macro_use]
        pub mod hosted;
        pub use hosted::*;
    }
}
