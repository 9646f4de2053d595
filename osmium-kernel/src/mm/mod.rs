//! Memory management
//!
//! The page facade over the external frame allocator, the typed object
//! caches built on the slab pool, and the per-process address space.

pub mod kcache;
pub mod page;
pub mod vm;

pub use kcache::{KBox, KCache};
pub use page::{KernelPages, PageBox};
pub use vm::{VmFlags, VmSpace};
