pub mod enum_tag;
pub mod host;
mod interp;
pub mod metadata;
mod reader;
pub mod resolve;

pub use enum_tag::*;
pub use host::{HeapObject, HostOps, UnownedSlot, WeakSlot};
pub use interp::*;
pub use metadata::{TypeDesc, ValueBuffer, WitnessTable};
pub use resolve::sk_resolve_resilient_accessors;

#[cfg(test)]
pub(crate) mod test_util;
