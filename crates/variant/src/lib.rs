//! Self-normalising, copy-on-share variant values for the D-Bus type
//! system.
//!
//! The engine owns arbitrary trees of typed values that can be built in
//! memory, flattened to a wire-compatible byte sequence, deserialised
//! lazily from untrusted bytes, and byte-swapped on demand. Values carry
//! a monotonic lattice of state bits behind a per-value lock; malformed
//! untrusted input is clamped to safe defaults instead of surfacing
//! errors, while API misuse panics.

mod builder;
mod format;
mod iter;
mod marshal;
mod state;
mod typeinfo;
mod value;
mod zeros;

pub use builder::Builder;
pub use format::{build, extract, scan, scan_type, Arg, Sink};
pub use iter::ValueIter;
pub use marshal::object_path_is_valid;
pub use typeinfo::{parse_signature, signature_is_valid, Basic, InvalidTypeString, TypeInfo};
pub use value::{Class, LoadFlags, Value};
