//! The shared all-zeros buffer backing clamped child extractions.
//!
//! Extraction from malformed untrusted data must still hand back a readable
//! byte sequence whose lifetime is unbounded. A single process-wide
//! zero-filled buffer serves every such request; it grows by doubling and
//! old buffers are leaked, so a slice handed out once stays valid forever.

use std::sync::Mutex;

const MIN_SIZE: usize = 4096;

static ZEROS: Mutex<&'static [u8]> = Mutex::new(&[]);

/// Returns a zero-filled slice of exactly `len` bytes with `'static`
/// lifetime.
pub(crate) fn zeros(len: usize) -> &'static [u8] {
	let mut current = ZEROS.lock().unwrap();
	if current.len() < len {
		let new_len = len.next_power_of_two().max(MIN_SIZE);
		// The previous buffer is intentionally leaked: slices of it are
		// still referenced by values extracted earlier.
		*current = Box::leak(vec![0u8; new_len].into_boxed_slice());
	}
	&current[..len]
}
