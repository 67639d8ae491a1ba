//! Lazy iteration over a container's children.

use crate::value::Value;

/// Iterates the direct children of a container value.
///
/// The iterator holds a reference to the container and produces children
/// lazily. The reference is dropped when the iterator is exhausted, or
/// earlier through [`ValueIter::cancel`].
pub struct ValueIter {
	value: Option<Value>,
	next: usize,
	len: usize,
	done: bool,
	cancelled: bool,
}

impl ValueIter {
	/// Initialises an iterator over `value`'s children.
	///
	/// # Panics
	///
	/// Panics if `value` is not a container.
	#[must_use]
	pub fn init(value: &Value) -> ValueIter {
		assert!(
			value.type_info().is_container(),
			"iterating non-container value of type {}",
			value.type_info()
		);
		let len = value.n_children();
		ValueIter {
			value: Some(value.clone()),
			next: 0,
			len,
			done: false,
			cancelled: false,
		}
	}

	/// Number of children the iterator will produce in total.
	#[must_use]
	pub fn len(&self) -> usize {
		self.len
	}

	/// Whether the container has no children.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Produces the next child, or `None` once exhausted.
	///
	/// # Panics
	///
	/// Calling again after exhaustion (without re-initialising) is a
	/// programming error and panics.
	pub fn next_value(&mut self) -> Option<Value> {
		assert!(!self.done, "iterator used past the end without re-initialising");
		if self.cancelled {
			self.done = true;
			return None;
		}
		if self.next >= self.len {
			self.done = true;
			self.value = None;
			return None;
		}
		let value = self.value.as_ref().expect("live iterator with no value");
		let child = value.child_value(self.next);
		self.next += 1;
		if self.next == self.len {
			// Exhausted: drop the container reference eagerly. The final
			// next_value() call still reports the end.
			self.value = None;
		}
		Some(child)
	}

	/// Drops the container reference early; subsequent [`ValueIter::next_value`]
	/// reports the end once.
	pub fn cancel(&mut self) {
		self.cancelled = true;
		self.value = None;
	}

	/// Whether [`ValueIter::cancel`] was called.
	#[must_use]
	pub fn was_cancelled(&self) -> bool {
		self.cancelled
	}
}
