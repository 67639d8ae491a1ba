//! Constrained construction of container values.
//!
//! A [`Builder`] records the container kind, the expected element type
//! (when the requested type fixes one), the element type inferred from the
//! first child added (when it does not), the permitted child-count range
//! and the growing child list. Builders nest through [`Builder::open`] /
//! [`Builder::close`]. Misuse (adding a mismatched child, closing with
//! too few children, ending with nothing to infer from) is a programming
//! error and panics.

use crate::typeinfo::TypeInfo;
use crate::value::Value;

struct Frame {
	info: TypeInfo,
	/// Element type inferred from the first child added, used when `info`
	/// leaves the element indefinite.
	inferred: Option<TypeInfo>,
	min: usize,
	max: usize,
	children: Vec<Value>,
}

impl Frame {
	fn new(info: &TypeInfo) -> Frame {
		let (min, max) = if info.is_array() {
			(0, usize::MAX)
		} else if info.is_maybe() {
			(0, 1)
		} else if info.is_variant() {
			(1, 1)
		} else if info.is_dict_entry() {
			(2, 2)
		} else if info.is_definite() {
			// Definite tuple.
			(info.n_items(), info.n_items())
		} else {
			// The indefinite tuple `r`.
			(0, usize::MAX)
		};
		Frame {
			info: info.clone(),
			inferred: None,
			min,
			max,
			children: Vec::new(),
		}
	}

	/// The type pattern the next child must match, if the container
	/// constrains it.
	fn expected(&self) -> Option<TypeInfo> {
		if self.info.is_array() || self.info.is_maybe() {
			let element = self.info.element();
			if element.is_definite() {
				Some(element.clone())
			} else {
				self.inferred.clone().or_else(|| Some(element.clone()))
			}
		} else if self.info.is_dict_entry() {
			match self.children.len() {
				0 => Some(self.info.key().clone()),
				_ => Some(self.info.value().clone()),
			}
		} else if self.info.is_variant() {
			None
		} else if self.info.is_definite() {
			(self.children.len() < self.info.n_items())
				.then(|| self.info.item(self.children.len()).clone())
		} else {
			None
		}
	}

	fn check_add(&self, value: &Value) -> bool {
		if self.children.len() >= self.max {
			return false;
		}
		match self.expected() {
			Some(pattern) => value.type_info().matches(&pattern),
			None => true,
		}
	}

	fn check_end(&self) -> bool {
		if self.children.len() < self.min {
			return false;
		}
		// An empty container with nothing to pin the element type down
		// cannot be ended.
		if (self.info.is_array() || self.info.is_maybe())
			&& !self.info.element().is_definite()
			&& self.inferred.is_none()
		{
			return false;
		}
		true
	}

	fn end(self) -> Value {
		assert!(
			self.children.len() >= self.min,
			"ending {} builder with {} of {} required children",
			self.info,
			self.children.len(),
			self.min
		);
		let info = if self.info.is_definite() {
			self.info
		} else if self.info.is_array() || self.info.is_maybe() {
			let element = if self.info.element().is_definite() {
				self.info.element().clone()
			} else {
				self.inferred.unwrap_or_else(|| {
					panic!("cannot infer the element type of an empty {}", self.info)
				})
			};
			if self.info.is_array() {
				TypeInfo::array(element)
			} else {
				TypeInfo::maybe(element)
			}
		} else if self.info.is_dict_entry() {
			TypeInfo::dict_entry(
				self.children[0].type_info().clone(),
				self.children[1].type_info().clone(),
			)
		} else {
			// The indefinite tuple: the children fix the item types.
			TypeInfo::tuple(self.children.iter().map(|c| c.type_info().clone()))
		};
		Value::tree(info, self.children)
	}
}

/// Ephemeral construction aid for container values.
pub struct Builder {
	stack: Vec<Frame>,
}

impl Builder {
	/// Starts building a container of type `info`.
	///
	/// `info` may be indefinite (`av`, `a*`, `r`, `m*`, ...) as long as it
	/// is a container form; the children added pin the result type down.
	///
	/// # Panics
	///
	/// Panics if `info` is not a container type.
	#[must_use]
	pub fn new(info: &TypeInfo) -> Builder {
		assert!(
			info.is_container() || info.is_tuple(),
			"builder for non-container type {info}"
		);
		Builder {
			stack: vec![Frame::new(info)],
		}
	}

	fn current(&self) -> &Frame {
		self.stack.last().expect("builder with no open frame")
	}

	fn current_mut(&mut self) -> &mut Frame {
		self.stack.last_mut().expect("builder with no open frame")
	}

	/// Whether `value` could be added next without panicking.
	#[must_use]
	pub fn check_add(&self, value: &Value) -> bool {
		self.current().check_add(value)
	}

	/// Adds a child, consuming it.
	///
	/// # Panics
	///
	/// Panics if the container is full or the child's type does not match
	/// the expected element type.
	pub fn add_value(&mut self, value: Value) {
		let frame = self.current_mut();
		assert!(
			frame.check_add(&value),
			"cannot add value of type {} to {} builder with {} children",
			value.type_info(),
			frame.info,
			frame.children.len()
		);
		if frame.inferred.is_none() {
			frame.inferred = Some(value.type_info().clone());
		}
		frame.children.push(value);
	}

	/// Opens a nested container; children added next go to it until
	/// [`Builder::close`].
	pub fn open(&mut self, info: &TypeInfo) {
		assert!(
			info.is_container() || info.is_tuple(),
			"cannot open non-container type {info}"
		);
		self.stack.push(Frame::new(info));
	}

	/// Closes the innermost [`Builder::open`], adding the finished child
	/// to its parent.
	///
	/// # Panics
	///
	/// Panics if no nested container is open.
	pub fn close(&mut self) {
		assert!(self.stack.len() > 1, "close() without a matching open()");
		let frame = self.stack.pop().expect("checked above");
		self.add_value(frame.end());
	}

	/// Whether [`Builder::end`] would succeed.
	#[must_use]
	pub fn check_end(&self) -> bool {
		self.stack.len() == 1 && self.current().check_end()
	}

	/// Finishes construction, producing the container value.
	///
	/// # Panics
	///
	/// Panics if a nested container is still open, if too few children
	/// were added, or if an empty container's element type cannot be
	/// inferred.
	#[must_use]
	pub fn end(mut self) -> Value {
		assert!(self.stack.len() == 1, "end() with a nested container still open");
		self.stack.pop().expect("checked above").end()
	}

	/// Abandons construction, releasing all children added so far.
	pub fn cancel(self) {}
}
