//! The central value type of the engine.
//!
//! # Purpose
//!
//! - Define [`Value`]: a typed, immutable-once-shared tree or serialised
//!   byte window with a monotonic state lattice.
//! - Implement the lattice actions: size computation, serialisation,
//!   copy-to-own, in-place byteswap, normal-form verification and
//!   reconstruction.
//! - Implement the zeros policy for extraction from malformed untrusted
//!   data.
//!
//! # Mental model
//!
//! - A value is created exclusively owned; handing it to a builder or a
//!   container consumes it, and `clone()` takes an explicit strong
//!   reference. Once shared, only reads and internally-locked lattice
//!   transitions are possible.
//! - A value's payload is either a tree of children or a serialised
//!   window. The only shape transition is tree → serialised; a value's
//!   type and children are never replaced.
//! - Once a value has reached `SERIALISED | NATIVE` its bytes are frozen:
//!   the window is published once and never mutated again, so slices of
//!   it can be handed out for the value's lifetime and buffers can be
//!   shared with extracted children.
//!
//! # Invariants
//!
//! 1. State transitions are monotonic: no bit other than `LOCKED` is ever
//!    cleared. Tested by `lattice_monotonicity`.
//! 2. A container carries `TRUSTED` only if every child does.
//! 3. A serialised child's window lies inside its source buffer, which is
//!    kept alive by reference counting.
//! 4. Extraction from malformed untrusted data yields a readable
//!    zeros-buffer default, never a panic; on trusted data the same
//!    situation is a programming error and panics.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bitflags::bitflags;

use crate::marshal::{self, Order, SerialChild};
use crate::state::{self, Action, Perform, State};
use crate::typeinfo::{signature_is_valid, Basic, TypeInfo};
use crate::zeros::zeros;

bitflags! {
	/// Flags accepted by [`Value::load`] and friends.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct LoadFlags: u32 {
		/// The bytes are in little-endian order.
		const LITTLE_ENDIAN = 1 << 0;
		/// The bytes are in big-endian order.
		const BIG_ENDIAN = 1 << 1;
		/// The bytes are known to be in normal form.
		const TRUSTED = 1 << 2;
		/// Defer byteswapping until host order is actually demanded.
		const LAZY_BYTESWAP = 1 << 3;
	}
}

/// Classification of a value by the shape of its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
	Byte,
	Bool,
	Int16,
	Uint16,
	Int32,
	Uint32,
	Handle,
	Int64,
	Uint64,
	Double,
	Str,
	ObjectPath,
	Signature,
	Variant,
	Maybe,
	Array,
	Tuple,
	DictEntry,
}

/// Reference-counted byte storage behind a serialised window.
#[derive(Clone)]
enum Buffer {
	/// Bytes the engine allocated; mutable while uniquely held.
	Owned(Arc<Vec<u8>>),
	/// The eternal zeros buffer.
	Static(&'static [u8]),
	/// Caller-provided bytes released through a callback on final drop.
	External(Arc<ExternalBytes>),
}

impl Buffer {
	fn bytes(&self) -> &[u8] {
		match self {
			Buffer::Owned(data) => data,
			Buffer::Static(data) => data,
			Buffer::External(data) => &data.bytes,
		}
	}
}

struct ExternalBytes {
	bytes: Vec<u8>,
	on_release: Mutex<Option<Box<dyn FnOnce(Vec<u8>) + Send>>>,
}

impl Drop for ExternalBytes {
	fn drop(&mut self) {
		let release = self.on_release.get_mut().ok().and_then(Option::take);
		if let Some(release) = release {
			release(std::mem::take(&mut self.bytes));
		}
	}
}

/// A serialised window: a buffer and the range of it this value occupies.
#[derive(Clone)]
struct Serialised {
	buffer: Buffer,
	range: Range<usize>,
}

impl Serialised {
	fn window(&self) -> &[u8] {
		&self.buffer.bytes()[self.range.clone()]
	}
}

enum Payload {
	Tree(Vec<Value>),
	Serialised(Serialised),
}

struct ValueInner {
	info: TypeInfo,
	state: AtomicU32,
	/// Cached serialised size; meaningful once `SIZE_KNOWN` is set.
	size: AtomicUsize,
	payload: Mutex<Payload>,
	/// Published once the value reaches `SERIALISED | NATIVE`; never
	/// changes afterwards.
	frozen: OnceLock<Serialised>,
}

/// A typed value in the D-Bus type system.
///
/// Cloning takes a strong reference to shared immutable state; the clone
/// observes the same (monotonically growing) lattice state.
#[derive(Clone)]
pub struct Value(Arc<ValueInner>);

const FULLY_TRUSTED: State = State::SOURCE_TRUSTED.union(State::TRUSTED);
const BORN_NATIVE: State = State::SOURCE_NATIVE.union(State::NATIVE);
const SIZED: State = State::SIZE_KNOWN.union(State::SIZE_VALID);

impl Value {
	fn from_parts(info: TypeInfo, payload: Payload, mut bits: State, size: Option<usize>) -> Value {
		if let Some(fixed) = info.fixed_size() {
			bits |= State::FIXED_SIZE | SIZED;
			debug_assert!(size.is_none_or(|s| s == fixed));
			return Value::assemble(info, payload, bits, fixed);
		}
		if let Some(size) = size {
			bits |= State::SIZE_KNOWN;
			if bits.contains(State::SERIALISED) {
				bits |= State::SIZE_VALID;
			}
			return Value::assemble(info, payload, bits, size);
		}
		Value::assemble(info, payload, bits, 0)
	}

	fn assemble(info: TypeInfo, payload: Payload, bits: State, size: usize) -> Value {
		state::assert_valid(bits);
		Value(Arc::new(ValueInner {
			info,
			state: AtomicU32::new(bits.bits()),
			size: AtomicUsize::new(size),
			payload: Mutex::new(payload),
			frozen: OnceLock::new(),
		}))
	}

	fn serialised(info: TypeInfo, form: Serialised, bits: State) -> Value {
		let size = form.range.len();
		Value::from_parts(info, Payload::Serialised(form), bits | State::SERIALISED, Some(size))
	}

	/// Builds a tree value from children. Trust propagates up only when
	/// every child is trusted.
	pub(crate) fn tree(info: TypeInfo, children: Vec<Value>) -> Value {
		debug_assert!(info.is_definite(), "tree value with indefinite type {info}");
		let mut bits = BORN_NATIVE;
		if children.iter().all(Value::is_trusted) {
			bits |= FULLY_TRUSTED;
		}
		Value::from_parts(info, Payload::Tree(children), bits, None)
	}

	fn new_owned(info: TypeInfo, bytes: Vec<u8>, extra: State) -> Value {
		let range = 0..bytes.len();
		Value::serialised(
			info,
			Serialised {
				buffer: Buffer::Owned(Arc::new(bytes)),
				range,
			},
			BORN_NATIVE | FULLY_TRUSTED | State::INDEPENDENT | extra,
		)
	}

	/// A child backed by the eternal zeros buffer, per the zeros policy.
	///
	/// A variant window must carry a parseable signature, so types with a
	/// variant at a fixed position get canonical default bytes instead of
	/// raw zeros.
	fn zeros_value(info: &TypeInfo) -> Value {
		if zeros_window_breaks(info) {
			let bytes = default_value_bytes(info);
			return Value::new_owned(info.clone(), bytes, State::empty());
		}
		let len = marshal::default_serial_size(info);
		Value::serialised(
			info.clone(),
			Serialised {
				buffer: Buffer::Static(zeros(len)),
				range: 0..len,
			},
			BORN_NATIVE | FULLY_TRUSTED,
		)
	}

	// --- construction: basic types ---

	/// A new boolean value.
	#[must_use]
	pub fn new_boolean(value: bool) -> Value {
		Value::new_owned(TypeInfo::basic(Basic::Bool), u32::from(value).to_ne_bytes().to_vec(), State::empty())
	}

	/// A new byte value.
	#[must_use]
	pub fn new_byte(value: u8) -> Value {
		Value::new_owned(TypeInfo::basic(Basic::Byte), vec![value], State::empty())
	}

	/// A new 16-bit signed integer value.
	#[must_use]
	pub fn new_int16(value: i16) -> Value {
		Value::new_owned(TypeInfo::basic(Basic::Int16), value.to_ne_bytes().to_vec(), State::empty())
	}

	/// A new 16-bit unsigned integer value.
	#[must_use]
	pub fn new_uint16(value: u16) -> Value {
		Value::new_owned(TypeInfo::basic(Basic::Uint16), value.to_ne_bytes().to_vec(), State::empty())
	}

	/// A new 32-bit signed integer value.
	#[must_use]
	pub fn new_int32(value: i32) -> Value {
		Value::new_owned(TypeInfo::basic(Basic::Int32), value.to_ne_bytes().to_vec(), State::empty())
	}

	/// A new 32-bit unsigned integer value.
	#[must_use]
	pub fn new_uint32(value: u32) -> Value {
		Value::new_owned(TypeInfo::basic(Basic::Uint32), value.to_ne_bytes().to_vec(), State::empty())
	}

	/// A new file-handle index value.
	#[must_use]
	pub fn new_handle(value: i32) -> Value {
		Value::new_owned(TypeInfo::basic(Basic::Handle), value.to_ne_bytes().to_vec(), State::empty())
	}

	/// A new 64-bit signed integer value.
	#[must_use]
	pub fn new_int64(value: i64) -> Value {
		Value::new_owned(TypeInfo::basic(Basic::Int64), value.to_ne_bytes().to_vec(), State::empty())
	}

	/// A new 64-bit unsigned integer value.
	#[must_use]
	pub fn new_uint64(value: u64) -> Value {
		Value::new_owned(TypeInfo::basic(Basic::Uint64), value.to_ne_bytes().to_vec(), State::empty())
	}

	/// A new double-precision floating point value.
	#[must_use]
	pub fn new_double(value: f64) -> Value {
		Value::new_owned(TypeInfo::basic(Basic::Double), value.to_ne_bytes().to_vec(), State::empty())
	}

	fn string_payload(text: &str) -> Vec<u8> {
		let mut bytes = (text.len() as u32).to_ne_bytes().to_vec();
		bytes.extend_from_slice(text.as_bytes());
		bytes.push(0);
		bytes
	}

	/// A new string value.
	///
	/// # Panics
	///
	/// Panics if `text` contains an interior NUL byte.
	#[must_use]
	pub fn new_string(text: &str) -> Value {
		assert!(!text.as_bytes().contains(&0), "string value with interior NUL");
		Value::new_owned(TypeInfo::basic(Basic::Str), Value::string_payload(text), State::empty())
	}

	/// A new object-path value.
	///
	/// # Panics
	///
	/// Panics if `path` is not a well-formed object path.
	#[must_use]
	pub fn new_object_path(path: &str) -> Value {
		assert!(marshal::object_path_is_valid(path), "invalid object path {path:?}");
		Value::new_owned(TypeInfo::basic(Basic::ObjectPath), Value::string_payload(path), State::empty())
	}

	/// A new signature value.
	///
	/// # Panics
	///
	/// Panics if `signature` is not a well-formed signature.
	#[must_use]
	pub fn new_signature(signature: &str) -> Value {
		assert!(signature_is_valid(signature), "invalid signature {signature:?}");
		let mut bytes = vec![signature.len() as u8];
		bytes.extend_from_slice(signature.as_bytes());
		bytes.push(0);
		Value::new_owned(TypeInfo::basic(Basic::Signature), bytes, State::empty())
	}

	/// Boxes `child` inside a variant. The variant inherits the child's
	/// trusted-ness.
	#[must_use]
	pub fn new_variant(child: Value) -> Value {
		Value::tree(TypeInfo::variant(), vec![child])
	}

	// --- construction: from serialised bytes ---

	fn order_from_flags(flags: LoadFlags) -> Order {
		assert!(
			!flags.contains(LoadFlags::LITTLE_ENDIAN | LoadFlags::BIG_ENDIAN),
			"both byte orders requested"
		);
		let little = cfg!(target_endian = "little");
		if flags.contains(LoadFlags::LITTLE_ENDIAN) && !little {
			Order::Swapped
		} else if flags.contains(LoadFlags::BIG_ENDIAN) && little {
			Order::Swapped
		} else {
			Order::Native
		}
	}

	fn load_buffer(
		info: Option<&TypeInfo>,
		buffer: Buffer,
		range: Range<usize>,
		flags: LoadFlags,
		independent: bool,
	) -> Value {
		let Some(info) = info else {
			// Untyped bytes are a top-level variant; hand back the boxed
			// value unwrapped.
			let variant =
				Value::load_buffer(Some(&TypeInfo::variant()), buffer, range, flags, independent);
			return variant.child_value(0);
		};
		assert!(info.is_definite(), "cannot load bytes as indefinite type {info}");

		// A fixed-size type with the wrong amount of data clamps to the
		// zeros default.
		if let Some(fixed) = info.fixed_size()
			&& range.len() != fixed
		{
			return Value::zeros_value(info);
		}

		let mut bits = State::empty();
		if flags.contains(LoadFlags::TRUSTED) {
			bits |= FULLY_TRUSTED;
		}
		if independent {
			bits |= State::INDEPENDENT;
		}
		let order = Value::order_from_flags(flags);
		if order == Order::Native {
			bits |= BORN_NATIVE;
		}
		let value = Value::serialised(info.clone(), Serialised { buffer, range }, bits);
		if order == Order::Swapped && !flags.contains(LoadFlags::LAZY_BYTESWAP) {
			value.require(State::NATIVE);
		}
		value
	}

	/// Wraps `data` as a value of `info`, taking ownership of the bytes.
	///
	/// With `info` absent the bytes are interpreted as a top-level variant
	/// and the boxed value is returned unwrapped. Untrusted input is
	/// accepted and validated lazily; this never fails.
	#[must_use]
	pub fn load(info: Option<&TypeInfo>, data: Vec<u8>, flags: LoadFlags) -> Value {
		let range = 0..data.len();
		Value::load_buffer(info, Buffer::Owned(Arc::new(data)), range, flags, true)
	}

	/// Copies `data` into a fresh value of `info`.
	#[must_use]
	pub fn from_slice(info: Option<&TypeInfo>, data: &[u8], flags: LoadFlags) -> Value {
		Value::load(info, data.to_vec(), flags)
	}

	/// Wraps caller-provided bytes without copying; `on_release` receives
	/// them back when the last reference is dropped.
	#[must_use]
	pub fn from_bytes(
		info: Option<&TypeInfo>,
		data: Vec<u8>,
		flags: LoadFlags,
		on_release: impl FnOnce(Vec<u8>) + Send + 'static,
	) -> Value {
		let range = 0..data.len();
		let buffer = Buffer::External(Arc::new(ExternalBytes {
			bytes: data,
			on_release: Mutex::new(Some(Box::new(on_release))),
		}));
		Value::load_buffer(info, buffer, range, flags, false)
	}

	// --- state machinery ---

	fn state(&self) -> State {
		State::from_bits_retain(self.0.state.load(Ordering::Acquire))
	}

	/// Drives this value's state until it contains `wanted`.
	pub(crate) fn require(&self, wanted: State) {
		if self.state().contains(wanted) {
			return;
		}
		let mut payload = self.0.payload.lock().unwrap();
		self.0.state.fetch_or(State::LOCKED.bits(), Ordering::AcqRel);
		let current = self.state() - State::LOCKED;
		let mut ctx = Ctx {
			inner: &self.0,
			payload: &mut *payload,
		};
		let next = state::solve(current, wanted, &mut ctx)
			.unwrap_or_else(|| panic!("state {wanted:?} unreachable from {current:?} for {}", self.0.info));
		self.0.state.fetch_or(next.bits(), Ordering::AcqRel);
		self.0.state.fetch_and(!State::LOCKED.bits(), Ordering::AcqRel);
		state::assert_valid(self.state());
	}

	/// The frozen serialised-native form. Published at most once; the
	/// window never changes afterwards.
	fn frozen(&self) -> &Serialised {
		self.require(State::SERIALISED | State::NATIVE | State::SIZE_VALID);
		self.0.frozen.get_or_init(|| {
			let payload = self.0.payload.lock().unwrap();
			match &*payload {
				Payload::Serialised(form) => form.clone(),
				Payload::Tree(_) => unreachable!("SERIALISED state with tree payload"),
			}
		})
	}

	// --- queries ---

	/// The value's type.
	#[must_use]
	pub fn type_info(&self) -> &TypeInfo {
		&self.0.info
	}

	/// Classifies the value by its type.
	#[must_use]
	pub fn classify(&self) -> Class {
		match self.0.info.as_basic() {
			Some(Basic::Byte) => Class::Byte,
			Some(Basic::Bool) => Class::Bool,
			Some(Basic::Int16) => Class::Int16,
			Some(Basic::Uint16) => Class::Uint16,
			Some(Basic::Int32) => Class::Int32,
			Some(Basic::Uint32) => Class::Uint32,
			Some(Basic::Handle) => Class::Handle,
			Some(Basic::Int64) => Class::Int64,
			Some(Basic::Uint64) => Class::Uint64,
			Some(Basic::Double) => Class::Double,
			Some(Basic::Str) => Class::Str,
			Some(Basic::ObjectPath) => Class::ObjectPath,
			Some(Basic::Signature) => Class::Signature,
			None => {
				if self.0.info.is_variant() {
					Class::Variant
				} else if self.0.info.is_maybe() {
					Class::Maybe
				} else if self.0.info.is_array() {
					Class::Array
				} else if self.0.info.is_dict_entry() {
					Class::DictEntry
				} else {
					Class::Tuple
				}
			}
		}
	}

	/// Whether the bytes are known to be in normal form, without doing
	/// any work to find out.
	#[must_use]
	pub fn is_trusted(&self) -> bool {
		self.state().contains(State::TRUSTED)
	}

	/// Runs the byte-level normal-form check. A passing check is
	/// remembered: the value becomes trusted.
	#[must_use]
	pub fn is_normal(&self) -> bool {
		if self.is_trusted() {
			return true;
		}
		let normal = marshal::is_normal(&self.0.info, self.frozen().window());
		if normal {
			self.0
				.state
				.fetch_or((State::BECAME_TRUSTED | State::TRUSTED).bits(), Ordering::AcqRel);
			state::assert_valid(self.state());
		}
		normal
	}

	/// The serialised size in bytes.
	#[must_use]
	pub fn size(&self) -> usize {
		self.require(State::SIZE_KNOWN);
		self.0.size.load(Ordering::Acquire)
	}

	/// The serialised bytes in host order. Forces [`Value::flatten`].
	#[must_use]
	pub fn data(&self) -> &[u8] {
		self.frozen().window()
	}

	/// Writes the serialised form into `dest`.
	///
	/// # Panics
	///
	/// Panics unless `dest.len()` equals [`Value::size`].
	pub fn store(&self, dest: &mut [u8]) {
		let window = self.data();
		assert_eq!(dest.len(), window.len(), "store() destination size mismatch");
		dest.copy_from_slice(window);
	}

	/// Forces the serialised-native form; afterwards [`Value::data`] and
	/// child extraction are O(1).
	pub fn flatten(&self) {
		let _ = self.frozen();
	}

	// --- children ---

	/// Number of direct children: 1 for a variant, 0 or 1 for a maybe, N
	/// for arrays and tuples, 2 for a dict entry, 0 for basics.
	#[must_use]
	pub fn n_children(&self) -> usize {
		{
			let payload = self.0.payload.lock().unwrap();
			if let Payload::Tree(children) = &*payload {
				return children.len();
			}
		}
		marshal::n_children(&self.0.info, self.frozen().window(), Order::Native)
	}

	/// The declared type for child `index`, when the type alone fixes it.
	fn declared_child_type(&self, index: usize) -> Option<TypeInfo> {
		let info = &self.0.info;
		if info.is_array() || info.is_maybe() {
			Some(info.element().clone())
		} else if info.is_tuple() || info.is_dict_entry() {
			(index < info.n_items()).then(|| info.item(index).clone())
		} else {
			// Variant: the child type lives in the serialised data.
			None
		}
	}

	/// Returns child `index`.
	///
	/// On a tree this takes a reference to the stored child. On a
	/// serialised value this materialises a child sharing this value's
	/// buffer; malformed or out-of-range extraction from an untrusted
	/// value is clamped to the zeros default.
	///
	/// # Panics
	///
	/// Panics when the value is not a container, when a tree or trusted
	/// index is out of range, or when a tuple index is out of range.
	#[must_use]
	pub fn child_value(&self, index: usize) -> Value {
		assert!(self.0.info.is_container(), "child_value() on non-container {}", self.0.info);
		{
			let payload = self.0.payload.lock().unwrap();
			if let Payload::Tree(children) = &*payload {
				return children
					.get(index)
					.unwrap_or_else(|| panic!("child {index} out of range of {}", self.0.info))
					.clone();
			}
		}

		let form = self.frozen();
		let window = form.window();
		match marshal::get_child(&self.0.info, window, index, Order::Native) {
			Some((child_info, child_range)) => {
				let mut bits = BORN_NATIVE;
				if self.is_trusted() {
					bits |= FULLY_TRUSTED;
				}
				let range = form.range.start + child_range.start..form.range.start + child_range.end;
				Value::serialised(
					child_info,
					Serialised {
						buffer: form.buffer.clone(),
						range,
					},
					bits,
				)
			}
			None => {
				assert!(
					!self.is_trusted(),
					"child {index} out of range of trusted {}",
					self.0.info
				);
				if self.0.info.is_tuple() || self.0.info.is_dict_entry() {
					assert!(
						index < self.0.info.n_items(),
						"child {index} out of range of {}",
						self.0.info
					);
				}
				match self.declared_child_type(index) {
					Some(child_info) => Value::zeros_value(&child_info),
					// A broken variant yields the unit value.
					None => Value::zeros_value(&TypeInfo::tuple([])),
				}
			}
		}
	}

	/// Recursively copies the value into fresh, independent storage.
	#[must_use]
	pub fn deep_copy(&self) -> Value {
		if !self.0.info.is_container() {
			let trusted = if self.is_trusted() { FULLY_TRUSTED } else { State::empty() };
			return Value::serialised(
				self.0.info.clone(),
				Serialised {
					buffer: Buffer::Owned(Arc::new(self.data().to_vec())),
					range: 0..self.size(),
				},
				BORN_NATIVE | State::INDEPENDENT | trusted,
			);
		}
		let children: Vec<Value> = (0..self.n_children()).map(|i| self.child_value(i).deep_copy()).collect();
		let info = if self.0.info.is_variant() {
			TypeInfo::variant()
		} else {
			self.0.info.clone()
		};
		Value::tree(info, children)
	}

	// --- typed accessors (wrong type is a programming error) ---

	fn expect_basic(&self, basic: Basic) -> &[u8] {
		assert_eq!(
			self.0.info.as_basic(),
			Some(basic),
			"typed accessor for {:?} on value of type {}",
			basic,
			self.0.info
		);
		self.data()
	}

	/// The boolean this value holds.
	#[must_use]
	pub fn as_boolean(&self) -> bool {
		let window = self.expect_basic(Basic::Bool);
		u32::from_ne_bytes(window.try_into().unwrap()) != 0
	}

	/// The byte this value holds.
	#[must_use]
	pub fn as_byte(&self) -> u8 {
		self.expect_basic(Basic::Byte)[0]
	}

	/// The 16-bit signed integer this value holds.
	#[must_use]
	pub fn as_int16(&self) -> i16 {
		i16::from_ne_bytes(self.expect_basic(Basic::Int16).try_into().unwrap())
	}

	/// The 16-bit unsigned integer this value holds.
	#[must_use]
	pub fn as_uint16(&self) -> u16 {
		u16::from_ne_bytes(self.expect_basic(Basic::Uint16).try_into().unwrap())
	}

	/// The 32-bit signed integer this value holds.
	#[must_use]
	pub fn as_int32(&self) -> i32 {
		i32::from_ne_bytes(self.expect_basic(Basic::Int32).try_into().unwrap())
	}

	/// The 32-bit unsigned integer this value holds.
	#[must_use]
	pub fn as_uint32(&self) -> u32 {
		u32::from_ne_bytes(self.expect_basic(Basic::Uint32).try_into().unwrap())
	}

	/// The handle index this value holds.
	#[must_use]
	pub fn as_handle(&self) -> i32 {
		i32::from_ne_bytes(self.expect_basic(Basic::Handle).try_into().unwrap())
	}

	/// The 64-bit signed integer this value holds.
	#[must_use]
	pub fn as_int64(&self) -> i64 {
		i64::from_ne_bytes(self.expect_basic(Basic::Int64).try_into().unwrap())
	}

	/// The 64-bit unsigned integer this value holds.
	#[must_use]
	pub fn as_uint64(&self) -> u64 {
		u64::from_ne_bytes(self.expect_basic(Basic::Uint64).try_into().unwrap())
	}

	/// The double this value holds.
	#[must_use]
	pub fn as_double(&self) -> f64 {
		f64::from_ne_bytes(self.expect_basic(Basic::Double).try_into().unwrap())
	}

	fn string_window(&self) -> &str {
		let window = self.data();
		let parsed = (|| {
			let len = u32::from_ne_bytes(window.get(..4)?.try_into().ok()?) as usize;
			let text = window.get(4..4 + len)?;
			if window.get(4 + len) != Some(&0) || text.contains(&0) {
				return None;
			}
			std::str::from_utf8(text).ok()
		})();
		// Malformed untrusted strings clamp to empty.
		parsed.unwrap_or("")
	}

	/// The string this value holds, borrowed from the serialised form.
	#[must_use]
	pub fn as_str(&self) -> &str {
		let basic = self.0.info.as_basic();
		assert!(
			matches!(basic, Some(Basic::Str | Basic::ObjectPath)),
			"string accessor on value of type {}",
			self.0.info
		);
		self.string_window()
	}

	/// The signature string this value holds.
	#[must_use]
	pub fn as_signature(&self) -> &str {
		assert_eq!(
			self.0.info.as_basic(),
			Some(Basic::Signature),
			"signature accessor on value of type {}",
			self.0.info
		);
		let window = self.data();
		let parsed = (|| {
			let len = *window.first()? as usize;
			let text = window.get(1..1 + len)?;
			if window.get(1 + len) != Some(&0) {
				return None;
			}
			std::str::from_utf8(text).ok()
		})();
		parsed.unwrap_or("")
	}

	/// Renders the value in a human-readable text form.
	#[must_use]
	pub fn print(&self) -> String {
		let mut out = String::new();
		self.print_into(&mut out);
		out
	}

	fn print_into(&self, out: &mut String) {
		use std::fmt::Write as _;
		match self.classify() {
			Class::Byte => {
				let _ = write!(out, "0x{:02x}", self.as_byte());
			}
			Class::Bool => out.push_str(if self.as_boolean() { "true" } else { "false" }),
			Class::Int16 => {
				let _ = write!(out, "{}", self.as_int16());
			}
			Class::Uint16 => {
				let _ = write!(out, "{}", self.as_uint16());
			}
			Class::Int32 => {
				let _ = write!(out, "{}", self.as_int32());
			}
			Class::Uint32 => {
				let _ = write!(out, "{}", self.as_uint32());
			}
			Class::Handle => {
				let _ = write!(out, "handle {}", self.as_handle());
			}
			Class::Int64 => {
				let _ = write!(out, "{}", self.as_int64());
			}
			Class::Uint64 => {
				let _ = write!(out, "{}", self.as_uint64());
			}
			Class::Double => {
				let _ = write!(out, "{}", self.as_double());
			}
			Class::Str => {
				let _ = write!(out, "{:?}", self.as_str());
			}
			Class::ObjectPath => {
				let _ = write!(out, "objectpath {:?}", self.as_str());
			}
			Class::Signature => {
				let _ = write!(out, "signature {:?}", self.as_signature());
			}
			Class::Variant => {
				out.push('<');
				self.child_value(0).print_into(out);
				out.push('>');
			}
			Class::Maybe => {
				if self.n_children() == 0 {
					out.push_str("nothing");
				} else {
					out.push_str("just ");
					self.child_value(0).print_into(out);
				}
			}
			Class::Array => {
				out.push('[');
				for i in 0..self.n_children() {
					if i > 0 {
						out.push_str(", ");
					}
					self.child_value(i).print_into(out);
				}
				out.push(']');
			}
			Class::Tuple => {
				out.push('(');
				for i in 0..self.n_children() {
					if i > 0 {
						out.push_str(", ");
					}
					self.child_value(i).print_into(out);
				}
				out.push(')');
			}
			Class::DictEntry => {
				out.push('{');
				self.child_value(0).print_into(out);
				out.push_str(": ");
				self.child_value(1).print_into(out);
				out.push('}');
			}
		}
	}
}

impl PartialEq for Value {
	/// Byte-wise equality of the serialised native forms.
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
			|| (self.0.info == other.0.info && self.data() == other.data())
	}
}

impl Eq for Value {}

impl fmt::Debug for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Value({}: {})", self.0.info, self.print())
	}
}

impl SerialChild for Value {
	fn child_type(&self) -> TypeInfo {
		self.0.info.clone()
	}

	fn serial_size(&self) -> usize {
		self.size()
	}

	fn write_to(&self, dest: &mut [u8]) {
		dest.copy_from_slice(self.frozen().window());
	}
}

/// Locked engine context performing lattice actions against the payload.
struct Ctx<'a> {
	inner: &'a ValueInner,
	payload: &'a mut Payload,
}

impl Perform for Ctx<'_> {
	fn perform(&mut self, action: Action, state: State) -> Option<State> {
		match action {
			Action::Nop => Some(State::empty()),
			Action::ComputeSize => self.compute_size(),
			Action::Serialise => self.serialise(),
			Action::CopyToOwn => self.copy_to_own(),
			Action::ByteswapInPlace => self.byteswap_in_place(),
			Action::VerifyNormal => self.verify_normal(),
			Action::Reconstruct => self.reconstruct(state),
		}
	}
}

impl Ctx<'_> {
	fn compute_size(&mut self) -> Option<State> {
		let size = match &*self.payload {
			Payload::Serialised(form) => form.range.len(),
			Payload::Tree(children) => {
				// Freeze every child first so sizes cannot shift under a
				// later reconstruction.
				for child in children {
					child.flatten();
				}
				let refs: Vec<&dyn SerialChild> =
					children.iter().map(|c| c as &dyn SerialChild).collect();
				marshal::needed_size(&self.inner.info, &refs)
			}
		};
		self.inner.size.store(size, Ordering::Release);
		Some(State::empty())
	}

	fn serialise(&mut self) -> Option<State> {
		let Payload::Tree(children) = &*self.payload else {
			unreachable!("Serialise action on serialised payload");
		};
		for child in children {
			child.flatten();
		}
		let refs: Vec<&dyn SerialChild> = children.iter().map(|c| c as &dyn SerialChild).collect();
		let size = marshal::needed_size(&self.inner.info, &refs);
		let mut dest = vec![0u8; size];
		marshal::serialise(&self.inner.info, &mut dest, &refs);
		self.inner.size.store(size, Ordering::Release);
		*self.payload = Payload::Serialised(Serialised {
			buffer: Buffer::Owned(Arc::new(dest)),
			range: 0..size,
		});
		Some(State::INDEPENDENT)
	}

	fn copy_to_own(&mut self) -> Option<State> {
		let Payload::Serialised(form) = &mut *self.payload else {
			unreachable!("CopyToOwn action on tree payload");
		};
		let copied = form.window().to_vec();
		let len = copied.len();
		*form = Serialised {
			buffer: Buffer::Owned(Arc::new(copied)),
			range: 0..len,
		};
		Some(State::empty())
	}

	fn byteswap_in_place(&mut self) -> Option<State> {
		let Payload::Serialised(form) = &mut *self.payload else {
			unreachable!("ByteswapInPlace action on tree payload");
		};
		let info = self.inner.info.clone();
		if let Buffer::Owned(data) = &mut form.buffer
			&& let Some(bytes) = Arc::get_mut(data)
		{
			return marshal::byteswap(&info, &mut bytes[form.range.clone()])
				.then_some(State::empty());
		}
		// The buffer is shared: copy first, then swap the copy.
		let mut copied = form.window().to_vec();
		if !marshal::byteswap(&info, &mut copied) {
			return None;
		}
		let len = copied.len();
		*form = Serialised {
			buffer: Buffer::Owned(Arc::new(copied)),
			range: 0..len,
		};
		Some(State::empty())
	}

	fn verify_normal(&mut self) -> Option<State> {
		let Payload::Serialised(form) = &*self.payload else {
			unreachable!("VerifyNormal action on tree payload");
		};
		marshal::is_normal(&self.inner.info, form.window()).then_some(State::empty())
	}

	fn reconstruct(&mut self, state: State) -> Option<State> {
		// A tree reconstructs by serialising; its output is already in
		// native order.
		if matches!(&*self.payload, Payload::Tree(_)) {
			self.serialise()?;
		}
		let order = if state.contains(State::NATIVE) {
			Order::Native
		} else {
			Order::Swapped
		};
		let Payload::Serialised(form) = &mut *self.payload else {
			unreachable!()
		};
		let rebuilt = normalise(&self.inner.info, form.window(), order);
		let len = rebuilt.len();
		self.inner.size.store(len, Ordering::Release);
		*form = Serialised {
			buffer: Buffer::Owned(Arc::new(rebuilt)),
			range: 0..len,
		};
		Some(State::SERIALISED | State::INDEPENDENT | SIZED)
	}
}

/// A normalised child assembled during reconstruction.
struct RawChild {
	info: TypeInfo,
	bytes: Vec<u8>,
}

impl SerialChild for RawChild {
	fn child_type(&self) -> TypeInfo {
		self.info.clone()
	}

	fn serial_size(&self) -> usize {
		self.bytes.len()
	}

	fn write_to(&self, dest: &mut [u8]) {
		dest.copy_from_slice(&self.bytes);
	}
}

/// Whether an all-zeros window of the default size would not survive
/// child extraction for `info`: variants need a real signature header,
/// directly or at a fixed position inside a tuple or dict entry. Empty
/// arrays and absent maybes are fine.
fn zeros_window_breaks(info: &TypeInfo) -> bool {
	if info.is_variant() {
		return true;
	}
	if info.is_tuple() || info.is_dict_entry() {
		return (0..info.n_items()).any(|i| zeros_window_breaks(info.item(i)));
	}
	false
}

/// The canonical serialisation of the default value of `info`: zero
/// numbers, empty strings, the root object path, empty containers.
fn default_value_bytes(info: &TypeInfo) -> Vec<u8> {
	match info.as_basic() {
		Some(Basic::ObjectPath) => {
			let mut bytes = 1u32.to_ne_bytes().to_vec();
			bytes.extend_from_slice(b"/\0");
			bytes
		}
		Some(Basic::Str) => vec![0; 5],
		Some(Basic::Signature) => vec![0; 2],
		Some(_) => vec![0; info.fixed_size().unwrap_or(1)],
		None => {
			if info.is_variant() {
				// A variant holding the unit value.
				let unit = RawChild {
					info: TypeInfo::tuple([]),
					bytes: vec![0],
				};
				let refs: Vec<&dyn SerialChild> = vec![&unit];
				let mut dest = vec![0u8; marshal::needed_size(info, &refs)];
				marshal::serialise(info, &mut dest, &refs);
				dest
			} else if info.is_array() {
				vec![0; 4]
			} else if info.is_maybe() {
				vec![0]
			} else {
				// Tuple or dict entry: defaults for every item.
				let children: Vec<RawChild> = (0..info.n_items())
					.map(|i| RawChild {
						info: info.item(i).clone(),
						bytes: default_value_bytes(info.item(i)),
					})
					.collect();
				let refs: Vec<&dyn SerialChild> = children.iter().map(|c| c as &dyn SerialChild).collect();
				let mut dest = vec![0u8; marshal::needed_size(info, &refs)];
				marshal::serialise(info, &mut dest, &refs);
				dest
			}
		}
	}
}

/// Rebuilds `window` (in `order`) into the normalised native
/// serialisation, clamping anything malformed to defaults.
fn normalise(info: &TypeInfo, window: &[u8], order: Order) -> Vec<u8> {
	if let Some(basic) = info.as_basic() {
		return normalise_basic(basic, window, order);
	}
	if info.is_variant() {
		let Some((child_info, range)) = marshal::get_child(info, window, 0, order) else {
			return default_value_bytes(info);
		};
		let child = RawChild {
			bytes: normalise(&child_info, &window[range], order),
			info: child_info,
		};
		let refs: Vec<&dyn SerialChild> = vec![&child];
		let mut dest = vec![0u8; marshal::needed_size(info, &refs)];
		marshal::serialise(info, &mut dest, &refs);
		return dest;
	}
	// Array, maybe, tuple, dict entry: normalise every reachable child,
	// substituting defaults where extraction fails.
	let count = if info.is_array() || info.is_maybe() {
		marshal::n_children(info, window, order)
	} else {
		info.n_items()
	};
	let children: Vec<RawChild> = (0..count)
		.map(|i| match marshal::get_child(info, window, i, order) {
			Some((child_info, range)) => RawChild {
				bytes: normalise(&child_info, &window[range], order),
				info: child_info,
			},
			None => {
				let child_info = if info.is_array() || info.is_maybe() {
					info.element().clone()
				} else {
					info.item(i).clone()
				};
				RawChild {
					bytes: default_value_bytes(&child_info),
					info: child_info,
				}
			}
		})
		.collect();
	let refs: Vec<&dyn SerialChild> = children.iter().map(|c| c as &dyn SerialChild).collect();
	let mut dest = vec![0u8; marshal::needed_size(info, &refs)];
	marshal::serialise(info, &mut dest, &refs);
	dest
}

fn normalise_basic(basic: Basic, window: &[u8], order: Order) -> Vec<u8> {
	fn scalar<const N: usize>(window: &[u8], order: Order) -> [u8; N] {
		let mut raw = [0u8; N];
		if let Some(bytes) = window.get(..N) {
			raw.copy_from_slice(bytes);
			if order == Order::Swapped {
				raw.reverse();
			}
		}
		raw
	}

	match basic {
		Basic::Byte => vec![window.first().copied().unwrap_or(0)],
		Basic::Bool => {
			let raw: [u8; 4] = scalar(window, order);
			u32::from(u32::from_ne_bytes(raw) != 0).to_ne_bytes().to_vec()
		}
		Basic::Int16 | Basic::Uint16 => scalar::<2>(window, order).to_vec(),
		Basic::Int32 | Basic::Uint32 | Basic::Handle => scalar::<4>(window, order).to_vec(),
		Basic::Int64 | Basic::Uint64 | Basic::Double => scalar::<8>(window, order).to_vec(),
		Basic::Str | Basic::ObjectPath | Basic::Signature => {
			let text = parse_string(basic, window, order);
			match basic {
				Basic::Signature => {
					let mut bytes = vec![text.len() as u8];
					bytes.extend_from_slice(text.as_bytes());
					bytes.push(0);
					bytes
				}
				_ => {
					let mut bytes = (text.len() as u32).to_ne_bytes().to_vec();
					bytes.extend_from_slice(text.as_bytes());
					bytes.push(0);
					bytes
				}
			}
		}
	}
}

/// Parses and validates a serialised string, clamping to the type's
/// default on any malformation.
fn parse_string(basic: Basic, window: &[u8], order: Order) -> String {
	let parsed = (|| {
		let (len, start) = match basic {
			Basic::Signature => (*window.first()? as usize, 1),
			_ => {
				let raw: [u8; 4] = window.get(..4)?.try_into().ok()?;
				let len = match order {
					Order::Native => u32::from_ne_bytes(raw),
					Order::Swapped => u32::from_ne_bytes(raw).swap_bytes(),
				};
				(len as usize, 4)
			}
		};
		let text = window.get(start..start + len)?;
		if window.get(start + len) != Some(&0) || text.contains(&0) {
			return None;
		}
		let text = std::str::from_utf8(text).ok()?;
		let valid = match basic {
			Basic::ObjectPath => marshal::object_path_is_valid(text),
			Basic::Signature => signature_is_valid(text),
			_ => true,
		};
		valid.then(|| text.to_owned())
	})();
	parsed.unwrap_or_else(|| match basic {
		Basic::ObjectPath => "/".to_owned(),
		_ => String::new(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::builder::Builder;

	fn state_of(value: &Value) -> State {
		value.state() - State::LOCKED
	}

	#[test]
	fn basic_values_are_trusted_and_normal() {
		let values = [
			Value::new_boolean(true),
			Value::new_byte(0xff),
			Value::new_int16(-2),
			Value::new_uint16(2),
			Value::new_int32(-3),
			Value::new_uint32(3),
			Value::new_handle(4),
			Value::new_int64(-5),
			Value::new_uint64(5),
			Value::new_double(1.5),
			Value::new_string("hello"),
			Value::new_object_path("/org/example"),
			Value::new_signature("a{sv}"),
		];
		for value in values {
			assert!(value.is_trusted(), "{value:?} not trusted");
			assert!(value.is_normal(), "{value:?} not normal");
			let bits = state_of(&value);
			assert!(bits.contains(State::NATIVE | State::SERIALISED | State::INDEPENDENT));
			assert!(bits.contains(State::SIZE_VALID));
		}
	}

	#[test]
	fn typed_accessors_round_trip() {
		assert!(Value::new_boolean(true).as_boolean());
		assert_eq!(Value::new_byte(7).as_byte(), 7);
		assert_eq!(Value::new_int16(-512).as_int16(), -512);
		assert_eq!(Value::new_uint32(0xdead_beef).as_uint32(), 0xdead_beef);
		assert_eq!(Value::new_int64(i64::MIN).as_int64(), i64::MIN);
		assert_eq!(Value::new_double(0.25).as_double(), 0.25);
		assert_eq!(Value::new_string("abc").as_str(), "abc");
		assert_eq!(Value::new_object_path("/a/b").as_str(), "/a/b");
		assert_eq!(Value::new_signature("ss").as_signature(), "ss");
	}

	#[test]
	#[should_panic(expected = "typed accessor")]
	fn wrong_accessor_panics() {
		let _ = Value::new_uint32(1).as_boolean();
	}

	#[test]
	fn variant_inherits_trust() {
		let trusted = Value::new_variant(Value::new_uint32(1));
		assert!(trusted.is_trusted());

		let raw = Value::load(
			Some(&TypeInfo::new("u")),
			1u32.to_ne_bytes().to_vec(),
			LoadFlags::empty(),
		);
		assert!(!raw.is_trusted());
		let untrusted = Value::new_variant(raw);
		assert!(!untrusted.is_trusted());
	}

	#[test]
	fn lattice_is_monotonic() {
		let mut builder = Builder::new(&TypeInfo::new("a(us)"));
		builder.open(&TypeInfo::new("(us)"));
		builder.add_value(Value::new_uint32(1));
		builder.add_value(Value::new_string("one"));
		builder.close();
		let value = builder.end();

		let mut seen = state_of(&value);
		let mut observe = |value: &Value| {
			let now = state_of(value);
			assert!(now.contains(seen), "state bits were cleared: {seen:?} -> {now:?}");
			seen = now;
		};

		let _ = value.size();
		observe(&value);
		let _ = value.n_children();
		observe(&value);
		value.flatten();
		observe(&value);
		let _ = value.data();
		observe(&value);
		let _ = value.is_normal();
		observe(&value);
		let _ = value.child_value(0);
		observe(&value);
	}

	#[test]
	fn serialised_children_share_the_buffer() {
		let mut builder = Builder::new(&TypeInfo::new("as"));
		builder.add_value(Value::new_string("shared"));
		let array = builder.end();
		array.flatten();
		let child = array.child_value(0);
		let bits = state_of(&child);
		assert!(bits.contains(State::SERIALISED | State::NATIVE));
		assert!(!bits.contains(State::INDEPENDENT), "child must borrow the parent buffer");
		assert_eq!(child.as_str(), "shared");
	}

	#[test]
	fn zeros_policy_for_untrusted_extraction() {
		// Array claims 100 bytes of element data but carries none.
		let mut bytes = 100u32.to_ne_bytes().to_vec();
		bytes.push(0);
		let broken = Value::load(Some(&TypeInfo::new("au")), bytes, LoadFlags::empty());
		assert_eq!(broken.n_children(), 0);

		let child = broken.child_value(0);
		assert_eq!(child.type_info().type_string(), "u");
		assert_eq!(child.as_uint32(), 0);
		let bits = state_of(&child);
		assert!(bits.contains(State::FIXED_SIZE | State::TRUSTED | State::NATIVE | State::SIZE_VALID));
	}

	#[test]
	#[should_panic(expected = "out of range of trusted")]
	fn trusted_out_of_range_panics() {
		let mut builder = Builder::new(&TypeInfo::new("au"));
		builder.add_value(Value::new_uint32(1));
		let array = builder.end();
		array.flatten();
		let _ = array.child_value(5);
	}

	#[test]
	fn foreign_order_swaps_on_demand() {
		let mut bytes = 0x01020304u32.to_ne_bytes().to_vec();
		bytes.reverse();
		let flags = if cfg!(target_endian = "little") {
			LoadFlags::BIG_ENDIAN
		} else {
			LoadFlags::LITTLE_ENDIAN
		};
		let value = Value::load(
			Some(&TypeInfo::new("u")),
			bytes,
			flags | LoadFlags::LAZY_BYTESWAP,
		);
		assert!(!state_of(&value).contains(State::NATIVE));
		assert_eq!(value.as_uint32(), 0x01020304);
		let bits = state_of(&value);
		assert!(bits.contains(State::NATIVE | State::BECAME_NATIVE));
	}

	#[test]
	fn unswappable_foreign_data_reconstructs() {
		// A foreign-order array of strings whose length prefix overruns
		// the window: the swap walk cannot finish, so demanding native
		// order rebuilds the value in normal form.
		let mut bytes = 100u32.to_ne_bytes().to_vec();
		bytes.reverse();
		bytes.extend_from_slice(&[1, 2]);
		let flags = if cfg!(target_endian = "little") {
			LoadFlags::BIG_ENDIAN
		} else {
			LoadFlags::LITTLE_ENDIAN
		};
		let value = Value::load(
			Some(&TypeInfo::new("as")),
			bytes,
			flags | LoadFlags::LAZY_BYTESWAP,
		);
		let _ = value.data();
		let bits = state_of(&value);
		assert!(bits.contains(State::NATIVE | State::RECONSTRUCTED));
		assert!(value.is_normal());
		assert_eq!(value.n_children(), 0);
	}

	#[test]
	fn fixed_size_mismatch_clamps_to_zeros() {
		let value = Value::load(Some(&TypeInfo::new("u")), vec![1, 2], LoadFlags::empty());
		assert_eq!(value.as_uint32(), 0);
		assert!(value.is_trusted());
	}

	#[test]
	fn from_bytes_runs_release_callback() {
		use std::sync::atomic::AtomicBool;
		let released = Arc::new(AtomicBool::new(false));
		let seen = released.clone();
		let value = Value::from_bytes(
			Some(&TypeInfo::new("u")),
			7u32.to_ne_bytes().to_vec(),
			LoadFlags::TRUSTED,
			move |bytes| {
				assert_eq!(bytes, 7u32.to_ne_bytes().to_vec());
				seen.store(true, Ordering::SeqCst);
			},
		);
		assert!(!state_of(&value).contains(State::INDEPENDENT));
		assert_eq!(value.as_uint32(), 7);
		let clone = value.clone();
		drop(value);
		assert!(!released.load(Ordering::SeqCst));
		drop(clone);
		assert!(released.load(Ordering::SeqCst));
	}

	#[test]
	fn equality_is_structural() {
		let mut builder = Builder::new(&TypeInfo::new("(us)"));
		builder.add_value(Value::new_uint32(9));
		builder.add_value(Value::new_string("nine"));
		let tree = builder.end();

		let loaded = Value::load(
			Some(&TypeInfo::new("(us)")),
			tree.data().to_vec(),
			LoadFlags::TRUSTED,
		);
		assert_eq!(tree, loaded);
		assert_eq!(tree.size(), loaded.size());

		let other = Value::new_uint32(9);
		assert_ne!(loaded, Value::new_variant(other));
	}

	#[test]
	fn deep_copy_preserves_shape() {
		let mut builder = Builder::new(&TypeInfo::new("a{sv}"));
		builder.open(&TypeInfo::new("{sv}"));
		builder.add_value(Value::new_string("key"));
		builder.add_value(Value::new_variant(Value::new_boolean(true)));
		builder.close();
		let dict = builder.end();
		dict.flatten();

		let copy = dict.deep_copy();
		assert_eq!(copy.classify(), dict.classify());
		assert_eq!(copy.n_children(), dict.n_children());
		assert_eq!(copy, dict);
		assert!(state_of(&copy.child_value(0)).contains(State::NATIVE));
	}

	#[test]
	fn untyped_load_unwraps_the_variant() {
		let boxed = Value::new_variant(Value::new_string("inner"));
		let value = Value::load(None, boxed.data().to_vec(), LoadFlags::TRUSTED);
		assert_eq!(value.type_info().type_string(), "s");
		assert_eq!(value.as_str(), "inner");
	}

	#[test]
	fn print_renders_text_form() {
		let mut builder = Builder::new(&TypeInfo::new("(ibs)"));
		builder.add_value(Value::new_int32(-4));
		builder.add_value(Value::new_boolean(false));
		builder.add_value(Value::new_string("hi"));
		let tuple = builder.end();
		assert_eq!(tuple.print(), "(-4, false, \"hi\")");

		let maybe = Value::tree(TypeInfo::new("ms"), Vec::new());
		assert_eq!(maybe.print(), "nothing");
		assert_eq!(Value::new_variant(Value::new_byte(3)).print(), "<0x03>");
	}

	#[test]
	fn store_writes_the_serialised_form() {
		let value = Value::new_uint16(0x1234);
		let mut out = vec![0u8; value.size()];
		value.store(&mut out);
		assert_eq!(out, 0x1234u16.to_ne_bytes());
	}
}
