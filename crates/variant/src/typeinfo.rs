//! Reference-counted descriptions of D-Bus types.
//!
//! A [`TypeInfo`] is parsed from a type string over the alphabet
//! `ybnqihuxtdvmasog(){}` plus the indefinite forms `*` (any type),
//! `?` (any basic type) and `r` (any tuple), which only appear at
//! construction and matching time and never on the wire.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

/// Validation failure for a type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTypeString {
	text: String,
	offset: usize,
}

impl InvalidTypeString {
	/// Byte offset of the first offending character.
	#[must_use]
	pub fn offset(&self) -> usize {
		self.offset
	}
}

impl fmt::Display for InvalidTypeString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "invalid type string {:?} at offset {}", self.text, self.offset)
	}
}

impl std::error::Error for InvalidTypeString {}

/// The thirteen basic (non-container) D-Bus types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Basic {
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
}

impl Basic {
	/// The type character for this basic type.
	#[must_use]
	pub const fn type_char(self) -> char {
		match self {
			Basic::Byte => 'y',
			Basic::Bool => 'b',
			Basic::Int16 => 'n',
			Basic::Uint16 => 'q',
			Basic::Int32 => 'i',
			Basic::Uint32 => 'u',
			Basic::Handle => 'h',
			Basic::Int64 => 'x',
			Basic::Uint64 => 't',
			Basic::Double => 'd',
			Basic::Str => 's',
			Basic::ObjectPath => 'o',
			Basic::Signature => 'g',
		}
	}

	/// The basic type for a type character, if any.
	pub(crate) const fn from_type_char(c: char) -> Option<Basic> {
		Basic::from_char(c)
	}

	const fn from_char(c: char) -> Option<Basic> {
		Some(match c {
			'y' => Basic::Byte,
			'b' => Basic::Bool,
			'n' => Basic::Int16,
			'q' => Basic::Uint16,
			'i' => Basic::Int32,
			'u' => Basic::Uint32,
			'h' => Basic::Handle,
			'x' => Basic::Int64,
			't' => Basic::Uint64,
			'd' => Basic::Double,
			's' => Basic::Str,
			'o' => Basic::ObjectPath,
			'g' => Basic::Signature,
			_ => return None,
		})
	}
}

/// Structural kind of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Kind {
	Basic(Basic),
	Variant,
	Maybe(TypeInfo),
	Array(TypeInfo),
	Tuple(SmallVec<[TypeInfo; 4]>),
	DictEntry(TypeInfo, TypeInfo),
	/// `*`: matches any definite type.
	Any,
	/// `?`: matches any basic type.
	AnyBasic,
	/// `r`: matches any tuple type.
	AnyTuple,
}

struct Inner {
	kind: Kind,
	type_string: String,
	/// Alignment of the serialised form, in bytes (1, 2, 4 or 8).
	alignment: usize,
	/// Serialised size when every instance has the same size.
	fixed_size: Option<usize>,
}

/// A compact, shareable description of a D-Bus type.
///
/// Cloning is cheap (reference count). Two `TypeInfo`s compare equal iff
/// their canonical type strings are equal.
#[derive(Clone)]
pub struct TypeInfo(Arc<Inner>);

impl PartialEq for TypeInfo {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.0, &other.0) || self.0.type_string == other.0.type_string
	}
}

impl Eq for TypeInfo {}

impl std::hash::Hash for TypeInfo {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.0.type_string.hash(state);
	}
}

impl fmt::Debug for TypeInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "TypeInfo({})", self.0.type_string)
	}
}

impl fmt::Display for TypeInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0.type_string)
	}
}

fn align_up(offset: usize, alignment: usize) -> usize {
	(offset + alignment - 1) & !(alignment - 1)
}

impl TypeInfo {
	fn from_kind(kind: Kind) -> TypeInfo {
		let type_string = kind_type_string(&kind);
		let alignment = kind_alignment(&kind);
		let fixed_size = kind_fixed_size(&kind);
		TypeInfo(Arc::new(Inner {
			kind,
			type_string,
			alignment,
			fixed_size,
		}))
	}

	/// Parses a single complete type string.
	///
	/// # Panics
	///
	/// Panics if `s` is not exactly one well-formed type. Use
	/// [`TypeInfo::try_new`] for untrusted input.
	#[must_use]
	pub fn new(s: &str) -> TypeInfo {
		match TypeInfo::try_new(s) {
			Ok(info) => info,
			Err(e) => panic!("{e}"),
		}
	}

	/// Parses a single complete type string from possibly-invalid input.
	pub fn try_new(s: &str) -> Result<TypeInfo, InvalidTypeString> {
		let bytes = s.as_bytes();
		let (kind, used) = parse_one(bytes, 0).ok_or_else(|| InvalidTypeString {
			text: s.to_owned(),
			offset: first_error_offset(bytes),
		})?;
		if used != bytes.len() {
			return Err(InvalidTypeString {
				text: s.to_owned(),
				offset: used,
			});
		}
		Ok(TypeInfo::from_kind(kind))
	}

	pub(crate) fn from_parsed_kind(kind: Kind) -> TypeInfo {
		TypeInfo::from_kind(kind)
	}

	/// The `*` wildcard, matching any definite type.
	#[must_use]
	pub fn any() -> TypeInfo {
		TypeInfo::from_kind(Kind::Any)
	}

	/// The `?` wildcard, matching any basic type.
	#[must_use]
	pub fn any_basic() -> TypeInfo {
		TypeInfo::from_kind(Kind::AnyBasic)
	}

	/// The `r` wildcard, matching any tuple type.
	#[must_use]
	pub fn any_tuple() -> TypeInfo {
		TypeInfo::from_kind(Kind::AnyTuple)
	}

	/// The variant type `v`.
	#[must_use]
	pub fn variant() -> TypeInfo {
		TypeInfo::from_kind(Kind::Variant)
	}

	/// A basic type.
	#[must_use]
	pub fn basic(basic: Basic) -> TypeInfo {
		TypeInfo::from_kind(Kind::Basic(basic))
	}

	/// An array type with the given element type.
	#[must_use]
	pub fn array(element: TypeInfo) -> TypeInfo {
		TypeInfo::from_kind(Kind::Array(element))
	}

	/// A maybe type with the given element type.
	#[must_use]
	pub fn maybe(element: TypeInfo) -> TypeInfo {
		TypeInfo::from_kind(Kind::Maybe(element))
	}

	/// A tuple type with the given item types.
	#[must_use]
	pub fn tuple(items: impl IntoIterator<Item = TypeInfo>) -> TypeInfo {
		TypeInfo::from_kind(Kind::Tuple(items.into_iter().collect()))
	}

	/// A dict-entry type with the given key and value types.
	///
	/// # Panics
	///
	/// Panics if `key` is not a basic type.
	#[must_use]
	pub fn dict_entry(key: TypeInfo, value: TypeInfo) -> TypeInfo {
		assert!(
			key.is_basic() || matches!(key.kind(), Kind::AnyBasic),
			"dict entry key must be a basic type, got {key}"
		);
		TypeInfo::from_kind(Kind::DictEntry(key, value))
	}

	pub(crate) fn kind(&self) -> &Kind {
		&self.0.kind
	}

	/// The canonical type string.
	#[must_use]
	pub fn type_string(&self) -> &str {
		&self.0.type_string
	}

	/// Whether this is one of the thirteen basic types.
	#[must_use]
	pub fn is_basic(&self) -> bool {
		matches!(self.0.kind, Kind::Basic(_))
	}

	/// Whether this is a container type (variant, maybe, array, tuple or
	/// dict entry).
	#[must_use]
	pub fn is_container(&self) -> bool {
		matches!(
			self.0.kind,
			Kind::Variant | Kind::Maybe(_) | Kind::Array(_) | Kind::Tuple(_) | Kind::DictEntry(..)
		)
	}

	/// Whether the type contains no indefinite (wildcard) component.
	#[must_use]
	pub fn is_definite(&self) -> bool {
		match &self.0.kind {
			Kind::Basic(_) | Kind::Variant => true,
			Kind::Maybe(e) | Kind::Array(e) => e.is_definite(),
			Kind::Tuple(items) => items.iter().all(TypeInfo::is_definite),
			Kind::DictEntry(k, v) => k.is_definite() && v.is_definite(),
			Kind::Any | Kind::AnyBasic | Kind::AnyTuple => false,
		}
	}

	/// Whether this is an array type.
	#[must_use]
	pub fn is_array(&self) -> bool {
		matches!(self.0.kind, Kind::Array(_))
	}

	/// Whether this is a maybe type.
	#[must_use]
	pub fn is_maybe(&self) -> bool {
		matches!(self.0.kind, Kind::Maybe(_))
	}

	/// Whether this is a tuple type.
	#[must_use]
	pub fn is_tuple(&self) -> bool {
		matches!(self.0.kind, Kind::Tuple(_) | Kind::AnyTuple)
	}

	/// Whether this is a dict-entry type.
	#[must_use]
	pub fn is_dict_entry(&self) -> bool {
		matches!(self.0.kind, Kind::DictEntry(..))
	}

	/// Whether this is the variant type.
	#[must_use]
	pub fn is_variant(&self) -> bool {
		matches!(self.0.kind, Kind::Variant)
	}

	/// The basic kind, if this is a basic type.
	#[must_use]
	pub fn as_basic(&self) -> Option<Basic> {
		match self.0.kind {
			Kind::Basic(b) => Some(b),
			_ => None,
		}
	}

	/// Serialised size shared by every instance, if this type has one.
	#[must_use]
	pub fn fixed_size(&self) -> Option<usize> {
		self.0.fixed_size
	}

	/// Whether every instance of the type serialises to the same size.
	#[must_use]
	pub fn is_fixed_size(&self) -> bool {
		self.0.fixed_size.is_some()
	}

	/// Alignment of the serialised form.
	#[must_use]
	pub fn alignment(&self) -> usize {
		self.0.alignment
	}

	/// Element type of an array or maybe.
	///
	/// # Panics
	///
	/// Panics if the type is neither an array nor a maybe.
	#[must_use]
	pub fn element(&self) -> &TypeInfo {
		match &self.0.kind {
			Kind::Array(e) | Kind::Maybe(e) => e,
			_ => panic!("element() on non-array, non-maybe type {self}"),
		}
	}

	/// Number of items in a tuple or dict-entry type.
	///
	/// # Panics
	///
	/// Panics if the type is neither a tuple nor a dict entry.
	#[must_use]
	pub fn n_items(&self) -> usize {
		match &self.0.kind {
			Kind::Tuple(items) => items.len(),
			Kind::DictEntry(..) => 2,
			_ => panic!("n_items() on non-tuple type {self}"),
		}
	}

	/// The `i`-th item type of a tuple or dict entry.
	///
	/// # Panics
	///
	/// Panics if out of range or if the type has no items.
	#[must_use]
	pub fn item(&self, i: usize) -> &TypeInfo {
		match &self.0.kind {
			Kind::Tuple(items) => &items[i],
			Kind::DictEntry(k, v) => match i {
				0 => k,
				1 => v,
				_ => panic!("item({i}) on dict entry"),
			},
			_ => panic!("item() on non-tuple type {self}"),
		}
	}

	/// Key type of a dict entry.
	///
	/// # Panics
	///
	/// Panics if the type is not a dict entry.
	#[must_use]
	pub fn key(&self) -> &TypeInfo {
		match &self.0.kind {
			Kind::DictEntry(k, _) => k,
			_ => panic!("key() on non-dict-entry type {self}"),
		}
	}

	/// Value type of a dict entry.
	///
	/// # Panics
	///
	/// Panics if the type is not a dict entry.
	#[must_use]
	pub fn value(&self) -> &TypeInfo {
		match &self.0.kind {
			Kind::DictEntry(_, v) => v,
			_ => panic!("value() on non-dict-entry type {self}"),
		}
	}

	/// Whether a value of (definite) type `self` matches the possibly
	/// indefinite pattern `pattern`.
	#[must_use]
	pub fn matches(&self, pattern: &TypeInfo) -> bool {
		match (&self.0.kind, &pattern.0.kind) {
			(_, Kind::Any) => true,
			(_, Kind::AnyBasic) => self.is_basic(),
			(Kind::Tuple(_), Kind::AnyTuple) => true,
			(Kind::AnyTuple, Kind::AnyTuple) => true,
			(Kind::Basic(a), Kind::Basic(b)) => a == b,
			(Kind::Variant, Kind::Variant) => true,
			(Kind::Maybe(a), Kind::Maybe(b)) | (Kind::Array(a), Kind::Array(b)) => a.matches(b),
			(Kind::Tuple(a), Kind::Tuple(b)) => {
				a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.matches(y))
			}
			(Kind::DictEntry(ak, av), Kind::DictEntry(bk, bv)) => {
				ak.matches(bk) && av.matches(bv)
			}
			_ => false,
		}
	}
}

fn kind_type_string(kind: &Kind) -> String {
	match kind {
		Kind::Basic(b) => b.type_char().to_string(),
		Kind::Variant => "v".to_owned(),
		Kind::Maybe(e) => format!("m{}", e.type_string()),
		Kind::Array(e) => format!("a{}", e.type_string()),
		Kind::Tuple(items) => {
			let mut s = String::from("(");
			for item in items {
				s.push_str(item.type_string());
			}
			s.push(')');
			s
		}
		Kind::DictEntry(k, v) => format!("{{{}{}}}", k.type_string(), v.type_string()),
		Kind::Any => "*".to_owned(),
		Kind::AnyBasic => "?".to_owned(),
		Kind::AnyTuple => "r".to_owned(),
	}
}

fn kind_alignment(kind: &Kind) -> usize {
	match kind {
		Kind::Basic(b) => match b {
			Basic::Byte | Basic::Signature => 1,
			Basic::Int16 | Basic::Uint16 => 2,
			Basic::Bool
			| Basic::Int32
			| Basic::Uint32
			| Basic::Handle
			| Basic::Str
			| Basic::ObjectPath => 4,
			Basic::Int64 | Basic::Uint64 | Basic::Double => 8,
		},
		// The length prefix wants 4; 8-aligned elements want 8.
		Kind::Array(e) => kind_alignment_of(e).max(4),
		Kind::Maybe(e) => kind_alignment_of(e),
		// Tuples and dict entries are 8-aligned on the wire; the variant
		// payload must accommodate any contained alignment.
		Kind::Tuple(_) | Kind::DictEntry(..) | Kind::Variant => 8,
		Kind::Any | Kind::AnyBasic | Kind::AnyTuple => 1,
	}
}

fn kind_alignment_of(info: &TypeInfo) -> usize {
	info.alignment()
}

fn kind_fixed_size(kind: &Kind) -> Option<usize> {
	match kind {
		Kind::Basic(b) => Some(match b {
			Basic::Byte => 1,
			Basic::Int16 | Basic::Uint16 => 2,
			Basic::Bool | Basic::Int32 | Basic::Uint32 | Basic::Handle => 4,
			Basic::Int64 | Basic::Uint64 | Basic::Double => 8,
			Basic::Str | Basic::ObjectPath | Basic::Signature => return None,
		}),
		Kind::Tuple(items) => {
			let mut offset = 0usize;
			for item in items.iter() {
				offset = align_up(offset, item.alignment());
				offset += item.fixed_size()?;
			}
			// The unit tuple serialises to a single padding byte so that
			// arrays of it have a non-zero stride.
			Some(if offset == 0 { 1 } else { align_up(offset, 8) })
		}
		Kind::DictEntry(k, v) => {
			let mut offset = k.fixed_size()?;
			offset = align_up(offset, v.alignment());
			offset += v.fixed_size()?;
			Some(align_up(offset, 8))
		}
		Kind::Variant | Kind::Maybe(_) | Kind::Array(_) => None,
		Kind::Any | Kind::AnyBasic | Kind::AnyTuple => None,
	}
}

/// Parses one complete type starting at `pos`; returns the kind and the
/// position one past its end.
fn parse_one(bytes: &[u8], pos: usize) -> Option<(Kind, usize)> {
	let &c = bytes.get(pos)?;
	match c {
		b'v' => Some((Kind::Variant, pos + 1)),
		b'*' => Some((Kind::Any, pos + 1)),
		b'?' => Some((Kind::AnyBasic, pos + 1)),
		b'r' => Some((Kind::AnyTuple, pos + 1)),
		b'm' => {
			let (elem, end) = parse_one(bytes, pos + 1)?;
			Some((Kind::Maybe(TypeInfo::from_kind(elem)), end))
		}
		b'a' => {
			let (elem, end) = parse_one(bytes, pos + 1)?;
			Some((Kind::Array(TypeInfo::from_kind(elem)), end))
		}
		b'(' => {
			let mut items = SmallVec::new();
			let mut at = pos + 1;
			while bytes.get(at) != Some(&b')') {
				let (item, end) = parse_one(bytes, at)?;
				items.push(TypeInfo::from_kind(item));
				at = end;
			}
			Some((Kind::Tuple(items), at + 1))
		}
		b'{' => {
			let (key, key_end) = parse_one(bytes, pos + 1)?;
			if !matches!(key, Kind::Basic(_) | Kind::AnyBasic) {
				return None;
			}
			let (value, value_end) = parse_one(bytes, key_end)?;
			if bytes.get(value_end) != Some(&b'}') {
				return None;
			}
			Some((
				Kind::DictEntry(TypeInfo::from_kind(key), TypeInfo::from_kind(value)),
				value_end + 1,
			))
		}
		c => {
			let basic = Basic::from_char(c as char)?;
			Some((Kind::Basic(basic), pos + 1))
		}
	}
}

/// Scans one complete type starting at `pos`, for embedded use by the
/// format-string layer.
pub(crate) fn scan_one_type(bytes: &[u8], pos: usize) -> Option<(TypeInfo, usize)> {
	parse_one(bytes, pos).map(|(kind, end)| (TypeInfo::from_kind(kind), end))
}

fn first_error_offset(bytes: &[u8]) -> usize {
	// Re-scan to locate where parsing stops making progress.
	let mut at = 0;
	while let Some((_, end)) = parse_one(bytes, at) {
		if end <= at {
			break;
		}
		at = end;
	}
	at
}

/// Whether `s` is a well-formed signature: zero or more complete definite
/// types.
#[must_use]
pub fn signature_is_valid(s: &str) -> bool {
	let bytes = s.as_bytes();
	let mut at = 0;
	while at < bytes.len() {
		match parse_one(bytes, at) {
			Some((kind, end)) if TypeInfo::from_kind(kind.clone()).is_definite() => at = end,
			_ => return false,
		}
	}
	true
}

/// Parses a signature into the sequence of complete types it concatenates.
pub fn parse_signature(s: &str) -> Result<Vec<TypeInfo>, InvalidTypeString> {
	let bytes = s.as_bytes();
	let mut at = 0;
	let mut out = Vec::new();
	while at < bytes.len() {
		let (kind, end) = parse_one(bytes, at).ok_or_else(|| InvalidTypeString {
			text: s.to_owned(),
			offset: at,
		})?;
		let info = TypeInfo::from_kind(kind);
		if !info.is_definite() {
			return Err(InvalidTypeString {
				text: s.to_owned(),
				offset: at,
			});
		}
		out.push(info);
		at = end;
	}
	Ok(out)
}
