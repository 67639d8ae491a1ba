//! Bit-level serialiser for the D-Bus marshalling format.
//!
//! # Purpose
//!
//! - Define the small serialiser interface the value engine consumes:
//!   [`needed_size`], [`serialise`], [`get_child`], [`n_children`],
//!   [`byteswap`] and [`is_normal`].
//! - Fix the wire layout: fixed alignments for the basic types, u32
//!   length-prefixed NUL-terminated strings and length-prefixed arrays,
//!   8-byte aligned tuples and dict entries, and the variant header
//!   (signature, then payload).
//!
//! # Mental model
//!
//! Every serialised value occupies a window whose start is aligned to the
//! value's own alignment, counting from the start of the enclosing buffer.
//! Container alignments are chosen so that this property is inherited by
//! children (a container's alignment is at least each child's), which makes
//! all offset arithmetic context-free: sizes and child windows can be
//! computed from a window alone, without knowing where the window sits in
//! an outer message.
//!
//! All scanning functions are total over arbitrary byte windows: malformed
//! input yields `None`, never a panic, and the caller substitutes the
//! zeros-buffer default.

use crate::typeinfo::{parse_signature, signature_is_valid, Basic, TypeInfo};
use std::ops::Range;

/// Byte order of a serialised window relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Order {
	Native,
	Swapped,
}

/// One child of a container being serialised.
///
/// The engine hands the serialiser its children behind this trait so the
/// serialiser stays independent of the value representation.
pub(crate) trait SerialChild {
	fn child_type(&self) -> TypeInfo;
	/// Serialised size; must already be known and valid.
	fn serial_size(&self) -> usize;
	/// Writes exactly `serial_size()` bytes.
	fn write_to(&self, dest: &mut [u8]);
}

pub(crate) fn align_up(offset: usize, alignment: usize) -> usize {
	(offset + alignment - 1) & !(alignment - 1)
}

fn read_u32(bytes: &[u8], at: usize, order: Order) -> Option<u32> {
	let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
	Some(match order {
		Order::Native => u32::from_ne_bytes(raw),
		Order::Swapped => u32::from_ne_bytes(raw).swap_bytes(),
	})
}

/// Total serialised size of the value of `info` at the start of `window`,
/// reading length prefixes in `order`. `None` if the window is malformed
/// or too short.
pub(crate) fn total_size(info: &TypeInfo, window: &[u8], order: Order) -> Option<usize> {
	if let Some(fixed) = info.fixed_size() {
		return (window.len() >= fixed).then_some(fixed);
	}
	match info.as_basic() {
		Some(Basic::Str | Basic::ObjectPath) => {
			let len = read_u32(window, 0, order)? as usize;
			let total = 4usize.checked_add(len)?.checked_add(1)?;
			(window.len() >= total).then_some(total)
		}
		Some(Basic::Signature) => {
			let len = *window.first()? as usize;
			let total = 2 + len;
			(window.len() >= total).then_some(total)
		}
		Some(_) | None => total_size_container(info, window, order),
	}
}

fn total_size_container(info: &TypeInfo, window: &[u8], order: Order) -> Option<usize> {
	if info.is_array() {
		let data_len = read_u32(window, 0, order)? as usize;
		let data_off = align_up(4, info.element().alignment());
		let total = data_off.checked_add(data_len)?;
		return (window.len() >= total).then_some(total);
	}
	if info.is_maybe() {
		return match *window.first()? {
			0 => Some(1),
			1 => {
				let element = info.element();
				let elem_off = align_up(1, element.alignment());
				let elem_len = total_size(element, window.get(elem_off..)?, order)?;
				Some(elem_off + elem_len)
			}
			_ => None,
		};
	}
	if info.is_variant() {
		let (payload_type, payload_off) = variant_header(window)?;
		let payload_len = total_size(&payload_type, window.get(payload_off..)?, order)?;
		return Some(payload_off + payload_len);
	}
	if info.is_tuple() || info.is_dict_entry() {
		let n = info.n_items();
		if n == 0 {
			return (!window.is_empty()).then_some(1);
		}
		let mut offset = 0usize;
		for i in 0..n {
			let item = info.item(i);
			offset = align_up(offset, item.alignment());
			let len = total_size(item, window.get(offset..)?, order)?;
			offset += len;
		}
		let total = align_up(offset, 8);
		return (window.len() >= total).then_some(total);
	}
	None
}

/// Parses a variant header: signature length byte, signature, NUL.
///
/// Returns the payload type and the (8-aligned) payload offset.
fn variant_header(window: &[u8]) -> Option<(TypeInfo, usize)> {
	let sig_len = *window.first()? as usize;
	let sig = window.get(1..1 + sig_len)?;
	if window.get(1 + sig_len) != Some(&0) {
		return None;
	}
	let sig = std::str::from_utf8(sig).ok()?;
	let payload_type = TypeInfo::try_new(sig).ok()?;
	if !payload_type.is_definite() {
		return None;
	}
	Some((payload_type, align_up(2 + sig_len, 8)))
}

/// Number of direct children of the serialised value in `window`.
///
/// Malformed data clamps to zero children (arrays, maybes) or the static
/// child count of the type (tuples, dict entries, variants).
pub(crate) fn n_children(info: &TypeInfo, window: &[u8], order: Order) -> usize {
	if info.is_variant() {
		return 1;
	}
	if info.is_maybe() {
		return match window.first() {
			Some(&1) => 1,
			_ => 0,
		};
	}
	if info.is_tuple() || info.is_dict_entry() {
		return info.n_items();
	}
	if info.is_array() {
		let element = info.element();
		let data_off = align_up(4, element.alignment());
		let Some(data_len) = read_u32(window, 0, order).map(|l| l as usize) else {
			return 0;
		};
		if window.len() < data_off + data_len {
			return 0;
		}
		let data = &window[data_off..data_off + data_len];
		if let Some(fixed) = element.fixed_size() {
			let stride = fixed.max(1);
			if data_len % stride != 0 {
				return 0;
			}
			return data_len / stride;
		}
		// Variable-size elements: walk the data counting.
		let mut offset = 0usize;
		let mut count = 0usize;
		while offset < data.len() {
			offset = align_up(offset, element.alignment());
			let Some(len) = total_size(element, &data[offset.min(data.len())..], order) else {
				return 0;
			};
			offset += len;
			count += 1;
		}
		return count;
	}
	0
}

/// Window of the `index`-th child of the serialised container in `window`.
///
/// Returns the child's type and its byte range within `window`, or `None`
/// when the data is malformed or the index is out of range.
pub(crate) fn get_child(
	info: &TypeInfo,
	window: &[u8],
	index: usize,
	order: Order,
) -> Option<(TypeInfo, Range<usize>)> {
	if info.is_variant() {
		if index != 0 {
			return None;
		}
		let (payload_type, payload_off) = variant_header(window)?;
		let payload_len = total_size(&payload_type, window.get(payload_off..)?, order)?;
		return Some((payload_type, payload_off..payload_off + payload_len));
	}
	if info.is_maybe() {
		if index != 0 || window.first() != Some(&1) {
			return None;
		}
		let element = info.element();
		let elem_off = align_up(1, element.alignment());
		let elem_len = total_size(element, window.get(elem_off..)?, order)?;
		return Some((element.clone(), elem_off..elem_off + elem_len));
	}
	if info.is_tuple() || info.is_dict_entry() {
		if index >= info.n_items() {
			return None;
		}
		let mut offset = 0usize;
		for i in 0..=index {
			let item = info.item(i);
			offset = align_up(offset, item.alignment());
			let len = total_size(item, window.get(offset..)?, order)?;
			if i == index {
				return Some((item.clone(), offset..offset + len));
			}
			offset += len;
		}
		unreachable!()
	}
	if info.is_array() {
		let element = info.element();
		let data_off = align_up(4, element.alignment());
		let data_len = read_u32(window, 0, order)? as usize;
		if window.len() < data_off + data_len {
			return None;
		}
		if let Some(fixed) = element.fixed_size() {
			let stride = fixed.max(1);
			let start = data_off + index.checked_mul(stride)?;
			let end = start + stride;
			if end > data_off + data_len {
				return None;
			}
			return Some((element.clone(), start..end));
		}
		let mut offset = data_off;
		let end = data_off + data_len;
		let mut at = 0usize;
		while offset < end {
			offset = align_up(offset, element.alignment());
			let len = total_size(element, window.get(offset..end)?, order)?;
			if at == index {
				return Some((element.clone(), offset..offset + len));
			}
			offset += len;
			at += 1;
		}
		return None;
	}
	None
}

/// Serialised size of a container assembled from `children`.
pub(crate) fn needed_size(info: &TypeInfo, children: &[&dyn SerialChild]) -> usize {
	if info.is_variant() {
		debug_assert_eq!(children.len(), 1);
		let sig_len = children[0].child_type().type_string().len();
		return align_up(2 + sig_len, 8) + children[0].serial_size();
	}
	if info.is_maybe() {
		return match children {
			[] => 1,
			[child] => align_up(1, info.element().alignment()) + child.serial_size(),
			_ => panic!("maybe value with {} children", children.len()),
		};
	}
	if info.is_tuple() || info.is_dict_entry() {
		if children.is_empty() {
			return 1;
		}
		let mut offset = 0usize;
		for child in children {
			offset = align_up(offset, child.child_type().alignment());
			offset += child.serial_size();
		}
		return align_up(offset, 8);
	}
	if info.is_array() {
		let alignment = info.element().alignment();
		let mut offset = align_up(4, alignment);
		for child in children {
			offset = align_up(offset, alignment);
			offset += child.serial_size();
		}
		return offset;
	}
	panic!("needed_size() on non-container type {info}");
}

/// Serialises a container from `children` into `dest`, which must be
/// exactly [`needed_size`] bytes and comes zero-filled (padding stays
/// zero).
pub(crate) fn serialise(info: &TypeInfo, dest: &mut [u8], children: &[&dyn SerialChild]) {
	debug_assert_eq!(dest.len(), needed_size(info, children));
	debug_assert!(dest.iter().all(|&b| b == 0), "serialise into dirty buffer");

	if info.is_variant() {
		let child = children[0];
		let sig = child.child_type();
		let sig = sig.type_string();
		dest[0] = sig.len() as u8;
		dest[1..1 + sig.len()].copy_from_slice(sig.as_bytes());
		// NUL already present.
		let payload_off = align_up(2 + sig.len(), 8);
		child.write_to(&mut dest[payload_off..payload_off + child.serial_size()]);
		return;
	}
	if info.is_maybe() {
		if let [child] = children {
			dest[0] = 1;
			let elem_off = align_up(1, info.element().alignment());
			child.write_to(&mut dest[elem_off..elem_off + child.serial_size()]);
		}
		return;
	}
	if info.is_tuple() || info.is_dict_entry() {
		let mut offset = 0usize;
		for child in children {
			offset = align_up(offset, child.child_type().alignment());
			let len = child.serial_size();
			child.write_to(&mut dest[offset..offset + len]);
			offset += len;
		}
		return;
	}
	if info.is_array() {
		let alignment = info.element().alignment();
		let data_off = align_up(4, alignment);
		let mut offset = data_off;
		for child in children {
			offset = align_up(offset, alignment);
			let len = child.serial_size();
			child.write_to(&mut dest[offset..offset + len]);
			offset += len;
		}
		let data_len = (offset - data_off) as u32;
		dest[0..4].copy_from_slice(&data_len.to_ne_bytes());
		return;
	}
	panic!("serialise() on non-container type {info}");
}

/// Swaps every multi-byte scalar (including length prefixes) in `window`
/// from foreign order to host order, in place.
///
/// Malformed input is swapped as far as it can be navigated and then left
/// alone; `false` reports that the walk could not finish and the caller
/// should fall back to reconstruction.
pub(crate) fn byteswap(info: &TypeInfo, window: &mut [u8]) -> bool {
	swap_walk(info, window, 0, Order::Swapped).is_some()
}

#[cfg(test)]
pub(crate) fn byteswap_to_foreign(info: &TypeInfo, window: &mut [u8]) {
	let _ = swap_walk(info, window, 0, Order::Native);
}

fn swap_scalar(window: &mut [u8], at: usize, width: usize) -> Option<()> {
	window.get_mut(at..at + width)?.reverse();
	Some(())
}

/// Swaps the value of `info` at `at`, reading prefixes in `read` order
/// (the order the buffer is currently in); returns the offset one past it.
fn swap_walk(info: &TypeInfo, window: &mut [u8], at: usize, read: Order) -> Option<usize> {
	if let Some(basic) = info.as_basic() {
		return match basic {
			Basic::Byte => Some(at + 1),
			Basic::Int16 | Basic::Uint16 => swap_scalar(window, at, 2).map(|()| at + 2),
			Basic::Bool | Basic::Int32 | Basic::Uint32 | Basic::Handle => {
				swap_scalar(window, at, 4).map(|()| at + 4)
			}
			Basic::Int64 | Basic::Uint64 | Basic::Double => {
				swap_scalar(window, at, 8).map(|()| at + 8)
			}
			Basic::Str | Basic::ObjectPath => {
				let len = read_u32(window, at, read)? as usize;
				swap_scalar(window, at, 4)?;
				let end = at + 4 + len + 1;
				(window.len() >= end).then_some(end)
			}
			Basic::Signature => {
				let len = *window.get(at)? as usize;
				let end = at + 2 + len;
				(window.len() >= end).then_some(end)
			}
		};
	}
	if info.is_variant() {
		let (payload_type, payload_off) = variant_header(window.get(at..)?)?;
		return swap_walk(&payload_type, window, at + payload_off, read);
	}
	if info.is_maybe() {
		return match *window.get(at)? {
			0 => Some(at + 1),
			1 => {
				let element = info.element().clone();
				let elem_at = at + align_up(1, element.alignment());
				swap_walk(&element, window, elem_at, read)
			}
			_ => None,
		};
	}
	if info.is_tuple() || info.is_dict_entry() {
		let n = info.n_items();
		if n == 0 {
			return Some(at + 1);
		}
		let mut offset = 0usize;
		for i in 0..n {
			let item = info.item(i).clone();
			offset = align_up(offset, item.alignment());
			let end = swap_walk(&item, window, at + offset, read)?;
			offset = end - at;
		}
		Some(at + align_up(offset, 8))
	} else if info.is_array() {
		let element = info.element().clone();
		let data_len = read_u32(window, at, read)? as usize;
		swap_scalar(window, at, 4)?;
		let data_off = align_up(4, element.alignment());
		let end = at + data_off + data_len;
		if window.len() < end {
			return None;
		}
		let mut offset = at + data_off;
		while offset < end {
			offset = align_up(offset - at, element.alignment()) + at;
			offset = swap_walk(&element, window, offset, read)?;
		}
		Some(end)
	} else {
		None
	}
}

/// Whether `window` is exactly the canonical (normalised) serialisation of
/// a value of type `info` in host byte order: in-bounds lengths, zeroed
/// padding, valid UTF-8 / object paths / signatures, boolean and maybe
/// flags in range.
pub(crate) fn is_normal(info: &TypeInfo, window: &[u8]) -> bool {
	normal_size(info, window) == Some(window.len())
}

/// Like [`total_size`] but validating contents; padding-byte checks apply
/// to the whole prefix of `window` the value occupies.
fn normal_size(info: &TypeInfo, window: &[u8]) -> Option<usize> {
	if let Some(basic) = info.as_basic() {
		return normal_size_basic(basic, window);
	}
	if info.is_variant() {
		let (payload_type, payload_off) = variant_header(window)?;
		let sig_end = 2 + payload_type.type_string().len();
		all_zero(window.get(sig_end..payload_off)?)?;
		let payload_len = normal_size(&payload_type, window.get(payload_off..)?)?;
		return Some(payload_off + payload_len);
	}
	if info.is_maybe() {
		return match *window.first()? {
			0 => Some(1),
			1 => {
				let element = info.element();
				let elem_off = align_up(1, element.alignment());
				all_zero(window.get(1..elem_off)?)?;
				let elem_len = normal_size(element, window.get(elem_off..)?)?;
				Some(elem_off + elem_len)
			}
			_ => None,
		};
	}
	if info.is_tuple() || info.is_dict_entry() {
		let n = info.n_items();
		if n == 0 {
			return (*window.first()? == 0).then_some(1);
		}
		let mut offset = 0usize;
		for i in 0..n {
			let item = info.item(i);
			let item_off = align_up(offset, item.alignment());
			all_zero(window.get(offset..item_off)?)?;
			let len = normal_size(item, window.get(item_off..)?)?;
			offset = item_off + len;
		}
		let total = align_up(offset, 8);
		all_zero(window.get(offset..total)?)?;
		Some(total)
	} else if info.is_array() {
		let element = info.element();
		let data_len = read_u32(window, 0, Order::Native)? as usize;
		let data_off = align_up(4, element.alignment());
		all_zero(window.get(4..data_off)?)?;
		let end = data_off + data_len;
		if window.len() < end {
			return None;
		}
		let mut offset = data_off;
		while offset < end {
			let elem_off = align_up(offset, element.alignment());
			all_zero(window.get(offset..elem_off)?)?;
			let len = normal_size(element, window.get(elem_off..end)?)?;
			offset = elem_off + len;
		}
		(offset == end).then_some(end)
	} else {
		None
	}
}

fn normal_size_basic(basic: Basic, window: &[u8]) -> Option<usize> {
	match basic {
		Basic::Byte => (!window.is_empty()).then_some(1),
		Basic::Bool => {
			let v = read_u32(window, 0, Order::Native)?;
			(v <= 1).then_some(4)
		}
		Basic::Int16 | Basic::Uint16 => (window.len() >= 2).then_some(2),
		Basic::Int32 | Basic::Uint32 | Basic::Handle => (window.len() >= 4).then_some(4),
		Basic::Int64 | Basic::Uint64 | Basic::Double => (window.len() >= 8).then_some(8),
		Basic::Str => {
			let len = read_u32(window, 0, Order::Native)? as usize;
			let text = window.get(4..4 + len)?;
			if window.get(4 + len) != Some(&0) || text.contains(&0) {
				return None;
			}
			std::str::from_utf8(text).ok()?;
			Some(4 + len + 1)
		}
		Basic::ObjectPath => {
			let len = read_u32(window, 0, Order::Native)? as usize;
			let text = window.get(4..4 + len)?;
			if window.get(4 + len) != Some(&0) {
				return None;
			}
			let text = std::str::from_utf8(text).ok()?;
			object_path_is_valid(text).then_some(4 + len + 1)
		}
		Basic::Signature => {
			let len = *window.first()? as usize;
			let text = window.get(1..1 + len)?;
			if window.get(1 + len) != Some(&0) {
				return None;
			}
			let text = std::str::from_utf8(text).ok()?;
			signature_is_valid(text).then_some(2 + len)
		}
	}
}

fn all_zero(bytes: &[u8]) -> Option<()> {
	bytes.iter().all(|&b| b == 0).then_some(())
}

/// Whether `path` is a well-formed object path: absolute, `/`-separated
/// non-empty elements of `[A-Za-z0-9_]`, no trailing `/` except the root.
#[must_use]
pub fn object_path_is_valid(path: &str) -> bool {
	if path == "/" {
		return true;
	}
	let Some(rest) = path.strip_prefix('/') else {
		return false;
	};
	if rest.is_empty() || path.ends_with('/') {
		return false;
	}
	rest.split('/')
		.all(|elem| !elem.is_empty() && elem.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'))
}

/// The serialised size the zeros policy assigns to a clamped child of type
/// `info`: the fixed size when there is one, otherwise the size of the
/// shortest serialisation (empty string, empty array, Nothing, ...).
pub(crate) fn default_serial_size(info: &TypeInfo) -> usize {
	if let Some(fixed) = info.fixed_size() {
		return fixed;
	}
	match info.as_basic() {
		Some(Basic::Str | Basic::ObjectPath) => 5,
		Some(Basic::Signature) => 2,
		_ => {
			if info.is_array() {
				4
			} else if info.is_maybe() {
				1
			} else if info.is_variant() {
				8
			} else if info.is_tuple() || info.is_dict_entry() {
				let n = info.n_items();
				let mut offset = 0usize;
				for i in 0..n {
					let item = info.item(i);
					offset = align_up(offset, item.alignment());
					offset += default_serial_size(item);
				}
				if offset == 0 { 1 } else { align_up(offset, 8) }
			} else {
				1
			}
		}
	}
}
