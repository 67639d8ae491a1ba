//! The raw message type and its wire form.
//!
//! A message is a fixed preamble (endianness, kind, flags, protocol
//! version, body length, serial), a header-field array of `(yv)` entries,
//! padding to an 8-byte boundary, and the body: the serialisation of the
//! argument tuple. Marshalling goes through the variant engine; parsing
//! loads the field array and body as lazily-validated values with the
//! endianness recorded in the preamble.

use bitflags::bitflags;
use thiserror::Error;

use minibus_variant::{Builder, LoadFlags, TypeInfo, Value};

use crate::names::{is_valid_bus_name, is_valid_interface_name, is_valid_member_name};

/// Message serial number; non-zero once assigned by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Serial(pub u32);

/// Classification of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
	MethodCall,
	MethodReturn,
	Error,
	Signal,
}

impl MessageKind {
	fn wire_value(self) -> u8 {
		match self {
			MessageKind::MethodCall => 1,
			MessageKind::MethodReturn => 2,
			MessageKind::Error => 3,
			MessageKind::Signal => 4,
		}
	}

	fn from_wire(value: u8) -> Option<MessageKind> {
		Some(match value {
			1 => MessageKind::MethodCall,
			2 => MessageKind::MethodReturn,
			3 => MessageKind::Error,
			4 => MessageKind::Signal,
			_ => return None,
		})
	}
}

bitflags! {
	/// Per-message flags.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct MessageFlags: u8 {
		/// The sender does not want a reply.
		const NO_REPLY_EXPECTED = 1 << 0;
		/// Delivery must not start the destination service.
		const NO_AUTO_START = 1 << 1;
	}
}

/// Malformed wire data.
#[derive(Debug, Error)]
pub enum FrameError {
	#[error("message preamble truncated")]
	Truncated,
	#[error("unsupported protocol version {0}")]
	Version(u8),
	#[error("unknown endianness marker {0:#x}")]
	Endianness(u8),
	#[error("unknown message kind {0}")]
	Kind(u8),
	#[error("message of {0} bytes exceeds the size cap")]
	TooLarge(usize),
	#[error("header field {field} is malformed")]
	Field { field: u8 },
	#[error("message is missing required header fields")]
	MissingFields,
	#[error("body signature {0:?} is malformed")]
	Signature(String),
}

const PROTOCOL_VERSION: u8 = 1;
// Sanity cap; a peer sending more than this is broken or hostile.
pub(crate) const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;

/// A raw D-Bus message.
#[derive(Debug, Clone)]
pub struct Message {
	pub kind: MessageKind,
	pub flags: MessageFlags,
	/// Assigned by the sending connection just before transmission.
	pub serial: Serial,
	pub path: Option<String>,
	pub interface: Option<String>,
	pub member: Option<String>,
	pub error_name: Option<String>,
	pub reply_serial: Option<Serial>,
	pub destination: Option<String>,
	pub sender: Option<String>,
	/// The argument tuple, absent when the message carries no arguments.
	pub body: Option<Value>,
}

impl Message {
	fn empty(kind: MessageKind) -> Message {
		Message {
			kind,
			flags: MessageFlags::empty(),
			serial: Serial(0),
			path: None,
			interface: None,
			member: None,
			error_name: None,
			reply_serial: None,
			destination: None,
			sender: None,
			body: None,
		}
	}

	/// A new method call.
	///
	/// # Panics
	///
	/// Panics on a syntactically invalid destination, path, interface or
	/// member.
	#[must_use]
	pub fn new_method_call(
		destination: Option<&str>,
		path: &str,
		interface: Option<&str>,
		member: &str,
	) -> Message {
		assert!(
			minibus_variant::object_path_is_valid(path),
			"invalid object path {path:?}"
		);
		assert!(is_valid_member_name(member), "invalid member name {member:?}");
		if let Some(destination) = destination {
			assert!(is_valid_bus_name(destination), "invalid bus name {destination:?}");
		}
		if let Some(interface) = interface {
			assert!(is_valid_interface_name(interface), "invalid interface name {interface:?}");
		}
		let mut message = Message::empty(MessageKind::MethodCall);
		message.destination = destination.map(str::to_owned);
		message.path = Some(path.to_owned());
		message.interface = interface.map(str::to_owned);
		message.member = Some(member.to_owned());
		message
	}

	/// A new signal emission.
	///
	/// # Panics
	///
	/// Panics on a syntactically invalid path, interface or member.
	#[must_use]
	pub fn new_signal(path: &str, interface: &str, member: &str) -> Message {
		assert!(
			minibus_variant::object_path_is_valid(path),
			"invalid object path {path:?}"
		);
		assert!(is_valid_interface_name(interface), "invalid interface name {interface:?}");
		assert!(is_valid_member_name(member), "invalid member name {member:?}");
		let mut message = Message::empty(MessageKind::Signal);
		message.path = Some(path.to_owned());
		message.interface = Some(interface.to_owned());
		message.member = Some(member.to_owned());
		message
	}

	/// A new method return replying to `reply_serial`.
	#[must_use]
	pub fn new_method_return(reply_serial: Serial) -> Message {
		let mut message = Message::empty(MessageKind::MethodReturn);
		message.reply_serial = Some(reply_serial);
		message.flags = MessageFlags::NO_REPLY_EXPECTED;
		message
	}

	/// A new error reply carrying `error_name` and a human-readable text.
	#[must_use]
	pub fn new_error(reply_serial: Serial, error_name: &str, text: &str) -> Message {
		assert!(is_valid_interface_name(error_name), "invalid error name {error_name:?}");
		let mut message = Message::empty(MessageKind::Error);
		message.reply_serial = Some(reply_serial);
		message.error_name = Some(error_name.to_owned());
		message.flags = MessageFlags::NO_REPLY_EXPECTED;
		message.set_args(Value::new_string(text));
		message
	}

	/// Sets the argument tuple. A non-tuple value is boxed into a
	/// one-item tuple.
	pub fn set_args(&mut self, args: Value) {
		let args = if args.type_info().is_tuple() {
			args
		} else {
			minibus_variant::build("(@*)", vec![minibus_variant::Arg::Value(args)])
		};
		self.body = Some(args);
	}

	/// The argument tuple, or the empty tuple when the body is absent.
	#[must_use]
	pub fn args(&self) -> Value {
		self.body
			.clone()
			.unwrap_or_else(|| Value::load(Some(&TypeInfo::tuple([])), vec![0], LoadFlags::TRUSTED))
	}

	/// The first argument, when it is a string.
	#[must_use]
	pub fn arg0(&self) -> Option<String> {
		let body = self.body.as_ref()?;
		if body.n_children() == 0 {
			return None;
		}
		let first = body.child_value(0);
		first
			.type_info()
			.as_basic()
			.is_some_and(|b| matches!(b, minibus_variant::Basic::Str))
			.then(|| first.as_str().to_owned())
	}

	/// The signature string of the argument tuple: the concatenation of
	/// the argument type strings.
	#[must_use]
	pub fn body_signature(&self) -> String {
		match &self.body {
			None => String::new(),
			Some(body) => {
				let info = body.type_info();
				(0..info.n_items()).map(|i| info.item(i).type_string()).collect()
			}
		}
	}

	/// Serialises the message in host byte order.
	#[must_use]
	pub fn to_bytes(&self) -> Vec<u8> {
		let fields = self.header_fields();
		fields.flatten();
		let body_bytes = self.body.as_ref().map(|b| {
			b.flatten();
			b.data()
		});
		let body_len = body_bytes.map_or(0, <[u8]>::len);

		let mut out = Vec::with_capacity(16 + fields.size() + body_len + 8);
		out.push(if cfg!(target_endian = "little") { b'l' } else { b'B' });
		out.push(self.kind.wire_value());
		out.push(self.flags.bits());
		out.push(PROTOCOL_VERSION);
		out.extend_from_slice(&(body_len as u32).to_ne_bytes());
		out.extend_from_slice(&self.serial.0.to_ne_bytes());
		out.extend_from_slice(fields.data());
		while out.len() % 8 != 0 {
			out.push(0);
		}
		if let Some(body) = body_bytes {
			out.extend_from_slice(body);
		}
		out
	}

	fn header_fields(&self) -> Value {
		let mut builder = Builder::new(&TypeInfo::new("a(yv)"));
		let entry_type = TypeInfo::new("(yv)");
		let mut push = |code: u8, value: Value| {
			builder.open(&entry_type);
			builder.add_value(Value::new_byte(code));
			builder.add_value(Value::new_variant(value));
			builder.close();
		};
		if let Some(path) = &self.path {
			push(FIELD_PATH, Value::new_object_path(path));
		}
		if let Some(interface) = &self.interface {
			push(FIELD_INTERFACE, Value::new_string(interface));
		}
		if let Some(member) = &self.member {
			push(FIELD_MEMBER, Value::new_string(member));
		}
		if let Some(error_name) = &self.error_name {
			push(FIELD_ERROR_NAME, Value::new_string(error_name));
		}
		if let Some(reply_serial) = self.reply_serial {
			push(FIELD_REPLY_SERIAL, Value::new_uint32(reply_serial.0));
		}
		if let Some(destination) = &self.destination {
			push(FIELD_DESTINATION, Value::new_string(destination));
		}
		if let Some(sender) = &self.sender {
			push(FIELD_SENDER, Value::new_string(sender));
		}
		if self.body.is_some() {
			push(FIELD_SIGNATURE, Value::new_signature(&self.body_signature()));
		}
		builder.end()
	}

	/// Total frame length implied by a 16-byte preamble prefix: preamble,
	/// field array, padding, body.
	pub fn frame_len(preamble: &[u8; 16]) -> Result<usize, FrameError> {
		let swap = match preamble[0] {
			b'l' => cfg!(target_endian = "big"),
			b'B' => cfg!(target_endian = "little"),
			other => return Err(FrameError::Endianness(other)),
		};
		if preamble[3] != PROTOCOL_VERSION {
			return Err(FrameError::Version(preamble[3]));
		}
		let read_u32 = |at: usize| {
			let raw = u32::from_ne_bytes(preamble[at..at + 4].try_into().expect("fixed slice"));
			if swap { raw.swap_bytes() } else { raw }
		};
		let body_len = read_u32(4) as usize;
		let fields_data_len = read_u32(12) as usize;
		// The field array serialisation is its u32 length, padding to the
		// 8-aligned element start, then the data.
		let fields_len = 8 + fields_data_len;
		let unpadded = 12 + fields_len;
		let total = unpadded.div_ceil(8) * 8 + body_len;
		if total > MAX_MESSAGE_SIZE {
			return Err(FrameError::TooLarge(total));
		}
		Ok(total)
	}

	/// Parses a complete frame.
	pub fn from_bytes(bytes: &[u8]) -> Result<Message, FrameError> {
		let preamble: &[u8; 16] = bytes
			.get(..16)
			.and_then(|p| p.try_into().ok())
			.ok_or(FrameError::Truncated)?;
		let total = Message::frame_len(preamble)?;
		if bytes.len() < total {
			return Err(FrameError::Truncated);
		}
		let kind = MessageKind::from_wire(preamble[1]).ok_or(FrameError::Kind(preamble[1]))?;
		let load_order = match preamble[0] {
			b'l' => LoadFlags::LITTLE_ENDIAN,
			_ => LoadFlags::BIG_ENDIAN,
		};
		let swap = match preamble[0] {
			b'l' => cfg!(target_endian = "big"),
			_ => cfg!(target_endian = "little"),
		};
		let read_u32 = |at: usize| {
			let raw = u32::from_ne_bytes(preamble[at..at + 4].try_into().expect("fixed slice"));
			if swap { raw.swap_bytes() } else { raw }
		};
		let body_len = read_u32(4) as usize;
		let serial = Serial(read_u32(8));
		let fields_data_len = read_u32(12) as usize;

		let fields_end = 12 + 8 + fields_data_len;
		let body_start = fields_end.div_ceil(8) * 8;
		let fields = Value::load(
			Some(&TypeInfo::new("a(yv)")),
			bytes[12..fields_end].to_vec(),
			load_order,
		);

		let mut message = Message::empty(kind);
		message.serial = serial;
		message.flags = MessageFlags::from_bits_truncate(preamble[2]);

		// Field values arrive inside variants of untrusted provenance, so
		// every access is type-checked rather than panicking.
		let field_str = |value: &Value, code: u8| match value.classify() {
			minibus_variant::Class::Str | minibus_variant::Class::ObjectPath => {
				Ok(value.as_str().to_owned())
			}
			_ => Err(FrameError::Field { field: code }),
		};
		let mut signature = None;
		for i in 0..fields.n_children() {
			let entry = fields.child_value(i);
			let code = entry.child_value(0).as_byte();
			let value = entry.child_value(1).child_value(0);
			match code {
				FIELD_PATH => {
					let path = field_str(&value, code)?;
					if !minibus_variant::object_path_is_valid(&path) {
						return Err(FrameError::Field { field: code });
					}
					message.path = Some(path);
				}
				FIELD_INTERFACE => message.interface = Some(field_str(&value, code)?),
				FIELD_MEMBER => message.member = Some(field_str(&value, code)?),
				FIELD_ERROR_NAME => message.error_name = Some(field_str(&value, code)?),
				FIELD_REPLY_SERIAL => match value.classify() {
					minibus_variant::Class::Uint32 => {
						message.reply_serial = Some(Serial(value.as_uint32()));
					}
					_ => return Err(FrameError::Field { field: code }),
				},
				FIELD_DESTINATION => message.destination = Some(field_str(&value, code)?),
				FIELD_SENDER => message.sender = Some(field_str(&value, code)?),
				FIELD_SIGNATURE => match value.classify() {
					minibus_variant::Class::Signature => {
						signature = Some(value.as_signature().to_owned());
					}
					_ => return Err(FrameError::Field { field: code }),
				},
				// Unknown header fields are ignored for forward
				// compatibility.
				_ => {}
			}
		}

		if body_len > 0 {
			let signature = signature.ok_or(FrameError::MissingFields)?;
			let body_type = TypeInfo::try_new(&format!("({signature})"))
				.map_err(|_| FrameError::Signature(signature.clone()))?;
			let body = Value::load(
				Some(&body_type),
				bytes[body_start..body_start + body_len].to_vec(),
				load_order,
			);
			message.body = Some(body);
		}

		match kind {
			MessageKind::MethodCall if message.path.is_none() || message.member.is_none() => {
				Err(FrameError::MissingFields)
			}
			MessageKind::Signal
				if message.path.is_none()
					|| message.interface.is_none()
					|| message.member.is_none() =>
			{
				Err(FrameError::MissingFields)
			}
			MessageKind::MethodReturn | MessageKind::Error
				if message.reply_serial.is_none() =>
			{
				Err(FrameError::MissingFields)
			}
			_ => Ok(message),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use minibus_variant::Arg;

	#[test]
	fn method_call_round_trip() {
		let mut message = Message::new_method_call(
			Some("org.freedesktop.DBus"),
			"/org/freedesktop/DBus",
			Some("org.freedesktop.DBus"),
			"RequestName",
		);
		message.serial = Serial(7);
		message.set_args(minibus_variant::build(
			"(su)",
			vec![Arg::Str("org.example.Name"), Arg::Uint32(3)],
		));

		let bytes = message.to_bytes();
		let preamble: &[u8; 16] = bytes[..16].try_into().unwrap();
		assert_eq!(Message::frame_len(preamble).unwrap(), bytes.len());

		let parsed = Message::from_bytes(&bytes).unwrap();
		assert_eq!(parsed.kind, MessageKind::MethodCall);
		assert_eq!(parsed.serial, Serial(7));
		assert_eq!(parsed.destination.as_deref(), Some("org.freedesktop.DBus"));
		assert_eq!(parsed.member.as_deref(), Some("RequestName"));
		assert_eq!(parsed.body_signature(), "su");
		let args = parsed.args();
		assert_eq!(args.child_value(0).as_str(), "org.example.Name");
		assert_eq!(args.child_value(1).as_uint32(), 3);
	}

	#[test]
	fn bodyless_messages_round_trip() {
		let mut message = Message::new_signal("/org/example", "org.example.Iface", "Changed");
		message.serial = Serial(1);
		let parsed = Message::from_bytes(&message.to_bytes()).unwrap();
		assert_eq!(parsed.kind, MessageKind::Signal);
		assert_eq!(parsed.interface.as_deref(), Some("org.example.Iface"));
		assert!(parsed.body.is_none());
		assert_eq!(parsed.args().n_children(), 0);
	}

	#[test]
	fn error_reply_round_trip() {
		let mut error = Message::new_error(Serial(9), "org.freedesktop.DBus.Error.Failed", "boom");
		error.serial = Serial(10);
		let parsed = Message::from_bytes(&error.to_bytes()).unwrap();
		assert_eq!(parsed.kind, MessageKind::Error);
		assert_eq!(parsed.reply_serial, Some(Serial(9)));
		assert_eq!(parsed.error_name.as_deref(), Some("org.freedesktop.DBus.Error.Failed"));
		assert_eq!(parsed.arg0().as_deref(), Some("boom"));
	}

	#[test]
	fn rejects_malformed_preambles() {
		assert!(matches!(Message::from_bytes(&[]), Err(FrameError::Truncated)));
		let mut bytes = Message::new_signal("/x", "a.b", "C").to_bytes();
		bytes[0] = b'?';
		assert!(matches!(Message::from_bytes(&bytes), Err(FrameError::Endianness(_))));
		let mut bytes = Message::new_signal("/x", "a.b", "C").to_bytes();
		bytes[3] = 9;
		assert!(matches!(Message::from_bytes(&bytes), Err(FrameError::Version(9))));
	}

	#[test]
	fn missing_required_fields_are_rejected() {
		let mut message = Message::empty(MessageKind::MethodCall);
		message.serial = Serial(2);
		let bytes = message.to_bytes();
		assert!(matches!(Message::from_bytes(&bytes), Err(FrameError::MissingFields)));
	}
}
