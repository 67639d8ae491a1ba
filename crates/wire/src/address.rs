//! Bus address parsing and bus-type resolution.
//!
//! Addresses use the D-Bus form `transport:key=value[,key=value]…` with
//! `;`-separated fallback entries. Values may carry `%XX` escapes. The
//! session/system selection reads the standard environment variables at
//! connect time.

use std::fmt;

use thiserror::Error;

/// Which message bus a shared connection attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusType {
	/// The login-session bus (`DBUS_SESSION_BUS_ADDRESS`).
	Session,
	/// The system-wide bus (`DBUS_SYSTEM_BUS_ADDRESS`).
	System,
	/// The bus that activated this process (`DBUS_STARTER_ADDRESS`).
	Starter,
}

/// Address failure: missing, unparseable, or with no usable entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
	#[error("no address configured for the {0:?} bus")]
	NoServer(BusType),
	#[error("malformed bus address {address:?}: {reason}")]
	Bad { address: String, reason: &'static str },
}

/// One concrete endpoint within an address list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressEntry {
	/// A Unix domain socket, by filesystem path or abstract name.
	Unix { path: Option<String>, abstract_name: Option<String> },
	/// A TCP endpoint.
	Tcp { host: String, port: u16 },
}

impl fmt::Display for AddressEntry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			AddressEntry::Unix { path: Some(path), .. } => write!(f, "unix:path={path}"),
			AddressEntry::Unix { abstract_name: Some(name), .. } => {
				write!(f, "unix:abstract={name}")
			}
			AddressEntry::Unix { .. } => write!(f, "unix:"),
			AddressEntry::Tcp { host, port } => write!(f, "tcp:host={host},port={port}"),
		}
	}
}

/// A parsed bus address: one or more entries tried in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
	entries: Vec<AddressEntry>,
}

impl Address {
	/// Parses an address string.
	///
	/// Entries with an unknown transport are skipped (they are fallbacks
	/// for other implementations); an address where no entry is usable is
	/// an error.
	pub fn parse(address: &str) -> Result<Address, AddressError> {
		let bad = |reason| AddressError::Bad {
			address: address.to_owned(),
			reason,
		};
		let mut entries = Vec::new();
		for part in address.split(';') {
			if part.is_empty() {
				continue;
			}
			let (transport, rest) = part.split_once(':').ok_or_else(|| bad("missing transport prefix"))?;
			let mut pairs = Vec::new();
			for kv in rest.split(',') {
				if kv.is_empty() {
					continue;
				}
				let (key, value) = kv.split_once('=').ok_or_else(|| bad("key without value"))?;
				pairs.push((key, unescape(value).ok_or_else(|| bad("invalid escape"))?));
			}
			match transport {
				"unix" => {
					let path = pairs.iter().find(|(k, _)| *k == "path").map(|(_, v)| v.clone());
					let abstract_name =
						pairs.iter().find(|(k, _)| *k == "abstract").map(|(_, v)| v.clone());
					if path.is_none() && abstract_name.is_none() {
						return Err(bad("unix transport needs path= or abstract="));
					}
					entries.push(AddressEntry::Unix { path, abstract_name });
				}
				"tcp" => {
					let host = pairs
						.iter()
						.find(|(k, _)| *k == "host")
						.map(|(_, v)| v.clone())
						.ok_or_else(|| bad("tcp transport needs host="))?;
					let port = pairs
						.iter()
						.find(|(k, _)| *k == "port")
						.and_then(|(_, v)| v.parse().ok())
						.ok_or_else(|| bad("tcp transport needs a numeric port="))?;
					entries.push(AddressEntry::Tcp { host, port });
				}
				// Unknown transports are skipped, not fatal.
				_ => {}
			}
		}
		if entries.is_empty() {
			return Err(bad("no usable entry"));
		}
		Ok(Address { entries })
	}

	/// The entries, in connection-attempt order.
	#[must_use]
	pub fn entries(&self) -> &[AddressEntry] {
		&self.entries
	}

	/// Resolves the address for `bus` from the environment.
	pub fn for_bus(bus: BusType) -> Result<Address, AddressError> {
		let configured = match bus {
			BusType::Session => std::env::var("DBUS_SESSION_BUS_ADDRESS").ok(),
			BusType::System => std::env::var("DBUS_SYSTEM_BUS_ADDRESS")
				.ok()
				.or_else(|| Some("unix:path=/var/run/dbus/system_bus_socket".to_owned())),
			BusType::Starter => match std::env::var("DBUS_STARTER_ADDRESS").ok() {
				Some(address) => Some(address),
				None => {
					// Fall back through the starter bus type indirection.
					return match std::env::var("DBUS_STARTER_BUS_TYPE").ok().as_deref() {
						Some("session") => Address::for_bus(BusType::Session),
						Some("system") => Address::for_bus(BusType::System),
						_ => Err(AddressError::NoServer(bus)),
					};
				}
			},
		};
		let configured = configured.ok_or(AddressError::NoServer(bus))?;
		Address::parse(&configured).map_err(|_| AddressError::NoServer(bus))
	}
}

fn unescape(value: &str) -> Option<String> {
	if !value.contains('%') {
		return Some(value.to_owned());
	}
	let bytes = value.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut at = 0;
	while at < bytes.len() {
		if bytes[at] == b'%' {
			let hex = bytes.get(at + 1..at + 3)?;
			let hex = std::str::from_utf8(hex).ok()?;
			out.push(u8::from_str_radix(hex, 16).ok()?);
			at += 3;
		} else {
			out.push(bytes[at]);
			at += 1;
		}
	}
	String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_unix_entries() {
		let address = Address::parse("unix:path=/tmp/bus.sock").unwrap();
		assert_eq!(
			address.entries(),
			&[AddressEntry::Unix {
				path: Some("/tmp/bus.sock".to_owned()),
				abstract_name: None
			}]
		);

		let address = Address::parse("unix:abstract=/com/example/bus").unwrap();
		assert!(matches!(address.entries()[0], AddressEntry::Unix { path: None, .. }));
	}

	#[test]
	fn parses_tcp_and_fallback_lists() {
		let address = Address::parse("tcp:host=127.0.0.1,port=8000;unix:path=/tmp/x").unwrap();
		assert_eq!(address.entries().len(), 2);
		assert_eq!(
			address.entries()[0],
			AddressEntry::Tcp {
				host: "127.0.0.1".to_owned(),
				port: 8000
			}
		);
	}

	#[test]
	fn skips_unknown_transports() {
		let address = Address::parse("launchd:env=FOO;unix:path=/tmp/y").unwrap();
		assert_eq!(address.entries().len(), 1);
	}

	#[test]
	fn unescapes_values() {
		let address = Address::parse("unix:path=/tmp/with%20space").unwrap();
		assert_eq!(
			address.entries()[0],
			AddressEntry::Unix {
				path: Some("/tmp/with space".to_owned()),
				abstract_name: None
			}
		);
	}

	#[test]
	fn rejects_garbage() {
		assert!(Address::parse("").is_err());
		assert!(Address::parse("unix").is_err());
		assert!(Address::parse("unix:host").is_err());
		assert!(Address::parse("unix:port=1").is_err());
		assert!(Address::parse("tcp:host=x,port=notaport").is_err());
		assert!(Address::parse("onlyunknown:a=b").is_err());
	}
}
