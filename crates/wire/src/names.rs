//! Syntax checks for bus names, interface names and member names.

/// Whether `name` is a valid bus name: a unique name (`:1.42`) or a
/// well-known reverse-DNS name (`org.example.Foo`).
#[must_use]
pub fn is_valid_bus_name(name: &str) -> bool {
	if name.len() > 255 || name.is_empty() {
		return false;
	}
	if let Some(rest) = name.strip_prefix(':') {
		// Unique names permit digit-led elements.
		let mut elements = 0;
		for element in rest.split('.') {
			if element.is_empty()
				|| !element.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
			{
				return false;
			}
			elements += 1;
		}
		return elements >= 2;
	}
	let mut elements = 0;
	for element in name.split('.') {
		if element.is_empty()
			|| element.as_bytes()[0].is_ascii_digit()
			|| !element.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
		{
			return false;
		}
		elements += 1;
	}
	elements >= 2
}

/// Whether `name` is a valid unique (bus-assigned) name.
#[must_use]
pub fn is_valid_unique_name(name: &str) -> bool {
	name.starts_with(':') && is_valid_bus_name(name)
}

/// Whether `name` is a valid interface name.
#[must_use]
pub fn is_valid_interface_name(name: &str) -> bool {
	if name.len() > 255 {
		return false;
	}
	let mut elements = 0;
	for element in name.split('.') {
		if element.is_empty()
			|| element.as_bytes()[0].is_ascii_digit()
			|| !element.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
		{
			return false;
		}
		elements += 1;
	}
	elements >= 2
}

/// Whether `name` is a valid member (method or signal) name.
#[must_use]
pub fn is_valid_member_name(name: &str) -> bool {
	!name.is_empty()
		&& name.len() <= 255
		&& !name.as_bytes()[0].is_ascii_digit()
		&& name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bus_names() {
		assert!(is_valid_bus_name("org.freedesktop.DBus"));
		assert!(is_valid_bus_name(":1.42"));
		assert!(is_valid_bus_name("com.example-corp.App"));
		assert!(!is_valid_bus_name("no_dots"));
		assert!(!is_valid_bus_name("org..Gap"));
		assert!(!is_valid_bus_name("0rg.example"));
		assert!(!is_valid_bus_name(""));
		assert!(is_valid_unique_name(":1.0"));
		assert!(!is_valid_unique_name("org.example.App"));
	}

	#[test]
	fn interface_and_member_names() {
		assert!(is_valid_interface_name("org.gtk.GDBus.TestInterface"));
		assert!(!is_valid_interface_name("single"));
		assert!(!is_valid_interface_name("org.1bad"));
		assert!(is_valid_member_name("HelloWorld"));
		assert!(is_valid_member_name("_private"));
		assert!(!is_valid_member_name("1Bad"));
		assert!(!is_valid_member_name("has-dash"));
		assert!(!is_valid_member_name(""));
	}
}
