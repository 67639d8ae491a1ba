//! The error taxonomy of the connection layer.
//!
//! Wire-level error replies carry a D-Bus error name and a free-form
//! message; both directions of the mapping live here. An error reply
//! whose name is not a known D-Bus error survives as [`Error::Remote`]
//! with the raw name preserved.

use thiserror::Error;

/// Errors surfaced by connections, name services and facades.
///
/// Programming errors (builder misuse, wrong-type access) are not here;
/// those panic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
	// Transport and liveness.
	#[error("no message bus is reachable: {0}")]
	NoServer(String),
	#[error("malformed bus address: {0}")]
	BadAddress(String),
	#[error("the connection is closed")]
	Disconnected,
	#[error("the requested address is in use")]
	AddressInUse,
	#[error("no network access")]
	NoNetwork,
	#[error("authentication failed")]
	AuthFailed,
	#[error("the operation timed out")]
	Timeout,
	#[error("the remote side did not reply in time")]
	TimedOut,
	#[error("the operation was cancelled")]
	Cancelled,

	// Bus protocol.
	#[error("service unknown: {0}")]
	ServiceUnknown(String),
	#[error("name has no owner: {0}")]
	NameHasNoOwner(String),
	#[error("no reply: {0}")]
	NoReply(String),
	#[error("unknown method: {0}")]
	UnknownMethod(String),
	#[error("invalid arguments: {0}")]
	InvalidArgs(String),
	#[error("invalid signature: {0}")]
	InvalidSignature(String),
	#[error("match rule not found: {0}")]
	MatchRuleNotFound(String),
	#[error("match rule invalid: {0}")]
	MatchRuleInvalid(String),
	#[error("access denied: {0}")]
	AccessDenied(String),
	#[error("limits exceeded: {0}")]
	LimitsExceeded(String),
	#[error("the bus is out of memory: {0}")]
	NoMemory(String),
	#[error("object path in use: {0}")]
	ObjectPathInUse(String),
	#[error("unix process id unknown: {0}")]
	UnixProcessIdUnknown(String),
	#[error("SELinux security context unknown: {0}")]
	SELinuxSecurityContextUnknown(String),
	#[error("ADT audit data unknown: {0}")]
	AdtAuditDataUnknown(String),

	// Service activation.
	#[error("spawn: exec failed: {0}")]
	SpawnExecFailed(String),
	#[error("spawn: fork failed: {0}")]
	SpawnForkFailed(String),
	#[error("spawn: child exited: {0}")]
	SpawnChildExited(String),
	#[error("spawn: child signaled: {0}")]
	SpawnChildSignaled(String),
	#[error("spawn failed: {0}")]
	SpawnFailed(String),
	#[error("spawn: setup failed: {0}")]
	SpawnSetupFailed(String),
	#[error("spawn: configuration invalid: {0}")]
	SpawnConfigInvalid(String),
	#[error("spawn: service invalid: {0}")]
	SpawnServiceInvalid(String),
	#[error("spawn: service not found: {0}")]
	SpawnServiceNotFound(String),
	#[error("spawn: permissions invalid: {0}")]
	SpawnPermissionsInvalid(String),
	#[error("spawn: file invalid: {0}")]
	SpawnFileInvalid(String),
	#[error("spawn: out of memory: {0}")]
	SpawnNoMemory(String),

	/// An error reply whose name maps to no known kind.
	#[error("remote error {name}: {message}")]
	Remote { name: String, message: String },

	// Local.
	#[error("file not found: {0}")]
	FileNotFound(String),
	#[error("file exists: {0}")]
	FileExists(String),
	#[error("invalid file content: {0}")]
	InvalidFileContent(String),
	#[error("conversion failed: {0}")]
	ConversionFailed(String),
	#[error("not supported: {0}")]
	NotSupported(String),
	#[error("{0}")]
	Failed(String),
}

const PREFIX: &str = "org.freedesktop.DBus.Error.";

macro_rules! error_names {
	($(($variant:ident, $name:literal)),* $(,)?) => {
		fn known_from_name(name: &str, message: String) -> Option<Error> {
			let suffix = name.strip_prefix(PREFIX)?;
			Some(match suffix {
				$($name => Error::$variant(message),)*
				_ => return None,
			})
		}

		impl Error {
			/// The D-Bus error name this error maps to, when it has one.
			#[must_use]
			pub fn dbus_error_name(&self) -> Option<String> {
				match self {
					$(Error::$variant(_) => Some(concat!("org.freedesktop.DBus.Error.", $name).to_owned()),)*
					Error::Remote { name, .. } => Some(name.clone()),
					Error::Disconnected => {
						Some(concat!("org.freedesktop.DBus.Error.", "Disconnected").to_owned())
					}
					Error::AddressInUse => {
						Some(concat!("org.freedesktop.DBus.Error.", "AddressInUse").to_owned())
					}
					Error::NoNetwork => {
						Some(concat!("org.freedesktop.DBus.Error.", "NoNetwork").to_owned())
					}
					Error::AuthFailed => {
						Some(concat!("org.freedesktop.DBus.Error.", "AuthFailed").to_owned())
					}
					Error::Timeout => {
						Some(concat!("org.freedesktop.DBus.Error.", "Timeout").to_owned())
					}
					Error::TimedOut => {
						Some(concat!("org.freedesktop.DBus.Error.", "TimedOut").to_owned())
					}
					Error::Cancelled => None,
				}
			}
		}
	};
}

error_names! {
	(NoServer, "NoServer"),
	(BadAddress, "BadAddress"),
	(ServiceUnknown, "ServiceUnknown"),
	(NameHasNoOwner, "NameHasNoOwner"),
	(NoReply, "NoReply"),
	(UnknownMethod, "UnknownMethod"),
	(InvalidArgs, "InvalidArgs"),
	(InvalidSignature, "InvalidSignature"),
	(MatchRuleNotFound, "MatchRuleNotFound"),
	(MatchRuleInvalid, "MatchRuleInvalid"),
	(AccessDenied, "AccessDenied"),
	(LimitsExceeded, "LimitsExceeded"),
	(NoMemory, "NoMemory"),
	(ObjectPathInUse, "ObjectPathInUse"),
	(UnixProcessIdUnknown, "UnixProcessIdUnknown"),
	(SELinuxSecurityContextUnknown, "SELinuxSecurityContextUnknown"),
	(AdtAuditDataUnknown, "AdtAuditDataUnknown"),
	(SpawnExecFailed, "Spawn.ExecFailed"),
	(SpawnForkFailed, "Spawn.ForkFailed"),
	(SpawnChildExited, "Spawn.ChildExited"),
	(SpawnChildSignaled, "Spawn.ChildSignaled"),
	(SpawnFailed, "Spawn.Failed"),
	(SpawnSetupFailed, "Spawn.FailedToSetup"),
	(SpawnConfigInvalid, "Spawn.ConfigInvalid"),
	(SpawnServiceInvalid, "Spawn.ServiceNotValid"),
	(SpawnServiceNotFound, "Spawn.ServiceNotFound"),
	(SpawnPermissionsInvalid, "Spawn.PermissionsInvalid"),
	(SpawnFileInvalid, "Spawn.FileInvalid"),
	(SpawnNoMemory, "Spawn.NoMemory"),
	(FileNotFound, "FileNotFound"),
	(FileExists, "FileExists"),
	(InvalidFileContent, "InvalidFileContent"),
	(ConversionFailed, "ConversionFailed"),
	(NotSupported, "NotSupported"),
	(Failed, "Failed"),
}

impl Error {
	/// Maps an error reply to an error kind, preserving unknown names as
	/// [`Error::Remote`].
	#[must_use]
	pub fn from_remote(name: &str, message: &str) -> Error {
		match name {
			"org.freedesktop.DBus.Error.Disconnected" => return Error::Disconnected,
			"org.freedesktop.DBus.Error.AddressInUse" => return Error::AddressInUse,
			"org.freedesktop.DBus.Error.NoNetwork" => return Error::NoNetwork,
			"org.freedesktop.DBus.Error.AuthFailed" => return Error::AuthFailed,
			"org.freedesktop.DBus.Error.Timeout" => return Error::Timeout,
			"org.freedesktop.DBus.Error.TimedOut" => return Error::TimedOut,
			_ => {}
		}
		known_from_name(name, message.to_owned()).unwrap_or_else(|| Error::Remote {
			name: name.to_owned(),
			message: message.to_owned(),
		})
	}

	/// The free-form message carried alongside the error name.
	#[must_use]
	pub fn remote_message(&self) -> Option<&str> {
		match self {
			Error::Remote { message, .. } => Some(message),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn known_names_map_to_kinds() {
		let error = Error::from_remote("org.freedesktop.DBus.Error.UnknownMethod", "no Frobnicate");
		assert_eq!(error, Error::UnknownMethod("no Frobnicate".to_owned()));
		assert_eq!(
			error.dbus_error_name().as_deref(),
			Some("org.freedesktop.DBus.Error.UnknownMethod")
		);

		let error = Error::from_remote("org.freedesktop.DBus.Error.Spawn.ExecFailed", "x");
		assert_eq!(error, Error::SpawnExecFailed("x".to_owned()));
	}

	#[test]
	fn unknown_names_are_preserved() {
		let error = Error::from_remote("com.example.Error.Custom", "the message");
		assert_eq!(
			error,
			Error::Remote {
				name: "com.example.Error.Custom".to_owned(),
				message: "the message".to_owned(),
			}
		);
		assert_eq!(error.dbus_error_name().as_deref(), Some("com.example.Error.Custom"));
		assert_eq!(error.remote_message(), Some("the message"));
	}

	#[test]
	fn liveness_kinds_round_trip() {
		let error = Error::from_remote("org.freedesktop.DBus.Error.Disconnected", "");
		assert_eq!(error, Error::Disconnected);
		assert_eq!(
			Error::Timeout.dbus_error_name().as_deref(),
			Some("org.freedesktop.DBus.Error.Timeout")
		);
		assert_eq!(Error::Cancelled.dbus_error_name(), None);
	}
}
