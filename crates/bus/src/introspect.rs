//! Passive introspection model: nodes, interfaces, members, arguments
//! and annotations, with lookup-by-name helpers.
//!
//! The model is populated literally by servers registering objects (and,
//! externally, by an XML parser); nothing here talks to the bus. XML
//! generation exists for serving `Introspect` calls.

use std::fmt::Write as _;
use std::sync::Arc;

/// An annotation attached to a node, interface, member or argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationInfo {
	pub name: String,
	pub value: String,
	pub annotations: Vec<AnnotationInfo>,
}

/// One argument of a method or signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgInfo {
	pub name: Option<String>,
	pub signature: String,
	pub annotations: Vec<AnnotationInfo>,
}

impl ArgInfo {
	/// A new unnamed argument of the given type signature.
	#[must_use]
	pub fn new(name: Option<&str>, signature: &str) -> ArgInfo {
		ArgInfo {
			name: name.map(str::to_owned),
			signature: signature.to_owned(),
			annotations: Vec::new(),
		}
	}
}

/// A method of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
	pub name: String,
	pub in_args: Vec<ArgInfo>,
	pub out_args: Vec<ArgInfo>,
	pub annotations: Vec<AnnotationInfo>,
}

impl MethodInfo {
	/// The concatenated signature of the input arguments.
	#[must_use]
	pub fn in_signature(&self) -> String {
		self.in_args.iter().map(|a| a.signature.as_str()).collect()
	}
}

/// A signal of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalInfo {
	pub name: String,
	pub args: Vec<ArgInfo>,
	pub annotations: Vec<AnnotationInfo>,
}

/// Access mode of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
	Read,
	Write,
	ReadWrite,
}

impl PropertyAccess {
	/// Whether `Get` is permitted.
	#[must_use]
	pub fn is_readable(self) -> bool {
		matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
	}

	/// Whether `Set` is permitted.
	#[must_use]
	pub fn is_writable(self) -> bool {
		matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
	}

	fn as_str(self) -> &'static str {
		match self {
			PropertyAccess::Read => "read",
			PropertyAccess::Write => "write",
			PropertyAccess::ReadWrite => "readwrite",
		}
	}
}

/// A property of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
	pub name: String,
	pub signature: String,
	pub access: PropertyAccess,
	pub annotations: Vec<AnnotationInfo>,
}

/// A D-Bus interface: named methods, signals and properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceInfo {
	pub name: String,
	pub methods: Vec<MethodInfo>,
	pub signals: Vec<SignalInfo>,
	pub properties: Vec<PropertyInfo>,
	pub annotations: Vec<AnnotationInfo>,
}

impl InterfaceInfo {
	/// An empty interface with the given name.
	#[must_use]
	pub fn new(name: &str) -> InterfaceInfo {
		InterfaceInfo {
			name: name.to_owned(),
			..InterfaceInfo::default()
		}
	}

	/// Looks up a method by name.
	#[must_use]
	pub fn method(&self, name: &str) -> Option<&MethodInfo> {
		self.methods.iter().find(|m| m.name == name)
	}

	/// Looks up a signal by name.
	#[must_use]
	pub fn signal(&self, name: &str) -> Option<&SignalInfo> {
		self.signals.iter().find(|s| s.name == name)
	}

	/// Looks up a property by name.
	#[must_use]
	pub fn property(&self, name: &str) -> Option<&PropertyInfo> {
		self.properties.iter().find(|p| p.name == name)
	}

	fn write_xml(&self, out: &mut String) {
		let _ = writeln!(out, "  <interface name=\"{}\">", self.name);
		for method in &self.methods {
			let _ = writeln!(out, "    <method name=\"{}\">", method.name);
			for (args, direction) in [(&method.in_args, "in"), (&method.out_args, "out")] {
				for arg in args.iter() {
					write_arg(out, arg, Some(direction));
				}
			}
			let _ = writeln!(out, "    </method>");
		}
		for signal in &self.signals {
			let _ = writeln!(out, "    <signal name=\"{}\">", signal.name);
			for arg in &signal.args {
				write_arg(out, arg, None);
			}
			let _ = writeln!(out, "    </signal>");
		}
		for property in &self.properties {
			let _ = writeln!(
				out,
				"    <property name=\"{}\" type=\"{}\" access=\"{}\"/>",
				property.name,
				property.signature,
				property.access.as_str()
			);
		}
		let _ = writeln!(out, "  </interface>");
	}
}

fn write_arg(out: &mut String, arg: &ArgInfo, direction: Option<&str>) {
	let _ = write!(out, "      <arg");
	if let Some(name) = &arg.name {
		let _ = write!(out, " name=\"{name}\"");
	}
	let _ = write!(out, " type=\"{}\"", arg.signature);
	if let Some(direction) = direction {
		let _ = write!(out, " direction=\"{direction}\"");
	}
	let _ = writeln!(out, "/>");
}

/// A node of the object tree: interfaces plus child nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
	pub path: Option<String>,
	pub interfaces: Vec<Arc<InterfaceInfo>>,
	pub nodes: Vec<NodeInfo>,
	pub annotations: Vec<AnnotationInfo>,
}

impl NodeInfo {
	/// Looks up an interface by name.
	#[must_use]
	pub fn interface(&self, name: &str) -> Option<&Arc<InterfaceInfo>> {
		self.interfaces.iter().find(|i| i.name == name)
	}

	/// Renders the standard introspection XML document.
	#[must_use]
	pub fn generate_xml(&self) -> String {
		let mut out = String::from(
			"<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \
			 \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n",
		);
		let _ = writeln!(out, "<node>");
		for interface in &self.interfaces {
			interface.write_xml(&mut out);
		}
		for node in &self.nodes {
			if let Some(path) = &node.path {
				let _ = writeln!(out, "  <node name=\"{path}\"/>");
			}
		}
		let _ = writeln!(out, "</node>");
		out
	}
}

/// Looks up an annotation value by name in an annotation list.
#[must_use]
pub fn annotation_value<'a>(annotations: &'a [AnnotationInfo], name: &str) -> Option<&'a str> {
	annotations.iter().find(|a| a.name == name).map(|a| a.value.as_str())
}
