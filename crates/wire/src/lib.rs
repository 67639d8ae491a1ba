//! Low-level wire layer for the D-Bus client stack: the raw message type
//! and its marshalled form, bus address parsing and resolution, and
//! framed message transports over Unix and TCP sockets.

mod address;
mod message;
mod names;
mod transport;

pub use address::{Address, AddressEntry, AddressError, BusType};
pub use message::{FrameError, Message, MessageFlags, MessageKind, Serial};
pub use names::{
	is_valid_bus_name, is_valid_interface_name, is_valid_member_name, is_valid_unique_name,
};
pub use transport::{
	read_message, write_message, Listener, Transport, TransportReader, TransportWriter,
};
