//! High-level D-Bus connections on top of the wire layer: a supervised
//! connection with cancellable request/response RPC and filtered signal
//! delivery, the well-known-name ownership and watching services, their
//! callback facades, and a peer-to-peer server.

mod connection;
mod error;
mod facade;
mod introspect;
mod owner;
mod server;
mod watcher;

pub use connection::{
	ClosedCallback, ClosedHandlerId, Connection, LifecycleState, MethodInvocation, ObjectHandler,
	OpenedCallback, OpenedHandlerId, RegistrationId, SignalCallback, SignalEvent, SubscriptionId,
	SubtreeHandler, DEFAULT_CALL_TIMEOUT,
};
pub use error::Error;
pub use facade::{
	own_name, unown_name, unwatch_name, watch_name, AppearedCallback, NameCallback, OwnId,
	WatchId,
};
pub use introspect::{
	annotation_value, AnnotationInfo, ArgInfo, InterfaceInfo, MethodInfo, NodeInfo,
	PropertyAccess, PropertyInfo, SignalInfo,
};
pub use owner::{NameOwner, OwnerCallback, OwnerEvent, OwnerFlags};
pub use server::{NewConnectionCallback, Server};
pub use watcher::{NameWatcher, WatcherCallback, WatcherEvent};

pub use minibus_wire::BusType;
