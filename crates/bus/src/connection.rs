//! The supervised message-bus connection.
//!
//! # Purpose
//!
//! - Wrap a wire transport, observe its open/close lifecycle, and track
//!   the bus-assigned unique name.
//! - Provide cancellable send-with-reply, one-way sends, and filtered
//!   signal subscriptions with match-rule reference counting.
//! - Serve registered objects and dynamic subtrees.
//! - Share one connection per (process, bus type) through a singleton
//!   table; survive transport loss by transparently reconnecting shared
//!   connections on the next send.
//!
//! # Mental model
//!
//! - The connection owns a reader task and a writer task per transport
//!   incarnation; a `generation` counter keeps a stale incarnation's
//!   teardown from touching its successor.
//! - Pending replies are keyed by serial and registered *before* the
//!   request is handed to the writer, so a fast reply can never miss its
//!   waiter.
//! - Every subscription and registration remembers the runtime handle
//!   that was current when it was made; its callbacks are pumped on that
//!   handle, one event at a time, in wire arrival order.
//! - Subscriptions survive reconnect and their match rules are
//!   re-installed, except those filtered to a specific unique sender
//!   name: the peer is gone, so they are orphaned and never re-added.
//!
//! # Invariants
//!
//! 1. The state lock is held only across table operations, never across
//!    an await or a user callback.
//! 2. A pending reply is registered before the request reaches the
//!    writer queue.
//! 3. Subscription ids are non-zero and never reused.
//! 4. All pending replies fail with `Disconnected` when the transport
//!    closes.
//! 5. Cancellation wins over any concurrently-produced result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use minibus_variant::{TypeInfo, Value};
use minibus_wire::{
	read_message, Address, AddressError, BusType, Message, MessageFlags, MessageKind, Serial,
	Transport, TransportReader, TransportWriter,
};

use crate::error::Error;
use crate::introspect::{InterfaceInfo, NodeInfo};

const BUS_NAME: &str = "org.freedesktop.DBus";
const BUS_PATH: &str = "/org/freedesktop/DBus";
const BUS_INTERFACE: &str = "org.freedesktop.DBus";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// Default method-call timeout, matching the reference bus default.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
	/// Transient, during construction only.
	New,
	/// Transport is being set up and the unique name negotiated.
	Opening,
	Open,
	/// Explicit disconnect in progress.
	Closing,
	Closed,
}

/// Identifier of a signal subscription; non-zero and stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Identifier of an object or subtree registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub u64);

/// Identifier of a closed-notification handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClosedHandlerId(pub u64);

/// Identifier of an opened-notification handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenedHandlerId(pub u64);

/// A signal presented to subscribers.
#[derive(Debug, Clone)]
pub struct SignalEvent {
	pub sender: Option<String>,
	pub path: String,
	pub interface: String,
	pub member: String,
	/// The argument tuple.
	pub args: Value,
}

/// Callback invoked for each matching signal, on the subscribing context.
pub type SignalCallback = Arc<dyn Fn(&Connection, &SignalEvent) + Send + Sync>;

/// Callback invoked when the connection closes. The error is absent for
/// a locally-requested disconnect.
pub type ClosedCallback = Arc<dyn Fn(&Connection, Option<&Error>) + Send + Sync>;

/// Callback invoked each time the connection (re)opens.
pub type OpenedCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Server-side handle for answering one method call exactly once.
pub struct MethodInvocation {
	connection: Connection,
	serial: Serial,
	sender: Option<String>,
	path: String,
	interface: Option<String>,
	method: String,
	no_reply: bool,
	completed: bool,
}

impl MethodInvocation {
	/// The unique name of the caller, when the transport is a bus.
	#[must_use]
	pub fn sender(&self) -> Option<&str> {
		self.sender.as_deref()
	}

	/// The object path the call addressed.
	#[must_use]
	pub fn path(&self) -> &str {
		&self.path
	}

	/// The interface the call addressed, when one was named.
	#[must_use]
	pub fn interface(&self) -> Option<&str> {
		self.interface.as_deref()
	}

	/// The method name.
	#[must_use]
	pub fn method(&self) -> &str {
		&self.method
	}

	/// Completes the call successfully with an argument tuple.
	pub fn return_value(mut self, value: Option<Value>) {
		self.completed = true;
		if self.no_reply {
			return;
		}
		let mut reply = Message::new_method_return(self.serial);
		reply.destination = self.sender.clone();
		if let Some(value) = value {
			reply.set_args(value);
		}
		let _ = self.connection.queue_message(reply);
	}

	/// Completes the call with an error.
	pub fn return_error(mut self, error: &Error) {
		self.completed = true;
		if self.no_reply {
			return;
		}
		let name = error
			.dbus_error_name()
			.unwrap_or_else(|| "org.freedesktop.DBus.Error.Failed".to_owned());
		let mut reply = Message::new_error(self.serial, &name, &error.to_string());
		reply.destination = self.sender.clone();
		let _ = self.connection.queue_message(reply);
	}

	/// Completes the call with a raw error name and message.
	pub fn return_error_name(mut self, name: &str, message: &str) {
		self.completed = true;
		if self.no_reply {
			return;
		}
		let mut reply = Message::new_error(self.serial, name, message);
		reply.destination = self.sender.clone();
		let _ = self.connection.queue_message(reply);
	}
}

impl Drop for MethodInvocation {
	fn drop(&mut self) {
		// A dropped invocation must not leave the caller hanging.
		if !self.completed && !self.no_reply {
			let mut reply = Message::new_error(
				self.serial,
				"org.freedesktop.DBus.Error.Failed",
				"the handler did not produce a reply",
			);
			reply.destination = self.sender.clone();
			let _ = self.connection.queue_message(reply);
		}
	}
}

/// Server-side vtable for a registered object.
///
/// Property accessors default to "not supported" for interfaces without
/// properties.
pub trait ObjectHandler: Send + Sync {
	/// Handles one method call; the invocation must be completed exactly
	/// once (dropping it produces a generic error reply).
	fn method_call(&self, connection: &Connection, args: Value, invocation: MethodInvocation);

	/// Reads a property value.
	fn get_property(
		&self,
		_connection: &Connection,
		_sender: Option<&str>,
		property: &str,
	) -> Result<Value, Error> {
		Err(Error::NotSupported(format!("property {property:?} is not readable")))
	}

	/// Writes a property value.
	fn set_property(
		&self,
		_connection: &Connection,
		_sender: Option<&str>,
		property: &str,
		_value: Value,
	) -> Result<(), Error> {
		Err(Error::NotSupported(format!("property {property:?} is not writable")))
	}
}

/// Server-side vtable for a dynamically-served subtree.
pub trait SubtreeHandler: Send + Sync {
	/// Names of the immediate child nodes below the subtree root.
	fn enumerate(&self, connection: &Connection, sender: Option<&str>) -> Vec<String>;

	/// Interfaces implemented by `node` (`None` is the root itself).
	fn introspect(
		&self,
		connection: &Connection,
		sender: Option<&str>,
		node: Option<&str>,
	) -> Vec<InterfaceInfo>;

	/// Resolves the handler serving `interface` on `node`.
	fn dispatch(
		&self,
		connection: &Connection,
		sender: Option<&str>,
		node: Option<&str>,
		interface: &str,
	) -> Option<Arc<dyn ObjectHandler>>;
}

/// Work queued to a registration's dispatch pump.
enum ObjectCall {
	Method { args: Value, invocation: MethodInvocation },
	PropertyGet { property: String, invocation: MethodInvocation },
	PropertySet { property: String, value: Value, invocation: MethodInvocation },
	PropertyGetAll { invocation: MethodInvocation },
}

struct Subscription {
	sender: Option<String>,
	interface: Option<String>,
	member: Option<String>,
	path: Option<String>,
	arg0: Option<String>,
	rule: String,
	context: Option<Handle>,
	queue: Option<mpsc::UnboundedSender<SignalEvent>>,
	/// Set when a reconnect invalidated a unique-sender filter; the
	/// subscription stays registered but its rule is never re-added.
	orphaned: bool,
}

impl Subscription {
	fn matches(&self, event: &SignalEvent) -> bool {
		fn component(filter: &Option<String>, actual: Option<&str>) -> bool {
			match filter {
				None => true,
				Some(wanted) => actual == Some(wanted.as_str()),
			}
		}
		component(&self.sender, event.sender.as_deref())
			&& component(&self.interface, Some(&event.interface))
			&& component(&self.member, Some(&event.member))
			&& component(&self.path, Some(&event.path))
			&& match &self.arg0 {
				None => true,
				Some(wanted) => {
					event.args.n_children() > 0 && {
						let first = event.args.child_value(0);
						first.classify() == minibus_variant::Class::Str
							&& first.as_str() == wanted
					}
				}
			}
	}
}

struct ObjectRegistration {
	path: String,
	interface: Arc<InterfaceInfo>,
	handler: Arc<dyn ObjectHandler>,
	context: Option<Handle>,
	queue: Option<mpsc::UnboundedSender<ObjectCall>>,
}

struct SubtreeRegistration {
	path: String,
	handler: Arc<dyn SubtreeHandler>,
	/// Snapshot of the child nodes for a static subtree; a dynamic
	/// subtree enumerates on every introspection and accepts any node.
	static_nodes: Option<Vec<String>>,
}

struct ConnState {
	lifecycle: LifecycleState,
	generation: u64,
	unique_name: Option<String>,
	writer: Option<mpsc::UnboundedSender<Message>>,
	pending: HashMap<Serial, oneshot::Sender<Result<Message, Error>>>,
	subscriptions: IndexMap<SubscriptionId, Subscription>,
	match_rules: HashMap<String, usize>,
	objects: IndexMap<RegistrationId, ObjectRegistration>,
	subtrees: IndexMap<RegistrationId, SubtreeRegistration>,
	closed_handlers: IndexMap<ClosedHandlerId, (Option<Handle>, ClosedCallback)>,
	opened_handlers: IndexMap<OpenedHandlerId, (Option<Handle>, OpenedCallback)>,
	tasks: Vec<tokio::task::AbortHandle>,
}

struct ConnectionInner {
	bus_type: Option<BusType>,
	address: Option<Address>,
	is_bus: bool,
	is_private: bool,
	exit_on_close: AtomicBool,
	next_serial: AtomicU32,
	next_id: AtomicU64,
	open_gate: tokio::sync::Mutex<()>,
	state: Mutex<ConnState>,
}

/// A high-level message-bus (or peer-to-peer) connection.
///
/// Cloning shares the same underlying connection.
#[derive(Clone)]
pub struct Connection(Arc<ConnectionInner>);

impl PartialEq for Connection {
	/// Identity comparison: two handles are equal iff they share the
	/// underlying connection.
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.0.state.lock();
		f.debug_struct("Connection")
			.field("bus_type", &self.0.bus_type)
			.field("lifecycle", &state.lifecycle)
			.field("unique_name", &state.unique_name)
			.finish_non_exhaustive()
	}
}

fn shared_connections() -> &'static Mutex<HashMap<BusType, Weak<ConnectionInner>>> {
	static TABLE: std::sync::OnceLock<Mutex<HashMap<BusType, Weak<ConnectionInner>>>> =
		std::sync::OnceLock::new();
	TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Drop for ConnectionInner {
	fn drop(&mut self) {
		if let Some(bus_type) = self.bus_type
			&& !self.is_private
		{
			let mut table = shared_connections().lock();
			if table
				.get(&bus_type)
				.is_some_and(|weak| std::ptr::eq(weak.as_ptr(), self))
			{
				table.remove(&bus_type);
			}
		}
		for task in &self.state.get_mut().tasks {
			task.abort();
		}
	}
}

impl Connection {
	fn new(
		bus_type: Option<BusType>,
		address: Option<Address>,
		is_bus: bool,
		is_private: bool,
	) -> Connection {
		Connection(Arc::new(ConnectionInner {
			bus_type,
			address,
			is_bus,
			is_private,
			exit_on_close: AtomicBool::new(false),
			next_serial: AtomicU32::new(1),
			next_id: AtomicU64::new(1),
			open_gate: tokio::sync::Mutex::new(()),
			state: Mutex::new(ConnState {
				lifecycle: LifecycleState::New,
				generation: 0,
				unique_name: None,
				writer: None,
				pending: HashMap::new(),
				subscriptions: IndexMap::new(),
				match_rules: HashMap::new(),
				objects: IndexMap::new(),
				subtrees: IndexMap::new(),
				closed_handlers: IndexMap::new(),
				opened_handlers: IndexMap::new(),
				tasks: Vec::new(),
			}),
		}))
	}

	fn downgrade(&self) -> Weak<ConnectionInner> {
		Arc::downgrade(&self.0)
	}

	/// Stable identity of the underlying connection, for keying the
	/// per-(connection, name) singleton tables.
	pub(crate) fn id(&self) -> usize {
		Arc::as_ptr(&self.0) as usize
	}

	fn next_id(&self) -> u64 {
		self.0.next_id.fetch_add(1, Ordering::Relaxed)
	}

	// --- construction ---

	/// The shared connection to `bus`, creating and opening it on first
	/// use.
	pub async fn bus_get(bus: BusType) -> Result<Connection, Error> {
		let connection = {
			let mut table = shared_connections().lock();
			match table.get(&bus).and_then(Weak::upgrade) {
				Some(inner) => Connection(inner),
				None => {
					let connection = Connection::new(Some(bus), None, true, false);
					table.insert(bus, connection.downgrade());
					connection
				}
			}
		};
		connection.ensure_open().await?;
		Ok(connection)
	}

	/// A fresh private connection to `bus`, never shared and never
	/// reconnected.
	pub async fn bus_get_private(bus: BusType) -> Result<Connection, Error> {
		let connection = Connection::new(Some(bus), None, true, true);
		connection.ensure_open().await?;
		Ok(connection)
	}

	/// Blocking form of [`Connection::bus_get`]. Must run on a
	/// multi-threaded runtime worker.
	pub fn bus_get_sync(bus: BusType) -> Result<Connection, Error> {
		block_on(Connection::bus_get(bus))
	}

	/// Blocking form of [`Connection::bus_get_private`].
	pub fn bus_get_private_sync(bus: BusType) -> Result<Connection, Error> {
		block_on(Connection::bus_get_private(bus))
	}

	/// Connects to an explicit address. With `message_bus` set the peer
	/// is treated as a bus daemon (`Hello` is exchanged); otherwise the
	/// connection is a plain peer and carries no unique name.
	pub async fn for_address(address: &str, message_bus: bool) -> Result<Connection, Error> {
		let address = Address::parse(address).map_err(address_error)?;
		let connection = Connection::new(None, Some(address), message_bus, true);
		connection.ensure_open().await?;
		Ok(connection)
	}

	/// Wraps an already-connected transport as a server-side peer
	/// connection.
	pub(crate) fn from_transport(transport: Transport) -> Connection {
		let connection = Connection::new(None, None, false, true);
		let (reader, writer) = transport.into_split();
		let generation = connection.install_transport(reader, writer);
		connection.mark_open(generation);
		connection
	}

	// --- lifecycle ---

	/// The current lifecycle state.
	#[must_use]
	pub fn state(&self) -> LifecycleState {
		self.0.state.lock().lifecycle
	}

	/// Whether the connection is currently open.
	#[must_use]
	pub fn is_open(&self) -> bool {
		self.state() == LifecycleState::Open
	}

	/// The bus-assigned unique name (`:N.M`), once `Hello` resolved.
	#[must_use]
	pub fn unique_name(&self) -> Option<String> {
		self.0.state.lock().unique_name.clone()
	}

	/// The bus this connection attaches to, if it is a shared or private
	/// bus connection rather than an explicit-address peer.
	#[must_use]
	pub fn bus_type(&self) -> Option<BusType> {
		self.0.bus_type
	}

	/// Whether this is a private (non-shared, non-reconnecting)
	/// connection.
	#[must_use]
	pub fn is_private(&self) -> bool {
		self.0.is_private
	}

	/// Whether the process exits when the connection closes.
	#[must_use]
	pub fn exit_on_close(&self) -> bool {
		self.0.exit_on_close.load(Ordering::Relaxed)
	}

	/// Sets whether the process exits when the connection closes.
	pub fn set_exit_on_close(&self, exit: bool) {
		self.0.exit_on_close.store(exit, Ordering::Relaxed);
	}

	/// Registers a callback run when the connection closes.
	pub fn on_closed(&self, callback: ClosedCallback) -> ClosedHandlerId {
		let id = ClosedHandlerId(self.next_id());
		let context = Handle::try_current().ok();
		self.0.state.lock().closed_handlers.insert(id, (context, callback));
		id
	}

	/// Removes a closed-notification callback.
	pub fn remove_closed_handler(&self, id: ClosedHandlerId) {
		self.0.state.lock().closed_handlers.shift_remove(&id);
	}

	/// Registers a callback run each time the connection (re)opens.
	pub fn on_opened(&self, callback: OpenedCallback) -> OpenedHandlerId {
		let id = OpenedHandlerId(self.next_id());
		let context = Handle::try_current().ok();
		self.0.state.lock().opened_handlers.insert(id, (context, callback));
		id
	}

	/// Removes an opened-notification callback.
	pub fn remove_opened_handler(&self, id: OpenedHandlerId) {
		self.0.state.lock().opened_handlers.shift_remove(&id);
	}

	/// Explicitly disconnects. Pending replies fail with
	/// [`Error::Disconnected`]; a shared connection re-opens on the next
	/// send.
	pub fn disconnect(&self) {
		let generation = {
			let mut state = self.0.state.lock();
			if matches!(state.lifecycle, LifecycleState::Closed | LifecycleState::Closing) {
				return;
			}
			state.lifecycle = LifecycleState::Closing;
			state.generation
		};
		self.handle_close(generation, None);
	}

	/// Opens the connection if it is not already open. Shared
	/// connections reconnect after a close; private connections fail
	/// with [`Error::Disconnected`] instead.
	pub(crate) async fn ensure_open(&self) -> Result<(), Error> {
		{
			let state = self.0.state.lock();
			match state.lifecycle {
				LifecycleState::Open => return Ok(()),
				LifecycleState::Closed | LifecycleState::Closing if self.0.is_private => {
					return Err(Error::Disconnected);
				}
				_ => {}
			}
		}
		let _gate = self.0.open_gate.lock().await;
		if self.0.state.lock().lifecycle == LifecycleState::Open {
			return Ok(());
		}
		self.do_open().await
	}

	async fn do_open(&self) -> Result<(), Error> {
		let address = match (&self.0.address, self.0.bus_type) {
			(Some(address), _) => address.clone(),
			(None, Some(bus)) => Address::for_bus(bus).map_err(address_error)?,
			(None, None) => return Err(Error::Disconnected),
		};
		let transport = Transport::connect(&address)
			.await
			.map_err(|e| Error::NoServer(e.to_string()))?;
		let (reader, writer) = transport.into_split();
		let generation = self.install_transport(reader, writer);

		if self.0.is_bus {
			let hello = Message::new_method_call(
				Some(BUS_NAME),
				BUS_PATH,
				Some(BUS_INTERFACE),
				"Hello",
			);
			let reply = self
				.call_message(hello, DEFAULT_CALL_TIMEOUT, None)
				.await
				.map_err(|e| {
					self.handle_close(generation, Some(&e));
					e
				})?;
			let args = reply.args();
			let name = (args.n_children() > 0)
				.then(|| args.child_value(0))
				.filter(|v| v.classify() == minibus_variant::Class::Str)
				.map(|v| v.as_str().to_owned())
				.ok_or_else(|| {
					let error = Error::Failed("malformed Hello reply".to_owned());
					self.handle_close(generation, Some(&error));
					error
				})?;
			tracing::debug!(unique_name = %name, "bus connection opened");

			// Re-install match rules for the surviving subscriptions.
			let rules: Vec<String> = {
				let mut state = self.0.state.lock();
				state.unique_name = Some(name);
				state.match_rules.clear();
				let mut rules = Vec::new();
				for sub in state.subscriptions.values() {
					if sub.orphaned {
						continue;
					}
					rules.push(sub.rule.clone());
				}
				for rule in &rules {
					*state.match_rules.entry(rule.clone()).or_insert(0) += 1;
				}
				state.match_rules.keys().cloned().collect()
			};
			for rule in rules {
				self.send_match_request("AddMatch", &rule);
			}
		}

		if !self.mark_open(generation) {
			return Err(Error::Disconnected);
		}
		Ok(())
	}

	/// Completes the `Opening` → `Open` transition, unless the transport
	/// already died under us.
	fn mark_open(&self, generation: u64) -> bool {
		let handlers = {
			let mut state = self.0.state.lock();
			if state.generation != generation || state.lifecycle != LifecycleState::Opening {
				return false;
			}
			state.lifecycle = LifecycleState::Open;
			state
				.opened_handlers
				.values()
				.map(|(context, callback)| (context.clone(), callback.clone()))
				.collect::<Vec<_>>()
		};
		for (context, callback) in handlers {
			let connection = self.clone();
			let run = move || callback(&connection);
			match context.or_else(|| Handle::try_current().ok()) {
				Some(handle) => {
					handle.spawn(async move { run() });
				}
				None => run(),
			}
		}
		true
	}

	/// Spawns reader and writer tasks for a fresh transport; returns the
	/// new generation.
	fn install_transport(&self, reader: TransportReader, writer: TransportWriter) -> u64 {
		let (tx, rx) = mpsc::unbounded_channel();
		let generation = {
			let mut state = self.0.state.lock();
			state.generation += 1;
			state.writer = Some(tx);
			state.lifecycle = LifecycleState::Opening;
			state.generation
		};
		let weak = self.downgrade();
		let read_task = tokio::spawn(reader_loop(weak.clone(), reader, generation));
		let write_task = tokio::spawn(writer_loop(weak, writer, rx, generation));
		let mut state = self.0.state.lock();
		state.tasks.retain(|t| !t.is_finished());
		state.tasks.push(read_task.abort_handle());
		state.tasks.push(write_task.abort_handle());
		generation
	}

	/// Tears down after transport loss or explicit disconnect.
	fn handle_close(&self, generation: u64, reason: Option<&Error>) {
		let (pending, handlers) = {
			let mut state = self.0.state.lock();
			if state.generation != generation || state.lifecycle == LifecycleState::Closed {
				return;
			}
			state.lifecycle = LifecycleState::Closed;
			state.writer = None;
			state.unique_name = None;
			state.match_rules.clear();
			// Unique-sender filters reference a peer that no longer
			// exists after a reconnect.
			for sub in state.subscriptions.values_mut() {
				if sub.sender.as_deref().is_some_and(|s| s.starts_with(':')) {
					sub.orphaned = true;
				}
			}
			let pending: Vec<_> = state.pending.drain().map(|(_, tx)| tx).collect();
			let handlers: Vec<_> = state
				.closed_handlers
				.values()
				.map(|(context, callback)| (context.clone(), callback.clone()))
				.collect();
			(pending, handlers)
		};

		for tx in pending {
			let _ = tx.send(Err(Error::Disconnected));
		}

		tracing::info!(reason = ?reason, "connection closed");
		for (context, callback) in handlers {
			let connection = self.clone();
			let reason = reason.cloned();
			let run = move || callback(&connection, reason.as_ref());
			match context.or_else(|| Handle::try_current().ok()) {
				Some(handle) => {
					handle.spawn(async move { run() });
				}
				None => run(),
			}
		}

		if self.exit_on_close() {
			tracing::warn!("connection closed with exit-on-close set; exiting");
			std::process::exit(1);
		}
	}

	// --- sending ---

	pub(crate) fn queue_message(&self, mut message: Message) -> Result<Serial, Error> {
		let state = self.0.state.lock();
		let writer = state.writer.as_ref().ok_or(Error::Disconnected)?;
		let serial = Serial(self.0.next_serial.fetch_add(1, Ordering::Relaxed));
		message.serial = serial;
		writer.send(message).map_err(|_| Error::Disconnected)?;
		Ok(serial)
	}

	/// Sends `message` and awaits its reply, honouring timeout and
	/// cancellation.
	async fn call_message(
		&self,
		message: Message,
		timeout: Duration,
		cancel: Option<&CancellationToken>,
	) -> Result<Message, Error> {
		// A pre-tripped token never touches the wire.
		if cancel.is_some_and(CancellationToken::is_cancelled) {
			return Err(Error::Cancelled);
		}
		let (tx, rx) = oneshot::channel();
		let serial = {
			let mut state = self.0.state.lock();
			let writer = state.writer.as_ref().ok_or(Error::Disconnected)?.clone();
			let serial = Serial(self.0.next_serial.fetch_add(1, Ordering::Relaxed));
			let mut message = message;
			message.serial = serial;
			// Pending registration precedes the send so a fast reply
			// cannot miss its waiter.
			state.pending.insert(serial, tx);
			if writer.send(message).is_err() {
				state.pending.remove(&serial);
				return Err(Error::Disconnected);
			}
			serial
		};

		let drop_pending = || {
			self.0.state.lock().pending.remove(&serial);
		};

		let cancelled = async {
			match cancel {
				Some(token) => token.cancelled().await,
				None => std::future::pending().await,
			}
		};

		tokio::select! {
			biased;
			() = cancelled => {
				drop_pending();
				Err(Error::Cancelled)
			}
			reply = rx => match reply {
				Ok(result) => result,
				Err(_) => Err(Error::Disconnected),
			},
			() = tokio::time::sleep(timeout) => {
				drop_pending();
				Err(Error::TimedOut)
			}
		}
	}

	/// Calls a method and awaits the reply's argument tuple.
	///
	/// A closed shared connection transparently reconnects first. A
	/// cancel token tripped before the call is sent guarantees nothing
	/// reaches the wire; tripped in flight, the pending reply is dropped
	/// locally and [`Error::Cancelled`] wins over any other outcome.
	pub async fn invoke_method(
		&self,
		bus_name: Option<&str>,
		path: &str,
		interface: Option<&str>,
		method: &str,
		args: Option<Value>,
		timeout: Option<Duration>,
		cancel: Option<&CancellationToken>,
	) -> Result<Value, Error> {
		if cancel.is_some_and(CancellationToken::is_cancelled) {
			return Err(Error::Cancelled);
		}
		self.ensure_open().await?;
		let mut message = Message::new_method_call(bus_name, path, interface, method);
		if let Some(args) = args {
			message.set_args(args);
		}
		let reply = self
			.call_message(message, timeout.unwrap_or(DEFAULT_CALL_TIMEOUT), cancel)
			.await?;
		match reply.kind {
			MessageKind::Error => {
				let name = reply
					.error_name
					.as_deref()
					.unwrap_or("org.freedesktop.DBus.Error.Failed");
				Err(Error::from_remote(name, &reply.arg0().unwrap_or_default()))
			}
			_ => Ok(reply.args()),
		}
	}

	/// Emits a signal; one-way.
	pub async fn emit_signal(
		&self,
		destination: Option<&str>,
		path: &str,
		interface: &str,
		member: &str,
		args: Option<Value>,
	) -> Result<(), Error> {
		self.ensure_open().await?;
		let mut message = Message::new_signal(path, interface, member);
		message.destination = destination.map(str::to_owned);
		if let Some(args) = args {
			message.set_args(args);
		}
		self.queue_message(message)?;
		Ok(())
	}

	// --- subscriptions ---

	/// Subscribes to signals matched by the given tuple of filters.
	///
	/// The callback runs on the runtime that is current now, one signal
	/// at a time, in arrival order. The subscription survives reconnects
	/// unless `sender` is a unique name.
	pub fn signal_subscribe(
		&self,
		sender: Option<&str>,
		interface: Option<&str>,
		member: Option<&str>,
		path: Option<&str>,
		arg0: Option<&str>,
		callback: SignalCallback,
	) -> SubscriptionId {
		let id = SubscriptionId(self.next_id());
		let rule = match_rule(sender, interface, member, path, arg0);
		let subscription = Subscription {
			sender: sender.map(str::to_owned),
			interface: interface.map(str::to_owned),
			member: member.map(str::to_owned),
			path: path.map(str::to_owned),
			arg0: arg0.map(str::to_owned),
			rule: rule.clone(),
			context: Handle::try_current().ok(),
			queue: None,
			orphaned: false,
		};
		let queue_pump = {
			let mut state = self.0.state.lock();
			let pump = self.make_signal_pump(&subscription, callback);
			let mut subscription = subscription;
			subscription.queue = Some(pump);
			state.subscriptions.insert(id, subscription);
			let count = state.match_rules.entry(rule.clone()).or_insert(0);
			*count += 1;
			// During Opening the writer already exists; sending here keeps
			// a subscription made mid-open from missing its rule.
			*count == 1
				&& matches!(state.lifecycle, LifecycleState::Open | LifecycleState::Opening)
		};
		if queue_pump && self.0.is_bus {
			self.send_match_request("AddMatch", &rule);
		}
		id
	}

	fn make_signal_pump(
		&self,
		subscription: &Subscription,
		callback: SignalCallback,
	) -> mpsc::UnboundedSender<SignalEvent> {
		let (tx, mut rx) = mpsc::unbounded_channel::<SignalEvent>();
		let weak = self.downgrade();
		let pump = async move {
			while let Some(event) = rx.recv().await {
				let Some(inner) = weak.upgrade() else { break };
				callback(&Connection(inner), &event);
			}
		};
		match &subscription.context {
			Some(handle) => {
				handle.spawn(pump);
			}
			None => {
				// No runtime at subscribe time: deliver on the reader's
				// runtime once signals start arriving.
				if let Ok(handle) = Handle::try_current() {
					handle.spawn(pump);
				} else {
					std::thread::spawn(move || {
						let runtime = tokio::runtime::Builder::new_current_thread()
							.enable_all()
							.build()
							.expect("pump runtime");
						runtime.block_on(pump);
					});
				}
			}
		}
		tx
	}

	/// Removes a subscription; the last subscription behind a match rule
	/// retracts the rule from the bus.
	pub fn signal_unsubscribe(&self, id: SubscriptionId) {
		let retract = {
			let mut state = self.0.state.lock();
			let Some(subscription) = state.subscriptions.shift_remove(&id) else {
				return;
			};
			match state.match_rules.get_mut(&subscription.rule) {
				Some(count) if *count > 1 => {
					*count -= 1;
					None
				}
				Some(_) => {
					state.match_rules.remove(&subscription.rule);
					(state.lifecycle == LifecycleState::Open && !subscription.orphaned)
						.then_some(subscription.rule)
				}
				None => None,
			}
		};
		if let Some(rule) = retract
			&& self.0.is_bus
		{
			self.send_match_request("RemoveMatch", &rule);
		}
	}

	fn send_match_request(&self, method: &str, rule: &str) {
		let mut message = Message::new_method_call(Some(BUS_NAME), BUS_PATH, Some(BUS_INTERFACE), method);
		message.flags |= MessageFlags::NO_REPLY_EXPECTED;
		message.set_args(minibus_variant::build(
			"(s)",
			vec![minibus_variant::Arg::Str(rule)],
		));
		if let Err(e) = self.queue_message(message) {
			tracing::debug!(rule, error = %e, "match rule request not sent");
		}
	}

	// --- object registration ---

	/// Serves `interface` at `path`.
	///
	/// Fails with [`Error::ObjectPathInUse`] when the (path, interface)
	/// pair is already registered.
	pub fn register_object(
		&self,
		path: &str,
		interface: InterfaceInfo,
		handler: Arc<dyn ObjectHandler>,
	) -> Result<RegistrationId, Error> {
		assert!(
			minibus_variant::object_path_is_valid(path),
			"invalid object path {path:?}"
		);
		let id = RegistrationId(self.next_id());
		let mut state = self.0.state.lock();
		if state
			.objects
			.values()
			.any(|o| o.path == path && o.interface.name == interface.name)
		{
			return Err(Error::ObjectPathInUse(path.to_owned()));
		}
		state.objects.insert(
			id,
			ObjectRegistration {
				path: path.to_owned(),
				interface: Arc::new(interface),
				handler,
				context: Handle::try_current().ok(),
				queue: None,
			},
		);
		Ok(id)
	}

	/// Removes an object or subtree registration.
	pub fn unregister_object(&self, id: RegistrationId) -> bool {
		let mut state = self.0.state.lock();
		state.objects.shift_remove(&id).is_some() || state.subtrees.shift_remove(&id).is_some()
	}

	/// Serves a subtree rooted at `path`. A dynamic subtree re-evaluates
	/// its children on demand; a static one is pinned to the node set
	/// enumerated at registration time.
	pub fn register_subtree(
		&self,
		path: &str,
		handler: Arc<dyn SubtreeHandler>,
		dynamic: bool,
	) -> Result<RegistrationId, Error> {
		assert!(
			minibus_variant::object_path_is_valid(path),
			"invalid object path {path:?}"
		);
		let id = RegistrationId(self.next_id());
		let static_nodes = (!dynamic).then(|| handler.enumerate(self, None));
		let mut state = self.0.state.lock();
		if state.subtrees.values().any(|s| s.path == path) {
			return Err(Error::ObjectPathInUse(path.to_owned()));
		}
		state.subtrees.insert(
			id,
			SubtreeRegistration {
				path: path.to_owned(),
				handler,
				static_nodes,
			},
		);
		Ok(id)
	}

	// --- incoming dispatch (reader task) ---

	fn dispatch_incoming(&self, message: Message) {
		match message.kind {
			MessageKind::MethodReturn | MessageKind::Error => {
				let Some(reply_serial) = message.reply_serial else { return };
				let waiter = self.0.state.lock().pending.remove(&reply_serial);
				if let Some(waiter) = waiter {
					let _ = waiter.send(Ok(message));
				}
			}
			MessageKind::Signal => self.dispatch_signal(message),
			MessageKind::MethodCall => self.dispatch_method_call(message),
		}
	}

	fn dispatch_signal(&self, message: Message) {
		let (Some(path), Some(interface), Some(member)) =
			(message.path.clone(), message.interface.clone(), message.member.clone())
		else {
			return;
		};
		let event = SignalEvent {
			sender: message.sender.clone(),
			path,
			interface,
			member,
			args: message.args(),
		};
		// Queued under the lock, in subscription registration order;
		// each pump preserves per-subscription arrival order.
		let state = self.0.state.lock();
		for subscription in state.subscriptions.values() {
			if !subscription.orphaned
				&& subscription.matches(&event)
				&& let Some(queue) = &subscription.queue
			{
				let _ = queue.send(event.clone());
			}
		}
	}

	fn dispatch_method_call(&self, message: Message) {
		let no_reply = message.flags.contains(MessageFlags::NO_REPLY_EXPECTED);
		let serial = message.serial;
		let sender = message.sender.clone();
		let path = message.path.clone().unwrap_or_default();
		let interface = message.interface.clone();
		let member = message.member.clone().unwrap_or_default();
		let args = message.args();

		let invocation = MethodInvocation {
			connection: self.clone(),
			serial,
			sender: sender.clone(),
			path: path.clone(),
			interface: interface.clone(),
			method: member.clone(),
			no_reply,
			completed: false,
		};

		match interface.as_deref() {
			Some(PEER_INTERFACE) => {
				match member.as_str() {
					"Ping" => invocation.return_value(None),
					"GetMachineId" => invocation.return_value(Some(minibus_variant::build(
						"(s)",
						vec![minibus_variant::Arg::Str("0")],
					))),
					_ => invocation.return_error(&Error::UnknownMethod(member)),
				}
				return;
			}
			Some(INTROSPECTABLE_INTERFACE) if member == "Introspect" => {
				let xml = self.introspect_path(&path, sender.as_deref());
				invocation.return_value(Some(minibus_variant::build(
					"(s)",
					vec![minibus_variant::Arg::Str(&xml)],
				)));
				return;
			}
			_ => {}
		}

		if interface.as_deref() == Some(PROPERTIES_INTERFACE) {
			self.dispatch_property_call(&path, &member, args, invocation);
			return;
		}

		// Exact object registrations first, then subtrees.
		let target = {
			let state = self.0.state.lock();
			state
				.objects
				.iter()
				.find(|(_, o)| {
					o.path == path
						&& match &interface {
							Some(interface) => o.interface.name == *interface,
							None => o.interface.method(&member).is_some(),
						}
				})
				.map(|(id, o)| (*id, o.interface.clone()))
		};

		if let Some((id, info)) = target {
			match info.method(&member) {
				None => invocation.return_error(&Error::UnknownMethod(format!(
					"no method {member:?} on interface {:?}",
					info.name
				))),
				Some(method) => {
					if method.in_signature() != message.body_signature() {
						invocation.return_error(&Error::InvalidArgs(format!(
							"method {member:?} expects signature {:?}",
							method.in_signature()
						)));
						return;
					}
					self.queue_object_call(id, ObjectCall::Method { args, invocation });
				}
			}
			return;
		}

		if let Some(handler) = self.resolve_subtree(&path, sender.as_deref(), interface.as_deref()) {
			handler.method_call(self, args, invocation);
			return;
		}

		invocation.return_error(&Error::UnknownMethod(format!(
			"no object at {path:?} implements {:?}",
			interface.unwrap_or_default()
		)));
	}

	fn dispatch_property_call(
		&self,
		path: &str,
		member: &str,
		args: Value,
		invocation: MethodInvocation,
	) {
		// Properties calls carry the target interface as their first
		// argument.
		let target_interface = (args.n_children() > 0)
			.then(|| args.child_value(0))
			.filter(|v| v.classify() == minibus_variant::Class::Str)
			.map(|v| v.as_str().to_owned());
		let Some(target_interface) = target_interface else {
			invocation.return_error(&Error::InvalidArgs(
				"Properties calls take an interface name first".to_owned(),
			));
			return;
		};

		let target = {
			let state = self.0.state.lock();
			state
				.objects
				.iter()
				.find(|(_, o)| o.path == path && o.interface.name == target_interface)
				.map(|(id, _)| *id)
		};
		let Some(id) = target else {
			invocation.return_error(&Error::UnknownMethod(format!(
				"no object at {path:?} implements {target_interface:?}"
			)));
			return;
		};

		let string_arg = |index: usize| {
			(args.n_children() > index)
				.then(|| args.child_value(index))
				.filter(|v| v.classify() == minibus_variant::Class::Str)
				.map(|v| v.as_str().to_owned())
		};
		match member {
			"Get" if args.n_children() == 2 => match string_arg(1) {
				Some(property) => {
					self.queue_object_call(id, ObjectCall::PropertyGet { property, invocation });
				}
				None => invocation
					.return_error(&Error::InvalidArgs("Get takes a property name".to_owned())),
			},
			"Set" if args.n_children() == 3 => {
				let property = string_arg(1);
				let boxed = args.child_value(2);
				if let (Some(property), minibus_variant::Class::Variant) =
					(property, boxed.classify())
				{
					let value = boxed.child_value(0);
					self.queue_object_call(
						id,
						ObjectCall::PropertySet { property, value, invocation },
					);
				} else {
					invocation.return_error(&Error::InvalidArgs(
						"Set takes a property name and a boxed value".to_owned(),
					));
				}
			}
			"GetAll" => self.queue_object_call(id, ObjectCall::PropertyGetAll { invocation }),
			_ => invocation.return_error(&Error::InvalidArgs(format!(
				"malformed Properties.{member} call"
			))),
		}
	}

	/// Queues work to a registration's pump, creating the pump on first
	/// use on the registering context.
	fn queue_object_call(&self, id: RegistrationId, call: ObjectCall) {
		let queue = {
			let mut state = self.0.state.lock();
			let Some(registration) = state.objects.get_mut(&id) else {
				return;
			};
			if registration.queue.is_none() {
				let (tx, mut rx) = mpsc::unbounded_channel::<ObjectCall>();
				let weak = self.downgrade();
				let handler = registration.handler.clone();
				let interface = registration.interface.clone();
				let pump = async move {
					while let Some(call) = rx.recv().await {
						let Some(inner) = weak.upgrade() else { break };
						run_object_call(&Connection(inner), &*handler, &interface, call);
					}
				};
				let handle = registration
					.context
					.clone()
					.or_else(|| Handle::try_current().ok())
					.expect("object dispatch without a runtime");
				handle.spawn(pump);
				registration.queue = Some(tx);
			}
			registration.queue.clone().expect("pump just installed")
		};
		let _ = queue.send(call);
	}

	fn resolve_subtree(
		&self,
		path: &str,
		sender: Option<&str>,
		interface: Option<&str>,
	) -> Option<Arc<dyn ObjectHandler>> {
		let interface = interface?;
		let (handler, node) = {
			let state = self.0.state.lock();
			let registration = state.subtrees.values().find(|s| {
				path == s.path || path.starts_with(&format!("{}/", s.path)) || s.path == "/"
			})?;
			let node = if path == registration.path {
				None
			} else {
				let relative = path
					.strip_prefix(registration.path.trim_end_matches('/'))
					.and_then(|r| r.strip_prefix('/'))
					.unwrap_or("");
				Some(relative.to_owned())
			};
			// A static subtree only serves the nodes it enumerated at
			// registration.
			if let (Some(nodes), Some(node)) = (&registration.static_nodes, node.as_deref())
				&& !nodes.iter().any(|n| n == node)
			{
				return None;
			}
			(registration.handler.clone(), node)
		};
		handler.dispatch(self, sender, node.as_deref(), interface)
	}

	/// Builds the introspection document for `path` from exact
	/// registrations and subtree children.
	fn introspect_path(&self, path: &str, sender: Option<&str>) -> String {
		let mut node = NodeInfo::default();
		{
			let state = self.0.state.lock();
			for registration in state.objects.values() {
				if registration.path == path {
					node.interfaces.push(registration.interface.clone());
				}
				// Immediate children of this path become child nodes.
				if let Some(rest) = registration.path.strip_prefix(path)
					&& let Some(child) = rest.strip_prefix('/').or_else(|| {
						(path == "/").then_some(rest)
					}) && !child.is_empty()
				{
					let first = child.split('/').next().unwrap_or(child).to_owned();
					if !node.nodes.iter().any(|n| n.path.as_deref() == Some(first.as_str())) {
						node.nodes.push(NodeInfo {
							path: Some(first),
							..NodeInfo::default()
						});
					}
				}
			}
		}
		let subtree = {
			let state = self.0.state.lock();
			state
				.subtrees
				.values()
				.find(|s| s.path == path)
				.map(|s| (s.handler.clone(), s.static_nodes.clone()))
		};
		if let Some((handler, static_nodes)) = subtree {
			let children =
				static_nodes.unwrap_or_else(|| handler.enumerate(self, sender));
			for child in children {
				node.nodes.push(NodeInfo {
					path: Some(child),
					..NodeInfo::default()
				});
			}
			for interface in handler.introspect(self, sender, None) {
				node.interfaces.push(Arc::new(interface));
			}
		}
		node.generate_xml()
	}
}

fn run_object_call(
	connection: &Connection,
	handler: &dyn ObjectHandler,
	interface: &InterfaceInfo,
	call: ObjectCall,
) {
	match call {
		ObjectCall::Method { args, invocation } => {
			handler.method_call(connection, args, invocation);
		}
		ObjectCall::PropertyGet { property, invocation } => {
			let Some(info) = interface.property(&property) else {
				invocation.return_error(&Error::InvalidArgs(format!(
					"no property {property:?} on {:?}",
					interface.name
				)));
				return;
			};
			if !info.access.is_readable() {
				invocation.return_error(&Error::AccessDenied(format!(
					"property {property:?} is not readable"
				)));
				return;
			}
			match handler.get_property(connection, invocation.sender(), &property) {
				Ok(value) => invocation.return_value(Some(minibus_variant::build(
					"(v)",
					vec![minibus_variant::Arg::Value(value)],
				))),
				Err(error) => invocation.return_error(&error),
			}
		}
		ObjectCall::PropertySet { property, value, invocation } => {
			let Some(info) = interface.property(&property) else {
				invocation.return_error(&Error::InvalidArgs(format!(
					"no property {property:?} on {:?}",
					interface.name
				)));
				return;
			};
			if !info.access.is_writable() {
				invocation.return_error(&Error::AccessDenied(format!(
					"property {property:?} is not writable"
				)));
				return;
			}
			match handler.set_property(connection, invocation.sender(), &property, value) {
				Ok(()) => invocation.return_value(None),
				Err(error) => invocation.return_error(&error),
			}
		}
		ObjectCall::PropertyGetAll { invocation } => {
			let mut builder = minibus_variant::Builder::new(&TypeInfo::new("a{sv}"));
			for property in &interface.properties {
				if !property.access.is_readable() {
					continue;
				}
				if let Ok(value) =
					handler.get_property(connection, invocation.sender(), &property.name)
				{
					builder.open(&TypeInfo::new("{sv}"));
					builder.add_value(Value::new_string(&property.name));
					builder.add_value(Value::new_variant(value));
					builder.close();
				}
			}
			invocation.return_value(Some(minibus_variant::build(
				"(@a{sv})",
				vec![minibus_variant::Arg::Value(builder.end())],
			)));
		}
	}
}

async fn reader_loop(weak: Weak<ConnectionInner>, mut reader: TransportReader, generation: u64) {
	loop {
		match read_message(&mut reader).await {
			Ok(Some(message)) => {
				let Some(inner) = weak.upgrade() else { break };
				Connection(inner).dispatch_incoming(message);
			}
			Ok(None) => {
				if let Some(inner) = weak.upgrade() {
					Connection(inner).handle_close(generation, None);
				}
				break;
			}
			Err(e) => {
				if let Some(inner) = weak.upgrade() {
					let error = Error::Failed(e.to_string());
					Connection(inner).handle_close(generation, Some(&error));
				}
				break;
			}
		}
	}
}

async fn writer_loop(
	weak: Weak<ConnectionInner>,
	mut writer: TransportWriter,
	mut rx: mpsc::UnboundedReceiver<Message>,
	generation: u64,
) {
	while let Some(message) = rx.recv().await {
		if let Err(e) = minibus_wire::write_message(&mut writer, &message).await {
			if let Some(inner) = weak.upgrade() {
				let error = Error::Failed(e.to_string());
				Connection(inner).handle_close(generation, Some(&error));
			}
			break;
		}
	}
}

fn match_rule(
	sender: Option<&str>,
	interface: Option<&str>,
	member: Option<&str>,
	path: Option<&str>,
	arg0: Option<&str>,
) -> String {
	use std::fmt::Write as _;
	let mut rule = String::from("type='signal'");
	for (key, value) in [
		("sender", sender),
		("interface", interface),
		("member", member),
		("path", path),
		("arg0", arg0),
	] {
		if let Some(value) = value {
			let _ = write!(rule, ",{key}='{value}'");
		}
	}
	rule
}

fn address_error(error: AddressError) -> Error {
	match error {
		AddressError::NoServer(bus) => Error::NoServer(format!("{bus:?} bus address not set")),
		AddressError::Bad { address, reason } => Error::BadAddress(format!("{address}: {reason}")),
	}
}

/// Runs a future to completion from blocking code. Must be called on a
/// multi-threaded runtime worker or outside any runtime.
fn block_on<F: std::future::Future>(future: F) -> F::Output {
	match Handle::try_current() {
		Ok(handle) => tokio::task::block_in_place(|| handle.block_on(future)),
		Err(_) => tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.expect("runtime for blocking call")
			.block_on(future),
	}
}
