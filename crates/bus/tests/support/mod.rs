//! An in-process message-bus daemon for the integration tests.
//!
//! Speaks the wire protocol directly: `Hello`, `RequestName` (with a
//! waiting queue and replacement), `ReleaseName`, `GetNameOwner`,
//! `AddMatch`/`RemoveMatch`, `GetId`, routing of method calls and
//! replies by destination, signal broadcast, and the
//! `NameOwnerChanged` / `NameAcquired` / `NameLost` signals. A special
//! `KickMe` method drops the caller's transport, for reconnect tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use minibus_variant::{build, Arg};
use minibus_wire::{
	Address, Listener, Message, MessageFlags, MessageKind, Serial, Transport,
};

const BUS_NAME: &str = "org.freedesktop.DBus";
const BUS_PATH: &str = "/org/freedesktop/DBus";

const REPLY_PRIMARY_OWNER: u32 = 1;
const REPLY_IN_QUEUE: u32 = 2;
const REPLY_EXISTS: u32 = 3;
const REPLY_ALREADY_OWNER: u32 = 4;

const FLAG_ALLOW_REPLACEMENT: u32 = 1;
const FLAG_REPLACE: u32 = 2;
const FLAG_DO_NOT_QUEUE: u32 = 4;

struct Client {
	unique: String,
	tx: mpsc::UnboundedSender<Message>,
	kick: CancellationToken,
}

struct NameEntry {
	owner: u64,
	allow_replacement: bool,
	queue: Vec<(u64, u32)>,
}

#[derive(Default)]
struct BusState {
	next_client: u64,
	next_serial: u32,
	clients: HashMap<u64, Client>,
	names: HashMap<String, NameEntry>,
}

impl BusState {
	fn serial(&mut self) -> Serial {
		self.next_serial += 1;
		Serial(self.next_serial)
	}

	fn unique_of(&self, id: u64) -> Option<String> {
		self.clients.get(&id).map(|c| c.unique.clone())
	}

	fn client_by_unique(&self, unique: &str) -> Option<u64> {
		self.clients.iter().find(|(_, c)| c.unique == unique).map(|(id, _)| *id)
	}

	/// Delivers as-is: forwarded messages keep their sender-scoped
	/// serial so reply matching still works at the origin.
	fn send_to(&mut self, id: u64, message: Message) {
		if let Some(client) = self.clients.get(&id) {
			let _ = client.tx.send(message);
		}
	}

	fn broadcast(&mut self, message: Message) {
		for client in self.clients.values() {
			let _ = client.tx.send(message.clone());
		}
	}

	fn signal_name_owner_changed(&mut self, name: &str, old: &str, new: &str) {
		let mut signal = Message::new_signal(BUS_PATH, BUS_NAME, "NameOwnerChanged");
		signal.serial = self.serial();
		signal.sender = Some(BUS_NAME.to_owned());
		signal.set_args(build(
			"(sss)",
			vec![Arg::Str(name), Arg::Str(old), Arg::Str(new)],
		));
		self.broadcast(signal);
	}

	fn signal_directed(&mut self, target: u64, member: &str, name: &str) {
		let Some(unique) = self.unique_of(target) else { return };
		let mut signal = Message::new_signal(BUS_PATH, BUS_NAME, member);
		signal.serial = self.serial();
		signal.sender = Some(BUS_NAME.to_owned());
		signal.destination = Some(unique);
		signal.set_args(build("(s)", vec![Arg::Str(name)]));
		self.send_to(target, signal);
	}

	fn grant(&mut self, name: &str, new_owner: u64, allow_replacement: bool, old: Option<u64>) {
		let old_unique = old.and_then(|id| self.unique_of(id)).unwrap_or_default();
		let new_unique = self.unique_of(new_owner).unwrap_or_default();
		if let Some(old) = old {
			self.signal_directed(old, "NameLost", name);
		}
		self.names
			.entry(name.to_owned())
			.and_modify(|entry| {
				entry.owner = new_owner;
				entry.allow_replacement = allow_replacement;
			})
			.or_insert(NameEntry {
				owner: new_owner,
				allow_replacement,
				queue: Vec::new(),
			});
		self.signal_directed(new_owner, "NameAcquired", name);
		self.signal_name_owner_changed(name, &old_unique, &new_unique);
	}

	fn release(&mut self, name: &str, releasing: u64) -> u32 {
		let Some(entry) = self.names.get_mut(name) else {
			return 2; // non-existent
		};
		if entry.owner != releasing {
			entry.queue.retain(|(id, _)| *id != releasing);
			return 3; // not owner
		}
		let next = if entry.queue.is_empty() {
			None
		} else {
			Some(entry.queue.remove(0))
		};
		let released_unique = self.unique_of(releasing).unwrap_or_default();
		match next {
			Some((successor, flags)) => {
				self.grant(
					name,
					successor,
					flags & FLAG_ALLOW_REPLACEMENT != 0,
					Some(releasing),
				);
			}
			None => {
				self.names.remove(name);
				self.signal_directed(releasing, "NameLost", name);
				self.signal_name_owner_changed(name, &released_unique, "");
			}
		}
		1 // released
	}

	fn drop_client(&mut self, id: u64) {
		let owned: Vec<String> = self
			.names
			.iter()
			.filter(|(_, entry)| entry.owner == id)
			.map(|(name, _)| name.clone())
			.collect();
		for name in owned {
			self.release(&name, id);
		}
		for entry in self.names.values_mut() {
			entry.queue.retain(|(queued, _)| *queued != id);
		}
		self.clients.remove(&id);
	}
}

/// A running in-process bus daemon.
pub struct TestBus {
	address: String,
	_dir: tempfile::TempDir,
	accept_task: tokio::task::JoinHandle<()>,
}

impl Drop for TestBus {
	fn drop(&mut self) {
		self.accept_task.abort();
	}
}

impl TestBus {
	pub async fn start() -> TestBus {
		let dir = tempfile::tempdir().expect("socket dir");
		let address = format!("unix:path={}", dir.path().join("bus.sock").display());
		let parsed = Address::parse(&address).expect("test bus address");
		let listener = Listener::bind(&parsed).await.expect("bind test bus");
		let state = Arc::new(Mutex::new(BusState::default()));

		let accept_state = state.clone();
		let accept_task = tokio::spawn(async move {
			loop {
				let Ok(transport) = listener.accept().await else { break };
				serve_client(accept_state.clone(), transport);
			}
		});

		TestBus {
			address,
			_dir: dir,
			accept_task,
		}
	}

	pub fn address(&self) -> &str {
		&self.address
	}
}

fn serve_client(state: Arc<Mutex<BusState>>, transport: Transport) {
	let (mut reader, mut writer) = transport.into_split();
	let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
	let kick = CancellationToken::new();

	let id = {
		let mut state = state.lock();
		state.next_client += 1;
		let id = state.next_client;
		state.clients.insert(
			id,
			Client {
				unique: format!(":1.{id}"),
				tx,
				kick: kick.clone(),
			},
		);
		id
	};

	let write_kick = kick.clone();
	tokio::spawn(async move {
		loop {
			tokio::select! {
				() = write_kick.cancelled() => break,
				message = rx.recv() => match message {
					Some(message) => {
						if minibus_wire::write_message(&mut writer, &message).await.is_err() {
							break;
						}
					}
					None => break,
				},
			}
		}
	});

	let read_state = state;
	tokio::spawn(async move {
		loop {
			tokio::select! {
				() = kick.cancelled() => break,
				message = minibus_wire::read_message(&mut reader) => match message {
					Ok(Some(message)) => handle_message(&read_state, id, message),
					Ok(None) | Err(_) => break,
				},
			}
		}
		read_state.lock().drop_client(id);
	});
}

fn string_arg(message: &Message, index: usize) -> Option<String> {
	let args = message.args();
	(args.n_children() > index)
		.then(|| args.child_value(index))
		.filter(|v| v.classify() == minibus_variant::Class::Str)
		.map(|v| v.as_str().to_owned())
}

fn uint_arg(message: &Message, index: usize) -> Option<u32> {
	let args = message.args();
	(args.n_children() > index)
		.then(|| args.child_value(index))
		.filter(|v| v.classify() == minibus_variant::Class::Uint32)
		.map(|v| v.as_uint32())
}

fn handle_message(state: &Arc<Mutex<BusState>>, id: u64, message: Message) {
	match message.kind {
		MessageKind::MethodCall => {
			if message.destination.as_deref() == Some(BUS_NAME) {
				handle_bus_call(state, id, &message);
			} else {
				forward_call(state, id, message);
			}
		}
		MessageKind::MethodReturn | MessageKind::Error => {
			let mut state = state.lock();
			let target = message
				.destination
				.as_deref()
				.and_then(|unique| state.client_by_unique(unique));
			if let Some(target) = target {
				let mut message = message;
				message.sender = state.unique_of(id);
				state.send_to(target, message);
			}
		}
		MessageKind::Signal => {
			let mut state = state.lock();
			let mut message = message;
			message.sender = state.unique_of(id);
			state.broadcast(message);
		}
	}
}

fn reply_to(state: &mut BusState, id: u64, call: &Message, args: Option<minibus_variant::Value>) {
	if call.flags.contains(MessageFlags::NO_REPLY_EXPECTED) {
		return;
	}
	let mut reply = Message::new_method_return(call.serial);
	reply.serial = state.serial();
	reply.sender = Some(BUS_NAME.to_owned());
	reply.destination = state.unique_of(id);
	if let Some(args) = args {
		reply.set_args(args);
	}
	state.send_to(id, reply);
}

fn reply_error(state: &mut BusState, id: u64, call: &Message, name: &str, text: &str) {
	if call.flags.contains(MessageFlags::NO_REPLY_EXPECTED) {
		return;
	}
	let mut reply = Message::new_error(call.serial, name, text);
	reply.serial = state.serial();
	reply.sender = Some(BUS_NAME.to_owned());
	reply.destination = state.unique_of(id);
	state.send_to(id, reply);
}

fn handle_bus_call(state: &Arc<Mutex<BusState>>, id: u64, call: &Message) {
	let member = call.member.clone().unwrap_or_default();
	let mut state = state.lock();
	match member.as_str() {
		"Hello" => {
			let unique = state.unique_of(id).unwrap_or_default();
			reply_to(&mut state, id, call, Some(build("(s)", vec![Arg::Str(&unique)])));
		}
		"GetId" => {
			reply_to(
				&mut state,
				id,
				call,
				Some(build("(s)", vec![Arg::Str("feedfacedeadbeeffeedfacedeadbeef")])),
			);
		}
		"RequestName" => {
			let (Some(name), Some(flags)) = (string_arg(call, 0), uint_arg(call, 1)) else {
				reply_error(
					&mut state,
					id,
					call,
					"org.freedesktop.DBus.Error.InvalidArgs",
					"RequestName takes (su)",
				);
				return;
			};
			let allow = flags & FLAG_ALLOW_REPLACEMENT != 0;
			let existing = state.names.get(&name).map(|e| (e.owner, e.allow_replacement));
			let code = match existing {
				None => {
					state.grant(&name, id, allow, None);
					REPLY_PRIMARY_OWNER
				}
				Some((owner, _)) if owner == id => {
					if let Some(entry) = state.names.get_mut(&name) {
						entry.allow_replacement = allow;
					}
					REPLY_ALREADY_OWNER
				}
				Some((old_owner, replaceable)) => {
					if replaceable && flags & FLAG_REPLACE != 0 {
						// The replaced owner keeps its place at the head
						// of the queue.
						if let Some(entry) = state.names.get_mut(&name) {
							entry.queue.insert(0, (old_owner, FLAG_ALLOW_REPLACEMENT));
						}
						state.grant(&name, id, allow, Some(old_owner));
						REPLY_PRIMARY_OWNER
					} else if flags & FLAG_DO_NOT_QUEUE != 0 {
						REPLY_EXISTS
					} else {
						if let Some(entry) = state.names.get_mut(&name) {
							entry.queue.retain(|(queued, _)| *queued != id);
							entry.queue.push((id, flags));
						}
						REPLY_IN_QUEUE
					}
				}
			};
			reply_to(&mut state, id, call, Some(build("(u)", vec![Arg::Uint32(code)])));
		}
		"ReleaseName" => {
			let Some(name) = string_arg(call, 0) else {
				reply_error(
					&mut state,
					id,
					call,
					"org.freedesktop.DBus.Error.InvalidArgs",
					"ReleaseName takes (s)",
				);
				return;
			};
			let code = state.release(&name, id);
			reply_to(&mut state, id, call, Some(build("(u)", vec![Arg::Uint32(code)])));
		}
		"GetNameOwner" => {
			let Some(name) = string_arg(call, 0) else {
				reply_error(
					&mut state,
					id,
					call,
					"org.freedesktop.DBus.Error.InvalidArgs",
					"GetNameOwner takes (s)",
				);
				return;
			};
			let owner = state
				.names
				.get(&name)
				.map(|entry| entry.owner)
				.and_then(|owner| state.unique_of(owner));
			match owner {
				Some(unique) => {
					reply_to(&mut state, id, call, Some(build("(s)", vec![Arg::Str(&unique)])));
				}
				None => reply_error(
					&mut state,
					id,
					call,
					"org.freedesktop.DBus.Error.NameHasNoOwner",
					"nobody owns that name",
				),
			}
		}
		"AddMatch" | "RemoveMatch" => {
			reply_to(&mut state, id, call, None);
		}
		"KickMe" => {
			if let Some(client) = state.clients.get(&id) {
				client.kick.cancel();
			}
		}
		_ => reply_error(
			&mut state,
			id,
			call,
			"org.freedesktop.DBus.Error.UnknownMethod",
			&format!("no method {member:?} on the bus"),
		),
	}
}

fn forward_call(state: &Arc<Mutex<BusState>>, id: u64, message: Message) {
	let mut state = state.lock();
	let target = message.destination.as_deref().and_then(|destination| {
		if destination.starts_with(':') {
			state.client_by_unique(destination)
		} else {
			state.names.get(destination).map(|entry| entry.owner)
		}
	});
	match target {
		Some(target) => {
			let mut message = message;
			message.sender = state.unique_of(id);
			state.send_to(target, message);
		}
		None => {
			let destination = message.destination.clone().unwrap_or_default();
			reply_error(
				&mut state,
				id,
				&message,
				"org.freedesktop.DBus.Error.ServiceUnknown",
				&format!("no service {destination:?}"),
			);
		}
	}
}
