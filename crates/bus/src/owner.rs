//! Well-known name ownership.
//!
//! A [`NameOwner`] is a per-(connection, name) singleton coupling the
//! bus's `NameLost` / `NameAcquired` signals and the `RequestName` /
//! `ReleaseName` calls into a steady "do we own the name" view that
//! survives transport reconnects. It never surfaces errors to its
//! observers; failure degrades to not-owning.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use minibus_variant::{build, Arg, Value};

use crate::connection::{
	ClosedHandlerId, Connection, OpenedHandlerId, SignalEvent, SubscriptionId,
};

const BUS_NAME: &str = "org.freedesktop.DBus";
const BUS_PATH: &str = "/org/freedesktop/DBus";
const BUS_INTERFACE: &str = "org.freedesktop.DBus";

const REQUEST_NAME_REPLY_PRIMARY_OWNER: u32 = 1;
const REQUEST_NAME_REPLY_ALREADY_OWNER: u32 = 4;

bitflags! {
	/// Behaviour flags passed through to `RequestName`.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct OwnerFlags: u32 {
		/// Another peer may take the name over.
		const ALLOW_REPLACEMENT = 1 << 0;
		/// Take the name over from a consenting current owner.
		const REPLACE = 1 << 1;
	}
}

/// Observer notification from a [`NameOwner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerEvent {
	/// `owns_name` went false → true.
	NameAcquired,
	/// `owns_name` went true → false.
	NameLost,
	/// The first `RequestName` resolved, successfully or not.
	Initialized,
}

/// Observer callback; runs on the context current when it was attached.
pub type OwnerCallback = Arc<dyn Fn(&NameOwner, OwnerEvent) + Send + Sync>;

struct OwnerState {
	owns_name: bool,
	initialized: bool,
	observers: Vec<(u64, Option<Handle>, OwnerCallback)>,
	subscriptions: Vec<SubscriptionId>,
	opened_handler: Option<OpenedHandlerId>,
	closed_handler: Option<ClosedHandlerId>,
}

struct OwnerInner {
	connection: Connection,
	name: String,
	flags: OwnerFlags,
	state: Mutex<OwnerState>,
}

/// Per-(connection, name) singleton tracking well-known name ownership.
#[derive(Clone)]
pub struct NameOwner(Arc<OwnerInner>);

fn owners() -> &'static Mutex<HashMap<(usize, String), Weak<OwnerInner>>> {
	static TABLE: std::sync::OnceLock<Mutex<HashMap<(usize, String), Weak<OwnerInner>>>> =
		std::sync::OnceLock::new();
	TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

impl NameOwner {
	/// The singleton owner of `name` on `connection`, creating it on
	/// first use.
	///
	/// Creation subscribes to `NameLost` / `NameAcquired` and, when the
	/// connection is open, issues `RequestName`. A closed connection
	/// counts as initialized immediately; `RequestName` is reissued on
	/// every (re)open so ownership can be reclaimed after a reconnect.
	///
	/// # Panics
	///
	/// Panics if `name` is not a well-formed well-known bus name.
	#[must_use]
	pub fn get(connection: &Connection, name: &str, flags: OwnerFlags) -> NameOwner {
		assert!(
			minibus_wire::is_valid_bus_name(name) && !name.starts_with(':'),
			"invalid well-known name {name:?}"
		);
		let key = (connection.id(), name.to_owned());
		let mut table = owners().lock();
		if let Some(existing) = table.get(&key).and_then(Weak::upgrade) {
			return NameOwner(existing);
		}
		let owner = NameOwner(Arc::new(OwnerInner {
			connection: connection.clone(),
			name: name.to_owned(),
			flags,
			state: Mutex::new(OwnerState {
				owns_name: false,
				initialized: false,
				observers: Vec::new(),
				subscriptions: Vec::new(),
				opened_handler: None,
				closed_handler: None,
			}),
		}));
		table.insert(key, Arc::downgrade(&owner.0));
		drop(table);
		owner.attach();
		owner
	}

	fn attach(&self) {
		let connection = &self.0.connection;
		let name = self.0.name.clone();

		let weak = Arc::downgrade(&self.0);
		let lost = connection.signal_subscribe(
			Some(BUS_NAME),
			Some(BUS_INTERFACE),
			Some("NameLost"),
			Some(BUS_PATH),
			Some(&name),
			Arc::new(move |_, _event: &SignalEvent| {
				if let Some(inner) = weak.upgrade() {
					NameOwner(inner).set_owned(false);
				}
			}),
		);
		let weak = Arc::downgrade(&self.0);
		let acquired = connection.signal_subscribe(
			Some(BUS_NAME),
			Some(BUS_INTERFACE),
			Some("NameAcquired"),
			Some(BUS_PATH),
			Some(&name),
			Arc::new(move |_, _event: &SignalEvent| {
				if let Some(inner) = weak.upgrade() {
					NameOwner(inner).set_owned(true);
				}
			}),
		);

		let weak = Arc::downgrade(&self.0);
		let opened = connection.on_opened(Arc::new(move |_| {
			if let Some(inner) = weak.upgrade() {
				NameOwner(inner).spawn_request();
			}
		}));
		let weak = Arc::downgrade(&self.0);
		let closed = connection.on_closed(Arc::new(move |_, _| {
			if let Some(inner) = weak.upgrade() {
				NameOwner(inner).set_owned(false);
			}
		}));

		{
			let mut state = self.0.state.lock();
			state.subscriptions = vec![lost, acquired];
			state.opened_handler = Some(opened);
			state.closed_handler = Some(closed);
		}

		if connection.is_open() {
			self.spawn_request();
		} else {
			// A connection that is already closed still counts as
			// initialized; there is no request whose outcome to wait for.
			self.mark_initialized();
		}
	}

	/// The name this owner requests.
	#[must_use]
	pub fn name(&self) -> &str {
		&self.0.name
	}

	/// The connection this owner runs on.
	#[must_use]
	pub fn connection(&self) -> &Connection {
		&self.0.connection
	}

	/// Whether the connection currently owns the name.
	#[must_use]
	pub fn owns_name(&self) -> bool {
		self.0.state.lock().owns_name
	}

	/// Whether the first `RequestName` has resolved.
	#[must_use]
	pub fn is_initialized(&self) -> bool {
		self.0.state.lock().initialized
	}

	/// Attaches an observer; returns a token for [`NameOwner::unsubscribe`].
	pub fn subscribe(&self, callback: OwnerCallback) -> u64 {
		self.subscribe_with_snapshot(callback).0
	}

	/// Attaches an observer and returns the (initialized, owns_name)
	/// state as of the attach, atomically: events reflecting state up to
	/// the snapshot went to earlier observers only.
	pub(crate) fn subscribe_with_snapshot(&self, callback: OwnerCallback) -> (u64, bool, bool) {
		static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
		let id = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		let context = Handle::try_current().ok();
		let mut state = self.0.state.lock();
		state.observers.push((id, context, callback));
		(id, state.initialized, state.owns_name)
	}

	/// Detaches an observer.
	pub fn unsubscribe(&self, id: u64) {
		self.0.state.lock().observers.retain(|(observer, _, _)| *observer != id);
	}

	fn snapshot_observers(state: &OwnerState) -> Vec<(Option<Handle>, OwnerCallback)> {
		state
			.observers
			.iter()
			.map(|(_, context, callback)| (context.clone(), callback.clone()))
			.collect()
	}

	fn emit_to(&self, observers: Vec<(Option<Handle>, OwnerCallback)>, event: OwnerEvent) {
		for (context, callback) in observers {
			let owner = self.clone();
			let run = move || callback(&owner, event);
			match context.or_else(|| Handle::try_current().ok()) {
				Some(handle) => {
					handle.spawn(async move { run() });
				}
				None => run(),
			}
		}
	}

	fn set_owned(&self, owned: bool) {
		// Observers are copied in the same critical section as the state
		// change, so an observer attached later sees either the event or
		// the already-changed snapshot, never both.
		let observers = {
			let mut state = self.0.state.lock();
			if state.owns_name == owned {
				return;
			}
			state.owns_name = owned;
			NameOwner::snapshot_observers(&state)
		};
		self.emit_to(
			observers,
			if owned { OwnerEvent::NameAcquired } else { OwnerEvent::NameLost },
		);
	}

	fn mark_initialized(&self) {
		let observers = {
			let mut state = self.0.state.lock();
			if state.initialized {
				return;
			}
			state.initialized = true;
			NameOwner::snapshot_observers(&state)
		};
		self.emit_to(observers, OwnerEvent::Initialized);
	}

	/// Voluntarily gives the name up: sends a fire-and-forget
	/// `ReleaseName` and reports the loss to observers.
	pub fn relinquish(&self) {
		if !self.owns_name() {
			return;
		}
		let mut message = minibus_wire::Message::new_method_call(
			Some(BUS_NAME),
			BUS_PATH,
			Some(BUS_INTERFACE),
			"ReleaseName",
		);
		message.flags |= minibus_wire::MessageFlags::NO_REPLY_EXPECTED;
		message.set_args(Value::new_string(&self.0.name));
		let _ = self.0.connection.queue_message(message);
		self.set_owned(false);
	}

	/// Issues `RequestName` in the background; called at creation and on
	/// every reconnect.
	fn spawn_request(&self) {
		let weak = Arc::downgrade(&self.0);
		let task = async move {
			let Some(inner) = weak.upgrade() else { return };
			let owner = NameOwner(inner);
			owner.request_name().await;
		};
		match Handle::try_current() {
			Ok(handle) => {
				handle.spawn(task);
			}
			Err(_) => {
				std::thread::spawn(move || {
					tokio::runtime::Builder::new_current_thread()
						.enable_all()
						.build()
						.expect("request runtime")
						.block_on(task);
				});
			}
		}
	}

	async fn request_name(&self) {
		let args = build(
			"(su)",
			vec![Arg::Str(&self.0.name), Arg::Uint32(self.0.flags.bits())],
		);
		let result = self
			.0
			.connection
			.invoke_method(
				Some(BUS_NAME),
				BUS_PATH,
				Some(BUS_INTERFACE),
				"RequestName",
				Some(args),
				None,
				None,
			)
			.await;
		match result {
			Ok(reply) => {
				let code = (reply.n_children() > 0)
					.then(|| reply.child_value(0))
					.filter(|v| v.classify() == minibus_variant::Class::Uint32)
					.map_or(0, |v| v.as_uint32());
				match code {
					REQUEST_NAME_REPLY_PRIMARY_OWNER => self.set_owned(true),
					// Already-owner leaves state untouched: no spurious
					// acquisition event.
					REQUEST_NAME_REPLY_ALREADY_OWNER => {}
					// In-queue and exists: ownership is driven by the
					// NameAcquired/NameLost signals.
					_ => {}
				}
			}
			Err(e) => {
				tracing::debug!(name = %self.0.name, error = %e, "RequestName failed");
			}
		}
		self.mark_initialized();
	}
}

impl Drop for OwnerInner {
	fn drop(&mut self) {
		owners().lock().remove(&(self.connection.id(), self.name.clone()));

		// Fire-and-forget release of a still-owned name, before the
		// subscriptions go away.
		let state = self.state.get_mut();
		if state.owns_name {
			let mut message = minibus_wire::Message::new_method_call(
				Some(BUS_NAME),
				BUS_PATH,
				Some(BUS_INTERFACE),
				"ReleaseName",
			);
			message.flags |= minibus_wire::MessageFlags::NO_REPLY_EXPECTED;
			message.set_args(Value::new_string(&self.name));
			let _ = self.connection.queue_message(message);
		}
		for subscription in state.subscriptions.drain(..) {
			self.connection.signal_unsubscribe(subscription);
		}
		if let Some(id) = state.opened_handler.take() {
			self.connection.remove_opened_handler(id);
		}
		if let Some(id) = state.closed_handler.take() {
			self.connection.remove_closed_handler(id);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flags_map_to_request_name_bits() {
		assert_eq!(OwnerFlags::ALLOW_REPLACEMENT.bits(), 1);
		assert_eq!(OwnerFlags::REPLACE.bits(), 2);
		assert_eq!((OwnerFlags::ALLOW_REPLACEMENT | OwnerFlags::REPLACE).bits(), 3);
	}
}
