//! Well-known name watching.
//!
//! A [`NameWatcher`] is the mirror of the owner: a per-(connection,
//! name) singleton subscribing to `NameOwnerChanged` and issuing
//! `GetNameOwner` to establish the current holder, re-evaluated on every
//! transport re-open. Failures degrade to "nobody owns the name".

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;

use minibus_variant::Value;

use crate::connection::{
	ClosedHandlerId, Connection, OpenedHandlerId, SignalEvent, SubscriptionId,
};
use crate::error::Error;

const BUS_NAME: &str = "org.freedesktop.DBus";
const BUS_PATH: &str = "/org/freedesktop/DBus";
const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Observer notification from a [`NameWatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
	/// The name gained an owner; carries the owner's unique name.
	NameAppeared(String),
	/// The name lost its owner.
	NameVanished,
	/// The first `GetNameOwner` resolved, successfully or not.
	Initialized,
}

/// Observer callback; runs on the context current when it was attached.
pub type WatcherCallback = Arc<dyn Fn(&NameWatcher, &WatcherEvent) + Send + Sync>;

struct WatcherState {
	name_owner: Option<String>,
	initialized: bool,
	observers: Vec<(u64, Option<Handle>, WatcherCallback)>,
	subscription: Option<SubscriptionId>,
	opened_handler: Option<OpenedHandlerId>,
	closed_handler: Option<ClosedHandlerId>,
}

struct WatcherInner {
	connection: Connection,
	name: String,
	state: Mutex<WatcherState>,
}

/// Per-(connection, name) singleton tracking who owns a well-known name.
#[derive(Clone)]
pub struct NameWatcher(Arc<WatcherInner>);

fn watchers() -> &'static Mutex<HashMap<(usize, String), Weak<WatcherInner>>> {
	static TABLE: std::sync::OnceLock<Mutex<HashMap<(usize, String), Weak<WatcherInner>>>> =
		std::sync::OnceLock::new();
	TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

impl NameWatcher {
	/// The singleton watcher of `name` on `connection`, creating it on
	/// first use.
	///
	/// Creation subscribes to `NameOwnerChanged` filtered to `name` and,
	/// when the connection is open, issues `GetNameOwner`; otherwise the
	/// query is deferred until the connection opens.
	///
	/// # Panics
	///
	/// Panics if `name` is not a well-formed well-known bus name.
	#[must_use]
	pub fn get(connection: &Connection, name: &str) -> NameWatcher {
		assert!(
			minibus_wire::is_valid_bus_name(name) && !name.starts_with(':'),
			"invalid well-known name {name:?}"
		);
		let key = (connection.id(), name.to_owned());
		let mut table = watchers().lock();
		if let Some(existing) = table.get(&key).and_then(Weak::upgrade) {
			return NameWatcher(existing);
		}
		let watcher = NameWatcher(Arc::new(WatcherInner {
			connection: connection.clone(),
			name: name.to_owned(),
			state: Mutex::new(WatcherState {
				name_owner: None,
				initialized: false,
				observers: Vec::new(),
				subscription: None,
				opened_handler: None,
				closed_handler: None,
			}),
		}));
		table.insert(key, Arc::downgrade(&watcher.0));
		drop(table);
		watcher.attach();
		watcher
	}

	fn attach(&self) {
		let connection = &self.0.connection;
		let name = self.0.name.clone();

		let weak = Arc::downgrade(&self.0);
		let subscription = connection.signal_subscribe(
			Some(BUS_NAME),
			Some(BUS_INTERFACE),
			Some("NameOwnerChanged"),
			Some(BUS_PATH),
			Some(&name),
			Arc::new(move |_, event: &SignalEvent| {
				if let Some(inner) = weak.upgrade() {
					NameWatcher(inner).on_owner_changed(event);
				}
			}),
		);

		let weak = Arc::downgrade(&self.0);
		let opened = connection.on_opened(Arc::new(move |_| {
			if let Some(inner) = weak.upgrade() {
				NameWatcher(inner).spawn_query();
			}
		}));
		let weak = Arc::downgrade(&self.0);
		let closed = connection.on_closed(Arc::new(move |_, _| {
			if let Some(inner) = weak.upgrade() {
				NameWatcher(inner).set_owner(None);
			}
		}));

		{
			let mut state = self.0.state.lock();
			state.subscription = Some(subscription);
			state.opened_handler = Some(opened);
			state.closed_handler = Some(closed);
		}

		if connection.is_open() {
			self.spawn_query();
		}
	}

	/// The name being watched.
	#[must_use]
	pub fn name(&self) -> &str {
		&self.0.name
	}

	/// The connection this watcher runs on.
	#[must_use]
	pub fn connection(&self) -> &Connection {
		&self.0.connection
	}

	/// The current owner's unique name, if anybody owns the name.
	#[must_use]
	pub fn name_owner(&self) -> Option<String> {
		self.0.state.lock().name_owner.clone()
	}

	/// Whether the first `GetNameOwner` has resolved.
	#[must_use]
	pub fn is_initialized(&self) -> bool {
		self.0.state.lock().initialized
	}

	/// Attaches an observer; returns a token for
	/// [`NameWatcher::unsubscribe`].
	pub fn subscribe(&self, callback: WatcherCallback) -> u64 {
		self.subscribe_with_snapshot(callback).0
	}

	/// Attaches an observer and returns the (initialized, owner) state
	/// as of the attach, atomically: events reflecting state up to the
	/// snapshot went to earlier observers only.
	pub(crate) fn subscribe_with_snapshot(
		&self,
		callback: WatcherCallback,
	) -> (u64, bool, Option<String>) {
		static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
		let id = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		let context = Handle::try_current().ok();
		let mut state = self.0.state.lock();
		state.observers.push((id, context, callback));
		(id, state.initialized, state.name_owner.clone())
	}

	/// Detaches an observer.
	pub fn unsubscribe(&self, id: u64) {
		self.0.state.lock().observers.retain(|(observer, _, _)| *observer != id);
	}

	fn snapshot_observers(state: &WatcherState) -> Vec<(Option<Handle>, WatcherCallback)> {
		state
			.observers
			.iter()
			.map(|(_, context, callback)| (context.clone(), callback.clone()))
			.collect()
	}

	fn emit_to(&self, observers: Vec<(Option<Handle>, WatcherCallback)>, event: WatcherEvent) {
		for (context, callback) in observers {
			let watcher = self.clone();
			let event = event.clone();
			let run = move || callback(&watcher, &event);
			match context.or_else(|| Handle::try_current().ok()) {
				Some(handle) => {
					handle.spawn(async move { run() });
				}
				None => run(),
			}
		}
	}

	fn set_owner(&self, owner: Option<String>) {
		// Observers are copied in the same critical section as the state
		// change; see the owner's matching comment.
		let (vanished, appeared, observers) = {
			let mut state = self.0.state.lock();
			let had = state.name_owner.clone();
			state.name_owner = owner.clone();
			let transition = match (had, owner) {
				(Some(_), None) => (true, None),
				(None, Some(new)) => (false, Some(new)),
				(Some(old), Some(new)) if old != new => (false, Some(new)),
				_ => (false, None),
			};
			(transition.0, transition.1, NameWatcher::snapshot_observers(&state))
		};
		if vanished {
			self.emit_to(observers.clone(), WatcherEvent::NameVanished);
		}
		if let Some(new) = appeared {
			self.emit_to(observers, WatcherEvent::NameAppeared(new));
		}
	}

	fn on_owner_changed(&self, event: &SignalEvent) {
		// NameOwnerChanged carries (name, old_owner, new_owner); empty
		// strings mean absent.
		let args = &event.args;
		if args.n_children() != 3 {
			return;
		}
		let arg = |i: usize| {
			let value = args.child_value(i);
			(value.classify() == minibus_variant::Class::Str)
				.then(|| value.as_str().to_owned())
		};
		let (Some(name), Some(old), Some(new)) = (arg(0), arg(1), arg(2)) else {
			return;
		};
		if name != self.0.name {
			return;
		}
		let believed = self.0.state.lock().name_owner.is_some();
		if !old.is_empty() && believed && new.is_empty() {
			self.set_owner(None);
		}
		if !new.is_empty() {
			self.set_owner(Some(new));
		}
	}

	/// Issues `GetNameOwner` in the background; called at creation and
	/// on every reconnect.
	fn spawn_query(&self) {
		let weak = Arc::downgrade(&self.0);
		let task = async move {
			let Some(inner) = weak.upgrade() else { return };
			let watcher = NameWatcher(inner);
			watcher.query_owner().await;
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
						.expect("query runtime")
						.block_on(task);
				});
			}
		}
	}

	async fn query_owner(&self) {
		let result = self
			.0
			.connection
			.invoke_method(
				Some(BUS_NAME),
				BUS_PATH,
				Some(BUS_INTERFACE),
				"GetNameOwner",
				Some(Value::new_string(&self.0.name)),
				None,
				None,
			)
			.await;
		match result {
			Ok(reply) => {
				let owner = (reply.n_children() > 0)
					.then(|| reply.child_value(0))
					.filter(|v| v.classify() == minibus_variant::Class::Str)
					.map(|v| v.as_str().to_owned());
				if let Some(owner) = owner {
					self.set_owner(Some(owner));
				}
			}
			Err(Error::NameHasNoOwner(_)) => {
				// Nobody owns the name; that is an answer, not a failure.
			}
			Err(e) => {
				tracing::debug!(name = %self.0.name, error = %e, "GetNameOwner failed");
			}
		}
		self.mark_initialized();
	}

	fn mark_initialized(&self) {
		let observers = {
			let mut state = self.0.state.lock();
			if state.initialized {
				return;
			}
			state.initialized = true;
			NameWatcher::snapshot_observers(&state)
		};
		self.emit_to(observers, WatcherEvent::Initialized);
	}
}

impl Drop for WatcherInner {
	fn drop(&mut self) {
		watchers().lock().remove(&(self.connection.id(), self.name.clone()));
		let state = self.state.get_mut();
		if let Some(subscription) = state.subscription.take() {
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
