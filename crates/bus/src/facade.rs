//! Convenience wrappers composing the name services with callbacks.
//!
//! [`own_name`] and [`watch_name`] hand out plain numeric registrations
//! backed by the singleton [`NameOwner`] / [`NameWatcher`] objects;
//! [`unown_name`] and [`unwatch_name`] drop them. Observers get the
//! classic callback shape: acquired/lost for owning, appeared/vanished
//! for watching, with the initial resolution reported as lost (not
//! granted) or vanished (nobody owns the name).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::owner::{NameOwner, OwnerEvent, OwnerFlags};
use crate::watcher::{NameWatcher, WatcherEvent};

/// Registration token from [`own_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnId(pub u64);

/// Registration token from [`watch_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Callback for name-ownership changes; receives the connection and the
/// name.
pub type NameCallback = Arc<dyn Fn(&Connection, &str) + Send + Sync>;

/// Callback for a name gaining an owner; also receives the owner's
/// unique name.
pub type AppearedCallback = Arc<dyn Fn(&Connection, &str, &str) + Send + Sync>;

struct OwnRegistration {
	owner: NameOwner,
	observer: u64,
}

struct WatchRegistration {
	watcher: NameWatcher,
	observer: u64,
}

fn own_registrations() -> &'static Mutex<HashMap<u64, OwnRegistration>> {
	static TABLE: std::sync::OnceLock<Mutex<HashMap<u64, OwnRegistration>>> =
		std::sync::OnceLock::new();
	TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn watch_registrations() -> &'static Mutex<HashMap<u64, WatchRegistration>> {
	static TABLE: std::sync::OnceLock<Mutex<HashMap<u64, WatchRegistration>>> =
		std::sync::OnceLock::new();
	TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn next_registration() -> u64 {
	static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
	NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// Starts owning `name` on `connection`.
///
/// `on_acquired` fires when ownership is obtained (including after a
/// reconnect); `on_lost` fires when it is lost, and once at
/// initialization if the name could not be obtained at all.
pub fn own_name(
	connection: &Connection,
	name: &str,
	flags: OwnerFlags,
	on_acquired: Option<NameCallback>,
	on_lost: Option<NameCallback>,
) -> OwnId {
	let owner = NameOwner::get(connection, name, flags);
	let catchup_lost = on_lost.clone();
	let catchup_acquired = on_acquired.clone();
	let (observer, initialized, owns) = owner.subscribe_with_snapshot(Arc::new(move |owner: &NameOwner, event: OwnerEvent| {
		match event {
			OwnerEvent::NameAcquired => {
				if let Some(callback) = &on_acquired {
					callback(owner.connection(), owner.name());
				}
			}
			OwnerEvent::NameLost => {
				if let Some(callback) = &on_lost {
					callback(owner.connection(), owner.name());
				}
			}
			// The first request resolving without a grant is reported as
			// a loss.
			OwnerEvent::Initialized => {
				if !owner.owns_name()
					&& let Some(callback) = &on_lost
				{
					callback(owner.connection(), owner.name());
				}
			}
		}
	}));
	// Resolution that happened before the observer attached is replayed
	// from the snapshot; the atomic attach guarantees no double report.
	if initialized {
		if owns {
			if let Some(callback) = &catchup_acquired {
				callback(owner.connection(), owner.name());
			}
		} else if let Some(callback) = &catchup_lost {
			callback(owner.connection(), owner.name());
		}
	}
	let id = next_registration();
	own_registrations().lock().insert(id, OwnRegistration { owner, observer });
	OwnId(id)
}

/// Stops owning: relinquishes the name (reporting the loss to the
/// callbacks), then detaches them and drops the registration's reference
/// to the singleton owner.
pub fn unown_name(id: OwnId) {
	let registration = own_registrations().lock().remove(&id.0);
	if let Some(registration) = registration {
		registration.owner.relinquish();
		registration.owner.unsubscribe(registration.observer);
	}
}

/// Starts watching `name` on `connection`.
///
/// `on_appeared` fires with the owner's unique name whenever the name
/// gains an owner; `on_vanished` fires when it loses one, and once at
/// initialization if nobody owns the name.
pub fn watch_name(
	connection: &Connection,
	name: &str,
	on_appeared: Option<AppearedCallback>,
	on_vanished: Option<NameCallback>,
) -> WatchId {
	let watcher = NameWatcher::get(connection, name);
	let catchup_appeared = on_appeared.clone();
	let catchup_vanished = on_vanished.clone();
	let (observer, initialized, current_owner) = watcher.subscribe_with_snapshot(Arc::new(move |watcher: &NameWatcher, event: &WatcherEvent| {
		match event {
			WatcherEvent::NameAppeared(owner) => {
				if let Some(callback) = &on_appeared {
					callback(watcher.connection(), watcher.name(), owner);
				}
			}
			WatcherEvent::NameVanished => {
				if let Some(callback) = &on_vanished {
					callback(watcher.connection(), watcher.name());
				}
			}
			// Resolving to "nobody owns it" is reported as a vanish.
			WatcherEvent::Initialized => {
				if watcher.name_owner().is_none()
					&& let Some(callback) = &on_vanished
				{
					callback(watcher.connection(), watcher.name());
				}
			}
		}
	}));
	if initialized {
		match &current_owner {
			Some(owner) => {
				if let Some(callback) = &catchup_appeared {
					callback(watcher.connection(), watcher.name(), owner);
				}
			}
			None => {
				if let Some(callback) = &catchup_vanished {
					callback(watcher.connection(), watcher.name());
				}
			}
		}
	}
	let id = next_registration();
	watch_registrations().lock().insert(id, WatchRegistration { watcher, observer });
	WatchId(id)
}

/// Stops watching: detaches the callbacks and drops the registration's
/// reference to the singleton watcher.
pub fn unwatch_name(id: WatchId) {
	let registration = watch_registrations().lock().remove(&id.0);
	if let Some(registration) = registration {
		registration.watcher.unsubscribe(registration.observer);
	}
}
