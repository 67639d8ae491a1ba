//! End-to-end scenarios against the in-process test bus.

mod support;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use minibus_bus::{
	own_name, unown_name, watch_name, BusType, Connection, Error, InterfaceInfo, MethodInfo,
	MethodInvocation, NameOwner, ObjectHandler, OwnerFlags, PropertyAccess, PropertyInfo, Server,
};
use minibus_variant::{build, Arg, Value};
use support::TestBus;

const TEST_NAME: &str = "org.gtk.GDBus.Name1";
const TEST_PATH: &str = "/org/gtk/GDBus/TestObject";
const TEST_INTERFACE: &str = "org.gtk.GDBus.TestInterface";

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
	tokio::time::timeout(Duration::from_secs(5), rx.recv())
		.await
		.expect("timed out waiting for an event")
		.expect("event channel closed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
	for _ in 0..200 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
	panic!("condition not reached in time");
}

fn greeter_interface() -> InterfaceInfo {
	InterfaceInfo {
		name: TEST_INTERFACE.to_owned(),
		methods: vec![MethodInfo {
			name: "HelloWorld".to_owned(),
			in_args: vec![minibus_bus::ArgInfo::new(Some("greeting"), "s")],
			out_args: vec![minibus_bus::ArgInfo::new(Some("response"), "s")],
			annotations: Vec::new(),
		}],
		signals: Vec::new(),
		properties: Vec::new(),
		annotations: Vec::new(),
	}
}

struct Greeter;

impl ObjectHandler for Greeter {
	fn method_call(&self, _connection: &Connection, args: Value, invocation: MethodInvocation) {
		let greeting = args.child_value(0).as_str().to_owned();
		if greeting == "Return Registered" {
			invocation.return_error_name(
				"org.freedesktop.DBus.Error.MatchRuleNotFound",
				"as requested by the greeting",
			);
		} else {
			let response = format!("You greeted me with '{greeting}'. Thanks!");
			invocation.return_value(Some(build("(s)", vec![Arg::Str(&response)])));
		}
	}
}

// Scenario: hello round-trip. Connect, call GetId, observe the assigned
// unique name.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hello_round_trip() {
	let bus = TestBus::start().await;
	let connection = Connection::for_address(bus.address(), true).await.unwrap();

	let reply = connection
		.invoke_method(
			Some("org.freedesktop.DBus"),
			"/org/freedesktop/DBus",
			Some("org.freedesktop.DBus"),
			"GetId",
			None,
			None,
			None,
		)
		.await
		.unwrap();
	assert_eq!(reply.n_children(), 1);
	assert!(!reply.child_value(0).as_str().is_empty());

	let unique = connection.unique_name().expect("unique name assigned");
	let rest = unique.strip_prefix(':').expect("unique names start with a colon");
	let (major, minor) = rest.split_once('.').expect("unique names look like :N.M");
	assert!(major.chars().all(|c| c.is_ascii_digit()));
	assert!(minor.chars().all(|c| c.is_ascii_digit()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial(bus_env)]
async fn shared_connection_is_a_singleton() {
	let bus = TestBus::start().await;
	// Safety: test-only environment mutation, keyed to this test's bus
	// type alone.
	unsafe { std::env::set_var("DBUS_SESSION_BUS_ADDRESS", bus.address()) };

	let first = Connection::bus_get(BusType::Session).await.unwrap();
	let second = Connection::bus_get(BusType::Session).await.unwrap();
	assert_eq!(first, second, "bus_get must return the shared singleton");
	assert_eq!(first.unique_name(), second.unique_name());

	let private = Connection::bus_get_private(BusType::Session).await.unwrap();
	assert_ne!(private, first, "a private connection never collides with the shared one");
	assert!(private.is_private());
	assert_ne!(private.unique_name(), first.unique_name());
}

// Scenario: own, watch, unown.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn name_own_watch_unown() {
	let bus = TestBus::start().await;
	let owner_conn = Connection::for_address(bus.address(), true).await.unwrap();
	let watcher_conn = Connection::for_address(bus.address(), true).await.unwrap();

	// (a) Watching an unowned name reports a vanish immediately.
	let (vanished_tx, mut vanished_rx) = mpsc::unbounded_channel();
	let (appeared_tx, mut appeared_rx) = mpsc::unbounded_channel();
	let appeared = {
		let tx = appeared_tx.clone();
		Arc::new(move |_: &Connection, _: &str, owner: &str| {
			let _ = tx.send(owner.to_owned());
		})
	};
	let vanished = {
		let tx = vanished_tx.clone();
		Arc::new(move |_: &Connection, _: &str| {
			let _ = tx.send(());
		})
	};
	let watch = watch_name(&watcher_conn, TEST_NAME, Some(appeared), Some(vanished));
	recv(&mut vanished_rx).await;

	// (b) Owning the name notifies both sides.
	let (acquired_tx, mut acquired_rx) = mpsc::unbounded_channel();
	let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
	let on_acquired = {
		let tx = acquired_tx.clone();
		Arc::new(move |_: &Connection, _: &str| {
			let _ = tx.send(());
		})
	};
	let on_lost = {
		let tx = lost_tx.clone();
		Arc::new(move |_: &Connection, _: &str| {
			let _ = tx.send(());
		})
	};
	let own = own_name(
		&owner_conn,
		TEST_NAME,
		OwnerFlags::empty(),
		Some(on_acquired),
		Some(on_lost),
	);
	recv(&mut acquired_rx).await;
	let appeared_owner = recv(&mut appeared_rx).await;
	assert_eq!(Some(appeared_owner), owner_conn.unique_name());

	// A repeated request for an already-owned name is a no-op.
	let reply = owner_conn
		.invoke_method(
			Some("org.freedesktop.DBus"),
			"/org/freedesktop/DBus",
			Some("org.freedesktop.DBus"),
			"RequestName",
			Some(build("(su)", vec![Arg::Str(TEST_NAME), Arg::Uint32(0)])),
			None,
			None,
		)
		.await
		.unwrap();
	assert_eq!(reply.child_value(0).as_uint32(), 4, "expected ALREADY_OWNER");
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(acquired_rx.try_recv().is_err(), "no spurious name-acquired");

	// (c) Unowning loses the name on the owner and vanishes it for the
	// watcher.
	unown_name(own);
	recv(&mut lost_rx).await;
	recv(&mut vanished_rx).await;

	minibus_bus::unwatch_name(watch);
}

// Scenario: replacement and re-acquisition through the queue.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn name_replacement() {
	let bus = TestBus::start().await;
	let conn_a = Connection::for_address(bus.address(), true).await.unwrap();
	let conn_b = Connection::for_address(bus.address(), true).await.unwrap();

	let (a_events_tx, mut a_events_rx) = mpsc::unbounded_channel();
	let acquired_a = {
		let tx = a_events_tx.clone();
		Arc::new(move |_: &Connection, _: &str| {
			let _ = tx.send("acquired");
		})
	};
	let lost_a = {
		let tx = a_events_tx.clone();
		Arc::new(move |_: &Connection, _: &str| {
			let _ = tx.send("lost");
		})
	};
	let _own_a = own_name(
		&conn_a,
		TEST_NAME,
		OwnerFlags::ALLOW_REPLACEMENT,
		Some(acquired_a),
		Some(lost_a),
	);
	assert_eq!(recv(&mut a_events_rx).await, "acquired");

	let (b_acquired_tx, mut b_acquired_rx) = mpsc::unbounded_channel();
	let acquired_b = {
		let tx = b_acquired_tx.clone();
		Arc::new(move |_: &Connection, _: &str| {
			let _ = tx.send(());
		})
	};
	let own_b = own_name(
		&conn_b,
		TEST_NAME,
		OwnerFlags::REPLACE,
		Some(acquired_b),
		None,
	);

	// A loses to B.
	assert_eq!(recv(&mut a_events_rx).await, "lost");
	recv(&mut b_acquired_rx).await;

	// B releases; A re-acquires from the queue.
	unown_name(own_b);
	assert_eq!(recv(&mut a_events_rx).await, "acquired");
}

// Scenario: greeter method over the bus.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn greeter_method() {
	let bus = TestBus::start().await;
	let server = Connection::for_address(bus.address(), true).await.unwrap();
	let client = Connection::for_address(bus.address(), true).await.unwrap();

	server
		.register_object(TEST_PATH, greeter_interface(), Arc::new(Greeter))
		.unwrap();
	let server_name = server.unique_name().unwrap();

	let reply = client
		.invoke_method(
			Some(&server_name),
			TEST_PATH,
			Some(TEST_INTERFACE),
			"HelloWorld",
			Some(build("(s)", vec![Arg::Str("hi")])),
			None,
			None,
		)
		.await
		.unwrap();
	assert_eq!(reply.child_value(0).as_str(), "You greeted me with 'hi'. Thanks!");

	let error = client
		.invoke_method(
			Some(&server_name),
			TEST_PATH,
			Some(TEST_INTERFACE),
			"HelloWorld",
			Some(build("(s)", vec![Arg::Str("Return Registered")])),
			None,
			None,
		)
		.await
		.unwrap_err();
	assert!(matches!(error, Error::MatchRuleNotFound(_)), "got {error:?}");
}

struct PeerObject;

impl ObjectHandler for PeerObject {
	fn method_call(&self, _connection: &Connection, args: Value, invocation: MethodInvocation) {
		let greeting = args.child_value(0).as_str().to_owned();
		let response = format!("You greeted me with '{greeting}'.");
		invocation.return_value(Some(build("(s)", vec![Arg::Str(&response)])));
	}

	fn get_property(
		&self,
		_connection: &Connection,
		_sender: Option<&str>,
		property: &str,
	) -> Result<Value, Error> {
		match property {
			"PeerProperty" => Ok(Value::new_string("ThePropertyValue")),
			_ => Err(Error::InvalidArgs(format!("no property {property:?}"))),
		}
	}
}

fn peer_interface() -> InterfaceInfo {
	InterfaceInfo {
		name: TEST_INTERFACE.to_owned(),
		methods: vec![MethodInfo {
			name: "HelloPeer".to_owned(),
			in_args: vec![minibus_bus::ArgInfo::new(Some("greeting"), "s")],
			out_args: vec![minibus_bus::ArgInfo::new(Some("response"), "s")],
			annotations: Vec::new(),
		}],
		signals: Vec::new(),
		properties: vec![PropertyInfo {
			name: "PeerProperty".to_owned(),
			signature: "s".to_owned(),
			access: PropertyAccess::Read,
			annotations: Vec::new(),
		}],
		annotations: Vec::new(),
	}
}

// Scenario: peer-to-peer without a bus daemon.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_to_peer() {
	let dir = tempfile::tempdir().unwrap();
	let address = format!("unix:path={}", dir.path().join("peer.sock").display());
	let server = Server::bind(&address).await.unwrap();

	let accept = tokio::spawn(async move {
		let connection = server.accept().await.unwrap();
		connection
			.register_object(TEST_PATH, peer_interface(), Arc::new(PeerObject))
			.unwrap();
		connection
	});

	let client = Connection::for_address(&address, false).await.unwrap();
	let served = accept.await.unwrap();

	// Property read through org.freedesktop.DBus.Properties.
	let reply = client
		.invoke_method(
			None,
			TEST_PATH,
			Some("org.freedesktop.DBus.Properties"),
			"Get",
			Some(build(
				"(ss)",
				vec![Arg::Str(TEST_INTERFACE), Arg::Str("PeerProperty")],
			)),
			None,
			None,
		)
		.await
		.unwrap();
	let boxed = reply.child_value(0);
	assert_eq!(boxed.child_value(0).as_str(), "ThePropertyValue");

	let reply = client
		.invoke_method(
			None,
			TEST_PATH,
			Some(TEST_INTERFACE),
			"HelloPeer",
			Some(build("(s)", vec![Arg::Str("Hey Peer!")])),
			None,
			None,
		)
		.await
		.unwrap();
	assert_eq!(reply.child_value(0).as_str(), "You greeted me with 'Hey Peer!'.");

	// Server-side disconnect surfaces on the client.
	let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
	client.on_closed(Arc::new(move |_, _| {
		let _ = closed_tx.send(());
	}));
	served.disconnect();
	recv(&mut closed_rx).await;
	assert!(!client.is_open());
}

// Scenario: cross-thread delivery on the registering context.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_thread_delivery() {
	let bus = TestBus::start().await;
	let emitter = Connection::for_address(bus.address(), true).await.unwrap();

	let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<()>();
	let (done_tx, mut done_rx) = mpsc::unbounded_channel::<bool>();

	let mut workers = Vec::new();
	for _ in 0..2 {
		let address = bus.address().to_owned();
		let ready = ready_tx.clone();
		let done = done_tx.clone();
		workers.push(std::thread::spawn(move || {
			let runtime = tokio::runtime::Builder::new_current_thread()
				.enable_all()
				.build()
				.unwrap();
			let worker_thread = std::thread::current().id();
			runtime.block_on(async move {
				let connection = Connection::for_address(&address, true).await.unwrap();
				let (event_tx, mut event_rx) = mpsc::unbounded_channel();
				connection.signal_subscribe(
					None,
					Some("org.example.Spread"),
					Some("Fanout"),
					None,
					None,
					Arc::new(move |_, _| {
						let _ = event_tx.send(std::thread::current().id());
					}),
				);
				let _ = ready.send(());
				let delivered_on = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
					.await
					.expect("signal not delivered")
					.expect("event channel closed");
				let _ = done.send(delivered_on == worker_thread);
			});
		}));
	}

	recv(&mut ready_rx).await;
	recv(&mut ready_rx).await;
	emitter
		.emit_signal(None, "/spread", "org.example.Spread", "Fanout", None)
		.await
		.unwrap();

	assert!(recv(&mut done_rx).await, "callback ran off its registering thread");
	assert!(recv(&mut done_rx).await, "callback ran off its registering thread");
	for worker in workers {
		worker.join().unwrap();
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial(bus_env)]
async fn reconnect_preserves_subscriptions() {
	let bus = TestBus::start().await;
	// Safety: test-only environment mutation; the System variable is
	// owned by this test alone.
	unsafe { std::env::set_var("DBUS_SYSTEM_BUS_ADDRESS", bus.address()) };

	let subscriber = Connection::bus_get(BusType::System).await.unwrap();
	let emitter = Connection::for_address(bus.address(), true).await.unwrap();
	let emitter_name = emitter.unique_name().unwrap();

	let (any_tx, mut any_rx) = mpsc::unbounded_channel();
	subscriber.signal_subscribe(
		None,
		Some("org.example.Re"),
		Some("Tick"),
		None,
		None,
		Arc::new(move |_, _| {
			let _ = any_tx.send(());
		}),
	);
	let (from_tx, mut from_rx) = mpsc::unbounded_channel();
	subscriber.signal_subscribe(
		Some(&emitter_name),
		Some("org.example.Re"),
		Some("Tick"),
		None,
		None,
		Arc::new(move |_, _| {
			let _ = from_tx.send(());
		}),
	);

	emitter.emit_signal(None, "/re", "org.example.Re", "Tick", None).await.unwrap();
	recv(&mut any_rx).await;
	recv(&mut from_rx).await;

	let old_unique = subscriber.unique_name().unwrap();

	// Drop the subscriber's transport bus-side.
	let _ = subscriber
		.invoke_method(
			Some("org.freedesktop.DBus"),
			"/org/freedesktop/DBus",
			Some("org.freedesktop.DBus"),
			"KickMe",
			None,
			Some(Duration::from_secs(2)),
			None,
		)
		.await;
	wait_until(|| !subscriber.is_open()).await;

	// The next send transparently reconnects.
	subscriber
		.invoke_method(
			Some("org.freedesktop.DBus"),
			"/org/freedesktop/DBus",
			Some("org.freedesktop.DBus"),
			"GetId",
			None,
			None,
			None,
		)
		.await
		.unwrap();
	assert!(subscriber.is_open());
	assert_ne!(subscriber.unique_name().unwrap(), old_unique);

	emitter.emit_signal(None, "/re", "org.example.Re", "Tick", None).await.unwrap();
	recv(&mut any_rx).await;
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert!(
		from_rx.try_recv().is_err(),
		"unique-sender subscriptions must be orphaned by a reconnect"
	);
}

struct Recording {
	calls: Arc<StdMutex<Vec<String>>>,
}

impl ObjectHandler for Recording {
	fn method_call(&self, _connection: &Connection, _args: Value, invocation: MethodInvocation) {
		self.calls.lock().unwrap().push(invocation.method().to_owned());
		invocation.return_value(None);
	}
}

fn recording_interface() -> InterfaceInfo {
	InterfaceInfo {
		name: TEST_INTERFACE.to_owned(),
		methods: vec![
			MethodInfo {
				name: "Probe".to_owned(),
				in_args: Vec::new(),
				out_args: Vec::new(),
				annotations: Vec::new(),
			},
			MethodInfo {
				name: "Never".to_owned(),
				in_args: Vec::new(),
				out_args: Vec::new(),
				annotations: Vec::new(),
			},
		],
		signals: Vec::new(),
		properties: Vec::new(),
		annotations: Vec::new(),
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pre_tripped_cancel_never_reaches_the_wire() {
	let dir = tempfile::tempdir().unwrap();
	let address = format!("unix:path={}", dir.path().join("cancel.sock").display());
	let server = Server::bind(&address).await.unwrap();
	let calls = Arc::new(StdMutex::new(Vec::new()));

	let handler_calls = calls.clone();
	let accept = tokio::spawn(async move {
		let connection = server.accept().await.unwrap();
		connection
			.register_object(
				TEST_PATH,
				recording_interface(),
				Arc::new(Recording { calls: handler_calls }),
			)
			.unwrap();
		connection
	});

	let client = Connection::for_address(&address, false).await.unwrap();
	let _served = accept.await.unwrap();

	let cancel = CancellationToken::new();
	cancel.cancel();
	let error = client
		.invoke_method(None, TEST_PATH, Some(TEST_INTERFACE), "Never", None, None, Some(&cancel))
		.await
		.unwrap_err();
	assert_eq!(error, Error::Cancelled);

	// A later call goes through; the cancelled one never did.
	client
		.invoke_method(None, TEST_PATH, Some(TEST_INTERFACE), "Probe", None, None, None)
		.await
		.unwrap();
	assert_eq!(*calls.lock().unwrap(), vec!["Probe".to_owned()]);
}

struct Parking {
	parked: Arc<StdMutex<Vec<MethodInvocation>>>,
}

impl ObjectHandler for Parking {
	fn method_call(&self, _connection: &Connection, _args: Value, invocation: MethodInvocation) {
		// Keeping the invocation alive withholds the reply.
		self.parked.lock().unwrap().push(invocation);
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_and_in_flight_cancellation() {
	let dir = tempfile::tempdir().unwrap();
	let address = format!("unix:path={}", dir.path().join("stall.sock").display());
	let server = Server::bind(&address).await.unwrap();
	let parked = Arc::new(StdMutex::new(Vec::new()));

	let handler_parked = parked.clone();
	let accept = tokio::spawn(async move {
		let connection = server.accept().await.unwrap();
		connection
			.register_object(
				TEST_PATH,
				recording_interface(),
				Arc::new(Parking { parked: handler_parked }),
			)
			.unwrap();
		connection
	});

	let client = Connection::for_address(&address, false).await.unwrap();
	let _served = accept.await.unwrap();

	let error = client
		.invoke_method(
			None,
			TEST_PATH,
			Some(TEST_INTERFACE),
			"Probe",
			None,
			Some(Duration::from_millis(200)),
			None,
		)
		.await
		.unwrap_err();
	assert_eq!(error, Error::TimedOut);

	let cancel = CancellationToken::new();
	let call = client.invoke_method(
		None,
		TEST_PATH,
		Some(TEST_INTERFACE),
		"Probe",
		None,
		None,
		Some(&cancel),
	);
	let cancel_after = async {
		tokio::time::sleep(Duration::from_millis(100)).await;
		cancel.cancel();
	};
	let (result, ()) = tokio::join!(call, cancel_after);
	assert_eq!(result.unwrap_err(), Error::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_private_connection_stays_closed() {
	let bus = TestBus::start().await;
	let connection = Connection::for_address(bus.address(), true).await.unwrap();
	connection.disconnect();
	let error = connection
		.invoke_method(
			Some("org.freedesktop.DBus"),
			"/org/freedesktop/DBus",
			Some("org.freedesktop.DBus"),
			"GetId",
			None,
			None,
			None,
		)
		.await
		.unwrap_err();
	assert_eq!(error, Error::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn owner_singleton_is_shared_per_connection_and_name() {
	let bus = TestBus::start().await;
	let connection = Connection::for_address(bus.address(), true).await.unwrap();

	let first = NameOwner::get(&connection, "org.example.Single", OwnerFlags::empty());
	let second = NameOwner::get(&connection, "org.example.Single", OwnerFlags::empty());
	assert_eq!(first.name(), second.name());
	wait_until(|| first.is_initialized()).await;
	assert!(second.is_initialized(), "singletons share state");
	wait_until(|| first.owns_name()).await;
	assert!(second.owns_name());
}

struct Directory;

impl minibus_bus::SubtreeHandler for Directory {
	fn enumerate(&self, _connection: &Connection, _sender: Option<&str>) -> Vec<String> {
		vec!["alpha".to_owned(), "beta".to_owned()]
	}

	fn introspect(
		&self,
		_connection: &Connection,
		_sender: Option<&str>,
		node: Option<&str>,
	) -> Vec<InterfaceInfo> {
		match node {
			None => Vec::new(),
			Some(_) => vec![greeter_interface()],
		}
	}

	fn dispatch(
		&self,
		_connection: &Connection,
		_sender: Option<&str>,
		node: Option<&str>,
		interface: &str,
	) -> Option<Arc<dyn ObjectHandler>> {
		(node.is_some() && interface == TEST_INTERFACE)
			.then(|| Arc::new(Greeter) as Arc<dyn ObjectHandler>)
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subtree_dispatch_and_introspection() {
	let bus = TestBus::start().await;
	let server = Connection::for_address(bus.address(), true).await.unwrap();
	let client = Connection::for_address(bus.address(), true).await.unwrap();

	server.register_subtree("/org/example/Dir", Arc::new(Directory), true).unwrap();
	let server_name = server.unique_name().unwrap();

	// A method call on a dynamically-served child node.
	let reply = client
		.invoke_method(
			Some(&server_name),
			"/org/example/Dir/alpha",
			Some(TEST_INTERFACE),
			"HelloWorld",
			Some(build("(s)", vec![Arg::Str("sub")])),
			None,
			None,
		)
		.await
		.unwrap();
	assert_eq!(reply.child_value(0).as_str(), "You greeted me with 'sub'. Thanks!");

	// The subtree root lists its children in the introspection document.
	let reply = client
		.invoke_method(
			Some(&server_name),
			"/org/example/Dir",
			Some("org.freedesktop.DBus.Introspectable"),
			"Introspect",
			None,
			None,
			None,
		)
		.await
		.unwrap();
	let xml = reply.child_value(0).as_str().to_owned();
	assert!(xml.contains("<node name=\"alpha\"/>"), "{xml}");
	assert!(xml.contains("<node name=\"beta\"/>"), "{xml}");

	// An unclaimed interface on a child node is an unknown method.
	let error = client
		.invoke_method(
			Some(&server_name),
			"/org/example/Dir/alpha",
			Some("org.example.Other"),
			"HelloWorld",
			Some(build("(s)", vec![Arg::Str("x")])),
			None,
			None,
		)
		.await
		.unwrap_err();
	assert!(matches!(error, Error::UnknownMethod(_)), "got {error:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registered_objects_introspect() {
	let bus = TestBus::start().await;
	let server = Connection::for_address(bus.address(), true).await.unwrap();
	let client = Connection::for_address(bus.address(), true).await.unwrap();

	server.register_object(TEST_PATH, greeter_interface(), Arc::new(Greeter)).unwrap();
	// Re-registering the same (path, interface) pair is refused.
	let error = server
		.register_object(TEST_PATH, greeter_interface(), Arc::new(Greeter))
		.unwrap_err();
	assert!(matches!(error, Error::ObjectPathInUse(_)));

	let server_name = server.unique_name().unwrap();
	let reply = client
		.invoke_method(
			Some(&server_name),
			TEST_PATH,
			Some("org.freedesktop.DBus.Introspectable"),
			"Introspect",
			None,
			None,
			None,
		)
		.await
		.unwrap();
	let xml = reply.child_value(0).as_str().to_owned();
	assert!(xml.contains("<interface name=\"org.gtk.GDBus.TestInterface\">"), "{xml}");
	assert!(xml.contains("<method name=\"HelloWorld\">"), "{xml}");
}
