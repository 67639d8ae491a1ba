//! Peer-to-peer server: connections without a bus daemon.

use std::sync::Arc;

use minibus_wire::{Address, Listener};

use crate::connection::Connection;
use crate::error::Error;

/// Callback invoked for each accepted peer connection.
pub type NewConnectionCallback = Arc<dyn Fn(Connection) + Send + Sync>;

/// A listener producing peer-to-peer [`Connection`]s.
///
/// Clients connect with [`Connection::for_address`] (with `message_bus`
/// false); no daemon is involved, so there are no unique names and no
/// match rules on the wire.
pub struct Server {
	listener: Listener,
	address: String,
}

impl Server {
	/// Binds to the first usable entry of `address`
	/// (e.g. `unix:path=/tmp/peer.sock`).
	pub async fn bind(address: &str) -> Result<Server, Error> {
		let parsed = Address::parse(address)
			.map_err(|e| Error::BadAddress(e.to_string()))?;
		let listener = Listener::bind(&parsed).await.map_err(|e| {
			if e.kind() == std::io::ErrorKind::AddrInUse {
				Error::AddressInUse
			} else {
				Error::Failed(format!("cannot listen on {address}: {e}"))
			}
		})?;
		Ok(Server {
			listener,
			address: address.to_owned(),
		})
	}

	/// The address clients should connect to.
	#[must_use]
	pub fn client_address(&self) -> &str {
		&self.address
	}

	/// Accepts the next client as an already-open connection.
	pub async fn accept(&self) -> Result<Connection, Error> {
		let transport = self
			.listener
			.accept()
			.await
			.map_err(|e| Error::Failed(format!("accept failed: {e}")))?;
		tracing::debug!(address = %self.address, "peer connection accepted");
		Ok(Connection::from_transport(transport))
	}

	/// Accepts clients forever, handing each connection to `callback`.
	pub async fn run(&self, callback: NewConnectionCallback) -> Result<(), Error> {
		loop {
			let connection = self.accept().await?;
			callback(connection);
		}
	}
}
