//! Framed message streams over Unix and TCP sockets.
//!
//! A transport is a connected byte stream speaking whole [`Message`]
//! frames. Authentication and transport negotiation are out of scope;
//! peers speak messages directly.

use std::io::{Error as IoError, ErrorKind};
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::address::{Address, AddressEntry};
use crate::message::{Message, MAX_MESSAGE_SIZE};

/// Reading half of a transport.
pub type TransportReader = Pin<Box<dyn AsyncRead + Send>>;
/// Writing half of a transport.
pub type TransportWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A connected stream carrying D-Bus messages.
pub struct Transport {
	reader: TransportReader,
	writer: TransportWriter,
	/// The entry that produced this transport.
	peer: String,
}

impl std::fmt::Debug for Transport {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Transport").field("peer", &self.peer).finish_non_exhaustive()
	}
}

impl Transport {
	fn from_unix(stream: UnixStream, peer: String) -> Transport {
		let (reader, writer) = stream.into_split();
		Transport {
			reader: Box::pin(reader),
			writer: Box::pin(writer),
			peer,
		}
	}

	fn from_tcp(stream: TcpStream, peer: String) -> Transport {
		let (reader, writer) = stream.into_split();
		Transport {
			reader: Box::pin(reader),
			writer: Box::pin(writer),
			peer,
		}
	}

	/// Connects to the first usable entry of `address`.
	pub async fn connect(address: &Address) -> std::io::Result<Transport> {
		let mut last_error = None;
		for entry in address.entries() {
			match Transport::connect_entry(entry).await {
				Ok(transport) => {
					tracing::debug!(peer = %entry, "transport connected");
					return Ok(transport);
				}
				Err(e) => {
					tracing::debug!(peer = %entry, error = %e, "transport entry failed");
					last_error = Some(e);
				}
			}
		}
		Err(last_error.unwrap_or_else(|| IoError::new(ErrorKind::InvalidInput, "empty address")))
	}

	async fn connect_entry(entry: &AddressEntry) -> std::io::Result<Transport> {
		match entry {
			AddressEntry::Unix { path: Some(path), .. } => {
				let stream = UnixStream::connect(path).await?;
				Ok(Transport::from_unix(stream, entry.to_string()))
			}
			AddressEntry::Unix { abstract_name: Some(_), .. } => Err(IoError::new(
				ErrorKind::Unsupported,
				"abstract unix sockets are not supported on this platform",
			)),
			AddressEntry::Unix { .. } => {
				Err(IoError::new(ErrorKind::InvalidInput, "unix entry without a path"))
			}
			AddressEntry::Tcp { host, port } => {
				let stream = TcpStream::connect((host.as_str(), *port)).await?;
				Ok(Transport::from_tcp(stream, entry.to_string()))
			}
		}
	}

	/// Splits into independently-owned halves.
	#[must_use]
	pub fn into_split(self) -> (TransportReader, TransportWriter) {
		(self.reader, self.writer)
	}

	/// Reads one whole message frame.
	///
	/// Returns `Ok(None)` on clean end-of-stream at a frame boundary.
	pub async fn read_message(&mut self) -> std::io::Result<Option<Message>> {
		read_message(&mut self.reader).await
	}

	/// Writes one whole message frame.
	pub async fn write_message(&mut self, message: &Message) -> std::io::Result<()> {
		write_message(&mut self.writer, message).await
	}
}

/// Reads one message frame from `input`; `Ok(None)` on clean EOF.
pub async fn read_message(
	input: &mut (impl AsyncRead + Unpin + Send + ?Sized),
) -> std::io::Result<Option<Message>> {
	let mut preamble = [0u8; 16];
	match input.read_exact(&mut preamble).await {
		Ok(_) => {}
		Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(e),
	}
	let total = Message::frame_len(&preamble)
		.map_err(|e| IoError::new(ErrorKind::InvalidData, e.to_string()))?;
	let mut frame = vec![0u8; total];
	frame[..16].copy_from_slice(&preamble);
	input.read_exact(&mut frame[16..]).await?;
	Message::from_bytes(&frame)
		.map(Some)
		.map_err(|e| IoError::new(ErrorKind::InvalidData, e.to_string()))
}

/// Writes one message frame to `output` and flushes.
pub async fn write_message(
	output: &mut (impl AsyncWrite + Unpin + Send + ?Sized),
	message: &Message,
) -> std::io::Result<()> {
	let bytes = message.to_bytes();
	if bytes.len() > MAX_MESSAGE_SIZE {
		return Err(IoError::new(
			ErrorKind::InvalidData,
			format!("message too large: {} bytes", bytes.len()),
		));
	}
	output.write_all(&bytes).await?;
	output.flush().await
}

/// A bound listener producing transports from incoming connections.
pub enum Listener {
	Unix(UnixListener),
	Tcp(TcpListener),
}

impl Listener {
	/// Binds to the first usable entry of `address`.
	pub async fn bind(address: &Address) -> std::io::Result<Listener> {
		let mut last_error = None;
		for entry in address.entries() {
			match Listener::bind_entry(entry).await {
				Ok(listener) => {
					tracing::info!(address = %entry, "listening");
					return Ok(listener);
				}
				Err(e) => last_error = Some(e),
			}
		}
		Err(last_error.unwrap_or_else(|| IoError::new(ErrorKind::InvalidInput, "empty address")))
	}

	async fn bind_entry(entry: &AddressEntry) -> std::io::Result<Listener> {
		match entry {
			AddressEntry::Unix { path: Some(path), .. } => {
				// Stale socket files from a previous run are removed.
				if tokio::fs::metadata(path).await.is_ok() {
					tokio::fs::remove_file(path).await?;
				}
				Ok(Listener::Unix(UnixListener::bind(path)?))
			}
			AddressEntry::Unix { .. } => Err(IoError::new(
				ErrorKind::Unsupported,
				"abstract unix sockets are not supported on this platform",
			)),
			AddressEntry::Tcp { host, port } => {
				let listener = std::net::TcpListener::bind((host.as_str(), *port))?;
				listener.set_nonblocking(true)?;
				Ok(Listener::Tcp(TcpListener::from_std(listener)?))
			}
		}
	}

	/// Accepts the next incoming connection.
	pub async fn accept(&self) -> std::io::Result<Transport> {
		match self {
			Listener::Unix(listener) => {
				let (stream, _) = listener.accept().await?;
				Ok(Transport::from_unix(stream, "unix:peer".to_owned()))
			}
			Listener::Tcp(listener) => {
				let (stream, addr) = listener.accept().await?;
				Ok(Transport::from_tcp(stream, format!("tcp:{addr}")))
			}
		}
	}
}
