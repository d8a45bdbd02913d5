//! VibeMQ Client - Asynchronous MQTT v3.1.1 client library
//!
//! A tokio-based MQTT client with full QoS 0/1/2 delivery tracking,
//! pluggable persistence for exactly-once semantics across restarts,
//! automatic reconnect with exponential backoff, and offline publish
//! buffering.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vibemq_client::{AsyncClient, ConnectOptions, MemoryPersistence, Message, QoS};
//!
//! # async fn run() -> Result<(), vibemq_client::ClientError> {
//! let client = AsyncClient::new(
//!     "tcp://localhost:1883",
//!     "sensor-01",
//!     Arc::new(MemoryPersistence::new()),
//! )
//! .await?;
//!
//! client.connect(ConnectOptions::default()).await?;
//! client
//!     .subscribe_with(
//!         "commands/#",
//!         QoS::AtLeastOnce,
//!         Arc::new(|message| println!("command: {:?}", message.payload())),
//!     )
//!     .await?
//!     .wait()
//!     .await?;
//!
//! let token = client
//!     .publish(Message::new("sensors/temp", "21.5", QoS::AtLeastOnce))
//!     .await?;
//! token.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod options;
pub mod persistence;
pub mod protocol;
pub mod token;
pub mod topic;
pub mod transport;

pub use client::{AsyncClient, ConnectionState, EventHandler, MessageHandler};
pub use error::{ClientError, ErrorKind};
pub use message::Message;
pub use options::{BufferOptions, ConnectOptions, WillOptions};
pub use persistence::{ClientPersistence, FjallPersistence, MemoryPersistence};
pub use protocol::QoS;
pub use token::{ActionListener, OperationKind, Token};
pub use transport::{Endpoint, TcpTransport, Transport, TransportStream};
