//! Multiplexed, heartbeat-monitored connections for taskline.
//!
//! A [`Connection`] owns one duplex byte stream (TLS, TCP or an in-process
//! loopback) and carves any number of logical [`Channel`]s out of it using a
//! small binary [`Frame`] envelope. [`MessageChannel`] layers self-describing,
//! tag-dispatched messages on top of a channel.

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod message;
pub mod net;
pub mod tls;

pub use channel::Channel;
pub use config::LinkConfig;
pub use connection::{Connection, ConnectionState, Role};
pub use error::LinkError;
pub use frame::{Frame, FrameType, HEADER_SIZE, MAX_FRAME_SIZE};
pub use message::{Envelope, MessageChannel, MessageRegistry, WireMessage};
pub use net::{Acceptor, Connector, LoopbackListener, LoopbackNetwork, TlsConnector, TlsListener};
pub use tls::{ClientValidation, Thumbprint, TlsServerIdentity};
