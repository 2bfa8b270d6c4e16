//! Async client for Asterisk Manager Interface (AMI) style servers.
//!
//! The manager protocol is line-oriented text: each frame is a block of
//! `Key: Value` lines terminated by one blank line, and the server greets
//! with a single banner line before the first frame. Clients send *actions*,
//! the server answers with *responses* correlated by `ActionID`, and pushes
//! unsolicited *events* at any time, interleaved with responses.
//!
//! This crate owns the session on top of any ordered byte stream the caller
//! connects: banner handshake, plain or MD5-challenge login, concurrent
//! action publishing with per-`ActionID` correlation, and independent
//! subscriber streams that observe every incoming frame in arrival order.
//!
//! # Usage
//!
//! ```ignore
//! use ami_client::{AmiClient, AmiMessage, AuthMode};
//! use tokio::net::TcpStream;
//!
//! let transport = TcpStream::connect("127.0.0.1:5038").await?;
//! let client = AmiClient::connect(transport).await?;
//!
//! if !client.login("admin", "secret", AuthMode::Md5Challenge).await? {
//!     return Err("login rejected".into());
//! }
//!
//! let mut events = client.subscribe();
//! let pong = client.publish(AmiMessage::action("Ping")).await?;
//! println!("ping -> {:?}", pong.get("Ping"));
//!
//! while let Some(message) = events.recv().await {
//!     println!("{message}");
//! }
//!
//! client.logoff().await?;
//! ```

// Library modules
pub mod client;
pub mod codec;
pub mod error;
pub mod message;
mod pending;
pub mod session;
pub mod stream;

// Re-export commonly used types
pub use client::{AmiClient, AuthMode, ClientOptions};
pub use error::{AmiError, AmiResult};
pub use message::{AmiMessage, Classification};
pub use session::SessionState;
pub use stream::{AmiEventStream, WireEvent, WireTap};
