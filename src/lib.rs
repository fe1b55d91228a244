//! Connection-agnostic, multi-room chat broker with ephemeral access
//! tokens.
//!
//! The broker is split into three components:
//!
//! - [`ChatServer`]: registry of rooms and single-use connection tokens
//! - [`Room`]: one chat room, fanning every message out to its members
//! - [`Connection`]: the transport seam, implemented by the embedder
//!
//! Internally there's a fourth component, the [`User`], which binds a
//! `Connection` to a username unique within its room.
//!
//! The server implements no authentication: the embedding application
//! decides who may join which room under which name, and seals that
//! decision into a short-lived token. Redeeming the token admits the
//! user; the token cannot be redeemed twice.
//!
//! ```no_run
//! use std::sync::Arc;
//! use babbler::{ChatServer, LocalConn, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), babbler::ChatError> {
//!     let server = ChatServer::new(ServerConfig::default());
//!     server.create_room("lobby").await?;
//!
//!     // XXX: authenticate the user somehow, then bind them to the room.
//!     let token = server.request_token("alice", "lobby").await?;
//!
//!     // Hand the broker whatever transport reached the client; here,
//!     // the in-process pair.
//!     let (near, _far) = LocalConn::pair();
//!     server.connect(&token, Arc::new(near)).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! From that point onward the user's messages are read off the
//! connection and broadcast to every member of the room, the sender
//! included. Rooms left without members past their idle timeout close
//! themselves, and closed rooms are evicted by the server's cleanup
//! task.

pub mod conn;
pub mod error;
pub mod message;
pub mod room;
pub mod server;
pub mod user;

pub use conn::{Connection, LocalConn};
pub use error::ChatError;
pub use message::{Message, MessageEncoder};
pub use room::Room;
pub use server::{ChatServer, ServerConfig};
pub use user::User;
