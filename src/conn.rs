//! The transport seam between the broker and the embedding application.
//!
//! The broker never opens sockets itself. Whatever carries bytes to the
//! remote client (a WebSocket, a TCP stream, an in-process channel) is
//! wrapped by the embedder into a [`Connection`] and handed over during
//! admission; from then on the broker owns it and closes it when the user
//! is torn down.
//!
//! [`LocalConn`] is the in-process implementation: a pair of endpoints
//! joined by crossed channels, suitable for tests, benchmarks and
//! single-process embeddings that don't need a network at all.
//!
//! ## Example Usage
//! ```
//! use babbler::{Connection, LocalConn};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (a, b) = LocalConn::pair();
//!
//!     a.send("hello").await.unwrap();
//!     assert_eq!(b.recv().await.unwrap(), "hello");
//!
//!     b.close().await.unwrap();
//!     assert!(a.send("gone").await.is_err());
//! }
//! ```

use crate::error::ChatError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

/// A generic, bidirectional message stream to one remote client.
///
/// Implementations wrap whatever framing the transport needs; the broker
/// only ever exchanges whole text messages.
///
/// Note that the broker sends an **empty string** as a liveness probe
/// during a room's idle sweep. Adapters are expected to treat it as a
/// no-op or pong-like frame rather than deliver it to the client.
#[async_trait]
pub trait Connection: Send + Sync {
  /// Send a single message, previously formatted by the broker.
  async fn send(&self, text: &str) -> Result<(), ChatError>;

  /// Block until one message arrives.
  ///
  /// Returns [`ChatError::ConnEof`] on clean or abrupt end of stream.
  async fn recv(&self) -> Result<String, ChatError>;

  /// Close the connection. Safe to call multiple times.
  async fn close(&self) -> Result<(), ChatError>;
}

/// Default per-endpoint buffer of a [`LocalConn`] pair.
const DEF_BUFFER: usize = 64;

/// One endpoint of an in-process connection pair.
///
/// The two endpoints returned by [`LocalConn::pair`] are symmetric:
/// whatever one side `send`s, the other side `recv`s. Closing either
/// endpoint closes the pair, waking any `recv` blocked on the other side
/// with [`ChatError::ConnEof`].
pub struct LocalConn {
  /// Messages towards the peer endpoint.
  tx: mpsc::Sender<String>,

  /// Messages from the peer endpoint.
  rx: Mutex<mpsc::Receiver<String>>,

  /// Close flag shared by both endpoints.
  closed: Arc<watch::Sender<bool>>,
}

impl LocalConn {
  /// Create a connected pair of endpoints with the default buffer.
  pub fn pair() -> (LocalConn, LocalConn) {
    Self::pair_with_buffer(DEF_BUFFER)
  }

  /// Create a connected pair of endpoints buffering up to `buffer`
  /// messages in each direction. Minimum size is 1.
  pub fn pair_with_buffer(buffer: usize) -> (LocalConn, LocalConn) {
    let buffer = buffer.max(1);
    let (a_tx, b_rx) = mpsc::channel(buffer);
    let (b_tx, a_rx) = mpsc::channel(buffer);
    let (closed, _) = watch::channel(false);
    let closed = Arc::new(closed);

    let a = LocalConn {
      tx: a_tx,
      rx: Mutex::new(a_rx),
      closed: closed.clone(),
    };
    let b = LocalConn {
      tx: b_tx,
      rx: Mutex::new(b_rx),
      closed,
    };
    (a, b)
  }

  /// Whether either endpoint has closed the pair.
  pub fn is_closed(&self) -> bool {
    *self.closed.borrow()
  }
}

#[async_trait]
impl Connection for LocalConn {
  async fn send(&self, text: &str) -> Result<(), ChatError> {
    let mut closed = self.closed.subscribe();
    if *closed.borrow_and_update() {
      return Err(ChatError::ConnEof);
    }

    // A send blocked on a full buffer must still notice the pair
    // closing underneath it.
    tokio::select! {
      res = self.tx.send(text.to_owned()) => res.map_err(|_| ChatError::ConnEof),
      _ = closed.changed() => Err(ChatError::ConnEof),
    }
  }

  async fn recv(&self) -> Result<String, ChatError> {
    let mut rx = self.rx.lock().await;

    let mut closed = self.closed.subscribe();
    if *closed.borrow_and_update() {
      return Err(ChatError::ConnEof);
    }

    tokio::select! {
      msg = rx.recv() => msg.ok_or(ChatError::ConnEof),
      _ = closed.changed() => Err(ChatError::ConnEof),
    }
  }

  async fn close(&self) -> Result<(), ChatError> {
    self.closed.send_replace(true);
    Ok(())
  }
}
