//! One connected participant of a room.

use crate::conn::Connection;
use crate::error::ChatError;
use crate::room::Room;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// A user connected to a room.
///
/// The user owns its [`Connection`] and is responsible for closing it on
/// teardown. It only holds a weak back-reference to its room: the room
/// owns its users, never the other way around.
pub struct User {
  name: String,

  /// The room this user is connected to.
  room: Weak<Room>,

  /// The connection to the user's remote endpoint.
  conn: Arc<dyn Connection>,

  /// Cleared exactly once, on the first `close()`.
  running: AtomicBool,
}

impl User {
  pub(crate) fn new(name: String, room: Weak<Room>, conn: Arc<dyn Connection>) -> Arc<User> {
    Arc::new(User {
      name,
      room,
      conn,
      running: AtomicBool::new(true),
    })
  }

  /// The user's name.
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  /// Forward one formatted message to the user's connection.
  pub async fn send(&self, text: &str) -> Result<(), ChatError> {
    self.conn.send(text).await
  }

  /// Close the user's connection.
  ///
  /// Safe to call multiple times, and from multiple tasks; only the
  /// first call closes the underlying connection.
  pub async fn close(&self) -> Result<(), ChatError> {
    if self
      .running
      .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      debug!(user = %self.name, "closing connection");
      self.conn.close().await?;
    }

    Ok(())
  }

  /// Wait for messages from the remote endpoint and forward them to the
  /// room as broadcasts, until the connection or the user is closed.
  pub(crate) async fn run(&self) {
    while self.is_running() {
      match self.conn.recv().await {
        Ok(text) => {
          let Some(room) = self.room.upgrade() else {
            break;
          };
          room.broadcast(&text, &self.name).await;
        }
        Err(ChatError::ConnEof) => {
          debug!(user = %self.name, "connection reached end of stream");
          break;
        }
        Err(err) => {
          warn!(user = %self.name, %err, "failed to receive a message");
          break;
        }
      }
    }

    let _ = self.close().await;
  }

  /// Run the reader loop on the caller's task, returning once the
  /// connection gets closed. The user is closed when this returns.
  ///
  /// Useful when the embedding server already runs one task per incoming
  /// connection and spawning a second one per user would be wasteful.
  pub async fn run_and_wait(&self) {
    self.run().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::conn::LocalConn;

  #[tokio::test]
  async fn close_is_idempotent_and_closes_the_conn() {
    let (server_side, client) = LocalConn::pair();
    let user = User::new("alice".into(), Weak::new(), Arc::new(server_side));

    assert!(user.is_running());
    user.close().await.unwrap();
    user.close().await.unwrap();

    assert!(!user.is_running());
    assert!(client.is_closed());
  }

  #[tokio::test]
  async fn send_passes_through_to_the_conn() {
    let (server_side, client) = LocalConn::pair();
    let user = User::new("alice".into(), Weak::new(), Arc::new(server_side));

    user.send("formatted line").await.unwrap();
    assert_eq!(client.recv().await.unwrap(), "formatted line");
  }

  #[tokio::test]
  async fn reader_exits_when_the_room_is_gone() {
    let (server_side, client) = LocalConn::pair();
    let user = User::new("alice".into(), Weak::new(), Arc::new(server_side));

    client.send("orphan message").await.unwrap();
    user.run_and_wait().await;

    assert!(!user.is_running());
    assert!(client.is_closed());
  }
}
