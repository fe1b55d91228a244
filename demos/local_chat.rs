//! In-process chat demo: two users exchanging messages in one room over
//! [`LocalConn`] pairs, no network involved.
//!
//! Run with `cargo run --example local_chat`.

use babbler::{ChatServer, Connection, LocalConn, ServerConfig};
use std::sync::Arc;
use std::time::Duration;

/// Authenticate (trivially, this is a demo), mint a token and connect.
/// The far endpoint of the pair plays the remote client.
async fn join(server: &ChatServer, username: &str) -> Result<Arc<LocalConn>, babbler::ChatError> {
  let token = server.request_token(username, "lobby").await?;
  let (near, far) = LocalConn::pair();
  server.connect(&token, Arc::new(near)).await?;

  Ok(Arc::new(far))
}

#[tokio::main]
async fn main() -> Result<(), babbler::ChatError> {
  tracing_subscriber::fmt()
    .with_env_filter("local_chat=info,babbler=debug")
    .init();

  let server = ChatServer::new(ServerConfig::default());
  server.create_room("lobby").await?;

  let alice = join(&server, "alice").await?;
  let bob = join(&server, "bob").await?;

  // Print everything each client receives, heartbeats excluded.
  for (name, conn) in [("alice", alice.clone()), ("bob", bob.clone())] {
    tokio::spawn(async move {
      while let Ok(msg) = conn.recv().await {
        if !msg.is_empty() {
          println!("[{name}] {msg}");
        }
      }
    });
  }

  alice.send("hey bob!").await?;
  bob.send("hey! all quiet in here").await?;
  alice.send("just the way I like it").await?;

  // Let the room drain before tearing everything down.
  tokio::time::sleep(Duration::from_millis(100)).await;
  server.close().await?;

  Ok(())
}
