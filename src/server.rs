//! The chat server: room registry, access tokens and periodic cleanup.

use crate::conn::Connection;
use crate::error::ChatError;
use crate::message::MessageEncoder;
use crate::room::Room;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::time;
use tracing::{debug, error, info};

/// For how long a freshly minted token exists before being used or
/// expiring.
const DEF_TOKEN_DEADLINE: Duration = Duration::from_secs(30);

/// Delay between executions of the expired-token sweep.
const DEF_TOKEN_CLEANUP_DELAY: Duration = Duration::from_secs(5 * 60);

/// For how long a room may stay without activity before probing its
/// members (and closing, if empty).
const DEF_ROOM_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Delay between executions of the closed-room sweep.
const DEF_ROOM_CLEANUP_DELAY: Duration = Duration::from_secs(30 * 60);

/// Parameters used to configure a [`ChatServer`].
///
/// `ServerConfig::default()` fills every field with a sensible non-zero
/// value; the `with_*` setters adjust individual fields.
#[derive(Clone)]
pub struct ServerConfig {
  /// Advisory size for the read buffer on new connections. The core
  /// never reads it; it is forwarded verbatim for transport adapters.
  pub read_buf: usize,

  /// Advisory size for the write buffer on new connections.
  pub write_buf: usize,

  /// For how long a given token exists before being used or expiring.
  pub token_deadline: Duration,

  /// Delay between executions of the expired-token sweep.
  pub token_cleanup_delay: Duration,

  /// For how long a room may stay idle (without any activity). After
  /// this timeout the room probes every member, and closes itself if
  /// none is connected.
  pub room_idle_timeout: Duration,

  /// Delay between executions of the closed-room sweep.
  pub room_cleanup_delay: Duration,

  /// Optionally processes and encodes messages received by this
  /// server's rooms.
  pub encoder: Option<Arc<dyn MessageEncoder>>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      read_buf: 1024,
      write_buf: 1024,
      token_deadline: DEF_TOKEN_DEADLINE,
      token_cleanup_delay: DEF_TOKEN_CLEANUP_DELAY,
      room_idle_timeout: DEF_ROOM_IDLE_TIMEOUT,
      room_cleanup_delay: DEF_ROOM_CLEANUP_DELAY,
      encoder: None,
    }
  }
}

impl ServerConfig {
  /// Set the advisory transport buffer sizes.
  pub fn with_buffers(mut self, read_buf: usize, write_buf: usize) -> Self {
    self.read_buf = read_buf;
    self.write_buf = write_buf;
    self
  }

  /// Set the lifetime of freshly minted tokens.
  pub fn with_token_deadline(mut self, deadline: Duration) -> Self {
    self.token_deadline = deadline;
    self
  }

  /// Set the cadence of the expired-token sweep.
  pub fn with_token_cleanup_delay(mut self, delay: Duration) -> Self {
    self.token_cleanup_delay = delay;
    self
  }

  /// Set the idle period after which rooms probe their members.
  pub fn with_room_idle_timeout(mut self, timeout: Duration) -> Self {
    self.room_idle_timeout = timeout;
    self
  }

  /// Set the cadence of the closed-room sweep.
  pub fn with_room_cleanup_delay(mut self, delay: Duration) -> Self {
    self.room_cleanup_delay = delay;
    self
  }

  /// Install a message encoder on every room of this server.
  pub fn with_encoder(mut self, encoder: Arc<dyn MessageEncoder>) -> Self {
    self.encoder = Some(encoder);
    self
  }
}

/// Ephemeral access token bound to an authenticated user.
struct AccessToken {
  /// The username for whom the token was generated.
  username: String,

  /// The room this token gives access to.
  room: String,

  /// Expiration time for this token.
  deadline: Instant,
}

/// The chat server.
///
/// A `ChatServer` by itself doesn't move any message; it manages
/// [`Room`]s and connection tokens. Constructing one spawns a cleanup
/// task that periodically releases expired tokens and evicts closed
/// rooms; [`ChatServer::close`] stops it again.
///
/// The server is cheap to clone; clones share all state.
pub struct ChatServer {
  config: ServerConfig,

  /// Rooms currently active on this server.
  rooms: Arc<Mutex<HashMap<String, Arc<Room>>>>,

  /// Every currently active token, keyed by the token itself. Guarded
  /// by its own mutex, never held together with the rooms mutex.
  tokens: Arc<Mutex<HashMap<String, AccessToken>>>,

  /// Cleared exactly once, on the first `close()`.
  running: Arc<AtomicBool>,

  /// Stops the cleanup task.
  stop: Arc<Notify>,
}

impl ChatServer {
  /// Create a new chat server and start its cleanup task.
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(config: ServerConfig) -> Self {
    let server = Self {
      config,
      rooms: Arc::new(Mutex::new(HashMap::new())),
      tokens: Arc::new(Mutex::new(HashMap::new())),
      running: Arc::new(AtomicBool::new(true)),
      stop: Arc::new(Notify::new()),
    };

    debug!("starting a new chat server");
    tokio::spawn(Self::cleanup(
      server.tokens.clone(),
      server.rooms.clone(),
      server.stop.clone(),
      server.config.token_cleanup_delay,
      server.config.room_cleanup_delay,
    ));

    server
  }

  /// The server's configuration.
  pub fn config(&self) -> &ServerConfig {
    &self.config
  }

  /// Generate a token temporarily allowing the user identified by
  /// `username` to connect to `room`.
  ///
  /// The token must be requested over an authenticated and secure
  /// channel; the broker itself never inspects credentials. The
  /// returned value may then be redeemed once in [`ChatServer::connect`]
  /// to identify both the user and the desired room.
  ///
  /// The room's existence is not checked here but on `connect`. This
  /// only fails if the cryptographic source fails.
  pub async fn request_token(&self, username: &str, room: &str) -> Result<String, ChatError> {
    let mut raw = [0u8; 32];
    OsRng.try_fill_bytes(&mut raw).map_err(|err| {
      error!(room = %room, user = %username, %err, "failed to generate a connection token");
      ChatError::TokenGeneration(err)
    })?;

    let token = hex::encode(raw);
    let value = AccessToken {
      username: username.to_owned(),
      room: room.to_owned(),
      deadline: Instant::now() + self.config.token_deadline,
    };

    self.tokens.lock().await.insert(token.clone(), value);
    debug!(room = %room, user = %username, "connection token generated");

    Ok(token)
  }

  /// Create and start the room named `name`.
  ///
  /// Rooms are uniquely identified by their names. The server
  /// automatically evicts a closed room, whether it was closed manually
  /// or timed out while empty.
  pub async fn create_room(&self, name: &str) -> Result<(), ChatError> {
    let mut rooms = self.rooms.lock().await;

    if rooms.contains_key(name) {
      error!(room = %name, "tried to create a room with a duplicated name");
      return Err(ChatError::DuplicateRoom);
    }

    rooms.insert(name.to_owned(), Room::spawn(name.to_owned(), &self.config));
    info!(room = %name, "room created");

    Ok(())
  }

  /// Retrieve the room named `name`.
  pub async fn get_room(&self, name: &str) -> Result<Arc<Room>, ChatError> {
    match self.rooms.lock().await.get(name) {
      Some(room) => Ok(room.clone()),
      None => {
        error!(room = %name, "tried to retrieve a nonexistent room");
        Err(ChatError::InvalidRoom)
      }
    }
  }

  /// A snapshot of the names of every registered room.
  pub async fn room_names(&self) -> Vec<String> {
    self.rooms.lock().await.keys().cloned().collect()
  }

  /// Consume `token`, removing it from the server, and return the
  /// associated username and room name.
  ///
  /// Expiry is deliberately not re-checked here: evicting expired
  /// entries is the cleanup task's job, and a consumption racing that
  /// sweep is acceptable. Either way a token is redeemed at most once.
  async fn consume_token(&self, token: &str) -> Result<(String, String), ChatError> {
    let entry = self.tokens.lock().await.remove(token);

    match entry {
      Some(value) => {
        debug!(room = %value.room, user = %value.username, "token consumed");
        Ok((value.username, value.room))
      }
      None => {
        error!("token not found");
        Err(ChatError::InvalidToken)
      }
    }
  }

  /// Connect a user to the room previously bound to `token`, using
  /// `conn` to communicate with them. The user's reader runs on its own
  /// task and this returns promptly.
  ///
  /// The token is consumed even on failure and must then be
  /// re-generated; `conn` is left untouched and remains the caller's to
  /// close.
  pub async fn connect(&self, token: &str, conn: Arc<dyn Connection>) -> Result<(), ChatError> {
    let (username, room_name) = self.consume_token(token).await?;
    let room = self.get_room(&room_name).await?;

    room.admit(&username, conn).await
  }

  /// Connect a user to the room previously bound to `token`, handling
  /// their messages on the calling task until the connection closes.
  ///
  /// Useful when the embedding front-end already runs one task per
  /// incoming connection. Same failure semantics as
  /// [`ChatServer::connect`].
  pub async fn connect_and_wait(
    &self,
    token: &str,
    conn: Arc<dyn Connection>,
  ) -> Result<(), ChatError> {
    let (username, room_name) = self.consume_token(token).await?;
    let room = self.get_room(&room_name).await?;

    room.admit_and_wait(&username, conn).await
  }

  /// Release every resource used by the chat server: the cleanup task
  /// is stopped and every room is closed and unregistered.
  ///
  /// Safe to call multiple times; only the first call does any work.
  pub async fn close(&self) -> Result<(), ChatError> {
    if self
      .running
      .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      debug!("closing the chat server");
      self.stop.notify_one();

      let rooms: Vec<Arc<Room>> = self.rooms.lock().await.drain().map(|(_, r)| r).collect();
      for room in rooms {
        let _ = room.close().await;
      }
    }

    Ok(())
  }

  /// Periodically release expired tokens and evict closed rooms, until
  /// the server gets closed.
  async fn cleanup(
    tokens: Arc<Mutex<HashMap<String, AccessToken>>>,
    rooms: Arc<Mutex<HashMap<String, Arc<Room>>>>,
    stop: Arc<Notify>,
    token_delay: Duration,
    room_delay: Duration,
  ) {
    let start = time::Instant::now();
    let mut token_tick = time::interval_at(start + token_delay, token_delay);
    let mut room_tick = time::interval_at(start + room_delay, room_delay);

    loop {
      tokio::select! {
        _ = token_tick.tick() => {
          debug!("removing expired tokens");

          let now = Instant::now();
          tokens.lock().await.retain(|_, value| value.deadline > now);
        }
        _ = room_tick.tick() => {
          debug!("removing closed rooms");

          rooms.lock().await.retain(|_, room| !room.is_closed());
        }
        _ = stop.notified() => {
          debug!("stopping the cleanup task");
          return;
        }
      }
    }
  }
}

impl Default for ChatServer {
  /// A server with the default configuration. Like [`ChatServer::new`],
  /// must be called from within a tokio runtime.
  fn default() -> Self {
    Self::new(ServerConfig::default())
  }
}

impl Clone for ChatServer {
  fn clone(&self) -> Self {
    Self {
      config: self.config.clone(),
      rooms: self.rooms.clone(),
      tokens: self.tokens.clone(),
      running: self.running.clone(),
      stop: self.stop.clone(),
    }
  }
}
