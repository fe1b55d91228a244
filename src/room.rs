//! Room management and the per-room fan-out engine.

use crate::conn::Connection;
use crate::error::ChatError;
use crate::message::Message;
use crate::server::ServerConfig;
use crate::user::User;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, error, info};

/// How many accepted-but-undispatched messages a room buffers. Once the
/// backlog is full, producers block on enqueue rather than buffer without
/// bound.
const MSG_BACKLOG: usize = 8;

/// A chat room users may connect to.
///
/// Each room runs a single dispatcher task that serializes everything:
/// draining the inbound queue, fanning messages out to members, probing
/// liveness on the idle timer, and closing the room once it winds up
/// empty. Members whose connection fails a delivery are dropped on the
/// spot.
pub struct Room {
  name: String,

  /// Weak handle to this room, passed to users as their back-reference.
  this: Weak<Room>,

  /// Optionally encodes/processes messages. If not set,
  /// [`Message::render`] is used instead.
  encoder: Option<Arc<dyn crate::message::MessageEncoder>>,

  /// Producer half of the inbound queue drained by the dispatcher.
  inbound: mpsc::Sender<Message>,

  /// Users currently active in this room, keyed by username.
  members: Mutex<HashMap<String, Arc<User>>>,

  /// Every broadcast accepted by this room. The dispatcher is the only
  /// writer; whispers and encoder-suppressed messages are not recorded.
  log: StdMutex<Vec<Message>>,

  /// Period without activity after which members get probed.
  idle_timeout: Duration,

  /// Set exactly once, on the first `close()`.
  closed: AtomicBool,

  /// Wakes the dispatcher when the room is closed from outside it.
  stop: Notify,
}

impl std::fmt::Debug for Room {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Room")
      .field("name", &self.name)
      .field("closed", &self.closed.load(Ordering::Acquire))
      .finish_non_exhaustive()
  }
}

impl Room {
  /// Create a room named `name` and start its dispatcher task.
  pub(crate) fn spawn(name: String, conf: &ServerConfig) -> Arc<Room> {
    let (inbound, backlog) = mpsc::channel(MSG_BACKLOG);

    let room = Arc::new_cyclic(|this| Room {
      name,
      this: this.clone(),
      encoder: conf.encoder.clone(),
      inbound,
      members: Mutex::new(HashMap::new()),
      log: StdMutex::new(Vec::new()),
      idle_timeout: conf.room_idle_timeout,
      closed: AtomicBool::new(false),
      stop: Notify::new(),
    });

    tokio::spawn(Room::run(room.clone(), backlog));

    room
  }

  /// The room's name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Check if the room is closed.
  ///
  /// The room reports itself as closed as soon as `close()` was first
  /// called, regardless of whether its dispatcher has finished.
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Append the names of the currently connected users to `dst`, in no
  /// particular order.
  pub async fn list_users(&self, dst: &mut Vec<String>) {
    let members = self.members.lock().await;
    dst.extend(members.keys().cloned());
  }

  /// A snapshot of every broadcast accepted by this room so far.
  pub fn history(&self) -> Vec<Message> {
    self.log.lock().expect("room log lock poisoned").clone()
  }

  /// Queue a broadcast from a specific sender.
  pub async fn broadcast(&self, text: &str, from: &str) {
    self
      .enqueue(Message::new(text.to_owned(), Some(from.to_owned()), None))
      .await;
  }

  /// Queue a broadcast without a sender.
  pub async fn system_broadcast(&self, text: &str) {
    self.enqueue(Message::new(text.to_owned(), None, None)).await;
  }

  /// Queue a message without a sender to a single receiver. Whispers are
  /// delivered to `to` alone and never appended to the room's log.
  pub async fn whisper(&self, text: &str, to: &str) {
    self
      .enqueue(Message::new(text.to_owned(), None, Some(to.to_owned())))
      .await;
  }

  /// Non-blocking [`Room::whisper`], for synchronous contexts such as a
  /// [`MessageEncoder`](crate::message::MessageEncoder) replying to a
  /// command. Dropped if the room is closed or its backlog is full.
  pub fn try_whisper(&self, text: &str, to: &str) {
    self.try_enqueue(Message::new(text.to_owned(), None, Some(to.to_owned())));
  }

  /// Queue `msg`, blocking while the backlog is full. A closed room
  /// accepts nothing; the message is silently dropped.
  async fn enqueue(&self, msg: Message) {
    if self.is_closed() {
      debug!(room = %self.name, "dropping message for a closed room");
      return;
    }

    let _ = self.inbound.send(msg).await;
  }

  /// Queue `msg` if the room is open and the backlog has space. Used
  /// where blocking could wedge the dispatcher against its own queue.
  fn try_enqueue(&self, msg: Message) {
    if self.is_closed() {
      return;
    }

    if self.inbound.try_send(msg).is_err() {
      debug!(room = %self.name, "backlog full, dropping message");
    }
  }

  /// Add a new user to the room and spawn a task reading its messages.
  ///
  /// It's entirely up to the caller to have initialized the connection,
  /// for example upgrading an HTTP request to a WebSocket before
  /// wrapping it. On error the connection is left untouched and remains
  /// the caller's to close.
  pub async fn admit(&self, username: &str, conn: Arc<dyn Connection>) -> Result<(), ChatError> {
    let user = self.register(username, conn).await?;
    tokio::spawn(async move { user.run().await });

    Ok(())
  }

  /// Add a new user to the room and handle its messages on the calling
  /// task, returning only once the connection gets closed.
  ///
  /// Same admission semantics as [`Room::admit`]; useful when the
  /// embedding server already runs one task per connection.
  pub async fn admit_and_wait(
    &self,
    username: &str,
    conn: Arc<dyn Connection>,
  ) -> Result<(), ChatError> {
    let user = self.register(username, conn).await?;
    user.run_and_wait().await;

    Ok(())
  }

  /// Insert the user into the member map and announce them. First
  /// admission wins; a concurrent duplicate is rejected untouched.
  async fn register(&self, username: &str, conn: Arc<dyn Connection>) -> Result<Arc<User>, ChatError> {
    let user = User::new(username.to_owned(), self.this.clone(), conn);

    {
      let mut members = self.members.lock().await;

      // Checked under the members lock so admission can't slip in
      // behind a concurrent close() draining the map.
      if self.is_closed() {
        return Err(ChatError::RoomClosed);
      }

      if members.contains_key(username) {
        error!(room = %self.name, user = %username, "user tried to connect more than once");
        return Err(ChatError::UserAlreadyConnected);
      }

      members.insert(username.to_owned(), user.clone());
    }

    self
      .system_broadcast(&format!("{username} entered {}!", self.name))
      .await;

    Ok(user)
  }

  /// Remove the user `username` from this room, closing its connection
  /// and announcing the departure.
  pub async fn remove_user(&self, username: &str) -> Result<(), ChatError> {
    let user = self.members.lock().await.remove(username);

    match user {
      Some(user) => {
        let _ = user.close().await;
        debug!(room = %self.name, user = %username, "user removed");

        // Enqueued after the members lock is released: with a full
        // backlog this blocks until the dispatcher drains, and the
        // dispatcher may be waiting on that same lock.
        self
          .system_broadcast(&format!("{username} exited {}...", self.name))
          .await;
        Ok(())
      }
      None => {
        error!(room = %self.name, user = %username, "couldn't remove the user");
        Err(ChatError::InvalidUser)
      }
    }
  }

  /// Close the room: remove every user and stop the dispatcher.
  ///
  /// Safe to call multiple times; only the first call does any work.
  pub async fn close(&self) -> Result<(), ChatError> {
    if self
      .closed
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      debug!(room = %self.name, "closing room");
      self.stop.notify_one();

      let mut members = self.members.lock().await;
      for (_, user) in members.drain() {
        let _ = user.close().await;
      }
    }

    Ok(())
  }

  /// The dispatcher: drains the inbound queue, probes members when the
  /// room has been idle, and exits once the room is closed.
  async fn run(self: Arc<Room>, mut backlog: mpsc::Receiver<Message>) {
    let idle = time::sleep(self.idle_timeout);
    tokio::pin!(idle);

    loop {
      tokio::select! {
        _ = self.stop.notified() => {
          // close() is a no-op if the notifying call already won.
          let _ = self.close().await;
          return;
        }
        _ = &mut idle => {
          self.check_connections().await;
          if self.is_closed() {
            return;
          }
        }
        msg = backlog.recv() => {
          match msg {
            Some(msg) => self.dispatch(msg).await,
            None => {
              let _ = self.close().await;
              return;
            }
          }
        }
      }

      // Any activity delays the next liveness probe.
      idle.as_mut().reset(Instant::now() + self.idle_timeout);
    }
  }

  /// Encode one accepted message and deliver it to its recipients.
  async fn dispatch(&self, msg: Message) {
    let rendered = match &self.encoder {
      Some(encoder) => encoder.encode(
        self,
        msg.date,
        &msg.text,
        msg.from.as_deref(),
        msg.to.as_deref(),
      ),
      None => msg.render(),
    };

    // The encoder cancels delivery by returning the empty string, e.g.
    // after processing a command. Suppressed messages stay out of the
    // log as well.
    if rendered.is_empty() {
      debug!(room = %self.name, "message was filtered out");
      return;
    }

    let to = msg.to.clone();
    if to.is_none() {
      self.log.lock().expect("room log lock poisoned").push(msg);
    }

    let mut members = self.members.lock().await;
    match to.as_deref() {
      Some(to) => match members.get(to).cloned() {
        Some(user) => self.deliver(&mut members, &user, &rendered).await,
        None => debug!(room = %self.name, user = %to, "whisper to an absent user"),
      },
      None => {
        // Snapshot the member list: delivery failures mutate the map
        // mid-iteration.
        let targets: Vec<Arc<User>> = members.values().cloned().collect();
        for user in targets {
          self.deliver(&mut members, &user, &rendered).await;
        }
      }
    }
  }

  /// Send `text` to `user`, dropping the member from the room if the
  /// delivery fails. The caller holds the members lock.
  async fn deliver(&self, members: &mut HashMap<String, Arc<User>>, user: &Arc<User>, text: &str) {
    let err = match user.send(text).await {
      Ok(()) => return,
      Err(err) => err,
    };

    match err {
      ChatError::ConnEof => {
        debug!(room = %self.name, user = %user.name(), "connection to user was closed");
      }
      err => {
        error!(room = %self.name, user = %user.name(), %err, "couldn't send a message to the user");
      }
    }

    let _ = user.close().await;
    if members.remove(user.name()).is_some() {
      // try_enqueue: the dispatcher can't block on its own backlog.
      self.try_enqueue(Message::new(
        format!("{} exited {}...", user.name(), self.name),
        None,
        None,
      ));
    }
  }

  /// The liveness sweep: probe every member with an empty message to
  /// weed out dead connections, and close the room if nobody is left.
  async fn check_connections(&self) {
    debug!(room = %self.name, "idle timeout, checking connectivity");

    let mut members = self.members.lock().await;
    let targets: Vec<Arc<User>> = members.values().cloned().collect();
    for user in targets {
      self.deliver(&mut members, &user, "").await;
    }
    let empty = members.is_empty();
    drop(members);

    // close() takes the members lock again, so it must run after the
    // sweep released it.
    if empty {
      info!(room = %self.name, "closing inactive room");
      let _ = self.close().await;
    }
  }
}
