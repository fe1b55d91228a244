//! Message metadata and the pluggable rendering policy.

use crate::room::Room;
use chrono::{DateTime, Local};
use serde::Serialize;

/// A message accepted by a room, alongside its metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
  /// Server-local wall-clock time at which the room accepted the message.
  pub date: DateTime<Local>,

  /// The message body.
  pub text: String,

  /// The sender's username. `None` for system messages.
  pub from: Option<String>,

  /// The recipient of a whisper. `None` for broadcasts; whispers are
  /// never appended to the room log nor serialized.
  #[serde(skip)]
  pub to: Option<String>,
}

impl Message {
  /// Stamp a new message with the current wall-clock time.
  pub(crate) fn new(text: String, from: Option<String>, to: Option<String>) -> Self {
    Self {
      date: Local::now(),
      text,
      from,
      to,
    }
  }

  /// Render the message with the default format:
  /// `"YYYY-MM-DD - HH:MM:SS (±ZZZZ) > from: text"`, the `"from: "`
  /// prefix omitted for system messages.
  pub fn render(&self) -> String {
    let t = self.date.format("%Y-%m-%d - %H:%M:%S (%z)");
    match self.from.as_deref() {
      Some(from) => format!("{t} > {from}: {}", self.text),
      None => format!("{t} > {}", self.text),
    }
  }
}

/// Encodes a message into the string that a room will deliver.
///
/// Installing an encoder on the server replaces the default rendering
/// ([`Message::render`]) for every room.
pub trait MessageEncoder: Send + Sync {
  /// Encode the described message into the string to deliver.
  ///
  /// Returning the empty string cancels delivery entirely, which is the
  /// supported mechanism for command handling: inspect `text`, act on
  /// the `room` handle (e.g. reply to the sender alone with
  /// [`Room::try_whisper`]) and return `""` to stay silent.
  ///
  /// `from` is set by the room based on the connection that produced
  /// the message. As long as users are authenticated before their
  /// connection token is minted, it is safe to authorize commands on it.
  fn encode(
    &self,
    room: &Room,
    date: DateTime<Local>,
    text: &str,
    from: Option<&str>,
    to: Option<&str>,
  ) -> String;
}
