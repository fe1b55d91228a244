use thiserror::Error;

/// Error kinds surfaced across the crate's boundary.
///
/// Operational errors are returned to the caller; failures scoped to a
/// single member (a failed send, a read hitting EOF) are recovered
/// internally by removing that member and never surface here.
#[derive(Debug, Error)]
pub enum ChatError {
  /// The token doesn't exist, has already been used or has expired.
  #[error("invalid token")]
  InvalidToken,

  /// The room did not receive any connection in a timely manner.
  #[error("room did not receive any connections in a timely manner")]
  IdleRoom,

  /// There's already another room with the requested name.
  #[error("there's already another room with the requested name")]
  DuplicateRoom,

  /// The room doesn't exist or has already been closed and evicted.
  #[error("invalid room")]
  InvalidRoom,

  /// The room was closed before the operation completed.
  #[error("the room was closed before the operation completed")]
  RoomClosed,

  /// The requesting user is already connected to the room.
  #[error("the requesting user is already connected to the room")]
  UserAlreadyConnected,

  /// The connection was closed.
  #[error("the connection was closed")]
  ConnEof,

  /// The named user isn't a member of the room.
  #[error("invalid user")]
  InvalidUser,

  /// The cryptographic source failed while minting a token.
  #[error("failed to generate a connection token: {0}")]
  TokenGeneration(#[from] rand::Error),

  /// A transport adapter failed for a reason other than end-of-stream.
  #[error("transport error: {0}")]
  Transport(String),
}
