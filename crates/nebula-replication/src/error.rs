//! Error type for replication processing.

use nebula_net::{ActorId, CodecError};

/// Errors produced while processing one actor or one inbound message.
///
/// None of these escape a tick: the managers log them and move on to the
/// next actor or message.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The message refers to an actor this side does not know.
    #[error("unknown actor {0}")]
    UnknownActor(ActorId),

    /// A field failed validation (non-finite float, negative health, ...).
    #[error("malformed {field} for {actor}")]
    Malformed {
        /// Actor the field belongs to.
        actor: ActorId,
        /// Which field.
        field: &'static str,
    },

    /// A model, preset, buff or controller could not be resolved.
    #[error("could not resolve {what} for {actor}")]
    Resolution {
        /// Actor being resolved.
        actor: ActorId,
        /// What was missing.
        what: String,
    },

    /// An asynchronous proxy spawn completed after its actor was torn down
    /// or reset.
    #[error("stale spawn ticket for {actor} (epoch {epoch})")]
    StaleTicket {
        /// Actor the ticket was issued for.
        actor: ActorId,
        /// Epoch the ticket carried.
        epoch: u32,
    },

    /// The payload did not decode.
    #[error(transparent)]
    Codec(#[from] CodecError),
}
