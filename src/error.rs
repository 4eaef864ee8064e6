//! Error taxonomy for the virtual consumer engine.
//!
//! Four families, matching the behavior a caller actually needs to react to:
//! protocol misuse by the caller (fatal to the instance), transient I/O
//! against the log or persistence layer, retry-policy-terminal outcomes
//! (never surfaced as `Err`, only counted), and unknown in-flight ids
//! (logged and discarded, never surfaced).

use thiserror::Error;

use crate::message::MessageId;

/// Errors that can escape a [`crate::virtual_consumer::VirtualConsumer`] call.
///
/// `PolicyTerminal` and `UnknownId` outcomes described in the design are
/// handled internally and never constructed as this type; they exist here
/// only as documentation of the taxonomy referenced elsewhere.
#[derive(Error, Debug)]
pub enum Error {
    /// Caller violated the lifecycle or call contract: double `open`, a call
    /// to `next_tuple`/`ack`/`fail` outside `Running`/`Completing`, or
    /// completion detected with a partition missing from the ending bound.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// The ack/fail id did not correspond to a `MessageId` this instance
    /// produced.
    #[error("invalid message id: {0:?}")]
    IllegalArgument(MessageId),

    /// I/O against the log or the persistence adapter failed after any
    /// retries internal to that collaborator were exhausted.
    #[error("transient I/O failure: {0}")]
    TransientIo(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
