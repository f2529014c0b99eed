//! A small typed error envelope shared across the sync engine.
//!
//! Every fallible operation that crosses a subsystem boundary (planning,
//! validation, authorisation, storage, transport) returns `anyhow::Error`
//! with an [`ErrorMetadata`] attached via `.context(...)`, so callers can
//! recover a classifiable [`ErrorCode`] without parsing message text.

use std::borrow::Cow;

/// Tag attached to an `anyhow::Error` chain to classify it for callers that
/// need to branch on error *kind* rather than message (the session loop
/// deciding whether to send `REJECT`, the connection manager deciding
/// whether to reconnect).
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// short ScreamingCamelCase tag, stable for tests and logging.
    pub short_msg: Cow<'static, str>,
    /// human readable, developer facing message.
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed request: unknown resource/relation, include cycle,
    /// malformed `where`, payload carrying `id`. Never retried.
    Planning,
    /// Payload shape/type mismatch against the declared schema.
    Validation,
    /// A route guard (`preMutation`/`postMutation`/`read`) rejected the
    /// request.
    Unauthorized,
    /// The resource or row does not exist.
    NotFound,
    /// The storage backend failed; rolled back on the server.
    Storage,
    /// The connection/transport failed or was closed.
    Transport,
    /// An internal invariant was violated.
    Internal,
}

impl ErrorMetadata {
    pub fn planning(short_msg: impl Into<Cow<'static, str>>, msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Planning,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn validation(short_msg: impl Into<Cow<'static, str>>, msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Validation,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn unauthorized(short_msg: impl Into<Cow<'static, str>>, msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Unauthorized,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn not_found(short_msg: impl Into<Cow<'static, str>>, msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn storage(short_msg: impl Into<Cow<'static, str>>, msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Storage,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn transport(short_msg: impl Into<Cow<'static, str>>, msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Transport,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Internal,
            short_msg: Cow::Borrowed("InternalError"),
            msg: msg.into(),
        }
    }

    /// Recover an `ErrorMetadata` from an `anyhow::Error` chain, the way
    /// callers branch on error kind without string matching.
    pub fn find(err: &anyhow::Error) -> Option<&ErrorMetadata> {
        err.chain().find_map(|cause| cause.downcast_ref::<ErrorMetadata>())
    }

    pub fn code_of(err: &anyhow::Error) -> ErrorCode {
        Self::find(err).map(|e| e.code).unwrap_or(ErrorCode::Internal)
    }
}
