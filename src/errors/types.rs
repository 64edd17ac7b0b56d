//! Error type definitions for the live-room proxy
//!
//! This module defines all error types used throughout the application,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.

use thiserror::Error;

/// Errors produced while talking to an upstream streaming platform.
///
/// `RoomOffline` is a sentinel: callers compare against it to short-circuit
/// retry loops, so it must stay a dedicated variant rather than a message.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The upstream explicitly reports the room as not live
    #[error("room is offline")]
    RoomOffline,

    /// Upstream answered with a non-success HTTP status
    #[error("upstream returned status {0}")]
    Status(u16),

    /// Transport-level failure
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed response body or missing expected field
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The user-supplied room identifier cannot be resolved
    #[error("invalid room identifier: {input}")]
    InvalidRoom { input: String },

    /// Unknown platform tag at manager construction
    #[error("unknown platform: {0}")]
    InvalidPlatform(String),

    /// The surrounding operation was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

impl StreamError {
    pub fn parse<M: Into<String>>(message: M) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn invalid_room<I: Into<String>>(input: I) -> Self {
        Self::InvalidRoom {
            input: input.into(),
        }
    }

    /// True when retrying cannot help because the room is simply not live.
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::RoomOffline)
    }
}

/// Errors from resolving a proxied client path against the current stream URL
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("unsupported file type: {filename}")]
    UnsupportedType { filename: String },

    /// No stream URL has been acquired yet (pre-first-refresh)
    #[error("no upstream stream URL available")]
    EmptyStream,

    #[error("malformed stream URL: {0}")]
    BadUrl(#[from] url::ParseError),
}

/// Errors from the recording subsystem
#[derive(Error, Debug)]
pub enum RecorderError {
    /// Watchdog: no bytes from the muxer subprocess for longer than the
    /// stall threshold
    #[error("stream stalled for {0} seconds")]
    Stalled(u64),

    /// Every CDN line failed in quick succession
    #[error("all stream lines failed")]
    AllLinesFailed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("filename pattern error: {message}")]
    Pattern { message: String },

    #[error("muxer exited: {message}")]
    Muxer { message: String },
}

impl RecorderError {
    pub fn pattern<M: Into<String>>(message: M) -> Self {
        Self::Pattern {
            message: message.into(),
        }
    }

    pub fn muxer<M: Into<String>>(message: M) -> Self {
        Self::Muxer {
            message: message.into(),
        }
    }
}

/// Top-level application error type
///
/// Wraps the subsystem errors for the web layer, which maps variants onto
/// HTTP status codes in `web::responses`.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn validation<M: Into<String>>(message: M) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn configuration<M: Into<String>>(message: M) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal<M: Into<String>>(message: M) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
