//! Real-time delivery over Server-Sent Events.
//!
//! A handler opens a stream with [`Conn::from_context`] and keeps the request
//! alive (typically by awaiting [`Conn::done`]) while other code pushes events
//! through clones of the handle.

pub mod sse;

pub use sse::{Conn, DEFAULT_EVENT, Event, SseConfig, SseError, encode_frame};
