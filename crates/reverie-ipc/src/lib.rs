//! Bidirectional request/response protocol between the controller and
//! its worker process.
//!
//! Messages are JSON arrays framed one per line over any ordered duplex
//! byte transport. On top of that framing this crate implements:
//!
//! - named calls with unique ids, out-of-band progress notifications,
//!   and exactly one result per call ([`IpcChannel::call`]);
//! - a responder registry mapping operation names to handlers, with
//!   fast failure for unregistered names ([`IpcChannel::respond_to`]);
//! - fire-and-forget named events in both directions
//!   ([`IpcChannel::emit`] / [`IpcChannel::subscribe`]);
//! - serialized error propagation preserving code/message/details/stack
//!   across the process boundary, with pass-through for non-error
//!   rejection values ([`RemoteError`], [`CallFailure`]).

pub mod channel;
pub mod error;
pub mod message;
pub mod registry;

pub use channel::{CallHandle, IpcChannel, IpcEvent};
pub use error::{CallFailure, IpcError, RemoteError};
pub use message::Message;
pub use registry::{Responder, ResponderContext, ResponderRegistry};
