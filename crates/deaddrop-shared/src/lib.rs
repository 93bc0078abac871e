//! Shared protocol surface for deaddrop.
//!
//! Everything that crosses the wire between a client and the relay server
//! lives here: identifier newtypes, the message model, and the event-channel
//! envelopes. The server crate depends on this; a future native client can
//! reuse it unchanged.

pub mod constants;
pub mod protocol;
pub mod types;
