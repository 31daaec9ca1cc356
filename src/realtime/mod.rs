//! Realtime cache invalidation over a WebSocket

pub mod channel;
pub mod invalidation;
pub mod message;

pub use channel::{
    classify_close, ChannelStatus, CloseKind, Generation, RealtimeChannel, RealtimeConfig, Ticket,
};
pub use invalidation::InvalidationOutcome;
pub use message::{Invalidation, RealtimeEvent};
