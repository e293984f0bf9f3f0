//! The cross-node exchange: envelope codec, attachment staging, channel
//! routing with failover, and the inbound protocol dispatcher.

pub mod codec;
pub mod dispatch;
pub mod files;
pub mod router;
