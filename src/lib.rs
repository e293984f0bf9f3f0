pub mod classifier;
pub mod commands;
pub mod config;
pub mod exchange;
pub mod maintenance;
pub mod pipeline;
pub mod platform;
pub mod risk;
pub mod rules;
pub mod state;
pub mod storage;
pub mod tasks;

pub use classifier::{Classifier, EmojiKind};
pub use config::{Config, GroupConfig};
pub use exchange::codec::{Envelope, Payload};
pub use exchange::dispatch::ProtocolDispatcher;
pub use exchange::router::{ChannelRouter, Delivery, Transport};
pub use pipeline::{DetectionPipeline, InboundMessage};
pub use state::{Shared, State};
