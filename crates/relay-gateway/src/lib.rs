pub mod config;
pub mod events;
pub mod log_rules;
pub mod log_watcher;
pub mod permission;
pub mod stream_parser;
pub mod thought_stream;

pub use events::EventBus;
pub use log_watcher::{LogWatchEvent, LogWatcher};
pub use permission::{InteractionError, PermissionRequestHandler};
pub use stream_parser::{StreamError, StreamEvent, StreamParser};
pub use thought_stream::ThoughtStreamHandler;
