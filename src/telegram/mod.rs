pub mod api;
pub mod commands;
pub mod format;
pub mod notifier;
pub mod polling;

pub use api::{BotApi, TelegramApi};
pub use commands::TelegramCommandHandler;
pub use notifier::TelegramNotifier;
pub use polling::TelegramPolling;
