//! Channel adapters: direct (email, Telegram) and semi-automated (browser).

pub mod adapter;
pub mod browser;
pub mod email;
pub mod telegram;

pub use adapter::{AdapterRegistry, ChannelAdapter, Cleared, SendOutcome};
pub use browser::BrowserSendAdapter;
pub use email::{EmailAdapter, EmailConfig};
pub use telegram::TelegramAdapter;
