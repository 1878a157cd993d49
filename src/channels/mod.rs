//! Channel adapters: the bridge between the bus and a human-facing chat.
//!
//! `format` and `stream` hold the adapter-independent pieces (markup
//! conversion, think-block stripping, per-task stream reassembly);
//! `telegram` is the shipped adapter.

pub mod format;
pub mod stream;
pub mod telegram;

pub use stream::{StreamAction, StreamAssembler};
pub use telegram::TelegramAdapter;
