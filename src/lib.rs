pub mod chat;
pub mod config;
pub mod editor;
pub mod events;
pub mod format;
pub mod hook_api;
pub mod process;
pub mod registry;
pub mod relay;
pub mod remote_control;
pub mod session;
pub mod stream;
pub mod telegram;
pub mod transcript;
