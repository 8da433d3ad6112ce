pub mod actions;
pub mod cli;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod locks;
pub mod logging;
pub mod matcher;
pub mod router;
pub mod store;
