//! Terminal front end: settings, persisted services and an interactive chat loop.

pub mod repl;
pub mod services;
pub mod settings;
