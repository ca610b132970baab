//! loopcast library crate.
//!
//! Loops one video file to a live RTMP endpoint through a supervised ffmpeg
//! process. [`controller::SessionController`] is the entry point; the binary
//! in `main.rs` is a thin console front end over it.

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod handoff;
pub mod logging;
pub mod media;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod utils;

pub use config::AppConfig;
pub use controller::SessionController;
pub use error::{Error, Result};
pub use events::SessionEvent;
