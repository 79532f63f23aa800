//! Debugger client engine for devices running an embedded CLR.
//!
//! Layers, bottom-up:
//! - [`transport`] - duplex byte streams to a device
//! - [`wire`] - packet framing and payload encoding
//! - [`engine`] - request/reply correlation, notification dispatch, device lifecycle
//! - [`rpc`] - remote calls between host and device programs
//! - [`process`] and [`breakpoint`] - mirror of the debugged program, stops and steps

pub mod breakpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod process;
pub mod rpc;
pub mod symbols;
pub mod transport;
pub mod version;
pub mod wire;

pub use config::EngineConfig;
pub use engine::{Engine, EngineListener, EngineState};
pub use error::Error;
pub use process::{AttachOptions, DebugEvent, Process};
pub use rpc::Rpc;
