#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod client;
pub mod error;
pub mod types;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use client::Client;
pub use types::{Message, MessageType, Payload};
pub use ws::config::{Config, HeartbeatConfig, ReconnectConfig};
pub use ws::connection::ConnectionState;
pub use ws::stats::ConnectionStats;
