#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod client;
pub mod cluster;
pub mod config;
pub mod election;
pub mod encoding;
pub mod error;
pub mod fifo;
pub mod message;
pub mod node;
pub mod repl;
pub mod server;
pub mod service;

pub use client::Client;
pub use error::{Error, Result};
pub use server::Server;
