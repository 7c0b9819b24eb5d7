#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub mod client;
pub mod command;
pub mod error;
pub mod server;
pub mod storage;
pub mod tpc;

pub use client::Client;
pub use command::Command;
pub use error::{Error, Result};
pub use server::{Response, Server};
