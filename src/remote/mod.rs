//! Client for the spreadsheet-backed remote endpoint.

pub mod api_types;
mod client;

pub use api_types::WriteRequest;
pub use client::{HttpRemote, RemoteEndpoint, RemoteError};
