//! JSON-RPC host for the Unity editor bridge.
//!
//! Exposes a [`Bridge`](unity_bridge::Bridge) over HTTP: `GET /health` and a
//! JSON-RPC 2.0 endpoint at `POST /rpc`.

pub mod handler;
mod handlers;
pub mod server;

pub use server::{router, start_server, AppState};
