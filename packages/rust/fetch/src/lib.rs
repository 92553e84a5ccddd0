//! Network collaborators for liveness checks.
//!
//! - [`HttpFetcher`]: HEAD probe and full GET over a shared `reqwest` client.
//! - [`RenderBridge`]: headless-browser rendering via a JSON-lines subprocess.

pub mod http;
pub mod render;

pub use http::{HttpFetcher, PageResponse, ProbeResponse};
pub use render::RenderBridge;
