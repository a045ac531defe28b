//! flowrun - streaming flow execution engine
//!
//! flowrun runs workflow graphs (HTTP requests, conditions, loops and
//! scripts) against live endpoints, records one execution row per node
//! invocation, and streams node state to the caller while the run is in
//! progress.
//!
//! ## Key Features
//!
//! - **Graph scheduling**: independent nodes run concurrently; untaken
//!   branches are skipped so joins still fire
//! - **Loops**: `for` / `for_each` with per-iteration rows and `throw` /
//!   `ignore` error handling
//! - **Durable state**: rows are persisted with bounded retries and never
//!   left `running`, even when the client disconnects
//! - **Simplified YAML**: workspaces import from and export to a compact
//!   step-based format
//!
//! ## Example
//!
//! ```yaml
//! workspace_name: shop
//! requests:
//!   - name: orders
//!     method: GET
//!     url: "https://api.example.com/orders"
//!     headers:
//!       Authorization: "Bearer {{token}}"
//! flows:
//!   - name: sync
//!     variables:
//!       - { name: token, value: abc }
//!     steps:
//!       - request: { name: fetch, use_request: orders }
//!       - for_each: { name: each, items: "{{ fetch.response.body }}", loop: show }
//!       - js: { name: show, code: "each.item" }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod id;
pub mod metrics;
pub mod nodes;
pub mod shutdown;
pub mod storage;
pub mod telemetry;
pub mod workflow;

pub use error::{Error, Result};
