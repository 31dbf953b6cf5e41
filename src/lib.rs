//! # Zoekt coordinator
//!
//! Tracks a fleet of Zoekt index nodes, shards enabled namespaces onto them
//! as replicas and indices, and hands out indexing work through the nodes'
//! heartbeats. Usable both as a standalone binary and as a library.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! zoekt-coordinator = { version = "0.0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use zoekt_coordinator::coordinator::WallClock;
//! use zoekt_coordinator::server::{AppState, create_router};
//! use zoekt_coordinator::store::{SqliteStore, Store};
//!
//! let store = SqliteStore::new("./data/zoekt-coordinator.db").unwrap();
//! store.initialize().unwrap();
//!
//! let state = Arc::new(AppState::new(Arc::new(store), Arc::new(WallClock)));
//! let router = create_router(state);
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): builds the `zoekt-coordinator` binary. Disable with
//!   `default-features = false`.

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod server;
pub mod store;
pub mod types;
