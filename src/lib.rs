//! Parley - real-time messaging server
//!
//! Clients hold one persistent socket each. The server authenticates them,
//! answers tagged request frames and pushes events to every connection of
//! the users a change concerns. State lives in memory and is persisted as
//! JSON snapshots in a directory tree.

// ============================================
// Foundations
// ============================================

/// Server configuration (YAML)
pub mod config;
/// Time-ordered 160-bit identifiers
pub mod gid;
/// Frame codec and serialized socket access
pub mod network;
/// Filesystem snapshot store
pub mod store;
/// TTL + capacity cache
pub mod cache;

// ============================================
// Server
// ============================================

/// Users, communities, threads and messages
pub mod world;
/// Password and token authentication
pub mod auth;
/// Per-connection state and the outbound writer
pub mod session;
/// Event fan-out to live sessions
pub mod events;
/// Tag registry and request handlers
pub mod requests;
/// Acceptor and connection loop
pub mod server;

/// Client for the same wire protocol
pub mod client;
