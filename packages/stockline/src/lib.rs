//! Real-time synchronization service for the Stockline inventory
//! manager.
//!
//! Keeps independently running client instances consistent with a
//! shared dataset over one WebSocket endpoint: full-dataset sync on
//! request, incremental data-change broadcast with origin exclusion,
//! capability negotiation (payload compression), heartbeats, and
//! stale-connection reclamation. Business data lives behind the
//! `stockline_store` collaborator; this crate never owns it.

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod server;
pub mod ws;

pub use server::{AppState, SyncServer};
