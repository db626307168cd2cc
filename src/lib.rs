//! Mail and calendar synchronization engine.
//!
//! Keeps a local SQLite cache consistent with Outlook (Graph delta queries),
//! Gmail (history API) and generic IMAP servers, and pushes user actions back
//! to them with optimistic local application.

pub mod account;
pub mod auth;
pub mod cache;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod model;
pub mod provider;
pub mod recovery;
pub mod requests;
pub mod sync;
pub mod threading;
