//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own business logic and persistence concerns so route
//! handlers can stay focused on protocol translation and auth plumbing.
//! `store` is the persistence seam everything else reads through; `access`
//! and `registry` sit on top of it, and `broadcast` and `membership`
//! combine them.

pub mod access;
pub mod auth;
pub mod broadcast;
pub mod event;
pub mod membership;
pub mod pg_store;
pub mod registry;
pub mod store;

#[cfg(test)]
pub mod memory_store;
