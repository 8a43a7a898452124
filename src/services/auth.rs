//! Session and WS-ticket lookups against the auth subsystem's tables.
//!
//! ARCHITECTURE
//! ============
//! Users and sessions are created elsewhere; this service only resolves a
//! session cookie or a websocket ticket to the caller's identity. HTTP uses
//! the long-lived session token, while websocket upgrades use one-time
//! short-lived tickets so the cookie never travels in a query string.
//!
//! TRADE-OFFS
//! ==========
//! Ticket consumption is destructive (`DELETE ... RETURNING`) to guarantee
//! single use; this favors replay safety over reconnect convenience.

use std::fmt::Write;

use rand::Rng;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Generate a short-lived 16-byte hex WS ticket.
#[must_use]
pub(crate) fn generate_ws_ticket() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes_to_hex(&bytes)
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
}

/// Validate a session token and return the associated user.
pub async fn validate_session(pool: &PgPool, token: &str) -> Result<Option<Identity>, sqlx::Error> {
    let row = sqlx::query(
        r"SELECT u.id, u.name
          FROM sessions s
          JOIN users u ON u.id = s.user_id
          WHERE s.token = $1 AND s.expires_at > now()",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| Identity { user_id: r.get("id"), display_name: r.get("name") }))
}

/// Create a short-lived WS ticket for the given user.
pub async fn create_ws_ticket(pool: &PgPool, user_id: Uuid) -> Result<String, sqlx::Error> {
    let ticket = generate_ws_ticket();
    sqlx::query("INSERT INTO ws_tickets (ticket, user_id) VALUES ($1, $2)")
        .bind(&ticket)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(ticket)
}

/// Consume a WS ticket atomically, returning the ticket holder if valid.
pub async fn consume_ws_ticket(pool: &PgPool, ticket: &str) -> Result<Option<Identity>, sqlx::Error> {
    let row = sqlx::query(
        r"WITH consumed AS (
              DELETE FROM ws_tickets
              WHERE ticket = $1 AND expires_at > now()
              RETURNING user_id
          )
          SELECT u.id, u.name
          FROM consumed c
          JOIN users u ON u.id = c.user_id",
    )
    .bind(ticket)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| Identity { user_id: r.get("id"), display_name: r.get("name") }))
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
