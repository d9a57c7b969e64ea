//! Surrogate key generation.
//!
//! Every entity uses UUID v7 — time-sortable, generated without
//! coordination, and compatible with all UUID infrastructure.

use uuid::Uuid;

/// Generate a new time-sortable surrogate key.
pub fn generate_id() -> Uuid {
    Uuid::now_v7()
}
