//! Connection identifiers.
//!
//! Every socket that joins a room gets a fresh UUID v7, which sorts by join time.
//! The string form is what travels as `from` / `target` on the wire.

use uuid::Uuid;

/// Generate a new connection id.
pub fn generate_id() -> Uuid {
    Uuid::now_v7()
}

/// Abbreviated id for compact display (first four characters).
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(4) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique_ids() {
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0192f3aa-1234"), "0192");
        assert_eq!(short_id("ab"), "ab");
        assert_eq!(short_id("ñandú-x"), "ñand");
    }
}
