//! Input validation utilities.

use crate::error::KaraokeError;

/// Longest room id accepted by the relay.
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Validate a room id (party hash) before it is used as a routing key.
pub fn validate_room_id(room: &str) -> Result<(), KaraokeError> {
    if room.trim().is_empty() {
        return Err(KaraokeError::Validation {
            message: "Room id cannot be empty".into(),
        });
    }

    if room.len() > MAX_ROOM_ID_LEN {
        return Err(KaraokeError::Validation {
            message: format!("Room id must be at most {MAX_ROOM_ID_LEN} characters"),
        });
    }

    let valid = room
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if !valid {
        return Err(KaraokeError::Validation {
            message: "Room id can only contain letters, numbers, hyphens, and underscores".into(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_ids() {
        assert!(validate_room_id("party-42_x").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("   ").is_err());
        assert!(validate_room_id("a/b").is_err());
        assert!(validate_room_id(&"a".repeat(65)).is_err());
    }
}
