//! Cache key validation

use crate::errors::{CacheError, Result};

/// Maximum key length in bytes
pub const MAX_KEY_LENGTH: usize = 250;

/// Characters that are reserved across all engines
const FORBIDDEN_CHARS: &[char] = &['{', '}', '(', ')', '/', '@', ':', '"'];

/// Validate a caller-supplied cache key.
///
/// Keys are UTF-8 strings of 1..=250 bytes and must not contain any of the
/// reserved characters. Validation failures are programmer errors and
/// propagate unchanged through every layer.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::invalid_key(key, "key must not be empty"));
    }

    if key.len() > MAX_KEY_LENGTH {
        // Report a short prefix only; truncate on a char boundary so
        // multi-byte keys cannot panic the error path.
        let prefix: String = key.chars().take(32).collect();
        return Err(CacheError::invalid_key(
            prefix,
            format!("key exceeds {MAX_KEY_LENGTH} bytes"),
        ));
    }

    if let Some(c) = key.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(CacheError::invalid_key(
            key,
            format!("key contains reserved character {c:?}"),
        ));
    }

    Ok(())
}
