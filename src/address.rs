//! Cache keys for addresses.
//!
//! Normalization is lowercase + trim only. Keys persisted by earlier runs
//! must keep matching, so no accent folding or whitespace collapsing.

use crate::ingestion::{FieldKind, Row};

/// Namespace for geocode entries in the durable store.
pub const GEOCODE_PREFIX: &str = "geocache:";
/// Namespace for UI preference entries in the durable store.
pub const PREFERENCE_PREFIX: &str = "prefs:";

pub fn normalize(address: &str) -> String {
    address.trim().to_lowercase()
}

pub fn cache_key(normalized: &str) -> String {
    format!("{GEOCODE_PREFIX}{normalized}")
}

/// Inverse of [`cache_key`]; passes through keys that carry no prefix.
pub fn strip_cache_prefix(key: &str) -> &str {
    key.strip_prefix(GEOCODE_PREFIX).unwrap_or(key)
}

/// Query text sent to the provider: `"<street>, <neighborhood>"`, or just the
/// street when the row has no neighborhood. `None` when the row carries no
/// street address at all.
pub fn query_for_row(row: &Row) -> Option<String> {
    let street = row.value_of(FieldKind::Address)?;
    match row.value_of(FieldKind::Neighborhood) {
        Some(neighborhood) => Some(format!("{street}, {neighborhood}")),
        None => Some(street.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::Row;

    #[test]
    fn normalizes_case_and_whitespace_only() {
        assert_eq!(normalize("  Av. Santa Fe 3253, Palermo \n"), "av. santa fe 3253, palermo");
        assert_eq!(normalize("Córdoba 1200"), "córdoba 1200");
        assert_eq!(normalize("RIVADAVIA  5000"), "rivadavia  5000");
    }

    #[test]
    fn prefixes_cache_keys() {
        let key = cache_key(&normalize("Corrientes 348"));
        assert_eq!(key, "geocache:corrientes 348");
        assert_eq!(strip_cache_prefix(&key), "corrientes 348");
        assert_eq!(strip_cache_prefix("corrientes 348"), "corrientes 348");
        assert!(!key.starts_with(PREFERENCE_PREFIX));
    }

    #[test]
    fn builds_query_from_street_and_neighborhood() {
        let row = Row::from_pairs(
            0,
            [("Dirección", "Av. Santa Fe 3253"), ("Barrio", "Palermo")],
        );
        assert_eq!(
            query_for_row(&row).as_deref(),
            Some("Av. Santa Fe 3253, Palermo")
        );

        let street_only = Row::from_pairs(1, [("Direccion", "Av. 9 de Julio 100")]);
        assert_eq!(
            query_for_row(&street_only).as_deref(),
            Some("Av. 9 de Julio 100")
        );

        let blank = Row::from_pairs(2, [("Direccion", "   "), ("Barrio", "Palermo")]);
        assert!(query_for_row(&blank).is_none());
    }
}
