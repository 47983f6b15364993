use crate::ingestion::{Coordinate, FieldKind, Row};

/// Reads a coordinate from the row's own latitude/longitude columns.
///
/// Each axis is looked up independently through its alias list; numbers may
/// use a comma as the decimal separator. Both axes must parse and land inside
/// WGS84 bounds.
pub fn try_extract(row: &Row) -> Option<Coordinate> {
    let lat = row.value_of(FieldKind::Latitude).and_then(parse_locale_number)?;
    let lon = row.value_of(FieldKind::Longitude).and_then(parse_locale_number)?;
    Coordinate::new(lat, lon)
}

/// Parses `-34.6` and `-34,6`. Values carrying both separators are rejected,
/// the grouping convention is ambiguous.
pub fn parse_locale_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || (trimmed.contains(',') && trimmed.contains('.')) {
        return None;
    }
    let value = trimmed.replace(',', ".").parse::<f64>().ok()?;
    value.is_finite().then_some(value)
}
