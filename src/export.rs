use crate::errors::{AppError, AppResult};
use crate::ingestion::{Coordinate, FieldKind, RowSet};

/// Writes the row set back out as CSV.
///
/// Row order and the original columns are kept as read, cell by position.
/// Coordinates go into the highest-priority latitude/longitude alias column
/// (only where that cell is empty); `lat`/`lon` columns are appended when no
/// alias column exists.
pub fn write_csv(set: &RowSet) -> AppResult<Vec<u8>> {
    let lat_column = FieldKind::Latitude.column_in(&set.headers);
    let lon_column = FieldKind::Longitude.column_in(&set.headers);

    let mut headers = set.headers.clone();
    if lat_column.is_none() {
        headers.push("lat".to_string());
    }
    if lon_column.is_none() {
        headers.push("lon".to_string());
    }

    let delimiter = if set.delimiter == 0 { b',' } else { set.delimiter };
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(Vec::new());
    writer.write_record(&headers)?;

    for row in &set.rows {
        let mut record = (0..set.headers.len())
            .map(|column| row.cell(column).to_string())
            .collect::<Vec<_>>();

        let (lat, lon) = match row.coordinate {
            Some(Coordinate { lat, lon }) => (format_axis(lat), format_axis(lon)),
            None => (String::new(), String::new()),
        };
        fill_or_append(&mut record, lat_column, lat);
        fill_or_append(&mut record, lon_column, lon);
        writer.write_record(&record)?;
    }

    writer
        .into_inner()
        .map_err(|err| AppError::Io(err.into_error()))
}

fn fill_or_append(record: &mut Vec<String>, column: Option<usize>, value: String) {
    match column {
        Some(index) => {
            if record[index].trim().is_empty() {
                record[index] = value;
            }
        }
        None => record.push(value),
    }
}

fn format_axis(value: f64) -> String {
    let formatted = format!("{value:.7}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}
