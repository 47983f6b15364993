use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{AppError, AppResult};

const ADDRESS_ALIASES: &[&str] = &[
    "dirección",
    "direccion",
    "domicilio",
    "calle",
    "address",
    "street",
];
const NEIGHBORHOOD_ALIASES: &[&str] = &["barrio", "neighborhood", "neighbourhood", "localidad"];
const REGION_ALIASES: &[&str] = &["región", "region", "provincia", "zona"];
const LATITUDE_ALIASES: &[&str] = &["lat", "latitud", "latitude", "y"];
const LONGITUDE_ALIASES: &[&str] = &["lon", "lng", "long", "longitud", "longitude", "x"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    /// Returns `None` unless both axes are finite and inside WGS84 bounds.
    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        let valid = lat.is_finite()
            && lon.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lon);
        valid.then_some(Self { lat, lon })
    }

    pub fn is_valid(&self) -> bool {
        Self::new(self.lat, self.lon).is_some()
    }
}

/// The semantic role a column can play, matched against header aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Address,
    Neighborhood,
    Region,
    Latitude,
    Longitude,
}

impl FieldKind {
    /// Aliases in priority order, lowercase.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            FieldKind::Address => ADDRESS_ALIASES,
            FieldKind::Neighborhood => NEIGHBORHOOD_ALIASES,
            FieldKind::Region => REGION_ALIASES,
            FieldKind::Latitude => LATITUDE_ALIASES,
            FieldKind::Longitude => LONGITUDE_ALIASES,
        }
    }

    /// Column of the highest-priority alias present in `headers`; the same
    /// order [`Row::value_of`] reads in.
    pub fn column_in(&self, headers: &[String]) -> Option<usize> {
        self.aliases().iter().find_map(|alias| {
            headers
                .iter()
                .position(|header| header.trim().to_lowercase() == *alias)
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Row {
    /// Position in the input; identity for export ordering.
    pub index: usize,
    pub fields: Vec<(String, String)>,
    pub coordinate: Option<Coordinate>,
}

impl Row {
    pub fn from_pairs<I, K, V>(index: usize, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            index,
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            coordinate: None,
        }
    }

    /// Cell at `column`; rows built by [`parse_csv`] hold one field per header.
    pub fn cell(&self, column: usize) -> &str {
        self.fields
            .get(column)
            .map(|(_, value)| value.as_str())
            .unwrap_or_default()
    }

    /// First non-empty value under the kind's aliases, trying aliases in
    /// priority order.
    pub fn value_of(&self, kind: FieldKind) -> Option<&str> {
        kind.aliases().iter().find_map(|alias| {
            self.fields
                .iter()
                .find(|(key, _)| key.trim().to_lowercase() == *alias)
                .map(|(_, value)| value.trim())
                .filter(|value| !value.is_empty())
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RowSet {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
    #[serde(skip)]
    pub delimiter: u8,
}

pub fn parse_csv(bytes: &[u8]) -> AppResult<RowSet> {
    let text = std::str::from_utf8(bytes)
        .map_err(|err| AppError::Parse(format!("input is not valid UTF-8: {err}")))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    if text.trim().is_empty() {
        return Err(AppError::Parse("input is empty".into()));
    }

    let delimiter = sniff_delimiter(text);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|err| AppError::Parse(format!("invalid header row: {err}")))?
        .iter()
        .map(|header| header.trim().to_string())
        .collect::<Vec<_>>();

    let has_address = FieldKind::Address.column_in(&headers).is_some();
    let has_coordinates = FieldKind::Latitude.column_in(&headers).is_some()
        && FieldKind::Longitude.column_in(&headers).is_some();
    if !has_address && !has_coordinates {
        return Err(AppError::Parse(format!(
            "no address or coordinate columns among headers {headers:?}"
        )));
    }

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record =
            record.map_err(|err| AppError::Parse(format!("row {}: {err}", index + 1)))?;
        if record.len() > headers.len() {
            warn!(
                target: "ingestion",
                row = index + 1,
                extra = record.len() - headers.len(),
                "dropping values beyond the header row"
            );
        }
        let fields = headers
            .iter()
            .enumerate()
            .map(|(col, header)| {
                let value = record.get(col).unwrap_or_default();
                (header.clone(), value.to_string())
            })
            .collect();
        rows.push(Row {
            index,
            fields,
            coordinate: None,
        });
    }

    Ok(RowSet {
        headers,
        rows,
        delimiter,
    })
}

fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or_default();
    [b';', b',', b'\t']
        .into_iter()
        .map(|candidate| {
            let count = header.bytes().filter(|b| *b == candidate).count();
            (candidate, count)
        })
        .filter(|(_, count)| *count > 0)
        .max_by_key(|(_, count)| *count)
        .map(|(candidate, _)| candidate)
        .unwrap_or(b',')
}
