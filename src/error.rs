use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Underlying request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Statistics API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to read CSV payload: {0}")]
    Csv(#[from] csv::Error),

    #[error("CSV header does not match the declared schema; expected {expected:?}, found {found:?}")]
    MissingColumns {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Line {line}: column '{column}' has invalid value '{value}'")]
    InvalidValue {
        line: u64,
        column: String,
        value: String,
    },
}

#[derive(Error, Debug)]
pub enum GeoError {
    #[error("Failed to read geometry file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to download geometry: {0}")]
    Download(#[from] reqwest::Error),

    #[error("Geometry download returned HTTP {0}")]
    Status(u16),

    #[error("Malformed GeoJSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse GeoJSON: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("Failed to read shapefile: {0}")]
    Shapefile(#[from] shapefile::Error),

    #[error("GeoJSON must be a FeatureCollection")]
    NotFeatureCollection,

    #[error("Unsupported geometry format: {0}")]
    UnsupportedFormat(String),

    #[error("No county name field found; tried {candidates:?}, available {available:?}")]
    MissingNameField {
        candidates: Vec<String>,
        available: Vec<String>,
    },

    #[error("Geometry source contains no features")]
    Empty,

    #[error("No geometry source configured")]
    NoSources,

    #[error("All geometry sources failed: {}", .0.join("; "))]
    AllSourcesFailed(Vec<String>),
}
