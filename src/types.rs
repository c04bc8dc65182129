use crate::counties::CountyCode;
use geo::MultiPolygon;
use serde::{Deserialize, Serialize};

/// One natural-growth figure (births minus deaths) for a year, county and sex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub year: u16,
    pub county: CountyCode,
    pub sex: String,
    pub value: i64,
}

impl Observation {
    pub fn new(year: u16, county: &str, sex: &str, value: i64) -> Option<Self> {
        Some(Self {
            year,
            county: CountyCode::parse(county)?,
            sex: sex.to_string(),
            value,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CountyShape {
    pub name: String,
    pub code: Option<CountyCode>,
    pub geometry: Option<MultiPolygon<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Loaded,
    Placeholder,
}

#[derive(Debug, Clone)]
pub struct CountyLayer {
    pub shapes: Vec<CountyShape>,
    pub name_field: String,
    pub code_field: Option<String>,
    pub source: String,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    ByCode,
    ByName,
    Unmatched,
}

#[derive(Debug, Clone)]
pub struct JoinedCounty {
    pub name: String,
    pub code: Option<CountyCode>,
    pub geometry: Option<MultiPolygon<f64>>,
    pub value: Option<i64>,
    pub matched: MatchKind,
}
