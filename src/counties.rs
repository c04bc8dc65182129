use serde::{Deserialize, Serialize};
use std::fmt;

/// Statistics Estonia county codes and their canonical names.
pub const COUNTIES: [(&str, &str); 15] = [
    ("37", "Harju maakond"),
    ("39", "Hiiu maakond"),
    ("44", "Ida-Viru maakond"),
    ("49", "Jõgeva maakond"),
    ("51", "Järva maakond"),
    ("57", "Lääne maakond"),
    ("59", "Lääne-Viru maakond"),
    ("65", "Põlva maakond"),
    ("67", "Pärnu maakond"),
    ("70", "Rapla maakond"),
    ("74", "Saare maakond"),
    ("78", "Tartu maakond"),
    ("82", "Valga maakond"),
    ("84", "Viljandi maakond"),
    ("86", "Võru maakond"),
];

/// Numeric county code with leading zeros stripped, so "0037" == "37".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountyCode(String);

impl CountyCode {
    pub fn parse(raw: &str) -> Option<CountyCode> {
        let raw = raw.trim();
        if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let trimmed = raw.trim_start_matches('0');
        let code = if trimmed.is_empty() { "0" } else { trimmed };
        Some(CountyCode(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn canonical_name(&self) -> Option<&'static str> {
        canonical_name(&self.0)
    }
}

impl fmt::Display for CountyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn canonical_name(code: &str) -> Option<&'static str> {
    let code = CountyCode::parse(code)?;
    COUNTIES
        .iter()
        .find(|(c, _)| *c == code.as_str())
        .map(|(_, name)| *name)
}

/// Join key for free-text county names: case-folded, with the
/// "maakond"/"county" suffix and the short-form "-maa" ending removed.
pub fn normalize_name(name: &str) -> String {
    let folded = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut key = folded.as_str();
    for suffix in ["maakond", "county"] {
        if let Some(stripped) = key.strip_suffix(suffix) {
            key = stripped.trim_end();
            break;
        }
    }
    // "Harjumaa" -> "harju"
    if let Some(stripped) = key.strip_suffix("maa") {
        if !stripped.is_empty() {
            key = stripped;
        }
    }
    key.trim_end_matches(['-', ' ']).to_string()
}

pub fn code_for_name(name: &str) -> Option<CountyCode> {
    let key = normalize_name(name);
    COUNTIES
        .iter()
        .find(|(_, canonical)| normalize_name(canonical) == key)
        .and_then(|(code, _)| CountyCode::parse(code))
}

/// Cell from the statistics payload: either a code or a county name.
pub fn resolve(raw: &str) -> Option<CountyCode> {
    match CountyCode::parse(raw) {
        Some(code) if code.canonical_name().is_some() => Some(code),
        Some(_) => None,
        None => code_for_name(raw),
    }
}
