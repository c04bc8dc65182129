use std::collections::BTreeMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub geometry: GeometryConfig,
    pub output: OutputConfig,
    pub server: ServerConfig,
}

/// PxWeb endpoint plus the fixed query selecting years, counties and sexes.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub years: Vec<String>,
    pub counties: Vec<String>,
    pub sexes: Vec<String>,
    pub timeout_secs: u64,
    pub columns: ColumnSchema,
    // Wide layout: value column header -> sex code
    pub sex_columns: BTreeMap<String, String>,
    // sex code -> display label
    pub sex_labels: BTreeMap<String, String>,
}

/// Declared header names of the long CSV layout.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ColumnSchema {
    pub year: String,
    pub county: String,
    pub sex: String,
    pub value: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeometryConfig {
    pub path: Option<PathBuf>,
    pub urls: Vec<String>,
    pub name_fields: Vec<String>,
    pub code_fields: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub map: PathBuf,
    pub table: PathBuf,
    pub width: u32,
    pub height: u32,
    // Label font candidates; the first readable one is used
    pub fonts: Vec<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub cache_ttl_secs: u64,
    pub max_upload_mb: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: "https://andmed.stat.ee/api/v1/et/stat/RV032".into(),
            years: (2014..=2023).map(|y| y.to_string()).collect(),
            counties: crate::counties::COUNTIES.iter().map(|(code, _)| code.to_string()).collect(),
            sexes: vec!["2".into(), "3".into()],
            timeout_secs: 30,
            columns: ColumnSchema::default(),
            sex_columns: BTreeMap::from([
                ("Mehed Loomulik iive".to_string(), "2".to_string()),
                ("Naised Loomulik iive".to_string(), "3".to_string()),
            ]),
            sex_labels: BTreeMap::from([
                ("2".to_string(), "Mehed".to_string()),
                ("3".to_string(), "Naised".to_string()),
            ]),
        }
    }
}

impl Default for ColumnSchema {
    fn default() -> Self {
        Self {
            year: "Aasta".into(),
            county: "Maakond".into(),
            sex: "Sugu".into(),
            value: "Loomulik iive".into(),
        }
    }
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("maakonnad.geojson")),
            urls: Vec::new(),
            name_fields: ["MNIMI", "MAAKOND", "maakond", "name", "NAME", "county", "maakonna_nimi"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            code_fields: ["MKOOD", "kood", "code"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            map: PathBuf::from("output/map.png"),
            table: PathBuf::from("output/table.csv"),
            width: 900,
            height: 600,
            fonts: [
                "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
                "/usr/share/fonts/dejavu/DejaVuSans.ttf",
                "/usr/share/fonts/TTF/DejaVuSans.ttf",
                "/System/Library/Fonts/Supplemental/Arial.ttf",
                "C:\\Windows\\Fonts\\arial.ttf",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8501,
            cache_ttl_secs: 600,
            max_upload_mb: 64,
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }

    /// Missing config file is not an error; every field has a default.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::warn!("Config file {:?} not found, using defaults", path);
            Ok(Self::default())
        }
    }
}

impl ApiConfig {
    pub fn sex_label<'a>(&'a self, code: &'a str) -> &'a str {
        self.sex_labels.get(code).map(String::as_str).unwrap_or(code)
    }

    pub fn latest_year(&self) -> Option<u16> {
        self.years.iter().filter_map(|y| y.parse().ok()).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [server]
            port = 9000

            [api.columns]
            value = "Iive"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.cache_ttl_secs, 600);
        assert_eq!(config.server.max_upload_mb, 64);
        assert!(!config.output.fonts.is_empty());
        assert_eq!(config.api.columns.value, "Iive");
        assert_eq!(config.api.columns.year, "Aasta");
        assert_eq!(config.api.counties.len(), 15);
        assert_eq!(config.api.latest_year(), Some(2023));
    }

    #[test]
    fn shipped_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.toml");
        let config = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(config.api.sexes, vec!["2", "3"]);
        assert_eq!(config.api.sex_columns.len(), 2);
        assert_eq!(config.geometry.name_fields[0], "MNIMI");
        assert!(config.geometry.urls.is_empty());
    }

    #[test]
    fn sex_label_falls_back_to_code() {
        let api = ApiConfig::default();
        assert_eq!(api.sex_label("2"), "Mehed");
        assert_eq!(api.sex_label("9"), "9");
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = AppConfig::from_toml("[server\nport = 1").unwrap_err();
        assert!(err.to_string().contains("TOML"));
    }
}
