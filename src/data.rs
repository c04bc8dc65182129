use crate::config::GeometryConfig;
use crate::counties::{CountyCode, COUNTIES};
use crate::error::GeoError;
use crate::types::{CountyLayer, CountyShape, Provenance};
use geo::{BoundingRect, Coord, MultiPolygon, Rect};
use geojson::{GeoJson, JsonObject};
use shapefile::dbase::FieldValue;
use shapefile::Reader;
use std::path::Path;
use tracing::{info, warn};

/// Tries the local path, then each URL in order; first layer that loads wins.
pub async fn load_layer(config: &GeometryConfig) -> Result<CountyLayer, GeoError> {
    if config.path.is_none() && config.urls.is_empty() {
        return Err(GeoError::NoSources);
    }

    let mut failures = Vec::new();

    if let Some(path) = &config.path {
        match load_file(path, config) {
            Ok(layer) => return Ok(layer),
            Err(e) => {
                warn!("Geometry file {:?} unusable: {}", path, e);
                failures.push(format!("{}: {}", path.display(), e));
            }
        }
    }

    for url in &config.urls {
        match load_url(url, config).await {
            Ok(layer) => return Ok(layer),
            Err(e) => {
                warn!("Geometry URL {} unusable: {}", url, e);
                failures.push(format!("{}: {}", url, e));
            }
        }
    }

    Err(GeoError::AllSourcesFailed(failures))
}

pub fn load_file(path: &Path, config: &GeometryConfig) -> Result<CountyLayer, GeoError> {
    let extension = path.extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    let layer = match extension.as_str() {
        "shp" => load_shapefile(path, config)?,
        "json" | "geojson" => {
            let bytes = std::fs::read(path).map_err(|source| GeoError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            parse_geojson(&bytes, &path.display().to_string(), config)?
        }
        other => return Err(GeoError::UnsupportedFormat(other.to_string())),
    };

    info!("Loaded {} county shapes from {:?}", layer.shapes.len(), path);
    Ok(layer)
}

async fn load_url(url: &str, config: &GeometryConfig) -> Result<CountyLayer, GeoError> {
    info!("Downloading geometry from {}", url);
    let response = reqwest::get(url).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(GeoError::Status(status.as_u16()));
    }
    let bytes = response.bytes().await?;
    parse_geojson(&bytes, url, config)
}

/// Parses a GeoJSON FeatureCollection (file, download or upload).
pub fn parse_geojson(bytes: &[u8], source: &str, config: &GeometryConfig) -> Result<CountyLayer, GeoError> {
    // Parse the GeoJSON. warning: this loads the whole payload into memory.
    let geojson = GeoJson::from_reader(bytes)?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(GeoError::NotFeatureCollection),
    };

    let empty = JsonObject::new();
    let first_props = collection
        .features
        .iter()
        .find_map(|f| f.properties.as_ref())
        .ok_or(GeoError::Empty)?;
    let available: Vec<String> = first_props.keys().cloned().collect();

    let name_field = pick_field(&available, &config.name_fields).ok_or_else(|| GeoError::MissingNameField {
        candidates: config.name_fields.clone(),
        available: available.clone(),
    })?;
    let code_field = pick_field(&available, &config.code_fields);

    let mut shapes = Vec::new();
    for feature in collection.features {
        let props = feature.properties.as_ref().unwrap_or(&empty);
        let Some(name) = props.get(&name_field).and_then(json_text) else {
            warn!("Skipping feature without '{}' in {}", name_field, source);
            continue;
        };
        let code = code_field
            .as_ref()
            .and_then(|field| props.get(field))
            .and_then(json_text)
            .and_then(|raw| CountyCode::parse(&raw));

        // geojson crate Value -> geo types -> MultiPolygon
        let geometry = feature.geometry.and_then(|geom| {
            let geo_geom: geo::Geometry<f64> = geom.value.try_into().ok()?;
            match geo_geom {
                geo::Geometry::MultiPolygon(mp) => Some(mp),
                geo::Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p])),
                _ => None,
            }
        });

        shapes.push(CountyShape { name, code, geometry });
    }

    Ok(CountyLayer {
        shapes,
        name_field,
        code_field,
        source: source.to_string(),
        provenance: Provenance::Loaded,
    })
}

fn load_shapefile(path: &Path, config: &GeometryConfig) -> Result<CountyLayer, GeoError> {
    let mut reader = Reader::from_path(path)?;

    // Attribute names come from the .dbf header; records only expose lookups.
    let table = shapefile::dbase::Reader::from_path(path.with_extension("dbf"))
        .map_err(shapefile::Error::from)?;
    let available: Vec<String> = table.fields().iter().map(|f| f.name().to_string()).collect();

    let name_field = pick_field(&available, &config.name_fields).ok_or_else(|| GeoError::MissingNameField {
        candidates: config.name_fields.clone(),
        available: available.clone(),
    })?;
    let code_field = pick_field(&available, &config.code_fields);

    let mut shapes = Vec::new();
    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result?;

        let Some(name) = record.get(&name_field).and_then(dbase_text) else {
            warn!("Skipping record without '{}' in {:?}", name_field, path);
            continue;
        };
        let code = code_field
            .as_ref()
            .and_then(|field| record.get(field))
            .and_then(dbase_text)
            .and_then(|raw| CountyCode::parse(&raw));

        let geometry: Option<MultiPolygon<f64>> = match shape {
            shapefile::Shape::Polygon(polygon) => Some(polygon.into()),
            shapefile::Shape::PolygonM(polygon) => Some(polygon.into()),
            shapefile::Shape::PolygonZ(polygon) => Some(polygon.into()),
            _ => None,
        };

        shapes.push(CountyShape { name, code, geometry });
    }

    if shapes.is_empty() {
        return Err(GeoError::Empty);
    }
    Ok(CountyLayer {
        shapes,
        name_field,
        code_field,
        source: path.display().to_string(),
        provenance: Provenance::Loaded,
    })
}

fn pick_field(available: &[String], candidates: &[String]) -> Option<String> {
    candidates.iter().find_map(|candidate| {
        available
            .iter()
            .find(|field| field.eq_ignore_ascii_case(candidate))
            .cloned()
    })
}

fn json_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn dbase_text(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Character(Some(s)) => Some(s.trim().to_string()),
        FieldValue::Numeric(Some(n)) => Some(format!("{}", *n as i64)),
        _ => None,
    }
}

impl CountyLayer {
    /// Name-only stand-in for all 15 counties; renders as a bar chart.
    pub fn placeholder() -> Self {
        Self {
            shapes: COUNTIES
                .iter()
                .map(|(code, name)| CountyShape {
                    name: name.to_string(),
                    code: CountyCode::parse(code),
                    geometry: None,
                })
                .collect(),
            name_field: "name".into(),
            code_field: Some("code".into()),
            source: "built-in county list".into(),
            provenance: Provenance::Placeholder,
        }
    }

    pub fn has_geometry(&self) -> bool {
        self.shapes.iter().any(|s| s.geometry.is_some())
    }

    /// Bounding box over every shape with geometry.
    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.shapes
            .iter()
            .filter_map(|s| s.geometry.as_ref()?.bounding_rect())
            .reduce(|a, b| {
                Rect::new(
                    Coord { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
                    Coord { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const TWO_COUNTIES: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": { "MNIMI": "Harju maakond", "MKOOD": "0037" },
                "geometry": { "type": "Polygon", "coordinates": [[[24.0, 59.0], [25.0, 59.0], [25.0, 59.5], [24.0, 59.0]]] }
            },
            {
                "type": "Feature",
                "properties": { "MNIMI": "Hiiu maakond", "MKOOD": 39 },
                "geometry": { "type": "MultiPolygon", "coordinates": [[[[22.0, 58.8], [23.0, 58.8], [23.0, 59.1], [22.0, 58.8]]]] }
            },
            {
                "type": "Feature",
                "properties": { "MNIMI": "Tartu maakond" },
                "geometry": { "type": "Point", "coordinates": [26.7, 58.4] }
            }
        ]
    }"#;

    fn config() -> GeometryConfig {
        GeometryConfig::default()
    }

    #[test]
    fn detects_fields_and_normalizes_codes() {
        let layer = parse_geojson(TWO_COUNTIES.as_bytes(), "test", &config()).unwrap();
        assert_eq!(layer.name_field, "MNIMI");
        assert_eq!(layer.code_field.as_deref(), Some("MKOOD"));
        assert_eq!(layer.provenance, Provenance::Loaded);
        assert_eq!(layer.shapes.len(), 3);
        assert_eq!(layer.shapes[0].code.as_ref().unwrap().as_str(), "37");
        assert_eq!(layer.shapes[1].code.as_ref().unwrap().as_str(), "39");
        assert!(layer.shapes[1].geometry.is_some());
        // points are kept without geometry
        assert!(layer.shapes[2].geometry.is_none());
        assert!(layer.shapes[2].code.is_none());
    }

    #[test]
    fn field_match_is_case_insensitive() {
        let json = r#"{"type":"FeatureCollection","features":[
            {"type":"Feature","properties":{"Maakond":"Rapla"},"geometry":null}]}"#;
        let layer = parse_geojson(json.as_bytes(), "test", &config()).unwrap();
        assert_eq!(layer.name_field, "Maakond");
        assert_eq!(layer.code_field, None);
        assert_eq!(layer.shapes[0].name, "Rapla");
    }

    #[test]
    fn missing_name_field_lists_candidates() {
        let json = r#"{"type":"FeatureCollection","features":[
            {"type":"Feature","properties":{"label":"Rapla"},"geometry":null}]}"#;
        match parse_geojson(json.as_bytes(), "test", &config()) {
            Err(GeoError::MissingNameField { candidates, available }) => {
                assert!(candidates.contains(&"MNIMI".to_string()));
                assert_eq!(available, vec!["label".to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_bare_geometry() {
        let json = r#"{"type":"Point","coordinates":[24.0,59.0]}"#;
        assert!(matches!(
            parse_geojson(json.as_bytes(), "test", &config()),
            Err(GeoError::NotFeatureCollection)
        ));
    }

    #[test]
    fn placeholder_is_marked() {
        let layer = CountyLayer::placeholder();
        assert_eq!(layer.shapes.len(), 15);
        assert_eq!(layer.provenance, Provenance::Placeholder);
        assert!(!layer.has_geometry());
        assert!(layer.bounds().is_none());
    }

    #[tokio::test]
    async fn falls_through_sources_and_reports_each() {
        let config = GeometryConfig {
            path: Some(PathBuf::from("/nonexistent/maakonnad.geojson")),
            urls: vec!["http://127.0.0.1:9/none.geojson".into()],
            ..GeometryConfig::default()
        };
        match load_layer(&config).await {
            Err(GeoError::AllSourcesFailed(failures)) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected result: {other:?}"),
        }

        let none = GeometryConfig { path: None, urls: Vec::new(), ..GeometryConfig::default() };
        assert!(matches!(load_layer(&none).await, Err(GeoError::NoSources)));
    }

    #[tokio::test]
    async fn loads_local_geojson_file() {
        let dir = std::env::temp_dir().join(format!("iive_map_geo_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("maakonnad.geojson");
        std::fs::write(&path, TWO_COUNTIES).unwrap();

        let config = GeometryConfig { path: Some(path), ..GeometryConfig::default() };
        let layer = load_layer(&config).await.unwrap();
        assert_eq!(layer.shapes.len(), 3);
        assert!(layer.has_geometry());
        let bounds = layer.bounds().unwrap();
        assert_eq!((bounds.min().x, bounds.max().x), (22.0, 25.0));
        assert_eq!((bounds.min().y, bounds.max().y), (58.8, 59.5));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = parse_geojson(b"{\"type\": \"FeatureCollection\", ", "upload", &config()).unwrap_err();
        assert!(matches!(err, GeoError::Json(_)));
        assert!(err.to_string().starts_with("Malformed GeoJSON"));
    }

    fn write_shapefile(dir: &Path, name_field: &str) -> PathBuf {
        use shapefile::dbase::{FieldValue, Record, TableWriterBuilder};
        use shapefile::{Point, PolygonRing, Writer};

        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join("maakonnad.shp");
        let table = TableWriterBuilder::new()
            .add_character_field(name_field.try_into().unwrap(), 50)
            .add_numeric_field("MKOOD".try_into().unwrap(), 10, 0);
        let mut writer = Writer::from_path(&path, table).unwrap();

        let counties = [("Harju maakond", 37.0, 24.0), ("Hiiu maakond", 39.0, 22.0)];
        for (county, code, x) in counties {
            let ring = PolygonRing::Outer(vec![
                Point::new(x, 58.0),
                Point::new(x, 59.0),
                Point::new(x + 1.0, 59.0),
                Point::new(x + 1.0, 58.0),
                Point::new(x, 58.0),
            ]);
            let mut record = Record::default();
            record.insert(name_field.to_string(), FieldValue::Character(Some(county.to_string())));
            record.insert("MKOOD".to_string(), FieldValue::Numeric(Some(code)));
            writer
                .write_shape_and_record(&shapefile::Polygon::new(ring), &record)
                .unwrap();
        }
        path
    }

    #[test]
    fn loads_shapefile_with_numeric_codes() {
        let dir = std::env::temp_dir().join(format!("iive_map_shp_{}", std::process::id()));
        let path = write_shapefile(&dir, "MNIMI");

        let layer = load_file(&path, &config()).unwrap();
        assert_eq!(layer.name_field, "MNIMI");
        assert_eq!(layer.code_field.as_deref(), Some("MKOOD"));
        assert_eq!(layer.shapes.len(), 2);
        assert_eq!(layer.shapes[0].name, "Harju maakond");
        assert_eq!(layer.shapes[0].code.as_ref().unwrap().as_str(), "37");
        assert_eq!(layer.shapes[1].code.as_ref().unwrap().as_str(), "39");

        let geometry = layer.shapes[1].geometry.as_ref().unwrap();
        assert_eq!(geometry.0.len(), 1);
        assert!(geometry.0[0].exterior().coords().any(|c| c.x == 22.0 && c.y == 59.0));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn shapefile_without_name_field_lists_columns() {
        let dir = std::env::temp_dir().join(format!("iive_map_shp_bad_{}", std::process::id()));
        let path = write_shapefile(&dir, "LABEL");

        match load_file(&path, &config()) {
            Err(GeoError::MissingNameField { available, .. }) => {
                assert_eq!(available, vec!["LABEL".to_string(), "MKOOD".to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn unsupported_extension() {
        let err = load_file(Path::new("counties.kml"), &config()).unwrap_err();
        assert!(matches!(err, GeoError::UnsupportedFormat(ext) if ext == "kml"));
    }
}
