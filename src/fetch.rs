use crate::config::ApiConfig;
use crate::counties;
use crate::error::{FetchError, ParseError};
use crate::types::Observation;
use csv::{ReaderBuilder, StringRecord};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info};

const DELIMITERS: [u8; 2] = [b',', b';'];
const MISSING_MARKERS: [&str; 4] = ["", "..", ".", "-"];

#[derive(Debug, Serialize)]
pub struct PxQuery {
    query: Vec<PxSelection>,
    response: PxResponse,
}

#[derive(Debug, Serialize)]
struct PxSelection {
    code: String,
    selection: PxFilter,
}

#[derive(Debug, Serialize)]
struct PxFilter {
    filter: String,
    values: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PxResponse {
    format: String,
}

impl PxQuery {
    pub fn from_config(api: &ApiConfig) -> Self {
        let select = |code: &str, values: &[String]| PxSelection {
            code: code.to_string(),
            selection: PxFilter {
                filter: "item".into(),
                values: values.to_vec(),
            },
        };
        Self {
            query: vec![
                select(&api.columns.year, &api.years),
                select(&api.columns.county, &api.counties),
                select(&api.columns.sex, &api.sexes),
            ],
            response: PxResponse { format: "csv".into() },
        }
    }
}

/// Memoisation key: everything that changes the API response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
    url: String,
    years: Vec<String>,
    counties: Vec<String>,
    sexes: Vec<String>,
}

/// Parsed payload: the header as received plus the observations it yielded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub observations: Vec<Observation>,
}

pub struct Fetcher {
    client: reqwest::Client,
    api: ApiConfig,
}

impl Fetcher {
    pub fn new(api: ApiConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs))
            .build()?;
        Ok(Self { client, api })
    }

    pub fn key(&self) -> FetchKey {
        FetchKey {
            url: self.api.url.clone(),
            years: self.api.years.clone(),
            counties: self.api.counties.clone(),
            sexes: self.api.sexes.clone(),
        }
    }

    pub async fn fetch(&self) -> Result<Dataset, FetchError> {
        let body = PxQuery::from_config(&self.api);
        info!("Fetching natural growth data from {}", self.api.url);

        let response = self.client.post(&self.api.url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            error!("Statistics API returned {}. Body: {}", status, text);
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let dataset = parse_observations(&text, &self.api)?;
        info!("Parsed {} observations", dataset.observations.len());
        Ok(dataset)
    }
}

enum Layout {
    Long {
        year: usize,
        county: usize,
        sex: usize,
        value: usize,
    },
    Wide {
        year: usize,
        county: usize,
        values: Vec<(usize, String)>,
    },
}

fn column_index(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}

fn detect_layout(headers: &StringRecord, api: &ApiConfig) -> Option<Layout> {
    let cols = &api.columns;
    let year = column_index(headers, &cols.year)?;
    let county = column_index(headers, &cols.county)?;

    if let (Some(sex), Some(value)) = (column_index(headers, &cols.sex), column_index(headers, &cols.value)) {
        return Some(Layout::Long { year, county, sex, value });
    }

    // Every requested sex needs its own value column in the wide layout.
    let wanted: Vec<(&String, &String)> = api
        .sex_columns
        .iter()
        .filter(|(_, sex)| api.sexes.is_empty() || api.sexes.contains(sex))
        .collect();
    if wanted.is_empty() {
        return None;
    }
    let values = wanted
        .into_iter()
        .map(|(column, sex)| Some((column_index(headers, column)?, sex.clone())))
        .collect::<Option<Vec<_>>>()?;
    Some(Layout::Wide { year, county, values })
}

fn expected_columns(api: &ApiConfig) -> Vec<String> {
    let cols = &api.columns;
    let mut expected = vec![cols.year.clone(), cols.county.clone(), cols.sex.clone(), cols.value.clone()];
    expected.extend(api.sex_columns.keys().cloned());
    expected
}

fn resolve_sex(raw: &str, api: &ApiConfig) -> String {
    let raw = raw.trim();
    if api.sex_labels.contains_key(raw) {
        return raw.to_string();
    }
    api.sex_labels
        .iter()
        .find(|(_, label)| label.to_lowercase() == raw.to_lowercase())
        .map(|(code, _)| code.clone())
        .unwrap_or_else(|| raw.to_string())
}

fn field<'a>(record: &'a StringRecord, idx: usize) -> &'a str {
    record.get(idx).unwrap_or("").trim()
}

fn invalid(record: &StringRecord, column: &str, value: &str) -> ParseError {
    ParseError::InvalidValue {
        line: record.position().map(|p| p.line()).unwrap_or(0),
        column: column.to_string(),
        value: value.to_string(),
    }
}

fn parse_value(record: &StringRecord, idx: usize, column: &str) -> Result<Option<i64>, ParseError> {
    let raw = field(record, idx);
    if MISSING_MARKERS.contains(&raw) {
        return Ok(None);
    }
    raw.parse::<i64>()
        .map(Some)
        .map_err(|_| invalid(record, column, raw))
}

/// Parses a PxWeb CSV payload (BOM-prefixed, comma or semicolon delimited)
/// against the declared column schema.
pub fn parse_observations(text: &str, api: &ApiConfig) -> Result<Dataset, ParseError> {
    let text = text.trim_start_matches('\u{feff}');
    let mut widest_header: Vec<String> = Vec::new();

    for delimiter in DELIMITERS {
        let mut rdr = ReaderBuilder::new()
            .delimiter(delimiter)
            .from_reader(text.as_bytes());
        let headers = rdr.headers()?.clone();

        let Some(layout) = detect_layout(&headers, api) else {
            if headers.len() > widest_header.len() {
                widest_header = headers.iter().map(|h| h.trim().to_string()).collect();
            }
            continue;
        };
        debug!("Detected CSV delimiter {:?}", delimiter as char);

        let mut observations = Vec::new();
        for result in rdr.records() {
            let record = result?;
            let (year_idx, county_idx) = match &layout {
                Layout::Long { year, county, .. } | Layout::Wide { year, county, .. } => (*year, *county),
            };

            let year_raw = field(&record, year_idx);
            let year: u16 = year_raw
                .parse()
                .map_err(|_| invalid(&record, &api.columns.year, year_raw))?;

            let county_raw = field(&record, county_idx);
            let Some(county) = counties::resolve(county_raw) else {
                debug!("Skipping row for unknown county '{}'", county_raw);
                continue;
            };

            let cells: Vec<(usize, String, &str)> = match &layout {
                Layout::Long { sex, value, .. } => {
                    vec![(*value, resolve_sex(field(&record, *sex), api), api.columns.value.as_str())]
                }
                Layout::Wide { values, .. } => {
                    values.iter().map(|(idx, sex)| (*idx, sex.clone(), headers.get(*idx).unwrap_or(""))).collect()
                }
            };

            for (idx, sex, column) in cells {
                match parse_value(&record, idx, column)? {
                    Some(value) => observations.push(Observation {
                        year,
                        county: county.clone(),
                        sex,
                        value,
                    }),
                    None => debug!("Missing value for {} {} sex {}", year, county, sex),
                }
            }
        }
        return Ok(Dataset {
            columns: headers.iter().map(|h| h.trim().to_string()).collect(),
            observations,
        });
    }

    Err(ParseError::MissingColumns {
        expected: expected_columns(api),
        found: widest_header,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use axum::{http::StatusCode, routing::post, Router};

    fn api() -> ApiConfig {
        ApiConfig::default()
    }

    #[test]
    fn comma_and_semicolon_payloads_agree() {
        let comma = "\u{feff}\"Aasta\",\"Maakond\",\"Sugu\",\"Loomulik iive\"\n\
                     2023,39,2,120\n2023,39,3,-30\n2022,37,2,400\n";
        let semicolon = "\u{feff}\"Aasta\";\"Maakond\";\"Sugu\";\"Loomulik iive\"\n\
                         2023;39;2;120\n2023;39;3;-30\n2022;37;2;400\n";

        let a = parse_observations(comma, &api()).unwrap().observations;
        let b = parse_observations(semicolon, &api()).unwrap().observations;
        assert_eq!(a.len(), 3);
        assert_eq!(a, b);
        assert_eq!(a[1], Observation::new(2023, "39", "3", -30).unwrap());
    }

    #[test]
    fn wide_layout_with_county_names() {
        let text = "\u{feff}\"Aasta\";\"Maakond\";\"Mehed Loomulik iive\";\"Naised Loomulik iive\"\n\
                    2023;\"Hiiu maakond\";-12;-5\n\
                    2023;\"Kogu Eesti\";-3000;-2000\n";
        let rows = parse_observations(text, &api()).unwrap().observations;
        assert_eq!(
            rows,
            vec![
                Observation::new(2023, "39", "2", -12).unwrap(),
                Observation::new(2023, "39", "3", -5).unwrap(),
            ]
        );
    }

    #[test]
    fn sex_labels_resolve_to_codes() {
        let text = "Aasta,Maakond,Sugu,Loomulik iive\n2021,Tartu maakond,Naised,14\n2021,78,mehed,..\n";
        let rows = parse_observations(text, &api()).unwrap().observations;
        assert_eq!(rows, vec![Observation::new(2021, "78", "3", 14).unwrap()]);
    }

    #[test]
    fn schema_mismatch_is_reported() {
        let text = "Year,Region,Value\n2023,39,1\n";
        match parse_observations(text, &api()) {
            Err(ParseError::MissingColumns { expected, found }) => {
                assert!(expected.contains(&"Aasta".to_string()));
                assert_eq!(found, vec!["Year", "Region", "Value"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn bad_number_reports_line() {
        let text = "Aasta,Maakond,Sugu,Loomulik iive\n2023,39,2,12\n2023,39,3,lots\n";
        match parse_observations(text, &api()) {
            Err(ParseError::InvalidValue { line, column, value }) => {
                assert_eq!(line, 3);
                assert_eq!(column, "Loomulik iive");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn query_body_matches_pxweb_shape() {
        let body = serde_json::to_value(PxQuery::from_config(&api())).unwrap();
        assert_eq!(body["response"]["format"], "csv");
        assert_eq!(body["query"][0]["code"], "Aasta");
        assert_eq!(body["query"][1]["selection"]["filter"], "item");
        assert_eq!(body["query"][1]["selection"]["values"].as_array().unwrap().len(), 15);
        assert_eq!(body["query"][2]["selection"]["values"][1], "3");
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/stat")
    }

    #[tokio::test]
    async fn fetch_parses_successful_response() {
        let app = Router::new().route(
            "/stat",
            post(|| async { "\u{feff}Aasta,Maakond,Sugu,Loomulik iive\n2023,39,2,120\n2023,39,3,-30\n" }),
        );
        let mut api = api();
        api.url = serve(app).await;

        let dataset = Fetcher::new(api).unwrap().fetch().await.unwrap();
        assert_eq!(dataset.columns, vec!["Aasta", "Maakond", "Sugu", "Loomulik iive"]);
        let rows = dataset.observations;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().map(|o| o.value).sum::<i64>(), 90);
    }

    #[tokio::test]
    async fn fetch_reports_http_status() {
        let app = Router::new().route(
            "/stat",
            post(|| async { (StatusCode::BAD_REQUEST, "bad query") }),
        );
        let mut api = api();
        api.url = serve(app).await;

        match Fetcher::new(api).unwrap().fetch().await {
            Err(FetchError::Status { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad query");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
