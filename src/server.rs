use crate::cache::TtlCache;
use crate::config::AppConfig;
use crate::counties::CountyCode;
use crate::data;
use crate::fetch::{Dataset, FetchKey, Fetcher};
use crate::processing::{self, PivotTable};
use crate::render::{self, ColorScale, MapKind, RenderOptions};
use crate::table;
use crate::types::{CountyLayer, JoinedCounty, MatchKind, Observation, Provenance};
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use geo::Rect;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

pub struct AppState {
    pub config: AppConfig,
    fetcher: Fetcher,
    datasets: Mutex<TtlCache<FetchKey, Arc<Dataset>>>,
    layer: RwLock<CountyLayer>,
}

impl AppState {
    pub fn new(config: AppConfig, layer: CountyLayer) -> Result<Self> {
        let fetcher = Fetcher::new(config.api.clone()).context("Failed to build HTTP client")?;
        let ttl = Duration::from_secs(config.server.cache_ttl_secs);
        Ok(Self {
            config,
            fetcher,
            datasets: Mutex::new(TtlCache::new(ttl)),
            layer: RwLock::new(layer),
        })
    }

    /// Cached for the configured TTL; failures are not cached.
    async fn dataset(&self) -> Result<Arc<Dataset>, String> {
        let mut cache = self.datasets.lock().await;
        let key = self.fetcher.key();
        if let Some(hit) = cache.get(&key) {
            return Ok(hit.clone());
        }
        cache.purge_expired();
        debug!("Dataset cache miss ({} live entries)", cache.len());

        let fetched = self.fetcher.fetch().await.map_err(|e| {
            warn!("Fetch failed: {}", e);
            e.to_string()
        })?;
        let fetched = Arc::new(fetched);
        cache.insert(key, fetched.clone());
        Ok(fetched)
    }
}

#[derive(Deserialize)]
pub struct YearQuery {
    year: Option<u16>,
}

// Everything one page render needs, computed in a single pass.
struct View {
    year: u16,
    rows: Vec<Observation>,
    joined: Vec<JoinedCounty>,
    pivot: PivotTable,
    columns: Vec<String>,
    observation_count: usize,
    layer_source: String,
    layer_provenance: Provenance,
    layer_bounds: Option<Rect<f64>>,
    name_field: String,
    code_field: Option<String>,
    fetch_error: Option<String>,
    warnings: Vec<String>,
}

async fn build_view(state: &AppState, year: Option<u16>) -> Result<View, AppError> {
    let mut warnings = Vec::new();

    let (dataset, fetch_error) = match state.dataset().await {
        Ok(dataset) => (dataset, None),
        Err(e) => {
            warnings.push(format!("Failed to fetch data: {e}"));
            (Arc::new(Dataset::default()), Some(e))
        }
    };
    let observations = &dataset.observations;

    // Requested year, else the newest configured one, else the newest in the data.
    let years = processing::available_years(observations);
    let year = year
        .or_else(|| state.config.api.latest_year())
        .or_else(|| years.last().copied())
        .ok_or_else(|| AppError(StatusCode::BAD_REQUEST, "No year requested and none configured".into()))?;
    if !years.is_empty() && !years.contains(&year) {
        warnings.push(format!("No data for {year}."));
    }

    let layer = state.layer.read().await;
    if layer.provenance == Provenance::Placeholder {
        warnings.push("No county geometry loaded; showing a bar chart instead of a map.".into());
    } else if !layer.has_geometry() {
        warnings.push(format!("{} has no polygon geometry; showing a bar chart instead of a map.", layer.source));
    }

    let values = processing::aggregate_by_county(observations, year);
    let joined = processing::join(&layer, &values);
    if !values.is_empty() && joined.iter().all(|c| c.matched == MatchKind::Unmatched) {
        warnings.push(format!(
            "No county in the geometry (field '{}') matched the statistics data.",
            layer.name_field
        ));
    }

    Ok(View {
        year,
        rows: processing::year_rows(observations, year),
        pivot: processing::pivot(observations, year, &state.config.api.sexes),
        joined,
        columns: dataset.columns.clone(),
        observation_count: observations.len(),
        layer_source: layer.source.clone(),
        layer_provenance: layer.provenance,
        layer_bounds: layer.bounds(),
        name_field: layer.name_field.clone(),
        code_field: layer.code_field.clone(),
        fetch_error,
        warnings,
    })
}

pub struct AppError(StatusCode, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
    }
}

// Oversized bodies keep their 413 instead of collapsing into a 400.
impl From<MultipartError> for AppError {
    fn from(e: MultipartError) -> Self {
        warn!("Geometry upload rejected: {}", e.body_text());
        AppError(e.status(), e.body_text())
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.server.max_upload_mb.saturating_mul(1024 * 1024);

    Router::new()
        .route("/", get(index_handler))
        .route("/map.png", get(map_handler))
        .route("/download.csv", get(download_handler))
        .route("/api/counties", get(counties_handler))
        .route("/geometry", post(upload_handler).layer(DefaultBodyLimit::max(upload_limit)))
        .route("/healthz", get(|| async { "ok" }))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(config: AppConfig) -> Result<()> {
    let layer = match data::load_layer(&config.geometry).await {
        Ok(layer) => layer,
        Err(e) => {
            warn!("{}; using placeholder county list", e);
            CountyLayer::placeholder()
        }
    };

    let port = config.server.port;
    let state = Arc::new(AppState::new(config, layer)?);
    let app = build_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting dashboard on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<YearQuery>,
) -> Result<Html<String>, AppError> {
    let view = build_view(&state, params.year).await?;
    let scale = ColorScale::from_values(view.joined.iter().filter_map(|c| c.value));
    Ok(Html(render_page(&state.config, &view, scale)))
}

async fn map_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<YearQuery>,
) -> Result<Response, AppError> {
    let view = build_view(&state, params.year).await?;
    let options = RenderOptions::from(&state.config.output).with_title(format!("Loomulik iive {}", view.year));
    let png = render::render(&view.joined, &options)?.to_png()?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<YearQuery>,
) -> Result<Response, AppError> {
    let view = build_view(&state, params.year).await?;
    if let Some(e) = view.fetch_error {
        return Err(AppError(StatusCode::BAD_GATEWAY, format!("Failed to fetch data: {e}")));
    }

    let mut body = Vec::new();
    table::write_observations_csv(&view.rows, &state.config.api, &mut body)?;
    let disposition = format!("attachment; filename=\"loomulik_iive_{}.csv\"", view.year);
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

#[derive(Serialize, Deserialize)]
pub struct CountyRow {
    pub name: String,
    pub code: Option<CountyCode>,
    pub value: Option<i64>,
    pub matched: MatchKind,
    pub has_geometry: bool,
}

#[derive(Serialize, Deserialize)]
pub struct CountiesResponse {
    pub year: u16,
    pub provenance: Provenance,
    pub counties: Vec<CountyRow>,
    pub warnings: Vec<String>,
}

async fn counties_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<YearQuery>,
) -> Result<Json<CountiesResponse>, AppError> {
    let view = build_view(&state, params.year).await?;
    Ok(Json(CountiesResponse {
        year: view.year,
        provenance: view.layer_provenance,
        counties: view
            .joined
            .into_iter()
            .map(|c| CountyRow {
                has_geometry: c.geometry.is_some(),
                name: c.name,
                code: c.code,
                value: c.value,
                matched: c.matched,
            })
            .collect(),
        warnings: view.warnings,
    }))
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Redirect, AppError> {
    let bad_request = |msg: String| AppError(StatusCode::BAD_REQUEST, msg);

    while let Some(field) = multipart.next_field().await? {
        let source = field.file_name().unwrap_or("upload").to_string();
        let bytes = field.bytes().await?;
        if bytes.is_empty() {
            continue;
        }

        let layer = data::parse_geojson(&bytes, &source, &state.config.geometry)
            .map_err(|e| bad_request(format!("Error loading GeoJSON: {e}")))?;
        info!(
            "Uploaded geometry {} ({} bytes, {} features, name field '{}')",
            source,
            bytes.len(),
            layer.shapes.len(),
            layer.name_field
        );
        *state.layer.write().await = layer;
        return Ok(Redirect::to("/"));
    }

    Err(bad_request("No GeoJSON file in upload".into()))
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_page(config: &AppConfig, view: &View, scale: Option<ColorScale>) -> String {
    let year = view.year;
    let mut html = format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>Loomulik iive {year}</title></head><body>\
         <h1>Loomulik iive maakonniti aastal {year}</h1>"
    );

    for warning in &view.warnings {
        html.push_str(&format!("<p class=\"warning\">{}</p>", escape_html(warning)));
    }

    html.push_str("<form method=\"get\" action=\"/\"><label>Aasta <select name=\"year\" onchange=\"this.form.submit()\">");
    for y in &config.api.years {
        let selected = if y.parse::<u16>().ok() == Some(year) { " selected" } else { "" };
        html.push_str(&format!("<option value=\"{0}\"{1}>{0}</option>", escape_html(y), selected));
    }
    html.push_str("</select></label> <button type=\"submit\">Show</button></form>");

    html.push_str(
        "<form method=\"post\" action=\"/geometry\" enctype=\"multipart/form-data\">\
         <label>GeoJSON <input type=\"file\" name=\"file\" accept=\".geojson,.json\"></label> \
         <button type=\"submit\">Upload</button></form>",
    );

    if !view.pivot.rows.is_empty() {
        html.push_str(&format!("<p class=\"metric\">Kokku: <strong>{}</strong></p>", view.pivot.grand_total()));
    }

    let kind = if view.joined.iter().any(|c| c.geometry.is_some()) { MapKind::Choropleth } else { MapKind::Bars };
    html.push_str(&format!("<img src=\"/map.png?year={year}\" alt=\"{kind:?} for {year}\">"));
    if let Some(scale) = scale {
        html.push_str(&format!(
            "<p class=\"legend\">Legend: {:.0} (red) to {:.0} (blue){}; grey = no data</p>",
            scale.min,
            scale.max,
            if scale.diverging { ", centred on 0" } else { "" }
        ));
    }

    html.push_str("<h2>Data Table</h2>");
    if view.pivot.rows.is_empty() {
        html.push_str("<p>No data available.</p>");
    } else {
        html.push_str("<table><thead><tr><th>Maakond</th>");
        for sex in &view.pivot.sexes {
            html.push_str(&format!("<th>{}</th>", escape_html(config.api.sex_label(sex))));
        }
        html.push_str("<th>Kokku</th></tr></thead><tbody>");
        for row in &view.pivot.rows {
            html.push_str(&format!("<tr><td>{}</td>", escape_html(&row.county)));
            for sex in &view.pivot.sexes {
                let cell = row.by_sex.get(sex).map(|v| v.to_string()).unwrap_or_default();
                html.push_str(&format!("<td>{cell}</td>"));
            }
            html.push_str(&format!("<td>{}</td></tr>", row.total));
        }
        html.push_str("</tbody></table>");
        html.push_str(&format!(
            "<p><a href=\"/download.csv?year={year}\">Download CSV</a> ({} rows)</p>",
            view.rows.len()
        ));
    }

    html.push_str(&render_debug(view));
    html.push_str("</body></html>");
    html
}

fn render_debug(view: &View) -> String {
    let bounds = match view.layer_bounds {
        Some(b) => format!("[{:.4}, {:.4}, {:.4}, {:.4}]", b.min().x, b.min().y, b.max().x, b.max().y),
        None => "none".to_string(),
    };
    let columns = if view.columns.is_empty() {
        "none".to_string()
    } else {
        view.columns.iter().map(|c| escape_html(c)).collect::<Vec<_>>().join(", ")
    };

    format!(
        "<h2>Debug Information</h2><ul class=\"debug\">\
         <li>Geometry: {} ({} features{})</li>\
         <li>Name field: {}; code field: {}</li>\
         <li>Geometry bounds: {}</li>\
         <li>Data: {} observations, {} rows for {}</li>\
         <li>Columns: {}</li>\
         </ul>",
        escape_html(&view.layer_source),
        view.joined.len(),
        if view.layer_provenance == Provenance::Placeholder { ", placeholder" } else { "" },
        escape_html(&view.name_field),
        escape_html(view.code_field.as_deref().unwrap_or("none")),
        bounds,
        view.observation_count,
        view.rows.len(),
        view.year,
        columns,
    )
}
