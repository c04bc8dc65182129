use crate::counties::{self, CountyCode};
use crate::types::{CountyLayer, JoinedCounty, MatchKind, Observation};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{info, warn};

/// Sums each county's observations for `year` across sex categories.
pub fn aggregate_by_county(observations: &[Observation], year: u16) -> BTreeMap<CountyCode, i64> {
    let mut totals = BTreeMap::new();
    for obs in observations.iter().filter(|o| o.year == year) {
        *totals.entry(obs.county.clone()).or_insert(0) += obs.value;
    }
    totals
}

/// Attaches aggregated values to every shape in the layer. Code matches are
/// taken first; remaining shapes are bridged by normalised county name.
/// Shapes with no match keep `value: None`.
pub fn join(layer: &CountyLayer, values: &BTreeMap<CountyCode, i64>) -> Vec<JoinedCounty> {
    let mut joined: Vec<JoinedCounty> = layer
        .shapes
        .iter()
        .map(|shape| JoinedCounty {
            name: shape.name.clone(),
            code: shape.code.clone(),
            geometry: shape.geometry.clone(),
            value: None,
            matched: MatchKind::Unmatched,
        })
        .collect();

    // 1. Code-keyed
    let mut claimed: HashSet<&CountyCode> = HashSet::new();
    for row in joined.iter_mut() {
        if let Some((code, value)) = row.code.as_ref().and_then(|c| values.get_key_value(c)) {
            row.value = Some(*value);
            row.matched = MatchKind::ByCode;
            claimed.insert(code);
        }
    }

    // 2. Name-keyed, via the canonical name of each remaining code
    let mut by_name: HashMap<String, usize> = HashMap::new();
    for (idx, row) in joined.iter().enumerate() {
        if row.matched == MatchKind::Unmatched {
            by_name.entry(counties::normalize_name(&row.name)).or_insert(idx);
        }
    }
    for (code, value) in values.iter().filter(|(code, _)| !claimed.contains(code)) {
        let Some(canonical) = code.canonical_name() else { continue };
        if let Some(&idx) = by_name.get(&counties::normalize_name(canonical)) {
            joined[idx].value = Some(*value);
            joined[idx].matched = MatchKind::ByName;
        }
    }

    let matched = joined.iter().filter(|r| r.matched != MatchKind::Unmatched).count();
    if matched == 0 && !values.is_empty() {
        warn!("No county in {} matched the statistics data", layer.source);
    } else {
        info!("Joined {} of {} counties", matched, joined.len());
    }

    joined
}

#[derive(Debug, Clone, Serialize)]
pub struct PivotRow {
    pub county: String,
    pub code: CountyCode,
    pub by_sex: BTreeMap<String, i64>,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PivotTable {
    pub year: u16,
    pub sexes: Vec<String>,
    pub rows: Vec<PivotRow>,
}

impl PivotTable {
    pub fn grand_total(&self) -> i64 {
        self.rows.iter().map(|r| r.total).sum()
    }
}

/// Counties × sex categories for one year, with a total column, sorted by
/// total descending.
pub fn pivot(observations: &[Observation], year: u16, sex_order: &[String]) -> PivotTable {
    let mut cells: BTreeMap<CountyCode, BTreeMap<String, i64>> = BTreeMap::new();
    let mut seen_sexes: BTreeSet<String> = BTreeSet::new();

    for obs in observations.iter().filter(|o| o.year == year) {
        *cells
            .entry(obs.county.clone())
            .or_default()
            .entry(obs.sex.clone())
            .or_insert(0) += obs.value;
        seen_sexes.insert(obs.sex.clone());
    }

    let mut sexes: Vec<String> = sex_order.iter().filter(|s| seen_sexes.contains(*s)).cloned().collect();
    sexes.extend(seen_sexes.into_iter().filter(|s| !sex_order.contains(s)));

    let mut rows: Vec<PivotRow> = cells
        .into_iter()
        .map(|(code, by_sex)| PivotRow {
            county: code.canonical_name().unwrap_or(code.as_str()).to_string(),
            total: by_sex.values().sum(),
            code,
            by_sex,
        })
        .collect();
    rows.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.county.cmp(&b.county)));

    PivotTable { year, sexes, rows }
}

pub fn year_rows(observations: &[Observation], year: u16) -> Vec<Observation> {
    observations.iter().filter(|o| o.year == year).cloned().collect()
}

pub fn available_years(observations: &[Observation]) -> Vec<u16> {
    observations
        .iter()
        .map(|o| o.year)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
