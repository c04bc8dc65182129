use crate::config::ApiConfig;
use crate::processing::PivotTable;
use crate::types::Observation;
use anyhow::Result;
use std::io::Write;

/// Year-filtered observations, one row per county and sex.
pub fn write_observations_csv<W: Write>(rows: &[Observation], api: &ApiConfig, writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(["year", "county_code", "county", "sex", "value"])?;
    for obs in rows {
        let county = obs.county.canonical_name().unwrap_or(obs.county.as_str());
        wtr.write_record([
            obs.year.to_string(),
            obs.county.to_string(),
            county.to_string(),
            api.sex_label(&obs.sex).to_string(),
            obs.value.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_pivot_csv<W: Write>(table: &PivotTable, api: &ApiConfig, writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);

    let mut header = vec!["county".to_string()];
    header.extend(table.sexes.iter().map(|s| api.sex_label(s).to_string()));
    header.push("total".to_string());
    wtr.write_record(&header)?;

    for row in &table.rows {
        let mut record = vec![row.county.clone()];
        record.extend(
            table.sexes.iter().map(|s| row.by_sex.get(s).map(|v| v.to_string()).unwrap_or_default()),
        );
        record.push(row.total.to_string());
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::pivot;

    fn rows() -> Vec<Observation> {
        vec![
            Observation::new(2023, "39", "2", 120).unwrap(),
            Observation::new(2023, "39", "3", -30).unwrap(),
            Observation::new(2023, "37", "2", 5).unwrap(),
        ]
    }

    #[test]
    fn observations_use_names_and_labels() {
        let mut out = Vec::new();
        write_observations_csv(&rows(), &ApiConfig::default(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "year,county_code,county,sex,value");
        assert_eq!(lines[1], "2023,39,Hiiu maakond,Mehed,120");
        assert_eq!(lines[2], "2023,39,Hiiu maakond,Naised,-30");
    }

    #[test]
    fn pivot_leaves_absent_cells_blank() {
        let api = ApiConfig::default();
        let table = pivot(&rows(), 2023, &api.sexes);
        let mut out = Vec::new();
        write_pivot_csv(&table, &api, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "county,Mehed,Naised,total\nHiiu maakond,120,-30,90\nHarju maakond,5,,5\n"
        );
    }
}
