//! Per-well comparison of treatment probabilities against the negative
//! controls of the same plate and model.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use polars::prelude::*;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::analysis::ks::ks_2samp;
use crate::classification::profiles::phenotype_columns;
use crate::config::{ComparisonRun, PipelineConfig};
use crate::data_handling::annotations::{
    Annotations, CELL_LINE_COLUMN, CONTROL_TYPE_COLUMN, NEGATIVE_CONTROL, NO_REAGENT, REAGENT_COLUMN,
};
use crate::helper_functions::{f64_values, files_with_suffix, read_csv_gz, str_values, write_parquet};
use crate::models::{METADATA_PLATE, METADATA_WELL};
use crate::preprocessing::merge::normalize_image_keys;

pub const MODEL_TYPE: &str = "Metadata_Model_Type";
pub const COMPARISON_METRIC: &str = "ks_statistic";

/// Columns identifying one treatment group, in output order.
pub const GROUP_COLUMNS: [&str; 5] = [
    METADATA_PLATE,
    REAGENT_COLUMN,
    MODEL_TYPE,
    CELL_LINE_COLUMN,
    METADATA_WELL,
];

/// Reads every probability file of one run and tags it with the run label.
pub fn load_probabilities(dir: &Path, label: &str) -> PolarsResult<DataFrame> {
    let mut all: Option<DataFrame> = None;
    for path in files_with_suffix(dir, ".csv.gz")? {
        let mut df = read_csv_gz(&path)?;
        normalize_image_keys(&mut df)?;
        let metadata: Vec<String> = df
            .get_column_names()
            .iter()
            .filter(|c| c.contains("Metadata"))
            .map(|c| c.to_string())
            .collect();
        for name in metadata {
            let s = df.column(&name)?.cast(&DataType::String)?;
            df.with_column(s)?;
        }
        match all.as_mut() {
            Some(a) => {
                a.vstack_mut(&df)?;
            }
            None => all = Some(df),
        }
    }
    let mut df = all.ok_or_else(|| {
        PolarsError::ComputeError(format!("no probability files in {}", dir.display()).into())
    })?;
    let height = df.height();
    df.with_column(Column::new(MODEL_TYPE.into(), vec![label.to_string(); height]))?;
    info!("Loaded {} cells for run {}", height, label);
    Ok(df)
}

/// Adds reagent, cell line and control type of every cell's well.
pub fn annotate(df: &DataFrame, annotations: &Annotations) -> PolarsResult<DataFrame> {
    let plates = str_values(df, METADATA_PLATE)?;
    let wells = str_values(df, METADATA_WELL)?;
    let mut reagents: Vec<Option<String>> = Vec::with_capacity(df.height());
    let mut cell_lines: Vec<Option<String>> = Vec::with_capacity(df.height());
    let mut control_types: Vec<Option<String>> = Vec::with_capacity(df.height());
    for (plate, well) in plates.iter().zip(&wells) {
        reagents.push(annotations.lookup(plate, well)?.reagent.clone());
        cell_lines.push(annotations.cell_line(plate, well)?.map(str::to_string));
        control_types.push(annotations.control_type(plate, well)?.map(str::to_string));
    }
    let mut out = df.clone();
    out.with_column(Series::new(REAGENT_COLUMN.into(), reagents))?;
    out.with_column(Series::new(CELL_LINE_COLUMN.into(), cell_lines))?;
    out.with_column(Series::new(CONTROL_TYPE_COLUMN.into(), control_types))?;
    Ok(out)
}

fn is_treatment(control_type: &str) -> bool {
    control_type != NEGATIVE_CONTROL && control_type != NO_REAGENT
}

/// Two-sample KS test of every treatment well against the negative controls
/// of its plate and model type, one row per (group, phenotype).
pub fn compare_wells(
    df: &DataFrame,
    phenotypes: &[String],
    downsample_seed: Option<u64>,
) -> PolarsResult<DataFrame> {
    let keys: Vec<Vec<String>> = GROUP_COLUMNS
        .iter()
        .map(|c| str_values(df, c))
        .collect::<PolarsResult<_>>()?;
    let control_types = str_values(df, CONTROL_TYPE_COLUMN)?;
    // rows missing any group key belong to no group
    let mut missing_key = vec![false; df.height()];
    for c in GROUP_COLUMNS {
        let nulls = df.column(c)?.is_null();
        for (missing, null) in missing_key.iter_mut().zip(&nulls) {
            *missing |= null.unwrap_or(false);
        }
    }
    let values: Vec<Vec<f64>> = phenotypes
        .iter()
        .map(|p| f64_values(df, p))
        .collect::<PolarsResult<_>>()?;

    // (plate, model type) -> negative-control rows
    let mut negatives: HashMap<(&str, &str), Vec<usize>> = HashMap::new();
    let mut groups: BTreeMap<Vec<&str>, Vec<usize>> = BTreeMap::new();
    let mut skipped = 0usize;
    for row in 0..df.height() {
        let plate = keys[0][row].as_str();
        let model = keys[2][row].as_str();
        if control_types[row] == NEGATIVE_CONTROL {
            negatives.entry((plate, model)).or_default().push(row);
        } else if is_treatment(&control_types[row]) {
            if missing_key[row] {
                skipped += 1;
                continue;
            }
            let key: Vec<&str> = keys.iter().map(|k| k[row].as_str()).collect();
            groups.entry(key).or_default().push(row);
        }
    }

    if skipped > 0 {
        warn!("{} treatment cells lack a reagent, cell line or well and were not compared", skipped);
    }

    let mut rng = downsample_seed.map(StdRng::seed_from_u64);
    let mut group_values: Vec<Vec<String>> = vec![Vec::new(); GROUP_COLUMNS.len()];
    let mut phenotype_col = Vec::new();
    let mut statistic_col = Vec::new();
    let mut p_value_col = Vec::new();

    for (key, rows) in &groups {
        let Some(controls) = negatives.get(&(key[0], key[2])) else {
            warn!("No negative controls for plate {} model {}, skipping well {}", key[0], key[2], key[4]);
            continue;
        };
        let controls: Vec<usize> = match rng.as_mut() {
            Some(rng) if controls.len() > rows.len() => sample(rng, controls.len(), rows.len())
                .into_iter()
                .map(|i| controls[i])
                .collect(),
            _ => controls.clone(),
        };

        for (p, phenotype) in phenotypes.iter().enumerate() {
            let treated: Vec<f64> = rows.iter().map(|&r| values[p][r]).collect();
            let control: Vec<f64> = controls.iter().map(|&r| values[p][r]).collect();
            let Some(result) = ks_2samp(&control, &treated) else {
                continue;
            };
            for (column, k) in group_values.iter_mut().zip(key) {
                column.push(k.to_string());
            }
            phenotype_col.push(phenotype.clone());
            statistic_col.push(result.statistic);
            p_value_col.push(result.p_value);
        }
    }

    let n = phenotype_col.len();
    let mut columns: Vec<Column> = GROUP_COLUMNS
        .iter()
        .zip(group_values)
        .map(|(name, v)| Column::new((*name).into(), v))
        .collect();
    columns.push(Column::new("phenotype".into(), phenotype_col));
    columns.push(Column::new("comparison_metric".into(), vec![COMPARISON_METRIC; n]));
    columns.push(Column::new("comparison_metric_value".into(), statistic_col));
    columns.push(Column::new("p_value".into(), p_value_col));
    DataFrame::new(columns)
}

pub fn comparisons_path(config: &PipelineConfig) -> PathBuf {
    config.comparisons_dir().join(&config.comparison.output_file)
}

fn load_runs(runs: &[ComparisonRun]) -> PolarsResult<DataFrame> {
    let mut all: Option<DataFrame> = None;
    for run in runs {
        let df = load_probabilities(&run.probabilities_dir, &run.label)?;
        match all.as_mut() {
            Some(a) => {
                a.vstack_mut(&df)?;
            }
            None => all = Some(df),
        }
    }
    all.ok_or_else(|| PolarsError::ComputeError("no comparison runs configured".into()))
}

/// Loads the configured runs, tests every treatment well and writes the
/// result table as Parquet.
pub fn run_well_comparisons(
    config: &PipelineConfig,
    annotations: &Annotations,
) -> PolarsResult<Option<PathBuf>> {
    let output = comparisons_path(config);
    if output.is_file() {
        info!("Well comparisons already at {}", output.display());
        return Ok(None);
    }
    let runs: Vec<ComparisonRun> = config
        .comparison
        .runs
        .iter()
        .filter(|r| {
            let present = r.probabilities_dir.is_dir();
            if !present {
                warn!("Probabilities for run {} not found at {}", r.label, r.probabilities_dir.display());
            }
            present
        })
        .cloned()
        .collect();
    if runs.is_empty() {
        return Ok(None);
    }

    let probabilities = load_runs(&runs)?;
    let phenotypes = phenotype_columns(&probabilities);
    let annotated = annotate(&probabilities, annotations)?;
    let seed = config.comparison.downsample_controls.then_some(config.comparison.seed);
    let mut results = compare_wells(&annotated, &phenotypes, seed)?;

    info!("Saving {} well comparisons to {}", results.height(), output.display());
    write_parquet(&mut results, &output)?;
    Ok(Some(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper_functions::write_csv_gz;
    use polars::df;

    fn annotations() -> Annotations {
        Annotations::from_dataframe(
            &df![
                "Plate" => &["SQ1", "SQ1", "SQ1", "SQ1"],
                "Well" => &["A1", "B1", "C1", "D1"],
                "Reagent Identifier" => &[Some("EMPTY"), Some("KRAS-1"), None, Some("TP53-2")],
                "Control Type" => &[Some("negative"), None, Some("no reagent"), None],
                "Characteristics [Cell Line]" => &["A549", "A549", "A549", "A549"]
            ]
            .unwrap(),
        )
        .unwrap()
    }

    fn probabilities() -> DataFrame {
        df![
            "Metadata_Plate" => &["SQ1"; 9],
            "Metadata_Well" => &["A1", "A1", "A1", "A1", "B1", "B1", "C1", "D1", "D1"],
            "Location_Center_X" => &[1.0; 9],
            "Location_Center_Y" => &[1.0; 9],
            "Mitosis" => &[0.1, 0.2, 0.3, 0.4, 0.8, 0.9, 0.5, 0.15, 0.35],
            "Interphase" => &[0.9, 0.8, 0.7, 0.6, 0.2, 0.1, 0.5, 0.85, 0.65]
        ]
        .unwrap()
    }

    #[test]
    fn treatments_are_tested_against_plate_negatives() {
        let mut df = probabilities();
        df.with_column(Column::new(MODEL_TYPE.into(), vec!["final"; 9])).unwrap();
        let phenotypes = phenotype_columns(&df);
        assert_eq!(phenotypes, vec!["Mitosis", "Interphase"]);

        let annotated = annotate(&df, &annotations()).unwrap();
        let results = compare_wells(&annotated, &phenotypes, None).unwrap();

        // B1 and D1 are treatments, C1 (no reagent) and A1 (negative) are not
        assert_eq!(results.height(), 4);
        assert_eq!(str_values(&results, "Metadata_Well").unwrap(), vec!["B1", "B1", "D1", "D1"]);
        assert_eq!(
            str_values(&results, "Reagent Identifier").unwrap(),
            vec!["KRAS-1", "KRAS-1", "TP53-2", "TP53-2"]
        );
        assert_eq!(str_values(&results, "comparison_metric").unwrap(), vec!["ks_statistic"; 4]);

        let stats = f64_values(&results, "comparison_metric_value").unwrap();
        // B1 lies entirely above the controls
        assert_eq!(stats[0], 1.0);
        // 4 controls vs 2 treated: 2 of C(6, 2) = 15 paths separate fully
        let p = f64_values(&results, "p_value").unwrap();
        assert!((p[0] - 2.0 / 15.0).abs() < 1e-12);
        assert!(stats[2] < 1.0);
    }

    #[test]
    fn treatment_wells_without_reagent_are_not_grouped() {
        let annotations = Annotations::from_dataframe(
            &df![
                "Plate" => &["SQ1", "SQ1", "SQ1"],
                "Well" => &["A1", "B1", "D1"],
                "Reagent Identifier" => &[Some("EMPTY"), Some("KRAS-1"), None],
                "Control Type" => &[Some("negative"), None, None],
                "Characteristics [Cell Line]" => &["A549", "A549", "A549"]
            ]
            .unwrap(),
        )
        .unwrap();
        let mut df = probabilities().filter(&BooleanChunked::from_slice(
            "keep".into(),
            &[true, true, true, true, true, true, false, true, true],
        ))
        .unwrap();
        df.with_column(Column::new(MODEL_TYPE.into(), vec!["final"; 8])).unwrap();

        let annotated = annotate(&df, &annotations).unwrap();
        let results = compare_wells(&annotated, &["Mitosis".to_string()], None).unwrap();
        assert_eq!(str_values(&results, "Metadata_Well").unwrap(), vec!["B1"]);
        assert_eq!(str_values(&results, "Reagent Identifier").unwrap(), vec!["KRAS-1"]);
    }

    #[test]
    fn downsampling_is_reproducible() {
        let mut df = probabilities();
        df.with_column(Column::new(MODEL_TYPE.into(), vec!["final"; 9])).unwrap();
        let annotated = annotate(&df, &annotations()).unwrap();
        let phenotypes = vec!["Mitosis".to_string()];
        let a = compare_wells(&annotated, &phenotypes, Some(42)).unwrap();
        let b = compare_wells(&annotated, &phenotypes, Some(42)).unwrap();
        assert!(a.equals(&b));
        assert_eq!(a.height(), 2);
    }

    #[test]
    fn runs_are_labelled_and_written_as_parquet() {
        let root = tempfile::tempdir().unwrap();
        let final_dir = root.path().join("final");
        let shuffled_dir = root.path().join("shuffled");
        let mut probas = probabilities();
        write_csv_gz(&mut probas, &final_dir.join("SQ1__cell_classifications.csv.gz")).unwrap();
        write_csv_gz(&mut probas, &shuffled_dir.join("SQ1__cell_classifications.csv.gz")).unwrap();

        let mut config = PipelineConfig { output_root: root.path().join("out"), ..PipelineConfig::default() };
        config.comparison.runs = vec![
            ComparisonRun { label: "final".into(), probabilities_dir: final_dir },
            ComparisonRun { label: "shuffled".into(), probabilities_dir: shuffled_dir },
        ];

        let path = run_well_comparisons(&config, &annotations()).unwrap().unwrap();
        let results = ParquetReader::new(std::fs::File::open(&path).unwrap()).finish().unwrap();
        // 2 treatment wells x 2 phenotypes x 2 runs
        assert_eq!(results.height(), 8);
        let models = str_values(&results, MODEL_TYPE).unwrap();
        assert_eq!(models.iter().filter(|m| *m == "shuffled").count(), 4);

        assert!(run_well_comparisons(&config, &annotations()).unwrap().is_none());
    }
}
