//! Pretrained logistic-regression phenotype classifiers, stored as JSON
//! (`classes`, `coef`, `intercept`, `multi_class`).

use std::fmt;
use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::{polars_err, FEATURE_MARKER};

/// Feature subset a classifier was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureType {
    CP,
    DP,
    CPAndDP,
    CPAreaShapeOnly,
    CPZernikeOnly,
}

impl FeatureType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "CP" => Some(FeatureType::CP),
            "DP" => Some(FeatureType::DP),
            "CP_and_DP" => Some(FeatureType::CPAndDP),
            "CP_areashape_only" => Some(FeatureType::CPAreaShapeOnly),
            "CP_zernike_only" => Some(FeatureType::CPZernikeOnly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::CP => "CP",
            FeatureType::DP => "DP",
            FeatureType::CPAndDP => "CP_and_DP",
            FeatureType::CPAreaShapeOnly => "CP_areashape_only",
            FeatureType::CPZernikeOnly => "CP_zernike_only",
        }
    }

    pub fn selects(&self, column: &str) -> bool {
        match self {
            FeatureType::CP => column.contains("CP__"),
            FeatureType::DP => column.contains("DP__"),
            FeatureType::CPAndDP => column.contains(FEATURE_MARKER),
            FeatureType::CPAreaShapeOnly => column.contains("CP__AreaShape_"),
            FeatureType::CPZernikeOnly => column.contains("CP__") && column.contains("Zernike"),
        }
    }

    /// Matching columns of `df`, in table order.
    pub fn feature_columns(&self, df: &DataFrame) -> Vec<String> {
        df.get_column_names()
            .iter()
            .filter(|c| self.selects(c))
            .map(|c| c.to_string())
            .collect()
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiClass {
    #[default]
    Multinomial,
    Ovr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhenotypeClassifier {
    pub classes: Vec<String>,
    /// One row per class (a single row for binary models).
    pub coef: Vec<Vec<f64>>,
    pub intercept: Vec<f64>,
    #[serde(default)]
    pub multi_class: MultiClass,
    /// Training column order; when absent, the feature type decides.
    #[serde(default)]
    pub feature_names: Option<Vec<String>>,
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl PhenotypeClassifier {
    pub fn load(path: &Path) -> PolarsResult<Self> {
        let json = std::fs::read_to_string(path)?;
        let model: PhenotypeClassifier =
            serde_json::from_str(&json).map_err(|e| polars_err(Box::new(e)))?;
        model.validate()?;
        Ok(model)
    }

    pub fn n_features(&self) -> usize {
        self.coef.first().map(Vec::len).unwrap_or(0)
    }

    fn is_binary(&self) -> bool {
        self.coef.len() == 1 && self.classes.len() == 2
    }

    pub fn validate(&self) -> PolarsResult<()> {
        let rows_ok = self.is_binary() || self.coef.len() == self.classes.len();
        let widths_ok = self.coef.iter().all(|r| r.len() == self.n_features());
        if !rows_ok || !widths_ok || self.intercept.len() != self.coef.len() || self.classes.is_empty() {
            return Err(PolarsError::ShapeMismatch(
                format!(
                    "classifier with {} classes has {} coefficient rows and {} intercepts",
                    self.classes.len(),
                    self.coef.len(),
                    self.intercept.len()
                )
                .into(),
            ));
        }
        if let Some(names) = &self.feature_names {
            if names.len() != self.n_features() {
                return Err(PolarsError::ShapeMismatch(
                    format!("{} feature names for {} coefficients", names.len(), self.n_features())
                        .into(),
                ));
            }
        }
        Ok(())
    }

    fn decision_function(&self, x: &Array2<f64>) -> PolarsResult<Array2<f64>> {
        if x.ncols() != self.n_features() {
            return Err(PolarsError::ShapeMismatch(
                format!("{} features given, model expects {}", x.ncols(), self.n_features()).into(),
            ));
        }
        let mut coef = Array2::<f64>::zeros((self.coef.len(), self.n_features()));
        for (i, row) in self.coef.iter().enumerate() {
            for (j, &w) in row.iter().enumerate() {
                coef[[i, j]] = w;
            }
        }
        let intercept = Array1::from(self.intercept.clone());
        Ok(x.dot(&coef.t()) + &intercept)
    }

    /// Class probabilities, one row per sample and one column per class.
    pub fn predict_proba(&self, x: &Array2<f64>) -> PolarsResult<Array2<f64>> {
        let scores = self.decision_function(x)?;
        let n = x.nrows();

        if self.is_binary() {
            let mut probas = Array2::<f64>::zeros((n, 2));
            for (i, &z) in scores.column(0).iter().enumerate() {
                let p = sigmoid(z);
                probas[[i, 0]] = 1.0 - p;
                probas[[i, 1]] = p;
            }
            return Ok(probas);
        }

        let mut probas = scores;
        match self.multi_class {
            MultiClass::Multinomial => {
                for mut row in probas.axis_iter_mut(Axis(0)) {
                    let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
                    row.mapv_inplace(|v| (v - max).exp());
                    let sum = row.sum();
                    row.mapv_inplace(|v| v / sum);
                }
            }
            MultiClass::Ovr => {
                for mut row in probas.axis_iter_mut(Axis(0)) {
                    row.mapv_inplace(sigmoid);
                    let sum = row.sum();
                    if sum > 0.0 {
                        row.mapv_inplace(|v| v / sum);
                    }
                }
            }
        }
        Ok(probas)
    }
}

/// `<model_type>__<feature_type>.json`, e.g. `final__CP_areashape_only.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelName {
    pub model_type: String,
    pub feature_type: FeatureType,
}

impl ModelName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".json")?;
        let mut parts = stem.split("__");
        let model_type = parts.next()?.to_string();
        let feature_type = FeatureType::parse(parts.next()?)?;
        Some(ModelName { model_type, feature_type })
    }

    pub fn dir_name(&self) -> String {
        format!("{}__{}", self.model_type, self.feature_type)
    }
}
