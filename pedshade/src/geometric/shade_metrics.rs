use std::collections::BTreeMap;
use std::path::Path;

use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::error::{PipelineError, Result};

/// Label of the thermal-comfort band of the virtual raster
pub const PET_LABEL: &str = "PET";

/// One raster band and the column name its mean is stored under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandLabel {
    /// 1-based band index in the raster
    pub index: usize,
    pub label: String,
}

/// Explicit mapping from raster bands to labels.
///
/// The default describes the merged shade raster: bands 1..=23 are the
/// 30-minute shade intervals `0900`..`2000`, band 24 is `PET`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandLayout {
    pub bands: Vec<BandLabel>,
}

impl Default for BandLayout {
    fn default() -> Self {
        let mut labels = interval_labels(9 * 60, 20 * 60, 30);
        labels.push(PET_LABEL.to_string());
        BandLayout::from_labels(labels)
    }
}

impl BandLayout {
    /// Consecutive bands starting at 1
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bands = labels
            .into_iter()
            .enumerate()
            .map(|(i, label)| BandLabel {
                index: i + 1,
                label: label.into(),
            })
            .collect();
        BandLayout { bands }
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    /// Highest band index the raster has to provide
    pub fn max_band(&self) -> usize {
        self.bands.iter().map(|b| b.index).max().unwrap_or(0)
    }

    pub fn labels(&self) -> Vec<String> {
        self.bands.iter().map(|b| b.label.clone()).collect()
    }

    /// Labels of the shade intervals (`HHMM`), in band order
    pub fn interval_labels(&self) -> Vec<String> {
        self.bands
            .iter()
            .filter(|b| parse_hhmm(&b.label).is_some())
            .map(|b| b.label.clone())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.bands.is_empty() {
            return Err(PipelineError::Config("Band layout is empty".to_string()));
        }
        for (i, band) in self.bands.iter().enumerate() {
            if band.index == 0 {
                return Err(PipelineError::Config(format!(
                    "Band '{}' has index 0; raster bands start at 1",
                    band.label
                )));
            }
            if self.bands[..i].iter().any(|b| b.label == band.label) {
                return Err(PipelineError::Config(format!(
                    "Duplicate band label '{}'",
                    band.label
                )));
            }
        }
        Ok(())
    }
}

/// Inclusive range of `HHMM` interval labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
    pub step_minutes: u32,
}

impl TimeWindow {
    pub fn new(start: &str, end: &str, step_minutes: u32) -> Self {
        TimeWindow {
            start: start.to_string(),
            end: end.to_string(),
            step_minutes,
        }
    }

    /// Every shade interval of the day
    pub fn daily() -> Self {
        TimeWindow::new("0900", "2000", 30)
    }

    /// Window averaged into the exposure and shade percentages
    pub fn midday() -> Self {
        TimeWindow::new("1100", "1700", 30)
    }

    pub fn labels(&self) -> Result<Vec<String>> {
        let start = parse_hhmm(&self.start).ok_or_else(|| {
            PipelineError::Config(format!("Invalid HHMM label '{}'", self.start))
        })?;
        let end = parse_hhmm(&self.end)
            .ok_or_else(|| PipelineError::Config(format!("Invalid HHMM label '{}'", self.end)))?;
        if self.step_minutes == 0 || end < start {
            return Err(PipelineError::Config(format!(
                "Empty time window {}..{} step {}",
                self.start, self.end, self.step_minutes
            )));
        }
        Ok(interval_labels(start, end, self.step_minutes))
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        TimeWindow::midday()
    }
}

/// Minutes since midnight for a `HHMM` label
fn parse_hhmm(label: &str) -> Option<u32> {
    if label.len() != 4 || !label.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: u32 = label[..2].parse().ok()?;
    let minutes: u32 = label[2..].parse().ok()?;
    (hours < 24 && minutes < 60).then_some(hours * 60 + minutes)
}

fn interval_labels(start: u32, end: u32, step: u32) -> Vec<String> {
    (start..=end)
        .step_by(step as usize)
        .map(|m| format!("{:02}{:02}", m / 60, m % 60))
        .collect()
}

/// Per-interval weights, read from the single data row of a CSV whose
/// header holds the `HHMM` labels
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdjustmentCurve {
    weights: BTreeMap<String, f64>,
}

impl AdjustmentCurve {
    pub fn from_weights<I, S>(weights: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        AdjustmentCurve {
            weights: weights.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| PipelineError::io(path, e))?;
        Self::from_reader(file)
            .map_err(|e| match e {
                PipelineError::Schema(msg) => {
                    PipelineError::Schema(format!("{} ({:?})", msg, path))
                }
                other => other,
            })
    }

    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);

        let headers = rdr
            .headers()
            .map_err(|e| PipelineError::Schema(format!("Unreadable adjustment curve header: {}", e)))?
            .clone();
        let record = rdr
            .records()
            .next()
            .ok_or_else(|| PipelineError::Schema("Adjustment curve has no data row".to_string()))?
            .map_err(|e| PipelineError::Schema(format!("Unreadable adjustment curve row: {}", e)))?;

        let mut weights = BTreeMap::new();
        for (label, value) in headers.iter().zip(record.iter()) {
            match value.trim().parse::<f64>() {
                Ok(weight) => {
                    weights.insert(label.trim().to_string(), weight);
                }
                Err(_) => log::debug!("Skipping non-numeric curve column '{}'", label),
            }
        }

        Ok(AdjustmentCurve { weights })
    }

    pub fn weight(&self, label: &str) -> Result<f64> {
        self.weights.get(label).copied().ok_or_else(|| {
            PipelineError::Schema(format!("Adjustment curve has no column '{}'", label))
        })
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Derived per-edge exposure metrics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeMetrics {
    pub sum_adjust: f64,
    pub avg_exposure_percent: f64,
    pub avg_shade_percent: f64,
}

/// Labels and weights resolved once, then applied to every edge
#[derive(Debug, Clone)]
pub struct ShadeMetrics {
    weighted: Vec<(String, f64)>,
    midday: Vec<String>,
}

impl ShadeMetrics {
    pub fn new(layout: &BandLayout, curve: &AdjustmentCurve, midday: &TimeWindow) -> Result<Self> {
        let weighted = layout
            .interval_labels()
            .into_iter()
            .map(|label| {
                let weight = curve.weight(&label)?;
                Ok((label, weight))
            })
            .collect::<Result<Vec<_>>>()?;

        let known = layout.labels();
        let midday = midday.labels()?;
        if let Some(missing) = midday.iter().find(|l| !known.contains(l)) {
            return Err(PipelineError::Schema(format!(
                "Midday interval '{}' is not a band of the layout",
                missing
            )));
        }

        Ok(ShadeMetrics { weighted, midday })
    }

    pub fn midday_labels(&self) -> &[String] {
        &self.midday
    }

    /// Σ value × weight over every shade interval.
    /// Missing values count as NaN.
    pub fn weighted_sum(&self, values: &BTreeMap<String, f64>) -> f64 {
        self.weighted
            .iter()
            .map(|(label, weight)| values.get(label).copied().unwrap_or(f64::NAN) * weight)
            .sum()
    }

    /// Arithmetic mean over the midday intervals
    pub fn midday_average(&self, values: &BTreeMap<String, f64>) -> f64 {
        let total: f64 = self
            .midday
            .iter()
            .map(|label| values.get(label).copied().unwrap_or(f64::NAN))
            .sum();
        total / self.midday.len() as f64
    }

    pub fn compute(&self, values: &BTreeMap<String, f64>) -> EdgeMetrics {
        let avg_exposure_percent = self.midday_average(values);
        EdgeMetrics {
            sum_adjust: self.weighted_sum(values),
            avg_exposure_percent,
            avg_shade_percent: 1.0 - avg_exposure_percent,
        }
    }

    pub fn compute_all(&self, rows: &[BTreeMap<String, f64>]) -> Vec<EdgeMetrics> {
        #[cfg(feature = "rayon")]
        let metrics = rows.par_iter().map(|row| self.compute(row)).collect();

        #[cfg(not(feature = "rayon"))]
        let metrics = rows.iter().map(|row| self.compute(row)).collect();

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_row(layout: &BandLayout, value: f64) -> BTreeMap<String, f64> {
        layout.labels().into_iter().map(|l| (l, value)).collect()
    }

    #[test]
    fn test_default_layout() {
        let layout = BandLayout::default();
        assert_eq!(layout.len(), 24);
        assert_eq!(layout.max_band(), 24);
        assert_eq!(layout.bands[0].label, "0900");
        assert_eq!(layout.bands[22].label, "2000");
        assert_eq!(layout.bands[23], BandLabel { index: 24, label: "PET".to_string() });
        assert_eq!(layout.interval_labels(), TimeWindow::daily().labels().unwrap());
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn test_midday_window_has_thirteen_intervals() {
        let labels = TimeWindow::midday().labels().unwrap();
        assert_eq!(labels.len(), 13);
        assert_eq!(labels.first().map(String::as_str), Some("1100"));
        assert_eq!(labels.last().map(String::as_str), Some("1700"));
    }

    #[test]
    fn test_invalid_window() {
        assert!(TimeWindow::new("1100", "0900", 30).labels().is_err());
        assert!(TimeWindow::new("11:00", "1700", 30).labels().is_err());
        assert!(TimeWindow::new("1100", "1700", 0).labels().is_err());
    }

    #[test]
    fn test_layout_rejects_duplicates() {
        let layout = BandLayout::from_labels(["0900", "0900"]);
        assert!(matches!(layout.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_curve_from_csv_reader() {
        let csv = "0900,0930,1000\n0.5,1.0,2\n";
        let curve = AdjustmentCurve::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(curve.len(), 3);
        assert_eq!(curve.weight("1000").unwrap(), 2.0);
        assert!(matches!(curve.weight("1030"), Err(PipelineError::Schema(_))));
    }

    #[test]
    fn test_curve_without_rows() {
        let result = AdjustmentCurve::from_reader("0900,0930\n".as_bytes());
        assert!(matches!(result, Err(PipelineError::Schema(_))));
    }

    #[test]
    fn test_weighted_sum() {
        let layout = BandLayout::from_labels(["0900", "0930", "PET"]);
        let curve = AdjustmentCurve::from_weights([("0900", 2.0), ("0930", 3.0)]);
        let metrics =
            ShadeMetrics::new(&layout, &curve, &TimeWindow::new("0900", "0930", 30)).unwrap();

        let mut row = BTreeMap::new();
        row.insert("0900".to_string(), 0.5);
        row.insert("0930".to_string(), 0.25);
        row.insert("PET".to_string(), 40.0);

        // PET never contributes
        assert!((metrics.weighted_sum(&row) - 1.75).abs() < 1e-12);
    }

    #[test]
    fn test_missing_curve_label_is_schema_error() {
        let layout = BandLayout::default();
        let curve = AdjustmentCurve::from_weights([("0900", 1.0)]);
        let result = ShadeMetrics::new(&layout, &curve, &TimeWindow::midday());
        assert!(matches!(result, Err(PipelineError::Schema(_))));
    }

    #[test]
    fn test_shade_is_complement_of_exposure() {
        let layout = BandLayout::default();
        let curve = AdjustmentCurve::from_weights(
            layout.interval_labels().into_iter().map(|l| (l, 1.0)),
        );
        let metrics = ShadeMetrics::new(&layout, &curve, &TimeWindow::midday()).unwrap();

        let mut row = uniform_row(&layout, 0.0);
        for (i, label) in metrics.midday_labels().iter().enumerate() {
            row.insert(label.clone(), i as f64 / 20.0);
        }

        let edge = metrics.compute(&row);
        assert!((edge.avg_exposure_percent + edge.avg_shade_percent - 1.0).abs() < 1e-12);
        // mean of 0/20..12/20
        assert!((edge.avg_exposure_percent - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_nan_band_propagates() {
        let layout = BandLayout::default();
        let curve = AdjustmentCurve::from_weights(
            layout.interval_labels().into_iter().map(|l| (l, 1.0)),
        );
        let metrics = ShadeMetrics::new(&layout, &curve, &TimeWindow::midday()).unwrap();

        let mut row = uniform_row(&layout, 1.0);
        row.insert("1200".to_string(), f64::NAN);

        let all = metrics.compute_all(&[uniform_row(&layout, 1.0), row]);
        assert_eq!(all[0].sum_adjust, 23.0);
        assert_eq!(all[0].avg_shade_percent, 0.0);
        assert!(all[1].sum_adjust.is_nan());
        assert!(all[1].avg_exposure_percent.is_nan());
    }
}
