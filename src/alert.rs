//! Alert specifications and their evaluation
//!
//! An `AlertSpec` is attached to a numeric datatype. After a value is
//! stored, `evaluate` decides whether it raises alerts. Checks run in a fixed
//! order per candidate value and the first match wins:
//!
//! 1. absolute thresholds
//! 2. interval groups (open intervals, boundaries never match)
//! 3. deviation from the average of the most recent stored values
//!
//! Array values are first reduced by the alert spec's `ArrayTreatment`, or checked
//! element by element with `ArrayTreatment::Individually`, in which case
//! every matching element yields its own alert.

use crate::error::{BrokerError, Result};
use crate::types::{Alert, Bounds, DataPoint, DataValue, Datatype};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How an array value is turned into the scalar(s) that get checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayTreatment {
    /// Check every element on its own
    Individually,
    Mean,
    Sum,
    Min,
    Max,
    Median,
}

impl ArrayTreatment {
    /// Reduce `values` to one scalar. `None` for empty input or `Individually`.
    pub fn reduce(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        match self {
            ArrayTreatment::Individually => None,
            ArrayTreatment::Mean => Some(values.iter().sum::<f64>() / values.len() as f64),
            ArrayTreatment::Sum => Some(values.iter().sum()),
            ArrayTreatment::Min => values.iter().copied().reduce(f64::min),
            ArrayTreatment::Max => values.iter().copied().reduce(f64::max),
            ArrayTreatment::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    Some((sorted[mid - 1] + sorted[mid]) / 2.0)
                } else {
                    Some(sorted[mid])
                }
            }
        }
    }
}

impl fmt::Display for ArrayTreatment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArrayTreatment::Individually => "individually",
            ArrayTreatment::Mean => "mean",
            ArrayTreatment::Sum => "sum",
            ArrayTreatment::Min => "min",
            ArrayTreatment::Max => "max",
            ArrayTreatment::Median => "median",
        };
        f.write_str(name)
    }
}

/// An alert interval; values strictly between `low` and `high` alert
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub low: f64,
    pub high: f64,
}

impl Interval {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn contains_strictly(&self, value: f64) -> bool {
        self.low < value && value < self.high
    }
}

/// Allowed deviation from the recent average, as fractions (0.25 = 25%)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Deviation {
    pub low: f64,
    pub high: f64,
}

/// Rule set deciding when an inserted value raises an alert
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSpec {
    /// Advisory flag published with the schema; insertion never depends on alerting
    #[serde(default)]
    pub suppress_insert_on_alert: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absolute_thresholds: Option<Bounds>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_groups: Option<Vec<Interval>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_treatment: Option<ArrayTreatment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_deviation: Option<Deviation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub past_avg_count: Option<u32>,
}

impl AlertSpec {
    /// Spec alerting outside absolute thresholds
    pub fn thresholds(low: Option<f64>, high: Option<f64>) -> Self {
        Self {
            absolute_thresholds: Some(Bounds::new(low, high)),
            ..Default::default()
        }
    }

    /// Spec alerting inside any of the given intervals
    pub fn intervals(groups: impl IntoIterator<Item = (f64, f64)>) -> Self {
        Self {
            interval_groups: Some(
                groups
                    .into_iter()
                    .map(|(low, high)| Interval::new(low, high))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// Add an average-deviation rule over the last `count` stored values
    pub fn with_avg_deviation(mut self, low: f64, high: f64, count: u32) -> Self {
        self.avg_deviation = Some(Deviation { low, high });
        self.past_avg_count = Some(count);
        self
    }

    pub fn with_array_treatment(mut self, treatment: ArrayTreatment) -> Self {
        self.array_treatment = Some(treatment);
        self
    }

    pub fn with_suppress_insert(mut self, suppress: bool) -> Self {
        self.suppress_insert_on_alert = suppress;
        self
    }

    /// Check the invariants that hold for every datatype
    pub fn validate(&self, datatype: &str) -> Result<()> {
        let invalid = |reason: &str| BrokerError::InvalidSchema {
            name: datatype.to_string(),
            reason: reason.to_string(),
        };

        if self.absolute_thresholds.is_none()
            && self.interval_groups.is_none()
            && self.avg_deviation.is_none()
            && self.array_treatment.is_none()
        {
            return Err(invalid("alert spec defines no alert condition"));
        }

        if let Some(thresholds) = &self.absolute_thresholds {
            if !thresholds.is_ordered() {
                return Err(invalid(&format!(
                    "absolute thresholds {} are inverted",
                    thresholds
                )));
            }
        }

        if let Some(groups) = &self.interval_groups {
            if groups.is_empty() {
                return Err(invalid("interval groups must not be empty"));
            }
            if let Some(group) = groups.iter().find(|g| g.low > g.high) {
                return Err(invalid(&format!(
                    "alert interval ({}, {}) is inverted",
                    group.low, group.high
                )));
            }
        }

        if let Some(deviation) = &self.avg_deviation {
            if deviation.low < 0.0 || deviation.high < 0.0 {
                return Err(invalid("average deviation must not be negative"));
            }
            if self.past_avg_count.unwrap_or(0) == 0 {
                return Err(invalid("average deviation requires past_avg_count > 0"));
            }
        }

        Ok(())
    }

    /// Check a single scalar against thresholds, intervals, then the average
    fn check(&self, value: f64, average: Option<f64>) -> Option<String> {
        if let Some(thresholds) = &self.absolute_thresholds {
            if let Some(low) = thresholds.low.filter(|low| value < *low) {
                return Some(format!(
                    "{} < {} (below low threshold by {})",
                    num(value),
                    num(low),
                    num(low - value)
                ));
            }
            if let Some(high) = thresholds.high.filter(|high| value > *high) {
                return Some(format!(
                    "{} > {} (above high threshold by {})",
                    num(value),
                    num(high),
                    num(value - high)
                ));
            }
        }

        if let Some(groups) = &self.interval_groups {
            if let Some(group) = groups.iter().find(|g| g.contains_strictly(value)) {
                return Some(format!(
                    "{} within alert interval ({}, {})",
                    num(value),
                    num(group.low),
                    num(group.high)
                ));
            }
        }

        if let (Some(deviation), Some(avg)) = (&self.avg_deviation, average) {
            let floor = (1.0 - deviation.low) * avg;
            let ceiling = (1.0 + deviation.high) * avg;
            if value < floor {
                return Some(format!(
                    "{} < {} ({}% below average {})",
                    num(value),
                    num(floor),
                    num(deviation.low * 100.0),
                    num(avg)
                ));
            }
            if value > ceiling {
                return Some(format!(
                    "{} > {} ({}% above average {})",
                    num(value),
                    num(ceiling),
                    num(deviation.high * 100.0),
                    num(avg)
                ));
            }
        }

        None
    }

    /// Scalars that feed the average for one historical value
    fn history_scalars(&self, value: &DataValue) -> Vec<f64> {
        match value {
            DataValue::Number(n) => vec![*n],
            DataValue::Text(_) => Vec::new(),
            DataValue::Array(items) => {
                let numbers: Vec<f64> = items.iter().filter_map(|s| s.as_number()).collect();
                match self.array_treatment {
                    Some(ArrayTreatment::Individually) | None => numbers,
                    Some(treatment) => treatment.reduce(&numbers).into_iter().collect(),
                }
            }
        }
    }
}

/// Source of previously stored values for one (client, datatype) pair
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Up to `limit` stored values, newest first, excluding the value under evaluation
    async fn recent(&self, limit: usize) -> Result<Vec<DataValue>>;
}

/// History source for pairs with nothing stored yet
pub struct NoHistory;

#[async_trait]
impl HistorySource for NoHistory {
    async fn recent(&self, _limit: usize) -> Result<Vec<DataValue>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl HistorySource for Vec<DataValue> {
    async fn recent(&self, limit: usize) -> Result<Vec<DataValue>> {
        Ok(self.iter().take(limit).cloned().collect())
    }
}

/// Evaluate a stored data point against its datatype's alert spec.
///
/// Returns every alert raised; empty when the alert spec is absent, the value is
/// textual, or nothing matched.
pub async fn evaluate(
    datatype: &Datatype,
    point: &DataPoint,
    history: &dyn HistorySource,
) -> Result<Vec<Alert>> {
    let spec = match &datatype.alert_spec {
        Some(spec) => spec,
        None => return Ok(Vec::new()),
    };

    // (label, value) pairs to check
    let candidates: Vec<(Option<String>, f64)> = match &point.value {
        DataValue::Text(_) => return Ok(Vec::new()),
        DataValue::Number(n) => vec![(None, *n)],
        DataValue::Array(items) => {
            let numbers = match items.iter().map(|s| s.as_number()).collect::<Option<Vec<_>>>() {
                Some(numbers) => numbers,
                None => return Ok(Vec::new()),
            };
            match spec.array_treatment {
                Some(ArrayTreatment::Individually) | None => numbers
                    .into_iter()
                    .enumerate()
                    .map(|(i, n)| (Some(format!("element {}", i)), n))
                    .collect(),
                Some(treatment) => match treatment.reduce(&numbers) {
                    Some(n) => vec![(Some(treatment.to_string()), n)],
                    None => return Ok(Vec::new()),
                },
            }
        }
    };

    let average = match (&spec.avg_deviation, spec.past_avg_count) {
        (Some(_), Some(count)) if count > 0 => average_of(spec, history, count as usize).await?,
        _ => None,
    };

    let alerts = candidates
        .into_iter()
        .filter_map(|(label, value)| {
            spec.check(value, average).map(|message| Alert {
                datatype: datatype.name.clone(),
                timestamp: point.timestamp,
                description: match label {
                    Some(label) => format!("{}: {}", label, message),
                    None => message,
                },
            })
        })
        .collect();

    Ok(alerts)
}

/// Mean of the last `count` stored values, `None` until enough exist
async fn average_of(
    spec: &AlertSpec,
    history: &dyn HistorySource,
    count: usize,
) -> Result<Option<f64>> {
    let recent = history.recent(count).await?;
    if recent.len() < count {
        tracing::debug!(
            have = recent.len(),
            need = count,
            "Not enough history for average deviation"
        );
        return Ok(None);
    }

    let scalars: Vec<f64> = recent
        .iter()
        .flat_map(|value| spec.history_scalars(value))
        .collect();
    Ok(ArrayTreatment::Mean.reduce(&scalars))
}

/// Render a number without float noise
fn num(value: f64) -> String {
    let rounded = (value * 1e6).round() / 1e6;
    if rounded == 0.0 {
        // avoid "-0"
        return "0".to_string();
    }
    rounded.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataPointId, DatatypeId, Scalar, StorageKind};
    use chrono::Utc;

    fn datatype(kind: StorageKind, spec: AlertSpec) -> Datatype {
        Datatype {
            id: DatatypeId("dt".into()),
            name: "sensor".into(),
            storage_kind: kind,
            array_element_kind: (kind == StorageKind::Array).then_some(StorageKind::Number),
            unit: None,
            valid_bounds: None,
            alert_spec: Some(spec),
        }
    }

    fn point(value: DataValue) -> DataPoint {
        DataPoint {
            id: DataPointId("p".into()),
            client: "client0".into(),
            datatype: "sensor".into(),
            value,
            timestamp: Utc::now(),
        }
    }

    fn array(values: &[f64]) -> DataValue {
        DataValue::Array(values.iter().map(|v| Scalar::Number(*v)).collect())
    }

    #[test]
    fn test_reduce() {
        let v = [25.0, 18.0, 30.0, 7.0];
        assert_eq!(ArrayTreatment::Min.reduce(&v), Some(7.0));
        assert_eq!(ArrayTreatment::Max.reduce(&v), Some(30.0));
        assert_eq!(ArrayTreatment::Sum.reduce(&v), Some(80.0));
        assert_eq!(ArrayTreatment::Mean.reduce(&v), Some(20.0));
        assert_eq!(ArrayTreatment::Median.reduce(&v), Some(21.5));
        assert_eq!(ArrayTreatment::Median.reduce(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(ArrayTreatment::Mean.reduce(&[]), None);
        assert_eq!(ArrayTreatment::Individually.reduce(&v), None);
    }

    #[test]
    fn test_validate_requires_a_condition() {
        let err = AlertSpec::default().validate("temp").unwrap_err();
        assert!(err.to_string().contains("no alert condition"));

        assert!(AlertSpec::default()
            .with_array_treatment(ArrayTreatment::Max)
            .validate("temp")
            .is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_pairs() {
        assert!(AlertSpec::thresholds(Some(10.0), Some(5.0)).validate("t").is_err());
        assert!(AlertSpec::intervals([(5.0, 4.0)]).validate("t").is_err());
        assert!(AlertSpec::intervals([]).validate("t").is_err());
        assert!(AlertSpec::thresholds(Some(5.0), None).validate("t").is_ok());
    }

    #[test]
    fn test_validate_avg_requires_count() {
        let spec = AlertSpec::thresholds(None, Some(1.0)).with_avg_deviation(0.25, 0.25, 0);
        assert!(spec.validate("t").is_err());

        let spec = AlertSpec::thresholds(None, Some(1.0)).with_avg_deviation(0.25, 0.25, 10);
        assert!(spec.validate("t").is_ok());
    }

    #[tokio::test]
    async fn test_array_min_threshold() {
        let spec = AlertSpec::thresholds(Some(20.0), Some(95.0))
            .with_array_treatment(ArrayTreatment::Min);
        let dt = datatype(StorageKind::Array, spec);

        let alerts = evaluate(&dt, &point(array(&[25.0, 18.0, 30.0])), &NoHistory)
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].description.contains("18 < 20"), "{}", alerts[0].description);
        assert_eq!(alerts[0].datatype, "sensor");

        let alerts = evaluate(&dt, &point(array(&[25.0, 30.0, 40.0])), &NoHistory)
            .await
            .unwrap();
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn test_high_threshold_margin() {
        let dt = datatype(StorageKind::Number, AlertSpec::thresholds(None, Some(1000.0)));
        let alerts = evaluate(&dt, &point(DataValue::Number(1012.5)), &NoHistory)
            .await
            .unwrap();
        assert_eq!(alerts[0].description, "1012.5 > 1000 (above high threshold by 12.5)");
    }

    #[tokio::test]
    async fn test_interval_is_open() {
        let dt = datatype(StorageKind::Number, AlertSpec::intervals([(4.0, 5.0)]));

        for boundary in [4.0, 5.0] {
            let alerts = evaluate(&dt, &point(DataValue::Number(boundary)), &NoHistory)
                .await
                .unwrap();
            assert!(alerts.is_empty(), "boundary {} must not alert", boundary);
        }

        let alerts = evaluate(&dt, &point(DataValue::Number(4.5)), &NoHistory)
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].description, "4.5 within alert interval (4, 5)");
    }

    #[tokio::test]
    async fn test_first_matching_interval_wins() {
        let dt = datatype(
            StorageKind::Number,
            AlertSpec::intervals([(0.0, 10.0), (5.0, 6.0)]),
        );
        let alerts = evaluate(&dt, &point(DataValue::Number(5.5)), &NoHistory)
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].description.contains("(0, 10)"));
    }

    #[tokio::test]
    async fn test_individually_collects_all_matches() {
        let spec = AlertSpec::intervals([(-4.2, 4.2)])
            .with_array_treatment(ArrayTreatment::Individually);
        let dt = datatype(StorageKind::Array, spec);

        let alerts = evaluate(&dt, &point(array(&[3.3, 5.0, -1.0])), &NoHistory)
            .await
            .unwrap();
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].description.starts_with("element 0:"));
        assert!(alerts[1].description.starts_with("element 2:"));
    }

    #[tokio::test]
    async fn test_avg_deviation_needs_enough_history() {
        let spec = AlertSpec::thresholds(Some(-10.0), Some(45.0)).with_avg_deviation(0.25, 0.25, 3);
        let dt = datatype(StorageKind::Number, spec);

        let short = vec![DataValue::Number(20.0), DataValue::Number(20.0)];
        let alerts = evaluate(&dt, &point(DataValue::Number(40.0)), &short)
            .await
            .unwrap();
        assert!(alerts.is_empty());

        let full = vec![
            DataValue::Number(20.0),
            DataValue::Number(20.0),
            DataValue::Number(20.0),
        ];
        let alerts = evaluate(&dt, &point(DataValue::Number(40.0)), &full)
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].description.contains("above average 20"));

        let alerts = evaluate(&dt, &point(DataValue::Number(14.0)), &full)
            .await
            .unwrap();
        assert!(alerts[0].description.contains("below average 20"));

        let alerts = evaluate(&dt, &point(DataValue::Number(22.0)), &full)
            .await
            .unwrap();
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn test_thresholds_checked_before_average() {
        let spec = AlertSpec::thresholds(None, Some(45.0)).with_avg_deviation(0.25, 0.25, 1);
        let dt = datatype(StorageKind::Number, spec);
        let history = vec![DataValue::Number(20.0)];

        let alerts = evaluate(&dt, &point(DataValue::Number(50.0)), &history)
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].description.starts_with("50 > 45"));
    }

    #[tokio::test]
    async fn test_text_values_never_alert() {
        let dt = datatype(StorageKind::String, AlertSpec::thresholds(Some(0.0), Some(1.0)));
        let alerts = evaluate(&dt, &point(DataValue::Text("x".into())), &NoHistory)
            .await
            .unwrap();
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn test_no_spec_never_alerts() {
        let mut dt = datatype(StorageKind::Number, AlertSpec::thresholds(None, Some(0.0)));
        dt.alert_spec = None;
        let alerts = evaluate(&dt, &point(DataValue::Number(100.0)), &NoHistory)
            .await
            .unwrap();
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_num_rendering() {
        assert_eq!(num(18.0), "18");
        assert_eq!(num(7.5 - 7.3), "0.2");
        assert_eq!(num(-0.0000001), "0");
    }
}
