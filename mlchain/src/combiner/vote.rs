//! Row-wise aggregation of ensemble member predictions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::CombineError;

/// How member predictions are combined into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMethod {
    /// Most frequent label; mean for numeric outputs.
    #[default]
    Plurality,
    /// Label with the highest summed confidence; confidence-weighted mean
    /// for numeric outputs.
    ConfidenceWeighted,
    /// Label with the highest summed class probability across members'
    /// distributions; confidence-weighted mean for numeric outputs.
    ProbabilityWeighted,
}

impl fmt::Display for CombineMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plurality => write!(f, "plurality"),
            Self::ConfidenceWeighted => write!(f, "confidence_weighted"),
            Self::ProbabilityWeighted => write!(f, "probability_weighted"),
        }
    }
}

/// A predicted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredictionValue {
    /// Regression output.
    Numeric(f64),
    /// Classification output.
    Categorical(String),
}

/// One row's prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowPrediction {
    /// The predicted value.
    pub output: PredictionValue,
    /// Confidence in `[0, 1]`, when the platform reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Per-class probabilities, for classifiers that report a distribution.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub probabilities: BTreeMap<String, f64>,
}

impl RowPrediction {
    /// A categorical prediction.
    #[must_use]
    pub fn categorical(label: impl Into<String>, confidence: Option<f64>) -> Self {
        Self {
            output: PredictionValue::Categorical(label.into()),
            confidence,
            probabilities: BTreeMap::new(),
        }
    }

    /// Attaches a class distribution.
    #[must_use]
    pub fn with_probabilities<L: Into<String>>(mut self, probabilities: impl IntoIterator<Item = (L, f64)>) -> Self {
        self.probabilities = probabilities.into_iter().map(|(l, p)| (l.into(), p)).collect();
        self
    }

    /// A numeric prediction.
    #[must_use]
    pub fn numeric(value: f64, confidence: Option<f64>) -> Self {
        Self {
            output: PredictionValue::Numeric(value),
            confidence,
            probabilities: BTreeMap::new(),
        }
    }
}

/// Combines member predictions row by row.
///
/// `members` holds one prediction list per member, in member order. Every
/// member must predict the same number of rows.
pub fn vote(members: &[Vec<RowPrediction>], method: CombineMethod) -> Result<Vec<RowPrediction>, CombineError> {
    let Some(first) = members.first() else {
        return Err(CombineError::NoInputs);
    };
    let rows = first.len();
    if let Some((member, list)) = members.iter().enumerate().find(|(_, list)| list.len() != rows) {
        return Err(CombineError::RowCountMismatch {
            member,
            expected: rows,
            actual: list.len(),
        });
    }

    let mut combined = Vec::with_capacity(rows);
    let mut votes = Vec::with_capacity(members.len());
    for row in 0..rows {
        votes.clear();
        votes.extend(members.iter().map(|list| &list[row]));
        combined.push(combine_row(&votes, method).map_err(|reason| CombineError::InvalidPayload(format!("row {row}: {reason}")))?);
    }
    Ok(combined)
}

/// Combines the votes for a single row.
fn combine_row(votes: &[&RowPrediction], method: CombineMethod) -> Result<RowPrediction, String> {
    let numeric = votes
        .iter()
        .filter(|v| matches!(v.output, PredictionValue::Numeric(_)))
        .count();
    match numeric {
        0 => Ok(categorical_vote(votes, method)),
        n if n == votes.len() => Ok(numeric_vote(votes, method)),
        _ => Err("members disagree on the output type".to_string()),
    }
}

/// Weight a vote carries under `method`.
fn weight(vote: &RowPrediction, method: CombineMethod) -> f64 {
    match method {
        CombineMethod::Plurality => 1.0,
        CombineMethod::ConfidenceWeighted | CombineMethod::ProbabilityWeighted => {
            vote.confidence.unwrap_or(0.0).max(0.0)
        }
    }
}

/// The labels a categorical vote supports, with their weights.
///
/// Under [`CombineMethod::ProbabilityWeighted`] a member spreads its vote
/// over its normalised class distribution. A member without one backs its
/// own label with its confidence, or fully when it reports none.
fn ballot(vote: &RowPrediction, method: CombineMethod) -> Vec<(&str, f64)> {
    let PredictionValue::Categorical(ref label) = vote.output else {
        return Vec::new();
    };
    if method != CombineMethod::ProbabilityWeighted {
        return vec![(label.as_str(), weight(vote, method))];
    }

    let mass: f64 = vote.probabilities.values().filter(|p| **p > 0.0).sum();
    if mass <= 0.0 {
        return vec![(label.as_str(), vote.confidence.unwrap_or(1.0).max(0.0))];
    }
    // The predicted label leads so ties favour what the member predicted.
    let mut ballot = vec![(label.as_str(), vote.probabilities.get(label).copied().unwrap_or(0.0).max(0.0) / mass)];
    ballot.extend(
        vote.probabilities
            .iter()
            .filter(|(l, p)| *l != label && **p > 0.0)
            .map(|(l, p)| (l.as_str(), p / mass)),
    );
    ballot
}

fn categorical_vote(votes: &[&RowPrediction], method: CombineMethod) -> RowPrediction {
    let tally = |method: CombineMethod| {
        // Labels in first-seen order, so ties go to the earliest member.
        let mut tally: Vec<(&str, f64)> = Vec::new();
        for vote in votes {
            for (label, w) in ballot(vote, method) {
                match tally.iter_mut().find(|(l, _)| *l == label) {
                    Some(entry) => entry.1 += w,
                    None => tally.push((label, w)),
                }
            }
        }
        tally
    };

    let mut counts = tally(method);
    let mut total: f64 = counts.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        // No member reported a confidence.
        counts = tally(CombineMethod::Plurality);
        total = counts.iter().map(|(_, w)| w).sum();
    }

    let mut winner = counts[0];
    for &entry in &counts[1..] {
        if entry.1 > winner.1 {
            winner = entry;
        }
    }
    RowPrediction::categorical(winner.0, Some(winner.1 / total))
}

fn numeric_vote(votes: &[&RowPrediction], method: CombineMethod) -> RowPrediction {
    let values: Vec<(f64, f64)> = votes
        .iter()
        .filter_map(|v| match v.output {
            PredictionValue::Numeric(x) => Some((x, weight(v, method))),
            PredictionValue::Categorical(_) => None,
        })
        .collect();

    let total: f64 = values.iter().map(|(_, w)| w).sum();
    let value = if total > 0.0 {
        values.iter().map(|(x, w)| x * w).sum::<f64>() / total
    } else {
        values.iter().map(|(x, _)| x).sum::<f64>() / values.len() as f64
    };

    let confidences: Vec<f64> = votes.iter().filter_map(|v| v.confidence).collect();
    let confidence = (!confidences.is_empty())
        .then(|| confidences.iter().sum::<f64>() / confidences.len() as f64);
    RowPrediction::numeric(value, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn labels(labels: &[&str]) -> Vec<Vec<RowPrediction>> {
        labels
            .iter()
            .map(|l| vec![RowPrediction::categorical(*l, None)])
            .collect()
    }

    fn output(rows: &[RowPrediction]) -> &PredictionValue {
        &rows[0].output
    }

    #[test]
    fn test_plurality_majority() {
        let combined = vote(&labels(&["cat", "dog", "cat"]), CombineMethod::Plurality).unwrap();
        assert_eq!(output(&combined), &PredictionValue::Categorical("cat".to_string()));
        let confidence = combined[0].confidence.unwrap();
        assert!((confidence - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_plurality_tie_goes_to_first_member() {
        let combined = vote(&labels(&["cat", "dog"]), CombineMethod::Plurality).unwrap();
        assert_eq!(output(&combined), &PredictionValue::Categorical("cat".to_string()));

        let combined = vote(&labels(&["dog", "cat"]), CombineMethod::Plurality).unwrap();
        assert_eq!(output(&combined), &PredictionValue::Categorical("dog".to_string()));
    }

    #[test]
    fn test_confidence_weighted_overrides_count() {
        let members = vec![
            vec![RowPrediction::categorical("cat", Some(0.3))],
            vec![RowPrediction::categorical("cat", Some(0.3))],
            vec![RowPrediction::categorical("dog", Some(0.9))],
        ];
        let plurality = vote(&members, CombineMethod::Plurality).unwrap();
        assert_eq!(output(&plurality), &PredictionValue::Categorical("cat".to_string()));

        let weighted = vote(&members, CombineMethod::ConfidenceWeighted).unwrap();
        assert_eq!(output(&weighted), &PredictionValue::Categorical("dog".to_string()));
    }

    #[test]
    fn test_confidence_weighted_without_confidences_falls_back() {
        let combined = vote(&labels(&["dog", "cat", "cat"]), CombineMethod::ConfidenceWeighted).unwrap();
        assert_eq!(output(&combined), &PredictionValue::Categorical("cat".to_string()));
    }

    #[test]
    fn test_probability_weighted_uses_distributions() {
        let members = vec![
            vec![RowPrediction::categorical("cat", Some(0.6)).with_probabilities([("cat", 0.6), ("dog", 0.4)])],
            vec![RowPrediction::categorical("cat", Some(0.55)).with_probabilities([("cat", 0.55), ("dog", 0.45)])],
            vec![RowPrediction::categorical("dog", Some(0.95)).with_probabilities([("cat", 0.05), ("dog", 0.95)])],
        ];
        // cat: 0.6 + 0.55 + 0.05 = 1.2, dog: 0.4 + 0.45 + 0.95 = 1.8
        let combined = vote(&members, CombineMethod::ProbabilityWeighted).unwrap();
        assert_eq!(output(&combined), &PredictionValue::Categorical("dog".to_string()));
        assert!((combined[0].confidence.unwrap() - 0.6).abs() < 1e-9);

        let plurality = vote(&members, CombineMethod::Plurality).unwrap();
        assert_eq!(output(&plurality), &PredictionValue::Categorical("cat".to_string()));
    }

    #[test]
    fn test_probability_weighted_without_distributions() {
        let combined = vote(&labels(&["dog", "cat", "cat"]), CombineMethod::ProbabilityWeighted).unwrap();
        assert_eq!(output(&combined), &PredictionValue::Categorical("cat".to_string()));

        let row: RowPrediction =
            serde_json::from_str(r#"{"output": "cat", "probabilities": {"cat": 0.7, "dog": 0.3}}"#).unwrap();
        assert_eq!(row.probabilities.get("dog"), Some(&0.3));
    }

    #[test]
    fn test_numeric_mean() {
        let members = vec![
            vec![RowPrediction::numeric(1.0, Some(1.0))],
            vec![RowPrediction::numeric(4.0, Some(0.5))],
        ];
        let mean = vote(&members, CombineMethod::Plurality).unwrap();
        assert_eq!(output(&mean), &PredictionValue::Numeric(2.5));
        assert_eq!(mean[0].confidence, Some(0.75));

        let weighted = vote(&members, CombineMethod::ConfidenceWeighted).unwrap();
        assert_eq!(output(&weighted), &PredictionValue::Numeric(2.0));
    }

    #[test]
    fn test_vote_is_row_wise() {
        let members = vec![
            vec![RowPrediction::categorical("a", None), RowPrediction::categorical("x", None)],
            vec![RowPrediction::categorical("b", None), RowPrediction::categorical("y", None)],
            vec![RowPrediction::categorical("b", None), RowPrediction::categorical("x", None)],
        ];
        let combined = vote(&members, CombineMethod::Plurality).unwrap();
        let outputs: Vec<_> = combined.iter().map(|r| r.output.clone()).collect();
        assert_eq!(
            outputs,
            vec![
                PredictionValue::Categorical("b".to_string()),
                PredictionValue::Categorical("x".to_string()),
            ]
        );
    }

    #[test]
    fn test_vote_rejects_uneven_members() {
        let members = vec![
            vec![RowPrediction::categorical("a", None)],
            vec![],
        ];
        let err = vote(&members, CombineMethod::Plurality).unwrap_err();
        assert!(matches!(
            err,
            CombineError::RowCountMismatch {
                member: 1,
                expected: 1,
                actual: 0
            }
        ));
    }

    #[test]
    fn test_vote_rejects_mixed_types() {
        let members = vec![
            vec![RowPrediction::categorical("a", None)],
            vec![RowPrediction::numeric(1.0, None)],
        ];
        assert!(matches!(
            vote(&members, CombineMethod::Plurality),
            Err(CombineError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_prediction_value_serde() {
        let row: RowPrediction = serde_json::from_str(r#"{"output": "cat", "confidence": 0.9}"#).unwrap();
        assert_eq!(row, RowPrediction::categorical("cat", Some(0.9)));
        let row: RowPrediction = serde_json::from_str(r#"{"output": 3.5}"#).unwrap();
        assert_eq!(row, RowPrediction::numeric(3.5, None));
    }
}
