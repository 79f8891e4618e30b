use serde::{Deserialize, Serialize};

/// Label reported when a result carries no scores at all.
pub const NO_LABEL: &str = "none";

/// One category and the score the model gave it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub score: f32,
}

/// Per-label scores of one classification plus the winning entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub scores: Vec<LabelScore>,
    pub best_label: String,
    pub best_score: f32,
}

impl ClassificationResult {
    /// Pair labels with scores in order and pick the best entry.
    ///
    /// A later entry only replaces the best on a strictly greater score, so
    /// the first maximum wins ties.
    pub fn from_scores<S: AsRef<str>>(labels: &[S], scores: &[f32]) -> Self {
        let scores: Vec<LabelScore> = labels
            .iter()
            .zip(scores.iter())
            .map(|(label, &score)| LabelScore {
                label: label.as_ref().to_string(),
                score,
            })
            .collect();

        let mut best: Option<&LabelScore> = None;
        for entry in &scores {
            match best {
                Some(b) if entry.score > b.score => best = Some(entry),
                None => best = Some(entry),
                _ => {}
            }
        }

        let (best_label, best_score) = best
            .map(|b| (b.label.clone(), b.score))
            .unwrap_or_else(|| (NO_LABEL.to_string(), 0.0));

        Self {
            scores,
            best_label,
            best_score,
        }
    }

    /// A detection needs a best score strictly above the threshold.
    pub fn is_detection(&self, threshold: f32) -> bool {
        self.best_score > threshold
    }
}

/// Body of the report POSTed to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionReport {
    pub category: String,
    pub confidence: f32,
    pub device_id: String,
    /// Device clock when the report was sent, Unix millis.
    pub timestamp: i64,
}

impl PredictionReport {
    pub fn new(result: &ClassificationResult, device_id: &str, timestamp: i64) -> Self {
        Self {
            category: result.best_label.clone(),
            confidence: result.best_score,
            device_id: device_id.to_string(),
            timestamp,
        }
    }
}
