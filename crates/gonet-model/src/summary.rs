use serde::{Deserialize, Serialize};

/// Metrics of one training step or evaluation batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub loss: f32,
    pub move_accuracy: f32,
    pub outcome_accuracy: f32,
    pub learning_rate: f64,
    pub temperature: f64,
    /// Pre-clip global gradient norm; absent for evaluation batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f32>,
}
