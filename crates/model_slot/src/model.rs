use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use core_types::{Action, ModelVersion};
use serde::{Deserialize, Serialize};

use crate::features::FEATURE_DIM;

/// Output of a model before the slot stamps it with a version.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPrediction {
    pub action: Action,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub action: Action,
    pub confidence: f64,
    pub model_version: ModelVersion,
    pub model_name: String,
}

pub trait InferenceModel: Send + Sync {
    fn name(&self) -> &str;

    fn predict(&self, features: &[f32]) -> Result<RawPrediction>;

    /// Checked once at staging time, before the model can be promoted.
    fn validate(&self) -> Result<()> {
        let probe = self.predict(&[0.5; FEATURE_DIM])?;
        if !(0.0..=1.0).contains(&probe.confidence) {
            bail!("probe confidence {} outside [0,1]", probe.confidence);
        }
        Ok(())
    }
}

pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn InferenceModel>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyClass {
    pub action: Action,
    pub weights: Vec<f32>,
    #[serde(default)]
    pub bias: f32,
}

/// Softmax over one linear score per candidate action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPolicyModel {
    pub name: String,
    pub classes: Vec<PolicyClass>,
}

impl LinearPolicyModel {
    fn scores(&self, features: &[f32]) -> Vec<f32> {
        self.classes
            .iter()
            .map(|c| {
                c.weights
                    .iter()
                    .zip(features)
                    .map(|(w, x)| w * x)
                    .sum::<f32>()
                    + c.bias
            })
            .collect()
    }
}

impl InferenceModel for LinearPolicyModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, features: &[f32]) -> Result<RawPrediction> {
        if features.len() != FEATURE_DIM {
            bail!("expected {FEATURE_DIM} features, got {}", features.len());
        }
        let scores = self.scores(features);
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp = scores.iter().map(|s| (s - max).exp()).collect::<Vec<_>>();
        let total: f32 = exp.iter().sum();
        let (best, p) = exp
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .ok_or_else(|| anyhow!("model has no classes"))?;
        Ok(RawPrediction {
            action: self.classes[best].action.clone(),
            confidence: f64::from(p / total),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.classes.is_empty() {
            bail!("model `{}` has no classes", self.name);
        }
        for (i, class) in self.classes.iter().enumerate() {
            if class.weights.len() != FEATURE_DIM {
                bail!(
                    "class {i} has {} weights, expected {FEATURE_DIM}",
                    class.weights.len()
                );
            }
            if !class.bias.is_finite() || class.weights.iter().any(|w| !w.is_finite()) {
                bail!("class {i} has non-finite parameters");
            }
        }
        let probe = self.predict(&[0.5; FEATURE_DIM])?;
        if !probe.confidence.is_finite() {
            bail!("probe produced non-finite confidence");
        }
        Ok(())
    }
}

/// Loads [`LinearPolicyModel`] files written by the training job as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonModelLoader;

impl ModelLoader for JsonModelLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn InferenceModel>> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read model file {}", path.display()))?;
        let model: LinearPolicyModel = serde_json::from_str(&raw)
            .with_context(|| format!("parse model file {}", path.display()))?;
        Ok(Arc::new(model))
    }
}

#[cfg(test)]
mod tests {
    use core_types::ActionKind;

    use super::*;

    fn model() -> LinearPolicyModel {
        let mut heal = vec![0.0; FEATURE_DIM];
        heal[0] = -8.0;
        LinearPolicyModel {
            name: "tiny".to_string(),
            classes: vec![
                PolicyClass {
                    action: Action::new(ActionKind::UseItem).with_param("item", "Red Potion"),
                    weights: heal,
                    bias: 4.0,
                },
                PolicyClass {
                    action: Action::new(ActionKind::Attack),
                    weights: vec![0.0; FEATURE_DIM],
                    bias: 0.0,
                },
            ],
        }
    }

    #[test]
    fn low_hp_prefers_healing() {
        let m = model();
        let mut f = [0.5f32; FEATURE_DIM];
        f[0] = 0.1;
        let p = m.predict(&f).expect("predict");
        assert_eq!(p.action.kind, ActionKind::UseItem);
        assert!(p.confidence > 0.9);

        f[0] = 1.0;
        let p = m.predict(&f).expect("predict");
        assert_eq!(p.action.kind, ActionKind::Attack);
    }

    #[test]
    fn wrong_feature_width_is_an_error() {
        assert!(model().predict(&[0.0; 3]).is_err());
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        let mut m = model();
        assert!(m.validate().is_ok());
        m.classes[1].weights.pop();
        assert!(m.validate().is_err());
        m.classes.clear();
        assert!(m.validate().is_err());
    }

    #[test]
    fn json_loader_reads_model_file() {
        let path = std::env::temp_dir().join(format!("model-{}.json", core_types::new_id()));
        fs::write(&path, serde_json::to_string(&model()).expect("encode")).expect("write");
        let loaded = JsonModelLoader.load(&path).expect("load");
        assert_eq!(loaded.name(), "tiny");
        assert!(loaded.validate().is_ok());
        let _ = fs::remove_file(path);

        assert!(JsonModelLoader
            .load(Path::new("/definitely/not/here.json"))
            .is_err());
    }
}
