//! Pre-trained ETo regression model: a gradient-boosted tree ensemble stored
//! as JSON.
//!
//! Artifact layout:
//!
//! ```json
//! {
//!   "feature_names": ["min_temp", "max_temp", "humidity", "wind", "sun_hours", "radiation"],
//!   "base_score": 0.5,
//!   "trees": [
//!     { "nodes": [
//!         { "split": { "feature": 5, "threshold": 18.0, "left": 1, "right": 2 } },
//!         { "leaf": 2.9 },
//!         { "leaf": 4.4 }
//!     ] }
//!   ]
//! }
//! ```
//!
//! A split sends the row left when `x[feature] <= threshold`. The prediction is
//! `base_score` plus the leaf reached in every tree.
//!
//! Two entry points exist. [`TreeEnsemble::predict`] checks the named feature
//! row against the names the model was trained with. [`TreeEnsemble::predict_raw`]
//! takes a positional slice and only checks its length, for callers whose
//! feature naming drifted from the artifact's.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelLoadError};

// ---------------------------------------------------------------------------
// Inference paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InferencePath {
    /// Named features, checked against the artifact.
    Validated,
    /// Positional features, arity check only.
    Raw,
}

impl fmt::Display for InferencePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validated => write!(f, "validated"),
            Self::Raw => write!(f, "raw"),
        }
    }
}

/// Order in which the learned estimator tries the model's entry points.
pub const INFERENCE_CHAIN: [InferencePath; 2] = [InferencePath::Validated, InferencePath::Raw];

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf(f64),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeEnsemble {
    pub feature_names: Vec<String>,
    #[serde(default)]
    pub base_score: f64,
    pub trees: Vec<Tree>,
}

impl TreeEnsemble {
    /// Read and validate an artifact. Any failure here is a startup error.
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ModelLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let model: Self =
            serde_json::from_str(&contents).map_err(|source| ModelLoadError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        model.validate()?;
        Ok(model)
    }

    /// Structural checks: every tree is non-empty, node links stay in range
    /// and only point forward, and splits reference known features.
    pub fn validate(&self) -> Result<(), ModelLoadError> {
        let invalid = |msg: String| Err(ModelLoadError::Invalid(msg));

        if self.feature_names.is_empty() {
            return invalid("no feature names".into());
        }
        if self.trees.is_empty() {
            return invalid("no trees".into());
        }
        if !self.base_score.is_finite() {
            return invalid("base_score is not finite".into());
        }

        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return invalid(format!("tree {t} has no nodes"));
            }
            let len = tree.nodes.len();
            for (i, node) in tree.nodes.iter().enumerate() {
                match *node {
                    Node::Split {
                        feature,
                        threshold,
                        left,
                        right,
                    } => {
                        if feature >= self.feature_names.len() {
                            return invalid(format!(
                                "tree {t} node {i}: feature {feature} out of range (have {})",
                                self.feature_names.len()
                            ));
                        }
                        if !threshold.is_finite() {
                            return invalid(format!("tree {t} node {i}: threshold not finite"));
                        }
                        for child in [left, right] {
                            if child <= i || child >= len {
                                return invalid(format!(
                                    "tree {t} node {i}: child {child} must be in ({i}, {len})"
                                ));
                            }
                        }
                    }
                    Node::Leaf(v) => {
                        if !v.is_finite() {
                            return invalid(format!("tree {t} node {i}: leaf not finite"));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    /// Primary entry point: names and order must match the training features.
    pub fn predict(&self, row: &[(&str, f64)]) -> Result<f64, ModelError> {
        if row.len() != self.n_features() {
            return Err(ModelError::Arity {
                expected: self.n_features(),
                got: row.len(),
            });
        }
        for (index, ((name, _), expected)) in row.iter().zip(&self.feature_names).enumerate() {
            if *name != expected.as_str() {
                return Err(ModelError::FeatureMismatch {
                    index,
                    expected: expected.clone(),
                    got: (*name).to_string(),
                });
            }
        }
        let values: Vec<f64> = row.iter().map(|(_, v)| *v).collect();
        self.predict_raw(&values)
    }

    /// Secondary entry point: positional features, no name check.
    pub fn predict_raw(&self, x: &[f64]) -> Result<f64, ModelError> {
        if x.len() != self.n_features() {
            return Err(ModelError::Arity {
                expected: self.n_features(),
                got: x.len(),
            });
        }
        if let Some(index) = x.iter().position(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite { index });
        }
        Ok(self.base_score + self.trees.iter().map(|t| eval_tree(t, x)).sum::<f64>())
    }
}

fn eval_tree(tree: &Tree, x: &[f64]) -> f64 {
    let mut idx = 0;
    loop {
        match tree.nodes[idx] {
            Node::Leaf(v) => return v,
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                idx = if x[feature] <= threshold { left } else { right };
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
