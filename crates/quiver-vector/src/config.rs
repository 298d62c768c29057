//! Quantizer configuration.
//!
//! These are the plain-data parameter types the schema registry
//! deserializes from a collection definition and hands to
//! [`VectorStore::new`](crate::store::VectorStore::new).

use serde::{Deserialize, Serialize};

/// Parameters for the product quantizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductQuantizerParams {
    /// Number of subvectors (M). Must divide the vector dimension evenly.
    pub num_subvectors: usize,
    /// Number of centroids per subvector (K), at most 256 so codes fit in
    /// a byte.
    pub num_centroids: usize,
    /// Minimum number of stored points before `fit` trains the codebook.
    pub trigger_threshold: usize,
}

/// Parameters for the binary quantizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryQuantizerParams {
    /// Optional fixed threshold broadcast over every dimension. When
    /// absent, `fit` learns the per-dimension mean instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    /// Minimum number of stored points before `fit` learns the threshold.
    pub trigger_threshold: usize,
    /// Name of the bit kernel (`hamming` or `jaccard`).
    pub distance_metric: String,
}

/// Which quantizer a collection uses for its vector storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QuantizerKind {
    /// No compression; points keep their full-precision vectors.
    None,
    /// Product quantization.
    Product(ProductQuantizerParams),
    /// Binary quantization.
    Binary(BinaryQuantizerParams),
}

impl Default for QuantizerKind {
    fn default() -> Self {
        Self::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_params_from_json() {
        let kind: QuantizerKind = serde_json::from_str(
            r#"{"type": "product", "numSubvectors": 2, "numCentroids": 256, "triggerThreshold": 10000}"#,
        )
        .unwrap();
        assert_eq!(
            kind,
            QuantizerKind::Product(ProductQuantizerParams {
                num_subvectors: 2,
                num_centroids: 256,
                trigger_threshold: 10000,
            })
        );
    }

    #[test]
    fn binary_params_threshold_is_optional() {
        let kind: QuantizerKind = serde_json::from_str(
            r#"{"type": "binary", "triggerThreshold": 5000, "distanceMetric": "hamming"}"#,
        )
        .unwrap();
        let QuantizerKind::Binary(params) = kind else { panic!("expected binary") };
        assert_eq!(params.threshold, None);
        assert_eq!(params.distance_metric, "hamming");
    }

    #[test]
    fn none_round_trips() {
        let json = serde_json::to_string(&QuantizerKind::None).unwrap();
        assert_eq!(json, r#"{"type":"none"}"#);
        assert_eq!(serde_json::from_str::<QuantizerKind>(&json).unwrap(), QuantizerKind::None);
    }
}
