use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Decision label. The discriminant is the class index the classifier emits.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, AsRefStr,
)]
pub enum Label {
    Fake = 0,
    Real = 1,
}

impl Label {
    pub fn from_class_id(class_id: u8) -> Option<Self> {
        match class_id {
            0 => Some(Label::Fake),
            1 => Some(Label::Real),
            _ => None,
        }
    }

    pub fn class_id(self) -> u8 {
        self as u8
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Probabilities {
    pub fake: f32,
    pub real: f32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PredictionResponse {
    pub prediction: Label,
    pub confidence: f32,
    pub probabilities: Probabilities,
    pub class_id: u8,
}

/// One entry of a batch response, in request order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum BatchEntry {
    Prediction {
        filename: String,
        #[serde(flatten)]
        result: PredictionResponse,
    },
    Error {
        filename: String,
        error: String,
    },
}

impl BatchEntry {
    pub fn filename(&self) -> &str {
        match self {
            BatchEntry::Prediction { filename, .. } | BatchEntry::Error { filename, .. } => {
                filename
            }
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BatchResponse {
    pub results: Vec<BatchEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Base64Request {
    pub image: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub model_loaded: bool,
    pub device: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample() -> PredictionResponse {
        PredictionResponse {
            prediction: Label::Real,
            confidence: 0.75,
            probabilities: Probabilities {
                fake: 0.25,
                real: 0.75,
            },
            class_id: 1,
        }
    }

    #[test]
    fn label_maps_to_class_index() {
        assert_eq!(Label::from_class_id(0), Some(Label::Fake));
        assert_eq!(Label::from_class_id(1), Some(Label::Real));
        assert_eq!(Label::from_class_id(2), None);
        assert_eq!(Label::Real.class_id(), 1);
        assert_eq!(Label::Real.to_string(), "Real");
        assert_eq!(Label::from_str("Fake").ok(), Some(Label::Fake));
    }

    #[test]
    fn prediction_serializes_with_flat_shape() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["prediction"], "Real");
        assert_eq!(value["class_id"], 1);
        assert_eq!(value["probabilities"]["fake"], 0.25);
    }

    #[test]
    fn batch_entries_are_untagged() {
        let ok = BatchEntry::Prediction {
            filename: "a.png".into(),
            result: sample(),
        };
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["filename"], "a.png");
        assert_eq!(value["prediction"], "Real");

        let failed: BatchEntry =
            serde_json::from_str(r#"{"filename":"b.png","error":"bad bytes"}"#).unwrap();
        assert_eq!(failed.filename(), "b.png");
        assert!(matches!(failed, BatchEntry::Error { .. }));

        let parsed: BatchEntry = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, ok);
    }
}
