//! Image classification.
//!
//! The classifier collaborator returns raw `(label, probability)` pairs. The
//! loop turns them into a `PredictionSet`: entries strictly above the
//! threshold, scaled to percent and rounded to two decimals.

use anyhow::Result;
use serde::ser::{Serialize, SerializeMap, Serializer};

mod custom_vision;

pub use custom_vision::{CustomVisionClient, PredictionEndpoint};

/// One tag returned by the classification service.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub tag_name: String,
    /// Raw probability in 0..=1.
    pub probability: f64,
}

impl Prediction {
    pub fn new(tag_name: impl Into<String>, probability: f64) -> Self {
        Self {
            tag_name: tag_name.into(),
            probability,
        }
    }
}

/// Classification collaborator.
pub trait Classifier {
    fn classify(&mut self, image: &[u8]) -> Result<Vec<Prediction>>;
}

/// Thresholded label → percent mapping, in classifier order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PredictionSet {
    entries: Vec<(String, f64)>,
}

impl PredictionSet {
    pub fn from_predictions(predictions: &[Prediction], threshold: f64) -> Self {
        let mut set = Self::default();
        for prediction in predictions {
            if prediction.probability > threshold {
                set.insert(&prediction.tag_name, to_percent(prediction.probability));
            }
        }
        set
    }

    // A repeated label keeps its slot and takes the newer value.
    fn insert(&mut self, label: &str, value: f64) {
        match self.entries.iter_mut().find(|(existing, _)| existing == label) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((label.to_string(), value)),
        }
    }

    /// Exact, case-sensitive label lookup.
    pub fn contains(&self, label: &str) -> bool {
        self.get(label).is_some()
    }

    pub fn get(&self, label: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == label)
            .map(|(_, value)| *value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries
            .iter()
            .map(|(label, value)| (label.as_str(), *value))
    }
}

impl Serialize for PredictionSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (label, value) in &self.entries {
            map.serialize_entry(label, value)?;
        }
        map.end()
    }
}

/// `round(probability * 100, 2)`, rounding the exact binary value once with
/// ties to even.
pub fn to_percent(probability: f64) -> f64 {
    let scaled = probability * 100.0;
    if !scaled.is_finite() {
        return scaled;
    }
    // 64 places hold the full expansion of any value that can round to 0.01.
    let exact = format!("{:.64}", scaled.abs());
    let Some((whole, frac)) = exact.split_once('.') else {
        return scaled;
    };
    let (kept, rest) = frac.split_at(2);
    let Ok(mut hundredths) = format!("{}{}", whole, kept).parse::<u64>() else {
        return scaled;
    };
    let round_up = match rest.as_bytes().first() {
        Some(b'5') => rest[1..].bytes().any(|d| d != b'0') || hundredths % 2 == 1,
        Some(d) => *d > b'5',
        None => false,
    };
    if round_up {
        hundredths += 1;
    }
    (hundredths as f64 / 100.0).copysign(scaled)
}
