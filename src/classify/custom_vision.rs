//! Azure Custom Vision prediction client.
//!
//! The portal hands out a prediction URL such as
//! `https://<host>/customvision/v3.0/Prediction/<project>/classify/iterations/<iteration>/image`.
//! Endpoint, project id and iteration name are taken from its `/`-separated
//! segments 2, 6 and 9.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use super::{Classifier, Prediction};

const API_VERSION_PATH: [&str; 3] = ["customvision", "v3.0", "Prediction"];
const HOST_SEGMENT: usize = 2;
const PROJECT_SEGMENT: usize = 6;
const ITERATION_SEGMENT: usize = 9;
const MAX_ERROR_BODY: usize = 256;

/// Where to send classification requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PredictionEndpoint {
    /// `https://<host>`
    pub endpoint: String,
    pub project_id: String,
    pub iteration_name: String,
}

impl PredictionEndpoint {
    pub fn parse(prediction_url: &str) -> Result<Self> {
        let parts: Vec<&str> = prediction_url.trim().split('/').collect();
        let segment = |index: usize, what: &str| -> Result<String> {
            parts
                .get(index)
                .filter(|part| !part.is_empty())
                .map(|part| part.to_string())
                .ok_or_else(|| anyhow!("prediction URL is missing the {} (segment {})", what, index))
        };
        let host = segment(HOST_SEGMENT, "host")?;
        Ok(Self {
            endpoint: format!("https://{}", host),
            project_id: segment(PROJECT_SEGMENT, "project id")?,
            iteration_name: segment(ITERATION_SEGMENT, "iteration name")?,
        })
    }

    /// Classify-image URL for this project iteration.
    pub fn classify_image_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)
            .with_context(|| format!("invalid prediction endpoint {}", self.endpoint))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("prediction endpoint cannot carry a path"))?
            .clear()
            .extend(API_VERSION_PATH)
            .push(&self.project_id)
            .extend(["classify", "iterations"])
            .push(&self.iteration_name)
            .push("image");
        Ok(url)
    }
}

#[derive(Debug, Deserialize)]
struct ImagePrediction {
    #[serde(default)]
    predictions: Vec<PredictionModel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PredictionModel {
    tag_name: String,
    probability: f64,
}

/// Blocking Custom Vision client with a per-request timeout.
pub struct CustomVisionClient {
    agent: ureq::Agent,
    url: Url,
    prediction_key: String,
}

impl CustomVisionClient {
    pub fn new(endpoint: &PredictionEndpoint, prediction_key: &str, timeout: Duration) -> Result<Self> {
        if prediction_key.trim().is_empty() {
            return Err(anyhow!("prediction key is empty"));
        }
        let url = endpoint.classify_image_url()?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        log::info!(
            "custom vision endpoint {} project={} iteration={}",
            endpoint.endpoint,
            endpoint.project_id,
            endpoint.iteration_name
        );
        Ok(Self {
            agent,
            url,
            prediction_key: prediction_key.trim().to_string(),
        })
    }
}

impl Classifier for CustomVisionClient {
    fn classify(&mut self, image: &[u8]) -> Result<Vec<Prediction>> {
        if image.is_empty() {
            return Err(anyhow!("refusing to classify an empty image"));
        }
        let response = self
            .agent
            .post(self.url.as_str())
            .set("Prediction-Key", &self.prediction_key)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(image);
        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(anyhow!(
                    "custom vision returned status {}: {}",
                    code,
                    truncate(&body, MAX_ERROR_BODY)
                ));
            }
            Err(e) => return Err(anyhow!("custom vision request failed: {}", e)),
        };
        let body = response
            .into_string()
            .context("read custom vision response")?;
        parse_predictions(&body)
    }
}

fn parse_predictions(body: &str) -> Result<Vec<Prediction>> {
    let parsed: ImagePrediction =
        serde_json::from_str(body).context("failed to parse custom vision response")?;
    Ok(parsed
        .predictions
        .into_iter()
        .map(|p| Prediction::new(p.tag_name, p.probability))
        .collect())
}

fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}
