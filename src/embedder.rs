//! HTTP embedding client. Documents and queries go through different entry
//! points: queries get the retrieval-instruction prefix prepended before the
//! model sees them, so the two spaces stay asymmetric. Output vectors are
//! normalised to unit length, which lets the search layer use plain dot
//! products for cosine similarity.

use std::time::Duration;

use crate::Config;

pub(crate) const QUERY_PREFIX: &str =
    "Represent this sentence for searching relevant passages: ";

pub(crate) struct Embedder {
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl Embedder {
    /// None when no embedder endpoint is configured; callers treat that as
    /// `embedder.unavailable` per their own policy (skip on write, fail on
    /// search).
    pub(crate) fn from_config(config: &Config) -> Option<Embedder> {
        let base_url = config.embedder_url.clone()?;
        Some(Embedder {
            base_url,
            api_key: config.embedder_api_key.clone(),
            model: config.embedder_model.clone(),
            timeout: Duration::from_secs(config.embed_timeout_secs),
        })
    }

    pub(crate) fn embed_document(&self, text: &str) -> Result<Vec<f32>, String> {
        self.request(text)
    }

    pub(crate) fn embed_query(&self, text: &str) -> Result<Vec<f32>, String> {
        self.request(&query_text(text))
    }

    fn request(&self, input: &str) -> Result<Vec<f32>, String> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.timeout)
            .timeout_read(self.timeout)
            .timeout_write(self.timeout)
            .build();
        let body = serde_json::json!({
            "model": self.model,
            "input": [input],
        });
        let mut request = agent
            .post(&self.base_url)
            .set("content-type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.set("authorization", &format!("Bearer {key}"));
        }
        let response = request
            .send_json(body)
            .map_err(|e| format!("embedder unavailable: {e}"))?;
        let payload: serde_json::Value = response
            .into_json()
            .map_err(|e| format!("embedder response: {e}"))?;
        let mut vector = parse_embedding_response(&payload)?;
        if !normalize(&mut vector) {
            return Err("embedder returned a zero vector".to_string());
        }
        Ok(vector)
    }
}

/// The exact text sent to the model for a query embedding.
pub(crate) fn query_text(text: &str) -> String {
    format!("{QUERY_PREFIX}{text}")
}

/// First embedding out of an OpenAI-shaped response body.
pub(crate) fn parse_embedding_response(payload: &serde_json::Value) -> Result<Vec<f32>, String> {
    let data = payload
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or("embedder response missing data array")?;
    let first = data.first().ok_or("embedder response data is empty")?;
    let raw = first
        .get("embedding")
        .and_then(|v| v.as_array())
        .ok_or("embedder response missing embedding")?;
    let mut vector = Vec::with_capacity(raw.len());
    for value in raw {
        let number = value
            .as_f64()
            .ok_or("embedder embedding value is not numeric")?;
        vector.push(number as f32);
    }
    if vector.is_empty() {
        return Err("embedder returned an empty embedding".to_string());
    }
    Ok(vector)
}

/// Scale to unit length in place. Returns false for a zero vector.
pub(crate) fn normalize(vector: &mut [f32]) -> bool {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return false;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        assert!(normalize(&mut v));
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_rejects_zero_vector() {
        let mut v = vec![0.0, 0.0, 0.0];
        assert!(!normalize(&mut v));
    }

    #[test]
    fn test_query_prefix_asymmetry() {
        let q = query_text("what is rust");
        assert!(q.starts_with(QUERY_PREFIX));
        assert_ne!(q, "what is rust");
        // documents never get the prefix
        assert!(!"what is rust".starts_with(QUERY_PREFIX));
    }

    #[test]
    fn test_parse_embedding_response() {
        let payload = serde_json::json!({
            "data": [{ "index": 0, "embedding": [0.5, 1.5, -2.0] }]
        });
        assert_eq!(
            parse_embedding_response(&payload).unwrap(),
            vec![0.5, 1.5, -2.0]
        );

        let bad = serde_json::json!({ "data": [] });
        assert!(parse_embedding_response(&bad).is_err());
        let worse = serde_json::json!({ "error": "nope" });
        assert!(parse_embedding_response(&worse).is_err());
    }
}
