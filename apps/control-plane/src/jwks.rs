use std::collections::HashMap;
use std::time::Duration;

use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::JwkSet;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    #[error("failed to fetch signing keys from {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("signing key {kid} is not usable: {message}")]
    UnusableKey { kid: String, message: String },
}

/// Fetches remote key sets and keeps them per URL; a kid miss triggers one refetch.
pub struct JwksCache {
    http: reqwest::Client,
    sets: Mutex<HashMap<String, JwkSet>>,
}

impl JwksCache {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http))
    }

    #[must_use]
    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            sets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn decoding_key(
        &self,
        url: &str,
        kid: Option<&str>,
    ) -> Result<Option<DecodingKey>, JwksError> {
        let cached = self.sets.lock().await.get(url).cloned();
        if let Some(set) = cached
            && let Some(key) = select_key(&set, kid)?
        {
            return Ok(Some(key));
        }

        let set = self.fetch(url).await?;
        let key = select_key(&set, kid)?;
        self.sets.lock().await.insert(url.to_string(), set);
        Ok(key)
    }

    async fn fetch(&self, url: &str) -> Result<JwkSet, JwksError> {
        let fetch_error = |message: String| JwksError::Fetch {
            url: url.to_string(),
            message,
        };
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|error| fetch_error(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("status {status}")));
        }
        response
            .json::<JwkSet>()
            .await
            .map_err(|error| fetch_error(error.to_string()))
    }
}

fn select_key(set: &JwkSet, kid: Option<&str>) -> Result<Option<DecodingKey>, JwksError> {
    let jwk = match kid {
        Some(kid) => set.find(kid),
        None if set.keys.len() == 1 => set.keys.first(),
        None => None,
    };
    jwk.map(|jwk| {
        DecodingKey::from_jwk(jwk).map_err(|error| JwksError::UnusableKey {
            kid: kid.unwrap_or_default().to_string(),
            message: error.to_string(),
        })
    })
    .transpose()
}
