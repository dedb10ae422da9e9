//! Geocoding HTTP client.
//!
//! Two calls: forward (district text → WKT point) used by the producers,
//! reverse (WKT point → address text) used when composing candidate
//! payloads. Callers cache results in the KV store, so this client stays
//! stateless.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocode request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geocode response missing field {0}")]
    Shape(&'static str),
}

#[derive(Deserialize)]
struct ForwardReply {
    location: Option<String>,
}

#[derive(Deserialize)]
struct ReverseReply {
    address: Option<String>,
}

pub struct Geocoder {
    client: reqwest::Client,
    base_url: String,
}

impl Geocoder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Address text → `POINT(lng lat)` WKT.
    pub async fn geocode(&self, address: &str) -> Result<String, GeocodeError> {
        let reply: ForwardReply = self
            .client
            .get(format!("{}/geo", self.base_url))
            .query(&[("address", address)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let location = reply.location.ok_or(GeocodeError::Shape("location"))?;
        Ok(format!("POINT({})", location.replace(',', " ")))
    }

    /// WKT point → human-readable address.
    pub async fn reverse_geocode(&self, point: &str) -> Result<String, GeocodeError> {
        let reply: ReverseReply = self
            .client
            .get(format!("{}/regeo", self.base_url))
            .query(&[("point", point)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        reply.address.ok_or(GeocodeError::Shape("address"))
    }
}
