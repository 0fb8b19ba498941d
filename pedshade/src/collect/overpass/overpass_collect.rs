use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use geo::{CoordsIter, MultiPolygon};
use reqwest::blocking::Client;
use serde::Deserialize;

use crate::collect::global_variables::{OVERPASS_TIMEOUT_SECS, OVERPASS_URL};
use crate::config::NetworkSource;
use crate::error::{PipelineError, Result};
use crate::geometric::street_network::WayFilter;

/// Overpass `[out:json]` document
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OverpassResponse {
    #[serde(default)]
    pub elements: Vec<OverpassElement>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OverpassElement {
    Node {
        id: i64,
        lat: f64,
        lon: f64,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
    Way {
        id: i64,
        #[serde(default)]
        nodes: Vec<i64>,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
    /// Relations and areas carry nothing the walk network needs
    #[serde(other)]
    Other,
}

impl OverpassResponse {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| PipelineError::Network(format!("Invalid Overpass response: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| PipelineError::io(path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::io(path, format!("invalid Overpass JSON: {}", e)))
    }
}

/// Client for the OpenStreetMap Overpass API
pub struct OverpassCollect {
    pub endpoint: String,
    pub timeout_secs: u64,
    pub content: Option<Vec<u8>>,
}

impl Default for OverpassCollect {
    fn default() -> Self {
        OverpassCollect::new(OVERPASS_URL, OVERPASS_TIMEOUT_SECS)
    }
}

impl OverpassCollect {
    pub fn new(endpoint: &str, timeout_secs: u64) -> Self {
        OverpassCollect {
            endpoint: endpoint.to_string(),
            timeout_secs,
            content: None,
        }
    }

    /// Ways passing `filter` inside `aoi` (WGS84, x = lon) plus their nodes.
    /// Every part of the area gets its own `way` statement in the union.
    pub fn build_query(&self, aoi: &MultiPolygon<f64>, filter: &WayFilter) -> String {
        let way_filter = filter.to_overpass_filter();
        let ways: String = aoi
            .iter()
            .map(|part| {
                let poly = part
                    .exterior()
                    .coords_iter()
                    .map(|c| format!("{:.7} {:.7}", c.y, c.x))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("way{}(poly:\"{}\");", way_filter, poly)
            })
            .collect();

        format!("[out:json][timeout:{}];({}>;);out;", self.timeout_secs, ways)
    }

    pub fn execute(&mut self, query: &str) -> Result<()> {
        let client = Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs + 30))
            .build()
            .map_err(|e| PipelineError::Network(format!("Failed to build HTTP client: {}", e)))?;

        log::info!("Querying Overpass API at {}", self.endpoint);
        log::debug!("Overpass query: {}", query);

        let response = client
            .post(&self.endpoint)
            .form(&[("data", query)])
            .send()
            .map_err(|e| PipelineError::Network(format!("Overpass request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(PipelineError::Network(format!(
                "Overpass API returned error {}: {}",
                status, body
            )));
        }

        let bytes = response
            .bytes()
            .map_err(|e| PipelineError::Network(format!("Failed to read response body: {}", e)))?;
        self.content = Some(bytes.to_vec());
        Ok(())
    }

    pub fn get_response(&self) -> Result<OverpassResponse> {
        let content = self.content.as_deref().ok_or_else(|| {
            PipelineError::Network("No Overpass content; call execute first".to_string())
        })?;
        OverpassResponse::from_slice(content)
    }
}

/// Fetch or load the raw OSM data for the walk network
pub fn load_network_data(
    source: &NetworkSource,
    aoi: &MultiPolygon<f64>,
    filter: &WayFilter,
) -> Result<OverpassResponse> {
    match source {
        NetworkSource::Overpass {
            endpoint,
            timeout_secs,
        } => {
            let mut collect = OverpassCollect::new(endpoint, *timeout_secs);
            let query = collect.build_query(aoi, filter);
            collect.execute(&query)?;
            collect.get_response()
        }
        NetworkSource::File { path } => {
            log::info!("Loading OSM network from {:?}", path);
            OverpassResponse::from_file(path)
        }
    }
}
