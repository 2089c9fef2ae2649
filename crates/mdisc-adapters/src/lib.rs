//! Point-of-interest source contract + the Overpass adapter that feeds venue ingestion.

use std::collections::BTreeMap;

use async_trait::async_trait;
use mdisc_core::{Category, Venue, UNNAMED_VENUE};
use mdisc_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mdisc-adapters";

pub const DEFAULT_OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";
pub const DEFAULT_AREA_NAME: &str = "München";

/// Server-side query budget used when no client timeout is configured.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 25;

/// Tag rules in priority order; the first matching rule decides the category.
const CATEGORY_RULES: &[(&str, &str, Category)] = &[
    ("amenity", "pub", Category::Pub),
    ("tourism", "museum", Category::Museum),
    ("tourism", "attraction", Category::Landmark),
    ("tourism", "viewpoint", Category::Viewpoint),
    ("amenity", "cafe", Category::Cafe),
    ("leisure", "park", Category::Park),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverpassResponse {
    #[serde(default)]
    pub elements: Vec<OverpassElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverpassElement {
    #[serde(rename = "type", default)]
    pub element_type: String,
    pub id: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub tags: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid Overpass JSON payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Anything that can hand the ingestion pipeline one snapshot of raw elements.
#[async_trait]
pub trait PoiSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_elements(&self) -> Result<Vec<OverpassElement>, AdapterError>;
}

/// Issues the fixed venue query against one Overpass endpoint.
#[derive(Debug, Clone)]
pub struct OverpassSource {
    http: HttpFetcher,
    endpoint: String,
    area: String,
    timeout_secs: u64,
}

impl OverpassSource {
    /// `timeout_secs` should match the client timeout of `http` so the server
    /// gives up no later than the client does.
    pub fn new(
        http: HttpFetcher,
        endpoint: impl Into<String>,
        area: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            area: area.into(),
            timeout_secs,
        }
    }

    pub fn query(&self) -> String {
        build_overpass_query(&self.area, self.timeout_secs)
    }
}

#[async_trait]
impl PoiSource for OverpassSource {
    fn source_id(&self) -> &'static str {
        "overpass"
    }

    async fn fetch_elements(&self) -> Result<Vec<OverpassElement>, AdapterError> {
        info!(endpoint = %self.endpoint, area = %self.area, "fetching venues from Overpass");
        let query = self.query();
        let resp = self
            .http
            .post_form(&self.endpoint, &[("data", query.as_str())])
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    warn!(timeout_secs = self.timeout_secs, "Overpass request timed out");
                }
                err
            })?;
        let elements = parse_overpass_response(&resp.body)?;
        info!(
            status = resp.status.as_u16(),
            url = %resp.final_url,
            elements = elements.len(),
            "received Overpass elements"
        );
        Ok(elements)
    }
}

pub fn parse_overpass_response(body: &[u8]) -> Result<Vec<OverpassElement>, AdapterError> {
    let decoded: OverpassResponse = serde_json::from_slice(body)?;
    Ok(decoded.elements)
}

/// Overpass QL for pubs, museums/attractions/viewpoints, cafés and parks inside
/// the named area, with `timeout_secs` as the server-side budget.
pub fn build_overpass_query(area: &str, timeout_secs: u64) -> String {
    let area = area.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        r#"[out:json][timeout:{timeout_secs}];
area["name"="{area}"]->.searchArea;
(
  node["amenity"="pub"](area.searchArea);
  node["tourism"~"museum|attraction|viewpoint"](area.searchArea);
  node["amenity"="cafe"](area.searchArea);
  node["leisure"="park"](area.searchArea);
);
out body;
>;
out skel qt;"#
    )
}

pub fn category_for_tags(tags: &BTreeMap<String, String>) -> Category {
    CATEGORY_RULES
        .iter()
        .find(|(key, value, _)| tags.get(*key).is_some_and(|v| v == value))
        .map(|(_, _, category)| *category)
        .unwrap_or(Category::Other)
}

/// Map one element to a venue. Elements without tags or without both
/// coordinates yield `None`; address tags are copied as-is.
pub fn element_to_venue(element: &OverpassElement) -> Option<Venue> {
    let tags = element.tags.as_ref()?;
    let latitude = element.lat?;
    let longitude = element.lon?;

    let name = tags
        .get("name")
        .or_else(|| tags.get("ref"))
        .cloned()
        .unwrap_or_else(|| UNNAMED_VENUE.to_string());

    Some(Venue {
        id: element.id.to_string(),
        name,
        category: category_for_tags(tags),
        street: tags.get("addr:street").cloned(),
        house_number: tags.get("addr:housenumber").cloned(),
        latitude,
        longitude,
        description: tags
            .get("description")
            .or_else(|| tags.get("note"))
            .cloned(),
    })
}

/// Result of mapping a provider snapshot: how many elements parsed into venues
/// and which of those carry a complete address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedVenues {
    pub parsed: usize,
    pub venues: Vec<Venue>,
}

pub fn venues_from_elements(elements: &[OverpassElement]) -> MappedVenues {
    let parsed = elements.iter().filter_map(element_to_venue).collect::<Vec<_>>();
    let total = parsed.len();
    let venues = parsed
        .into_iter()
        .filter(Venue::has_complete_address)
        .collect();
    MappedVenues {
        parsed: total,
        venues,
    }
}
