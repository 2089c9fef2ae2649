//! Core domain model for Munich Discovery: venues, categories and page arithmetic.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "mdisc-core";

/// Placeholder returned by [`Venue::full_address`] when no street is known.
pub const ADDRESS_NOT_AVAILABLE: &str = "Address not available";

/// Display name used when the provider supplies neither `name` nor `ref`.
pub const UNNAMED_VENUE: &str = "Unnamed";

pub const DEFAULT_PAGE_SIZE: u32 = 15;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Closed set of venue classifications, derived from provider tags at ingestion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Pub,
    Museum,
    Landmark,
    Viewpoint,
    #[serde(rename = "Café")]
    Cafe,
    Park,
    Other,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Pub,
        Category::Museum,
        Category::Landmark,
        Category::Viewpoint,
        Category::Cafe,
        Category::Park,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Pub => "Pub",
            Category::Museum => "Museum",
            Category::Landmark => "Landmark",
            Category::Viewpoint => "Viewpoint",
            Category::Cafe => "Café",
            Category::Park => "Park",
            Category::Other => "Other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown venue category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    /// Exact, case-sensitive match against the display names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// A single point of interest, keyed by the provider-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Venue {
    pub id: String,
    pub name: String,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub house_number: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Venue {
    /// Street and house number joined by a space, or [`ADDRESS_NOT_AVAILABLE`].
    pub fn full_address(&self) -> String {
        match (non_blank(&self.street), non_blank(&self.house_number)) {
            (Some(street), Some(number)) => format!("{street} {number}"),
            (Some(street), None) => street.to_string(),
            (None, _) => ADDRESS_NOT_AVAILABLE.to_string(),
        }
    }

    /// Both address components present and non-blank.
    pub fn has_complete_address(&self) -> bool {
        non_blank(&self.street).is_some() && non_blank(&self.house_number).is_some()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// A 1-based page request with sane bounds applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Clamps `page` to at least 1 and `page_size` into `1..=MAX_PAGE_SIZE`.
    pub fn clamped(page: i64, page_size: i64) -> Self {
        let page = page.clamp(1, i64::from(u32::MAX)) as u32;
        let page_size = page_size.clamp(1, i64::from(MAX_PAGE_SIZE)) as u32;
        Self { page, page_size }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    pub fn limit(&self) -> u32 {
        self.page_size
    }
}

/// `ceil(total_count / page_size)`; zero matches yield zero pages.
pub fn total_pages(total_count: u64, page_size: u32) -> u64 {
    total_count.div_ceil(u64::from(page_size.max(1)))
}
