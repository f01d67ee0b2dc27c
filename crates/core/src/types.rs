use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a monitored query (§3.1). Only `Active` queries are polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryStatus {
    Active,
    Paused,
    Failed,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Active => "ACTIVE",
            QueryStatus::Paused => "PAUSED",
            QueryStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(QueryStatus::Active),
            "PAUSED" => Some(QueryStatus::Paused),
            "FAILED" => Some(QueryStatus::Failed),
            _ => None,
        }
    }
}

/// A durable monitored query (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: i64,
    pub browser_url: String,
    pub request_url: String,
    pub query: Option<String>,
    pub next_check_time: Option<chrono::DateTime<chrono::Utc>>,
    pub status: QueryStatus,
}

/// Per-query diff cursor (§3.1) — one row per `request_url` that has ever
/// produced a non-ad listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestListing {
    pub request_url: String,
    pub item_id: String,
    pub title: String,
}

/// A listing as parsed from the upstream JSON search response (§3.1).
/// Unknown/opaque fields are preserved verbatim via `extra` so they can be
/// republished unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    #[serde(rename = "itemId")]
    pub item_id: String,
    pub title: String,
    #[serde(rename = "priorityProduct", default)]
    pub priority_product: String,
    /// Populated only for the first K entries of a publication batch (§4.5).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ListingDetails>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Listing {
    /// An entry is an ad iff `priorityProduct != "NONE"` (§4.5). All other
    /// boolean "trait" flags carried in `extra` are ignored for this check.
    pub fn is_ad(&self) -> bool {
        self.priority_product != "NONE"
    }

    /// Numeric suffix of `itemId` (shape `m<digits>`), used as the diff
    /// cursor (§3.2 invariant 2). Malformed ids sort as `0`.
    pub fn numeric_id(&self) -> u64 {
        numeric_suffix(&self.item_id)
    }
}

/// Parse the digits following the leading `m` in an item id like `m123456`.
pub fn numeric_suffix(item_id: &str) -> u64 {
    item_id
        .strip_prefix('m')
        .and_then(|digits| digits.parse::<u64>().ok())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingDetails {
    #[serde(rename = "bidsInfo", skip_serializing_if = "Option::is_none")]
    pub bids_info: Option<Value>,
    #[serde(rename = "sellerInfo", skip_serializing_if = "Option::is_none")]
    pub seller_info: Option<Value>,
}

/// Top-level shape of the upstream search response (§6.1).
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub listings: Vec<Listing>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_suffix_parses_digits_after_m() {
        assert_eq!(numeric_suffix("m120"), 120);
        assert_eq!(numeric_suffix("m1"), 1);
    }

    #[test]
    fn numeric_suffix_defaults_to_zero_on_malformed_id() {
        assert_eq!(numeric_suffix("bogus"), 0);
        assert_eq!(numeric_suffix(""), 0);
    }

    #[test]
    fn is_ad_true_for_any_non_none_priority() {
        let mut listing = Listing {
            item_id: "m1".into(),
            title: "t".into(),
            priority_product: "DAGTOPPER".into(),
            details: None,
            extra: Default::default(),
        };
        assert!(listing.is_ad());
        listing.priority_product = "NONE".into();
        assert!(!listing.is_ad());
    }
}
