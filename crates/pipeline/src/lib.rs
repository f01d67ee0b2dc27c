//! Listing-diff & enrich pipeline (C6, §4.5).
//!
//! `diff_new_listings` is the pure core (ad filtering, cursor comparison,
//! newest-first sort) kept separate from I/O so it is directly testable
//! against the literal scenarios in §8.2. `process` wires it to storage, the
//! fetch client, and the publisher.

use std::sync::Arc;

use marketwatch_client::{FetchClient, ENRICH_RETRY_STATUSES};
use marketwatch_core::{numeric_suffix, Listing, ListingDetails, NotifierError};
use marketwatch_publisher::Publisher;
use marketwatch_storage::Storage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

/// Default number of newest listings that get the secondary enrich fetch
/// (§4.5, `K`).
pub const DEFAULT_ENRICH_COUNT: usize = 5;

static WINDOW_CONFIG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)window\.__CONFIG__\s*=\s*(\{.*?\});").unwrap());

/// Filter ads, keep only listings newer than `latest_id`, sort newest-first
/// (§4.5 steps 2-5). Pure — no I/O.
pub fn diff_new_listings(listings: Vec<Listing>, latest_id: u64) -> Vec<Listing> {
    let mut new: Vec<Listing> = listings
        .into_iter()
        .filter(|l| !l.is_ad() && l.numeric_id() > latest_id)
        .collect();
    new.sort_by(|a, b| b.numeric_id().cmp(&a.numeric_id()));
    new
}

/// Process one query's raw listings batch: diff, upsert cursor, enrich the
/// top K, publish (§4.5). Returns `Ok(())` whether or not anything new was
/// found; upstream/parse failures surface as `Err` for the caller (the
/// scheduler) to mark the query `FAILED` and emit `request_url_error`.
pub async fn process(
    storage: &Storage,
    publisher: &Publisher,
    client: &FetchClient,
    request_url: &str,
    listings: Vec<Listing>,
    enrich_count: usize,
) -> Result<(), NotifierError> {
    // Step 1: the query may have been deleted between dispatch and now.
    if !storage.query_exists_by_request_url(request_url).await? {
        warn!(request_url, "query deleted mid-tick, skipping");
        return Ok(());
    }

    let latest_id = storage
        .get_latest_listing_id(request_url)
        .await?
        .map(|id| numeric_suffix(&id))
        .unwrap_or(0);

    let mut new = diff_new_listings(listings, latest_id);
    if new.is_empty() {
        info!(request_url, "no new listings");
        return Ok(());
    }

    storage
        .upsert_latest_listing(request_url, &new[0].item_id, &new[0].title)
        .await?;

    for listing in new.iter_mut().take(enrich_count) {
        match enrich_listing(client, listing).await {
            Ok(details) => listing.details = Some(details),
            Err(e) => warn!(item_id = %listing.item_id, error = %e, "enrichment failed, publishing without details"),
        }
    }

    publisher.publish_listings(request_url, &new).await?;
    Ok(())
}

/// Given an item id, scrape the item page for bid/seller info and fetch the
/// seller profile (§4.5 enrich sub-routine).
async fn enrich_listing(client: &FetchClient, listing: &Listing) -> Result<ListingDetails, NotifierError> {
    let item_url = format!("https://www.2dehands.be/{}", listing.item_id);
    let html = client.fetch_text(&item_url, ENRICH_RETRY_STATUSES).await?;
    let config = extract_window_config(&html)?;

    let bids_info = config.pointer("/listing/bidsInfo").cloned();
    let seller_id = config
        .pointer("/listing/seller/id")
        .and_then(value_as_id_string);

    let seller_info = match seller_id {
        Some(seller_id) => {
            let url = format!("https://www.2dehands.be/v/api/seller-profile/{seller_id}");
            Some(client.fetch_json(&url, ENRICH_RETRY_STATUSES).await?)
        }
        None => None,
    };

    Ok(ListingDetails { bids_info, seller_info })
}

fn extract_window_config(html: &str) -> Result<Value, NotifierError> {
    let captured = WINDOW_CONFIG_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .ok_or_else(|| NotifierError::Parse("window.__CONFIG__ not found".to_string()))?;
    serde_json::from_str(captured.as_str()).map_err(|e| NotifierError::Parse(e.to_string()))
}

fn value_as_id_string(v: &Value) -> Option<String> {
    v.as_str()
        .map(str::to_string)
        .or_else(|| v.as_i64().map(|n| n.to_string()))
}

/// Convenience for wiring a shared client into several queries' pipelines
/// concurrently (§5's allowed promotion to concurrent dispatch) without
/// cloning the underlying `reqwest::Client`.
pub type SharedClient = Arc<FetchClient>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listing(item_id: &str, priority: &str) -> Listing {
        serde_json::from_value(json!({
            "itemId": item_id,
            "title": format!("listing {item_id}"),
            "priorityProduct": priority,
        }))
        .unwrap()
    }

    #[test]
    fn diff_and_publish_scenario() {
        let listings = vec![
            listing("m90", "NONE"),
            listing("m105", "NONE"),
            listing("m110", "DAGTOPPER"),
            listing("m120", "NONE"),
        ];
        let new = diff_new_listings(listings, 100);
        let ids: Vec<&str> = new.iter().map(|l| l.item_id.as_str()).collect();
        assert_eq!(ids, vec!["m120", "m105"]);
    }

    #[test]
    fn empty_diff_scenario() {
        let listings = vec![
            listing("m90", "NONE"),
            listing("m105", "NONE"),
            listing("m110", "DAGTOPPER"),
            listing("m120", "NONE"),
        ];
        let new = diff_new_listings(listings, 120);
        assert!(new.is_empty());
    }

    #[test]
    fn ads_never_appear_in_diff_output() {
        let listings = vec![listing("m200", "DAGTOPPER"), listing("m201", "TOPADVERTENTIE")];
        let new = diff_new_listings(listings, 0);
        assert!(new.is_empty());
    }

    #[test]
    fn monotonicity_across_cycles() {
        let first = diff_new_listings(vec![listing("m10", "NONE"), listing("m20", "NONE")], 0);
        let cursor_after_first = first.first().unwrap().numeric_id();
        assert_eq!(cursor_after_first, 20);

        let second = diff_new_listings(
            vec![listing("m15", "NONE"), listing("m30", "NONE")],
            cursor_after_first,
        );
        let ids: Vec<&str> = second.iter().map(|l| l.item_id.as_str()).collect();
        assert_eq!(ids, vec!["m30"]);
    }

    #[test]
    fn extracts_window_config_json() {
        let html = r#"<html><script>window.__CONFIG__ = {"listing":{"bidsInfo":{"count":3},"seller":{"id":42}}};</script></html>"#;
        let config = extract_window_config(html).unwrap();
        assert_eq!(config["listing"]["seller"]["id"], 42);
    }

    #[test]
    fn missing_window_config_is_a_parse_error() {
        let err = extract_window_config("<html></html>").unwrap_err();
        assert!(matches!(err, NotifierError::Parse(_)));
    }
}
