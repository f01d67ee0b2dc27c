//! Browser-URL → API-request-URL translation (§4.2, C2).
//!
//! Pure function, no I/O. Category tables are loaded once at bootstrap and
//! handed in as an immutable value rather than kept as global state, the same
//! "read-only value passed into the leaf" shape the teacher uses for its
//! driver configs.

use std::collections::HashMap;

use marketwatch_core::NotifierError;
use serde::Deserialize;
use serde_json::Value;

const ORIGIN: &str = "https://www.2dehands.be";
const REQUEST_BASE: &str = "https://www.2dehands.be/lrp/api/search";

/// One entry of either category table (§6.4).
#[derive(Debug, Clone, Deserialize)]
pub struct CategoryEntry {
    pub id: Value,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "fullName", default)]
    pub full_name: String,
}

/// The two category lookup tables, loaded once at startup from the JSON
/// files named in §6.4 and threaded through read-only from then on.
#[derive(Debug, Clone, Default)]
pub struct CategoryTables {
    l1: HashMap<String, CategoryEntry>,
    l2: HashMap<String, HashMap<String, CategoryEntry>>,
}

impl CategoryTables {
    pub fn load(l1_json: &str, l2_json: &str) -> Result<Self, NotifierError> {
        let l1: HashMap<String, CategoryEntry> =
            serde_json::from_str(l1_json).map_err(|e| NotifierError::Config(format!("l1 categories: {e}")))?;
        let l2: HashMap<String, HashMap<String, CategoryEntry>> =
            serde_json::from_str(l2_json).map_err(|e| NotifierError::Config(format!("l2 categories: {e}")))?;
        Ok(Self { l1, l2 })
    }

    fn l1_id(&self, key: &str) -> Option<&Value> {
        self.l1.get(key).map(|e| &e.id)
    }

    fn l2_id(&self, l1_key: &str, l2_key: &str) -> Option<&Value> {
        self.l2.get(l1_key).and_then(|m| m.get(l2_key)).map(|e| &e.id)
    }
}

/// Result of translating a browser URL (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub canonical_browser_url: String,
    pub request_url: String,
    pub query: Option<String>,
}

const DEFAULT_FRAGMENT: &[(&str, &str)] = &[
    ("Language", "all-languages"),
    ("offeredSince", "Gisteren"),
    ("sortBy", "SORT_INDEX"),
    ("sortOrder", "DECREASING"),
];

/// Translate a user-visible browser URL into a canonicalized browser URL and
/// the API request URL it corresponds to (§4.2). No I/O.
pub fn translate(browser_url: &str, tables: &CategoryTables) -> Result<Translation, NotifierError> {
    let parsed = validate_browser_url(browser_url)?;

    let path = parsed.path().trim_start_matches('/').trim_end_matches('/');
    let segments: Vec<String> = path.split('/').map(str::to_string).collect();

    let mode = segments.first().map(String::as_str).unwrap_or_default();
    if mode != "q" && mode != "l" {
        return Err(NotifierError::Validation(format!("unsupported mode: {mode}")));
    }

    let fragment_pairs = parse_fragment(parsed.fragment());
    let merged_fragment = merge_fragment_defaults(fragment_pairs);

    let mut query_term: Option<String> = None;
    let mut l1_category_id: Option<Value> = None;
    let mut l2_category_id: Option<Value> = None;

    if mode == "q" {
        if let Some(term) = segments.get(1) {
            if !term.is_empty() {
                query_term = Some(form_decode(term));
            }
        }
    } else {
        if let Some(l1_key) = segments.get(1) {
            let id = tables
                .l1_id(l1_key)
                .ok_or_else(|| NotifierError::Validation(format!("unknown L1 category: {l1_key}")))?;
            l1_category_id = Some(id.clone());

            if let Some(l2_key) = segments.get(2) {
                let id = tables
                    .l2_id(l1_key, l2_key)
                    .ok_or_else(|| NotifierError::Validation(format!("unknown L2 category: {l1_key}/{l2_key}")))?;
                l2_category_id = Some(id.clone());
            }
        }
        if let Some((_, v)) = merged_fragment.iter().find(|(k, _)| k == "q") {
            query_term = Some(form_decode(v));
        }
    }

    let canonical_path = format!("/{mode}/{}/", segments[1..].join("/"));
    let fragment_str = merged_fragment
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join("|");
    let canonical_browser_url = format!("{ORIGIN}{canonical_path}#{fragment_str}");

    let mut qs = url::form_urlencoded::Serializer::new(String::new());
    qs.append_pair("attributesByKey[]", "Language:all-languages");
    qs.append_pair("attributesByKey[]", "offeredSince:Gisteren");
    qs.append_pair("limit", "100");
    qs.append_pair("offset", "0");
    qs.append_pair("sortBy", "SORT_INDEX");
    qs.append_pair("sortOrder", "DECREASING");
    qs.append_pair("viewOptions", "list-view");

    if let Some(id) = &l1_category_id {
        qs.append_pair("l1CategoryId", &value_param(id));
    }
    if let Some(id) = &l2_category_id {
        qs.append_pair("l2CategoryId", &value_param(id));
    }
    if let Some(term) = &query_term {
        qs.append_pair("query", term);
    }

    if let Some((_, postcode)) = merged_fragment.iter().find(|(k, _)| k == "postcode") {
        qs.append_pair("postcode", postcode);
        if let Some((_, dist)) = merged_fragment.iter().find(|(k, _)| k == "distanceMeters") {
            qs.append_pair("distanceMeters", dist);
        }
    }

    let price_from = merged_fragment.iter().find(|(k, _)| k == "PriceCentsFrom").map(|(_, v)| v.clone());
    let price_to = merged_fragment.iter().find(|(k, _)| k == "PriceCentsTo").map(|(_, v)| v.clone());
    if price_from.is_some() || price_to.is_some() {
        let range = format!(
            "PriceCents:{}:{}",
            price_from.unwrap_or_else(|| "null".to_string()),
            price_to.unwrap_or_else(|| "null".to_string())
        );
        qs.append_pair("attributeRanges[]", &range);
    }

    let request_url = format!("{REQUEST_BASE}?{}", qs.finish());

    Ok(Translation {
        canonical_browser_url,
        request_url,
        query: query_term,
    })
}

fn validate_browser_url(raw: &str) -> Result<url::Url, NotifierError> {
    let parsed = url::Url::parse(raw).map_err(|e| NotifierError::Validation(format!("invalid url: {e}")))?;
    if parsed.scheme() != "https" || parsed.host_str() != Some("www.2dehands.be") {
        return Err(NotifierError::Validation(format!("unexpected origin: {raw}")));
    }
    if parsed.query().is_some() {
        return Err(NotifierError::Validation("browser url must not carry a query string".into()));
    }
    let path = parsed.path();
    if !(path.starts_with("/q/") || path.starts_with("/l/")) {
        return Err(NotifierError::Validation(format!("unsupported path: {path}")));
    }
    Ok(parsed)
}

fn parse_fragment(raw: Option<&str>) -> Vec<(String, String)> {
    let Some(raw) = raw else { return Vec::new() };
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split('|')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, ':');
            let key = parts.next()?;
            let value = parts.next().unwrap_or_default();
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Merge incoming fragment params over the four fixed defaults: incoming
/// wins for any key it sets, the default fills in whatever is left (§4.2).
fn merge_fragment_defaults(incoming: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut merged = incoming;
    for (key, value) in DEFAULT_FRAGMENT {
        if !merged.iter().any(|(k, _)| k == key) {
            merged.push((key.to_string(), value.to_string()));
        }
    }
    merged
}

/// Decode a form-style (`+`-for-space) path/fragment token: original `q:`
/// terms and free-text path segments use this convention (§4.2).
fn form_decode(segment: &str) -> String {
    let swapped = segment.replace('+', " ");
    percent_encoding::percent_decode_str(&swapped)
        .decode_utf8_lossy()
        .into_owned()
}

fn value_param(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_tables() -> CategoryTables {
        CategoryTables::load("{}", "{}").unwrap()
    }

    #[test]
    fn translate_free_text_with_defaults() {
        let tables = empty_tables();
        let result = translate(
            "https://www.2dehands.be/q/iphone+15/#Language:all-languages|sortBy:SORT_INDEX|sortOrder:DECREASING",
            &tables,
        )
        .unwrap();

        assert_eq!(
            result.request_url,
            "https://www.2dehands.be/lrp/api/search?attributesByKey%5B%5D=Language%3Aall-languages&attributesByKey%5B%5D=offeredSince%3AGisteren&limit=100&offset=0&sortBy=SORT_INDEX&sortOrder=DECREASING&viewOptions=list-view&query=iphone+15"
        );
        assert!(result.canonical_browser_url.starts_with("https://www.2dehands.be/q/iphone+15/#"));
        assert!(result.canonical_browser_url.contains("offeredSince:Gisteren"));
        assert_eq!(result.query.as_deref(), Some("iphone 15"));
    }

    #[test]
    fn translate_is_idempotent_on_its_own_canonical_output() {
        let tables = empty_tables();
        let first = translate("https://www.2dehands.be/q/iphone+15/#Language:all-languages", &tables).unwrap();
        let second = translate(&first.canonical_browser_url, &tables).unwrap();
        assert_eq!(first.canonical_browser_url, second.canonical_browser_url);
    }

    #[test]
    fn unknown_l1_category_is_a_validation_error() {
        let tables = empty_tables();
        let err = translate("https://www.2dehands.be/l/nonexistent/", &tables).unwrap_err();
        assert!(matches!(err, NotifierError::Validation(_)));
    }

    #[test]
    fn l_mode_sets_l1_and_l2_category_ids() {
        let tables = CategoryTables::load(
            r#"{"fietsen": {"id": 500, "name": "Fietsen", "fullName": "Fietsen"}}"#,
            r#"{"fietsen": {"koersfietsen": {"id": 501, "name": "Koersfietsen", "fullName": "Fietsen/Koersfietsen"}}}"#,
        )
        .unwrap();

        let result = translate("https://www.2dehands.be/l/fietsen/koersfietsen/", &tables).unwrap();
        assert!(result.request_url.contains("l1CategoryId=500"));
        assert!(result.request_url.contains("l2CategoryId=501"));
    }

    #[test]
    fn postcode_and_distance_pass_through_only_together() {
        let tables = empty_tables();
        let result = translate(
            "https://www.2dehands.be/q/fiets/#postcode:2000|distanceMeters:5000",
            &tables,
        )
        .unwrap();
        assert!(result.request_url.contains("postcode=2000"));
        assert!(result.request_url.contains("distanceMeters=5000"));
    }

    #[test]
    fn price_range_produces_attribute_ranges_param() {
        let tables = empty_tables();
        let result = translate("https://www.2dehands.be/q/fiets/#PriceCentsFrom:1000", &tables).unwrap();
        assert!(result.request_url.contains("attributeRanges%5B%5D=PriceCents%3A1000%3Anull"));
    }

    #[test]
    fn rejects_non_matching_origin() {
        let tables = empty_tables();
        let err = translate("https://example.com/q/iphone/", &tables).unwrap_err();
        assert!(matches!(err, NotifierError::Validation(_)));
    }
}
