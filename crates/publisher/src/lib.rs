//! Thin pub/sub wrapper over Redis (C7, §6.2). Three channels, one publish
//! method apiece; every payload is plain JSON.

use marketwatch_core::{Listing, NotifierError};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;

pub const CHANNEL_LISTINGS: &str = "listings";
pub const CHANNEL_REQUEST_URL_ERROR: &str = "request_url_error";
pub const CHANNEL_WARNING: &str = "warning";

#[derive(Clone)]
pub struct Publisher {
    conn: ConnectionManager,
}

#[derive(Serialize)]
struct ListingsPayload<'a> {
    request_url: &'a str,
    new_listings: &'a [Listing],
}

#[derive(Serialize)]
struct RequestUrlErrorPayload<'a> {
    request_url: &'a str,
    error: &'a str,
    reason: &'a str,
    traceback: Option<&'a str>,
}

#[derive(Serialize)]
struct WarningPayload<'a> {
    message: &'a str,
    reason: &'a str,
}

impl Publisher {
    pub async fn connect(redis_url: &str) -> Result<Self, NotifierError> {
        let client = redis::Client::open(redis_url).map_err(|e| NotifierError::PublisherUnavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| NotifierError::PublisherUnavailable(e.to_string()))?;
        Ok(Self { conn })
    }

    /// Fatal at bootstrap if this fails (§7 `PublisherUnavailable`).
    pub async fn ping(&self) -> Result<(), NotifierError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| NotifierError::PublisherUnavailable(e.to_string()))
    }

    pub async fn publish_listings(&self, request_url: &str, new_listings: &[Listing]) -> Result<(), NotifierError> {
        let payload = ListingsPayload { request_url, new_listings };
        self.publish(CHANNEL_LISTINGS, &payload).await
    }

    pub async fn publish_request_url_error(
        &self,
        request_url: &str,
        error: &str,
        reason: &str,
        traceback: Option<&str>,
    ) -> Result<(), NotifierError> {
        let payload = RequestUrlErrorPayload { request_url, error, reason, traceback };
        self.publish(CHANNEL_REQUEST_URL_ERROR, &payload).await
    }

    pub async fn publish_warning(&self, message: &str, reason: &str) -> Result<(), NotifierError> {
        let payload = WarningPayload { message, reason };
        self.publish(CHANNEL_WARNING, &payload).await
    }

    async fn publish<T: Serialize>(&self, channel: &str, payload: &T) -> Result<(), NotifierError> {
        let body = serde_json::to_string(payload).map_err(|e| NotifierError::Parse(e.to_string()))?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, body)
            .await
            .map_err(|e| NotifierError::PublisherUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listings_payload_matches_wire_shape() {
        let listing: Listing = serde_json::from_value(serde_json::json!({
            "itemId": "m120",
            "title": "Racefiets",
            "priorityProduct": "NONE",
        }))
        .unwrap();
        let payload = ListingsPayload {
            request_url: "https://www.2dehands.be/lrp/api/search?query=fiets",
            new_listings: std::slice::from_ref(&listing),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["request_url"], "https://www.2dehands.be/lrp/api/search?query=fiets");
        assert_eq!(json["new_listings"][0]["itemId"], "m120");
        assert!(json["new_listings"][0].get("details").is_none());
    }

    #[test]
    fn request_url_error_payload_carries_kind_name() {
        let payload = RequestUrlErrorPayload {
            request_url: "https://www.2dehands.be/lrp/api/search?query=fiets",
            error: "ResponseStatus",
            reason: "upstream returned status 500",
            traceback: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["error"], "ResponseStatus");
        assert!(json["traceback"].is_null());
    }
}
