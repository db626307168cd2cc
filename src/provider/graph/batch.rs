//! JSON batching (`POST /$batch`): up to 20 sub-requests per call, answered
//! in arbitrary order and correlated by id.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Value, json};

use super::model::GraphMessage;
use crate::error::{SyncError, SyncResult};
use crate::provider::http::classify_status;
use crate::provider::{HttpRequest, NativeRequest, NativeResponse};

#[derive(Debug, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub responses: Vec<BatchItemResponse>,
}

#[derive(Debug, Deserialize)]
pub struct BatchItemResponse {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, Value>,
    pub body: Option<Value>,
}

impl BatchItemResponse {
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }
}

pub(super) fn not_graph_request() -> SyncError {
    SyncError::rejected(400, "request has no Graph form")
}

/// Request body for one `$batch` call. Sub-request ids are chunk positions.
pub fn batch_body(chunk: &[NativeRequest]) -> Value {
    let requests: Vec<Value> = chunk
        .iter()
        .enumerate()
        .filter_map(|(index, request)| match request {
            NativeRequest::Http(http) => Some(batch_entry(index, http)),
            _ => None,
        })
        .collect();
    json!({ "requests": requests })
}

fn batch_entry(index: usize, http: &HttpRequest) -> Value {
    let mut entry = json!({
        "id": index.to_string(),
        "method": http.method.as_str(),
        "url": http.path,
    });
    if let Some(body) = &http.body {
        entry["body"] = body.clone();
        entry["headers"] = json!({ "Content-Type": "application/json" });
    }
    entry
}

/// Split a batch answer back into one result per request, in request order.
pub fn split_batch_response(chunk: &[NativeRequest], response: BatchResponse) -> Vec<SyncResult<NativeResponse>> {
    let mut by_id: HashMap<String, BatchItemResponse> = response
        .responses
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();

    chunk
        .iter()
        .enumerate()
        .map(|(index, request)| {
            let NativeRequest::Http(http) = request else {
                return Err(not_graph_request());
            };
            let item = by_id.remove(&index.to_string()).ok_or_else(|| {
                SyncError::Protocol(format!("batch response is missing request {}", index))
            })?;
            item_result(http, item)
        })
        .collect()
}

fn item_result(http: &HttpRequest, item: BatchItemResponse) -> SyncResult<NativeResponse> {
    if (200..300).contains(&item.status) {
        if http.created.is_none() {
            return Ok(NativeResponse::default());
        }
        let message: GraphMessage = serde_json::from_value(item.body.unwrap_or(Value::Null))
            .map_err(|e| SyncError::Protocol(format!("malformed message in batch response: {}", e)))?;
        return Ok(created_response(http, message));
    }

    let retry_after = item.header("Retry-After");
    let body = item.body.map(|b| b.to_string()).unwrap_or_default();
    Err(classify_status(item.status, retry_after, &body))
}

/// Turn a message resource returned by the server into a cache package.
pub(super) fn created_response(http: &HttpRequest, message: GraphMessage) -> NativeResponse {
    let mut package = message.into_package("");
    if package.item.thread_id.is_none() {
        package.item.thread_id = http.created.as_ref().and_then(|t| t.thread_id.clone());
    }
    let replaces = http.replaces.clone().filter(|old| *old != package.item.id);
    NativeResponse {
        created: Some(package),
        replaces,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MailItem;
    use reqwest::Method;

    fn patch(id: &str) -> NativeRequest {
        NativeRequest::Http(
            HttpRequest::new(Method::PATCH, format!("/me/messages/{}", id)).json(json!({"isRead": true})),
        )
    }

    #[test]
    fn test_batch_body_numbers_requests() {
        let body = batch_body(&[patch("a"), patch("b")]);
        let requests = body["requests"].as_array().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1]["id"], "1");
        assert_eq!(requests[1]["url"], "/me/messages/b");
        assert_eq!(requests[0]["headers"]["Content-Type"], "application/json");
    }

    #[test]
    fn test_split_out_of_order_responses() {
        let chunk = vec![patch("a"), patch("b"), patch("c")];
        let response: BatchResponse = serde_json::from_value(json!({
            "responses": [
                {"id": "2", "status": 429, "headers": {"Retry-After": "12"}},
                {"id": "0", "status": 200, "body": {}},
                {"id": "1", "status": 404, "body": {"error": {"message": "not found"}}}
            ]
        }))
        .unwrap();

        let results = split_batch_response(&chunk, response);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(
            &results[1],
            Err(SyncError::Rejected { status: 404, message }) if message == "not found"
        ));
        assert!(matches!(
            &results[2],
            Err(SyncError::RateLimited { retry_after: Some(v) }) if v == "12"
        ));
    }

    #[test]
    fn test_missing_sub_response_is_protocol_error() {
        let chunk = vec![patch("a"), patch("b")];
        let response: BatchResponse =
            serde_json::from_value(json!({"responses": [{"id": "0", "status": 204}]})).unwrap();
        let results = split_batch_response(&chunk, response);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_move_response_replaces_old_id() {
        let template = MailItem {
            id: "old".to_string(),
            ..Default::default()
        };
        let http = HttpRequest::new(Method::POST, "/me/messages/old/move").replacing(template);
        let chunk = vec![NativeRequest::Http(http), patch("x")];
        let response: BatchResponse = serde_json::from_value(json!({
            "responses": [
                {"id": "0", "status": 201, "body": {"id": "new", "parentFolderId": "archive-id"}},
                {"id": "1", "status": 200}
            ]
        }))
        .unwrap();

        let results = split_batch_response(&chunk, response);
        let moved = results[0].as_ref().unwrap();
        assert_eq!(moved.replaces.as_deref(), Some("old"));
        let created = moved.created.as_ref().unwrap();
        assert_eq!(created.item.id, "new");
        assert_eq!(created.folder_remote_ids, vec!["archive-id".to_string()]);
    }
}
