use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::browser::{fetch_version, BrowserError};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A browser-level DevTools connection.
///
/// Used by the bootstrap program to carve out one isolated browser context
/// and page per job on the shared browser.
pub struct CdpSession {
    ws_url: String,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl CdpSession {
    /// Resolve the browser WebSocket from `endpoint` (`http://host:port`) and connect.
    pub async fn connect(endpoint: &str) -> Result<Self, BrowserError> {
        let client = reqwest::Client::new();
        let info = fetch_version(&client, endpoint).await?;
        let (ws, _response) = connect_async(info.web_socket_debugger_url.as_str()).await?;
        tracing::debug!(ws_url = %info.web_socket_debugger_url, "Attached to shared browser");
        Ok(Self {
            ws_url: info.web_socket_debugger_url,
            ws,
            next_id: 1,
        })
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Send one command and wait for the response with the matching id.
    /// Events received in between are skipped.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value, BrowserError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({ "id": id, "method": method, "params": params });
        self.ws.send(Message::Text(request.to_string())).await?;

        match tokio::time::timeout(CALL_TIMEOUT, self.read_response(id)).await {
            Ok(response) => response.and_then(|value| Self::into_result(method, value)),
            Err(_) => Err(BrowserError::Protocol {
                method: method.to_string(),
                message: format!("no response within {CALL_TIMEOUT:?}"),
            }),
        }
    }

    async fn read_response(&mut self, id: u64) -> Result<Value, BrowserError> {
        while let Some(message) = self.ws.next().await {
            let text = match message? {
                Message::Text(text) => text,
                Message::Close(_) => return Err(BrowserError::Closed),
                _ => continue,
            };
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            if value.get("id").and_then(Value::as_u64) == Some(id) {
                return Ok(value);
            }
        }
        Err(BrowserError::Closed)
    }

    fn into_result(method: &str, mut response: Value) -> Result<Value, BrowserError> {
        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(BrowserError::Protocol {
                method: method.to_string(),
                message,
            });
        }
        Ok(response
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// Create an isolated browser context, disposed automatically if this
    /// connection goes away.
    pub async fn create_context(&mut self) -> Result<String, BrowserError> {
        let result = self
            .call(
                "Target.createBrowserContext",
                json!({ "disposeOnDetach": true }),
            )
            .await?;
        Self::string_field(&result, "Target.createBrowserContext", "browserContextId")
    }

    /// Open a blank page inside `context_id`. Returns the page's target id.
    pub async fn create_page(&mut self, context_id: &str) -> Result<String, BrowserError> {
        let result = self
            .call(
                "Target.createTarget",
                json!({ "url": "about:blank", "browserContextId": context_id }),
            )
            .await?;
        Self::string_field(&result, "Target.createTarget", "targetId")
    }

    /// Close every page in `context_id` and drop the context.
    pub async fn dispose_context(&mut self, context_id: &str) -> Result<(), BrowserError> {
        self.call(
            "Target.disposeBrowserContext",
            json!({ "browserContextId": context_id }),
        )
        .await?;
        Ok(())
    }

    /// Detach from the browser without closing it.
    pub async fn close(mut self) {
        if let Err(e) = self.ws.close(None).await {
            tracing::debug!(error = %e, "Error closing DevTools connection");
        }
    }

    fn string_field(result: &Value, method: &str, field: &str) -> Result<String, BrowserError> {
        result
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BrowserError::Protocol {
                method: method.to_string(),
                message: format!("response has no {field}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_result_extracts_result_object() {
        let response = json!({ "id": 1, "result": { "browserContextId": "CTX" } });
        let result = CdpSession::into_result("Target.createBrowserContext", response).unwrap();
        assert_eq!(
            CdpSession::string_field(&result, "m", "browserContextId").unwrap(),
            "CTX"
        );
    }

    #[test]
    fn into_result_maps_protocol_error() {
        let response = json!({ "id": 2, "error": { "code": -32000, "message": "No target" } });
        let err = CdpSession::into_result("Target.createTarget", response).unwrap_err();
        match err {
            BrowserError::Protocol { method, message } => {
                assert_eq!(method, "Target.createTarget");
                assert_eq!(message, "No target");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_field_is_protocol_error() {
        let err = CdpSession::string_field(&json!({}), "Target.createTarget", "targetId")
            .unwrap_err();
        assert!(err.to_string().contains("targetId"));
    }

    #[tokio::test]
    async fn connect_fails_without_endpoint() {
        let err = CdpSession::connect("http://127.0.0.1:1").await.err().unwrap();
        assert!(matches!(err, BrowserError::Http(_)));
    }
}
