use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;

const DEFAULT_RETRY_MS: u64 = 1_000;
const HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum MatrixApiError {
    /// The homeserver answered with a Matrix error body.
    #[error("homeserver returned {status} {errcode}: {error}")]
    Server {
        status: u16,
        errcode: String,
        error: String,
        retry_after_ms: Option<u64>,
    },
    #[error("http transport error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("invalid homeserver URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("unexpected response from homeserver: {0}")]
    Decode(String),
}

impl MatrixApiError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Self::Server { status, errcode, .. }
                if *status == 429 || errcode == "M_LIMIT_EXCEEDED"
        )
    }

    /// Server-advised backoff for a rate-limit response, falling back to one
    /// second when the homeserver did not include `retry_after_ms`.
    pub fn retry_after(&self) -> Duration {
        match self {
            Self::Server {
                retry_after_ms: Some(ms),
                ..
            } => Duration::from_millis(*ms),
            _ => Duration::from_millis(DEFAULT_RETRY_MS),
        }
    }

    pub fn errcode(&self) -> Option<&str> {
        match self {
            Self::Server { errcode, .. } => Some(errcode),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Server { status, .. } if *status == 404)
    }

    pub fn is_forbidden(&self) -> bool {
        self.errcode() == Some("M_FORBIDDEN")
    }
}

/// Result of registering a fresh appservice account.
pub struct RegisteredUser {
    pub user_id: String,
    pub access_token: SecretString,
}

#[derive(Deserialize)]
struct RegisterResponse {
    user_id: String,
    #[serde(default)]
    access_token: String,
}

/// Client-server API request body for room creation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateRoomRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_alias_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invite: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_direct: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
}

/// Thin client-server API client. All appservice traffic authenticates with
/// the shared `as_token`; `acting_as` adds the `user_id` impersonation query
/// parameter so events originate from a virtual user instead of the bot.
#[derive(Clone)]
pub struct MatrixClient {
    http: reqwest::Client,
    base_url: String,
    access_token: SecretString,
    impersonate: Option<String>,
}

fn escape(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

impl MatrixClient {
    pub fn new(homeserver_url: &str, access_token: SecretString) -> Result<Self, MatrixApiError> {
        Url::parse(homeserver_url)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: homeserver_url.trim_end_matches('/').to_string(),
            access_token,
            impersonate: None,
        })
    }

    /// Return a handle that issues requests on behalf of the given virtual
    /// user via the appservice `user_id` parameter.
    pub fn acting_as(&self, user_id: &str) -> Self {
        let mut client = self.clone();
        client.impersonate = Some(user_id.to_string());
        client
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let req = req.bearer_auth(self.access_token.expose_secret());
        match &self.impersonate {
            Some(user_id) => req.query(&[("user_id", user_id.as_str())]),
            None => req,
        }
    }

    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<Value, MatrixApiError> {
        let response = self.apply_auth(req).send().await?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| MatrixApiError::Decode(e.to_string()));
        }
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Err(Self::server_error(status.as_u16(), &body))
    }

    fn server_error(status: u16, body: &Value) -> MatrixApiError {
        MatrixApiError::Server {
            status,
            errcode: body
                .get("errcode")
                .and_then(Value::as_str)
                .unwrap_or("M_UNKNOWN")
                .to_string(),
            error: body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            retry_after_ms: body.get("retry_after_ms").and_then(Value::as_u64),
        }
    }

    fn event_id_from(value: &Value) -> Result<String, MatrixApiError> {
        value
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| MatrixApiError::Decode("response missing event_id".to_string()))
    }

    /// Register a new appservice account. The homeserver picks no password;
    /// the returned access token is the only credential for the account.
    pub async fn register_appservice_user(
        &self,
        localpart: &str,
    ) -> Result<RegisteredUser, MatrixApiError> {
        let body = json!({
            "type": "m.login.application_service",
            "username": localpart,
        });
        let value = self
            .execute(
                self.http
                    .post(self.endpoint("/_matrix/client/v3/register"))
                    .json(&body),
            )
            .await?;
        let response: RegisterResponse = serde_json::from_value(value)
            .map_err(|e| MatrixApiError::Decode(e.to_string()))?;
        Ok(RegisteredUser {
            user_id: response.user_id,
            access_token: response.access_token.into(),
        })
    }

    pub async fn set_display_name(
        &self,
        user_id: &str,
        display_name: &str,
    ) -> Result<(), MatrixApiError> {
        let path = format!(
            "/_matrix/client/v3/profile/{}/displayname",
            escape(user_id)
        );
        self.execute(
            self.http
                .put(self.endpoint(&path))
                .json(&json!({ "displayname": display_name })),
        )
        .await?;
        Ok(())
    }

    pub async fn get_display_name(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, MatrixApiError> {
        let path = format!(
            "/_matrix/client/v3/profile/{}/displayname",
            escape(user_id)
        );
        match self.execute(self.http.get(self.endpoint(&path))).await {
            Ok(value) => Ok(value
                .get("displayname")
                .and_then(Value::as_str)
                .map(str::to_owned)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_room(
        &self,
        request: &CreateRoomRequest,
    ) -> Result<String, MatrixApiError> {
        let value = self
            .execute(
                self.http
                    .post(self.endpoint("/_matrix/client/v3/createRoom"))
                    .json(request),
            )
            .await?;
        value
            .get("room_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| MatrixApiError::Decode("response missing room_id".to_string()))
    }

    pub async fn invite(&self, room_id: &str, user_id: &str) -> Result<(), MatrixApiError> {
        let path = format!("/_matrix/client/v3/rooms/{}/invite", escape(room_id));
        self.execute(
            self.http
                .post(self.endpoint(&path))
                .json(&json!({ "user_id": user_id })),
        )
        .await?;
        Ok(())
    }

    pub async fn join_room(&self, room_id: &str) -> Result<(), MatrixApiError> {
        let path = format!("/_matrix/client/v3/rooms/{}/join", escape(room_id));
        self.execute(self.http.post(self.endpoint(&path)).json(&json!({})))
            .await?;
        Ok(())
    }

    pub async fn kick(
        &self,
        room_id: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<(), MatrixApiError> {
        let path = format!("/_matrix/client/v3/rooms/{}/kick", escape(room_id));
        self.execute(
            self.http
                .post(self.endpoint(&path))
                .json(&json!({ "user_id": user_id, "reason": reason })),
        )
        .await?;
        Ok(())
    }

    pub async fn redact(
        &self,
        room_id: &str,
        event_id: &str,
        reason: &str,
    ) -> Result<String, MatrixApiError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/redact/{}/{}",
            escape(room_id),
            escape(event_id),
            Uuid::new_v4()
        );
        let value = self
            .execute(
                self.http
                    .put(self.endpoint(&path))
                    .json(&json!({ "reason": reason })),
            )
            .await?;
        Self::event_id_from(&value)
    }

    pub async fn send_message_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<String, MatrixApiError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/send/{}/{}",
            escape(room_id),
            escape(event_type),
            Uuid::new_v4()
        );
        let value = self
            .execute(self.http.put(self.endpoint(&path)).json(content))
            .await?;
        Self::event_id_from(&value)
    }

    pub async fn send_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<(), MatrixApiError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/state/{}/{}",
            escape(room_id),
            escape(event_type),
            escape(state_key)
        );
        self.execute(self.http.put(self.endpoint(&path)).json(content))
            .await?;
        Ok(())
    }

    pub async fn upload_media(
        &self,
        data: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<String, MatrixApiError> {
        let path = format!("/_matrix/media/v3/upload?filename={}", escape(filename));
        let value = self
            .execute(
                self.http
                    .post(self.endpoint(&path))
                    .header("Content-Type", content_type)
                    .body(data),
            )
            .await?;
        value
            .get("content_uri")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| MatrixApiError::Decode("response missing content_uri".to_string()))
    }

    /// Fetch the bytes behind an `mxc://server/media_id` URI.
    pub async fn download_media(&self, mxc_url: &str) -> Result<Vec<u8>, MatrixApiError> {
        let rest = mxc_url.strip_prefix("mxc://").ok_or_else(|| {
            MatrixApiError::Decode(format!("not an mxc URL: {mxc_url}"))
        })?;
        let (server, media_id) = rest.split_once('/').ok_or_else(|| {
            MatrixApiError::Decode(format!("malformed mxc URL: {mxc_url}"))
        })?;
        let path = format!(
            "/_matrix/client/v1/media/download/{}/{}",
            escape(server),
            escape(media_id)
        );
        let response = self
            .apply_auth(self.http.get(self.endpoint(&path)))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.json::<Value>().await.unwrap_or(Value::Null);
            return Err(Self::server_error(status.as_u16(), &body));
        }
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn mark_read(&self, room_id: &str, event_id: &str) -> Result<(), MatrixApiError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/receipt/m.read/{}",
            escape(room_id),
            escape(event_id)
        );
        self.execute(self.http.post(self.endpoint(&path)).json(&json!({})))
            .await?;
        Ok(())
    }

    pub async fn joined_members(&self, room_id: &str) -> Result<Vec<String>, MatrixApiError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/joined_members",
            escape(room_id)
        );
        let value = self.execute(self.http.get(self.endpoint(&path))).await?;
        let joined = value
            .get("joined")
            .and_then(Value::as_object)
            .ok_or_else(|| MatrixApiError::Decode("response missing joined map".to_string()))?;
        Ok(joined.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn rate_limit_detected_by_status_and_errcode() {
        let by_status = MatrixClient::server_error(429, &json!({}));
        assert!(by_status.is_rate_limited());

        let by_errcode = MatrixClient::server_error(
            400,
            &json!({"errcode": "M_LIMIT_EXCEEDED", "error": "Too Many Requests"}),
        );
        assert!(by_errcode.is_rate_limited());

        let forbidden = MatrixClient::server_error(
            403,
            &json!({"errcode": "M_FORBIDDEN", "error": "no"}),
        );
        assert!(!forbidden.is_rate_limited());
        assert!(forbidden.is_forbidden());
    }

    #[test]
    fn retry_after_prefers_server_advice() {
        let advised = MatrixClient::server_error(
            429,
            &json!({"errcode": "M_LIMIT_EXCEEDED", "retry_after_ms": 2500}),
        );
        assert_eq!(advised.retry_after(), Duration::from_millis(2500));

        let bare = MatrixClient::server_error(429, &json!({"errcode": "M_LIMIT_EXCEEDED"}));
        assert_eq!(bare.retry_after(), Duration::from_millis(1000));
    }

    #[test]
    fn missing_errcode_maps_to_unknown() {
        let err = MatrixClient::server_error(500, &serde_json::Value::Null);
        assert_eq!(err.errcode(), Some("M_UNKNOWN"));
    }

    #[test]
    fn create_room_request_omits_unset_fields() {
        let request = CreateRoomRequest {
            name: Some("general".to_string()),
            preset: Some("public_chat".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["name"], "general");
        assert_eq!(value["preset"], "public_chat");
        assert!(value.get("is_direct").is_none());
        assert!(value.get("invite").is_none());
    }

    #[test]
    fn path_segments_are_escaped() {
        assert_eq!(escape("@user:example.org"), "%40user%3Aexample.org");
        assert_eq!(escape("!room:example.org"), "%21room%3Aexample.org");
    }
}
