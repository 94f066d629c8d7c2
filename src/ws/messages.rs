//! WebSocket wire messages: client requests and server pushes.
//!
//! Inbound text frames are validated against a fixed schema per `op`
//! before dispatch. A frame that is not JSON, has no `op`, or violates the
//! schema of its op is reported with code 1; an unknown `op` with code 3.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{ClientId, RequestId};
use crate::error::LiveQueryError;

/// A validated client → server request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// Open a live-query session.
    Connect(ConnectRequest),
    /// Register a standing query.
    Subscribe(SubscribeRequest),
    /// Atomically replace the query behind a request id.
    Update(SubscribeRequest),
    /// Drop a standing query.
    Unsubscribe(UnsubscribeRequest),
}

impl ClientRequest {
    /// Parses and validates a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQueryError::InvalidRequest`] for malformed JSON or a
    /// schema violation, [`LiveQueryError::UnknownOperation`] for an
    /// unrecognized `op`.
    pub fn parse(text: &str) -> Result<Self, LiveQueryError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| LiveQueryError::InvalidRequest(format!("unable to parse request: {e}")))?;
        let Value::Object(mut fields) = value else {
            return Err(LiveQueryError::InvalidRequest(
                "request must be a JSON object".to_string(),
            ));
        };
        let op = match fields.remove("op") {
            Some(Value::String(op)) => op,
            Some(_) => {
                return Err(LiveQueryError::InvalidRequest(
                    "op must be a string".to_string(),
                ));
            }
            None => return Err(LiveQueryError::InvalidRequest("missing op".to_string())),
        };
        match op.as_str() {
            "connect" => decode(fields).map(Self::Connect),
            "subscribe" => decode(fields).map(Self::Subscribe),
            "update" => decode(fields).map(Self::Update),
            "unsubscribe" => decode(fields).map(Self::Unsubscribe),
            _ => Err(LiveQueryError::UnknownOperation(op)),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(fields: Map<String, Value>) -> Result<T, LiveQueryError> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| LiveQueryError::InvalidRequest(e.to_string()))
}

/// `connect` request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectRequest {
    /// Application the client belongs to.
    pub application_id: String,
    /// Master key.
    #[serde(default)]
    pub master_key: Option<String>,
    /// Client key.
    #[serde(default)]
    pub client_key: Option<String>,
    /// JavaScript key.
    #[serde(default)]
    pub javascript_key: Option<String>,
    /// REST API key.
    #[serde(default, rename = "restAPIKey")]
    pub rest_api_key: Option<String>,
    /// Windows key.
    #[serde(default)]
    pub windows_key: Option<String>,
    /// Connection-level session token.
    #[serde(default)]
    pub session_token: Option<String>,
    /// Installation the client runs on.
    #[serde(default)]
    pub installation_id: Option<String>,
}

impl ConnectRequest {
    /// Returns the key the request supplies under a key-pair name.
    #[must_use]
    pub fn key(&self, name: &str) -> Option<&str> {
        let key = match name {
            "masterKey" => &self.master_key,
            "clientKey" => &self.client_key,
            "javascriptKey" => &self.javascript_key,
            "restAPIKey" => &self.rest_api_key,
            "windowsKey" => &self.windows_key,
            _ => return None,
        };
        key.as_deref()
    }
}

/// Field selection: either a JSON array or a comma separated string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum FieldList {
    /// `["a", "b"]`
    List(Vec<String>),
    /// `"a,b"`
    Csv(String),
}

impl FieldList {
    /// Normalizes into a list of field names.
    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::List(fields) => fields,
            Self::Csv(csv) => csv
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Query descriptor of `subscribe` / `update`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QueryDescriptor {
    /// Class the query runs against.
    pub class_name: String,
    /// Where-clause; must be a JSON object.
    #[serde(rename = "where", deserialize_with = "deserialize_where")]
    pub where_clause: Value,
    /// Fields to include in pushed objects.
    #[serde(default)]
    pub fields: Option<FieldList>,
    /// Alias of `fields`.
    #[serde(default)]
    pub keys: Option<FieldList>,
    /// Fields whose change triggers `update` / `create` events.
    #[serde(default)]
    pub watch: Option<FieldList>,
}

impl QueryDescriptor {
    /// Returns the requested field selection, preferring `keys`.
    #[must_use]
    pub fn selected_fields(&self) -> Option<Vec<String>> {
        self.keys
            .clone()
            .or_else(|| self.fields.clone())
            .map(FieldList::into_vec)
    }

    /// Returns the watched fields.
    #[must_use]
    pub fn watched_fields(&self) -> Option<Vec<String>> {
        self.watch.clone().map(FieldList::into_vec)
    }
}

fn deserialize_where<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(serde::de::Error::custom("where must be an object"))
    }
}

/// `subscribe` / `update` request body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubscribeRequest {
    /// Client-chosen request id.
    pub request_id: RequestId,
    /// Query to run.
    pub query: QueryDescriptor,
    /// Subscription-level session token.
    #[serde(default)]
    pub session_token: Option<String>,
}

/// `unsubscribe` request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UnsubscribeRequest {
    /// Request id to drop.
    pub request_id: RequestId,
}

/// Body of `create`, `enter`, `update`, `leave` and `delete` pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    /// Receiving client.
    pub client_id: ClientId,
    /// Installation the client connected with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
    /// Subscription the event belongs to.
    pub request_id: RequestId,
    /// Object snapshot after the change.
    pub object: Value,
    /// Object snapshot before the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<Value>,
}

/// A server → client push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Scoped or connection-level error.
    Error {
        /// Protocol error code.
        code: u32,
        /// Human-readable message.
        error: String,
        /// Whether the client should reconnect.
        reconnect: bool,
        /// Request the error is scoped to.
        #[serde(
            rename = "requestId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        request_id: Option<RequestId>,
    },
    /// `connect` succeeded.
    Connected {
        /// Allocated client id.
        #[serde(rename = "clientId")]
        client_id: ClientId,
        /// Installation the client connected with.
        #[serde(
            rename = "installationId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        installation_id: Option<String>,
    },
    /// `subscribe` / `update` succeeded.
    Subscribed {
        /// Owning client.
        #[serde(rename = "clientId")]
        client_id: ClientId,
        /// Installation the client connected with.
        #[serde(
            rename = "installationId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        installation_id: Option<String>,
        /// Registered request id.
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },
    /// `unsubscribe` succeeded.
    Unsubscribed {
        /// Owning client.
        #[serde(rename = "clientId")]
        client_id: ClientId,
        /// Installation the client connected with.
        #[serde(
            rename = "installationId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        installation_id: Option<String>,
        /// Dropped request id.
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },
    /// A new object matches.
    Create(EventPayload),
    /// An existing object started matching.
    Enter(EventPayload),
    /// A matching object changed.
    Update(EventPayload),
    /// A matching object stopped matching.
    Leave(EventPayload),
    /// A matching object was deleted.
    Delete(EventPayload),
}

impl ServerMessage {
    /// Builds the `error` push for a failure.
    #[must_use]
    pub fn from_error(err: &LiveQueryError, request_id: Option<RequestId>) -> Self {
        Self::Error {
            code: err.error_code(),
            error: err.to_string(),
            reconnect: err.reconnect(),
            request_id,
        }
    }

    /// Serializes the push into a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQueryError::Internal`] if serialization fails.
    pub fn to_json(&self) -> Result<String, LiveQueryError> {
        serde_json::to_string(self).map_err(|e| LiveQueryError::Internal(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_subscribe_with_keys_csv() {
        let text = r#"{"op":"subscribe","requestId":3,"query":{"className":"Note","where":{"a":1},"keys":"title, body"},"sessionToken":"r:1"}"#;
        let Ok(ClientRequest::Subscribe(req)) = ClientRequest::parse(text) else {
            panic!("expected subscribe");
        };
        assert_eq!(req.request_id, 3);
        assert_eq!(req.session_token.as_deref(), Some("r:1"));
        assert_eq!(
            req.query.selected_fields(),
            Some(vec!["title".to_string(), "body".to_string()])
        );
    }

    #[test]
    fn unknown_op_is_code_three() {
        let Err(err) = ClientRequest::parse(r#"{"op":"ping"}"#) else {
            panic!("expected error");
        };
        assert_eq!(err.error_code(), 3);
    }

    #[test]
    fn schema_violations_are_code_one() {
        let cases = [
            "not json",
            "[]",
            r#"{"requestId":1}"#,
            r#"{"op":"subscribe","requestId":"1","query":{"className":"A","where":{}}}"#,
            r#"{"op":"subscribe","requestId":1,"query":{"className":"A","where":[]}}"#,
            r#"{"op":"subscribe","requestId":1,"query":{"className":"A","where":{}},"extra":1}"#,
            r#"{"op":"unsubscribe"}"#,
            r#"{"op":"connect"}"#,
        ];
        for case in cases {
            let Err(err) = ClientRequest::parse(case) else {
                panic!("expected error for {case}");
            };
            assert_eq!(err.error_code(), 1, "case {case}");
        }
    }

    #[test]
    fn connect_exposes_keys_by_name() {
        let text = r#"{"op":"connect","applicationId":"app","masterKey":"m","restAPIKey":"r"}"#;
        let Ok(ClientRequest::Connect(req)) = ClientRequest::parse(text) else {
            panic!("expected connect");
        };
        assert_eq!(req.key("masterKey"), Some("m"));
        assert_eq!(req.key("restAPIKey"), Some("r"));
        assert_eq!(req.key("clientKey"), None);
        assert_eq!(req.key("bogus"), None);
    }

    #[test]
    fn event_push_shape() {
        let client_id = ClientId::new();
        let msg = ServerMessage::Leave(EventPayload {
            client_id,
            installation_id: None,
            request_id: 9,
            object: json!({ "objectId": "1" }),
            original: None,
        });
        let Ok(text) = msg.to_json() else {
            panic!("serialization failed");
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            panic!("not json");
        };
        assert_eq!(
            value,
            json!({
                "op": "leave",
                "clientId": client_id.to_string(),
                "requestId": 9,
                "object": { "objectId": "1" }
            })
        );
    }

    #[test]
    fn error_push_carries_request_id() {
        let msg = ServerMessage::from_error(&LiveQueryError::InvalidKeys, Some(4));
        let Ok(text) = msg.to_json() else {
            panic!("serialization failed");
        };
        assert!(text.contains(r#""op":"error""#));
        assert!(text.contains(r#""requestId":4"#));
        assert!(text.contains(r#""reconnect":true"#));
    }
}
