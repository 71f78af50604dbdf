//! JSON wire protocol of the action endpoint.
//!
//! A request body is first read into [`RawRequest`], where every field is
//! optional, then validated into the closed [`Request`] type. Nothing
//! reaches the broker before validation succeeded.

use std::collections::BTreeMap;

use courier_core::{Broker, BrokerResult, Message, MessageId, Namespace, Ping};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed request body: {0}")]
    Body(String),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("request names both a username and a jobId")]
    AmbiguousTarget,
    #[error("unknown targetType '{0}', expected 'username' or 'jobid'")]
    UnknownTargetType(String),
}

/// `placeId` arrives either as a string or as a number.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PlaceId {
    Text(String),
    Number(serde_json::Number),
}

impl PlaceId {
    fn into_string(self) -> String {
        match self {
            PlaceId::Text(text) => text,
            PlaceId::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRequest {
    action: Option<String>,
    username: Option<String>,
    job_id: Option<String>,
    data: Option<Value>,
    target: Option<String>,
    target_type: Option<String>,
    message_id: Option<String>,
    ran: Option<bool>,
    players: Option<Vec<String>>,
    player_count: Option<u32>,
    place_id: Option<PlaceId>,
}

impl RawRequest {
    pub fn from_slice(body: &[u8]) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|err| ValidationError::Body(err.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        if !value.is_object() {
            return Err(ValidationError::Body("expected a JSON object".into()));
        }
        serde_json::from_value(value).map_err(|err| ValidationError::Body(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    PingFetch(Ping),
    Executed {
        namespace: Namespace,
        key: String,
        message_id: String,
        ran: bool,
    },
    Fetch,
    Status,
    Purge {
        namespace: Namespace,
        key: String,
    },
    Enqueue {
        namespace: Namespace,
        key: String,
        payload: String,
    },
}

impl Request {
    pub fn action(&self) -> &'static str {
        match self {
            Request::PingFetch(_) => "ping_fetch",
            Request::Executed { .. } => "executed",
            Request::Fetch => "fetch",
            Request::Status => "status",
            Request::Purge { .. } => "purge",
            Request::Enqueue { .. } => "enqueue",
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_target(
    username: Option<String>,
    job_id: Option<String>,
) -> Result<(Namespace, String), ValidationError> {
    match (non_empty(username), non_empty(job_id)) {
        (Some(_), Some(_)) => Err(ValidationError::AmbiguousTarget),
        (Some(username), None) => Ok((Namespace::User, username)),
        (None, Some(job_id)) => Ok((Namespace::Job, job_id)),
        (None, None) => Err(ValidationError::MissingField("username or jobId")),
    }
}

fn parse_target_type(raw: &str) -> Result<Namespace, ValidationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "username" | "user" => Ok(Namespace::User),
        "jobid" | "job" => Ok(Namespace::Job),
        _ => Err(ValidationError::UnknownTargetType(raw.to_string())),
    }
}

/// Payloads are opaque. Strings are kept verbatim, any other JSON value
/// is stored as its JSON text. Null, `false`, `0` and the empty string
/// count as no payload.
fn payload_text(data: Value) -> Option<String> {
    match data {
        Value::Null | Value::Bool(false) => None,
        Value::String(text) if text.is_empty() => None,
        Value::Number(number) if number.as_f64() == Some(0.0) => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

impl TryFrom<RawRequest> for Request {
    type Error = ValidationError;

    fn try_from(raw: RawRequest) -> Result<Self, Self::Error> {
        match raw.action.as_deref().map(str::trim) {
            Some("ping_fetch") => {
                let job_id = non_empty(raw.job_id).ok_or(ValidationError::MissingField("jobId"))?;
                let players = raw.players.ok_or(ValidationError::MissingField("players"))?;
                let mut ping = Ping::new(job_id, players);
                if let Some(count) = raw.player_count {
                    ping.player_count = count;
                }
                ping.place_id = raw.place_id.map(PlaceId::into_string);
                Ok(Request::PingFetch(ping))
            }
            Some("executed") => {
                let message_id =
                    non_empty(raw.message_id).ok_or(ValidationError::MissingField("messageId"))?;
                match non_empty(raw.target) {
                    Some(key) => {
                        let target_type = raw
                            .target_type
                            .ok_or(ValidationError::MissingField("targetType"))?;
                        let namespace = parse_target_type(&target_type)?;
                        let ran = raw.ran.ok_or(ValidationError::MissingField("ran"))?;
                        Ok(Request::Executed {
                            namespace,
                            key,
                            message_id,
                            ran,
                        })
                    }
                    // Older agents report `{username, messageId}` only.
                    None => {
                        let (namespace, key) = resolve_target(raw.username, raw.job_id)?;
                        Ok(Request::Executed {
                            namespace,
                            key,
                            message_id,
                            ran: raw.ran.unwrap_or(true),
                        })
                    }
                }
            }
            Some("fetch") => Ok(Request::Fetch),
            Some("status") => Ok(Request::Status),
            Some("purge") => {
                let (namespace, key) = resolve_target(raw.username, raw.job_id)?;
                Ok(Request::Purge { namespace, key })
            }
            Some("enqueue") => {
                let (namespace, key) = resolve_target(raw.username, raw.job_id)?;
                let payload = raw
                    .data
                    .and_then(payload_text)
                    .ok_or(ValidationError::MissingField("data"))?;
                Ok(Request::Enqueue {
                    namespace,
                    key,
                    payload,
                })
            }
            Some(other) => Err(ValidationError::UnknownAction(other.to_string())),
            None => {
                let has_target = non_empty(raw.username.clone()).is_some()
                    || non_empty(raw.job_id.clone()).is_some();
                let payload = raw.data.and_then(payload_text);
                match (has_target, payload) {
                    (true, Some(payload)) => {
                        let (namespace, key) = resolve_target(raw.username, raw.job_id)?;
                        Ok(Request::Enqueue {
                            namespace,
                            key,
                            payload,
                        })
                    }
                    _ => Ok(Request::Fetch),
                }
            }
        }
    }
}

fn namespace_label(namespace: Namespace) -> &'static str {
    match namespace {
        Namespace::User => "username",
        Namespace::Job => "jobid",
    }
}

/// Runs a validated request against the broker and renders the response
/// body. Absent messages and keys are answered with `200` and a `false`
/// flag, never with an error.
pub fn dispatch(broker: &Broker, request: Request) -> BrokerResult<Value> {
    debug!(action = request.action(), "Dispatching request");
    match request {
        Request::PingFetch(ping) => {
            let result = broker.poll_and_fetch(ping)?;
            let mut jobids: BTreeMap<String, Vec<Message>> = BTreeMap::new();
            if !result.job_messages.is_empty() {
                jobids.insert(result.job_id, result.job_messages);
            }
            Ok(json!({
                "success": true,
                "data": {
                    "users": result.user_messages,
                    "jobids": jobids,
                }
            }))
        }
        Request::Executed {
            namespace,
            key,
            message_id,
            ran,
        } => {
            // Ids are opaque to callers; one this broker never issued is unknown.
            let updated = match message_id.parse::<MessageId>() {
                Ok(id) => broker.mark_executed(namespace, &key, &id, ran)?,
                Err(_) => {
                    debug!(message_id = %message_id, "Execution report for a foreign id");
                    false
                }
            };
            let message = if updated {
                "Code execution acknowledged"
            } else {
                "Message not found"
            };
            Ok(json!({
                "success": updated,
                "updated": updated,
                "message": message,
            }))
        }
        Request::Fetch => {
            let dump = broker.dump()?;
            Ok(json!({
                "success": true,
                "data": {
                    "message": {
                        "users": dump.users,
                        "jobids": dump.jobs,
                    }
                }
            }))
        }
        Request::Status => {
            let status = broker.status()?;
            Ok(json!({ "success": true, "data": status }))
        }
        Request::Purge { namespace, key } => {
            let removed = broker.purge(namespace, &key)?;
            let message = if removed > 0 {
                format!("Purged {removed} message(s) for {key}")
            } else {
                format!("No messages queued for {key}")
            };
            Ok(json!({
                "success": true,
                "message": message,
                "purged": removed > 0,
                "count": removed,
            }))
        }
        Request::Enqueue {
            namespace,
            key,
            payload,
        } => {
            let id = broker.enqueue(namespace, &key, payload)?;
            Ok(json!({
                "success": true,
                "message": format!("Data added to {} table", namespace),
                "messageId": id,
                "target": key,
                "targetType": namespace_label(namespace),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> Result<Request, ValidationError> {
        Request::try_from(RawRequest::from_value(value)?)
    }

    #[test]
    fn ping_fetch_defaults_player_count_and_keeps_numeric_place_id() {
        let request = parse(json!({
            "action": "ping_fetch",
            "jobId": "J1",
            "placeId": 1818,
            "players": ["alice", "bob"],
        }))
        .expect("valid");

        let Request::PingFetch(ping) = request else {
            panic!("expected ping_fetch");
        };
        assert_eq!(ping.job_id, "J1");
        assert_eq!(ping.place_id.as_deref(), Some("1818"));
        assert_eq!(ping.player_count, 2);
    }

    #[test]
    fn ping_fetch_requires_job_id_and_players() {
        assert_eq!(
            parse(json!({"action": "ping_fetch", "players": []})),
            Err(ValidationError::MissingField("jobId"))
        );
        assert_eq!(
            parse(json!({"action": "ping_fetch", "jobId": "J1"})),
            Err(ValidationError::MissingField("players"))
        );
    }

    #[test]
    fn executed_accepts_target_and_legacy_forms() {
        let id = MessageId::new();
        let request = parse(json!({
            "action": "executed",
            "target": "J1",
            "targetType": "jobid",
            "messageId": id.to_string(),
            "ran": false,
        }))
        .expect("valid");
        assert_eq!(
            request,
            Request::Executed {
                namespace: Namespace::Job,
                key: "J1".into(),
                message_id: id.to_string(),
                ran: false,
            }
        );

        let legacy = parse(json!({
            "action": "executed",
            "username": "bob",
            "messageId": id.to_string(),
        }))
        .expect("valid");
        assert_eq!(
            legacy,
            Request::Executed {
                namespace: Namespace::User,
                key: "bob".into(),
                message_id: id.to_string(),
                ran: true,
            }
        );
    }

    #[test]
    fn executed_requires_an_id_and_a_known_target_type() {
        assert_eq!(
            parse(json!({"action": "executed", "username": "bob", "messageId": "  "})),
            Err(ValidationError::MissingField("messageId"))
        );
        assert_eq!(
            parse(json!({"action": "executed", "username": "bob", "messageId": "1700000000000k3j9x2abc"}))
                .expect("opaque id"),
            Request::Executed {
                namespace: Namespace::User,
                key: "bob".into(),
                message_id: "1700000000000k3j9x2abc".into(),
                ran: true,
            }
        );
        assert!(matches!(
            parse(json!({
                "action": "executed",
                "target": "bob",
                "targetType": "group",
                "messageId": MessageId::new().to_string(),
                "ran": true,
            })),
            Err(ValidationError::UnknownTargetType(_))
        ));
    }

    #[test]
    fn enqueue_requires_exactly_one_target() {
        assert_eq!(
            parse(json!({"username": "bob", "jobId": "J1", "data": "x"})),
            Err(ValidationError::AmbiguousTarget)
        );
        assert_eq!(
            parse(json!({"action": "purge"})),
            Err(ValidationError::MissingField("username or jobId"))
        );
    }

    #[test]
    fn missing_action_falls_back_to_enqueue_or_fetch() {
        assert_eq!(
            parse(json!({"jobId": "J1", "data": {"cmd": "restart"}})).expect("valid"),
            Request::Enqueue {
                namespace: Namespace::Job,
                key: "J1".into(),
                payload: r#"{"cmd":"restart"}"#.into(),
            }
        );
        assert_eq!(parse(json!({"username": "bob"})).expect("valid"), Request::Fetch);
        for empty in [json!(""), json!(false), json!(0), Value::Null] {
            assert_eq!(
                parse(json!({"username": "bob", "data": empty})).expect("valid"),
                Request::Fetch
            );
        }
        assert_eq!(parse(json!({})).expect("valid"), Request::Fetch);
    }

    #[test]
    fn foreign_message_id_is_reported_as_not_updated() {
        let broker = Broker::in_memory(courier_core::BrokerConfig::default());
        let body = dispatch(
            &broker,
            Request::Executed {
                namespace: Namespace::User,
                key: "bob".into(),
                message_id: "1700000000000k3j9x2abc".into(),
                ran: true,
            },
        )
        .expect("dispatch");
        assert_eq!(body["updated"], json!(false));
        assert_eq!(body["success"], json!(false));
    }

    #[test]
    fn unknown_action_and_non_object_bodies_are_rejected() {
        assert_eq!(
            parse(json!({"action": "explode"})),
            Err(ValidationError::UnknownAction("explode".into()))
        );
        assert!(matches!(
            RawRequest::from_slice(b"[1, 2, 3]"),
            Err(ValidationError::Body(_))
        ));
        assert!(matches!(
            RawRequest::from_slice(b"not json"),
            Err(ValidationError::Body(_))
        ));
        assert!(matches!(
            parse(json!({"action": "executed", "ran": "yes"})),
            Err(ValidationError::Body(_))
        ));
    }
}
