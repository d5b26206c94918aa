//! The unified JSON-RPC message envelope and its classification.
//!
//! Every frame carries exactly one envelope. The `jsonrpc: "2.0"` member is
//! omitted on the wire by convention. `params` and `result` are kept as raw
//! JSON so handlers can decode them into application types on demand.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::{to_raw_value, RawValue};

use crate::error::{Error, RpcError};

/// Wire form of any JSON-RPC message. Only populated fields are serialized.
///
/// `params` and `result` distinguish an absent member from an explicit
/// `null`: `{"id":"1","result":null}` is a success response whose result is
/// JSON null, not a message without a result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(
        default,
        deserialize_with = "raw_if_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub params: Option<Box<RawValue>>,
    #[serde(
        default,
        deserialize_with = "raw_if_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Capture the raw member whenever it is present, `null` included.
fn raw_if_present<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(Error::Parse)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(Error::Parse)
    }
}

/// A JSON-RPC request: carries both an id and a method.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    pub params: Option<Box<RawValue>>,
}

impl Request {
    pub fn decode_params<T: DeserializeOwned>(&self) -> Result<T, Error> {
        decode_raw(self.params.as_deref())
    }
}

/// A JSON-RPC response: carries a result or an error.
///
/// The id is optional here because classification happens before
/// correlation; a response without an id simply never matches a pending
/// request and is dropped.
#[derive(Debug, Clone)]
pub struct Response {
    pub id: Option<String>,
    pub result: Option<Box<RawValue>>,
    pub error: Option<RpcError>,
}

impl Response {
    pub fn decode_result<T: DeserializeOwned>(&self) -> Result<T, Error> {
        decode_raw(self.result.as_deref())
    }
}

/// A JSON-RPC notification: a method without an id. Never answered.
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Option<Box<RawValue>>,
}

impl Notification {
    pub fn decode_params<T: DeserializeOwned>(&self) -> Result<T, Error> {
        decode_raw(self.params.as_deref())
    }
}

/// One of the three message kinds a peer can send.
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Classify an envelope. Order matters: a result or error field makes a
    /// response even when method is also present.
    pub fn classify(env: Envelope) -> Result<Message, Error> {
        if env.result.is_some() || env.error.is_some() {
            return Ok(Message::Response(Response {
                id: env.id,
                result: env.result,
                error: env.error,
            }));
        }
        match (env.id, env.method) {
            (Some(id), Some(method)) => Ok(Message::Request(Request {
                id,
                method,
                params: env.params,
            })),
            (None, Some(method)) => Ok(Message::Notification(Notification {
                method,
                params: env.params,
            })),
            _ => Err(Error::InvalidRequest(
                "message has neither method nor result/error".into(),
            )),
        }
    }
}

pub(crate) fn encode_request(
    id: &str,
    method: &str,
    params: Option<Box<RawValue>>,
) -> Result<Vec<u8>, Error> {
    Envelope {
        id: Some(id.to_string()),
        method: Some(method.to_string()),
        params,
        ..Envelope::default()
    }
    .to_bytes()
}

pub(crate) fn encode_notification(
    method: &str,
    params: Option<Box<RawValue>>,
) -> Result<Vec<u8>, Error> {
    Envelope {
        method: Some(method.to_string()),
        params,
        ..Envelope::default()
    }
    .to_bytes()
}

pub(crate) fn encode_response(
    id: &str,
    result: Option<Box<RawValue>>,
    error: Option<RpcError>,
) -> Result<Vec<u8>, Error> {
    Envelope {
        id: Some(id.to_string()),
        result,
        error,
        ..Envelope::default()
    }
    .to_bytes()
}

/// Serialize handler-provided params into the raw slot of an envelope.
pub(crate) fn to_raw<P: Serialize>(value: &P) -> Result<Box<RawValue>, Error> {
    to_raw_value(value).map_err(Error::Parse)
}

fn decode_raw<T: DeserializeOwned>(raw: Option<&RawValue>) -> Result<T, Error> {
    match raw {
        Some(raw) => serde_json::from_str(raw.get()).map_err(Error::Parse),
        None => Err(Error::InvalidRequest("message has no params".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn classify_request() {
        let env = Envelope::from_bytes(
            br#"{"id":"1","method":"echo","params":{"message":"test message"}}"#,
        )
        .unwrap();
        match Message::classify(env).unwrap() {
            Message::Request(req) => {
                assert_eq!(req.id, "1");
                assert_eq!(req.method, "echo");
                let params: Value = req.decode_params().unwrap();
                assert_eq!(params, json!({"message": "test message"}));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn classify_notification() {
        let env = Envelope::from_bytes(br#"{"method":"log","params":[1,2,3]}"#).unwrap();
        assert!(matches!(
            Message::classify(env).unwrap(),
            Message::Notification(_)
        ));
    }

    #[test]
    fn classify_success_response() {
        let env = Envelope::from_bytes(br#"{"id":"7","result":{"ok":true}}"#).unwrap();
        match Message::classify(env).unwrap() {
            Message::Response(res) => {
                assert_eq!(res.id.as_deref(), Some("7"));
                assert!(res.error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn explicit_null_result_is_still_a_response() {
        let env = Envelope::from_bytes(br#"{"id":"3","result":null}"#).unwrap();
        match Message::classify(env).unwrap() {
            Message::Response(res) => {
                assert_eq!(res.id.as_deref(), Some("3"));
                let result: Value = res.decode_result().unwrap();
                assert_eq!(result, Value::Null);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn result_wins_over_method() {
        // A message with both method and result classifies as a response.
        let env =
            Envelope::from_bytes(br#"{"id":"9","method":"echo","result":"done"}"#).unwrap();
        assert!(matches!(
            Message::classify(env).unwrap(),
            Message::Response(_)
        ));
    }

    #[test]
    fn classify_error_response() {
        let env = Envelope::from_bytes(
            br#"{"id":"2","error":{"code":-32601,"message":"method not found"}}"#,
        )
        .unwrap();
        match Message::classify(env).unwrap() {
            Message::Response(res) => {
                let err = res.error.unwrap();
                assert_eq!(err.code, -32601);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn empty_object_is_malformed() {
        let env = Envelope::from_bytes(b"{}").unwrap();
        assert!(Message::classify(env).is_err());
    }

    #[test]
    fn encode_omits_absent_fields() {
        let bytes = encode_request("1", "echo", None).unwrap();
        assert_eq!(bytes, br#"{"id":"1","method":"echo"}"#);

        let bytes = encode_notification("tick", None).unwrap();
        assert_eq!(bytes, br#"{"method":"tick"}"#);
    }

    #[test]
    fn params_roundtrip_bit_equal() {
        let params = to_raw(&json!({"message": "test message"})).unwrap();
        let bytes = encode_request("1", "echo", Some(params)).unwrap();
        let env = Envelope::from_bytes(&bytes).unwrap();
        let Message::Request(req) = Message::classify(env).unwrap() else {
            panic!("expected request");
        };
        let value: Value = req.decode_params().unwrap();
        assert_eq!(value, json!({"message": "test message"}));
    }
}
