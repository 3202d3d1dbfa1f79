/*
[INPUT]:  Raw WebSocket text frames
[OUTPUT]: Flat string maps (WsMsg) and application-level errors
[POS]:    WebSocket layer - frame decoding and validation
[UPDATE]: When changing payload grammar or error detection rules
*/

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{ExgateError, Result};

/// One decoded payload object with every value coerced to a string
pub type WsMsg = HashMap<String, String>;

/// Decode a text frame into the objects it carries.
///
/// A frame starting with `{` holds one object, a frame starting with `[` an
/// array of objects. Leading whitespace is not skipped.
pub fn decode_frame(text: &str) -> Result<Vec<WsMsg>> {
    if text.starts_with('{') {
        let object: Map<String, Value> =
            serde_json::from_str(text).map_err(|err| ExgateError::Unmarshal(err.to_string()))?;
        Ok(vec![flatten_object(object)])
    } else if text.starts_with('[') {
        let objects: Vec<Map<String, Value>> =
            serde_json::from_str(text).map_err(|err| ExgateError::Unmarshal(err.to_string()))?;
        Ok(objects.into_iter().map(flatten_object).collect())
    } else {
        Err(ExgateError::InvalidMessage(
            "invalid ws msg, not dict or list".to_string(),
        ))
    }
}

/// Coerce every field of a JSON object to its string form
pub fn flatten_object(object: Map<String, Value>) -> WsMsg {
    object
        .into_iter()
        .map(|(key, value)| (key, value_to_string(value)))
        .collect()
}

/// Null becomes empty, strings pass through, everything else is rendered as JSON text
pub fn value_to_string(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text,
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

/// Detect an application-level error carried by a payload.
///
/// An `error` field always counts; a `status` field counts unless it is `"200"`.
pub fn check_error(msg: &WsMsg) -> Option<ExgateError> {
    if let Some(raw) = msg.get("error") {
        return Some(parse_error_field(raw));
    }
    match msg.get("status") {
        Some(status) if status != "200" => {
            let code = status.parse::<i32>().unwrap_or(-1);
            let message = serde_json::to_string(msg).unwrap_or_else(|_| status.clone());
            Some(ExgateError::api_error(code, message))
        }
        _ => None,
    }
}

fn parse_error_field(raw: &str) -> ExgateError {
    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(raw) else {
        return ExgateError::api_error(-1, raw);
    };
    let code = match fields.get("code") {
        Some(Value::Number(number)) => number
            .as_i64()
            .and_then(|code| i32::try_from(code).ok())
            .unwrap_or(-1),
        Some(Value::String(text)) => text.parse().unwrap_or(-1),
        _ => -1,
    };
    let message = fields
        .get("msg")
        .or_else(|| fields.get("message"))
        .map(|value| value_to_string(value.clone()))
        .unwrap_or_else(|| raw.to_string());
    ExgateError::api_error(code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_object_coerces_values() {
        let msgs = decode_frame(
            r#"{"id":7,"ok":true,"none":null,"px":"1.5","qty":0.25,"data":{"a":[1,2]}}"#,
        )
        .expect("decode");
        assert_eq!(msgs.len(), 1);
        let msg = &msgs[0];
        assert_eq!(msg["id"], "7");
        assert_eq!(msg["ok"], "true");
        assert_eq!(msg["none"], "");
        assert_eq!(msg["px"], "1.5");
        assert_eq!(msg["qty"], "0.25");
        assert_eq!(msg["data"], r#"{"a":[1,2]}"#);
    }

    #[test]
    fn test_decode_array_keeps_order() {
        let msgs = decode_frame(r#"[{"n":"1"},{"n":"2"},{"n":"3"}]"#).expect("decode");
        let order: Vec<&str> = msgs.iter().map(|msg| msg["n"].as_str()).collect();
        assert_eq!(order, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_decode_empty_array() {
        assert!(decode_frame("[]").expect("decode").is_empty());
    }

    #[test]
    fn test_decode_rejects_other_leading_bytes() {
        let err = decode_frame("pong").unwrap_err();
        assert!(matches!(err, ExgateError::InvalidMessage(_)));
        let err = decode_frame(" {\"a\":1}").unwrap_err();
        assert!(matches!(err, ExgateError::InvalidMessage(_)));
    }

    #[test]
    fn test_decode_reports_unmarshal_failure() {
        let err = decode_frame("{\"a\":").unwrap_err();
        assert!(matches!(err, ExgateError::Unmarshal(_)));
        let err = decode_frame("[1,2]").unwrap_err();
        assert!(matches!(err, ExgateError::Unmarshal(_)));
    }

    #[test]
    fn test_check_error_status() {
        let msg: WsMsg = [("status", "400"), ("msg", "bad")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let err = check_error(&msg).expect("error expected");
        assert_eq!(err.code(), 400);

        let ok: WsMsg = [("status".to_string(), "200".to_string())].into();
        assert!(check_error(&ok).is_none());
    }

    #[test]
    fn test_check_error_object_field() {
        let msgs = decode_frame(r#"{"id":"1","error":{"code":-1121,"msg":"Invalid symbol."}}"#)
            .expect("decode");
        match check_error(&msgs[0]) {
            Some(ExgateError::Api { code, message }) => {
                assert_eq!(code, -1121);
                assert_eq!(message, "Invalid symbol.");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_check_error_code_out_of_range() {
        let msgs = decode_frame(r#"{"error":{"code":99999999999,"msg":"overflow"}}"#)
            .expect("decode");
        let err = check_error(&msgs[0]).expect("error expected");
        assert_eq!(err.code(), -1);
    }

    #[test]
    fn test_check_error_plain_field() {
        let msg: WsMsg = [("error".to_string(), "rate limited".to_string())].into();
        match check_error(&msg) {
            Some(ExgateError::Api { code, message }) => {
                assert_eq!(code, -1);
                assert_eq!(message, "rate limited");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
