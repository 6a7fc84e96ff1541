//! Turns controller webhook bodies into [`NormalizedEvent`]s.
//!
//! Two payload generations are accepted:
//!
//! * `{"events": [{"id": "event.client_connected", "scope": {"mac": ..}}, ..]}`
//! * `{"name": "WiFi Client Connected", "parameters": {"UNIFIclientMac": .., "UNIFIclientIp": ..}}`
//!
//! Anything else normalizes to nothing. Nothing here fails.

use serde_json::{Map, Value};

use crate::messages::{NormalizedEvent, Transition};

const CONNECTED_ID: &str = "event.client_connected";
const DISCONNECTED_ID: &str = "event.client_disconnected";
const CONNECTED_NAME: &str = "WiFi Client Connected";
const DISCONNECTED_NAME: &str = "WiFi Client Disconnected";

/// Pull the ordered event list out of a decoded webhook envelope.
pub fn extract_events(envelope: &Value) -> Vec<Value> {
    let Some(envelope) = envelope.as_object() else {
        return Vec::new();
    };

    if let Some(events) = envelope.get("events") {
        return match events {
            Value::Array(events) => events.clone(),
            _ => Vec::new(),
        };
    }

    if let Some(Value::Object(parameters)) = envelope.get("parameters") {
        let mut event = parameters.clone();
        if let Some(name) = envelope.get("name") {
            event.insert("name".to_string(), name.clone());
        }
        return vec![Value::Object(event)];
    }

    Vec::new()
}

pub fn normalize(event: &Value) -> Option<NormalizedEvent> {
    let event = event.as_object()?;
    let mac = extract_mac(event)?;
    let transition = detect_transition(event)?;
    Some(NormalizedEvent {
        mac,
        ip: non_empty_str(event.get("UNIFIclientIp")).map(str::to_string),
        transition,
    })
}

fn detect_transition(event: &Map<String, Value>) -> Option<Transition> {
    // A present `id` is authoritative, even if it names something we ignore.
    if let Some(id) = event.get("id").filter(|v| !v.is_null()) {
        let id = match id {
            Value::String(s) => s.to_lowercase(),
            other => other.to_string().to_lowercase(),
        };
        return match id.as_str() {
            CONNECTED_ID => Some(Transition::Connected),
            DISCONNECTED_ID => Some(Transition::Disconnected),
            _ => None,
        };
    }

    match event.get("name").and_then(Value::as_str)? {
        CONNECTED_NAME => Some(Transition::Connected),
        DISCONNECTED_NAME => Some(Transition::Disconnected),
        _ => None,
    }
}

fn extract_mac(event: &Map<String, Value>) -> Option<String> {
    let scope = event.get("scope").and_then(Value::as_object);
    scope
        .and_then(|s| non_empty_str(s.get("client_device_id")))
        .or_else(|| scope.and_then(|s| non_empty_str(s.get("mac"))))
        .or_else(|| non_empty_str(event.get("UNIFIclientMac")))
        .map(|mac| mac.trim().to_lowercase())
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}
