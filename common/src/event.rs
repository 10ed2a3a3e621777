use serde::{Deserialize, Serialize};

/// A one-shot trigger: an object persisted long enough and the cooldown had
/// elapsed, so a snapshot was saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Reference to the persisted snapshot.
    pub file: String,
    /// Unix seconds.
    pub ts: f64,
}

/// JSON messages pushed to live clients.
///
/// Wire form: `{"type": "trigger", "payload": {"file": "...", "ts": 1.5}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ClientEvent {
    Trigger(TriggerEvent),
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<TriggerEvent> for ClientEvent {
    fn from(event: TriggerEvent) -> Self {
        ClientEvent::Trigger(event)
    }
}

/// Current wall-clock time as fractional Unix seconds.
pub fn unix_now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_wire_format() {
        let event = ClientEvent::from(TriggerEvent {
            file: "snapshots/snap_20260218T093000000Z.jpg".into(),
            ts: 1771407000.25,
        });
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "trigger");
        assert_eq!(
            value["payload"]["file"],
            "snapshots/snap_20260218T093000000Z.jpg"
        );
        assert_eq!(value["payload"]["ts"], 1771407000.25);
        assert_eq!(value.as_object().unwrap().len(), 2);
    }

    #[test]
    fn unix_now_is_recent() {
        // 2024-01-01T00:00:00Z
        assert!(unix_now_secs() > 1_704_067_200.0);
    }
}
