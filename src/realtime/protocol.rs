use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::DeviceStatus;

// ---------------------------------------------------------------------------
// Wire protocol
//
// Inbound (client → server): subscribe, unsubscribe, pong, echo.
// Outbound (server → client): ping, subscribed, unsubscribed, echo, error,
// plus the data frames STATUS_UPDATE / BATCH_STATUS_UPDATE /
// TELEMETRY_UPDATE.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Pong,
    Echo { data: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "subscribed")]
    Subscribed { topic: String },
    #[serde(rename = "unsubscribed")]
    Unsubscribed { topic: String },
    #[serde(rename = "echo")]
    Echo { data: serde_json::Value },
    #[serde(rename = "error")]
    Error { message: String },
    /// One device's status transition. The polling cycle announces
    /// transitions in the batched frame only; this variant is the
    /// single-event shape of the same payload.
    #[serde(rename = "STATUS_UPDATE")]
    StatusUpdate {
        node_id: Uuid,
        status: DeviceStatus,
    },
    #[serde(rename = "BATCH_STATUS_UPDATE")]
    BatchStatusUpdate { updates: Vec<StatusUpdate> },
    #[serde(rename = "TELEMETRY_UPDATE")]
    TelemetryUpdate {
        node_id: Uuid,
        readings_count: usize,
    },
}

/// One entry of a `BATCH_STATUS_UPDATE` frame.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusUpdate {
    pub node_id: Uuid,
    pub status: DeviceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_messages_parse() {
        let m: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","topic":"alerts"}"#).unwrap();
        assert!(matches!(m, ClientMessage::Subscribe { topic } if topic == "alerts"));

        let m: ClientMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(m, ClientMessage::Pong));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"launch"}"#).is_err());
    }

    #[test]
    fn data_frames_use_upper_case_tags() {
        let node_id = Uuid::new_v4();
        let json = serde_json::to_value(ServerMessage::StatusUpdate {
            node_id,
            status: DeviceStatus::Offline,
        })
        .unwrap();
        assert_eq!(json["type"], "STATUS_UPDATE");
        assert_eq!(json["status"], "offline");

        let json = serde_json::to_value(ServerMessage::BatchStatusUpdate {
            updates: vec![StatusUpdate {
                node_id,
                status: DeviceStatus::Online,
            }],
        })
        .unwrap();
        assert_eq!(json["type"], "BATCH_STATUS_UPDATE");
        assert_eq!(json["updates"][0]["status"], "online");
    }

    #[test]
    fn control_frames_use_lower_case_tags() {
        let json = serde_json::to_value(ServerMessage::Ping).unwrap();
        assert_eq!(json["type"], "ping");
        let json = serde_json::to_value(ServerMessage::Subscribed {
            topic: "alerts".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "subscribed");
    }
}
