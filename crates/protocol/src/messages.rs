use serde::{Deserialize, Serialize};

use hail_geo::LatLng;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub id: String,
    pub ts: i64,
    pub payload: serde_json::Value,
}

pub fn envelope<T: Serialize>(
    message_type: &str,
    id: &str,
    ts: i64,
    payload: &T,
) -> anyhow::Result<Envelope> {
    Ok(Envelope {
        message_type: message_type.to_string(),
        id: id.to_string(),
        ts,
        payload: serde_json::to_value(payload)?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    Driver,
    Passenger,
}

impl std::fmt::Display for ActorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorKind::Driver => write!(f, "driver"),
            ActorKind::Passenger => write!(f, "passenger"),
        }
    }
}

/// Ride lifecycle. `completed` and `cancelled` are terminal; a ride can be
/// cancelled from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Requested,
    Accepted,
    Arriving,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: RideStatus) -> bool {
        if self.is_terminal() || self == next {
            return false;
        }
        if next == RideStatus::Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (RideStatus::Requested, RideStatus::Accepted)
                | (RideStatus::Accepted, RideStatus::Arriving)
                | (RideStatus::Accepted, RideStatus::InProgress)
                | (RideStatus::Accepted, RideStatus::Completed)
                | (RideStatus::Arriving, RideStatus::InProgress)
                | (RideStatus::Arriving, RideStatus::Completed)
                | (RideStatus::InProgress, RideStatus::Completed)
        )
    }
}

impl std::fmt::Display for RideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RideStatus::Requested => "requested",
            RideStatus::Accepted => "accepted",
            RideStatus::Arriving => "arriving",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHello {
    pub server_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub identifier: String,
    pub kind: ActorKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerWelcome {
    pub session_id: String,
    pub identifier: String,
    pub kind: ActorKind,
}

/// Wire fields are camelCase to stay byte-compatible with the web clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverLocation {
    pub driver_id: String,
    pub location: LatLng,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Only the fields the relay routes on are typed; everything else rides
/// along in `extra` and is forwarded untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRequest {
    pub ride_id: String,
    pub passenger_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup: Option<LatLng>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<LatLng>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideAccept {
    pub ride_id: String,
    pub driver_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideStatusUpdate {
    pub ride_id: String,
    pub status: RideStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideCancel {
    pub ride_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideUpdate {
    pub ride_id: String,
    pub status: RideStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_location: Option<LatLng>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerNotice {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ride_status_serializes_like_the_web_client() {
        let json = serde_json::to_string(&RideStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in_progress\"");
        let back: RideStatus = serde_json::from_str("\"cancelled\"").expect("deserialize");
        assert_eq!(back, RideStatus::Cancelled);
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        for next in [
            RideStatus::Requested,
            RideStatus::Accepted,
            RideStatus::Arriving,
            RideStatus::InProgress,
            RideStatus::Completed,
            RideStatus::Cancelled,
        ] {
            assert!(!RideStatus::Completed.can_transition_to(next));
            assert!(!RideStatus::Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn any_non_terminal_state_can_cancel() {
        for from in [
            RideStatus::Requested,
            RideStatus::Accepted,
            RideStatus::Arriving,
            RideStatus::InProgress,
        ] {
            assert!(from.can_transition_to(RideStatus::Cancelled));
        }
    }

    #[test]
    fn lifecycle_transitions() {
        assert!(RideStatus::Requested.can_transition_to(RideStatus::Accepted));
        assert!(RideStatus::Accepted.can_transition_to(RideStatus::Arriving));
        assert!(RideStatus::Arriving.can_transition_to(RideStatus::InProgress));
        assert!(RideStatus::InProgress.can_transition_to(RideStatus::Completed));
        assert!(!RideStatus::Requested.can_transition_to(RideStatus::InProgress));
        assert!(!RideStatus::InProgress.can_transition_to(RideStatus::Arriving));
    }

    #[test]
    fn ride_request_keeps_unknown_fields() {
        let raw = serde_json::json!({
            "rideId": "r_1",
            "passengerId": "p_1",
            "pickup": { "lat": -23.55, "lng": -46.63 },
            "destination": { "lat": -23.56, "lng": -46.65 },
            "category": "comfort"
        });
        let request: RideRequest = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(request.ride_id, "r_1");
        assert_eq!(
            request.extra.get("category").and_then(|v| v.as_str()),
            Some("comfort")
        );
    }

    #[test]
    fn envelope_round_trip() {
        let env = envelope("ride:accept", "m_1", 1000, &RideAccept {
            ride_id: "r_1".to_string(),
            driver_id: "d_1".to_string(),
        })
        .expect("envelope");
        let text = serde_json::to_string(&env).expect("serialize");
        assert!(text.contains("\"type\":\"ride:accept\""));
        assert!(text.contains("\"driverId\":\"d_1\""));
        let back: Envelope = serde_json::from_str(&text).expect("deserialize");
        let accept: RideAccept = serde_json::from_value(back.payload).expect("payload");
        assert_eq!(accept.ride_id, "r_1");
    }
}
