use serde::{Deserialize, Serialize};

pub const STEP_UPDATE_PATH: &str = "step_update";
pub const REQUEST_HISTORICAL_DATA_PATH: &str = "request_historical_data";
pub const HISTORICAL_DATA_RESPONSE_PATH: &str = "historical_data_response";
pub const PEER_CONNECTED_PATH: &str = "peer_connected";

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("unknown payload path: {0}")]
    UnknownPath(String),
    #[error("malformed {path} payload: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One `(timestamp, delta)` pair in a backfill response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalEntry {
    pub step_delta: i64,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// A live increment. `timestamp` is the interval end in epoch millis when the sender supplies it.
    StepUpdate {
        step_delta: i64,
        timestamp: Option<i64>,
    },
    RequestHistoricalData {
        last_known_time: i64,
    },
    HistoricalDataResponse {
        historical_data: Vec<HistoricalEntry>,
    },
    PeerConnected,
}

#[derive(Serialize, Deserialize)]
struct StepUpdateBody {
    step_delta: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

#[derive(Serialize, Deserialize)]
struct RequestHistoricalBody {
    last_known_time: i64,
}

#[derive(Serialize, Deserialize)]
struct HistoricalResponseBody {
    historical_data: Vec<HistoricalEntry>,
}

impl SyncMessage {
    #[must_use]
    pub fn path(&self) -> &'static str {
        match self {
            Self::StepUpdate { .. } => STEP_UPDATE_PATH,
            Self::RequestHistoricalData { .. } => REQUEST_HISTORICAL_DATA_PATH,
            Self::HistoricalDataResponse { .. } => HISTORICAL_DATA_RESPONSE_PATH,
            Self::PeerConnected => PEER_CONNECTED_PATH,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let encoded = match self {
            Self::StepUpdate {
                step_delta,
                timestamp,
            } => serde_json::to_vec(&StepUpdateBody {
                step_delta: *step_delta,
                timestamp: *timestamp,
            }),
            Self::RequestHistoricalData { last_known_time } => {
                serde_json::to_vec(&RequestHistoricalBody {
                    last_known_time: *last_known_time,
                })
            }
            Self::HistoricalDataResponse { historical_data } => {
                serde_json::to_vec(&HistoricalResponseBody {
                    historical_data: historical_data.clone(),
                })
            }
            Self::PeerConnected => return Ok(Vec::new()),
        };
        encoded.map_err(|source| PayloadError::Malformed {
            path: self.path().to_string(),
            source,
        })
    }

    /// Parse a payload by its logical path. Leading slashes on the path are ignored.
    pub fn decode(path: &str, payload: &[u8]) -> Result<Self, PayloadError> {
        let path = path.trim_start_matches('/');
        let malformed = |source: serde_json::Error| PayloadError::Malformed {
            path: path.to_string(),
            source,
        };
        match path {
            STEP_UPDATE_PATH => {
                let body: StepUpdateBody = serde_json::from_slice(payload).map_err(malformed)?;
                Ok(Self::StepUpdate {
                    step_delta: body.step_delta,
                    timestamp: body.timestamp,
                })
            }
            REQUEST_HISTORICAL_DATA_PATH => {
                let body: RequestHistoricalBody =
                    serde_json::from_slice(payload).map_err(malformed)?;
                Ok(Self::RequestHistoricalData {
                    last_known_time: body.last_known_time,
                })
            }
            HISTORICAL_DATA_RESPONSE_PATH => {
                let body: HistoricalResponseBody =
                    serde_json::from_slice(payload).map_err(malformed)?;
                Ok(Self::HistoricalDataResponse {
                    historical_data: body.historical_data,
                })
            }
            PEER_CONNECTED_PATH => Ok(Self::PeerConnected),
            other => Err(PayloadError::UnknownPath(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_update_wire_shape() {
        let msg = SyncMessage::StepUpdate {
            step_delta: 250,
            timestamp: None,
        };
        assert_eq!(msg.encode().unwrap(), br#"{"step_delta":250}"#.to_vec());

        let with_ts = SyncMessage::decode("step_update", br#"{"step_delta":5,"timestamp":1000}"#)
            .unwrap();
        assert_eq!(
            with_ts,
            SyncMessage::StepUpdate {
                step_delta: 5,
                timestamp: Some(1000)
            }
        );
    }

    #[test]
    fn test_decode_historical_response() {
        let payload =
            br#"{"historical_data":[{"step_delta":5,"timestamp":100},{"step_delta":3,"timestamp":50}]}"#;
        let msg = SyncMessage::decode("/historical_data_response", payload).unwrap();
        let SyncMessage::HistoricalDataResponse { historical_data } = msg else {
            panic!("expected historical response");
        };
        assert_eq!(historical_data.len(), 2);
        assert_eq!(historical_data[1].timestamp, 50);
    }

    #[test]
    fn test_peer_connected_has_empty_body() {
        assert!(SyncMessage::PeerConnected.encode().unwrap().is_empty());
        assert_eq!(
            SyncMessage::decode("peer_connected", b"").unwrap(),
            SyncMessage::PeerConnected
        );
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            SyncMessage::decode("weight_update", b"{}"),
            Err(PayloadError::UnknownPath(p)) if p == "weight_update"
        ));
        assert!(matches!(
            SyncMessage::decode("step_update", b"not json"),
            Err(PayloadError::Malformed { .. })
        ));
        assert!(matches!(
            SyncMessage::decode("request_historical_data", br#"{"last_known":1}"#),
            Err(PayloadError::Malformed { .. })
        ));
    }
}
