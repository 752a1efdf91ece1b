//! Relay Control Protocol
//!
//! JSON text frames tagged by `type`:
//!
//! ```text
//! client → relay   hello, open{mac}, set_config{toggles.., SamplingRate},
//!                  start{mac}, stop, close
//! relay → client   hello_ack{ok}, open_ack{ok}, config_ack{ok, error?},
//!                  start_ack{ok}, config_changed{cfg}, sample{..}, error{error}
//! ```

use crate::domain::sensors::SensorToggles;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Hello,
    HelloAck {
        #[serde(default)]
        ok: bool,
    },
    Open {
        mac: String,
    },
    OpenAck {
        #[serde(default)]
        ok: bool,
    },
    SetConfig {
        #[serde(flatten)]
        toggles: SensorToggles,
        #[serde(rename = "SamplingRate")]
        sampling_rate: f64,
    },
    ConfigAck {
        #[serde(default)]
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ConfigChanged {
        #[serde(default)]
        cfg: Value,
    },
    Start {
        mac: String,
    },
    StartAck {
        #[serde(default)]
        ok: bool,
    },
    Stop,
    Close,
    /// Sample body; decoded by the sample decoder
    Sample(Map<String, Value>),
    Error {
        #[serde(default)]
        error: String,
    },
}

/// Command kinds that expect an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Hello,
    Open,
    Config,
    Start,
}

/// Body of an acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub ok: bool,
    pub error: Option<String>,
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The acknowledgement this message carries, if it is one
    pub fn as_ack(&self) -> Option<(AckKind, Ack)> {
        let (kind, ok, error) = match self {
            ControlMessage::HelloAck { ok } => (AckKind::Hello, *ok, None),
            ControlMessage::OpenAck { ok } => (AckKind::Open, *ok, None),
            ControlMessage::ConfigAck { ok, error } => (AckKind::Config, *ok, error.clone()),
            ControlMessage::StartAck { ok } => (AckKind::Start, *ok, None),
            _ => return None,
        };
        Some((kind, Ack { ok, error }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shapes() {
        assert_eq!(ControlMessage::Hello.encode().unwrap(), r#"{"type":"hello"}"#);

        let open = ControlMessage::Open {
            mac: "00:06:66:AA:BB:CC".into(),
        };
        assert_eq!(
            serde_json::to_value(&open).unwrap(),
            json!({"type": "open", "mac": "00:06:66:AA:BB:CC"})
        );
    }

    #[test]
    fn test_set_config_flattens_toggles() {
        let msg = ControlMessage::SetConfig {
            toggles: SensorToggles {
                enable_gyroscope: true,
                enable_ext_a15: true,
                ..Default::default()
            },
            sampling_rate: 51.2,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "set_config");
        assert_eq!(value["EnableGyroscope"], true);
        assert_eq!(value["EnableExtA15"], true);
        assert_eq!(value["EnableLowNoiseAccelerometer"], false);
        assert_eq!(value["SamplingRate"], 51.2);
        // 9 toggles + rate + type
        assert_eq!(value.as_object().unwrap().len(), 11);
    }

    #[test]
    fn test_parse_acks() {
        let msg = ControlMessage::parse(r#"{"type":"hello_ack","ok":true}"#).unwrap();
        assert_eq!(
            msg.as_ack(),
            Some((AckKind::Hello, Ack { ok: true, error: None }))
        );

        let msg =
            ControlMessage::parse(r#"{"type":"config_ack","ok":false,"error":"rate"}"#).unwrap();
        assert_eq!(
            msg.as_ack(),
            Some((
                AckKind::Config,
                Ack {
                    ok: false,
                    error: Some("rate".into())
                }
            ))
        );

        // Missing `ok` reads as a rejection
        let msg = ControlMessage::parse(r#"{"type":"start_ack"}"#).unwrap();
        assert_eq!(msg.as_ack().map(|(_, ack)| ack.ok), Some(false));
    }

    #[test]
    fn test_parse_sample_and_error() {
        let msg = ControlMessage::parse(r#"{"type":"sample","ts":5,"vbatt":3.7}"#).unwrap();
        match msg {
            ControlMessage::Sample(body) => {
                assert_eq!(body["vbatt"], 3.7);
                assert!(body.get("type").is_none());
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg = ControlMessage::parse(r#"{"type":"error","error":"busy"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Error { error: "busy".into() });
        assert!(msg.as_ack().is_none());
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(ControlMessage::parse(r#"{"type":"reboot"}"#).is_err());
        assert!(ControlMessage::parse("[1,2]").is_err());
    }
}
