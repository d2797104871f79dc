use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall payload status for a batch of alerts that have triggered.
pub const STATUS_FIRING: &str = "firing";
/// Overall payload status for a batch of alerts that have cleared.
pub const STATUS_RESOLVED: &str = "resolved";

/// One notification batch as POSTed by Alertmanager's webhook integration.
///
/// The wire format is fixed upstream (template data, version 4). Fields that
/// Alertmanager may omit are defaulted so decoding stays tolerant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AmPayload {
    pub receiver: String,
    pub status: String,
    pub alerts: Vec<AmAlert>,
    #[serde(rename = "groupLabels")]
    pub group_labels: HashMap<String, String>,
    #[serde(rename = "commonLabels")]
    pub common_labels: HashMap<String, String>,
    #[serde(rename = "commonAnnotations")]
    pub common_annotations: HashMap<String, String>,
    #[serde(rename = "externalURL")]
    pub external_url: String,
    pub version: String,
}

/// A single alert inside an [`AmPayload`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AmAlert {
    pub status: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    #[serde(rename = "startsAt")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(rename = "endsAt")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
    pub fingerprint: String,
}

/// Renders a timestamp as Unix seconds. Alertmanager uses the zero time for
/// "not set" (a still-firing alert's end time), which becomes the literal `0`.
fn time_to_str(t: Option<&DateTime<Utc>>) -> String {
    match t {
        Some(t) if t.timestamp() > 0 => t.timestamp().to_string(),
        _ => "0".to_string(),
    }
}

/// Converts an alert payload into `NAME=value` strings, meant to be set as
/// environment variables of the commands called by this program.
///
/// Ordering inside each mapping-derived group follows map iteration order and
/// is unspecified; callers that compare output should sort first.
pub fn alert_env(payload: &AmPayload) -> Vec<String> {
    let mut env = vec![
        format!("AMX_RECEIVER={}", payload.receiver),
        format!("AMX_STATUS={}", payload.status),
        format!("AMX_EXTERNAL_URL={}", payload.external_url),
        format!("AMX_ALERT_LEN={}", payload.alerts.len()),
    ];

    for (prefix, labels) in [
        ("AMX_LABEL", &payload.common_labels),
        ("AMX_GLABEL", &payload.group_labels),
        ("AMX_ANNOTATION", &payload.common_annotations),
    ] {
        for (k, v) in labels {
            env.push(format!("{prefix}_{k}={v}"));
        }
    }

    for (i, alert) in payload.alerts.iter().enumerate() {
        let key = format!("AMX_ALERT_{}", i + 1);
        env.push(format!("{key}_STATUS={}", alert.status));
        env.push(format!("{key}_START={}", time_to_str(alert.starts_at.as_ref())));
        env.push(format!("{key}_END={}", time_to_str(alert.ends_at.as_ref())));
        env.push(format!("{key}_URL={}", alert.generator_url));
        env.push(format!("{key}_FINGERPRINT={}", alert.fingerprint));
        for (prefix, labels) in [("LABEL", &alert.labels), ("ANNOTATION", &alert.annotations)] {
            for (k, v) in labels {
                env.push(format!("{key}_{prefix}_{k}={v}"));
            }
        }
    }

    env
}


#[cfg(test)]
mod tests {
    use super::testdata::*;
    use super::*;

    fn expected_env() -> Vec<String> {
        [
            "AMX_ALERT_1_END=0",
            "AMX_ALERT_1_LABEL_alertname=InstanceDown",
            "AMX_ALERT_1_LABEL_instance=localhost:1234",
            "AMX_ALERT_1_LABEL_job=broken",
            "AMX_ALERT_1_LABEL_monitor=codelab-monitor",
            "AMX_ALERT_1_START=1460045332",
            "AMX_ALERT_1_STATUS=firing",
            "AMX_ALERT_1_URL=http://oldpad:9090/graph#%5B%7B%22expr%22%3A%22up%20%3D%3D%200%22%2C%22tab%22%3A0%7D%5D",
            "AMX_ALERT_1_FINGERPRINT=",
            "AMX_ALERT_2_END=0",
            "AMX_ALERT_2_LABEL_alertname=InstanceDown",
            "AMX_ALERT_2_LABEL_instance=localhost:5678",
            "AMX_ALERT_2_LABEL_job=broken",
            "AMX_ALERT_2_LABEL_monitor=codelab-monitor",
            "AMX_ALERT_2_START=1460045332",
            "AMX_ALERT_2_STATUS=firing",
            "AMX_ALERT_2_URL=http://oldpad:9090/graph#%5B%7B%22expr%22%3A%22up%20%3D%3D%200%22%2C%22tab%22%3A0%7D%5D",
            "AMX_ALERT_2_FINGERPRINT=boop",
            "AMX_ALERT_LEN=2",
            "AMX_EXTERNAL_URL=http://oldpad:9093",
            "AMX_GLABEL_alertname=InstanceDown",
            "AMX_LABEL_alertname=InstanceDown",
            "AMX_LABEL_instance=localhost:1234",
            "AMX_LABEL_job=broken",
            "AMX_LABEL_monitor=codelab-monitor",
            "AMX_RECEIVER=default",
            "AMX_STATUS=firing",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn projection_matches_expected_set() {
        let mut env = alert_env(&firing_payload());
        let mut expected = expected_env();
        env.sort();
        expected.sort();
        assert_eq!(env, expected);
    }

    #[test]
    fn projection_is_idempotent() {
        let payload = firing_payload();
        let mut first = alert_env(&payload);
        let mut second = alert_env(&payload);
        first.sort();
        second.sort();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_and_missing_times_render_as_zero() {
        assert_eq!(time_to_str(None), "0");
        // Alertmanager's "not set" sentinel is the year-one zero time.
        let zero: DateTime<Utc> = "0001-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(time_to_str(Some(&zero)), "0");
        assert_eq!(time_to_str(Some(&start_time())), "1460045332");
    }

    #[test]
    fn payload_decodes_wire_names() {
        let raw = r#"{
            "receiver": "default",
            "status": "firing",
            "alerts": [{
                "status": "firing",
                "labels": {"alertname": "InstanceDown"},
                "annotations": {},
                "startsAt": "2016-04-07T16:08:52Z",
                "endsAt": "0001-01-01T00:00:00Z",
                "generatorURL": "http://oldpad:9090/graph",
                "fingerprint": "boop"
            }],
            "groupLabels": {"alertname": "InstanceDown"},
            "commonLabels": {"alertname": "InstanceDown"},
            "commonAnnotations": {},
            "externalURL": "http://oldpad:9093",
            "version": "4"
        }"#;
        let payload: AmPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.external_url, "http://oldpad:9093");
        assert_eq!(payload.alerts.len(), 1);
        assert_eq!(payload.alerts[0].fingerprint, "boop");
        assert_eq!(
            time_to_str(payload.alerts[0].starts_at.as_ref()),
            "1460045332"
        );
        assert_eq!(time_to_str(payload.alerts[0].ends_at.as_ref()), "0");
    }

    #[test]
    fn payload_tolerates_missing_fields() {
        let payload: AmPayload = serde_json::from_str(r#"{"status": "firing"}"#).unwrap();
        assert_eq!(payload.status, "firing");
        assert!(payload.alerts.is_empty());
        assert!(payload.receiver.is_empty());
    }
}
