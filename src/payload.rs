use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A Resque job payload: the enqueuing class name plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub class: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Deserialize)]
struct RawPayload {
    class: String,
    #[serde(default)]
    args: Option<serde_json::Value>,
}

impl Payload {
    /// Decode a queue entry. `use_number` selects lossless numeric decoding
    /// for the arguments.
    pub fn decode(bytes: &[u8], use_number: bool) -> Result<Payload, serde_json::Error> {
        let raw: RawPayload = serde_json::from_slice(bytes)?;
        let args = match raw.args {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(serde_json::Value::Array(items)) => items
                .into_iter()
                .map(|item| Value::from_json(item, use_number))
                .collect(),
            Some(_) => {
                return Err(serde::de::Error::custom("payload args must be an array"));
            }
        };

        Ok(Payload {
            class: raw.class,
            args,
        })
    }
}

/// One unit of work popped from a queue.
#[derive(Debug, Clone)]
pub struct Job {
    pub queue: String,
    pub payload: Payload,

    // The exact bytes popped from the queue list, kept so a shutdown-time
    // requeue restores the entry unchanged.
    raw: Vec<u8>,
}

impl Job {
    pub fn new(queue: impl Into<String>, payload: Payload) -> Result<Job, serde_json::Error> {
        let raw = serde_json::to_vec(&payload)?;
        Ok(Job {
            queue: queue.into(),
            payload,
            raw,
        })
    }

    pub(crate) fn from_queue_entry(
        queue: &str,
        bytes: Vec<u8>,
        use_number: bool,
    ) -> Result<Job, serde_json::Error> {
        let payload = Payload::decode(&bytes, use_number)?;
        Ok(Job {
            queue: queue.to_string(),
            payload,
            raw: bytes,
        })
    }

    pub(crate) fn raw(&self) -> &[u8] {
        self.raw.as_slice()
    }
}

/// The envelope describing what a worker is processing right now. Written
/// under `<ns>worker:<identity>` for the duration of a handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub queue: String,
    pub run_at: DateTime<Utc>,
    pub payload: Payload,
}

/// A record on the `<ns>failed` list.
///
/// The `failed_at` and `retried_at` string formats are read by external
/// Resque tooling and must not change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    #[serde(with = "failed_at_format")]
    pub failed_at: DateTime<Utc>,
    pub payload: Payload,
    pub exception: String,
    pub error: String,
    pub backtrace: Vec<String>,
    pub worker: String,
    pub queue: String,
    #[serde(with = "retried_at_format", default)]
    pub retried_at: Option<DateTime<Utc>>,
}

/// A future-scheduled job from the `<ns>_deferred` sorted set. Arguments are
/// kept as raw JSON so promotion to a queue never reinterprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deferred {
    pub queue: String,
    pub class: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl Deferred {
    /// The queue entry body for this deferral.
    pub(crate) fn payload_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        #[derive(Serialize)]
        struct Entry<'a> {
            class: &'a str,
            args: &'a serde_json::Value,
        }

        serde_json::to_vec(&Entry {
            class: self.class.as_str(),
            args: &self.args,
        })
    }
}

pub(crate) mod failed_at_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y/%m/%d %H:%M:%S %:z";

    pub fn serialize<S: Serializer>(
        date: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_str(&s, FORMAT)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

pub(crate) mod retried_at_format {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y/%m/%d %H:%M:%S";

    pub fn serialize<S: Serializer>(
        date: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match date {
            Some(date) => serializer.serialize_str(&date.format(FORMAT).to_string()),
            // Never retried; the field stays present but empty.
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(None);
        }

        NaiveDateTime::parse_from_str(&s, FORMAT)
            .map(|parsed| Some(DateTime::<Utc>::from_utc(parsed, Utc)))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn payload_decode() {
        let payload =
            Payload::decode(br#"{"class":"MyClass","args":["hi",2]}"#, false).expect("decoding");
        assert_eq!(payload.class, "MyClass");
        assert_eq!(
            payload.args,
            vec![Value::String("hi".to_string()), Value::Int(2)]
        );
    }

    #[test]
    fn payload_decode_null_args() {
        let payload = Payload::decode(br#"{"class":"MyClass","args":null}"#, false)
            .expect("decoding null args");
        assert_eq!(payload.args, Vec::new());

        let payload =
            Payload::decode(br#"{"class":"MyClass"}"#, false).expect("decoding missing args");
        assert_eq!(payload.args, Vec::new());
    }

    #[test]
    fn payload_decode_rejects_non_array_args() {
        assert!(Payload::decode(br#"{"class":"MyClass","args":3}"#, false).is_err());
    }

    #[test]
    fn job_keeps_raw_bytes() {
        let bytes = br#"{"args": [1], "class": "C"}"#.to_vec();
        let job = Job::from_queue_entry("q", bytes.clone(), false).expect("decoding");
        assert_eq!(job.raw(), bytes.as_slice());
    }

    #[test]
    fn failure_timestamp_formats() {
        let failure = Failure {
            failed_at: Utc.ymd(2021, 7, 4).and_hms(9, 5, 30),
            payload: Payload {
                class: "C".to_string(),
                args: vec![Value::Int(1)],
            },
            exception: "Error".to_string(),
            error: "boom".to_string(),
            backtrace: vec!["frame one".to_string()],
            worker: "host:12-0:q".to_string(),
            queue: "q".to_string(),
            retried_at: None,
        };

        let encoded = serde_json::to_string(&failure).expect("serializing");
        assert!(
            encoded.contains(r#""failed_at":"2021/07/04 09:05:30 +00:00""#),
            "unexpected failed_at in {}",
            encoded
        );
        assert!(
            encoded.contains(r#""retried_at":"""#),
            "unexpected retried_at in {}",
            encoded
        );

        let decoded: Failure = serde_json::from_str(&encoded).expect("deserializing");
        assert_eq!(decoded.failed_at, failure.failed_at);
        assert_eq!(decoded.retried_at, None);
    }

    #[test]
    fn failure_retried_at_round_trip() {
        let retried = Utc.ymd(2020, 1, 2).and_hms(3, 4, 5);
        let failure = Failure {
            failed_at: Utc.ymd(2020, 1, 1).and_hms(0, 0, 0),
            payload: Payload {
                class: "C".to_string(),
                args: Vec::new(),
            },
            exception: "Error".to_string(),
            error: "x".to_string(),
            backtrace: Vec::new(),
            worker: "h:1-0:q".to_string(),
            queue: "q".to_string(),
            retried_at: Some(retried),
        };

        let encoded = serde_json::to_string(&failure).expect("serializing");
        assert!(
            encoded.contains(r#""retried_at":"2020/01/02 03:04:05""#),
            "unexpected retried_at in {}",
            encoded
        );

        let decoded: Failure = serde_json::from_str(&encoded).expect("deserializing");
        assert_eq!(decoded.retried_at, Some(retried));
    }

    #[test]
    fn deferred_payload_bytes() {
        let deferred: Deferred =
            serde_json::from_str(r#"{"queue":"q","class":"C","args":["a",1]}"#)
                .expect("deserializing");
        assert_eq!(deferred.queue, "q");
        assert_eq!(
            deferred.payload_bytes().expect("encoding"),
            br#"{"class":"C","args":["a",1]}"#.to_vec()
        );
    }
}
