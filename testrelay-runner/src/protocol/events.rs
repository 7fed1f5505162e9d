// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::{EventDecodeError, ProtocolViolation};
use bytes::Bytes;
use camino::Utf8PathBuf;
use ciborium::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The name of the discriminator field in every message.
pub const TYPE_FIELD: &str = "type";

/// The `type` of the acknowledgement sent back after each frame.
pub const CONFIRMATION_TYPE: &str = "confirmation";

/// Returns the acknowledgement payload, `{type: "confirmation"}`.
pub fn confirmation() -> Value {
    Value::Map(vec![(
        Value::Text(TYPE_FIELD.to_owned()),
        Value::Text(CONFIRMATION_TYPE.to_owned()),
    )])
}

/// A progress event sent by the external process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub enum Event {
    /// The launch started. Declares every test that is part of it.
    LaunchBegin {
        /// The tests in this launch.
        tests: Vec<TestDescriptor>,
    },

    /// A test started running.
    TestBegin {
        /// The run snapshot.
        run: RunInfo,
    },

    /// A test started being skipped.
    TestSkipBegin {
        /// The run snapshot.
        run: RunInfo,
    },

    /// A test finished being skipped.
    TestSkipEnd {
        /// The run snapshot.
        run: RunInfo,
    },

    /// Narrative text produced by the process.
    Report {
        /// The test this text belongs to, if it was produced inside a test boundary.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run: Option<RunInfo>,

        /// The text.
        text: String,
    },

    /// A screenshot taken by the process.
    ReportScreenshot {
        /// The test this screenshot belongs to, if it was taken inside a test boundary.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run: Option<RunInfo>,

        /// The encoded image.
        #[cfg_attr(
            test,
            strategy(proptest::strategy::Strategy::prop_map(
                proptest::collection::vec(proptest::num::u8::ANY, 0..64),
                Bytes::from,
            ))
        )]
        image: Bytes,
    },

    /// A test finished.
    TestEnd {
        /// The run snapshot.
        run: RunInfo,
    },

    /// The launch ended. No further events follow.
    LaunchEnd,
}

impl Event {
    /// Returns the kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::LaunchBegin { .. } => EventKind::LaunchBegin,
            Self::TestBegin { .. } => EventKind::TestBegin,
            Self::TestSkipBegin { .. } => EventKind::TestSkipBegin,
            Self::TestSkipEnd { .. } => EventKind::TestSkipEnd,
            Self::Report { .. } => EventKind::Report,
            Self::ReportScreenshot { .. } => EventKind::ReportScreenshot,
            Self::TestEnd { .. } => EventKind::TestEnd,
            Self::LaunchEnd => EventKind::LaunchEnd,
        }
    }

    /// Converts a decoded frame payload into an event.
    ///
    /// A payload with an unrecognized `type` is reported as
    /// [`EventDecodeError::InvalidMessageType`], separately from payloads of a known type whose
    /// fields are malformed.
    pub fn from_value(value: &Value) -> Result<Self, EventDecodeError> {
        let tag = value
            .as_map()
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|(key, _)| key.as_text() == Some(TYPE_FIELD))
            })
            .and_then(|(_, tag)| tag.as_text())
            .ok_or(ProtocolViolation::MissingType)?;

        let kind = EventKind::from_tag(tag).ok_or_else(|| EventDecodeError::InvalidMessageType {
            kind: tag.to_owned(),
        })?;

        let event = value
            .deserialized::<Self>()
            .map_err(|err| ProtocolViolation::MalformedEvent { kind, err })?;
        Ok(event)
    }

    /// Converts this event into a payload value.
    pub fn to_value(&self) -> Result<Value, ciborium::value::Error> {
        Value::serialized(self)
    }
}

/// The kind of an [`Event`], matching its `type` tag on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `launch_begin`
    LaunchBegin,
    /// `test_begin`
    TestBegin,
    /// `test_skip_begin`
    TestSkipBegin,
    /// `test_skip_end`
    TestSkipEnd,
    /// `report`
    Report,
    /// `report_screenshot`
    ReportScreenshot,
    /// `test_end`
    TestEnd,
    /// `launch_end`
    LaunchEnd,
}

impl EventKind {
    /// All known event kinds.
    pub const ALL: &'static [Self] = &[
        Self::LaunchBegin,
        Self::TestBegin,
        Self::TestSkipBegin,
        Self::TestSkipEnd,
        Self::Report,
        Self::ReportScreenshot,
        Self::TestEnd,
        Self::LaunchEnd,
    ];

    /// Returns the wire tag for this kind.
    pub fn tag(self) -> &'static str {
        match self {
            Self::LaunchBegin => "launch_begin",
            Self::TestBegin => "test_begin",
            Self::TestSkipBegin => "test_skip_begin",
            Self::TestSkipEnd => "test_skip_end",
            Self::Report => "report",
            Self::ReportScreenshot => "report_screenshot",
            Self::TestEnd => "test_end",
            Self::LaunchEnd => "launch_end",
        }
    }

    /// Looks up a kind by its wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.tag() == tag)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A test declared in [`Event::LaunchBegin`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub struct TestDescriptor {
    /// The name of the test, unique within a launch.
    pub name: String,

    /// The names of the tests this one depends on.
    #[serde(default)]
    pub parents: Vec<String>,

    /// Whether a previous result for this test is still valid.
    pub cache_status: CacheStatus,

    /// The definition file the test was declared in.
    #[cfg_attr(
        test,
        strategy(proptest::strategy::Strategy::prop_map("[a-z]{1,8}\\.testo", Utf8PathBuf::from))
    )]
    pub source_file: Utf8PathBuf,
}

/// The cache status of a declared test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub enum CacheStatus {
    /// A previous run already satisfied this test and nothing it depends on changed.
    Ok,

    /// Any other cache status: the test has to run.
    #[serde(other)]
    Other,
}

/// A snapshot of a test's execution, carried by per-test events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub struct RunInfo {
    /// The name of the test.
    pub test_name: String,

    /// The execution status at the time of the event.
    pub exec_status: ExecStatus,

    /// Why the test failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<FailureCategory>,
}

impl RunInfo {
    /// Creates a new run snapshot without a failure category.
    pub fn new(test_name: impl Into<String>, exec_status: ExecStatus) -> Self {
        Self {
            test_name: test_name.into(),
            exec_status,
            failure_category: None,
        }
    }

    /// Sets the failure category.
    pub fn with_failure_category(mut self, category: FailureCategory) -> Self {
        self.failure_category = Some(category);
        self
    }
}

/// The execution status of a test run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub enum ExecStatus {
    /// The test hasn't finished yet.
    Unknown,
    /// The test passed.
    Passed,
    /// The test failed.
    Failed,
    /// The test was skipped.
    Skipped,
}

/// The category of a test failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub enum FailureCategory {
    /// The test's own logic failed.
    LogicError,

    /// Any other failure, e.g. in the infrastructure running the test.
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameDecoder, encode_frame};
    use pretty_assertions::assert_eq;
    use test_case::test_case;
    use test_strategy::proptest;

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Text(k.to_owned()), v))
                .collect(),
        )
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_owned())
    }

    #[proptest(cases = 256)]
    fn event_survives_framing(event: Event) {
        let frame = encode_frame(&event).expect("event encodes");

        let mut decoder = FrameDecoder::new(u64::from(u32::MAX));
        decoder.extend(&frame);
        let payload = decoder
            .next_frame()
            .expect("frame is well-formed")
            .expect("frame is complete");
        let value: Value = ciborium::from_reader(&payload[..]).expect("payload is CBOR");

        assert_eq!(Event::from_value(&value).expect("event decodes"), event);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decode_wire_shapes() {
        let value = map(vec![
            ("type", text("launch_begin")),
            (
                "tests",
                Value::Array(vec![map(vec![
                    ("name", text("install_os")),
                    ("parents", Value::Array(vec![text("create_vm")])),
                    ("cache_status", text("miss")),
                    ("source_file", text("/tests/os.testo")),
                    ("unrelated", Value::Integer(7.into())),
                ])]),
            ),
        ]);
        assert_eq!(
            Event::from_value(&value).expect("launch_begin decodes"),
            Event::LaunchBegin {
                tests: vec![TestDescriptor {
                    name: "install_os".to_owned(),
                    parents: vec!["create_vm".to_owned()],
                    cache_status: CacheStatus::Other,
                    source_file: "/tests/os.testo".into(),
                }],
            }
        );

        let value = map(vec![
            ("type", text("test_end")),
            (
                "run",
                map(vec![
                    ("test_name", text("install_os")),
                    ("exec_status", text("failed")),
                    ("failure_category", text("native_bug")),
                ]),
            ),
        ]);
        assert_eq!(
            Event::from_value(&value).expect("test_end decodes"),
            Event::TestEnd {
                run: RunInfo::new("install_os", ExecStatus::Failed)
                    .with_failure_category(FailureCategory::Other),
            }
        );

        let value = map(vec![("type", text("report")), ("text", text("hello"))]);
        assert_eq!(
            Event::from_value(&value).expect("report decodes"),
            Event::Report {
                run: None,
                text: "hello".to_owned(),
            }
        );

        let value = map(vec![
            ("type", text("report_screenshot")),
            ("image", Value::Bytes(vec![0x89, b'P', b'N', b'G'])),
        ]);
        assert_eq!(
            Event::from_value(&value).expect("report_screenshot decodes"),
            Event::ReportScreenshot {
                run: None,
                image: Bytes::from_static(b"\x89PNG"),
            }
        );
    }

    #[test_case(map(vec![("type", text("confirmation"))]), "confirmation" ; "confirmation is not an event")]
    #[test_case(map(vec![("type", text("launch_pause"))]), "launch_pause" ; "unknown tag")]
    fn invalid_message_type(value: Value, expected: &str) {
        match Event::from_value(&value) {
            Err(EventDecodeError::InvalidMessageType { kind }) => assert_eq!(kind, expected),
            other => panic!("expected InvalidMessageType, found {other:?}"),
        }
    }

    #[test_case(text("launch_end") ; "not a map")]
    #[test_case(map(vec![("text", text("hello"))]) ; "no type field")]
    #[test_case(map(vec![("type", Value::Integer(3.into()))]) ; "type is not text")]
    fn missing_type(value: Value) {
        assert!(
            matches!(
                Event::from_value(&value),
                Err(EventDecodeError::Protocol(ProtocolViolation::MissingType))
            ),
            "expected MissingType"
        );
    }

    #[test]
    fn malformed_event_names_its_kind() {
        let value = map(vec![("type", text("test_begin"))]);
        match Event::from_value(&value) {
            Err(EventDecodeError::Protocol(ProtocolViolation::MalformedEvent { kind, .. })) => {
                assert_eq!(kind, EventKind::TestBegin);
            }
            other => panic!("expected MalformedEvent, found {other:?}"),
        }
    }

    #[test]
    fn event_kind_tags_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_tag(kind.tag()), Some(*kind));
        }
        assert_eq!(EventKind::from_tag(CONFIRMATION_TYPE), None);
    }
}
