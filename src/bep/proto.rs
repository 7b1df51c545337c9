//! Trimmed mirror of the build-event wire schema.
//!
//! Only the messages and fields this runner actually emits are declared, but
//! every field number matches the upstream `build_event_stream.proto`,
//! `build_events.proto` and `publish_build_event.proto` definitions, so the
//! serialized bytes are interchangeable with what bazel itself produces and
//! the backend's existing parsers accept them.

/// Messages from the `build_event_stream` package: the tool-level events
/// that travel inside the `bazel_event` Any payload.
pub mod bes {
    /// Identifier of a single build event, also used for forward references
    /// in `children` declarations.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct BuildEventId {
        #[prost(oneof = "build_event_id::Id", tags = "2, 3, 9, 14, 20")]
        pub id: Option<build_event_id::Id>,
    }

    pub mod build_event_id {
        #[derive(Clone, PartialEq, prost::Message)]
        pub struct ProgressId {
            /// Opaque chain counter: each progress event declares its
            /// successor's count as a child.
            #[prost(int32, tag = "1")]
            pub opaque_count: i32,
        }

        #[derive(Clone, PartialEq, prost::Message)]
        pub struct BuildStartedId {}

        #[derive(Clone, PartialEq, prost::Message)]
        pub struct BuildFinishedId {}

        #[derive(Clone, PartialEq, prost::Message)]
        pub struct WorkspaceStatusId {}

        #[derive(Clone, PartialEq, prost::Message)]
        pub struct BuildToolLogsId {}

        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Id {
            #[prost(message, tag = "2")]
            Progress(ProgressId),
            #[prost(message, tag = "3")]
            Started(BuildStartedId),
            #[prost(message, tag = "9")]
            BuildFinished(BuildFinishedId),
            #[prost(message, tag = "14")]
            WorkspaceStatus(WorkspaceStatusId),
            #[prost(message, tag = "20")]
            BuildToolLogs(BuildToolLogsId),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct BuildEvent {
        #[prost(message, optional, tag = "1")]
        pub id: Option<BuildEventId>,
        #[prost(message, repeated, tag = "2")]
        pub children: Vec<BuildEventId>,
        #[prost(bool, tag = "20")]
        pub last_message: bool,
        #[prost(oneof = "build_event::Payload", tags = "3, 5, 14, 16, 23")]
        pub payload: Option<build_event::Payload>,
    }

    pub mod build_event {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Payload {
            #[prost(message, tag = "3")]
            Progress(super::Progress),
            #[prost(message, tag = "5")]
            Started(super::BuildStarted),
            #[prost(message, tag = "14")]
            Finished(super::BuildFinished),
            #[prost(message, tag = "16")]
            WorkspaceStatus(super::WorkspaceStatus),
            #[prost(message, tag = "23")]
            BuildToolLogs(super::BuildToolLogs),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Progress {
        #[prost(string, tag = "1")]
        pub stdout: String,
        #[prost(string, tag = "2")]
        pub stderr: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct BuildStarted {
        #[prost(string, tag = "1")]
        pub uuid: String,
        #[prost(int64, tag = "2")]
        pub start_time_millis: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct WorkspaceStatus {
        #[prost(message, repeated, tag = "1")]
        pub item: Vec<workspace_status::Item>,
    }

    pub mod workspace_status {
        #[derive(Clone, PartialEq, prost::Message)]
        pub struct Item {
            #[prost(string, tag = "1")]
            pub key: String,
            #[prost(string, tag = "2")]
            pub value: String,
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct BuildFinished {
        #[prost(bool, tag = "1")]
        pub overall_success: bool,
        #[prost(int64, tag = "2")]
        pub finish_time_millis: i64,
        #[prost(message, optional, tag = "3")]
        pub exit_code: Option<build_finished::ExitCode>,
    }

    pub mod build_finished {
        #[derive(Clone, PartialEq, prost::Message)]
        pub struct ExitCode {
            #[prost(string, tag = "1")]
            pub name: String,
            #[prost(int32, tag = "2")]
            pub code: i32,
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct BuildToolLogs {
        #[prost(message, repeated, tag = "1")]
        pub log: Vec<File>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct File {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(oneof = "file::File", tags = "2, 3")]
        pub file: Option<file::File>,
    }

    pub mod file {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum File {
            #[prost(string, tag = "2")]
            Uri(String),
            #[prost(bytes, tag = "3")]
            Contents(Vec<u8>),
        }
    }
}

/// Messages from the `google.devtools.build.v1` package: the ordered
/// envelopes and the publish RPC surface.
pub mod publish {
    /// Identity of one event stream, carried on every envelope.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StreamId {
        #[prost(string, tag = "1")]
        pub build_id: String,
        #[prost(string, tag = "6")]
        pub invocation_id: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct BuildEvent {
        #[prost(message, optional, tag = "1")]
        pub event_time: Option<prost_types::Timestamp>,
        #[prost(oneof = "build_event::Event", tags = "59, 60")]
        pub event: Option<build_event::Event>,
    }

    pub mod build_event {
        #[derive(Clone, PartialEq, prost::Message)]
        pub struct BuildComponentStreamFinished {
            #[prost(
                enumeration = "build_component_stream_finished::FinishType",
                tag = "1"
            )]
            pub r#type: i32,
        }

        pub mod build_component_stream_finished {
            #[derive(
                Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration,
            )]
            #[repr(i32)]
            pub enum FinishType {
                Unspecified = 0,
                /// The stream is closed and all its events were sent.
                Finished = 1,
                Expired = 2,
            }
        }

        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Event {
            #[prost(message, tag = "59")]
            ComponentStreamFinished(BuildComponentStreamFinished),
            #[prost(message, tag = "60")]
            BazelEvent(prost_types::Any),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct OrderedBuildEvent {
        #[prost(message, optional, tag = "1")]
        pub stream_id: Option<StreamId>,
        #[prost(int64, tag = "2")]
        pub sequence_number: i64,
        #[prost(message, optional, tag = "3")]
        pub event: Option<BuildEvent>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PublishBuildToolEventStreamRequest {
        #[prost(message, optional, tag = "4")]
        pub ordered_build_event: Option<OrderedBuildEvent>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PublishBuildToolEventStreamResponse {
        #[prost(message, optional, tag = "1")]
        pub stream_id: Option<StreamId>,
        #[prost(int64, tag = "2")]
        pub sequence_number: i64,
    }
}

/// Type URL under which tool events are packed into the envelope's Any.
pub const BAZEL_EVENT_TYPE_URL: &str = "type.googleapis.com/build_event_stream.BuildEvent";

/// Pack a tool-level event into the `bazel_event` Any payload.
pub fn pack_bazel_event(event: &bes::BuildEvent) -> prost_types::Any {
    use prost::Message as _;
    prost_types::Any {
        type_url: BAZEL_EVENT_TYPE_URL.to_owned(),
        value: event.encode_to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn bazel_event_round_trips_through_any() {
        let event = bes::BuildEvent {
            id: Some(bes::BuildEventId {
                id: Some(bes::build_event_id::Id::Progress(
                    bes::build_event_id::ProgressId { opaque_count: 3 },
                )),
            }),
            children: vec![],
            last_message: false,
            payload: Some(bes::build_event::Payload::Progress(bes::Progress {
                stdout: String::new(),
                stderr: "hello\n".to_owned(),
            })),
        };
        let any = pack_bazel_event(&event);
        assert_eq!(any.type_url, BAZEL_EVENT_TYPE_URL);
        let decoded = bes::BuildEvent::decode(any.value.as_slice()).unwrap();
        assert_eq!(decoded, event);
    }
}
