//! Transport behind the build-event publisher.
//!
//! The publisher task talks to the backend through [`BesTransport`] so tests
//! can substitute an in-memory backend. The production implementation dials
//! tonic: a `grpc://` target means plaintext, anything else is TLS with the
//! system roots.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt as _;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{ClientTlsConfig, Endpoint};
use tracing::debug;

use super::proto::publish::{
    PublishBuildToolEventStreamRequest, PublishBuildToolEventStreamResponse,
};
use super::PublishError;

/// Full method path of the publish RPC.
const STREAM_METHOD: &str =
    "/google.devtools.build.v1.PublishBuildEvent/PublishBuildToolEventStream";

/// Acknowledgements flowing back from the backend, ending cleanly when the
/// backend has acked the whole sequence.
pub type AckStream = BoxStream<'static, Result<PublishBuildToolEventStreamResponse, tonic::Status>>;

/// One bidirectional event stream to the results backend.
#[async_trait]
pub trait BesTransport: Send + Sync {
    /// Open the stream, feeding it `outbound` as the request side. Dropping
    /// the sender half of `outbound` half-closes the stream.
    async fn open_stream(
        &self,
        outbound: ReceiverStream<PublishBuildToolEventStreamRequest>,
    ) -> Result<AckStream, PublishError>;
}

/// gRPC transport dialing the configured `bes_backend` target.
pub struct GrpcBesTransport {
    target: String,
}

impl GrpcBesTransport {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[async_trait]
impl BesTransport for GrpcBesTransport {
    async fn open_stream(
        &self,
        outbound: ReceiverStream<PublishBuildToolEventStreamRequest>,
    ) -> Result<AckStream, PublishError> {
        let endpoint = endpoint_for_target(&self.target)?;
        debug!(target = %self.target, "dialing build-event backend");
        let channel = endpoint
            .connect()
            .await
            .map_err(|err| PublishError::Dial(format!("{}: {err}", self.target)))?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|err| PublishError::Dial(format!("{}: {err}", self.target)))?;
        let codec: tonic::codec::ProstCodec<
            PublishBuildToolEventStreamRequest,
            PublishBuildToolEventStreamResponse,
        > = tonic::codec::ProstCodec::default();
        let response = grpc
            .streaming(
                tonic::Request::new(outbound),
                PathAndQuery::from_static(STREAM_METHOD),
                codec,
            )
            .await
            .map_err(|status| PublishError::OpenStream(status.to_string()))?;
        Ok(response.into_inner().boxed())
    }
}

/// Resolve the URI to dial and whether TLS is required. A `grpc://` scheme
/// means plaintext; any other scheme, or no scheme at all, means TLS.
fn dial_uri(target: &str) -> (String, bool) {
    let (scheme, rest) = match target.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("grpcs", target),
    };
    match scheme {
        "grpc" | "http" => (format!("http://{rest}"), false),
        _ => (format!("https://{rest}"), true),
    }
}

fn endpoint_for_target(target: &str) -> Result<Endpoint, PublishError> {
    let (uri, tls) = dial_uri(target);
    let dial = |err: String| PublishError::Dial(format!("{target}: {err}"));
    let endpoint = Endpoint::from_shared(uri).map_err(|err| dial(err.to_string()))?;
    if tls {
        return endpoint
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(|err| dial(err.to_string()));
    }
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_scheme_dials_plaintext() {
        assert_eq!(
            dial_uri("grpc://localhost:1985"),
            ("http://localhost:1985".to_owned(), false)
        );
    }

    #[test]
    fn other_schemes_and_bare_targets_dial_tls() {
        assert_eq!(
            dial_uri("grpcs://bes.example.com"),
            ("https://bes.example.com".to_owned(), true)
        );
        assert_eq!(
            dial_uri("bes.example.com:443"),
            ("https://bes.example.com:443".to_owned(), true)
        );
    }

    #[test]
    fn garbage_targets_fail_to_dial() {
        assert!(matches!(
            endpoint_for_target("grpc://bad target with spaces"),
            Err(PublishError::Dial(_))
        ));
    }
}
