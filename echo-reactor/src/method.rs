// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Routes method paths to the echo service's methods.

use crate::status::Status;

/// The fully-qualified name of the echo service.
pub const SERVICE_NAME: &str = "grpc.testing.EchoTestService";

/// How many messages flow in each direction of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallShape {
    /// One request, one response.
    Unary,
    /// Many requests, one response.
    ClientStreaming,
    /// One request, many responses.
    ServerStreaming,
    /// Many requests, many responses.
    BidiStreaming,
}

/// The methods of the echo service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// Echoes one request, applying the request's parameters.
    Echo,
    /// Checks the custom client metadata pair.
    CheckClientInitialMetadata,
    /// Concatenates a stream of requests into one response.
    RequestStream,
    /// Streams several responses derived from one request.
    ResponseStream,
    /// Echoes each request of a stream.
    BidiStream,
    /// Declared by the service but deliberately left without a handler.
    Unimplemented,
}

impl Method {
    /// Every method of the service.
    pub const ALL: [Method; 6] = [
        Method::Echo,
        Method::CheckClientInitialMetadata,
        Method::RequestStream,
        Method::ResponseStream,
        Method::BidiStream,
        Method::Unimplemented,
    ];

    /// The method's name within the service.
    pub fn name(self) -> &'static str {
        match self {
            Method::Echo => "Echo",
            Method::CheckClientInitialMetadata => "CheckClientInitialMetadata",
            Method::RequestStream => "RequestStream",
            Method::ResponseStream => "ResponseStream",
            Method::BidiStream => "BidiStream",
            Method::Unimplemented => "Unimplemented",
        }
    }

    /// The method's call shape.
    pub fn shape(self) -> CallShape {
        match self {
            Method::Echo | Method::CheckClientInitialMetadata | Method::Unimplemented => {
                CallShape::Unary
            }
            Method::RequestStream => CallShape::ClientStreaming,
            Method::ResponseStream => CallShape::ServerStreaming,
            Method::BidiStream => CallShape::BidiStreaming,
        }
    }

    /// Resolves `/<service>/<method>` or a bare method name.
    ///
    /// Paths naming another service or an unknown method resolve to an `UNIMPLEMENTED` status.
    pub fn from_path(path: &str) -> Result<Method, Status> {
        let name = match path.trim_start_matches('/').split_once('/') {
            Some((SERVICE_NAME, name)) => name,
            Some(_) => return Err(not_found(path)),
            None => path,
        };
        Method::ALL
            .into_iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| not_found(path))
    }

    /// The status a call to a method without a handler terminates with.
    pub fn unimplemented_status(self) -> Status {
        Status::unimplemented(format!("{SERVICE_NAME}/{} has no handler", self.name()))
    }
}

fn not_found(path: &str) -> Status {
    tracing::info!(path, "MethodNotFound");
    Status::unimplemented(format!("method {path} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;
    use assert_matches::assert_matches;

    #[test]
    fn resolves_full_and_bare_paths() {
        assert_matches!(
            Method::from_path("/grpc.testing.EchoTestService/BidiStream"),
            Ok(Method::BidiStream)
        );
        assert_matches!(Method::from_path("Echo"), Ok(Method::Echo));
        assert_eq!(Method::RequestStream.shape(), CallShape::ClientStreaming);
    }

    #[test]
    fn unknown_paths_are_unimplemented() {
        assert_matches!(
            Method::from_path("/other.Service/Echo"),
            Err(s) if s.code() == Code::Unimplemented
        );
        assert_matches!(
            Method::from_path("/grpc.testing.EchoTestService/Nope"),
            Err(s) if s.code() == Code::Unimplemented
        );
        assert_eq!(
            Method::Unimplemented.unimplemented_status().code(),
            Code::Unimplemented
        );
    }
}
