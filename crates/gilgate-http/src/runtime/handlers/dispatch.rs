//! Gateway dispatch: every public request goes through the scheduler.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use gilgate_core::priority::client_addr;
use gilgate_core::{Gateway, GatewayReply, RequestInfo};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::runtime::body::request_body;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Fallback handler for the public router
pub async fn dispatch(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let forwarded = parts
        .headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok());
    let client = client_addr(peer.ip(), forwarded);

    let body = match request_body(
        &parts.method,
        &parts.headers,
        body,
        gateway.config().request_buffer_length,
    )
    .await
    {
        Ok(body) => body,
        Err(e) => {
            warn!(%client, error = %e, "Failed to read request body");
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
    };
    let info = RequestInfo::new(parts.method, parts.uri, parts.headers, client);

    // The guard fires if this handler is dropped, i.e. the client went away.
    // The spawned task keeps running so an executing job is still accounted for.
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();
    let serving = tokio::spawn(async move { gateway.serve(info, body, &cancel).await });

    match serving.await {
        Ok(reply) => reply_to_response(reply),
        Err(e) => {
            error!(error = %e, "Gateway task failed");
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}

/// Convert a gateway reply into an HTTP response.
///
/// A disconnect becomes an empty response that closes the connection.
pub fn reply_to_response(reply: GatewayReply) -> Response {
    match reply {
        GatewayReply::Response(job) => {
            let mut response = Response::new(Body::from(job.body));
            *response.status_mut() = job.status;
            *response.headers_mut() = job.headers;
            response
        }
        GatewayReply::Disconnect => {
            let mut response = Response::new(Body::empty());
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gilgate_core::JobResponse;

    #[test]
    fn test_reply_to_response_copies_status_and_headers() {
        let mut job = JobResponse::with_body(StatusCode::CREATED, "made");
        job.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let response = reply_to_response(GatewayReply::Response(job));
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn test_disconnect_closes_connection() {
        let response = reply_to_response(GatewayReply::Disconnect);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONNECTION], "close");
    }
}
