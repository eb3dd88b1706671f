//! HTTP to HTTPS redirect for the ACME challenge listener.
//!
//! Anything reaching the insecure port that is not a challenge request is
//! pointed at the TLS listener. Only safe methods are redirected; a client
//! submitting a body over plain HTTP gets a 400 instead.

use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::Host;

/// Redirect a plain-HTTP request to the same host and path on HTTPS.
pub async fn redirect_to_https(method: Method, Host(host): Host, uri: Uri, https_port: u16) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return (StatusCode::BAD_REQUEST, "Use HTTPS").into_response();
    }

    let https_url = https_url(&host, &uri, https_port);
    tracing::debug!(from = %uri, to = %https_url, "Redirecting HTTP to HTTPS");

    Redirect::permanent(&https_url).into_response()
}

fn https_url(host: &str, uri: &Uri, https_port: u16) -> String {
    // Remove port from host if present
    let host_without_port = match host.strip_prefix('[') {
        Some(rest) => rest
            .find(']')
            .map(|end| &host[..end + 2])
            .unwrap_or(host),
        None => host.split(':').next().unwrap_or(host),
    };
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    if https_port == 443 {
        format!("https://{}{}", host_without_port, path)
    } else {
        format!("https://{}:{}{}", host_without_port, https_port, path)
    }
}
