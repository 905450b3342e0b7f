use std::collections::HashSet;

use axum::http::{HeaderValue, header};
use axum::response::Response;

/// Applies CORS headers: if the domain whitelist is non-empty and the
/// request's `Origin` isn't in it, headers are omitted entirely (no
/// `Access-Control-Allow-Origin` at all, rather than a blank one). Otherwise
/// the origin is echoed back alongside the fixed method/header allow-lists.
pub fn apply(resp: &mut Response, domain_whitelist: &HashSet<String>, origin: Option<&str>) {
    let Some(origin) = origin else { return };
    if !domain_whitelist.is_empty() && !domain_whitelist.contains(origin) {
        return;
    }
    let Ok(origin_value) = HeaderValue::from_str(origin) else {
        return;
    };

    let headers = resp.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin_value);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
}
