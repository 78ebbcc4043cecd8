//! Host/port helpers shared by the dialers.

use crate::{Error, Result};
use http::Uri;

/// Format a URL (or bare host) as `host:port`.
///
/// The port defaults to 443, or 80 for `http`; an explicit port is kept.
/// Accepts `https://host`, `http://host`, `//host` and `host` forms.
pub fn format_as_address(raw_url: &str) -> String {
    let (scheme, rest) = match raw_url.find("://") {
        Some(idx) => (Some(&raw_url[..idx]), &raw_url[idx + 3..]),
        None => (None, raw_url),
    };
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or_default();

    if let Ok((host, port)) = split_host_port(authority) {
        return join_host_port(&host, port);
    }

    let default_port = match scheme {
        Some(s) if s.eq_ignore_ascii_case("http") => 80,
        _ => 443,
    };
    let host = authority.trim_start_matches('[').trim_end_matches(']');
    join_host_port(host, default_port)
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(address: &str) -> Result<(String, u16)> {
    let invalid = || Error::InvalidAddress(address.to_string());

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        (host, after.strip_prefix(':').ok_or_else(invalid)?)
    } else {
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        if host.contains(':') {
            return Err(invalid());
        }
        (host, port)
    };

    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

/// Join host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Prefix `https://` unless the URL already names an http(s) scheme.
pub fn ensure_scheme(url: &str) -> String {
    if url.starts_with("https://") || url.starts_with("http://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

/// Dial address (`host:port`) of a request URI.
pub(crate) fn uri_address(uri: &Uri) -> Result<String> {
    let host = uri
        .host()
        .ok_or_else(|| Error::InvalidAddress(format!("URI missing host: {}", uri)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = uri.port_u16().unwrap_or_else(|| {
        if uri.scheme_str() == Some("http") {
            80
        } else {
            443
        }
    });
    Ok(join_host_port(host, port))
}
