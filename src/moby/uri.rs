//! Versioned request URIs for the daemon API.

use hyper::Uri as HyperUri;
use log::trace;
use serde::ser::Serialize;

use super::{ClientType, ClientVersion};
use crate::errors::Error;

/// Build the request URI for an API `path` against `client_addr`, encoding
/// `query` and prefixing the negotiated API version.
pub(crate) fn parse<O>(
    client_addr: &str,
    client_type: ClientType,
    path: &str,
    query: Option<O>,
    client_version: &ClientVersion,
) -> Result<HyperUri, Error>
where
    O: Serialize,
{
    let query_string = match query {
        Some(query) => {
            let encoded = serde_urlencoded::to_string(query)?;
            if encoded.is_empty() {
                String::new()
            } else {
                format!("?{encoded}")
            }
        }
        None => String::new(),
    };
    let path_and_query = format!(
        "/v{}.{}{}{}",
        client_version.major_version, client_version.minor_version, path, query_string
    );
    trace!("request uri: {path_and_query}, client_type: {client_type:?}");

    let uri = match client_type {
        #[cfg(unix)]
        ClientType::Unix => hyperlocal::Uri::new(client_addr, &path_and_query).into(),
        ClientType::Http => format!("http://{client_addr}{path_and_query}")
            .parse()
            .map_err(|_| Error::invalid(format!("invalid daemon address {client_addr}")))?,
    };
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde_derive::Serialize)]
    struct Opts {
        force: bool,
    }

    #[test]
    fn http_uris_carry_version_and_query() {
        let uri = parse(
            "localhost:2375",
            ClientType::Http,
            "/containers/abc",
            Some(Opts { force: true }),
            &ClientVersion {
                major_version: 1,
                minor_version: 47,
            },
        )
        .unwrap();
        assert_eq!(
            uri.to_string(),
            "http://localhost:2375/v1.47/containers/abc?force=true"
        );
    }
}
