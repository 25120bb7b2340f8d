use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use hyper::{Body, Request};

use super::error::ApiError;

pub fn get_query_param<'a>(
    request: &'a Request<Body>,
    param_name: &str,
) -> Result<Option<Cow<'a, str>>, ApiError> {
    let query = match request.uri().query() {
        Some(q) => q,
        None => return Ok(None),
    };
    let mut values = url::form_urlencoded::parse(query.as_bytes())
        .filter_map(|(k, v)| if k == param_name { Some(v) } else { None });

    let value1 = values.next();
    if values.next().is_some() {
        return Err(ApiError::BadRequest(anyhow!(
            "param {param_name} specified more than once"
        )));
    }

    Ok(value1)
}

pub fn parse_query_param<E: fmt::Display, T: FromStr<Err = E>>(
    request: &Request<Body>,
    param_name: &str,
) -> Result<Option<T>, ApiError> {
    get_query_param(request, param_name)?
        .map(|v| {
            v.parse::<T>().map_err(|e| {
                ApiError::BadRequest(anyhow!("cannot parse query param {param_name}: {e}"))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_uri(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn parses_present_and_absent_params() {
        let request = request_with_uri("http://localhost/export/report?rowCount=42");
        assert_eq!(
            parse_query_param::<_, i64>(&request, "rowCount").unwrap(),
            Some(42)
        );
        assert_eq!(
            parse_query_param::<_, i64>(&request, "other").unwrap(),
            None
        );
    }

    #[test]
    fn rejects_unparsable_and_repeated_params() {
        let request = request_with_uri("http://localhost/export/report?rowCount=abc");
        assert!(parse_query_param::<_, i64>(&request, "rowCount").is_err());

        let request = request_with_uri("http://localhost/export/report?rowCount=1&rowCount=2");
        assert!(parse_query_param::<_, i64>(&request, "rowCount").is_err());
    }
}
