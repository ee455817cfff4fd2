use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use data_model::{ArtifactError, ArtifactResult};

/// A single `bytes=` range as sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=A-B` or `bytes=A-`
    FromStart { start: u64, end: Option<u64> },
    /// `bytes=-N`, the last N bytes.
    Suffix(u64),
}

impl RangeSpec {
    /// Parses a `range` header value. Multiple ranges and unknown units are
    /// not supported and yield `None`.
    pub fn parse(value: &str) -> Option<RangeSpec> {
        let spec = value.trim().strip_prefix("bytes=")?.trim();
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());
        if start.is_empty() {
            return end.parse().ok().map(RangeSpec::Suffix);
        }
        let start = start.parse().ok()?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse().ok()?)
        };
        Some(RangeSpec::FromStart { start, end })
    }

    /// Inclusive byte bounds within an object of `total` bytes, the end
    /// clamped to the last byte.
    pub fn resolve(&self, total: u64) -> ArtifactResult<(u64, u64)> {
        let unsatisfiable = ArtifactError::RangeNotSatisfiable { total };
        if total == 0 {
            return Err(unsatisfiable);
        }
        match *self {
            RangeSpec::FromStart { start, end } => {
                if start >= total {
                    return Err(unsatisfiable);
                }
                let end = match end {
                    Some(end) if end < start => return Err(unsatisfiable),
                    Some(end) => end.min(total - 1),
                    None => total - 1,
                };
                Ok((start, end))
            }
            RangeSpec::Suffix(0) => Err(unsatisfiable),
            RangeSpec::Suffix(len) => Ok((total.saturating_sub(len), total - 1)),
        }
    }
}

/// Bounds requested by `headers` against an object of `total` bytes.
/// `None` means the whole object.
pub fn requested_range(headers: &HeaderMap, total: u64) -> ArtifactResult<Option<(u64, u64)>> {
    let Some(value) = headers.get(header::RANGE) else {
        return Ok(None);
    };
    let spec = value
        .to_str()
        .ok()
        .and_then(RangeSpec::parse)
        .ok_or(ArtifactError::RangeNotSatisfiable { total })?;
    spec.resolve(total).map(Some)
}

/// Byte window being served along with the object's total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServedRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
    pub partial: bool,
}

impl ServedRange {
    pub fn content_length(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            self.end + 1 - self.start
        }
    }
}

pub fn build_response(range: ServedRange, filename: &str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = if range.partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(range.content_length()));
    if range.partial {
        if let Ok(value) = HeaderValue::from_str(&format!(
            "bytes {}-{}/{}",
            range.start, range.end, range.total
        )) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
    if let Ok(value) =
        HeaderValue::from_bytes(format!("attachment; filename=\"{}\"", filename).as_bytes())
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(
            RangeSpec::parse("bytes=100-199"),
            Some(RangeSpec::FromStart {
                start: 100,
                end: Some(199)
            })
        );
        assert_eq!(
            RangeSpec::parse("bytes=5-"),
            Some(RangeSpec::FromStart {
                start: 5,
                end: None
            })
        );
        assert_eq!(RangeSpec::parse("bytes=-10"), Some(RangeSpec::Suffix(10)));
        for bad in ["bytes=0-1,5-6", "items=0-1", "bytes=a-b", "bytes=-", "0-10", "bytes=1"] {
            assert_eq!(RangeSpec::parse(bad), None, "{bad}");
        }
    }

    #[test]
    fn test_resolve() {
        let resolve = |header: &str, total| RangeSpec::parse(header).unwrap().resolve(total);
        assert_eq!(resolve("bytes=100-199", 200).unwrap(), (100, 199));
        assert_eq!(resolve("bytes=0-99", 1024).unwrap(), (0, 99));
        assert_eq!(resolve("bytes=150-999", 200).unwrap(), (150, 199));
        assert_eq!(resolve("bytes=150-", 200).unwrap(), (150, 199));
        assert_eq!(resolve("bytes=-50", 200).unwrap(), (150, 199));
        assert_eq!(resolve("bytes=-500", 200).unwrap(), (0, 199));

        for (header, total) in [
            ("bytes=200-", 200),
            ("bytes=300-400", 200),
            ("bytes=10-5", 200),
            ("bytes=-0", 200),
            ("bytes=0-", 0),
        ] {
            assert_eq!(
                resolve(header, total),
                Err(ArtifactError::RangeNotSatisfiable { total }),
                "{header}"
            );
        }
    }

    #[test]
    fn test_requested_range_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(requested_range(&headers, 10).unwrap(), None);
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=2-3"));
        assert_eq!(requested_range(&headers, 10).unwrap(), Some((2, 3)));
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=0-1,4-5"));
        assert_eq!(
            requested_range(&headers, 10),
            Err(ArtifactError::RangeNotSatisfiable { total: 10 })
        );
    }

    #[test]
    fn test_build_response_headers() {
        let response = build_response(
            ServedRange {
                start: 100,
                end: 199,
                total: 200,
                partial: true,
            },
            "artifact",
            Body::empty(),
        );
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let headers = response.headers();
        assert_eq!(headers.get(header::ACCEPT_RANGES).unwrap(), "bytes");
        assert_eq!(headers.get(header::CONTENT_RANGE).unwrap(), "bytes 100-199/200");
        assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), "100");
        assert_eq!(
            headers.get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"artifact\""
        );

        let response = build_response(
            ServedRange {
                start: 0,
                end: 0,
                total: 0,
                partial: false,
            },
            "empty",
            Body::empty(),
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "0");
    }
}
