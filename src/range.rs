//! Item pagination over HTTP `Range` / `Content-Range` headers
//!
//! Requests carry `Range: items=first-last` (or `items=first-*` for "to the
//! end"); responses answer `206 Partial Content` with
//! `Content-Range: items first-last/length`. Route options are read from a
//! [`RangeOptions`] request extension and fall back to the defaults.
//!
//! ```rust,no_run
//! use axum::{routing::get, Extension, Json, Router};
//! use pleme_graphql_presets::range::{RangeOptions, RangePagination};
//!
//! async fn list(range: RangePagination) -> impl axum::response::IntoResponse {
//!     let items: Vec<u64> = range.window(0..500).collect();
//!     range.paginate(500, Json(items))
//! }
//!
//! let app: Router = Router::new()
//!     .route("/items", get(list))
//!     .layer(Extension(RangeOptions::default()));
//! ```

use axum::{
    extract::FromRequestParts,
    http::{
        header::{ACCEPT_RANGES, CONTENT_RANGE, RANGE},
        request::Parts,
        HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use thiserror::Error;

/// Per-route range pagination settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RangeOptions {
    /// Accept open ranges (`items=10-*`)
    pub allow_all: bool,
    /// Longest page served; longer ranges are shortened
    pub maximum: u64,
    /// Expected range unit
    pub unit: String,
}

impl Default for RangeOptions {
    fn default() -> Self {
        Self {
            allow_all: true,
            maximum: 50,
            unit: "items".to_string(),
        }
    }
}

/// Range pagination failures, each mapped to its HTTP status
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("Malformed Range Error")]
    Malformed,

    #[error("Range Not Satisfiable")]
    NotSatisfiable,

    #[error("Invalid Configuration")]
    InvalidConfiguration,
}

impl RangeError {
    pub fn status(&self) -> StatusCode {
        match self {
            RangeError::Malformed => StatusCode::PRECONDITION_FAILED,
            RangeError::NotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            RangeError::InvalidConfiguration => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RangeError {
    fn into_response(self) -> Response {
        match self {
            RangeError::InvalidConfiguration => tracing::error!("range pagination: invalid maximum"),
            _ => tracing::debug!(error = %self, "range rejected"),
        }
        (self.status(), self.to_string()).into_response()
    }
}

/// Requested window of a paginated collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangePagination {
    /// First item, zero-based
    pub offset: u64,
    /// Page length; `None` for an open range
    pub limit: Option<u64>,
    /// Last item requested; `None` for `*`
    pub last: Option<u64>,
    pub unit: String,
}

impl RangePagination {
    /// Window for an optional `Range` header value
    pub fn parse(header: Option<&str>, options: &RangeOptions) -> Result<Self, RangeError> {
        if options.maximum == 0 {
            return Err(RangeError::InvalidConfiguration);
        }
        let (offset, last) = match header {
            None => (0, Some(options.maximum)),
            Some(header) => {
                let (unit, first, last) = parse_range(header)?;
                if unit != options.unit {
                    return Err(RangeError::Malformed);
                }
                if last.is_none() && !options.allow_all {
                    return Err(RangeError::NotSatisfiable);
                }
                (first, last)
            }
        };

        let (last, limit) = match last {
            Some(last) => {
                let last = if last - offset >= options.maximum {
                    offset.saturating_add(options.maximum - 1)
                } else {
                    last
                };
                (Some(last), Some(last - offset + 1))
            }
            None => (None, None),
        };

        Ok(Self {
            offset,
            limit,
            last,
            unit: options.unit.clone(),
        })
    }

    /// `Content-Range` value for a collection of `length` items
    pub fn content_range(&self, length: u64) -> Result<String, RangeError> {
        if length == 0 {
            return Ok(format!("{} */0", self.unit));
        }
        if self.offset > length - 1 {
            return Err(RangeError::NotSatisfiable);
        }
        let last = self.last.unwrap_or(length).min(length - 1);
        Ok(format!("{} {}-{}/{}", self.unit, self.offset, last, length))
    }

    /// Items of `items` that fall inside the window
    pub fn window<I: IntoIterator>(&self, items: I) -> impl Iterator<Item = I::Item> {
        let limit = self.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        items.into_iter().skip(self.offset as usize).take(limit)
    }

    /// Wrap a response body as one page of `length` items
    pub fn paginate<T>(self, length: u64, body: T) -> Paginated<T> {
        Paginated {
            range: self,
            length,
            body,
        }
    }
}

/// Split `unit=first-last`; an empty or `*` last means open-ended
fn parse_range(header: &str) -> Result<(&str, u64, Option<u64>), RangeError> {
    let (unit, bounds) = header.trim().split_once('=').ok_or(RangeError::Malformed)?;
    let (first, last) = bounds.trim().split_once('-').ok_or(RangeError::Malformed)?;
    let first: u64 = first.trim().parse().map_err(|_| RangeError::Malformed)?;
    let last = match last.trim() {
        "" | "*" => None,
        last => Some(last.parse::<u64>().map_err(|_| RangeError::Malformed)?),
    };
    if last.is_some_and(|last| first > last) {
        return Err(RangeError::NotSatisfiable);
    }
    Ok((unit.trim(), first, last))
}

impl<S> FromRequestParts<S> for RangePagination
where
    S: Send + Sync,
{
    type Rejection = RangeError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let options = parts.extensions.get::<RangeOptions>().cloned().unwrap_or_default();
        let header = match parts.headers.get(RANGE) {
            Some(value) => Some(value.to_str().map_err(|_| RangeError::Malformed)?),
            None => None,
        };
        Self::parse(header, &options)
    }
}

/// A partial-content response
pub struct Paginated<T> {
    range: RangePagination,
    length: u64,
    body: T,
}

impl<T: IntoResponse> IntoResponse for Paginated<T> {
    fn into_response(self) -> Response {
        let content_range = match self.range.content_range(self.length) {
            Ok(value) => value,
            Err(error) => return error.into_response(),
        };
        let (Ok(accept), Ok(content_range)) = (
            HeaderValue::from_str(&self.range.unit),
            HeaderValue::from_str(&content_range),
        ) else {
            return RangeError::InvalidConfiguration.into_response();
        };

        (
            StatusCode::PARTIAL_CONTENT,
            [(ACCEPT_RANGES, accept), (CONTENT_RANGE, content_range)],
            self.body,
        )
            .into_response()
    }
}
