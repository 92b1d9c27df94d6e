//! HTTP handlers, one module per resource.

pub mod carts;
pub mod catalog;
pub mod deliveries;
pub mod health;
pub mod metrics;
pub mod orders;
pub mod payments;
pub mod shipments;

use std::str::FromStr;

use crate::error::ApiError;

/// Parses a path identifier, answering 400 on malformed input.
pub(crate) fn parse_id<T>(raw: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))
}
