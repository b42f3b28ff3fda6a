//! Reverse-geocoding collaborator interface
//!
//! Only the query surface is defined here; the actual geocoder is an
//! external collaborator wired in at construction. When disabled, lookups
//! return [`SourceError::Unavailable`] and indexing simply skips the
//! location field.

use crate::error::{SourceError, SourceResult};

/// Narrow interface to the reverse geocoder
pub trait ReverseGeocoder: Send + Sync {
    fn available(&self) -> bool;

    /// Resolve a place name for a WGS84 coordinate
    ///
    /// Implementations format the most specific name available, falling
    /// back city -> province -> country, with the country appended in
    /// parentheses when distinct.
    fn reverse_geocode(&self, lat: f64, lon: f64) -> SourceResult<String>;
}

/// Placeholder used when `geo.reverse_geocode` is off
pub struct DisabledGeocoder;

impl ReverseGeocoder for DisabledGeocoder {
    fn available(&self) -> bool {
        false
    }

    fn reverse_geocode(&self, _lat: f64, _lon: f64) -> SourceResult<String> {
        Err(SourceError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_geocoder() {
        let geo = DisabledGeocoder;
        assert!(!geo.available());
        assert_eq!(
            geo.reverse_geocode(46.05, 14.51).unwrap_err(),
            SourceError::Unavailable
        );
    }
}
