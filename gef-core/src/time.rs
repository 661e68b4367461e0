//! The single GEF timestamp source.
//!
//! No other function anywhere in this crate or its dependents may mint a
//! timestamp for an envelope. The wire format is fixed and re-validated
//! by `gef_spec::Envelope::validate_schema` at every load.

use chrono::Utc;

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS.mmmZ`: millisecond precision,
/// three fractional digits, literal `Z`.
pub fn gef_timestamp() -> String {
    let now = Utc::now();
    format!(
        "{}.{:03}Z",
        now.format("%Y-%m-%dT%H:%M:%S"),
        now.timestamp_subsec_millis()
    )
}
