// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-format timestamps.
//!
//! All timestamps on the wire are ISO-8601 UTC with millisecond precision
//! and a trailing `Z`, e.g. `2025-08-10T14:30:15.123Z`.

use chrono::{DateTime, SecondsFormat, Utc};

/// Returns the current UTC time.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Formats a UTC time in the wire format.
#[must_use]
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Returns the current UTC time already formatted for the wire.
#[must_use]
pub fn now_timestamp() -> String {
    format_timestamp(now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn format_has_millis_and_z_suffix() {
        let instant = Utc.with_ymd_and_hms(2025, 8, 10, 14, 30, 15).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(format_timestamp(instant), "2025-08-10T14:30:15.123Z");
    }

    #[test]
    fn format_pads_to_three_digits() {
        let instant = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_timestamp(instant), "2025-01-02T03:04:05.000Z");
    }

    #[test]
    fn now_timestamp_parses_back() {
        let ts = now_timestamp();
        let parsed = DateTime::parse_from_rfc3339(&ts).unwrap();
        assert_eq!(parsed.timezone().utc_minus_local(), 0);
    }
}
