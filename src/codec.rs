// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of DynaLease.
//
// DynaLease is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// DynaLease is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with DynaLease. If not, see <https://www.gnu.org/licenses/>.

//! Lock record codec: lock attributes to and from store items.
//!
//! Reserved attributes carry the lock protocol; everything else on a row is
//! caller-owned. Lease durations travel as compact strings (`"20s"`,
//! `"1m30s"`, `"250ms"`) so rows stay human-readable in the console.

use crate::error::{LockError, LockResult};
use crate::store::Item;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Caller payload stored with the lock.
pub(crate) const ATTR_DATA: &str = "data";
/// Client that last wrote the row.
pub(crate) const ATTR_OWNER_NAME: &str = "ownerName";
/// How long the owner claims the lease is valid, as a duration string.
pub(crate) const ATTR_LEASE_DURATION: &str = "leaseDuration";
/// Version token rewritten on every mutation; the CAS witness.
pub(crate) const ATTR_RECORD_VERSION_NUMBER: &str = "recordVersionNumber";
/// Present (set to "1") when the row was explicitly released.
pub(crate) const ATTR_IS_RELEASED: &str = "isReleased";
/// Marker value stored under [`ATTR_IS_RELEASED`].
pub(crate) const IS_RELEASED_VALUE: &str = "1";

/// A lock row pulled apart into its protocol attributes.
///
/// `additional_attributes` holds whatever was left on the row after the
/// reserved and key attributes were stripped.
#[derive(Debug)]
pub(crate) struct DecodedRow {
    pub owner_name: String,
    pub lease_duration: Duration,
    pub record_version_number: String,
    pub data: Option<Vec<u8>>,
    pub is_released: bool,
    pub additional_attributes: Item,
    /// Instant the read returned; expiry is counted from here so a decoded
    /// lease always looks older than it is on the server.
    pub lookup_time: DateTime<Utc>,
}

/// Returns the first caller attribute that collides with a reserved name.
pub(crate) fn reserved_collision(
    partition_key_name: &str,
    sort_key_name: Option<&str>,
    additional_attributes: &Item,
) -> Option<String> {
    let mut reserved = vec![
        partition_key_name,
        ATTR_OWNER_NAME,
        ATTR_LEASE_DURATION,
        ATTR_RECORD_VERSION_NUMBER,
        ATTR_DATA,
    ];
    if let Some(name) = sort_key_name {
        reserved.push(name);
    }
    reserved
        .into_iter()
        .find(|name| additional_attributes.contains_key(*name))
        .map(str::to_string)
}

/// Assemble a full lock row: merged caller attributes plus the reserved
/// protocol attributes. Key attributes are supplied by the caller.
pub(crate) fn encode_lock_row(
    key_attributes: Item,
    owner_name: &str,
    lease_duration: Duration,
    record_version_number: &str,
    data: Option<&[u8]>,
    additional_attributes: &Item,
) -> Item {
    let mut item = additional_attributes.clone();
    item.extend(key_attributes);
    item.insert(
        ATTR_OWNER_NAME.to_string(),
        AttributeValue::S(owner_name.to_string()),
    );
    item.insert(
        ATTR_LEASE_DURATION.to_string(),
        AttributeValue::S(format_duration(lease_duration)),
    );
    item.insert(
        ATTR_RECORD_VERSION_NUMBER.to_string(),
        AttributeValue::S(record_version_number.to_string()),
    );
    if let Some(bytes) = data {
        item.insert(
            ATTR_DATA.to_string(),
            AttributeValue::B(Blob::new(bytes.to_vec())),
        );
    }
    item
}

/// Pull the reserved attributes out of a row, leaving caller attributes.
///
/// `lookup_time` is stamped here, immediately after the store call returned,
/// so holders err toward treating the lease as shorter rather than longer.
pub(crate) fn decode_lock_row(
    mut item: Item,
    partition_key_name: &str,
    sort_key_name: Option<&str>,
) -> LockResult<DecodedRow> {
    let data = match item.remove(ATTR_DATA) {
        Some(AttributeValue::B(blob)) => Some(blob.into_inner()),
        _ => None,
    };
    let owner_name = take_string(&mut item, ATTR_OWNER_NAME);
    let lease_duration_raw = take_string(&mut item, ATTR_LEASE_DURATION);
    let record_version_number = take_string(&mut item, ATTR_RECORD_VERSION_NUMBER);
    let is_released = item.remove(ATTR_IS_RELEASED).is_some();
    item.remove(partition_key_name);
    if let Some(name) = sort_key_name {
        item.remove(name);
    }

    let lookup_time = Utc::now();

    let lease_duration = if lease_duration_raw.is_empty() {
        Duration::ZERO
    } else {
        parse_duration(&lease_duration_raw).map_err(|reason| LockError::LeaseParse {
            value: lease_duration_raw.clone(),
            reason,
        })?
    };

    Ok(DecodedRow {
        owner_name,
        lease_duration,
        record_version_number,
        data,
        is_released,
        additional_attributes: item,
        lookup_time,
    })
}

fn take_string(item: &mut Item, name: &str) -> String {
    match item.remove(name) {
        Some(AttributeValue::S(s)) => s,
        _ => String::new(),
    }
}

/// Render a duration in the compact wire format: `"0s"`, `"250ms"`, `"20s"`,
/// `"1m30s"`, `"2h0m5.5s"`.
pub(crate) fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let nanos = duration.subsec_nanos();
    if secs == 0 && nanos == 0 {
        return "0s".to_string();
    }
    if secs == 0 {
        return if nanos % 1_000_000 == 0 {
            format!("{}ms", nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            format!("{}us", nanos / 1_000)
        } else {
            format!("{nanos}ns")
        };
    }

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 || hours > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if nanos == 0 {
        out.push_str(&format!("{seconds}s"));
    } else {
        let frac = format!("{nanos:09}");
        out.push_str(&format!("{seconds}.{}s", frac.trim_end_matches('0')));
    }
    out
}

/// Parse the wire format back into a duration.
///
/// Accepts a sequence of `<number><unit>` terms where the unit is one of
/// `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`, with optional fractional numbers,
/// plus the bare zero `"0"`.
pub(crate) fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut rest = s;
    let mut total_secs = 0f64;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit at end of {s:?}"))?;
        if number_end == 0 {
            return Err(format!("expected a number in {s:?}"));
        }
        let value: f64 = rest[..number_end]
            .parse()
            .map_err(|_| format!("invalid number {:?}", &rest[..number_end]))?;
        rest = &rest[number_end..];

        let (unit_len, multiplier) = if rest.starts_with("ns") {
            ("ns".len(), 1e-9)
        } else if rest.starts_with("µs") {
            ("µs".len(), 1e-6)
        } else if rest.starts_with("us") {
            ("us".len(), 1e-6)
        } else if rest.starts_with("ms") {
            ("ms".len(), 1e-3)
        } else if rest.starts_with('s') {
            (1, 1.0)
        } else if rest.starts_with('m') {
            (1, 60.0)
        } else if rest.starts_with('h') {
            (1, 3600.0)
        } else {
            return Err(format!("unknown unit in {s:?}"));
        };
        rest = &rest[unit_len..];
        total_secs += value * multiplier;
    }

    if !total_secs.is_finite() || total_secs < 0.0 {
        return Err(format!("duration out of range in {s:?}"));
    }
    Ok(Duration::from_secs_f64(total_secs))
}
