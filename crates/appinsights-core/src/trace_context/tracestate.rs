// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! W3C `tracestate` value.
//!
//! The members are opaque and passed through as received. A header that breaks
//! the list rules (more than 32 members, a member without exactly one `=`, an
//! invalid key or a duplicated key) is discarded as a whole.

use std::collections::HashSet;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

const MAX_MEMBERS: usize = 32;

lazy_static! {
    static ref SIMPLE_KEY_REGEX: Regex =
        Regex::new(r"^ ?[a-z0-9*\-_/]{1,256}$").expect("failed creating regex");
    static ref TENANT_REGEX: Regex =
        Regex::new(r"^ ?[a-z0-9*\-_/]{1,241}$").expect("failed creating regex");
    static ref VENDOR_REGEX: Regex =
        Regex::new(r"^ ?[a-z0-9*\-_/]{1,14}$").expect("failed creating regex");
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tracestate {
    members: Vec<String>,
}

impl Tracestate {
    /// Parses a header, returning `None` when it is empty or invalid.
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let parts: Vec<&str> = header.split(',').collect();
        if parts.len() > MAX_MEMBERS {
            debug!("Discarding tracestate with {} members", parts.len());
            return None;
        }

        let mut seen = HashSet::new();
        let mut members = Vec::with_capacity(parts.len());
        for raw in parts {
            let member = raw.trim();
            if member.is_empty() {
                continue;
            }
            let pair: Vec<&str> = member.split('=').collect();
            if pair.len() != 2 || !Self::is_valid_key(pair[0]) {
                debug!("Discarding tracestate with invalid member {member:?}");
                return None;
            }
            if !seen.insert(pair[0]) {
                debug!("Discarding tracestate with duplicate key {:?}", pair[0]);
                return None;
            }
            members.push(member.to_string());
        }

        if members.is_empty() {
            None
        } else {
            Some(Self { members })
        }
    }

    fn is_valid_key(key: &str) -> bool {
        let parts: Vec<&str> = key.split('@').collect();
        match parts.as_slice() {
            [simple] => SIMPLE_KEY_REGEX.is_match(simple),
            [tenant, vendor] => {
                TENANT_REGEX.is_match(tenant.trim()) && VENDOR_REGEX.is_match(vendor.trim())
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn members(&self) -> &[String] {
        &self.members
    }
}

impl fmt::Display for Tracestate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.members.join(","))
    }
}
