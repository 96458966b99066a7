// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Legacy hierarchical request ids.
//!
//! A legacy id looks like `|<root>.<segment>.<segment>_` where each hop appends
//! a suffix to its caller's id. The suffix is a process-wide hex counter
//! followed by `_`, so child ids generated by one process are unique and sort
//! in creation order under their shared root. Ids that would grow past
//! [`REQUEST_ID_MAX_LENGTH`] are cut at a segment boundary and closed with a
//! random suffix and `#`.

use std::sync::atomic::{AtomicU32, Ordering};

use lazy_static::lazy_static;
use uuid::Uuid;

use crate::constants::REQUEST_ID_MAX_LENGTH;
use crate::util::new_trace_id;

lazy_static! {
    static ref CURRENT_ROOT_ID: AtomicU32 = AtomicU32::new(random_u32());
}

fn random_u32() -> u32 {
    // low 32 bits of a v4 uuid are fully random
    #[allow(clippy::cast_possible_truncation)]
    let value = Uuid::new_v4().as_u128() as u32;
    value
}

/// A fresh root id, `|<32 hex>.`.
#[must_use]
pub fn new_root_id() -> String {
    format!("|{}.", new_trace_id())
}

/// The operation root of a legacy id: the text between the optional leading `|`
/// and the first `.`.
///
/// ```
/// use appinsights_core::trace_context::request_id::root_id;
///
/// assert_eq!(root_id("|abc.1_2_"), "abc");
/// assert_eq!(root_id("abc"), "abc");
/// ```
#[must_use]
pub fn root_id(id: &str) -> &str {
    let id = id.strip_prefix('|').unwrap_or(id);
    match id.find('.') {
        Some(end) => &id[..end],
        None => id,
    }
}

/// Derives a child id from `parent`, or a fresh root id when there is no parent.
#[must_use]
pub fn generate_request_id(parent: Option<&str>) -> String {
    let Some(parent) = parent.filter(|p| !p.is_empty()) else {
        return new_root_id();
    };

    let mut parent = if parent.starts_with('|') {
        parent.to_string()
    } else {
        format!("|{parent}")
    };
    if !parent.ends_with('.') {
        parent.push('.');
    }

    let suffix = format!("{:x}", CURRENT_ROOT_ID.fetch_add(1, Ordering::Relaxed));
    append_suffix(&parent, &suffix, '_')
}

fn append_suffix(parent: &str, suffix: &str, delimiter: char) -> String {
    if parent.len() + suffix.len() < REQUEST_ID_MAX_LENGTH {
        return format!("{parent}{suffix}{delimiter}");
    }

    // room for 8 hex chars plus the overflow marker
    let mut trim_position = REQUEST_ID_MAX_LENGTH - 9;
    if parent.len() > trim_position {
        let bytes = parent.as_bytes();
        while trim_position > 1 {
            let c = bytes[trim_position - 1];
            if c == b'.' || c == b'_' {
                break;
            }
            trim_position -= 1;
        }
    }

    if trim_position <= 1 {
        return new_root_id();
    }

    let kept = parent.get(..trim_position).unwrap_or(parent);
    format!("{kept}{:08x}#", random_u32())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_of_hierarchical_and_bare_ids() {
        assert_eq!(
            root_id("|4bf92f3577b34da6a3ce929d0e0e4736.00f067aa0ba902b7."),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
        assert_eq!(root_id("|root.a_b_"), "root");
        assert_eq!(root_id("bare-token"), "bare-token");
        assert_eq!(root_id(""), "");
    }

    #[test]
    fn child_ids_share_root_and_are_unique() {
        let first = generate_request_id(Some("|root.parent."));
        let second = generate_request_id(Some("|root.parent."));

        assert!(first.starts_with("|root.parent."));
        assert!(first.ends_with('_'));
        assert_ne!(first, second);
        assert_eq!(root_id(&first), "root");
        assert_eq!(root_id(&second), "root");
    }

    #[test]
    fn bare_parent_is_normalized() {
        let child = generate_request_id(Some("abc"));
        assert!(child.starts_with("|abc."));
        assert_eq!(root_id(&child), "abc");
    }

    #[test]
    fn missing_parent_yields_root() {
        let id = generate_request_id(None);
        assert!(id.starts_with('|'));
        assert!(id.ends_with('.'));
        assert_eq!(root_id(&id).len(), 32);

        let id = generate_request_id(Some(""));
        assert_eq!(root_id(&id).len(), 32);
    }

    #[test]
    fn overlong_ids_are_truncated_at_a_segment() {
        let parent = format!("|root.{}", "a_".repeat(600));
        let child = generate_request_id(Some(&parent));

        assert!(child.len() <= REQUEST_ID_MAX_LENGTH);
        assert!(child.ends_with('#'));
        assert!(child.starts_with("|root."));
        assert_eq!(root_id(&child), "root");
    }

    #[test]
    fn unsplittable_overlong_id_restarts_from_a_new_root() {
        let parent = format!("|{}", "x".repeat(2000));
        let child = generate_request_id(Some(&parent));

        assert_eq!(root_id(&child).len(), 32);
        assert!(child.ends_with('.'));
    }
}
