// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dimension sets keying the pre-aggregated counters.

use std::collections::BTreeMap;

use tracing::warn;

/// Counters are bucketed by at most this many dimensions.
pub const MAX_DIMENSIONS: usize = 6;

pub const REQUEST_SUCCESS: &str = "Request.Success";
pub const REQUEST_RESULT_CODE: &str = "request/resultCode";
pub const CLOUD_ROLE_NAME: &str = "cloud/roleName";
pub const CLOUD_ROLE_INSTANCE: &str = "cloud/roleInstance";
pub const OPERATION_SYNTHETIC: &str = "operation/synthetic";
pub const DEPENDENCY_TYPE: &str = "Dependency.Type";
pub const DEPENDENCY_SUCCESS: &str = "Dependency.Success";
pub const DEPENDENCY_TARGET: &str = "dependency/target";
pub const DEPENDENCY_RESULT_CODE: &str = "dependency/resultCode";
pub const TRACE_SEVERITY_LEVEL: &str = "trace/severityLevel";

/// An unordered set of named string attributes.
///
/// Backed by a sorted map, so two sets built from the same pairs in any order
/// compare and hash equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimensionSet(BTreeMap<String, String>);

impl DimensionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dimension. Returns `false` when the set is already full and
    /// `name` is new.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let name = name.into();
        if self.0.len() >= MAX_DIMENSIONS && !self.0.contains_key(&name) {
            warn!("Dimension {name:?} ignored, at most {MAX_DIMENSIONS} dimensions are kept");
            return false;
        }
        self.0.insert(name, value.into());
        true
    }

    fn insert_opt(&mut self, name: &str, value: Option<&String>) {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            self.insert(name, value.as_str());
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DimensionSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (name, value) in iter {
            set.insert(name, value);
        }
        set
    }
}

fn bool_value(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

#[derive(Clone, Debug, Default)]
pub struct RequestDimensions {
    pub success: bool,
    pub result_code: String,
    pub cloud_role_name: Option<String>,
    pub cloud_role_instance: Option<String>,
    pub synthetic: bool,
}

impl From<RequestDimensions> for DimensionSet {
    fn from(dims: RequestDimensions) -> Self {
        let mut set = DimensionSet::new();
        set.insert(REQUEST_SUCCESS, bool_value(dims.success));
        set.insert(REQUEST_RESULT_CODE, dims.result_code);
        set.insert_opt(CLOUD_ROLE_NAME, dims.cloud_role_name.as_ref());
        set.insert_opt(CLOUD_ROLE_INSTANCE, dims.cloud_role_instance.as_ref());
        set.insert(OPERATION_SYNTHETIC, bool_value(dims.synthetic));
        set
    }
}

#[derive(Clone, Debug, Default)]
pub struct DependencyDimensions {
    pub dependency_type: String,
    pub success: bool,
    pub target: String,
    pub result_code: String,
    pub cloud_role_name: Option<String>,
    pub cloud_role_instance: Option<String>,
}

impl From<DependencyDimensions> for DimensionSet {
    fn from(dims: DependencyDimensions) -> Self {
        let mut set = DimensionSet::new();
        set.insert(DEPENDENCY_TYPE, dims.dependency_type);
        set.insert(DEPENDENCY_SUCCESS, bool_value(dims.success));
        set.insert(DEPENDENCY_TARGET, dims.target);
        set.insert(DEPENDENCY_RESULT_CODE, dims.result_code);
        set.insert_opt(CLOUD_ROLE_NAME, dims.cloud_role_name.as_ref());
        set.insert_opt(CLOUD_ROLE_INSTANCE, dims.cloud_role_instance.as_ref());
        set
    }
}

/// Dimensions of exceptions and traces; traces also carry their severity.
#[derive(Clone, Debug, Default)]
pub struct CommonDimensions {
    pub cloud_role_name: Option<String>,
    pub cloud_role_instance: Option<String>,
    pub severity_level: Option<String>,
}

impl From<CommonDimensions> for DimensionSet {
    fn from(dims: CommonDimensions) -> Self {
        let mut set = DimensionSet::new();
        set.insert_opt(CLOUD_ROLE_NAME, dims.cloud_role_name.as_ref());
        set.insert_opt(CLOUD_ROLE_INSTANCE, dims.cloud_role_instance.as_ref());
        set.insert_opt(TRACE_SEVERITY_LEVEL, dims.severity_level.as_ref());
        set
    }
}
