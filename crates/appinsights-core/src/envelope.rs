// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry envelope sent to the ingestion endpoint.
//!
//! Every item is wrapped in an [`Envelope`] whose `data` field is a
//! [`TelemetryData`] variant. On the wire the variant becomes
//! `{"baseType": "RequestData", "baseData": {...}}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::util::format_timestamp;

pub type Properties = BTreeMap<String, String>;
pub type Measurements = BTreeMap<String, f64>;

/// Context tag keys.
pub mod tags {
    pub const OPERATION_ID: &str = "ai.operation.id";
    pub const OPERATION_PARENT_ID: &str = "ai.operation.parentId";
    pub const OPERATION_NAME: &str = "ai.operation.name";
    pub const OPERATION_SYNTHETIC_SOURCE: &str = "ai.operation.syntheticSource";
    pub const LOCATION_IP: &str = "ai.location.ip";
    pub const USER_ID: &str = "ai.user.id";
    pub const USER_AUTH_USER_ID: &str = "ai.user.authUserId";
    pub const USER_AGENT: &str = "ai.user.userAgent";
    pub const SESSION_ID: &str = "ai.session.id";
    pub const CLOUD_ROLE: &str = "ai.cloud.role";
    pub const CLOUD_ROLE_INSTANCE: &str = "ai.cloud.roleInstance";
    pub const INTERNAL_SDK_VERSION: &str = "ai.internal.sdkVersion";
    pub const LEGACY_ROOT_ID: &str = "ai_legacyRootID";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// `Microsoft.ApplicationInsights.<ikey without dashes>.<kind>`
    pub name: String,
    pub time: String,
    #[serde(rename = "iKey")]
    pub ikey: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub data: TelemetryData,
}

impl Envelope {
    #[must_use]
    pub fn new(ikey: &str, time_ms: u64, tags: BTreeMap<String, String>, data: TelemetryData) -> Self {
        Self {
            name: format!(
                "Microsoft.ApplicationInsights.{}.{}",
                ikey.replace('-', ""),
                data.kind_name()
            ),
            time: format_timestamp(time_ms),
            ikey: ikey.to_string(),
            tags,
            data,
        }
    }
}

/// The telemetry kinds the ingestion endpoint understands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "baseType", content = "baseData")]
pub enum TelemetryData {
    #[serde(rename = "RequestData")]
    Request(RequestData),
    #[serde(rename = "RemoteDependencyData")]
    Dependency(RemoteDependencyData),
    #[serde(rename = "ExceptionData")]
    Exception(ExceptionData),
    #[serde(rename = "MessageData")]
    Trace(MessageData),
    #[serde(rename = "EventData")]
    Event(EventData),
    #[serde(rename = "AvailabilityData")]
    Availability(AvailabilityData),
    #[serde(rename = "PageViewData")]
    PageView(PageViewData),
    #[serde(rename = "MetricData")]
    Metric(MetricData),
}

impl TelemetryData {
    /// Suffix of the envelope name.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            TelemetryData::Request(_) => "Request",
            TelemetryData::Dependency(_) => "RemoteDependency",
            TelemetryData::Exception(_) => "Exception",
            TelemetryData::Trace(_) => "Message",
            TelemetryData::Event(_) => "Event",
            TelemetryData::Availability(_) => "Availability",
            TelemetryData::PageView(_) => "PageView",
            TelemetryData::Metric(_) => "Metric",
        }
    }

    #[must_use]
    pub fn properties(&self) -> &Properties {
        match self {
            TelemetryData::Request(data) => &data.properties,
            TelemetryData::Dependency(data) => &data.properties,
            TelemetryData::Exception(data) => &data.properties,
            TelemetryData::Trace(data) => &data.properties,
            TelemetryData::Event(data) => &data.properties,
            TelemetryData::Availability(data) => &data.properties,
            TelemetryData::PageView(data) => &data.properties,
            TelemetryData::Metric(data) => &data.properties,
        }
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        match self {
            TelemetryData::Request(data) => &mut data.properties,
            TelemetryData::Dependency(data) => &mut data.properties,
            TelemetryData::Exception(data) => &mut data.properties,
            TelemetryData::Trace(data) => &mut data.properties,
            TelemetryData::Event(data) => &mut data.properties,
            TelemetryData::Availability(data) => &mut data.properties,
            TelemetryData::PageView(data) => &mut data.properties,
            TelemetryData::Metric(data) => &mut data.properties,
        }
    }
}

fn schema_version() -> i32 {
    2
}

/// Completion of an incoming request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    #[serde(default = "schema_version")]
    pub ver: i32,
    pub id: String,
    pub name: String,
    /// `d.hh:mm:ss.fff`
    pub duration: String,
    pub response_code: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Correlation id of the calling application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: Measurements,
}

/// Completion of an outgoing call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDependencyData {
    #[serde(default = "schema_version")]
    pub ver: i32,
    pub name: String,
    pub id: String,
    pub result_code: String,
    pub duration: String,
    pub success: bool,
    /// Full URL of the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(rename = "type")]
    pub dependency_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: Measurements,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeverityLevel {
    Verbose,
    Information,
    Warning,
    Error,
    Critical,
}

impl SeverityLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityLevel::Verbose => "Verbose",
            SeverityLevel::Information => "Information",
            SeverityLevel::Warning => "Warning",
            SeverityLevel::Error => "Error",
            SeverityLevel::Critical => "Critical",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    pub type_name: String,
    pub message: String,
    pub has_full_stack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionData {
    #[serde(default = "schema_version")]
    pub ver: i32,
    pub exceptions: Vec<ExceptionDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_level: Option<SeverityLevel>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: Measurements,
}

/// A trace (log) line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    #[serde(default = "schema_version")]
    pub ver: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_level: Option<SeverityLevel>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    #[serde(default = "schema_version")]
    pub ver: i32,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: Measurements,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityData {
    #[serde(default = "schema_version")]
    pub ver: i32,
    pub id: String,
    pub name: String,
    pub duration: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: Measurements,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageViewData {
    #[serde(default = "schema_version")]
    pub ver: i32,
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: Measurements,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataPointType {
    Measurement,
    Aggregation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    pub name: String,
    pub kind: DataPointType,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
}

impl DataPoint {
    #[must_use]
    pub fn measurement(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            kind: DataPointType::Measurement,
            value,
            count: None,
            min: None,
            max: None,
            std_dev: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricData {
    #[serde(default = "schema_version")]
    pub ver: i32,
    pub metrics: Vec<DataPoint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
}

impl MetricData {
    #[must_use]
    pub fn single(point: DataPoint, properties: Properties) -> Self {
        Self {
            ver: schema_version(),
            metrics: vec![point],
            properties,
        }
    }
}
