// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Settix Message Contracts
//!
//! Four message kinds travel over the broker: a request to configure a
//! service, its acknowledgement, a request to remove configuration, and its
//! acknowledgement. Each kind exists in two schema versions that differ only
//! in the payload representation:
//!
//! - V1 carries a flat string-to-string map,
//! - V2 carries ordered entries with an explicit value type.
//!
//! Every `(kind, version)` pair has a stable contract id that travels in the
//! `settix-message-type` header. Bodies are JSON with PascalCase field names.
//!
//! Responses embed the request they answer and must agree with it on tenant
//! and schema version; construction fails otherwise.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const CONFIGURE_SERVICE_V1: &str = "98a96efe-9bb8-42ef-a379-26871af71a6b";
pub const CONFIGURE_SERVICE_V2: &str = "7c1d9a52-3f0e-4b8a-9d61-2e54b0c8f3a1";
pub const SERVICE_CONFIGURED_V1: &str = "01eccbdd-d287-4601-9393-c15da6049b1c";
pub const SERVICE_CONFIGURED_V2: &str = "a1940829-400f-4a70-b903-6577ec5f0e54";
pub const REMOVE_CONFIGURATION_V1: &str = "5691b049-add8-4fee-82b5-d4df05097122";
pub const REMOVE_CONFIGURATION_V2: &str = "3e8f6c27-51b4-4d0a-8c9e-a7f2d16b4e05";
pub const CONFIGURATION_REMOVED_V1: &str = "b810388b-d723-4c93-8a03-ee00af788ba2";
pub const CONFIGURATION_REMOVED_V2: &str = "d4a27e91-06c3-4f5b-b8e2-9c13f5a07d6e";

/// Errors raised while building or validating a contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("tenant `{0}` does not match the request tenant `{1}`")]
    TenantMismatch(String, String),

    #[error("schema version mismatch, expected {expected:?} found {found:?}")]
    SchemaMismatch {
        expected: SchemaVersion,
        found: SchemaVersion,
    },

    #[error("value of `{key}` is not a valid {value_type:?}")]
    InvalidValue { key: String, value_type: ValueType },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractKind {
    ConfigureService,
    ServiceConfigured,
    RemoveConfiguration,
    ConfigurationRemoved,
}

impl ContractKind {
    pub const ALL: [ContractKind; 4] = [
        ContractKind::ConfigureService,
        ContractKind::ServiceConfigured,
        ContractKind::RemoveConfiguration,
        ContractKind::ConfigurationRemoved,
    ];

    pub fn contract_id(self, version: SchemaVersion) -> &'static str {
        match (self, version) {
            (ContractKind::ConfigureService, SchemaVersion::V1) => CONFIGURE_SERVICE_V1,
            (ContractKind::ConfigureService, SchemaVersion::V2) => CONFIGURE_SERVICE_V2,
            (ContractKind::ServiceConfigured, SchemaVersion::V1) => SERVICE_CONFIGURED_V1,
            (ContractKind::ServiceConfigured, SchemaVersion::V2) => SERVICE_CONFIGURED_V2,
            (ContractKind::RemoveConfiguration, SchemaVersion::V1) => REMOVE_CONFIGURATION_V1,
            (ContractKind::RemoveConfiguration, SchemaVersion::V2) => REMOVE_CONFIGURATION_V2,
            (ContractKind::ConfigurationRemoved, SchemaVersion::V1) => CONFIGURATION_REMOVED_V1,
            (ContractKind::ConfigurationRemoved, SchemaVersion::V2) => CONFIGURATION_REMOVED_V2,
        }
    }

    pub fn from_contract_id(id: &str) -> Option<(ContractKind, SchemaVersion)> {
        ContractKind::ALL.into_iter().find_map(|kind| {
            [SchemaVersion::V1, SchemaVersion::V2]
                .into_iter()
                .find(|version| kind.contract_id(*version) == id)
                .map(|version| (kind, version))
        })
    }
}

/// Explicit type of a V2 configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    String,
    Integer,
    Decimal,
    Boolean,
    DateTime,
    Json,
}

/// One typed key/value pair of a V2 payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigurationEntry {
    key: String,
    value: String,
    #[serde(rename = "Type")]
    value_type: ValueType,
}

impl ConfigurationEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>, value_type: ValueType) -> Self {
        ConfigurationEntry {
            key: key.into(),
            value: value.into(),
            value_type,
        }
    }

    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, value, ValueType::String)
    }

    pub fn integer(key: impl Into<String>, value: i64) -> Self {
        Self::new(key, value.to_string(), ValueType::Integer)
    }

    pub fn decimal(key: impl Into<String>, value: f64) -> Self {
        Self::new(key, value.to_string(), ValueType::Decimal)
    }

    pub fn boolean(key: impl Into<String>, value: bool) -> Self {
        Self::new(key, value.to_string(), ValueType::Boolean)
    }

    pub fn date_time(key: impl Into<String>, value: DateTime<Utc>) -> Self {
        Self::new(key, value.to_rfc3339(), ValueType::DateTime)
    }

    pub fn json(key: impl Into<String>, value: &serde_json::Value) -> Self {
        Self::new(key, value.to_string(), ValueType::Json)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Checks that the raw value parses as its declared type.
    pub fn validate(&self) -> Result<(), ContractError> {
        let valid = match self.value_type {
            ValueType::String => true,
            ValueType::Integer => self.value.parse::<i64>().is_ok(),
            ValueType::Decimal => self.value.parse::<f64>().is_ok(),
            ValueType::Boolean => self.value.parse::<bool>().is_ok(),
            ValueType::DateTime => DateTime::parse_from_rfc3339(&self.value).is_ok(),
            ValueType::Json => serde_json::from_str::<serde_json::Value>(&self.value).is_ok(),
        };

        if valid {
            Ok(())
        } else {
            Err(ContractError::InvalidValue {
                key: self.key.clone(),
                value_type: self.value_type,
            })
        }
    }
}

/// Payload of a contract; the variant is its schema version.
///
/// V1 serializes as a JSON object, V2 as a JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigurationData {
    V1(BTreeMap<String, String>),
    V2(Vec<ConfigurationEntry>),
}

impl Default for ConfigurationData {
    fn default() -> Self {
        ConfigurationData::V1(BTreeMap::new())
    }
}

impl ConfigurationData {
    pub fn v1<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        ConfigurationData::V1(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn v2(entries: impl IntoIterator<Item = ConfigurationEntry>) -> Self {
        ConfigurationData::V2(entries.into_iter().collect())
    }

    /// An empty payload of the given version.
    pub fn empty(version: SchemaVersion) -> Self {
        match version {
            SchemaVersion::V1 => ConfigurationData::V1(BTreeMap::new()),
            SchemaVersion::V2 => ConfigurationData::V2(vec![]),
        }
    }

    pub fn schema_version(&self) -> SchemaVersion {
        match self {
            ConfigurationData::V1(_) => SchemaVersion::V1,
            ConfigurationData::V2(_) => SchemaVersion::V2,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ConfigurationData::V1(map) => map.len(),
            ConfigurationData::V2(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw value for `key`; for V2 the first matching entry wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            ConfigurationData::V1(map) => map.get(key).map(String::as_str),
            ConfigurationData::V2(entries) => entries
                .iter()
                .find(|entry| entry.key == key)
                .map(|entry| entry.value.as_str()),
        }
    }

    /// An empty payload fits any version, otherwise the variant must match.
    pub fn ensure_version(&self, expected: SchemaVersion) -> Result<(), ContractError> {
        let found = self.schema_version();
        if self.is_empty() || found == expected {
            Ok(())
        } else {
            Err(ContractError::SchemaMismatch { expected, found })
        }
    }

    /// Gives an empty payload the shape of `version`; non-empty payloads
    /// already carry theirs.
    pub(crate) fn align(&mut self, version: SchemaVersion) {
        if self.is_empty() {
            *self = ConfigurationData::empty(version);
        }
    }

    fn validate(&self) -> Result<(), ContractError> {
        match self {
            ConfigurationData::V1(_) => Ok(()),
            ConfigurationData::V2(entries) => {
                entries.iter().try_for_each(ConfigurationEntry::validate)
            }
        }
    }
}

// Null payloads are accepted and read as empty.
fn nullable_data<'de, D>(deserializer: D) -> Result<ConfigurationData, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<ConfigurationData>::deserialize(deserializer)?.unwrap_or_default())
}

/// Behaviour shared by every message that can cross the broker.
pub trait Contract: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: ContractKind;

    fn tenant(&self) -> &str;

    /// Service whose queue the message is routed to.
    fn destination_service(&self) -> &str;

    fn schema_version(&self) -> SchemaVersion;

    fn contract_id(&self) -> &'static str {
        Self::KIND.contract_id(self.schema_version())
    }

    /// Checks that the message fits the schema version named by a contract id.
    fn ensure_version(&self, expected: SchemaVersion) -> Result<(), ContractError>;

    /// Pins the schema version of empty payloads, whose JSON shape is
    /// ambiguous, so that [`contract_id`](Self::contract_id) reports `version`.
    fn align_version(&mut self, version: SchemaVersion);

    /// Re-checks the invariants enforced at construction, used after decoding.
    fn validate(&self) -> Result<(), ContractError>;
}

/// Asks a service to apply configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigureService {
    tenant: String,
    service_key_to_configure: String,
    service_key_to_reply_back: String,
    #[serde(default, deserialize_with = "nullable_data")]
    data: ConfigurationData,
    timestamp: DateTime<Utc>,
}

impl ConfigureService {
    pub fn new(
        tenant: impl Into<String>,
        service_key_to_configure: impl Into<String>,
        service_key_to_reply_back: impl Into<String>,
        data: ConfigurationData,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ContractError> {
        let request = ConfigureService {
            tenant: tenant.into(),
            service_key_to_configure: service_key_to_configure.into(),
            service_key_to_reply_back: service_key_to_reply_back.into(),
            data,
            timestamp,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn service_key_to_configure(&self) -> &str {
        &self.service_key_to_configure
    }

    pub fn service_key_to_reply_back(&self) -> &str {
        &self.service_key_to_reply_back
    }

    pub fn data(&self) -> &ConfigurationData {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Contract for ConfigureService {
    const KIND: ContractKind = ContractKind::ConfigureService;

    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn destination_service(&self) -> &str {
        &self.service_key_to_configure
    }

    fn schema_version(&self) -> SchemaVersion {
        self.data.schema_version()
    }

    fn ensure_version(&self, expected: SchemaVersion) -> Result<(), ContractError> {
        self.data.ensure_version(expected)
    }

    fn align_version(&mut self, version: SchemaVersion) {
        self.data.align(version);
    }

    fn validate(&self) -> Result<(), ContractError> {
        self.data.validate()
    }
}

/// Asks a service to drop configuration, optionally wiping its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoveConfiguration {
    tenant: String,
    service_key_to_configure: String,
    service_key_to_reply_back: String,
    #[serde(default, deserialize_with = "nullable_data")]
    data: ConfigurationData,
    should_wipe_data: bool,
    timestamp: DateTime<Utc>,
}

impl RemoveConfiguration {
    pub fn new(
        tenant: impl Into<String>,
        service_key_to_configure: impl Into<String>,
        service_key_to_reply_back: impl Into<String>,
        data: ConfigurationData,
        should_wipe_data: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ContractError> {
        let request = RemoveConfiguration {
            tenant: tenant.into(),
            service_key_to_configure: service_key_to_configure.into(),
            service_key_to_reply_back: service_key_to_reply_back.into(),
            data,
            should_wipe_data,
            timestamp,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn service_key_to_configure(&self) -> &str {
        &self.service_key_to_configure
    }

    pub fn service_key_to_reply_back(&self) -> &str {
        &self.service_key_to_reply_back
    }

    pub fn data(&self) -> &ConfigurationData {
        &self.data
    }

    pub fn should_wipe_data(&self) -> bool {
        self.should_wipe_data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Contract for RemoveConfiguration {
    const KIND: ContractKind = ContractKind::RemoveConfiguration;

    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn destination_service(&self) -> &str {
        &self.service_key_to_configure
    }

    fn schema_version(&self) -> SchemaVersion {
        self.data.schema_version()
    }

    fn ensure_version(&self, expected: SchemaVersion) -> Result<(), ContractError> {
        self.data.ensure_version(expected)
    }

    fn align_version(&mut self, version: SchemaVersion) {
        self.data.align(version);
    }

    fn validate(&self) -> Result<(), ContractError> {
        self.data.validate()
    }
}

fn ensure_matches_request(
    tenant: &str,
    data: &ConfigurationData,
    request_tenant: &str,
    request_version: SchemaVersion,
) -> Result<(), ContractError> {
    if tenant != request_tenant {
        return Err(ContractError::TenantMismatch(
            tenant.to_owned(),
            request_tenant.to_owned(),
        ));
    }
    data.ensure_version(request_version)?;
    data.validate()
}

/// Reports the outcome of a [`ConfigureService`] request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceConfigured {
    tenant: String,
    request_payload: ConfigureService,
    is_restart_required: bool,
    #[serde(default, deserialize_with = "nullable_data")]
    data: ConfigurationData,
    is_success: bool,
    timestamp: DateTime<Utc>,
}

impl ServiceConfigured {
    pub fn new(
        tenant: impl Into<String>,
        request_payload: ConfigureService,
        is_restart_required: bool,
        data: ConfigurationData,
        is_success: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ContractError> {
        let mut response = ServiceConfigured {
            tenant: tenant.into(),
            request_payload,
            is_restart_required,
            data,
            is_success,
            timestamp,
        };
        response.validate()?;
        response.data.align(response.request_payload.schema_version());
        Ok(response)
    }

    pub fn request_payload(&self) -> &ConfigureService {
        &self.request_payload
    }

    pub fn is_restart_required(&self) -> bool {
        self.is_restart_required
    }

    pub fn data(&self) -> &ConfigurationData {
        &self.data
    }

    pub fn is_success(&self) -> bool {
        self.is_success
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Contract for ServiceConfigured {
    const KIND: ContractKind = ContractKind::ServiceConfigured;

    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn destination_service(&self) -> &str {
        self.request_payload.service_key_to_reply_back()
    }

    fn schema_version(&self) -> SchemaVersion {
        self.request_payload.schema_version()
    }

    fn ensure_version(&self, expected: SchemaVersion) -> Result<(), ContractError> {
        self.request_payload.ensure_version(expected)
    }

    fn align_version(&mut self, version: SchemaVersion) {
        self.request_payload.align_version(version);
        self.data.align(version);
    }

    fn validate(&self) -> Result<(), ContractError> {
        self.request_payload.validate()?;
        ensure_matches_request(
            &self.tenant,
            &self.data,
            self.request_payload.tenant(),
            self.request_payload.schema_version(),
        )
    }
}

/// Reports the outcome of a [`RemoveConfiguration`] request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigurationRemoved {
    tenant: String,
    request_payload: RemoveConfiguration,
    is_restart_required: bool,
    #[serde(default, deserialize_with = "nullable_data")]
    data: ConfigurationData,
    is_success: bool,
    timestamp: DateTime<Utc>,
}

impl ConfigurationRemoved {
    pub fn new(
        tenant: impl Into<String>,
        request_payload: RemoveConfiguration,
        is_restart_required: bool,
        data: ConfigurationData,
        is_success: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ContractError> {
        let mut response = ConfigurationRemoved {
            tenant: tenant.into(),
            request_payload,
            is_restart_required,
            data,
            is_success,
            timestamp,
        };
        response.validate()?;
        response.data.align(response.request_payload.schema_version());
        Ok(response)
    }

    pub fn request_payload(&self) -> &RemoveConfiguration {
        &self.request_payload
    }

    pub fn is_restart_required(&self) -> bool {
        self.is_restart_required
    }

    pub fn data(&self) -> &ConfigurationData {
        &self.data
    }

    pub fn is_success(&self) -> bool {
        self.is_success
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Contract for ConfigurationRemoved {
    const KIND: ContractKind = ContractKind::ConfigurationRemoved;

    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn destination_service(&self) -> &str {
        self.request_payload.service_key_to_reply_back()
    }

    fn schema_version(&self) -> SchemaVersion {
        self.request_payload.schema_version()
    }

    fn ensure_version(&self, expected: SchemaVersion) -> Result<(), ContractError> {
        self.request_payload.ensure_version(expected)
    }

    fn align_version(&mut self, version: SchemaVersion) {
        self.request_payload.align_version(version);
        self.data.align(version);
    }

    fn validate(&self) -> Result<(), ContractError> {
        self.request_payload.validate()?;
        ensure_matches_request(
            &self.tenant,
            &self.data,
            self.request_payload.tenant(),
            self.request_payload.schema_version(),
        )
    }
}
