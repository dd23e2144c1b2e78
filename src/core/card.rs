//! Card records and their variant metadata
//!
//! A card is an immutable, versioned description of one ML artifact. The
//! shared envelope (uid, family, version, tags, storage path) lives on
//! [`Card`]; everything specific to datasets, models, runs or pipelines is
//! in [`CardMetadata`].

use crate::codec::{Artifact, ArtifactKind};
use crate::error::{RegistryError, Result};
use crate::validation::validate_tag_key;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardKind {
    Data,
    Model,
    Run,
    Pipeline,
}

impl CardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardKind::Data => "data",
            CardKind::Model => "model",
            CardKind::Run => "run",
            CardKind::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for CardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "data" => Ok(CardKind::Data),
            "model" => Ok(CardKind::Model),
            "run" => Ok(CardKind::Run),
            "pipeline" => Ok(CardKind::Pipeline),
            other => Err(RegistryError::Validation(format!(
                "unknown card kind '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle state of a committed card
///
/// Status is the only column that changes after commit. It never affects
/// version numbering or storage paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Active,
    Promoted,
    Deprecated,
    /// Soft-deleted: hidden from listings, still loadable by uid
    Deleted,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Active => "active",
            CardStatus::Promoted => "promoted",
            CardStatus::Deprecated => "deprecated",
            CardStatus::Deleted => "deleted",
        }
    }

    /// Whether listings show the card by default
    pub fn is_visible(&self) -> bool {
        !matches!(self, CardStatus::Deleted)
    }

    /// Allowed status changes
    pub fn can_transition_to(&self, next: CardStatus) -> bool {
        use CardStatus::*;
        match (self, next) {
            (Deleted, _) => false,
            (Active, Promoted) | (Active, Deprecated) | (Active, Deleted) => true,
            (Promoted, Deprecated) | (Promoted, Deleted) => true,
            (Deprecated, Deleted) => true,
            _ => false,
        }
    }
}

impl FromStr for CardStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(CardStatus::Active),
            "promoted" => Ok(CardStatus::Promoted),
            "deprecated" => Ok(CardStatus::Deprecated),
            "deleted" => Ok(CardStatus::Deleted),
            other => Err(RegistryError::Conflict(format!(
                "unknown card status '{}' in tracking store",
                other
            ))),
        }
    }
}

/// One observation of a run metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    /// Unix milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataCardMetadata {
    /// Column name -> dtype ("int64", "float64", "utf8", "bool")
    #[serde(default)]
    pub feature_map: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default)]
    pub dependent_vars: Vec<String>,
    #[serde(default)]
    pub feature_descriptions: BTreeMap<String, String>,
    #[serde(default)]
    pub additional_info: BTreeMap<String, serde_json::Value>,
    /// Query name -> SQL text
    #[serde(default)]
    pub sql_logic: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runcard_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipelinecard_uid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCardMetadata {
    /// e.g. "classifier", "regressor"
    pub model_type: String,
    #[serde(default)]
    pub framework: String,
    pub datacard_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_data_type: Option<String>,
    /// Input feature -> dtype
    #[serde(default)]
    pub input_signature: BTreeMap<String, String>,
    /// Output name -> dtype
    #[serde(default)]
    pub output_signature: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runcard_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipelinecard_uid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCardMetadata {
    #[serde(default)]
    pub datacard_uids: Vec<String>,
    #[serde(default)]
    pub modelcard_uids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipelinecard_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Vec<Metric>>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Vec<ParamValue>>,
    /// Artifact name -> external URI
    #[serde(default)]
    pub artifact_uris: BTreeMap<String, String>,
}

impl RunCardMetadata {
    pub fn log_metric(&mut self, name: impl Into<String>, value: f64, step: Option<u64>) {
        self.metrics.entry(name.into()).or_default().push(Metric {
            value,
            step,
            timestamp: Some(Utc::now().timestamp_millis()),
        });
    }

    pub fn log_parameter(&mut self, name: impl Into<String>, value: ParamValue) {
        self.parameters.entry(name.into()).or_default().push(value);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineCardMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_code_uri: Option<String>,
    #[serde(default)]
    pub datacard_uids: Vec<String>,
    #[serde(default)]
    pub modelcard_uids: Vec<String>,
    #[serde(default)]
    pub runcard_uids: Vec<String>,
}

/// Variant-specific card payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CardMetadata {
    Data(DataCardMetadata),
    Model(ModelCardMetadata),
    Run(RunCardMetadata),
    Pipeline(PipelineCardMetadata),
}

impl CardMetadata {
    pub fn kind(&self) -> CardKind {
        match self {
            CardMetadata::Data(_) => CardKind::Data,
            CardMetadata::Model(_) => CardKind::Model,
            CardMetadata::Run(_) => CardKind::Run,
            CardMetadata::Pipeline(_) => CardKind::Pipeline,
        }
    }

    /// Check the metadata on its own and against the payload it ships with
    pub fn validate(&self, payload: Option<&Artifact>) -> Result<()> {
        match self {
            CardMetadata::Data(meta) => validate_data(meta, payload),
            CardMetadata::Model(meta) => validate_model(meta, payload),
            CardMetadata::Run(meta) => validate_run(meta),
            CardMetadata::Pipeline(meta) => validate_pipeline(meta),
        }
    }

    /// Uids of other cards this one points at, with the referencing field
    pub fn references(&self) -> Vec<(&'static str, &str)> {
        let mut refs = Vec::new();
        match self {
            CardMetadata::Data(meta) => {
                push_opt(&mut refs, "runcard_uid", &meta.runcard_uid);
                push_opt(&mut refs, "pipelinecard_uid", &meta.pipelinecard_uid);
            }
            CardMetadata::Model(meta) => {
                refs.push(("datacard_uid", meta.datacard_uid.as_str()));
                push_opt(&mut refs, "runcard_uid", &meta.runcard_uid);
                push_opt(&mut refs, "pipelinecard_uid", &meta.pipelinecard_uid);
            }
            CardMetadata::Run(meta) => {
                refs.extend(meta.datacard_uids.iter().map(|u| ("datacard_uids", u.as_str())));
                refs.extend(meta.modelcard_uids.iter().map(|u| ("modelcard_uids", u.as_str())));
                push_opt(&mut refs, "pipelinecard_uid", &meta.pipelinecard_uid);
            }
            CardMetadata::Pipeline(meta) => {
                refs.extend(meta.datacard_uids.iter().map(|u| ("datacard_uids", u.as_str())));
                refs.extend(meta.modelcard_uids.iter().map(|u| ("modelcard_uids", u.as_str())));
                refs.extend(meta.runcard_uids.iter().map(|u| ("runcard_uids", u.as_str())));
            }
        }
        refs
    }

    /// Payload persisted when the caller supplies none: the card document
    pub fn default_payload(&self) -> Result<Artifact> {
        Ok(Artifact::Metadata(serde_json::to_value(self)?))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn push_opt<'a>(refs: &mut Vec<(&'static str, &'a str)>, field: &'static str, uid: &'a Option<String>) {
    if let Some(uid) = uid {
        refs.push((field, uid.as_str()));
    }
}

fn invalid(msg: String) -> RegistryError {
    RegistryError::Validation(msg)
}

fn validate_data(meta: &DataCardMetadata, payload: Option<&Artifact>) -> Result<()> {
    let declared = !meta.feature_map.is_empty();

    if declared {
        for (feature, dtype) in &meta.feature_map {
            if !is_known_dtype(dtype) {
                return Err(invalid(format!(
                    "feature '{}' has unknown dtype '{}'",
                    feature, dtype
                )));
            }
        }
        for var in &meta.dependent_vars {
            if !meta.feature_map.contains_key(var) {
                return Err(invalid(format!(
                    "dependent var '{}' is not in the feature map",
                    var
                )));
            }
        }
        for feature in meta.feature_descriptions.keys() {
            if !meta.feature_map.contains_key(feature) {
                return Err(invalid(format!(
                    "feature description for unknown feature '{}'",
                    feature
                )));
            }
        }
    }

    for (name, sql) in &meta.sql_logic {
        if name.trim().is_empty() || sql.trim().is_empty() {
            return Err(invalid("sql_logic entries need a name and a query".to_string()));
        }
    }

    match payload {
        None | Some(Artifact::Metadata(_)) => Ok(()),
        Some(Artifact::Tabular(table)) => {
            if !declared {
                return Ok(());
            }
            if table.num_columns() != meta.feature_map.len() {
                return Err(invalid(format!(
                    "table has {} columns, feature map declares {}",
                    table.num_columns(),
                    meta.feature_map.len()
                )));
            }
            for (feature, dtype) in &meta.feature_map {
                let column = table.column(feature).ok_or_else(|| {
                    invalid(format!("feature '{}' missing from table", feature))
                })?;
                if column.data.dtype() != dtype {
                    return Err(invalid(format!(
                        "feature '{}' declared {} but column holds {}",
                        feature,
                        dtype,
                        column.data.dtype()
                    )));
                }
            }
            Ok(())
        }
        Some(other) => Err(invalid(format!(
            "data cards carry tabular or metadata payloads, got {}",
            other.kind()
        ))),
    }
}

fn validate_model(meta: &ModelCardMetadata, payload: Option<&Artifact>) -> Result<()> {
    if meta.model_type.trim().is_empty() {
        return Err(invalid("model cards need a model_type".to_string()));
    }
    if meta.datacard_uid.trim().is_empty() {
        return Err(invalid("model cards need a datacard_uid".to_string()));
    }

    match payload {
        Some(Artifact::Model(blob)) => {
            if blob.bytes.is_empty() {
                return Err(invalid("model blob is empty".to_string()));
            }
            if !meta.framework.is_empty() && blob.framework != meta.framework {
                return Err(invalid(format!(
                    "model blob framework '{}' does not match card framework '{}'",
                    blob.framework, meta.framework
                )));
            }
            Ok(())
        }
        Some(other) => Err(invalid(format!(
            "model cards carry a model payload, got {}",
            other.kind()
        ))),
        None => Err(invalid("model cards need a model payload".to_string())),
    }
}

fn validate_run(meta: &RunCardMetadata) -> Result<()> {
    for (name, series) in &meta.metrics {
        if name.trim().is_empty() {
            return Err(invalid("metric names cannot be empty".to_string()));
        }
        if let Some(bad) = series.iter().find(|m| !m.value.is_finite()) {
            return Err(invalid(format!(
                "metric '{}' has non-finite value {}",
                name, bad.value
            )));
        }
    }
    for (name, values) in &meta.parameters {
        if name.trim().is_empty() {
            return Err(invalid("parameter names cannot be empty".to_string()));
        }
        // JSON has no NaN or infinity, so these would not load back
        let non_finite = values.iter().find_map(|value| match value {
            ParamValue::Float(f) if !f.is_finite() => Some(*f),
            _ => None,
        });
        if let Some(bad) = non_finite {
            return Err(invalid(format!(
                "parameter '{}' has non-finite value {}",
                name, bad
            )));
        }
    }
    Ok(())
}

fn validate_pipeline(meta: &PipelineCardMetadata) -> Result<()> {
    if let Some(uri) = &meta.pipeline_code_uri {
        if uri.trim().is_empty() {
            return Err(invalid("pipeline_code_uri cannot be blank".to_string()));
        }
    }
    Ok(())
}

/// A card as submitted for registration
#[derive(Debug, Clone, PartialEq)]
pub struct NewCard {
    pub name: String,
    pub team: String,
    pub tags: Tags,
    pub metadata: CardMetadata,
    pub payload: Option<Artifact>,
}

impl NewCard {
    pub fn new(team: impl Into<String>, name: impl Into<String>, metadata: CardMetadata) -> Self {
        NewCard {
            name: name.into(),
            team: team.into(),
            tags: Tags::new(),
            metadata,
            payload: None,
        }
    }

    pub fn data(team: impl Into<String>, name: impl Into<String>, meta: DataCardMetadata) -> Self {
        Self::new(team, name, CardMetadata::Data(meta))
    }

    pub fn model(team: impl Into<String>, name: impl Into<String>, meta: ModelCardMetadata) -> Self {
        Self::new(team, name, CardMetadata::Model(meta))
    }

    pub fn run(team: impl Into<String>, name: impl Into<String>, meta: RunCardMetadata) -> Self {
        Self::new(team, name, CardMetadata::Run(meta))
    }

    pub fn pipeline(
        team: impl Into<String>,
        name: impl Into<String>,
        meta: PipelineCardMetadata,
    ) -> Self {
        Self::new(team, name, CardMetadata::Pipeline(meta))
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: Artifact) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn kind(&self) -> CardKind {
        self.metadata.kind()
    }

    /// Field-level checks that need no registry state
    pub fn validate(&self) -> Result<()> {
        for key in self.tags.keys() {
            validate_tag_key(key)?;
        }
        self.metadata.validate(self.payload.as_ref())
    }
}

/// Table data expected by a feature map, handy when building data cards
pub fn feature_map_of(table: &crate::codec::Table) -> BTreeMap<String, String> {
    table
        .columns()
        .iter()
        .map(|c| (c.name.clone(), c.data.dtype().to_string()))
        .collect()
}

/// What `register` hands back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredCard {
    pub uid: String,
    pub kind: CardKind,
    pub team: String,
    pub name: String,
    pub version: Version,
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
}

/// A committed card as stored in the tracking store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub uid: String,
    pub kind: CardKind,
    pub team: String,
    pub name: String,
    pub version: Version,
    pub tags: Tags,
    pub created_at: DateTime<Utc>,
    pub storage_path: String,
    pub artifact_kind: ArtifactKind,
    pub status: CardStatus,
    pub metadata: CardMetadata,
}

impl Card {
    pub fn family(&self) -> String {
        format!("{}/{}", self.team, self.name)
    }

    pub fn is_prerelease(&self) -> bool {
        !self.version.pre.is_empty()
    }

    pub fn summary(&self) -> RegisteredCard {
        RegisteredCard {
            uid: self.uid.clone(),
            kind: self.kind,
            team: self.team.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            storage_path: self.storage_path.clone(),
            created_at: self.created_at,
        }
    }
}

/// Whether a column type name is one the codec produces
pub fn is_known_dtype(dtype: &str) -> bool {
    matches!(dtype, "int64" | "float64" | "utf8" | "bool")
}
