//! Pipeline configuration.
//!
//! Every field has a default, so an empty file (or none) is valid. Values
//! are layered: defaults, then the optional file, then `CONSOLIDATE_*`
//! environment variables (`__` separates nested keys).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{IdentityMatcher, NameNormalizer, NormalizeMode, DEFAULT_STOPWORDS};
use crate::reconcile::{FieldReconciler, LocationResolver, SourcePriority, UnverifiedPolicy};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings shared by every pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Name folding used for grouping
    pub name_mode: NormalizeMode,
    /// Words dropped in deep mode
    pub stopwords: Vec<String>,
    /// Split same-name groups whose birth dates disagree
    pub split_on_birth_date: bool,
    /// Jaro-Winkler threshold for the near-match review list
    pub near_match_threshold: Option<f64>,
    /// Which side wins field conflicts against the feed
    pub source_priority: SourcePriority,
    /// Local values the feed does not corroborate
    pub unverified_policy: UnverifiedPolicy,
    /// Units committed per transaction
    pub batch_size: usize,
    /// Patient ids shorter than this are reported
    pub min_patient_id_len: usize,
    /// Opaque clinic id → display name
    pub clinic_names: BTreeMap<String, String>,
    /// Location spelling → canonical location
    pub location_aliases: BTreeMap<String, String>,
    /// Storage prefix for feed images listed by uuid only
    pub image_base_url: Option<String>,
    /// Name recorded in the audit trail
    pub actor: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name_mode: NormalizeMode::Deep,
            stopwords: DEFAULT_STOPWORDS.iter().map(|s| s.to_string()).collect(),
            split_on_birth_date: true,
            near_match_threshold: Some(0.94),
            source_priority: SourcePriority::Incoming,
            unverified_policy: UnverifiedPolicy::Keep,
            batch_size: 100,
            min_patient_id_len: 12,
            clinic_names: BTreeMap::new(),
            location_aliases: BTreeMap::new(),
            image_base_url: None,
            actor: "consolidate".into(),
        }
    }
}

impl PipelineConfig {
    /// Load from an optional file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Load with an explicit environment map instead of the process one.
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("CONSOLIDATE")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("stopwords")
                .try_parsing(true)
                .source(env),
        );

        let config: PipelineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if let Some(t) = self.near_match_threshold {
            if !(t > 0.0 && t <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "near_match_threshold must be in (0, 1], got {t}"
                )));
            }
        }
        if self.actor.trim().is_empty() {
            return Err(ConfigError::Invalid("actor must not be empty".into()));
        }
        Ok(())
    }

    pub fn normalizer(&self) -> NameNormalizer {
        NameNormalizer::with_stopwords(self.name_mode, &self.stopwords)
    }

    pub fn matcher(&self) -> IdentityMatcher {
        IdentityMatcher::new(self.normalizer())
            .split_on_birth_date(self.split_on_birth_date)
            .near_match_threshold(self.near_match_threshold)
    }

    pub fn reconciler(&self) -> FieldReconciler {
        FieldReconciler::new(self.source_priority, self.unverified_policy)
    }

    pub fn location_resolver(&self) -> LocationResolver {
        LocationResolver::new(&self.clinic_names, &self.location_aliases)
    }
}
