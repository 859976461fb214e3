//! Task definitions: one unit of generation or analysis work.

use crate::task_key::{KeyComponents, generate_task_key};
use mythic_error::{BuilderError, MythicResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// What a task asks the provider to do.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::EnumString,
    derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskKind {
    /// Produce an image
    #[display("generate")]
    Generate,
    /// Produce text describing existing material
    #[display("analyze")]
    Analyze,
}

/// Entity types that own imagery.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::EnumString,
    derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntityType {
    /// A character
    #[display("character")]
    Character,
    /// A location with an overview and zones
    #[display("location")]
    Location,
    /// A chapter with per-scene image targets
    #[display("chapter")]
    Chapter,
}

impl EntityType {
    /// Directory name under the content root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            EntityType::Character => "characters",
            EntityType::Location => "locations",
            EntityType::Chapter => "chapters",
        }
    }
}

/// Why a reference image accompanies a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceRole {
    /// Character primary portrait
    #[display("portrait")]
    Portrait,
    /// Location establishing shot
    #[display("location_overview")]
    LocationOverview,
    /// Specific area within a location
    #[display("zone")]
    Zone,
    /// Story moment reference
    #[display("beat")]
    Beat,
    /// Atmospheric or tonal reference
    #[display("mood")]
    Mood,
    /// Object or item reference
    #[display("prop")]
    Prop,
    /// Art style reference
    #[display("style_ref")]
    StyleRef,
}

/// Reference image attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceImage {
    /// Local file path
    pub path: PathBuf,
    /// MIME type
    pub mime: String,
    /// SHA-256 of the file contents, hex encoded
    pub sha256: String,
    /// Role of this reference
    pub role: ReferenceRole,
    /// Whether the task is meaningless without this reference
    #[serde(default)]
    pub required: bool,
    /// Remote reference, populated once staged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_uri: Option<String>,
}

impl ReferenceImage {
    /// Create an optional, not-yet-staged reference.
    pub fn new(
        path: impl Into<PathBuf>,
        mime: impl Into<String>,
        sha256: impl Into<String>,
        role: ReferenceRole,
    ) -> Self {
        Self {
            path: path.into(),
            mime: mime.into(),
            sha256: sha256.into(),
            role,
            required: false,
            uploaded_uri: None,
        }
    }

    /// Mark this reference as mandatory for its task.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Generation parameters that influence provider output.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Aspect ratio (e.g. "16:9")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    /// Image size (e.g. "1024x1024")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// "landscape" or "portrait"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<String>,
    /// "standard" or "high"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    /// Model temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Response MIME type requested from the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
}

/// A single unit of batch work.
///
/// Tasks are immutable once built. The `key` is derived from the semantic
/// inputs by [`TaskBuilder::build`] and doubles as the provider `custom_id`.
///
/// # Examples
///
/// ```
/// use mythic_core::{EntityType, Task, TaskKind};
///
/// let task = Task::builder()
///     .kind(TaskKind::Generate)
///     .entity_type(EntityType::Location)
///     .entity_slug("shepherds-rest-inn")
///     .target_id("overview")
///     .prompt("A warm roadside inn at dusk")
///     .output_dir("/tmp/out")
///     .output_file_name("shepherds-rest-inn-overview")
///     .model("gemini-3-pro-image-preview")
///     .build()
///     .unwrap();
///
/// assert!(task.key().starts_with("location/shepherds-rest-inn/overview@"));
/// ```
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters, derive_builder::Builder,
)]
#[builder(setter(into), build_fn(private, name = "build_internal"))]
pub struct Task {
    /// Deterministic idempotency key
    #[builder(setter(skip))]
    key: String,
    /// Type of work
    kind: TaskKind,
    /// Entity type being processed
    entity_type: EntityType,
    /// Entity slug (e.g. "shepherds-rest-inn")
    entity_slug: String,
    /// Target within the entity (e.g. "overview", "taproom__hearth")
    target_id: String,
    /// Prompt text
    prompt: String,
    /// Things to avoid
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<String>,
    /// Reference images for multi-shot generation
    #[builder(default)]
    #[serde(default)]
    reference_images: Vec<ReferenceImage>,
    /// Output directory for generated files
    output_dir: PathBuf,
    /// Output file name without extension
    output_file_name: String,
    /// Model to use
    model: String,
    /// Generation parameters
    #[builder(default)]
    #[serde(default)]
    config: TaskConfig,
    /// Hash of the compiled prompt representation
    #[builder(default)]
    #[serde(default)]
    ir_hash: String,
    /// Opaque passthrough recorded with the output
    #[builder(default)]
    #[serde(default)]
    target_metadata: BTreeMap<String, JsonValue>,
}

impl TaskBuilder {
    /// Build the task and derive its key.
    ///
    /// # Errors
    ///
    /// Returns an error if a required field is missing.
    pub fn build(&self) -> MythicResult<Task> {
        let mut task = self
            .build_internal()
            .map_err(|e| BuilderError::from(e.to_string()))?;
        task.key = generate_task_key(&task.key_components());
        Ok(task)
    }
}

impl Task {
    /// Creates a new task builder.
    pub fn builder() -> TaskBuilder {
        TaskBuilder::default()
    }

    /// The semantic inputs the key is derived from.
    pub fn key_components(&self) -> KeyComponents<'_> {
        KeyComponents {
            entity_type: self.entity_type,
            entity_slug: &self.entity_slug,
            target_id: &self.target_id,
            prompt: &self.prompt,
            negative_prompt: self.negative_prompt.as_deref(),
            reference_hashes: self
                .reference_images
                .iter()
                .map(|r| r.sha256.as_str())
                .collect(),
            model: &self.model,
            config: &self.config,
        }
    }

    /// Returns the same task with its reference images replaced.
    ///
    /// Used to attach staged URIs. Content hashes are expected to be unchanged,
    /// so the key is kept.
    pub fn with_reference_images(mut self, reference_images: Vec<ReferenceImage>) -> Self {
        self.reference_images = reference_images;
        self
    }

    /// A string value from `target_metadata`, if present.
    pub fn metadata_str(&self, field: &str) -> Option<&str> {
        self.target_metadata.get(field).and_then(JsonValue::as_str)
    }

    /// Full output path for a given file extension.
    pub fn output_path(&self, extension: &str) -> PathBuf {
        Path::new(&self.output_dir).join(format!("{}.{}", self.output_file_name, extension))
    }
}
