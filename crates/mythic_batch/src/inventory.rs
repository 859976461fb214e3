//! Image inventory entries and the upsert rules for entity documents.
//!
//! Entity documents are handled as untyped YAML so fields this crate does not
//! model survive a read-modify-write. Only the entries themselves are typed.

use chrono::Utc;
use derive_getters::Getters;
use mythic_core::{EntityType, Task};
use mythic_error::{BatchError, BatchErrorKind, MythicResult, YamlError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Sequence, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Separates zone and image slug in a location target id (`taproom__hearth`).
const ZONE_IMAGE_SEPARATOR: &str = "__";

/// Provenance source recorded for generated images.
const GENERATION_PROVIDER: &str = "google";

/// How an image came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Produced by a generation task
    #[display("generated")]
    Generated,
    /// Supplied by hand
    #[display("imported")]
    Imported,
    /// Stand-in until a real image exists
    #[display("placeholder")]
    Placeholder,
}

/// Review status of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Cleared for use
    #[display("approved")]
    Approved,
    /// Awaiting review
    #[display("draft")]
    Draft,
}

/// Descriptive content of an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
pub struct EntryContent {
    title: String,
    description: String,
    alt_text: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    suggested_filename: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

/// Where an image came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
pub struct Provenance {
    source: String,
    created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_filename: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

/// How a generated image was produced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, Getters)]
pub struct GenerationInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ir_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prompt_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    negative_prompt_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    constraints: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    provider_metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    target_metadata: BTreeMap<String, JsonValue>,
}

/// One image in an entity's inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
pub struct InventoryEntry {
    /// Stable identifier, preserved across upserts
    id: String,
    /// Path relative to the entity directory
    path: String,
    /// Origin category
    #[serde(rename = "type")]
    entry_type: EntryType,
    /// Review status
    status: EntryStatus,
    /// Descriptive content
    content: EntryContent,
    /// Origin details
    provenance: Provenance,
    /// Character image category (portrait, scene, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image_type: Option<String>,
    /// Planner slug the image was generated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prompt_spec_slug: Option<String>,
    /// Generation details for generated images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generation: Option<GenerationInfo>,
    /// Analysis fields this crate does not interpret (lighting, palette, ...)
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl InventoryEntry {
    /// Parse an analysis response into a validated entry.
    ///
    /// Accepts bare YAML or YAML wrapped in a Markdown code fence.
    ///
    /// # Errors
    ///
    /// Returns a `YamlError` if the text is not YAML and a `Validation` error
    /// if it does not describe a complete entry.
    pub fn parse_analysis(text: &str) -> MythicResult<Self> {
        let body = strip_code_fence(text);
        let value: Value = serde_yaml::from_str(body)
            .map_err(|e| YamlError::new(format!("Analysis response is not YAML: {}", e)))?;
        let entry: InventoryEntry = serde_yaml::from_value(value).map_err(|e| {
            BatchError::new(BatchErrorKind::Validation(format!(
                "Invalid analysis response: {}",
                e
            )))
        })?;
        entry.validate()?;
        Ok(entry)
    }

    /// Check the fields a usable entry cannot do without.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error naming every missing field.
    pub fn validate(&self) -> MythicResult<()> {
        let mut problems = Vec::new();
        let required = [
            ("id", self.id.as_str()),
            ("path", self.path.as_str()),
            ("content.title", self.content.title.as_str()),
            ("content.description", self.content.description.as_str()),
            ("content.alt_text", self.content.alt_text.as_str()),
            ("provenance.source", self.provenance.source.as_str()),
            ("provenance.created_at", self.provenance.created_at.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                problems.push(format!("{} is required", field));
            }
        }
        if self.content.tags.is_empty() {
            problems.push("content.tags needs at least one tag".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BatchError::new(BatchErrorKind::Validation(problems.join("; "))).into())
        }
    }

    fn to_value(&self) -> MythicResult<Value> {
        serde_yaml::to_value(self)
            .map_err(|e| YamlError::new(format!("Failed to encode inventory entry: {}", e)).into())
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (`yaml`, `yml`) on the opening fence line.
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Build the inventory entry for a freshly written image.
pub fn build_generated_entry(
    task: &Task,
    output_path: &Path,
    entity_dir: &Path,
    run_id: &str,
) -> InventoryEntry {
    let file_name = output_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let id = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| task.output_file_name().clone());
    let path = output_path
        .strip_prefix(entity_dir)
        .unwrap_or(output_path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    let image_type = task.metadata_str("image_type").map(str::to_string);
    let title = task
        .metadata_str("title")
        .or_else(|| task.metadata_str("name"))
        .unwrap_or(task.target_id().as_str())
        .to_string();
    let prompt_spec_slug = match task.entity_type() {
        EntityType::Chapter => task
            .metadata_str("custom_id")
            .or_else(|| task.metadata_str("prompt_spec_slug")),
        _ => task.metadata_str("prompt_spec_slug"),
    }
    .map(str::to_string);

    let mut tags = vec![task.target_id().clone(), "generated".to_string()];
    if let Some(image_type) = &image_type
        && !tags.contains(image_type)
    {
        tags.push(image_type.clone());
    }

    let config = task.config();
    let constraints: BTreeMap<String, String> = [
        ("aspect_ratio", &config.aspect_ratio),
        ("size", &config.size),
        ("orientation", &config.orientation),
        ("quality", &config.quality),
    ]
    .into_iter()
    .filter_map(|(k, v)| v.clone().map(|v| (k.to_string(), v)))
    .collect();

    InventoryEntry {
        id,
        path,
        entry_type: EntryType::Generated,
        status: EntryStatus::Approved,
        content: EntryContent {
            title: title.clone(),
            description: title.clone(),
            alt_text: title,
            tags,
            suggested_filename: None,
            extra: BTreeMap::new(),
        },
        provenance: Provenance {
            source: GENERATION_PROVIDER.to_string(),
            created_at: Utc::now().to_rfc3339(),
            original_filename: Some(file_name),
            extra: BTreeMap::new(),
        },
        image_type,
        prompt_spec_slug,
        generation: Some(GenerationInfo {
            target_id: Some(task.target_id().clone()),
            ir_hash: Some(task.ir_hash().clone()).filter(|h| !h.is_empty()),
            prompt_used: Some(task.prompt().clone()),
            negative_prompt_used: task.negative_prompt().clone(),
            model: Some(task.model().clone()),
            provider: Some(GENERATION_PROVIDER.to_string()),
            constraints,
            provider_metadata: BTreeMap::from([
                ("batch_run_id".to_string(), run_id.to_string()),
                ("task_key".to_string(), task.key().clone()),
            ]),
            target_metadata: task.target_metadata().clone(),
        }),
        extra: BTreeMap::new(),
    }
}

fn target_not_found(message: impl Into<String>) -> mythic_error::MythicError {
    BatchError::new(BatchErrorKind::TargetNotFound(message.into())).into()
}

fn str_field<'a>(node: &'a Value, field: &str) -> Option<&'a str> {
    node.get(field).and_then(Value::as_str)
}

/// The sequence under `field`, created empty if absent or not a sequence.
fn sequence_at<'a>(node: &'a mut Value, field: &str) -> MythicResult<&'a mut Sequence> {
    let map = node
        .as_mapping_mut()
        .ok_or_else(|| target_not_found(format!("{} parent is not a mapping", field)))?;
    let key = Value::from(field);
    if !matches!(map.get(&key), Some(Value::Sequence(_))) {
        map.insert(key.clone(), Value::Sequence(Sequence::new()));
    }
    map.get_mut(&key)
        .and_then(Value::as_sequence_mut)
        .ok_or_else(|| target_not_found(field.to_string()))
}

fn entry_matches(existing: &Value, entry: &InventoryEntry, filename: Option<&str>) -> bool {
    if str_field(existing, "id") == Some(entry.id.as_str()) {
        return true;
    }
    let Some(path) = str_field(existing, "path") else {
        return false;
    };
    if path == entry.path {
        return true;
    }
    filename.is_some_and(|f| path == format!("images/{}", f) || path.ends_with(&format!("/{}", f)))
}

/// Insert or replace an entry in an inventory sequence.
///
/// An existing entry matching by id, path, or (when given) file name is
/// replaced and keeps its original id. Otherwise the entry is appended.
/// Returns whether an existing entry was replaced.
pub fn upsert_entry(
    inventory: &mut Sequence,
    entry: &InventoryEntry,
    filename: Option<&str>,
) -> MythicResult<bool> {
    let mut value = entry.to_value()?;
    match inventory
        .iter()
        .position(|existing| entry_matches(existing, entry, filename))
    {
        Some(index) => {
            if let (Some(id), Some(map)) =
                (inventory[index].get("id").cloned(), value.as_mapping_mut())
            {
                map.insert(Value::from("id"), id);
            }
            inventory[index] = value;
            Ok(true)
        }
        None => {
            inventory.push(value);
            Ok(false)
        }
    }
}

fn zone_matches(zone: &Value, slug: &str) -> bool {
    ["slug", "zone_slug", "name", "zone_name"]
        .iter()
        .any(|field| str_field(zone, field) == Some(slug))
}

/// Merge a generated entry into a location document.
///
/// `target_id` names the overview, a zone, or a `zone__image` spec inside a
/// zone's `images` list.
///
/// # Errors
///
/// Returns `TargetNotFound` if the document has no such target.
pub fn upsert_location_entry(
    doc: &mut Value,
    target_id: &str,
    entry: &InventoryEntry,
) -> MythicResult<bool> {
    if doc.get("overview").is_none() && doc.get("zones").is_none() {
        return Err(target_not_found(format!(
            "location document has no overview or zones for {}",
            target_id
        )));
    }

    if let Some((zone_slug, image_slug)) = target_id
        .split_once(ZONE_IMAGE_SEPARATOR)
        .filter(|(z, i)| !z.is_empty() && !i.is_empty() && !i.contains(ZONE_IMAGE_SEPARATOR))
    {
        let zone = doc
            .get_mut("zones")
            .and_then(Value::as_sequence_mut)
            .and_then(|zones| zones.iter_mut().find(|z| zone_matches(z, zone_slug)))
            .ok_or_else(|| target_not_found(format!("zone {}", zone_slug)))?;
        let spec = zone
            .get_mut("images")
            .and_then(Value::as_sequence_mut)
            .and_then(|images| {
                images
                    .iter_mut()
                    .find(|img| str_field(img, "image_slug") == Some(image_slug))
            })
            .ok_or_else(|| target_not_found(format!("image spec {}/{}", zone_slug, image_slug)))?;
        return upsert_entry(sequence_at(spec, "image_inventory")?, entry, None);
    }

    let overview_slug = doc
        .get("overview")
        .and_then(|o| str_field(o, "slug"))
        .unwrap_or("overview")
        .to_string();

    let target = if target_id == "overview" || target_id == overview_slug {
        doc.get_mut("overview").filter(|o| o.is_mapping())
    } else {
        doc.get_mut("zones")
            .and_then(Value::as_sequence_mut)
            .and_then(|zones| zones.iter_mut().find(|z| zone_matches(z, target_id)))
    }
    .ok_or_else(|| target_not_found(format!("location target {}", target_id)))?;

    upsert_entry(sequence_at(target, "image_inventory")?, entry, None)
}

/// Merge a generated entry into a chapter document's `images[custom_id]`.
///
/// # Errors
///
/// Returns `TargetNotFound` if no image spec has that custom id.
pub fn upsert_chapter_entry(
    doc: &mut Value,
    target_id: &str,
    entry: &InventoryEntry,
) -> MythicResult<bool> {
    let spec = doc
        .get_mut("images")
        .and_then(Value::as_sequence_mut)
        .and_then(|images| {
            images
                .iter_mut()
                .find(|img| str_field(img, "custom_id") == Some(target_id))
        })
        .ok_or_else(|| target_not_found(format!("chapter image {}", target_id)))?;
    upsert_entry(sequence_at(spec, "image_inventory")?, entry, None)
}

/// Merge an entry into a character document's top-level `image_inventory`.
pub fn upsert_character_entry(
    doc: &mut Value,
    entry: &InventoryEntry,
    filename: Option<&str>,
) -> MythicResult<bool> {
    upsert_entry(sequence_at(doc, "image_inventory")?, entry, filename)
}

/// A new, empty character document.
pub fn new_character_document(slug: &str) -> Value {
    let mut map = Mapping::new();
    map.insert(Value::from("entity_type"), Value::from("character"));
    map.insert(Value::from("slug"), Value::from(slug));
    map.insert(Value::from("prompts"), Value::Sequence(Sequence::new()));
    map.insert(Value::from("image_inventory"), Value::Sequence(Sequence::new()));
    Value::Mapping(map)
}

/// Set a character's `appearance` text.
pub fn set_appearance(doc: &mut Value, appearance: &str) -> MythicResult<()> {
    let map = doc
        .as_mapping_mut()
        .ok_or_else(|| target_not_found("character document is not a mapping"))?;
    map.insert(Value::from("appearance"), Value::from(appearance.trim()));
    Ok(())
}

/// A reference image as recorded in a run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReference {
    /// File name of the reference
    pub asset_id: String,
    /// Local path
    pub path: String,
    /// Role the reference played
    pub role: String,
}

/// One generation recorded in `imagery.runs.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
pub struct RunRecord {
    run_id: String,
    target_id: String,
    timestamp: String,
    file_name: String,
    file_path: String,
    provider: String,
    model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    ir_hash: String,
    prompt_used: String,
    #[serde(default)]
    negative_prompt_used: String,
    #[serde(default)]
    reference_images: Vec<RunReference>,
    #[serde(default)]
    constraints: BTreeMap<String, String>,
    provider_metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    target_metadata: BTreeMap<String, JsonValue>,
}

impl RunRecord {
    /// Record a generation of `task` written to `output_path`.
    pub fn new(task: &Task, output_path: &Path, run_id: &str) -> Self {
        let config = task.config();
        let mut constraints = BTreeMap::from([
            (
                "aspect_ratio".to_string(),
                config.aspect_ratio.clone().unwrap_or_else(|| "1:1".to_string()),
            ),
            (
                "size".to_string(),
                config.size.clone().unwrap_or_else(|| "1024x1024".to_string()),
            ),
            (
                "orientation".to_string(),
                config
                    .orientation
                    .clone()
                    .unwrap_or_else(|| "landscape".to_string()),
            ),
        ]);
        if let Some(quality) = &config.quality {
            constraints.insert("quality".to_string(), quality.clone());
        }

        Self {
            run_id: run_id.to_string(),
            target_id: task.target_id().clone(),
            timestamp: Utc::now().to_rfc3339(),
            file_name: output_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_path: output_path.to_string_lossy().into_owned(),
            provider: GENERATION_PROVIDER.to_string(),
            model: task.model().clone(),
            ir_hash: task.ir_hash().clone(),
            prompt_used: task.prompt().clone(),
            negative_prompt_used: task.negative_prompt().clone().unwrap_or_default(),
            reference_images: task
                .reference_images()
                .iter()
                .map(|r| RunReference {
                    asset_id: r
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    path: r.path.to_string_lossy().into_owned(),
                    role: r.role.to_string(),
                })
                .collect(),
            constraints,
            provider_metadata: BTreeMap::from([
                ("batch_run_id".to_string(), run_id.to_string()),
                ("task_key".to_string(), task.key().clone()),
            ]),
            target_metadata: task.target_metadata().clone(),
        }
    }
}

/// Insert or replace a record in a runs document, keyed by task key.
///
/// Creates the document when `doc` is `None`. Returns the updated document.
pub fn upsert_run_record(
    doc: Option<Value>,
    entity_type: EntityType,
    slug: &str,
    record: &RunRecord,
) -> MythicResult<Value> {
    let mut doc = doc.unwrap_or_else(|| {
        let mut map = Mapping::new();
        map.insert(Value::from("entity_type"), Value::from(entity_type.to_string()));
        map.insert(Value::from("entity_slug"), Value::from(slug));
        map.insert(Value::from("runs"), Value::Sequence(Sequence::new()));
        Value::Mapping(map)
    });
    let value = serde_yaml::to_value(record)
        .map_err(|e| YamlError::new(format!("Failed to encode run record: {}", e)))?;
    let task_key = record.provider_metadata.get("task_key").map(String::as_str);

    let runs = sequence_at(&mut doc, "runs")?;
    let existing = runs.iter().position(|run| {
        run.get("provider_metadata")
            .and_then(|m| str_field(m, "task_key"))
            .is_some_and(|k| Some(k) == task_key)
    });
    match existing {
        Some(index) => runs[index] = value,
        None => runs.push(value),
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, path: &str) -> InventoryEntry {
        let yaml = format!(
            r#"
id: {id}
path: {path}
type: generated
status: approved
content:
  title: Hearth
  description: The taproom hearth
  alt_text: A stone hearth
  tags: [hearth]
provenance:
  source: google
  created_at: "2025-01-01T00:00:00Z"
"#
        );
        InventoryEntry::parse_analysis(&yaml).unwrap()
    }

    #[test]
    fn upsert_is_idempotent_and_keeps_id() {
        let mut inventory = Sequence::new();
        assert!(!upsert_entry(&mut inventory, &entry("a", "images/a.png"), None).unwrap());
        // Same path, different id: replaced, original id kept.
        assert!(upsert_entry(&mut inventory, &entry("b", "images/a.png"), None).unwrap());
        assert_eq!(inventory.len(), 1);
        assert_eq!(str_field(&inventory[0], "id"), Some("a"));
    }

    #[test]
    fn upsert_matches_by_filename() {
        let mut inventory = Sequence::new();
        upsert_entry(&mut inventory, &entry("a", "images/portrait.png"), None).unwrap();
        let replaced =
            upsert_entry(&mut inventory, &entry("x", "other/y.png"), Some("portrait.png")).unwrap();
        assert!(replaced);
        assert_eq!(inventory.len(), 1);
    }

    #[test]
    fn fenced_analysis_parses() {
        let text = "```yaml\nid: a\npath: images/a.png\ntype: imported\nstatus: draft\ncontent:\n  title: t\n  description: d\n  alt_text: a\n  tags: [x]\nprovenance:\n  source: manual\n  created_at: now\nlighting:\n  quality: soft\n```";
        let parsed = InventoryEntry::parse_analysis(text).unwrap();
        assert_eq!(*parsed.entry_type(), EntryType::Imported);
        assert!(parsed.extra().contains_key("lighting"));
    }

    #[test]
    fn missing_tags_fail_validation() {
        let text = "id: a\npath: p\ntype: generated\nstatus: approved\ncontent:\n  title: t\n  description: d\n  alt_text: a\n  tags: []\nprovenance:\n  source: s\n  created_at: c\n";
        let err = InventoryEntry::parse_analysis(text).unwrap_err();
        assert!(err.to_string().contains("tags"));
    }

    #[test]
    fn location_zone_image_target() {
        let mut doc: Value = serde_yaml::from_str(
            r#"
overview:
  slug: overview
zones:
  - slug: taproom
    images:
      - image_slug: hearth
"#,
        )
        .unwrap();
        upsert_location_entry(&mut doc, "taproom__hearth", &entry("h", "images/h.png")).unwrap();
        upsert_location_entry(&mut doc, "taproom__hearth", &entry("h", "images/h.png")).unwrap();
        let inventory = &doc["zones"][0]["images"][0]["image_inventory"];
        assert_eq!(inventory.as_sequence().unwrap().len(), 1);

        upsert_location_entry(&mut doc, "overview", &entry("o", "images/o.png")).unwrap();
        assert_eq!(doc["overview"]["image_inventory"].as_sequence().unwrap().len(), 1);

        assert!(upsert_location_entry(&mut doc, "cellar", &entry("c", "images/c.png")).is_err());
    }

    #[test]
    fn chapter_target_by_custom_id() {
        let mut doc: Value =
            serde_yaml::from_str("images:\n  - custom_id: scene-1\n").unwrap();
        upsert_chapter_entry(&mut doc, "scene-1", &entry("s", "images/s.png")).unwrap();
        assert_eq!(doc["images"][0]["image_inventory"].as_sequence().unwrap().len(), 1);
        assert!(upsert_chapter_entry(&mut doc, "scene-2", &entry("s", "images/s.png")).is_err());
    }
}
