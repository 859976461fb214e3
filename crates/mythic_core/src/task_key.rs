//! Deterministic task key generation.
//!
//! Keys have the form `{entityType}/{slug}/{targetId}@{contentHash}` where the
//! content hash covers everything that changes provider output. Equal inputs
//! always produce equal keys, so re-planning the same work never duplicates it.

use crate::{EntityType, TaskConfig};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Length of the hex digest embedded in a key.
const HASH_LEN: usize = 16;

/// Length of the digest shown by [`display_key`].
const SHORT_HASH_LEN: usize = 8;

/// The semantic inputs a task key is derived from.
#[derive(Debug, Clone)]
pub struct KeyComponents<'a> {
    /// Entity type
    pub entity_type: EntityType,
    /// Entity slug
    pub entity_slug: &'a str,
    /// Target within the entity
    pub target_id: &'a str,
    /// Prompt text
    pub prompt: &'a str,
    /// Negative prompt, if any
    pub negative_prompt: Option<&'a str>,
    /// Content hashes of reference images, in any order
    pub reference_hashes: Vec<&'a str>,
    /// Model name
    pub model: &'a str,
    /// Generation parameters
    pub config: &'a TaskConfig,
}

#[derive(Serialize)]
struct HashInput<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    reference_hashes: Vec<&'a str>,
    model: &'a str,
    config: &'a TaskConfig,
}

/// Compute the truncated SHA-256 digest over the content-bearing components.
pub fn compute_content_hash(components: &KeyComponents<'_>) -> String {
    let mut reference_hashes = components.reference_hashes.clone();
    reference_hashes.sort_unstable();

    let input = HashInput {
        prompt: components.prompt,
        negative_prompt: components.negative_prompt.unwrap_or(""),
        reference_hashes,
        model: components.model,
        config: components.config,
    };

    // Struct serialization has a fixed field order, so the text is canonical.
    let canonical = serde_json::to_string(&input).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..HASH_LEN].to_string()
}

/// Generate the full task key.
///
/// # Examples
///
/// ```
/// use mythic_core::{EntityType, KeyComponents, TaskConfig, generate_task_key};
///
/// let config = TaskConfig::default();
/// let key = generate_task_key(&KeyComponents {
///     entity_type: EntityType::Location,
///     entity_slug: "shepherds-rest-inn",
///     target_id: "exterior",
///     prompt: "A roadside inn",
///     negative_prompt: None,
///     reference_hashes: vec![],
///     model: "gemini-3-pro-image-preview",
///     config: &config,
/// });
/// assert!(key.starts_with("location/shepherds-rest-inn/exterior@"));
/// assert_eq!(key.rsplit('@').next().unwrap().len(), 16);
/// ```
pub fn generate_task_key(components: &KeyComponents<'_>) -> String {
    format!(
        "{}/{}/{}@{}",
        components.entity_type,
        components.entity_slug,
        components.target_id,
        compute_content_hash(components)
    )
}

/// A task key split back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTaskKey {
    /// Entity type
    pub entity_type: EntityType,
    /// Entity slug
    pub entity_slug: String,
    /// Target id, which may itself contain `/`
    pub target_id: String,
    /// Content digest
    pub content_hash: String,
}

/// Parse a task key. Returns `None` for anything malformed.
pub fn parse_task_key(key: &str) -> Option<ParsedTaskKey> {
    let (path, content_hash) = key.rsplit_once('@')?;
    let mut parts = path.splitn(3, '/');
    let entity_type = parts.next()?.parse::<EntityType>().ok()?;
    let entity_slug = parts.next()?;
    let target_id = parts.next()?;

    if entity_slug.is_empty() || target_id.is_empty() || content_hash.is_empty() {
        return None;
    }

    Some(ParsedTaskKey {
        entity_type,
        entity_slug: entity_slug.to_string(),
        target_id: target_id.to_string(),
        content_hash: content_hash.to_string(),
    })
}

/// Whether two keys address the same entity target, ignoring content.
pub fn is_same_target(a: &str, b: &str) -> bool {
    match (parse_task_key(a), parse_task_key(b)) {
        (Some(a), Some(b)) => {
            a.entity_type == b.entity_type
                && a.entity_slug == b.entity_slug
                && a.target_id == b.target_id
        }
        _ => false,
    }
}

/// Whether `new` replaces `existing`: same target, different content.
pub fn needs_regeneration(existing: &str, new: &str) -> bool {
    is_same_target(existing, new) && existing != new
}

/// Key with the digest shortened, for console output.
pub fn display_key(key: &str) -> String {
    match key.rsplit_once('@') {
        Some((path, hash)) if hash.len() > SHORT_HASH_LEN => {
            format!("{}@{}", path, &hash[..SHORT_HASH_LEN])
        }
        _ => key.to_string(),
    }
}
