//! Test utilities for mythic_batch tests.
//!
//! Mock collaborators plus fixtures for tasks, references, and result lines.

#![allow(dead_code)]

pub mod mock_batch;
pub mod mock_reference;

#[allow(unused_imports)]
pub use mock_batch::{MockBatchClient, Responder};
#[allow(unused_imports)]
pub use mock_reference::MockReferenceStore;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mythic_core::{
    BatchConfig, EntityType, Plan, ReferenceImage, ReferenceRole, Scope, Task, TaskKind,
};
use mythic_storage::compute_hash;
use serde_json::json;
use std::path::Path;

/// Bytes every mock image result decodes to.
pub const IMAGE_BYTES: &[u8] = b"\x89PNG fake image";

/// Config with fast polling and retries, rooted at `artifact_dir`.
pub fn test_config(artifact_dir: &Path) -> BatchConfig {
    BatchConfig::default()
        .with_artifact_dir(artifact_dir.to_path_buf())
        .with_poll_interval_ms(1)
        .with_upload_base_delay_ms(1)
        .with_upload_max_delay_ms(2)
        .with_cleanup_after_success(false)
}

/// Write a reference image file and describe it.
pub fn write_reference(dir: &Path, name: &str, bytes: &[u8]) -> ReferenceImage {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    ReferenceImage::new(path, "image/png", compute_hash(bytes), ReferenceRole::Portrait)
}

/// A character image generation task writing under `content_root`.
pub fn generate_task(
    content_root: &Path,
    slug: &str,
    target: &str,
    references: Vec<ReferenceImage>,
) -> Task {
    Task::builder()
        .kind(TaskKind::Generate)
        .entity_type(EntityType::Character)
        .entity_slug(slug)
        .target_id(target)
        .prompt(format!("{} {}", slug, target))
        .reference_images(references)
        .output_dir(content_root.join("characters").join(slug).join("images"))
        .output_file_name(format!("{}-{}", slug, target))
        .model("test-model")
        .build()
        .unwrap()
}

/// A character analysis task of the given `analysis_type`.
pub fn analyze_task(content_root: &Path, slug: &str, analysis_type: &str) -> Task {
    analyze_task_with(content_root, slug, analysis_type, None)
}

/// An analysis task, optionally naming the analyzed file.
pub fn analyze_task_with(
    content_root: &Path,
    slug: &str,
    analysis_type: &str,
    filename: Option<&str>,
) -> Task {
    let mut metadata = std::collections::BTreeMap::new();
    metadata.insert("analysis_type".to_string(), json!(analysis_type));
    if let Some(filename) = filename {
        metadata.insert("filename".to_string(), json!(filename));
    }
    Task::builder()
        .kind(TaskKind::Analyze)
        .entity_type(EntityType::Character)
        .entity_slug(slug)
        .target_id(analysis_type)
        .prompt(format!("Describe {}", slug))
        .output_dir(content_root.join("characters").join(slug))
        .output_file_name(analysis_type)
        .model("test-model")
        .target_metadata(metadata)
        .build()
        .unwrap()
}

/// A plan over `tasks`.
pub fn plan(run_id: &str, config: &BatchConfig, tasks: Vec<Task>) -> Plan {
    let scope = Scope {
        entity_types: vec![EntityType::Character],
        entity_filter: None,
        kinds: vec![TaskKind::Generate, TaskKind::Analyze],
    };
    Plan::new(run_id, scope, config.clone(), tasks, 0)
}

/// Result line carrying an inline image.
pub fn image_line(key: &str) -> String {
    json!({
        "custom_id": key,
        "response": {
            "candidates": [{
                "content": {"parts": [{"inlineData": {"mimeType": "image/png", "data": STANDARD.encode(IMAGE_BYTES)}}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"totalTokenCount": 12}
        }
    })
    .to_string()
}

/// Result line carrying text.
pub fn text_line(key: &str, text: &str) -> String {
    json!({
        "custom_id": key,
        "response": {"candidates": [{"content": {"parts": [{"text": text}]}, "finishReason": "STOP"}]}
    })
    .to_string()
}

/// Result line carrying a provider error.
pub fn error_line(key: &str, code: u16, message: &str) -> String {
    json!({"custom_id": key, "error": {"code": code, "message": message}}).to_string()
}

/// A gRPC-style error line pairing a numeric code with a symbolic status.
pub fn status_error_line(key: &str, code: u16, status: &str, message: &str) -> String {
    json!({"custom_id": key, "error": {"code": code, "status": status, "message": message}})
        .to_string()
}

/// A valid image analysis response for `path`.
pub fn analysis_yaml(id: &str, path: &str) -> String {
    format!(
        "id: {id}\npath: {path}\ntype: imported\nstatus: approved\ncontent:\n  title: Portrait\n  description: A portrait\n  alt_text: Portrait of a character\n  tags: [portrait]\nprovenance:\n  source: manual\n  created_at: \"2025-01-01T00:00:00Z\"\n"
    )
}
