//! Checkpoint slimming: heavy payloads are replaced by small reference objects so checkpoint
//! size stays bounded no matter how much binary data a run carries in its state.
//!
//! Every elided field is also captured as an [Artifact] keyed by its JSON pointer, so
//! [rehydrate] can restore the full state on resume.

use std::collections::HashSet;

use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::kernel::artifact::{Artifact, ArtifactRef};
use crate::kernel::identity::RunId;

pub const TEXT_REF: &str = "text_ref";
pub const BYTES_REF: &str = "bytes_ref";
pub const LIST_REF: &str = "list_ref";

/// Key of the binary payload object form: `{"$bytes": "<base64>"}`.
pub const BYTES_KEY: &str = "$bytes";

const COARSE_INLINE_CHARS: usize = 64;

/// Slimming thresholds.
#[derive(Clone, Debug)]
pub struct SlimConfig {
    pub max_inline_chars: usize,
    pub heavy_fields: HashSet<String>,
    /// Treat every non-empty list as heavy (coarse profile).
    pub all_lists_heavy: bool,
    /// Serialized checkpoint budget; above it the coarse profile is applied.
    pub max_checkpoint_bytes: usize,
}

impl Default for SlimConfig {
    fn default() -> Self {
        Self {
            max_inline_chars: 2048,
            heavy_fields: ["page_images", "images", "pages"]
                .into_iter()
                .map(String::from)
                .collect(),
            all_lists_heavy: false,
            max_checkpoint_bytes: 1024 * 1024,
        }
    }
}

impl SlimConfig {
    pub fn coarse(&self) -> Self {
        Self {
            max_inline_chars: COARSE_INLINE_CHARS.min(self.max_inline_chars),
            heavy_fields: self.heavy_fields.clone(),
            all_lists_heavy: true,
            max_checkpoint_bytes: self.max_checkpoint_bytes,
        }
    }
}

/// Output of one slimming pass.
#[derive(Clone, Debug, PartialEq)]
pub struct Slimmed {
    pub state: Value,
    pub artifacts: Vec<Artifact>,
    /// True when the coarse profile had to be applied.
    pub coarse: bool,
}

/// Lowercase hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Returns the slimmed state only.
pub fn slim(state: &Value, config: &SlimConfig) -> Value {
    slim_with_artifacts("", state, config).state
}

/// Slims `state` and collects one artifact per elided field.
pub fn slim_with_artifacts(run_id: &str, state: &Value, config: &SlimConfig) -> Slimmed {
    let mut artifacts = Vec::new();
    let slimmed = walk(run_id, state, "", None, config, &mut artifacts);
    Slimmed {
        state: slimmed,
        artifacts,
        coarse: config.all_lists_heavy,
    }
}

/// Artifact index for everything [slim] would elide from `state`.
pub fn extract_artifact_refs(run_id: &RunId, state: &Value, config: &SlimConfig) -> Vec<ArtifactRef> {
    slim_with_artifacts(run_id, state, config)
        .artifacts
        .into_iter()
        .map(|a| a.reference)
        .collect()
}

/// Slims for a checkpoint; falls back to the coarse profile when the result is still too big.
pub fn slim_for_checkpoint(run_id: &RunId, state: &Value, config: &SlimConfig) -> Slimmed {
    let first = slim_with_artifacts(run_id, state, config);
    match serde_json::to_vec(&first.state) {
        Ok(bytes) if bytes.len() <= config.max_checkpoint_bytes => first,
        Ok(bytes) => {
            tracing::warn!(
                run_id = %run_id,
                size = bytes.len(),
                limit = config.max_checkpoint_bytes,
                "checkpoint over size budget, re-slimming with coarse profile"
            );
            slim_with_artifacts(run_id, state, &config.coarse())
        }
        Err(e) => {
            tracing::warn!(run_id = %run_id, error = %e, "checkpoint serialization failed, re-slimming with coarse profile");
            slim_with_artifacts(run_id, state, &config.coarse())
        }
    }
}

/// Restores elided fields from `artifacts`. References without a matching artifact stay as they are.
pub fn rehydrate(state: &Value, artifacts: &[Artifact]) -> Value {
    if artifacts.is_empty() {
        return state.clone();
    }
    rehydrate_at(state, "", artifacts)
}

fn rehydrate_at(value: &Value, pointer: &str, artifacts: &[Artifact]) -> Value {
    match value {
        Value::Object(map) => {
            if is_ref_object(map) {
                if let Some(found) = artifacts.iter().find(|a| a.reference.artifact_id == pointer) {
                    return found.content.clone();
                }
                return value.clone();
            }
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let child_ptr = format!("{}/{}", pointer, escape_pointer(key));
                out.insert(key.clone(), rehydrate_at(child, &child_ptr, artifacts));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| rehydrate_at(item, &format!("{}/{}", pointer, i), artifacts))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn is_ref_object(map: &Map<String, Value>) -> bool {
    match map.get("kind").and_then(Value::as_str) {
        Some(TEXT_REF) | Some(BYTES_REF) => map.contains_key("hash") && map.contains_key("size"),
        Some(LIST_REF) => map.contains_key("count") && map.contains_key("item_type"),
        _ => false,
    }
}

fn walk(
    run_id: &str,
    value: &Value,
    pointer: &str,
    key: Option<&str>,
    config: &SlimConfig,
    artifacts: &mut Vec<Artifact>,
) -> Value {
    match value {
        Value::String(s) => {
            if let Some(b64) = data_uri_payload(s) {
                return elide_bytes(run_id, value, pointer, b64, artifacts);
            }
            if s.chars().count() > config.max_inline_chars {
                let hash = sha256_hex(s.as_bytes());
                let size = s.len();
                artifacts.push(artifact(
                    run_id,
                    pointer,
                    Some(hash.clone()),
                    json!({ "kind": TEXT_REF, "size": size }),
                    value,
                ));
                return json!({ "kind": TEXT_REF, "size": size, "hash": hash });
            }
            value.clone()
        }
        Value::Object(map) => {
            if let Some(b64) = bytes_object_payload(map) {
                return elide_bytes(run_id, value, pointer, b64, artifacts);
            }
            let mut out = Map::with_capacity(map.len());
            for (child_key, child) in map {
                let child_ptr = format!("{}/{}", pointer, escape_pointer(child_key));
                out.insert(
                    child_key.clone(),
                    walk(run_id, child, &child_ptr, Some(child_key), config, artifacts),
                );
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let heavy = key.is_some_and(|k| config.heavy_fields.contains(k))
                || (config.all_lists_heavy && !items.is_empty());
            if heavy {
                let list_key = key.map(String::from).unwrap_or_else(|| pointer.to_string());
                let count = items.len();
                let item_type = items.first().map(item_type).unwrap_or("unknown");
                let hash = sha256_hex(value.to_string().as_bytes());
                artifacts.push(artifact(
                    run_id,
                    pointer,
                    Some(hash),
                    json!({ "kind": LIST_REF, "key": list_key, "count": count, "item_type": item_type }),
                    value,
                ));
                return json!({ "kind": LIST_REF, "key": list_key, "count": count, "item_type": item_type });
            }
            Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        walk(run_id, item, &format!("{}/{}", pointer, i), None, config, artifacts)
                    })
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

fn elide_bytes(
    run_id: &str,
    original: &Value,
    pointer: &str,
    b64: &str,
    artifacts: &mut Vec<Artifact>,
) -> Value {
    // `hash` and `size` both describe the decoded payload.
    let (size, hash) = match general_purpose::STANDARD.decode(b64.trim()) {
        Ok(bytes) => (bytes.len(), sha256_hex(&bytes)),
        Err(e) => {
            tracing::debug!(pointer, error = %e, "malformed base64 payload, hashing the encoded text");
            (decoded_len(b64), sha256_hex(b64.as_bytes()))
        }
    };
    artifacts.push(artifact(
        run_id,
        pointer,
        Some(hash.clone()),
        json!({ "kind": BYTES_REF, "size": size }),
        original,
    ));
    json!({ "kind": BYTES_REF, "size": size, "hash": hash })
}

fn artifact(run_id: &str, pointer: &str, hash: Option<String>, metadata: Value, content: &Value) -> Artifact {
    Artifact {
        reference: ArtifactRef {
            artifact_id: pointer.to_string(),
            uri: format!("artifact://{}{}", run_id, pointer),
            content_hash: hash,
            metadata,
        },
        content: content.clone(),
    }
}

fn data_uri_payload(s: &str) -> Option<&str> {
    if !s.starts_with("data:") {
        return None;
    }
    let marker = ";base64,";
    let idx = s.find(marker)?;
    Some(&s[idx + marker.len()..])
}

fn bytes_object_payload(map: &Map<String, Value>) -> Option<&str> {
    if map.len() != 1 {
        return None;
    }
    map.get(BYTES_KEY).and_then(Value::as_str)
}

/// Estimated decoded length for payloads that fail to decode.
fn decoded_len(b64: &str) -> usize {
    let trimmed = b64.trim_end_matches('=');
    trimmed.len() * 3 / 4
}

fn item_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(s) if data_uri_payload(s).is_some() => "bytes",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(map) if bytes_object_payload(map).is_some() => "bytes",
        Value::Object(_) => "object",
    }
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SlimConfig {
        SlimConfig {
            max_inline_chars: 16,
            ..SlimConfig::default()
        }
    }

    #[test]
    fn scalars_and_short_strings_pass_through() {
        let state = json!({ "score": 7.5, "ok": true, "name": "essay-1", "nothing": null });
        assert_eq!(slim(&state, &small_config()), state);
    }

    #[test]
    fn long_text_becomes_text_ref_with_sha256() {
        let text = "x".repeat(40);
        let state = json!({ "transcript": text });
        let slimmed = slim_with_artifacts("run-1", &state, &small_config());
        assert_eq!(slimmed.state["transcript"]["kind"], json!(TEXT_REF));
        assert_eq!(slimmed.state["transcript"]["size"], json!(40));
        assert_eq!(slimmed.state["transcript"]["hash"], json!(sha256_hex(text.as_bytes())));
        assert_eq!(slimmed.artifacts.len(), 1);
        assert_eq!(slimmed.artifacts[0].reference.uri, "artifact://run-1/transcript");
    }

    #[test]
    fn binary_payloads_become_bytes_ref() {
        let state = json!({
            "scan": { "$bytes": "aGVsbG8gd29ybGQ=" },
            "thumb": "data:image/png;base64,iVBORw0KGgo=",
        });
        let slimmed = slim(&state, &SlimConfig::default());
        assert_eq!(slimmed["scan"]["kind"], json!(BYTES_REF));
        assert_eq!(slimmed["scan"]["size"], json!(11));
        assert_eq!(slimmed["thumb"]["kind"], json!(BYTES_REF));
    }

    #[test]
    fn bytes_ref_hash_covers_the_decoded_payload() {
        let state = json!({
            "scan": { "$bytes": "aGVsbG8gd29ybGQ=" },
            "thumb": "data:text/plain;base64,aGVsbG8gd29ybGQ=",
        });
        let slimmed = slim(&state, &SlimConfig::default());
        let expected = sha256_hex(b"hello world");
        assert_eq!(slimmed["scan"]["hash"], json!(expected));
        assert_eq!(slimmed["thumb"]["hash"], json!(expected));
        assert_eq!(slimmed["thumb"]["size"], json!(11));
        assert_ne!(slimmed["scan"]["hash"], json!(sha256_hex(b"aGVsbG8gd29ybGQ=")));
    }

    #[test]
    fn heavy_list_ref_count_matches_original_length() {
        let state = json!({
            "doc": { "page_images": [{ "$bytes": "AAAA" }, { "$bytes": "BBBB" }, { "$bytes": "CCCC" }] },
            "tags": ["a", "b"],
        });
        let refs = extract_artifact_refs(&"run-7".to_string(), &state, &SlimConfig::default());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].artifact_id, "/doc/page_images");
        assert_eq!(refs[0].metadata["count"], json!(3));
        assert_eq!(refs[0].metadata["item_type"], json!("bytes"));

        let slimmed = slim(&state, &SlimConfig::default());
        assert_eq!(slimmed["tags"], json!(["a", "b"]));
        assert_eq!(slimmed["doc"]["page_images"]["count"], json!(3));
    }

    #[test]
    fn rehydrate_restores_elided_fields() {
        let state = json!({
            "pages": ["p1", "p2"],
            "essay": "y".repeat(100),
            "meta": { "a/b": { "$bytes": "AAAA" } },
        });
        let slimmed = slim_with_artifacts("r", &state, &small_config());
        assert_ne!(slimmed.state, state);
        assert_eq!(rehydrate(&slimmed.state, &slimmed.artifacts), state);
    }

    #[test]
    fn oversized_checkpoint_uses_coarse_profile() {
        let state = json!({
            "rows": (0..200).map(|i| json!({ "i": i, "label": "row label" })).collect::<Vec<_>>(),
        });
        let config = SlimConfig {
            max_checkpoint_bytes: 512,
            ..SlimConfig::default()
        };
        let slimmed = slim_for_checkpoint(&"r".to_string(), &state, &config);
        assert!(slimmed.coarse);
        assert_eq!(slimmed.state["rows"]["kind"], json!(LIST_REF));
        assert_eq!(slimmed.state["rows"]["count"], json!(200));
        assert!(serde_json::to_vec(&slimmed.state).unwrap().len() <= 512);
    }
}
