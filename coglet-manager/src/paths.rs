//! Input and output path rewriting.
//!
//! Inputs: URI-typed strings (located via the input schema) are materialised
//! into temp files before the request is handed to the worker: data URLs
//! are decoded, http(s) URLs downloaded. Outputs: local file paths embedded
//! in the output value are replaced by an uploaded location or a base64 data
//! URL. Every file is processed at most once per prediction via the
//! pending's output cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::schema::{InputSchema, PropertyKind};
use crate::upload::Uploader;

/// Replace `data:<mime>;base64,...` strings with temp file paths.
///
/// `cache` maps an original source string to its materialised path, so a
/// repeated source within one prediction decodes to a single file; it is
/// shared with [`url_to_input`] since the two passes run in sequence.
/// Created files are appended to `created` so they can be unlinked when the
/// prediction completes.
pub async fn base64_to_input(
    input: &mut Value,
    schema: &InputSchema,
    tmp_dir: &Path,
    cache: &mut HashMap<String, String>,
    created: &mut Vec<PathBuf>,
) -> Result<()> {
    for pointer in candidate_pointers(input, schema) {
        let Some(current) = input.pointer(&pointer).and_then(Value::as_str) else {
            continue;
        };
        if let Some(replacement) = cache.get(current) {
            *input.pointer_mut(&pointer).unwrap() = Value::String(replacement.clone());
            continue;
        }
        let Some((mime, payload)) = split_data_url(current) else {
            continue;
        };
        let source = current.to_string();
        let bytes = BASE64
            .decode(payload)
            .map_err(|e| Error::InputRewrite(format!("invalid base64 input: {e}")))?;

        let extension = mime_guess::get_mime_extensions_str(mime)
            .and_then(|exts| exts.first())
            .unwrap_or(&"bin");
        let path = tmp_dir.join(format!("input-{}.{}", Uuid::new_v4(), extension));
        tokio::fs::write(&path, &bytes).await?;

        created.push(path.clone());
        let replacement = path.display().to_string();
        cache.insert(source, replacement.clone());
        *input.pointer_mut(&pointer).unwrap() = Value::String(replacement);
    }
    Ok(())
}

/// Replace `http(s)://` strings with downloaded temp file paths.
///
/// Shares the per-prediction `cache` with [`base64_to_input`]; a repeated
/// URL is downloaded once.
pub async fn url_to_input(
    input: &mut Value,
    schema: &InputSchema,
    tmp_dir: &Path,
    client: &reqwest::Client,
    cache: &mut HashMap<String, String>,
    created: &mut Vec<PathBuf>,
) -> Result<()> {
    for pointer in candidate_pointers(input, schema) {
        let Some(current) = input.pointer(&pointer).and_then(Value::as_str) else {
            continue;
        };
        if let Some(replacement) = cache.get(current) {
            *input.pointer_mut(&pointer).unwrap() = Value::String(replacement.clone());
            continue;
        }
        if !current.starts_with("http://") && !current.starts_with("https://") {
            continue;
        }
        let source = current.to_string();

        let response = client.get(current).send().await?;
        if !response.status().is_success() {
            return Err(Error::InputRewrite(format!(
                "fetching {current}: status {}",
                response.status().as_u16()
            )));
        }
        let basename = current
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("download");
        let path = tmp_dir.join(format!("input-{}-{basename}", Uuid::new_v4()));
        let bytes = response.bytes().await?;
        tokio::fs::write(&path, &bytes).await?;

        created.push(path.clone());
        let replacement = path.display().to_string();
        cache.insert(source, replacement.clone());
        *input.pointer_mut(&pointer).unwrap() = Value::String(replacement);
    }
    Ok(())
}

/// Replace local file paths in the output with their published form.
///
/// When `upload` is set the file is PUT to the upload endpoint and the
/// canonical location substituted; otherwise the file is inlined as a
/// `data:<mime>;base64,` URL. `cache` deduplicates per source path;
/// consumed paths are appended to `consumed` for unlinking after a
/// successful pass.
pub async fn process_output(
    output: &mut Value,
    upload: Option<(&Uploader, &str)>,
    prediction_id: &str,
    cache: &mut HashMap<String, String>,
    consumed: &mut Vec<PathBuf>,
) -> Result<()> {
    let mut pointers = Vec::new();
    collect_strings(output, String::new(), &mut pointers);

    for pointer in pointers {
        let Some(current) = output.pointer(&pointer).and_then(Value::as_str) else {
            continue;
        };
        let current = current.to_string();

        if let Some(replacement) = cache.get(&current) {
            *output.pointer_mut(&pointer).unwrap() = Value::String(replacement.clone());
            continue;
        }

        // Only absolute, existing files count as path-typed output.
        let path = Path::new(&current);
        if !path.is_absolute() || !path.is_file() {
            continue;
        }

        let replacement = match upload {
            Some((uploader, base_url)) => uploader.upload(base_url, path, prediction_id).await?,
            None => encode_data_url(path).await?,
        };

        consumed.push(path.to_path_buf());
        cache.insert(current, replacement.clone());
        *output.pointer_mut(&pointer).unwrap() = Value::String(replacement);
    }
    Ok(())
}

async fn encode_data_url(path: &Path) -> Result<String> {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let bytes = tokio::fs::read(path).await?;
    Ok(format!("data:{mime};base64,{}", BASE64.encode(&bytes)))
}

fn split_data_url(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix("data:")?;
    let (mime, payload) = rest.split_once(";base64,")?;
    Some((mime, payload))
}

/// Pointers to strings the schema allows to be URI-typed.
fn candidate_pointers(input: &Value, schema: &InputSchema) -> Vec<String> {
    let mut pointers = Vec::new();
    let Some(object) = input.as_object() else {
        return pointers;
    };

    for (key, value) in object {
        let prefix = format!("/{}", escape_pointer(key));
        match schema.property(key) {
            PropertyKind::Uri => {
                if value.is_string() {
                    pointers.push(prefix);
                }
            }
            PropertyKind::UriArray => {
                if let Some(items) = value.as_array() {
                    for (index, item) in items.iter().enumerate() {
                        if item.is_string() {
                            pointers.push(format!("{prefix}/{index}"));
                        }
                    }
                }
            }
            PropertyKind::Object => collect_strings(value, prefix, &mut pointers),
            PropertyKind::Other => {}
        }
    }
    pointers
}

/// Pointers to every string nested anywhere under `value`.
fn collect_strings(value: &Value, prefix: String, pointers: &mut Vec<String>) {
    match value {
        Value::String(_) => pointers.push(prefix),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_strings(item, format!("{prefix}/{index}"), pointers);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                collect_strings(item, format!("{prefix}/{}", escape_pointer(key)), pointers);
            }
        }
        _ => {}
    }
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}
