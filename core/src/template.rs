use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Result, RouterError};

const MAX_LEN_CEILING: u64 = 64 * 1024 * 1024;

/// One named, idempotent text rewrite applied to an extracted chat template.
pub struct Patch {
    pub id: &'static str,
    pub description: &'static str,
    pub apply: fn(&str) -> String,
}

fn empty_tools_array(text: &str) -> String {
    const REWRITES: &[(&str, &str)] = &[
        ("tools is not none", "(tools is not none and tools | length > 0)"),
        ("tools != none", "(tools != none and tools | length > 0)"),
        ("not tools is none", "(not tools is none and tools | length > 0)"),
    ];
    let mut out = text.to_string();
    for (find, replace) in REWRITES {
        if out.contains(*replace) {
            continue;
        }
        out = out.replace(find, replace);
    }
    out
}

/// Ordered registry of patches, applied in sequence.
pub fn patch_registry() -> Vec<Patch> {
    vec![Patch {
        id: "empty-tools-array",
        description: "guard chat-template tool blocks against an empty tools array",
        apply: empty_tools_array,
    }]
}

pub fn apply_patches(text: &str, registry: &[Patch]) -> String {
    let mut out = text.to_string();
    for patch in registry {
        out = (patch.apply)(&out);
    }
    out
}

/// Reads a length-prefixed field, checking it against a sanity ceiling
/// before any allocation or seek happens.
fn read_u64(buf: &[u8], offset: &mut usize) -> Result<u64> {
    let bytes = buf
        .get(*offset..*offset + 8)
        .ok_or_else(|| RouterError::ContainerFormat("truncated length field".into()))?;
    *offset += 8;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_bounded_len(buf: &[u8], offset: &mut usize) -> Result<usize> {
    let len = read_u64(buf, offset)?;
    if len > MAX_LEN_CEILING {
        return Err(RouterError::ContainerFormat(format!(
            "length field {len} exceeds ceiling"
        )));
    }
    Ok(len as usize)
}

fn value_payload_len(buf: &[u8], offset: &mut usize, type_tag: u32) -> Result<usize> {
    match type_tag {
        0 | 1 => Ok(1),               // u8/i8/bool
        2 | 3 => Ok(2),               // u16/i16
        4 | 5 | 6 => Ok(4),           // u32/i32/f32
        7 | 8 | 9 => Ok(8),           // u64/i64/f64
        10 => {
            // string: length-prefixed, payload already consumed by caller via len
            let len = read_bounded_len(buf, offset)?;
            Ok(len)
        }
        11 => {
            // array: element type tag + length, recurse per element
            let elem_tag = buf
                .get(*offset..*offset + 4)
                .ok_or_else(|| RouterError::ContainerFormat("truncated array tag".into()))?;
            let elem_tag = u32::from_le_bytes(elem_tag.try_into().unwrap());
            *offset += 4;
            let count = read_bounded_len(buf, offset)?;
            let mut total = 0usize;
            for _ in 0..count {
                let elem_len = value_payload_len(buf, offset, elem_tag)?;
                *offset += elem_len;
                total += elem_len;
            }
            Ok(0) // array consumption already advanced offset per-element
        }
        other => Err(RouterError::ContainerFormat(format!("unknown value type tag {other}"))),
    }
}

/// Extracts the `tokenizer.chat_template` string value from a binary
/// metadata container. Missing template returns `Ok(None)`, not an error.
pub fn extract_chat_template(buf: &[u8]) -> Result<Option<String>> {
    if buf.len() < 24 {
        return Err(RouterError::ContainerFormat("file too small for header".into()));
    }
    let magic = &buf[0..4];
    let _ = magic; // magic value itself isn't asserted against one literal constant
    let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if version != 2 && version != 3 {
        return Err(RouterError::ContainerFormat(format!("unsupported version {version}")));
    }
    let mut offset = 8usize;
    let _tensor_count = read_u64(buf, &mut offset)?;
    let kv_count = read_u64(buf, &mut offset)?;

    for _ in 0..kv_count {
        let key_len = read_bounded_len(buf, &mut offset)?;
        let key_bytes = buf
            .get(offset..offset + key_len)
            .ok_or_else(|| RouterError::ContainerFormat("truncated key".into()))?;
        let key = String::from_utf8_lossy(key_bytes).to_string();
        offset += key_len;

        let type_tag = buf
            .get(offset..offset + 4)
            .ok_or_else(|| RouterError::ContainerFormat("truncated value type".into()))?;
        let type_tag = u32::from_le_bytes(type_tag.try_into().unwrap());
        offset += 4;

        if type_tag == 10 {
            let val_len = read_bounded_len(buf, &mut offset)?;
            let val_bytes = buf
                .get(offset..offset + val_len)
                .ok_or_else(|| RouterError::ContainerFormat("truncated string value".into()))?;
            if key == "tokenizer.chat_template" {
                return Ok(Some(String::from_utf8_lossy(val_bytes).to_string()));
            }
            offset += val_len;
        } else {
            let len = value_payload_len(buf, &mut offset, type_tag)?;
            offset += len;
        }
    }
    Ok(None)
}

fn cache_key(model_path: &Path, mtime_nanos: i128) -> String {
    let input = format!("{}:{}", model_path.display(), mtime_nanos);
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

/// Full pipeline: extract, patch, and (if changed) write to the template
/// cache directory. Returns `None` when there's no template or the
/// registry leaves it unchanged (nothing written).
pub fn extract_and_patch(
    model_path: &Path,
    container: &[u8],
    mtime_nanos: i128,
    cache_dir: &Path,
) -> Result<Option<PathBuf>> {
    let Some(template) = extract_chat_template(container)? else {
        return Ok(None);
    };
    let registry = patch_registry();
    let patched = apply_patches(&template, &registry);
    if patched == template {
        return Ok(None);
    }
    let key = cache_key(model_path, mtime_nanos);
    let cache_path = cache_dir.join(format!("{key}.jinja"));
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RouterError::Internal(e.into()))?;
    }
    std::fs::write(&cache_path, &patched).map_err(|e| RouterError::Internal(e.into()))?;
    Ok(Some(cache_path))
}
