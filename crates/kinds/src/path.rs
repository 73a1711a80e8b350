//! Minimal json-path-like lookups used by field projection.

use serde_json::Value;

/// Follow dot fields and a single `[index]` per segment, e.g. `spec.template.spec.containers[0].image`.
pub(crate) fn extract_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for seg in path.split('.') {
        if seg.is_empty() { return None; }
        let (key, idx_opt) = if let Some(brk) = seg.find('[') {
            let end = seg.get(brk + 1..)?.find(']')? + brk + 1;
            let idx: usize = seg[brk + 1..end].parse().ok()?;
            (&seg[..brk], Some(idx))
        } else {
            (seg, None)
        };
        cur = match cur {
            Value::Object(map) => map.get(key)?,
            _ => return None,
        };
        if let Some(i) = idx_opt {
            cur = match cur {
                Value::Array(arr) => arr.get(i)?,
                _ => return None,
            };
        }
    }
    Some(cur)
}

pub(crate) fn str_at<'a>(root: &'a Value, path: &str) -> Option<&'a str> {
    extract_path(root, path).and_then(|v| v.as_str())
}
