//! Human-readable rendering of decoded trees and of error trails.

use crate::error::CodecError;
use crate::trace::render_frames;
use crate::value::Value;

fn hex_string(b: &[u8]) -> String {
    b.iter().map(|x| format!("{:02x}", x)).collect::<Vec<_>>().join(" ")
}

/// Raw scalar string; `None` for lists and records.
pub fn format_scalar(v: &Value) -> Option<String> {
    Some(match v {
        Value::Bool(b) => b.to_string(),
        Value::UInt(x) => x.to_string(),
        Value::Int(x) => x.to_string(),
        Value::Float(x) => x.to_string(),
        Value::Char(c) => format!("'{}'", c),
        Value::String(s) => format!("{:?}", s),
        Value::Bytes(b) => format!("hex({})", hex_string(b)),
        Value::Enum(e) if e.raw < 0 => format!("{} ({})", e.name, e.raw),
        Value::Enum(e) => format!("{} ({:#x})", e.name, e.raw),
        Value::List(_) | Value::Record(_) => return None,
    })
}

/// Multi-line dump of a value, indented by `indent` levels.
pub fn value_to_dump(v: &Value, indent: usize) -> String {
    let pad = "  ".repeat(indent);
    if let Some(s) = format_scalar(v) {
        return format!("{}{}", pad, s);
    }
    match v {
        Value::Record(r) => {
            let mut lines = vec![format!("{}{} {{", pad, r.concrete_name())];
            for (name, field) in &r.fields {
                let sub = value_to_dump(field, indent + 1);
                lines.push(format!("{}  {}: {}", pad, name, sub.trim_start()));
            }
            lines.push(format!("{}}}", pad));
            lines.join("\n")
        }
        Value::List(items) if items.is_empty() => format!("{}[]", pad),
        Value::List(items) => {
            let mut lines = vec![format!("{}[", pad)];
            for (i, item) in items.iter().enumerate() {
                let sub = value_to_dump(item, indent + 1);
                lines.push(format!("{}  [{}] {}", pad, i, sub.trim_start()));
            }
            lines.push(format!("{}]", pad));
            lines.join("\n")
        }
        _ => String::new(),
    }
}

/// First line of `value_to_dump` (for one-line summaries).
pub fn value_summary_line(v: &Value) -> String {
    let full = value_to_dump(v, 0);
    full.lines().next().map(|s| s.trim().to_string()).unwrap_or_default()
}

/// Error message followed by the trail, one frame per line, innermost first.
pub fn error_report(err: &CodecError) -> String {
    let frames = err.frames();
    let mut lines = vec![err.root().to_string()];
    if !frames.is_empty() {
        lines.push(format!("  at {}", render_frames(frames)));
        for frame in frames.iter().rev() {
            lines.push(format!("    {}", frame));
        }
    }
    lines.join("\n")
}
