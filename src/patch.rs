//! Patch descriptors and the patch applier.
//!
//! A proposal arrives as untrusted JSON ([`RawPatch`]) and is narrowed into a
//! [`PatchDescriptor`], which carries exactly one payload shape. Applying a
//! descriptor is pure and total: the worst case is the parent text unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blocks::{self, Segment};
use crate::error::MalformedPatch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchDescriptor {
    /// Replacement text for the whole program.
    Full(String),
    /// Block identifier to replacement interior.
    Blocks(BTreeMap<String, String>),
}

impl PatchDescriptor {
    pub fn shape(&self) -> &'static str {
        match self {
            PatchDescriptor::Full(_) => "full",
            PatchDescriptor::Blocks(_) => "blocks",
        }
    }
}

/// Wire form of a proposal, as returned by the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<BTreeMap<String, String>>,
}

impl RawPatch {
    pub fn full(code: impl Into<String>) -> Self {
        Self { code: Some(code.into()), blocks: None }
    }

    pub fn blocks<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            code: None,
            blocks: Some(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }

    /// Lenient extraction from an arbitrary JSON value.
    ///
    /// `code` (or its alias `full`) must be a string; `blocks` must be an
    /// object, and entries whose value is not a string are dropped. Anything
    /// else is treated as absent.
    pub fn from_value(value: &Value) -> Self {
        let code = value
            .get("code")
            .and_then(Value::as_str)
            .or_else(|| value.get("full").and_then(Value::as_str))
            .map(str::to_string);
        let blocks = value.get("blocks").and_then(Value::as_object).map(|map| {
            map.iter()
                .filter_map(|(id, body)| body.as_str().map(|b| (id.clone(), b.to_string())))
                .collect()
        });
        Self { code, blocks }
    }

    /// Parse model output, tolerating a surrounding markdown code fence.
    pub fn from_model_output(content: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(strip_code_fence(content))?;
        Ok(Self::from_value(&value))
    }
}

impl TryFrom<RawPatch> for PatchDescriptor {
    type Error = MalformedPatch;

    fn try_from(raw: RawPatch) -> Result<Self, Self::Error> {
        match (raw.code, raw.blocks) {
            (Some(code), None) => Ok(PatchDescriptor::Full(code)),
            (None, Some(blocks)) => Ok(PatchDescriptor::Blocks(blocks)),
            (None, None) => Err(MalformedPatch::Empty),
            (Some(_), Some(_)) => Err(MalformedPatch::Ambiguous),
        }
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = body.strip_suffix("```") else {
        return trimmed;
    };
    // drop the info string ("json") on the opening fence line
    match body.find('\n') {
        Some(nl) => body[nl + 1..].trim(),
        None => body.trim(),
    }
}

/// How a replacement interior is laid into its block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockFit {
    /// The interior becomes the replacement text byte for byte, plus a line
    /// terminator when the text lacks one.
    #[default]
    Verbatim,
    /// Dedent the replacement, re-indent it to the begin marker and make
    /// sure it ends with a newline.
    Indent,
}

impl BlockFit {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "verbatim" => Some(BlockFit::Verbatim),
            "indent" => Some(BlockFit::Indent),
            _ => None,
        }
    }
}

/// Apply `patch` to `parent`, replacing block interiors verbatim.
pub fn apply(parent: &str, patch: &PatchDescriptor) -> String {
    apply_with(parent, patch, BlockFit::Verbatim)
}

pub fn apply_with(parent: &str, patch: &PatchDescriptor, fit: BlockFit) -> String {
    let replacements = match patch {
        PatchDescriptor::Full(code) => return code.clone(),
        PatchDescriptor::Blocks(replacements) => replacements,
    };
    if replacements.is_empty() {
        return parent.to_string();
    }

    let mut segments = blocks::parse(parent);
    let mut touched = false;
    for segment in segments.iter_mut() {
        if let Segment::Block(block) = segment {
            if let Some(replacement) = replacements.get(&block.id) {
                block.interior = match fit {
                    BlockFit::Verbatim => terminate_lines(replacement, line_ending(&block.begin)),
                    BlockFit::Indent => fit_interior(block.indent(), replacement),
                };
                touched = true;
            }
        }
    }
    if !touched {
        return parent.to_string();
    }
    blocks::render(&segments)
}

fn line_ending(line: &str) -> &'static str {
    if line.ends_with("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

/// The end marker must start its own line, so a non-empty interior always
/// ends with a line terminator.
fn terminate_lines(replacement: &str, ending: &str) -> String {
    let mut interior = replacement.to_string();
    if !interior.is_empty() && !interior.ends_with('\n') {
        interior.push_str(ending);
    }
    interior
}

/// Apply an untrusted patch; a malformed one leaves `parent` unchanged.
pub fn apply_raw(parent: &str, raw: RawPatch, fit: BlockFit) -> String {
    match PatchDescriptor::try_from(raw) {
        Ok(patch) => apply_with(parent, &patch, fit),
        Err(_) => parent.to_string(),
    }
}

/// Re-indent `replacement` under a marker indented by `indent`.
pub fn fit_interior(indent: &str, replacement: &str) -> String {
    if replacement.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = replacement.lines().collect();
    let common = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);

    let mut out = String::with_capacity(replacement.len() + lines.len() * indent.len());
    for line in lines {
        if line.trim().is_empty() {
            out.push('\n');
            continue;
        }
        out.push_str(indent);
        out.push_str(&line[common..]);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_patch_shapes() {
        assert_eq!(
            PatchDescriptor::try_from(RawPatch::full("x")),
            Ok(PatchDescriptor::Full("x".to_string()))
        );
        assert_eq!(PatchDescriptor::try_from(RawPatch::default()), Err(MalformedPatch::Empty));
        let both = RawPatch {
            code: Some("x".to_string()),
            blocks: Some(BTreeMap::new()),
        };
        assert_eq!(PatchDescriptor::try_from(both), Err(MalformedPatch::Ambiguous));
    }

    #[test]
    fn test_from_value_is_lenient() {
        let raw = RawPatch::from_value(&json!({
            "blocks": {"a": "one", "b": 2},
            "code": null,
            "notes": "ignored"
        }));
        assert_eq!(raw.code, None);
        let blocks = raw.blocks.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks["a"], "one");

        let raw = RawPatch::from_value(&json!({"full": "program"}));
        assert_eq!(raw.code.as_deref(), Some("program"));

        let raw = RawPatch::from_value(&json!({"code": null, "full": "fallback"}));
        assert_eq!(raw.code.as_deref(), Some("fallback"));
        assert_eq!(PatchDescriptor::try_from(raw), Ok(PatchDescriptor::Full("fallback".to_string())));

        let raw = RawPatch::from_value(&json!(["not", "an", "object"]));
        assert_eq!(raw, RawPatch::default());
    }

    #[test]
    fn test_from_model_output_strips_fence() {
        let raw = RawPatch::from_model_output("```json\n{\"code\": \"x = 1\"}\n```").unwrap();
        assert_eq!(raw.code.as_deref(), Some("x = 1"));
        assert!(RawPatch::from_model_output("sorry, I cannot help").is_err());
    }

    #[test]
    fn test_fit_interior_reindents() {
        assert_eq!(
            fit_interior("    ", "def decide(self):\n    return 2"),
            "    def decide(self):\n        return 2\n"
        );
        assert_eq!(fit_interior("", "  a\n\n  b\n"), "a\n\nb\n");
        assert_eq!(fit_interior("  ", ""), "");
    }

    #[test]
    fn test_fit_interior_keeps_fitted_text() {
        let fitted = "    x = 1\n    if x:\n        y = 2\n";
        assert_eq!(fit_interior("    ", fitted), fitted);
    }

    #[test]
    fn test_verbatim_interior_keeps_end_marker_on_its_own_line() {
        let parent = "# === EVOLVE-BLOCK: d ===\nreturn 1\n# === END EVOLVE-BLOCK ===\n";
        let patch = PatchDescriptor::Blocks([("d".to_string(), "return 2".to_string())].into_iter().collect());
        let child = apply(parent, &patch);
        assert_eq!(child, "# === EVOLVE-BLOCK: d ===\nreturn 2\n# === END EVOLVE-BLOCK ===\n");

        let crlf = "# === EVOLVE-BLOCK: d ===\r\nreturn 1\r\n# === END EVOLVE-BLOCK ===\r\n";
        assert_eq!(
            apply(crlf, &patch),
            "# === EVOLVE-BLOCK: d ===\r\nreturn 2\r\n# === END EVOLVE-BLOCK ===\r\n"
        );

        let empty = PatchDescriptor::Blocks([("d".to_string(), String::new())].into_iter().collect());
        assert_eq!(apply(parent, &empty), "# === EVOLVE-BLOCK: d ===\n# === END EVOLVE-BLOCK ===\n");
    }

    #[test]
    fn test_block_fit_parse() {
        assert_eq!(BlockFit::parse("Indent"), Some(BlockFit::Indent));
        assert_eq!(BlockFit::parse("verbatim"), Some(BlockFit::Verbatim));
        assert_eq!(BlockFit::parse("fuzzy"), None);
    }
}
