//! Evolve-block model.
//!
//! A program's text is read as a sequence of segments: literal runs that are
//! copied verbatim, and named blocks delimited by marker lines such as
//!
//! ```text
//!     # === EVOLVE-BLOCK: decision_logic ===========
//!     def decide(self):
//!         return 1
//!     # === END EVOLVE-BLOCK =========================
//! ```
//!
//! Parsing never fails. Unterminated or stray markers stay in the literal
//! text, and `render(&parse(text)) == text` for every input.

/// Token that opens a block; the identifier follows it on the same line.
pub const BEGIN_SENTINEL: &str = "EVOLVE-BLOCK:";
/// Token that closes the innermost open block.
pub const END_SENTINEL: &str = "END EVOLVE-BLOCK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Block(Block),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: String,
    /// Full begin-marker line, including its line terminator.
    pub begin: String,
    /// Everything between the two marker lines, exactly as written.
    pub interior: String,
    /// Full end-marker line, including its terminator when present.
    pub end: String,
}

impl Block {
    /// Leading whitespace of the begin marker.
    pub fn indent(&self) -> &str {
        let trimmed = self.begin.trim_start_matches([' ', '\t']);
        &self.begin[..self.begin.len() - trimmed.len()]
    }

    pub fn render_into(&self, out: &mut String) {
        out.push_str(&self.begin);
        out.push_str(&self.interior);
        out.push_str(&self.end);
    }
}

impl Segment {
    pub fn render_into(&self, out: &mut String) {
        match self {
            Segment::Literal(text) => out.push_str(text),
            Segment::Block(block) => block.render_into(out),
        }
    }

    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Segment::Block(block) => Some(block),
            Segment::Literal(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker<'a> {
    Begin(&'a str),
    End,
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn classify(line: &str) -> Option<Marker<'_>> {
    if line.contains(END_SENTINEL) {
        return Some(Marker::End);
    }
    let at = line.find(BEGIN_SENTINEL)?;
    let rest = line[at + BEGIN_SENTINEL.len()..].trim_start_matches([' ', '\t']);
    let len = rest.find(|c: char| !is_id_char(c)).unwrap_or(rest.len());
    if len == 0 {
        return None;
    }
    Some(Marker::Begin(&rest[..len]))
}

/// Split `text` into literal and block segments, left to right.
///
/// A begin marker pairs with the next marker line if that line is an end
/// marker. If the next marker is another begin marker, or there is none,
/// the begin line is literal text. Adjacent literal lines are merged.
pub fn parse(text: &str) -> Vec<Segment> {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let markers: Vec<Option<Marker<'_>>> = lines.iter().map(|line| classify(line)).collect();

    // next_marker[i] = index of the first marker line strictly after i
    let mut next_marker = vec![None; lines.len()];
    let mut upcoming = None;
    for i in (0..lines.len()).rev() {
        next_marker[i] = upcoming;
        if markers[i].is_some() {
            upcoming = Some(i);
        }
    }

    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut i = 0;
    while i < lines.len() {
        if let Some(Marker::Begin(id)) = markers[i] {
            if let Some(j) = next_marker[i].filter(|&j| markers[j] == Some(Marker::End)) {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Block(Block {
                    id: id.to_string(),
                    begin: lines[i].to_string(),
                    interior: lines[i + 1..j].concat(),
                    end: lines[j].to_string(),
                }));
                i = j + 1;
                continue;
            }
        }
        literal.push_str(lines[i]);
        i += 1;
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

pub fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        segment.render_into(&mut out);
    }
    out
}

/// Identifiers of all well-formed blocks, in document order.
pub fn block_ids(text: &str) -> Vec<String> {
    parse(text)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Block(block) => Some(block.id),
            Segment::Literal(_) => None,
        })
        .collect()
}

/// First well-formed block named `id`.
pub fn find_block(text: &str, id: &str) -> Option<Block> {
    parse(text).into_iter().find_map(|segment| match segment {
        Segment::Block(block) if block.id == id => Some(block),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRATEGY: &str = "class Strategy:\n    def __init__(self):\n        pass\n\n    # === EVOLVE-BLOCK: decision_logic =====\n    def decide(self):\n        return 1\n    # === END EVOLVE-BLOCK =====\n";

    #[test]
    fn test_parse_single_block() {
        let segments = parse(STRATEGY);
        assert_eq!(segments.len(), 2);
        let block = segments[1].as_block().unwrap();
        assert_eq!(block.id, "decision_logic");
        assert_eq!(block.interior, "    def decide(self):\n        return 1\n");
        assert_eq!(block.indent(), "    ");
        assert!(block.begin.ends_with('\n'));
        assert_eq!(block.end, "    # === END EVOLVE-BLOCK =====\n");
    }

    #[test]
    fn test_round_trip() {
        let samples = [
            "",
            "no markers at all",
            "trailing newline\n",
            STRATEGY,
            "# EVOLVE-BLOCK: a\nx\n# END EVOLVE-BLOCK\nmid\n# EVOLVE-BLOCK: b\n\n\n# END EVOLVE-BLOCK",
            "# EVOLVE-BLOCK: open\nnever closed\n",
            "# END EVOLVE-BLOCK\nstray end first\n",
            "crlf\r\n# EVOLVE-BLOCK: w\r\nbody\r\n# END EVOLVE-BLOCK\r\n",
        ];
        for sample in samples {
            assert_eq!(render(&parse(sample)), sample, "round trip failed for {:?}", sample);
        }
    }

    #[test]
    fn test_unterminated_begin_is_literal() {
        let text = "head\n# EVOLVE-BLOCK: open\nbody\n";
        assert_eq!(parse(text), vec![Segment::Literal(text.to_string())]);
        assert!(block_ids(text).is_empty());
    }

    #[test]
    fn test_second_begin_closes_nothing() {
        let text = "# EVOLVE-BLOCK: outer\n# EVOLVE-BLOCK: inner\nx\n# END EVOLVE-BLOCK\n";
        assert_eq!(block_ids(text), vec!["inner".to_string()]);
        let segments = parse(text);
        assert_eq!(segments[0], Segment::Literal("# EVOLVE-BLOCK: outer\n".to_string()));
    }

    #[test]
    fn test_marker_without_identifier_is_literal() {
        let text = "# EVOLVE-BLOCK: ===\nx\n# END EVOLVE-BLOCK\n";
        assert!(block_ids(text).is_empty());
    }

    #[test]
    fn test_empty_interior_and_unterminated_end_line() {
        let text = "# EVOLVE-BLOCK: empty\n# END EVOLVE-BLOCK";
        let block = find_block(text, "empty").unwrap();
        assert_eq!(block.interior, "");
        assert_eq!(block.end, "# END EVOLVE-BLOCK");
    }

    #[test]
    fn test_block_ids_in_order() {
        let text = "# EVOLVE-BLOCK: b\n1\n# END EVOLVE-BLOCK\n# EVOLVE-BLOCK: a.v2\n2\n# END EVOLVE-BLOCK\n";
        assert_eq!(block_ids(text), vec!["b".to_string(), "a.v2".to_string()]);
        assert_eq!(find_block(text, "a.v2").unwrap().interior, "2\n");
        assert!(find_block(text, "c").is_none());
    }
}
