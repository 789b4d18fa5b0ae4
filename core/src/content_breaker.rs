//! Pure utilities for finding logical break points in a content buffer.
//!
//! The content executor asks this module where a post body can be cut when
//! it outgrows the platform's limits. Break-point priority: tool-result
//! marker > heading > code-block close > paragraph break > line break.
//! Inside an open fence only a code-block close is accepted.

/// Line-count ceiling before a buffer should be flushed early.
pub const MAX_LINES: usize = 15;

/// Never split a post below this many bytes; tiny fragments read badly.
pub const MIN_SPLIT: usize = 200;

/// Soft byte threshold, kept under the platform's hard limit so a logical
/// break can still be found once the buffer crosses it.
pub fn soft_limit(hard_bytes: usize) -> usize {
    hard_bytes * 3 / 4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BreakKind {
    LineBreak,
    Paragraph,
    CodeBlockEnd,
    Heading,
    ToolMarker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    /// Byte offset to cut at; everything before it stays in the first part.
    pub pos: usize,
    pub kind: BreakKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlockState {
    pub inside: bool,
    /// Byte offset of the line that opened the current fence.
    pub open_pos: Option<usize>,
    pub language: Option<String>,
}

/// What the buffer currently ends with, used to decide whether a separator
/// is needed before the next block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingBreak {
    ToolMarker,
    CodeBlockEnd,
    Paragraph,
    None,
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

fn is_heading(line: &str) -> bool {
    let trimmed = line.trim_start_matches('#');
    line.starts_with('#') && trimmed.starts_with(' ')
}

fn is_tool_marker(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("↳ ✓") || trimmed.starts_with("↳ ❌")
}

/// Scan fences from the start of `text` and report whether `pos` sits
/// inside an open code block.
pub fn get_code_block_state(text: &str, pos: usize) -> CodeBlockState {
    let mut state = CodeBlockState {
        inside: false,
        open_pos: None,
        language: None,
    };
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if offset >= pos {
            break;
        }
        let trimmed = line.trim_end_matches('\n');
        if is_fence(trimmed) {
            if state.inside {
                state = CodeBlockState {
                    inside: false,
                    open_pos: None,
                    language: None,
                };
            } else {
                let language = trimmed.trim_start().trim_start_matches("```").trim();
                state = CodeBlockState {
                    inside: true,
                    open_pos: Some(offset),
                    language: (!language.is_empty()).then(|| language.to_string()),
                };
            }
        }
        offset += line.len();
    }
    state
}

/// Find the best logical break in `text` within `[start_pos, start_pos +
/// max_look_ahead]`. Highest-priority kind wins; within a kind, the latest
/// position wins so the first part is as full as possible.
pub fn find_logical_breakpoint(
    text: &str,
    start_pos: usize,
    max_look_ahead: usize,
) -> Option<Breakpoint> {
    let window_end = (start_pos + max_look_ahead).min(text.len());
    let mut best: Option<Breakpoint> = None;
    let mut offset = 0;

    // Walk from the start so fence state is exact at every candidate line.
    let mut fence = CodeBlockState {
        inside: false,
        open_pos: None,
        language: None,
    };
    let mut prev_blank = false;
    for line in text.split_inclusive('\n') {
        let line_end = offset + line.len();
        let trimmed = line.trim_end_matches('\n');
        let fence_line = is_fence(trimmed);

        let candidate = if fence_line && fence.inside {
            // Closing fence: break *after* the fence line.
            Some(Breakpoint {
                pos: line_end,
                kind: BreakKind::CodeBlockEnd,
            })
        } else if fence_line || fence.inside {
            // An opening fence belongs with its body; nothing inside an
            // open fence is breakable.
            None
        } else if is_tool_marker(trimmed) {
            Some(Breakpoint {
                pos: line_end,
                kind: BreakKind::ToolMarker,
            })
        } else if is_heading(trimmed) && offset > 0 {
            // Break *before* a heading so it starts the next post.
            Some(Breakpoint {
                pos: offset,
                kind: BreakKind::Heading,
            })
        } else if trimmed.is_empty() && !prev_blank && offset > 0 {
            Some(Breakpoint {
                pos: line_end,
                kind: BreakKind::Paragraph,
            })
        } else if line.ends_with('\n') {
            Some(Breakpoint {
                pos: line_end,
                kind: BreakKind::LineBreak,
            })
        } else {
            None
        };

        if let Some(bp) = candidate
            && bp.pos >= start_pos
            && bp.pos <= window_end
            && best.map(|b| (bp.kind, bp.pos) >= (b.kind, b.pos)).unwrap_or(true)
        {
            best = Some(bp);
        }

        if fence_line {
            if fence.inside {
                fence.inside = false;
                fence.open_pos = None;
            } else {
                fence.inside = true;
                fence.open_pos = Some(offset);
            }
        }
        prev_blank = trimmed.is_empty();
        offset = line_end;
        if offset > window_end {
            break;
        }
    }
    best
}

/// True when the buffer has grown enough that waiting for more content is
/// worse than flushing now.
pub fn should_flush_early(text: &str, soft_bytes: usize) -> bool {
    text.len() > soft_bytes || text.lines().count() > MAX_LINES
}

pub fn ends_at_breakpoint(text: &str) -> TrailingBreak {
    if text.ends_with("\n\n") {
        return TrailingBreak::Paragraph;
    }
    let last_line = text.trim_end_matches('\n').lines().last().unwrap_or("");
    if is_tool_marker(last_line) {
        TrailingBreak::ToolMarker
    } else if is_fence(last_line) && !get_code_block_state(text, text.len()).inside {
        TrailingBreak::CodeBlockEnd
    } else {
        TrailingBreak::None
    }
}

const LINE_HEIGHT_PX: u32 = 20;
const HEADING_HEIGHT_PX: u32 = 32;
const BLANK_HEIGHT_PX: u32 = 8;
const WRAP_COLUMNS: usize = 100;

/// Bounded heuristic for how tall a body renders: headings are taller,
/// blank lines shorter, long lines wrap at ~100 columns.
pub fn estimate_rendered_height(text: &str) -> u32 {
    let mut height = 0u32;
    let mut in_fence = false;
    for line in text.lines() {
        if is_fence(line) {
            in_fence = !in_fence;
            height += LINE_HEIGHT_PX;
        } else if in_fence {
            height += LINE_HEIGHT_PX;
        } else if line.trim().is_empty() {
            height += BLANK_HEIGHT_PX;
        } else if is_heading(line) {
            height += HEADING_HEIGHT_PX;
        } else {
            let wraps = line.chars().count().div_ceil(WRAP_COLUMNS).max(1) as u32;
            height += wraps * LINE_HEIGHT_PX;
        }
    }
    height
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitDecision {
    /// Cut at this byte offset.
    At(usize),
    /// The whole body is one open fence from position 0; updating in place
    /// is the only safe option.
    UpdateWhole,
}

/// Largest char boundary at or below `pos`.
pub fn floor_char_boundary(text: &str, pos: usize) -> usize {
    let mut pos = pos.min(text.len());
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Decide where to split a body that exceeds the hard limit.
pub fn choose_split(text: &str, hard_bytes: usize) -> SplitDecision {
    let limit = floor_char_boundary(text, hard_bytes);
    let state = get_code_block_state(text, limit);
    if state.inside && state.open_pos == Some(0) {
        return SplitDecision::UpdateWhole;
    }

    if let Some(bp) = find_logical_breakpoint(text, MIN_SPLIT, limit.saturating_sub(MIN_SPLIT))
        && bp.pos < text.len()
    {
        return SplitDecision::At(bp.pos);
    }

    // No logical break: last newline before the hard limit.
    if let Some(idx) = text[..limit].rfind('\n') {
        return SplitDecision::At(idx + 1);
    }

    // Degenerate single-line body: cut at the limit.
    SplitDecision::At(limit)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fence_state_tracks_open_and_close() {
        let text = "before\n```rust\nlet x = 1;\n```\nafter\n";
        assert!(!get_code_block_state(text, 3).inside);
        let inside = get_code_block_state(text, 20);
        assert!(inside.inside);
        assert_eq!(inside.open_pos, Some(7));
        assert_eq!(inside.language.as_deref(), Some("rust"));
        assert!(!get_code_block_state(text, text.len()).inside);
    }

    #[test]
    fn tool_marker_beats_paragraph() {
        let text = "intro text\n\nmiddle\n  ↳ ✓ (4s)\nmore\n\nend\n";
        let marker_end = text.find("(4s)\n").unwrap() + "(4s)\n".len();
        let bp = find_logical_breakpoint(text, 0, text.len()).unwrap();
        assert_eq!(bp.kind, BreakKind::ToolMarker);
        assert_eq!(bp.pos, marker_end);
    }

    #[test]
    fn paragraph_and_line_breaks_are_rejected_inside_fences() {
        let text = "```\ncode\n\nmore code\n";
        assert!(find_logical_breakpoint(text, 0, text.len()).is_none());
    }

    #[test]
    fn closing_fence_is_the_break_inside_a_block() {
        let text = "```\ncode\n```\ntail\n";
        let bp = find_logical_breakpoint(text, 0, 13).unwrap();
        assert_eq!(bp.kind, BreakKind::CodeBlockEnd);
        assert_eq!(bp.pos, text.find("tail").unwrap());
    }

    #[test]
    fn heading_break_lands_before_the_heading() {
        let text = "some prose\n## Next section\nbody\n";
        let bp = find_logical_breakpoint(text, 0, text.len()).unwrap();
        assert_eq!(bp.kind, BreakKind::Heading);
        assert_eq!(bp.pos, text.find("## ").unwrap());
    }

    #[test]
    fn should_flush_early_on_size_or_lines() {
        assert!(should_flush_early(&"x".repeat(501), 500));
        assert!(!should_flush_early("short", 500));
        let many_lines = "a\n".repeat(MAX_LINES + 1);
        assert!(should_flush_early(&many_lines, 10_000));
    }

    #[test]
    fn ends_at_breakpoint_detects_trailing_shapes() {
        assert_eq!(ends_at_breakpoint("a\n\n"), TrailingBreak::Paragraph);
        assert_eq!(ends_at_breakpoint("  ↳ ✓ (3s)"), TrailingBreak::ToolMarker);
        assert_eq!(ends_at_breakpoint("```\ncode\n```"), TrailingBreak::CodeBlockEnd);
        assert_eq!(ends_at_breakpoint("plain"), TrailingBreak::None);
    }

    #[test]
    fn whole_body_fence_is_never_split() {
        let body = format!("```\n{}\n", "line\n".repeat(200));
        assert_eq!(choose_split(&body, 400), SplitDecision::UpdateWhole);
    }

    #[test]
    fn split_falls_back_to_last_newline() {
        // One giant paragraph of single-character lines: only line breaks.
        let body = "word words more\n".repeat(60);
        match choose_split(&body, 500) {
            SplitDecision::At(pos) => {
                assert!(pos <= 500);
                assert!(pos >= MIN_SPLIT);
                assert_eq!(&body[pos - 1..pos], "\n");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn heading_height_is_taller_than_text() {
        assert!(estimate_rendered_height("# Title") > estimate_rendered_height("title"));
        let wrapped = "x".repeat(250);
        assert_eq!(estimate_rendered_height(&wrapped), 3 * 20);
    }
}
