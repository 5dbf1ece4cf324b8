//! Byte budgeting for the rendered context bundle.

use tracing::debug;

/// One named block of the context bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Stable identifier, also used as the XML-ish wrapper tag when rendered.
    pub key: &'static str,
    /// Required sections are never dropped (they may still be truncated).
    pub required: bool,
    pub content: String,
}

impl Section {
    pub fn required(key: &'static str, content: impl Into<String>) -> Self {
        Self {
            key,
            required: true,
            content: content.into(),
        }
    }

    pub fn droppable(key: &'static str, content: impl Into<String>) -> Self {
        Self {
            key,
            required: false,
            content: content.into(),
        }
    }
}

/// Sections wrapped in tags named after their keys, separated by blank lines.
pub fn render_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| format!("<{key}>\n{}\n</{key}>", s.content.trim_end(), key = s.key))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Upper bound on `render_sections(sections).len()` without rendering.
fn rendered_len(sections: &[Section]) -> usize {
    let wrapped: usize = sections
        .iter()
        .map(|s| s.content.len() + 2 * s.key.len() + WRAPPER_LEN)
        .sum();
    wrapped + SEPARATOR_LEN * sections.len().saturating_sub(1)
}

/// `<>` + `\n` + `\n` + `</>`.
const WRAPPER_LEN: usize = 7;
const SEPARATOR_LEN: usize = 2;

/// Shrink `sections` so their rendering fits `budget` bytes.
///
/// Droppable sections are removed in `drop_order`; while still over budget, the largest
/// remaining section is truncated on a char boundary with a `[truncated]` marker. A budget
/// smaller than the wrappers themselves leaves every section reduced to the marker.
pub fn apply_budget(sections: &mut Vec<Section>, budget: usize, drop_order: &[&str]) {
    if rendered_len(sections) <= budget {
        return;
    }

    for key in drop_order {
        if rendered_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    loop {
        let total = rendered_len(sections);
        if total <= budget {
            return;
        }
        let Some(largest) = sections
            .iter_mut()
            .filter(|s| s.content.len() > MARKER_TEXT.len())
            .max_by_key(|s| s.content.len())
        else {
            debug!(total, budget, "budget unreachable, every section already truncated");
            return;
        };
        let before_len = largest.content.len();
        let allowed = before_len.saturating_sub(total - budget);
        truncate_with_marker(&mut largest.content, allowed);
        debug!(
            section = largest.key,
            before_len,
            after_len = largest.content.len(),
            "truncated section for budget"
        );
    }
}

const MARKER_TEXT: &str = "[truncated]";
const MARKER: &str = "\n[truncated]";

/// Cut `content` to at most `allowed` bytes ending in the marker. Below the marker's own
/// length the content becomes the bare marker.
fn truncate_with_marker(content: &mut String, allowed: usize) {
    if content.len() <= allowed {
        return;
    }
    if allowed < MARKER.len() {
        *content = MARKER_TEXT.to_string();
        return;
    }
    let mut cut = allowed - MARKER.len();
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    content.truncate(cut);
    content.push_str(MARKER);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ten(c: &str) -> String {
        c.repeat(10)
    }

    #[test]
    fn rendered_len_matches_rendering() {
        let sections = vec![
            Section::required("goal", "reach the end"),
            Section::droppable("files", "--- a.js ---\nx"),
        ];
        assert_eq!(rendered_len(&sections), render_sections(&sections).len());
    }

    #[test]
    fn within_budget_is_untouched() {
        let mut sections = vec![Section::required("a", "xx"), Section::droppable("b", "yy")];
        let budget = render_sections(&sections).len();
        apply_budget(&mut sections, budget, &["b"]);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1].content, "yy");
    }

    #[test]
    fn drops_in_order_until_within_budget() {
        let mut sections = vec![
            Section::required("goal", ten("g")),
            Section::droppable("deps", ten("d")),
            Section::droppable("files", ten("f")),
        ];
        apply_budget(&mut sections, 60, &["deps", "files"]);
        let keys: Vec<_> = sections.iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["goal", "files"]);
        assert!(render_sections(&sections).len() <= 60);
    }

    #[test]
    fn required_sections_are_truncated_not_dropped() {
        let mut sections = vec![
            Section::required("files", "f".repeat(100)),
            Section::required("goal", ten("g")),
        ];
        apply_budget(&mut sections, 80, &["files"]);
        assert_eq!(sections.len(), 2);
        assert!(sections[0].content.ends_with("[truncated]"));
        assert!(render_sections(&sections).len() <= 80);
    }

    #[test]
    fn overflow_larger_than_one_section_truncates_several() {
        let mut sections = vec![
            Section::required("a", "a".repeat(30)),
            Section::required("b", "b".repeat(30)),
        ];
        apply_budget(&mut sections, 45, &[]);
        assert!(sections.iter().all(|s| s.content.ends_with("[truncated]")));
        assert!(render_sections(&sections).len() <= 45);
    }

    #[test]
    fn unreachable_budget_leaves_bare_markers() {
        let mut sections = vec![Section::required("x", "x".repeat(100))];
        apply_budget(&mut sections, 5, &[]);
        assert_eq!(sections[0].content, "[truncated]");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut content = "héllo wörld, héllo wörld".to_string();
        truncate_with_marker(&mut content, 16);
        assert!(content.len() <= 16);
        assert!(content.ends_with("[truncated]"));
    }
}
