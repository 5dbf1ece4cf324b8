//! Single-pass tokenizer for the model response tag grammar.
//!
//! Recognized tags (names are ASCII case-insensitive):
//!
//! - `<text>…</text>` reasoning notes
//! - `<file path="…">…</file>` whole-file writes
//! - `<cli>…</cli>` shell commands
//! - `<complete></complete>`, `<complete/>` or a lone `<complete>` marker
//! - `<upgradeModel provider="…">` escalation marker (attribute and closing tag optional)
//!
//! Everything else is prose and ignored. Malformed or unmatched tags never fail the
//! parse: they are skipped, logged, and listed in [`ParsedResponse::malformed`].

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::core::types::{Directive, ParsedResponse};

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("attribute regex should be valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagName {
    Text,
    File,
    Cli,
    Complete,
    UpgradeModel,
}

impl TagName {
    fn from_lowercase(name: &str) -> Option<Self> {
        match name {
            "text" => Some(TagName::Text),
            "file" => Some(TagName::File),
            "cli" => Some(TagName::Cli),
            "complete" => Some(TagName::Complete),
            "upgrademodel" => Some(TagName::UpgradeModel),
            _ => None,
        }
    }

    fn closing(self) -> &'static str {
        match self {
            TagName::Text => "</text>",
            TagName::File => "</file>",
            TagName::Cli => "</cli>",
            TagName::Complete => "</complete>",
            TagName::UpgradeModel => "</upgrademodel>",
        }
    }
}

/// An opening tag located at some byte offset.
struct OpenTag<'a> {
    name: TagName,
    /// Raw text between the tag name and the closing `>`.
    attrs: &'a str,
    /// Byte offset just past the `>`.
    end: usize,
    self_closing: bool,
}

/// Parse a raw model response into ordered directives.
pub fn parse_response(input: &str) -> ParsedResponse {
    let lower = input.to_ascii_lowercase();
    let mut parsed = ParsedResponse::default();
    let mut pos = 0usize;

    while let Some(rel) = input[pos..].find('<') {
        let start = pos + rel;

        if lower[start..].starts_with("</") {
            note_stray_closing(&lower, start, &mut parsed);
            pos = start + 1;
            continue;
        }

        let Some(tag) = read_open_tag(input, &lower, start, &mut parsed) else {
            pos = start + 1;
            continue;
        };

        pos = match tag.name {
            TagName::Complete => {
                parsed.complete = true;
                parsed.directives.push(Directive::CompleteSignal);
                skip_optional_closing(&lower, &tag)
            }
            TagName::UpgradeModel => {
                let provider = attribute(tag.attrs, "provider")
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty());
                parsed.upgrade = true;
                if parsed.provider_hint.is_none() {
                    parsed.provider_hint = provider.clone();
                }
                parsed.directives.push(Directive::UpgradeSignal { provider });
                skip_optional_closing(&lower, &tag)
            }
            TagName::Text | TagName::File | TagName::Cli => {
                read_element(input, &lower, start, &tag, &mut parsed)
            }
        };
    }

    debug!(
        directives = parsed.directives.len(),
        complete = parsed.complete,
        upgrade = parsed.upgrade,
        malformed = parsed.malformed.len(),
        "parsed response"
    );
    parsed
}

/// Return the provider named by the first `<upgradeModel provider="…">` marker, if any.
pub fn escalation_target(input: &str) -> Option<String> {
    parse_response(input).provider_hint
}

fn read_open_tag<'a>(
    input: &'a str,
    lower: &str,
    start: usize,
    parsed: &mut ParsedResponse,
) -> Option<OpenTag<'a>> {
    let after = &lower[start + 1..];
    let name_len = after
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .count();
    if name_len == 0 {
        return None;
    }
    let name = TagName::from_lowercase(&after[..name_len])?;
    let head_start = start + 1 + name_len;
    match input.as_bytes().get(head_start) {
        Some(b'>' | b'/') => {}
        Some(b) if b.is_ascii_whitespace() => {}
        _ => return None,
    }

    let Some(gt) = input[head_start..].find('>') else {
        record_malformed(
            parsed,
            format!("unterminated <{}> tag at byte {start}", tag_label(name)),
        );
        return None;
    };
    let gt = head_start + gt;
    let mut attrs = &input[head_start..gt];
    let self_closing = attrs.trim_end().ends_with('/');
    if self_closing {
        attrs = attrs.trim_end().trim_end_matches('/');
    }
    Some(OpenTag {
        name,
        attrs,
        end: gt + 1,
        self_closing,
    })
}

fn read_element(
    input: &str,
    lower: &str,
    start: usize,
    tag: &OpenTag<'_>,
    parsed: &mut ParsedResponse,
) -> usize {
    let label = tag_label(tag.name);
    if tag.self_closing {
        record_malformed(parsed, format!("empty self-closing <{label}/> at byte {start}"));
        return tag.end;
    }
    let closing = tag.name.closing();
    let Some(close_rel) = lower[tag.end..].find(closing) else {
        record_malformed(parsed, format!("unclosed <{label}> at byte {start}"));
        return tag.end;
    };
    let body = &input[tag.end..tag.end + close_rel];
    let next = tag.end + close_rel + closing.len();

    match tag.name {
        TagName::Text => {
            let content = body.trim();
            if !content.is_empty() {
                parsed.directives.push(Directive::TextNote {
                    content: content.to_string(),
                });
            }
        }
        TagName::Cli => {
            let command = body.trim();
            if command.is_empty() {
                record_malformed(parsed, format!("empty <cli> at byte {start}"));
            } else {
                parsed.directives.push(Directive::CliCommand {
                    command: command.to_string(),
                });
            }
        }
        TagName::File => match attribute(tag.attrs, "path").map(str::trim) {
            Some(path) if !path.is_empty() => {
                parsed.directives.push(Directive::FileWrite {
                    path: path.to_string(),
                    content: strip_leading_newline(body).to_string(),
                });
            }
            _ => record_malformed(parsed, format!("<file> without path at byte {start}")),
        },
        TagName::Complete | TagName::UpgradeModel => {}
    }
    next
}

/// Consume a closing tag that directly follows a marker tag (whitespace allowed).
fn skip_optional_closing(lower: &str, tag: &OpenTag<'_>) -> usize {
    if tag.self_closing {
        return tag.end;
    }
    let rest = &lower[tag.end..];
    let trimmed = rest.trim_start();
    let skipped_ws = rest.len() - trimmed.len();
    if trimmed.starts_with(tag.name.closing()) {
        return tag.end + skipped_ws + tag.name.closing().len();
    }
    tag.end
}

fn note_stray_closing(lower: &str, start: usize, parsed: &mut ParsedResponse) {
    for name in [TagName::Text, TagName::File, TagName::Cli] {
        if lower[start..].starts_with(name.closing()) {
            record_malformed(
                parsed,
                format!("unmatched </{}> at byte {start}", tag_label(name)),
            );
            return;
        }
    }
}

fn attribute<'a>(attrs: &'a str, key: &str) -> Option<&'a str> {
    ATTR_RE.captures_iter(attrs).find_map(|caps| {
        let name = caps.get(1)?.as_str();
        if !name.eq_ignore_ascii_case(key) {
            return None;
        }
        caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str())
    })
}

fn strip_leading_newline(body: &str) -> &str {
    body.strip_prefix("\r\n")
        .or_else(|| body.strip_prefix('\n'))
        .unwrap_or(body)
}

fn tag_label(name: TagName) -> &'static str {
    match name {
        TagName::Text => "text",
        TagName::File => "file",
        TagName::Cli => "cli",
        TagName::Complete => "complete",
        TagName::UpgradeModel => "upgradeModel",
    }
}

fn record_malformed(parsed: &mut ParsedResponse, message: String) {
    warn!(%message, "skipping malformed tag");
    parsed.malformed.push(message);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: &str) -> Directive {
        Directive::FileWrite {
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    fn cli(command: &str) -> Directive {
        Directive::CliCommand {
            command: command.to_string(),
        }
    }

    fn note(content: &str) -> Directive {
        Directive::TextNote {
            content: content.to_string(),
        }
    }

    #[test]
    fn preserves_directive_order_across_interleaved_prose() {
        let raw = "Sure! <text>added a route</text>\n\
                   <file path=\"src/a.js\">\nconst a = 1;\n</file>\n\
                   some prose <cli>npm i express</cli>\n\
                   <file path=\"src/b.js\">module.exports = {};</file>\
                   <cli>node -e 1</cli><complete></complete>";

        let parsed = parse_response(raw);

        assert_eq!(
            parsed.directives,
            vec![
                note("added a route"),
                file("src/a.js", "const a = 1;\n"),
                cli("npm i express"),
                file("src/b.js", "module.exports = {};"),
                cli("node -e 1"),
                Directive::CompleteSignal,
            ]
        );
        assert!(parsed.complete);
        assert!(!parsed.upgrade);
        assert!(parsed.malformed.is_empty());
    }

    #[test]
    fn file_body_is_verbatim_including_nested_tags() {
        let raw = "<file path='index.html'><div><cli>not a command</cli></div></file>";
        let parsed = parse_response(raw);
        assert_eq!(
            parsed.directives,
            vec![file("index.html", "<div><cli>not a command</cli></div>")]
        );
    }

    #[test]
    fn tag_names_are_case_insensitive() {
        let parsed = parse_response("<FILE PATH=\"x.txt\">x</File><CLI>ls</cli>");
        assert_eq!(parsed.directives, vec![file("x.txt", "x"), cli("ls")]);
    }

    #[test]
    fn unclosed_and_pathless_tags_are_skipped_not_fatal() {
        let parsed = parse_response("<cli>echo hi <file>oops</file> <text>kept</text>");
        assert_eq!(parsed.directives, vec![note("kept")]);
        assert_eq!(parsed.malformed.len(), 2);
        assert!(parsed.malformed[0].contains("unclosed <cli>"));
        assert!(parsed.malformed[1].contains("<file> without path"));
    }

    #[test]
    fn stray_closing_tags_are_reported() {
        let parsed = parse_response("prose </text> more </cli>");
        assert!(parsed.directives.is_empty());
        assert_eq!(parsed.malformed.len(), 2);
    }

    #[test]
    fn unknown_tags_with_known_prefixes_are_prose() {
        let parsed = parse_response("<textarea>x</textarea><clipboard>y</clipboard>");
        assert!(parsed.directives.is_empty());
        assert!(parsed.malformed.is_empty());
    }

    #[test]
    fn upgrade_marker_with_and_without_provider() {
        let parsed = parse_response("<text>stuck</text><upgradeModel></upgradeModel>");
        assert!(parsed.upgrade);
        assert_eq!(parsed.provider_hint, None);
        assert_eq!(
            parsed.directives.last(),
            Some(&Directive::UpgradeSignal { provider: None })
        );

        let parsed = parse_response("<upgradeModel provider=\"together\">");
        assert!(parsed.upgrade);
        assert_eq!(parsed.provider_hint.as_deref(), Some("together"));
        assert_eq!(
            escalation_target("x <upgradeModel provider=\"groq\"/>").as_deref(),
            Some("groq")
        );
    }

    #[test]
    fn complete_marker_variants() {
        for raw in [
            "<complete></complete>",
            "<complete/>",
            "<complete>",
            "<complete >\n</complete>",
        ] {
            let parsed = parse_response(raw);
            assert!(parsed.complete, "{raw} should mark completion");
            assert_eq!(parsed.directives, vec![Directive::CompleteSignal]);
            assert!(parsed.malformed.is_empty(), "{raw}: {:?}", parsed.malformed);
        }
    }

    #[test]
    fn empty_and_garbage_input_yield_no_directives() {
        assert_eq!(parse_response(""), ParsedResponse::default());
        let parsed = parse_response("<<<>>> < file <");
        assert!(parsed.directives.is_empty());
        assert!(!parsed.complete);
    }

    #[test]
    fn crlf_leading_newline_is_stripped_once() {
        let parsed = parse_response("<file path=\"a\">\r\n\nbody</file>");
        assert_eq!(parsed.directives, vec![file("a", "\nbody")]);
    }
}
