//! Splits template HTML at `<fragment name="..."/>` placeholders.

use std::collections::HashMap;

use bytes::Bytes;

use super::{Segment, Slot};
use crate::error::ConfigError;

const OPEN: &str = "<fragment";

/// Turns `html` into segments, substituting each placeholder with the slot
/// it names. Every slot in `slots` must be placed exactly once.
pub(super) fn assemble(
    template: &str,
    html: &str,
    slots: Vec<Slot>,
) -> Result<Vec<Segment>, ConfigError> {
    let markup_error = |reason: String| ConfigError::Markup {
        template: template.to_owned(),
        reason,
    };

    let mut defined: HashMap<String, Slot> = HashMap::with_capacity(slots.len());
    for slot in slots {
        let name = slot.name().to_owned();
        if defined.insert(name.clone(), slot).is_some() {
            return Err(ConfigError::DuplicateSlot {
                template: template.to_owned(),
                slot: name,
            });
        }
    }

    let mut segments = Vec::new();
    let mut rest = html;

    while let Some(start) = find_placeholder(rest) {
        let (literal, tag) = rest.split_at(start);
        if !literal.is_empty() {
            segments.push(Segment::Literal(Bytes::copy_from_slice(literal.as_bytes())));
        }

        let end = tag
            .find('>')
            .ok_or_else(|| markup_error("unterminated <fragment> placeholder".into()))?;
        let inner = &tag[OPEN.len()..end];
        let Some(attrs) = inner.trim_end().strip_suffix('/') else {
            return Err(markup_error(
                "<fragment> placeholders must be self-closing (`/>`)".into(),
            ));
        };

        let name = attribute(attrs, "name")
            .ok_or_else(|| markup_error("<fragment> placeholder without a name".into()))?;
        let slot = match defined.remove(name) {
            Some(slot) => slot,
            None if segments.iter().any(|s| is_slot_named(s, name)) => {
                return Err(ConfigError::DuplicateSlot {
                    template: template.to_owned(),
                    slot: name.to_owned(),
                });
            }
            None => return Err(markup_error(format!("placeholder names unknown slot `{name}`"))),
        };
        segments.push(Segment::slot(slot));

        rest = &tag[end + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(Bytes::copy_from_slice(rest.as_bytes())));
    }

    if let Some(unused) = defined.keys().min() {
        return Err(markup_error(format!("slot `{unused}` is never placed")));
    }

    Ok(segments)
}

// Offset of the next `<fragment` that is a whole tag name (not `<fragments>`).
fn find_placeholder(html: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(found) = html[offset..].find(OPEN) {
        let start = offset + found;
        let after = html[start + OPEN.len()..].chars().next();
        if matches!(after, Some(c) if c.is_ascii_whitespace() || c == '/' || c == '>') {
            return Some(start);
        }
        offset = start + OPEN.len();
    }
    None
}

fn is_slot_named(segment: &Segment, name: &str) -> bool {
    matches!(segment, Segment::Slot(slot) if slot.name() == name)
}

/// Looks up `key` in an attribute list such as ` id='a' name="nav" async`.
fn attribute<'a>(attrs: &'a str, key: &str) -> Option<&'a str> {
    let mut rest = attrs.trim_start();
    while !rest.is_empty() {
        let name_end = rest
            .find(|c: char| c == '=' || c.is_ascii_whitespace())
            .unwrap_or(rest.len());
        let (name, after) = rest.split_at(name_end);
        let after = after.trim_start();

        let Some(value_part) = after.strip_prefix('=') else {
            // Bare attribute without a value.
            rest = after;
            continue;
        };
        let value_part = value_part.trim_start();
        let (value, remaining) = match value_part.chars().next() {
            Some(q @ ('"' | '\'')) => {
                let body = &value_part[1..];
                let close = body.find(q)?;
                (&body[..close], &body[close + 1..])
            }
            _ => {
                let end = value_part
                    .find(|c: char| c.is_ascii_whitespace())
                    .unwrap_or(value_part.len());
                value_part.split_at(end)
            }
        };

        if name.eq_ignore_ascii_case(key) {
            return Some(value);
        }
        rest = remaining.trim_start();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(name: &str) -> Slot {
        Slot::new(name, format!("http://fragments/{name}")).fallback("")
    }

    fn describe(segments: &[Segment]) -> Vec<String> {
        segments
            .iter()
            .map(|s| match s {
                Segment::Literal(b) => String::from_utf8(b.to_vec()).unwrap(),
                Segment::Slot(slot) => format!("[{}]", slot.name()),
            })
            .collect()
    }

    #[test]
    fn splits_around_placeholders() {
        let segments = assemble(
            "index",
            r#"<html><fragment name="nav"/><main><fragment id='x' name='body' /></main></html>"#,
            vec![slot("body"), slot("nav")],
        )
        .unwrap();
        assert_eq!(
            describe(&segments),
            vec!["<html>", "[nav]", "<main>", "[body]", "</main></html>"]
        );
    }

    #[test]
    fn adjacent_and_edge_placeholders() {
        let segments = assemble(
            "t",
            "<fragment name=a/><fragment name=b/>",
            vec![slot("a"), slot("b")],
        )
        .unwrap();
        assert_eq!(describe(&segments), vec!["[a]", "[b]"]);
    }

    #[test]
    fn similarly_named_tags_are_literal() {
        let segments = assemble("t", "<fragments></fragments>", vec![]).unwrap();
        assert_eq!(describe(&segments), vec!["<fragments></fragments>"]);
    }

    #[test]
    fn bare_attributes_are_skipped() {
        assert_eq!(attribute(" async name=\"nav\"", "name"), Some("nav"));
        assert_eq!(attribute(" primary", "name"), None);
    }

    #[test]
    fn rejects_unknown_slot() {
        let err = assemble("t", r#"<fragment name="nav"/>"#, vec![]).unwrap_err();
        assert!(matches!(err, ConfigError::Markup { ref reason, .. } if reason.contains("unknown slot `nav`")));
    }

    #[test]
    fn rejects_slot_placed_twice() {
        let err = assemble(
            "t",
            r#"<fragment name="nav"/><fragment name="nav"/>"#,
            vec![slot("nav")],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateSlot { ref slot, .. } if slot == "nav"));
    }

    #[test]
    fn rejects_duplicate_definitions() {
        let err = assemble("t", r#"<fragment name="nav"/>"#, vec![slot("nav"), slot("nav")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateSlot { .. }));
    }

    #[test]
    fn rejects_unplaced_slot() {
        let err = assemble("t", "<html></html>", vec![slot("footer")]).unwrap_err();
        assert!(matches!(err, ConfigError::Markup { ref reason, .. } if reason.contains("footer")));
    }

    #[test]
    fn rejects_malformed_placeholders() {
        for html in [
            r#"<fragment name="nav">"#,
            r#"<fragment name="nav""#,
            r#"<fragment src="x"/>"#,
        ] {
            let err = assemble("t", html, vec![slot("nav")]).unwrap_err();
            assert!(matches!(err, ConfigError::Markup { .. }), "{html}");
        }
    }
}
