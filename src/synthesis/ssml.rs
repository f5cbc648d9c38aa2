//! Safety filter for speech-markup payloads.
//!
//! Text is escaped, tags are limited to [`ALLOWED_TAGS`], and tag structure
//! must balance. Malformed structure is never rejected: every tag is dropped
//! and the plain text is re-wrapped in `<speak>`.

pub const ALLOWED_TAGS: &[&str] = &["speak", "prosody", "break", "emphasis", "say-as"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node<'a> {
    Text(&'a str),
    Tag(Tag),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Tag {
    name: String,
    attrs: Vec<(String, String)>,
    closing: bool,
    self_closing: bool,
}

impl Tag {
    fn render(&self) -> String {
        if self.closing {
            return format!("</{}>", self.name);
        }
        let mut out = format!("<{}", self.name);
        for (key, value) in &self.attrs {
            out.push_str(&format!(" {key}=\"{value}\""));
        }
        out.push_str(if self.self_closing { "/>" } else { ">" });
        out
    }

    fn allowed(&self) -> bool {
        ALLOWED_TAGS.contains(&self.name.as_str())
    }
}

/// Escape the five markup-significant characters.
#[must_use]
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Like [`escape_text`] but leaves well-formed entities untouched.
fn escape_preserving_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        if c == '&' {
            if let Some(len) = entity_len(rest) {
                out.push_str(&rest[..len]);
                rest = &rest[len..];
                continue;
            }
        }
        out.push_str(&escape_text(&rest[..c.len_utf8()]));
        rest = &rest[c.len_utf8()..];
    }
    out
}

fn entity_len(s: &str) -> Option<usize> {
    let end = s.find(';')?;
    let body = &s[1..end];
    let valid = match body.strip_prefix('#') {
        Some(num) => !num.is_empty() && num.chars().all(|c| c.is_ascii_alphanumeric()),
        None => matches!(body, "amp" | "lt" | "gt" | "quot" | "apos"),
    };
    valid.then_some(end + 1)
}

fn parse_tag(inner: &str) -> Option<Tag> {
    let (closing, inner) = match inner.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, inner),
    };
    let (self_closing, inner) = match inner.trim_end().strip_suffix('/') {
        Some(rest) => (true, rest),
        None => (false, inner),
    };
    let mut parts = inner.split_whitespace();
    let name = parts.next()?.to_ascii_lowercase();
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }
    let attrs = parts.filter_map(parse_attr).collect();
    Some(Tag {
        name,
        attrs,
        closing,
        self_closing,
    })
}

/// Only `key="value"` pairs with a plain key and a value free of markup
/// characters survive.
fn parse_attr(raw: &str) -> Option<(String, String)> {
    let (key, value) = raw.split_once('=')?;
    let value = value.strip_prefix('"')?.strip_suffix('"')?;
    let key_ok = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    let value_ok = !value.chars().any(|c| matches!(c, '"' | '<' | '>' | '&'));
    (key_ok && value_ok).then(|| (key.to_ascii_lowercase(), value.to_string()))
}

fn tokenize(ssml: &str) -> Vec<Node<'_>> {
    let mut nodes = Vec::new();
    let mut rest = ssml;
    while !rest.is_empty() {
        let Some(open) = rest.find('<') else {
            nodes.push(Node::Text(rest));
            break;
        };
        if open > 0 {
            nodes.push(Node::Text(&rest[..open]));
        }
        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            // an unterminated '<' is plain text
            nodes.push(Node::Text(&rest[open..]));
            break;
        };
        match parse_tag(&after[..close]) {
            Some(tag) => nodes.push(Node::Tag(tag)),
            None => nodes.push(Node::Text(&rest[open..=open + 1 + close])),
        }
        rest = &after[close + 1..];
    }
    nodes
}

fn balanced<'a>(tags: impl Iterator<Item = &'a Tag>) -> bool {
    let mut stack: Vec<&str> = Vec::new();
    for tag in tags {
        if tag.self_closing {
            continue;
        }
        if tag.closing {
            if stack.pop() != Some(tag.name.as_str()) {
                return false;
            }
        } else {
            stack.push(&tag.name);
        }
    }
    stack.is_empty()
}

/// Whether every opening tag has a matching, properly nested closing tag.
#[must_use]
pub fn is_balanced(ssml: &str) -> bool {
    let nodes = tokenize(ssml);
    let well_formed_brackets = nodes.iter().all(|n| match n {
        Node::Text(t) => !t.contains('<') && !t.contains('>'),
        Node::Tag(_) => true,
    });
    well_formed_brackets
        && balanced(nodes.iter().filter_map(|n| match n {
            Node::Tag(tag) => Some(tag),
            Node::Text(_) => None,
        }))
}

/// Drop every tag outside [`ALLOWED_TAGS`], keeping its text content.
#[must_use]
pub fn strip_disallowed_tags(ssml: &str) -> String {
    tokenize(ssml)
        .into_iter()
        .map(|node| match node {
            Node::Text(text) => escape_preserving_entities(text),
            Node::Tag(tag) if tag.allowed() => tag.render(),
            Node::Tag(_) => String::new(),
        })
        .collect()
}

fn plain_text(nodes: &[Node<'_>]) -> String {
    let joined: Vec<&str> = nodes
        .iter()
        .filter_map(|n| match n {
            Node::Text(t) => Some(*t),
            Node::Tag(_) => None,
        })
        .collect();
    joined.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Produce a payload that is safe to send to a markup-aware synthesizer.
#[must_use]
pub fn sanitize(ssml: &str) -> String {
    let nodes = tokenize(ssml);
    let kept: Vec<&Tag> = nodes
        .iter()
        .filter_map(|n| match n {
            Node::Tag(tag) if tag.allowed() => Some(tag),
            _ => None,
        })
        .collect();

    if !balanced(kept.iter().copied()) {
        tracing::warn!("Unbalanced speech markup, stripping all tags");
        return render_plain(&plain_text(&nodes));
    }

    let body = strip_disallowed_tags(ssml);
    let body = body.trim();
    let wrapped = kept.first().is_some_and(|t| t.name == "speak" && !t.closing)
        && body.starts_with("<speak")
        && body.ends_with("</speak>");
    if wrapped {
        body.to_string()
    } else {
        format!("<speak>{body}</speak>")
    }
}

/// Wrap plain caller- or model-originated text as a minimal safe payload.
#[must_use]
pub fn render_plain(text: &str) -> String {
    format!("<speak>{}</speak>", escape_preserving_entities(text.trim()))
}
