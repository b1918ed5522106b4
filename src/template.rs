//! Message strings as providers register them: text with `%N` insertion points.

use std::borrow::Cow;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    /// 1-based insert index.
    Insert(usize),
}

/// A compiled provider message.
///
/// `%1`..`%99` (optionally followed by a `!printf!` spec, which is ignored) are replaced by the
/// positional arguments. `%n`, `%t`, `%r` and `%b` are line break, tab, carriage return and
/// space; `%%`, `%.` and `%!` are literals and `%0` ends the message. An insert beyond the
/// argument list renders as the literal `%N` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    segments: Vec<Segment>,
}

impl MessageTemplate {
    pub fn compile(text: &str) -> MessageTemplate {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = text.char_indices().peekable();

        while let Some((_, c)) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }

            match chars.peek().map(|&(_, c)| c) {
                Some(d @ '1'..='9') => {
                    chars.next();
                    let mut index = d.to_digit(10).unwrap_or(0) as usize;
                    if let Some(&(_, d2)) = chars.peek() {
                        if let Some(v) = d2.to_digit(10) {
                            chars.next();
                            index = index * 10 + v as usize;
                        }
                    }
                    // Skip a `!fmt!` spec if it is terminated.
                    if chars.peek().map(|&(_, c)| c) == Some('!') {
                        let mut lookahead = chars.clone();
                        lookahead.next();
                        if lookahead.any(|(_, c)| c == '!') {
                            chars.next();
                            for (_, c) in chars.by_ref() {
                                if c == '!' {
                                    break;
                                }
                            }
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Insert(index));
                }
                Some('0') => break,
                Some(e) => {
                    chars.next();
                    match e {
                        'n' => literal.push_str("\r\n"),
                        't' => literal.push('\t'),
                        'r' => literal.push('\r'),
                        'b' => literal.push(' '),
                        '%' | '.' | '!' => literal.push(e),
                        other => {
                            literal.push('%');
                            literal.push(other);
                        }
                    }
                }
                None => literal.push('%'),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Text(literal));
        }
        MessageTemplate { segments }
    }

    /// True when the message has no insertion points and renders the same for every event.
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Text(_)))
    }

    /// The highest insert index referenced.
    pub fn max_insert(&self) -> usize {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Insert(n) => Some(*n),
                Segment::Text(_) => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn render<S: AsRef<str>>(&self, args: &[S]) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Insert(n) => match args.get(n - 1) {
                    Some(arg) => out.push_str(arg.as_ref()),
                    None => {
                        out.push('%');
                        out.push_str(&n.to_string());
                    }
                },
            }
        }
        out
    }
}

/// Replace `%%NNNN` parameter message references in an event value.
///
/// References `lookup` cannot resolve are left as they are.
pub fn expand_parameter_messages<'a, F>(value: &'a str, lookup: F) -> Cow<'a, str>
where
    F: Fn(u32) -> Option<String>,
{
    if !value.contains("%%") {
        return Cow::Borrowed(value);
    }

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(idx) = rest.find("%%") {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 2..];
        let digits = after
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after.len());

        match after[..digits].parse::<u32>().ok().and_then(&lookup) {
            Some(message) => out.push_str(&message),
            None => out.push_str(&rest[idx..idx + 2 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    Cow::Owned(out)
}
