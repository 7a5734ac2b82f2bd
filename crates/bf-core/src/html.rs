//! Inline HTML codec for rich-text field values.
//!
//! Emission is canonical: every run becomes one element chain nested in
//! mark order (`<a>` › `<strong>` › `<em>`), text is entity-escaped and
//! newlines become `<br>`. The `winnow` parser is lenient so values
//! produced by other views still load: it accepts `b`/`i` aliases, keeps
//! the text of unknown tags and tolerates unbalanced markup. The caret
//! sentinel is stripped.

use crate::richtext::{Mark, MarkSet, RichTextDocument, TextRun, strip_sentinel};
use winnow::ascii::{multispace0, multispace1};
use winnow::combinator::{alt, delimited, opt, preceded, repeat};
use winnow::prelude::*;
use winnow::token::{take_till, take_until, take_while};

// ─── Emit ────────────────────────────────────────────────────────────────

/// Serialize a document to its canonical inline HTML.
pub fn to_html(doc: &RichTextDocument) -> String {
    let mut out = String::new();
    for run in doc.runs() {
        write_run(&mut out, run);
    }
    out
}

fn write_run(out: &mut String, run: &TextRun) {
    let mut closers: Vec<&'static str> = Vec::new();
    // Links wrap everything else; bold wraps italic.
    let link = run.marks.iter().filter(|m| matches!(m, Mark::Link { .. }));
    let rest = run.marks.iter().filter(|m| !matches!(m, Mark::Link { .. }));
    for mark in link.chain(rest) {
        match mark {
            Mark::Link { href } => {
                out.push_str("<a href=\"");
                out.push_str(&escape(href));
                out.push_str("\">");
                closers.push("</a>");
            }
            Mark::Bold => {
                out.push_str("<strong>");
                closers.push("</strong>");
            }
            Mark::Italic => {
                out.push_str("<em>");
                closers.push("</em>");
            }
        }
    }
    out.push_str(&escape_text(&run.text));
    for closer in closers.iter().rev() {
        out.push_str(closer);
    }
}

/// Escape text content, mapping newlines to `<br>`.
pub fn escape_text(text: &str) -> String {
    escape(text).replace('\n', "<br>")
}

/// Escape for text and double-quoted attribute values.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            crate::richtext::SENTINEL => {}
            _ => out.push(c),
        }
    }
    out
}

// ─── Parse ───────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close(String),
    Comment,
    Text(&'a str),
}

/// Parse inline HTML into a canonical document. Never fails on malformed
/// markup; a stray `<` is kept as text.
pub fn parse_html(input: &str) -> RichTextDocument {
    let mut rest = input;
    let mut stack: Vec<(String, Option<Mark>)> = Vec::new();
    let mut runs: Vec<TextRun> = Vec::new();

    while !rest.is_empty() {
        let checkpoint = rest;
        let token = match parse_token.parse_next(&mut rest) {
            Ok(token) => token,
            Err(_) => {
                // Not a tag after all: consume the `<` literally.
                let (lt, tail) = checkpoint.split_at(1);
                rest = tail;
                Token::Text(lt)
            }
        };

        match token {
            Token::Text(text) => {
                let text = strip_sentinel(&decode_entities(text));
                if !text.is_empty() {
                    runs.push(TextRun::new(text, current_marks(&stack)));
                }
            }
            Token::Open {
                name,
                attrs,
                self_closing,
            } => {
                if name == "br" {
                    runs.push(TextRun::new("\n", current_marks(&stack)));
                    continue;
                }
                if self_closing || is_void(&name) {
                    continue;
                }
                let mark = match name.as_str() {
                    "strong" | "b" => Some(Mark::Bold),
                    "em" | "i" => Some(Mark::Italic),
                    "a" => attrs
                        .into_iter()
                        .find(|(k, _)| k == "href")
                        .map(|(_, v)| Mark::link(decode_entities(&v))),
                    _ => None,
                };
                stack.push((name, mark));
            }
            Token::Close(name) => {
                if let Some(pos) = stack.iter().rposition(|(n, _)| *n == name) {
                    stack.truncate(pos);
                }
            }
            Token::Comment => {}
        }
    }

    RichTextDocument::from_runs(runs)
}

fn current_marks(stack: &[(String, Option<Mark>)]) -> MarkSet {
    MarkSet::from_marks(stack.iter().filter_map(|(_, m)| m.clone()))
}

fn is_void(name: &str) -> bool {
    matches!(
        name,
        "img" | "hr" | "input" | "meta" | "link" | "wbr" | "source"
    )
}

fn parse_token<'a>(input: &mut &'a str) -> ModalResult<Token<'a>> {
    alt((
        parse_comment.map(|_| Token::Comment),
        parse_close_tag.map(Token::Close),
        parse_open_tag,
        take_till(1.., '<').map(Token::Text),
    ))
    .parse_next(input)
}

fn parse_comment<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    delimited("<!--", take_until(0.., "-->"), "-->").parse_next(input)
}

fn parse_tag_name(input: &mut &str) -> ModalResult<String> {
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '-')
        .map(|s: &str| s.to_ascii_lowercase())
        .parse_next(input)
}

fn parse_close_tag(input: &mut &str) -> ModalResult<String> {
    delimited("</", parse_tag_name, (multispace0, '>')).parse_next(input)
}

fn parse_open_tag<'a>(input: &mut &'a str) -> ModalResult<Token<'a>> {
    let _ = '<'.parse_next(input)?;
    let name = parse_tag_name.parse_next(input)?;
    let attrs: Vec<(String, String)> = repeat(0.., parse_attribute).parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    let self_closing = opt('/').parse_next(input)?.is_some();
    let _ = '>'.parse_next(input)?;
    Ok(Token::Open {
        name,
        attrs,
        self_closing,
    })
}

fn parse_attribute(input: &mut &str) -> ModalResult<(String, String)> {
    let _ = multispace1.parse_next(input)?;
    let name: &str = take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':'
    })
    .parse_next(input)?;
    let value = opt(preceded(
        (multispace0, '=', multispace0),
        parse_attribute_value,
    ))
    .parse_next(input)?;
    Ok((
        name.to_ascii_lowercase(),
        value.unwrap_or_default().to_string(),
    ))
}

fn parse_attribute_value<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    alt((
        delimited('"', take_till(0.., '"'), '"'),
        delimited('\'', take_till(0.., '\''), '\''),
        take_till(1.., |c: char| c.is_whitespace() || c == '>'),
    ))
    .parse_next(input)
}

/// Decode the handful of entities the emitter and common editors produce.
/// Unknown entities are kept verbatim.
pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &rest[1..semi];
            decode_entity(entity).map(|c| (c, semi + 1))
        });
        match decoded {
            Some((c, consumed)) => {
                out.push(c);
                rest = &rest[consumed..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" | "#39" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let num = entity.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}
