//! Tag-syntax parsing of assistant text
//!
//! Models without native function calling request tools inline:
//!
//! ```text
//! Let me look.
//! <read_file>
//! <path>src/main.rs</path>
//! </read_file>
//! ```
//!
//! Parsing is deterministic over the accumulated text, so parsing again after
//! each chunk yields the same blocks at the same indices, with only the last
//! block possibly still partial.

use std::collections::BTreeMap;

/// A block of assistant output
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantBlock {
    Text {
        content: String,
        partial: bool,
    },
    ToolUse {
        name: String,
        params: BTreeMap<String, String>,
        partial: bool,
    },
}

impl AssistantBlock {
    pub fn is_partial(&self) -> bool {
        match self {
            AssistantBlock::Text { partial, .. } | AssistantBlock::ToolUse { partial, .. } => {
                *partial
            }
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, AssistantBlock::ToolUse { .. })
    }
}

enum State {
    Text {
        start: usize,
    },
    Tool {
        name: String,
        params: BTreeMap<String, String>,
    },
    Param {
        name: String,
        params: BTreeMap<String, String>,
        param: String,
        value_start: usize,
    },
}

/// Parse accumulated assistant text into blocks.
///
/// Only names in `tool_names` open tool blocks; inside a tool block any
/// `<ident>` opens a parameter whose value runs to the matching close tag.
pub fn parse_assistant_message(message: &str, tool_names: &[String]) -> Vec<AssistantBlock> {
    let mut blocks = Vec::new();
    let mut state = State::Text { start: 0 };
    let mut pos = 0;

    loop {
        state = match state {
            State::Text { start } => {
                let Some((tag_at, name)) = find_tool_open(message, pos, tool_names) else {
                    push_text(&mut blocks, &message[start..], true);
                    return blocks;
                };
                push_text(&mut blocks, &message[start..tag_at], false);
                pos = tag_at + name.len() + 2;
                State::Tool {
                    name: name.to_string(),
                    params: BTreeMap::new(),
                }
            }
            State::Tool { name, params } => {
                let Some(lt) = message[pos..].find('<').map(|o| pos + o) else {
                    blocks.push(AssistantBlock::ToolUse {
                        name,
                        params,
                        partial: true,
                    });
                    return blocks;
                };
                let close = format!("</{}>", name);
                if message[lt..].starts_with(&close) {
                    blocks.push(AssistantBlock::ToolUse {
                        name,
                        params,
                        partial: false,
                    });
                    pos = lt + close.len();
                    State::Text { start: pos }
                } else if let Some(param) = read_open_tag(&message[lt..]) {
                    pos = lt + param.len() + 2;
                    State::Param {
                        name,
                        params,
                        param: param.to_string(),
                        value_start: pos,
                    }
                } else {
                    pos = lt + 1;
                    State::Tool { name, params }
                }
            }
            State::Param {
                name,
                mut params,
                param,
                value_start,
            } => {
                let close = format!("</{}>", param);
                match message[value_start..].find(&close) {
                    Some(offset) => {
                        let value = message[value_start..value_start + offset].trim().to_string();
                        params.insert(param, value);
                        pos = value_start + offset + close.len();
                        State::Tool { name, params }
                    }
                    None => {
                        let value = strip_trailing_partial_tag(&message[value_start..]);
                        params.insert(param, value.trim().to_string());
                        blocks.push(AssistantBlock::ToolUse {
                            name,
                            params,
                            partial: true,
                        });
                        return blocks;
                    }
                }
            }
        };
    }
}

/// Mark every block complete (the stream ended)
pub fn finalize_blocks(blocks: &mut [AssistantBlock]) {
    for block in blocks {
        match block {
            AssistantBlock::Text { partial, .. } | AssistantBlock::ToolUse { partial, .. } => {
                *partial = false
            }
        }
    }
}

/// Text for display: thinking tags and a dangling partial tag removed
pub fn clean_text(text: &str) -> String {
    let without_thinking = text.replace("<thinking>", "").replace("</thinking>", "");
    strip_trailing_partial_tag(&without_thinking).trim().to_string()
}

fn push_text(blocks: &mut Vec<AssistantBlock>, text: &str, partial: bool) {
    if text.trim().is_empty() {
        return;
    }
    blocks.push(AssistantBlock::Text {
        content: text.trim().to_string(),
        partial,
    });
}

/// Find the next `<tool_name>` for a known tool at or after `from`
fn find_tool_open<'a>(
    message: &str,
    from: usize,
    tool_names: &'a [String],
) -> Option<(usize, &'a str)> {
    let mut search = from;
    while let Some(offset) = message[search..].find('<') {
        let at = search + offset;
        if let Some(tag) = read_open_tag(&message[at..]) {
            if let Some(name) = tool_names.iter().find(|n| n.as_str() == tag) {
                return Some((at, name.as_str()));
            }
        }
        search = at + 1;
    }
    None
}

/// Read `<ident>` at the start of `s`, returning `ident`
fn read_open_tag(s: &str) -> Option<&str> {
    let rest = s.strip_prefix('<')?;
    let len = rest
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    if len == 0 || !rest[len..].starts_with('>') {
        return None;
    }
    Some(&rest[..len])
}

/// Drop a tag that has started but not closed at the very end, e.g. `"abc </pa"`
fn strip_trailing_partial_tag(text: &str) -> &str {
    let Some(lt) = text.rfind('<') else {
        return text;
    };
    let tail = &text[lt + 1..];
    let tail = tail.strip_prefix('/').unwrap_or(tail);
    if tail.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        &text[..lt]
    } else {
        text
    }
}
