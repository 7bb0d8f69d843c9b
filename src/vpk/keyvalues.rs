//! Tolerant Valve KeyValues parsing
//!
//! Used for `missions/*.txt`, `addonlist.txt` and Steam's
//! `libraryfolders.vdf`. Real-world files are frequently hand-edited, so the
//! parser never fails: unbalanced braces close at end of input, stray closing
//! braces are ignored and a key without a value is dropped.
//!
//! `addoninfo.txt` gets a separate line-oriented reader, since addon authors
//! routinely break its quoting in ways a token parser would choke on.

/// A `"key" value` pair where the value is text or a nested block
#[derive(Debug, Clone, PartialEq)]
pub struct KvNode {
    pub key: String,
    pub value: KvValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KvValue {
    Text(String),
    Block(Vec<KvNode>),
}

impl KvNode {
    /// Text value, if this node is a leaf
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            KvValue::Text(s) => Some(s),
            KvValue::Block(_) => None,
        }
    }

    /// Child nodes, empty for leaves
    pub fn children(&self) -> &[KvNode] {
        match &self.value {
            KvValue::Block(children) => children,
            KvValue::Text(_) => &[],
        }
    }

    /// First child with a matching key (case-insensitive)
    pub fn get(&self, key: &str) -> Option<&KvNode> {
        find(self.children(), key)
    }

    /// Text of the first matching child
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|n| n.as_str())
    }
}

/// First node in `nodes` whose key matches (case-insensitive)
pub fn find<'a>(nodes: &'a [KvNode], key: &str) -> Option<&'a KvNode> {
    nodes.iter().find(|n| n.key.eq_ignore_ascii_case(key))
}

#[derive(Debug, PartialEq)]
enum Token {
    Str(String),
    Open,
    Close,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '{' => {
                chars.next();
                tokens.push(Token::Open);
            }
            '}' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    for c in chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                } else {
                    let mut s = String::from('/');
                    read_bare(&mut chars, &mut s);
                    tokens.push(Token::Str(s));
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        // Only quotes and backslashes are escaped; Windows paths stay intact
                        '\\' => match chars.peek() {
                            Some(&next @ ('"' | '\\')) => {
                                chars.next();
                                s.push(next);
                            }
                            _ => s.push('\\'),
                        },
                        other => s.push(other),
                    }
                }
                tokens.push(Token::Str(s));
            }
            // Platform conditionals like [$X360] carry no data for us
            '[' => {
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                }
            }
            _ => {
                let mut s = String::new();
                read_bare(&mut chars, &mut s);
                tokens.push(Token::Str(s));
            }
        }
    }

    tokens
}

fn read_bare(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, out: &mut String) {
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() || matches!(c, '{' | '}' | '"') {
            break;
        }
        out.push(c);
        chars.next();
    }
}

/// Parse a KeyValues document into its top-level nodes
pub fn parse(text: &str) -> Vec<KvNode> {
    let tokens = tokenize(text);
    let mut pos = 0;
    let mut nodes = Vec::new();
    // Top level: stray closing braces are skipped
    while pos < tokens.len() {
        if tokens[pos] == Token::Close {
            pos += 1;
            continue;
        }
        parse_block_into(&tokens, &mut pos, &mut nodes);
    }
    nodes
}

/// Parse pairs until a closing brace or end of input
fn parse_block_into(tokens: &[Token], pos: &mut usize, out: &mut Vec<KvNode>) {
    while *pos < tokens.len() {
        let key = match &tokens[*pos] {
            Token::Close => return,
            Token::Open => {
                // Anonymous block; flatten its pairs into the parent
                *pos += 1;
                parse_block_into(tokens, pos, out);
                *pos += 1;
                continue;
            }
            Token::Str(s) => s.clone(),
        };
        *pos += 1;

        match tokens.get(*pos) {
            Some(Token::Str(value)) => {
                out.push(KvNode {
                    key,
                    value: KvValue::Text(value.clone()),
                });
                *pos += 1;
            }
            Some(Token::Open) => {
                *pos += 1;
                let mut children = Vec::new();
                parse_block_into(tokens, pos, &mut children);
                // Consume the matching close (absent at end of input)
                *pos += 1;
                out.push(KvNode {
                    key,
                    value: KvValue::Block(children),
                });
            }
            Some(Token::Close) | None => return,
        }
    }
}

/// Fields read from an `addoninfo.txt` descriptor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddonInfo {
    pub title: String,
    pub author: String,
    pub version: String,
    pub description: String,
    pub url: String,
}

/// Read `addoninfo.txt` line by line.
///
/// Accepts `"key" "value"` and `key "value"`; skips comments, braces and
/// anything it cannot make sense of. Unknown keys are ignored.
pub fn parse_addon_info(text: &str) -> AddonInfo {
    let mut info = AddonInfo::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }

        let Some((key, value)) = split_info_line(line) else {
            continue;
        };

        match key.to_ascii_lowercase().as_str() {
            "addontitle" => info.title = value.to_string(),
            "addonauthor" => info.author = value.to_string(),
            "addonversion" => info.version = value.to_string(),
            "addondescription" => info.description = value.to_string(),
            "addonurl0" => info.url = value.to_string(),
            _ => {}
        }
    }

    info
}

fn split_info_line(line: &str) -> Option<(&str, &str)> {
    if let Some(rest) = line.strip_prefix('"') {
        let key_end = rest.find('"')?;
        let key = &rest[..key_end];
        let remainder = &rest[key_end + 1..];
        let val_start = remainder.find('"')?;
        let val_end = remainder.rfind('"')?;
        if val_end <= val_start {
            return None;
        }
        Some((key, &remainder[val_start + 1..val_end]))
    } else {
        if line.starts_with('{') || line.starts_with('}') {
            return None;
        }
        let val_start = line.find('"')?;
        let val_end = line.rfind('"')?;
        if val_end <= val_start {
            return None;
        }
        Some((line[..val_start].trim(), &line[val_start + 1..val_end]))
    }
}

/// Decode descriptor text to UTF-8.
///
/// Honours UTF-8/UTF-16 BOMs; bytes that are not valid UTF-8 are treated as
/// GB18030, the legacy code page most non-UTF-8 addons in the wild use.
pub fn decode_text(bytes: &[u8]) -> String {
    if let Some((encoding, bom_len)) = encoding_rs::Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return text.into_owned();
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _) = encoding_rs::GB18030.decode_without_bom_handling(bytes);
            text.into_owned()
        }
    }
}
