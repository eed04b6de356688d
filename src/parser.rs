use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value as JsonValue;

// Token kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Str,
    Num,
    Raw,
    Unk,
    Obj,
    Arr,
    Fnc,
    Mtd,
    Asi,
    Opr,
    Cmp,
    Spr,
    Log,
    Qst,
    Bit,
    Ury,
    Mtv,
    Cmd,
    ModIndicator,
    Inl,
    Blk,
    Var,
    Tsr,
    Evl,
    Rmt,
    Mod,
    Bsl,
}

/// Inferred lowered type of an expression, filled in by the code generator.
/// `Any` is the dynamic sentinel; an absent annotation means "not inferred yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Str,
    Int,
    Num,
    Bool,
    Obj,
    Arr,
    Any,
}

/// Variant-specific payload of a token.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TokenData {
    Null,
    Text(String),
    Number(f64),
    Bool(bool),
    Node(Box<Token>),
    List(Vec<Token>),
    Pairs(Vec<(Token, Token)>),
    Block(Vec<Vec<Token>>),
    Modifier(String, Box<Token>),
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A parsed token. The lexer's output and the parser's AST nodes share this
/// one tagged shape; binary folding fills `left`/`right`/`right2` in place.
#[derive(Debug, Clone, Serialize)]
pub struct Token {
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub data: TokenData,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left: Option<Box<Token>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right: Option<Box<Token>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right2: Option<Box<Token>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Token>,
    #[serde(rename = "isStatic", skip_serializing_if = "is_false")]
    pub is_static: bool,
    #[serde(rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub set_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub returns: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cases: Option<JsonValue>,
    #[serde(rename = "final", skip_serializing_if = "Option::is_none")]
    pub final_seg: Option<Box<Token>>,
    #[serde(skip_serializing_if = "is_false")]
    pub local: bool,
    #[serde(rename = "staticAssignment", skip_serializing_if = "is_false")]
    pub static_assignment: bool,
    #[serde(skip)]
    pub returned_type: Option<ValueType>,
}

impl Default for Token {
    fn default() -> Self {
        Token {
            kind: TokenKind::Unk,
            data: TokenData::Null,
            source: String::new(),
            line: 0,
            left: None,
            right: None,
            right2: None,
            parameters: Vec::new(),
            is_static: false,
            static_data: None,
            parse_error: None,
            set_type: String::new(),
            returns: String::new(),
            cases: None,
            final_seg: None,
            local: false,
            static_assignment: false,
            returned_type: None,
        }
    }
}

impl Token {
    pub fn new(kind: TokenKind, data: TokenData) -> Self {
        Token {
            kind,
            data,
            ..Token::default()
        }
    }

    pub fn text(kind: TokenKind, text: impl Into<String>) -> Self {
        Token::new(kind, TokenData::Text(text.into()))
    }

    /// Text payload, or "" for non-text payloads.
    pub fn data_text(&self) -> &str {
        match &self.data {
            TokenData::Text(s) => s,
            _ => "",
        }
    }

    pub fn is_text(&self, s: &str) -> bool {
        matches!(&self.data, TokenData::Text(t) if t == s)
    }

    pub fn block(&self) -> Option<&Vec<Vec<Token>>> {
        match &self.data {
            TokenData::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn list(&self) -> Option<&Vec<Token>> {
        match &self.data {
            TokenData::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn block_mut(&mut self) -> Option<&mut Vec<Vec<Token>>> {
        match &mut self.data {
            TokenData::Block(b) => Some(b),
            _ => None,
        }
    }

    /// JSON image of a literal payload, used for static folding.
    pub fn data_json(&self) -> JsonValue {
        match &self.data {
            TokenData::Text(s) => JsonValue::from(s.clone()),
            TokenData::Number(n) => serde_json::json!(n),
            TokenData::Bool(b) => JsonValue::from(*b),
            _ => JsonValue::Null,
        }
    }
}

/// Declared signature of a user function, registered while parsing `def`.
#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub accepts: Vec<String>,
    pub returns: String,
}

const OPERATORS: &[&str] = &[
    "+", "++", "-", "*", "/", "//", "%", "??", "^", "b+", "b-", "b/", "b*", "b^",
];
const COMPARISONS: &[&str] = &[
    "!=", "==", "!==", "===", ">", "<", "!>", "!<", ">=", "<=", "in", "notIn",
];
const LOGIC: &[&str] = &["and", "or", "nor", "xor", "xnor", "nand"];
const BITWISE: &[&str] = &["|", "&", "<<", ">>", "^^"];

// Glyph runs that get surrounded with spaces when they directly follow a
// closing lexeme. Two-character glyphs must be tried first.
const GLYPHS_TWO: &[&str] = &["++", "??", "->", "==", "!=", "<=", ">="];
const GLYPHS_ONE: &[char] = &['>', '<', '?', '+', '*', '^', '%', '/', '-', '|', '&'];

pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Splits `code` at `delimiter`, ignoring delimiters inside double-quoted
/// strings or inside `()`/`[]`/`{}` runs.
pub fn tokenise(code: &str, delimiter: char) -> Vec<String> {
    if code.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = code.chars().collect();
    let mut in_string = false;
    let mut depth: i32 = 0;
    let mut out = String::new();
    let mut split = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            in_string = !in_string;
        }
        out.push(c);
        if !in_string {
            match c {
                '[' | '{' | '(' => depth += 1,
                ']' | '}' | ')' => depth -= 1,
                _ => {}
            }
            if depth < 0 {
                depth = 0;
            }
        }
        i += 1;
        if !in_string && depth == 0 && i < chars.len() && chars[i] == delimiter {
            split.push(std::mem::take(&mut out));
            i += 1;
        }
    }
    split.push(out);
    split
}

/// Like `tokenise` but honours backslash escapes inside strings.
pub fn tokenise_escaped(code: &str, delimiter: char) -> Vec<String> {
    if code.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = code.chars().collect();
    let mut in_string = false;
    let mut depth: i32 = 0;
    let mut escaped = false;
    let mut out = String::new();
    let mut split = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if !in_string && !escaped {
            match c {
                '[' | '{' | '(' => depth += 1,
                ']' | '}' | ')' => depth -= 1,
                _ => {}
            }
            if depth < 0 {
                depth = 0;
            }
        }
        if c == '"' && !escaped {
            in_string = !in_string;
            out.push('"');
        } else if c == '\\' && !escaped {
            escaped = true;
            out.push('\\');
        } else {
            out.push(c);
            escaped = false;
        }
        i += 1;
        if !in_string && depth == 0 && i < chars.len() && chars[i] == delimiter {
            split.push(std::mem::take(&mut out));
            i += 1;
        }
    }
    split.push(out);
    split
}

/// Picks the cheapest splitting strategy that is still correct for the input.
pub fn auto_tokenise(code: &str, delimiter: char) -> Vec<String> {
    if code.contains('\\') {
        tokenise_escaped(code, delimiter)
    } else if code.contains('"') || code.contains('[') || code.contains('{') || code.contains('(') {
        tokenise(code, delimiter)
    } else {
        code.split(delimiter).map(str::to_string).collect()
    }
}

/// Resolves the escape sequences `\n \t \r \" \' \\` in a raw string body.
pub fn parse_escaped(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' && i + 1 < chars.len() {
            i += 1;
            match chars[i] {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '"' => out.push('"'),
                '\'' => out.push('\''),
                '\\' => out.push('\\'),
                other => out.push(other),
            }
        } else {
            out.push(chars[i]);
        }
        i += 1;
    }
    out
}

/// Strips the given string delimiter from both ends and resolves escapes.
pub fn destr(text: &str, delim: char) -> String {
    if text.len() >= 2 && text.starts_with(delim) && text.ends_with(delim) {
        let inner = &text[delim.len_utf8()..text.len() - delim.len_utf8()];
        parse_escaped(inner)
    } else {
        text.to_string()
    }
}

/// Splits a template-string body at balanced `${…}` boundaries. Expression
/// parts keep their `${…}` wrapper so the caller can tell them apart.
pub fn parse_template(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut depth = 0;
    let mut cur = String::new();
    let mut parts = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if i + 1 < chars.len() && chars[i] == '$' && chars[i + 1] == '{' {
            if depth == 0 && !cur.is_empty() {
                parts.push(std::mem::take(&mut cur));
            }
            cur.push_str("${");
            depth += 1;
            i += 2;
            continue;
        }
        if chars[i] == '}' && depth > 0 {
            depth -= 1;
            cur.push('}');
            if depth == 0 {
                parts.push(std::mem::take(&mut cur));
            }
            i += 1;
            continue;
        }
        cur.push(chars[i]);
        i += 1;
    }
    if !cur.is_empty() {
        parts.push(cur);
    }
    parts
}

fn find_matching_paren(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 1;
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn is_closing(c: char) -> bool {
    c == ']' || c == '"' || c == '}' || c == ')' || c.is_ascii_alphanumeric() || c == '_'
}

/// Surrounds binary-operator glyphs with spaces when they directly follow a
/// closing lexeme, so `a+b` lexes as three lexemes. Strings pass through.
fn space_operators(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut prev: Option<char> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' || c == '`' {
            out.push(c);
            i += 1;
            let mut escaped = false;
            while i < chars.len() {
                let d = chars[i];
                out.push(d);
                i += 1;
                if escaped {
                    escaped = false;
                } else if d == '\\' {
                    escaped = true;
                } else if d == c {
                    break;
                }
            }
            prev = Some(c);
            continue;
        }
        if matches!(prev, Some(p) if is_closing(p)) {
            let mut matched: Option<String> = None;
            if i + 1 < chars.len() {
                let two: String = chars[i..i + 2].iter().collect();
                if GLYPHS_TWO.contains(&two.as_str()) {
                    matched = Some(two);
                }
            }
            if matched.is_none() && GLYPHS_ONE.contains(&c) {
                matched = Some(c.to_string());
            }
            if let Some(glyph) = matched {
                let end = i + glyph.chars().count();
                if end < chars.len() && !chars[end].is_whitespace() {
                    out.push(' ');
                    out.push_str(&glyph);
                    out.push(' ');
                    prev = Some(' ');
                    i = end;
                    continue;
                }
            }
        }
        out.push(c);
        prev = Some(c);
        i += 1;
    }
    out
}

/// The parser front end. Owns the signature table that the code generator
/// consults for user-function return types.
#[derive(Default)]
pub struct Parser {
    pub function_return_types: HashMap<String, FunctionSignature>,
}

impl Parser {
    pub fn new() -> Self {
        Parser::default()
    }

    /// Splits one logical line into lexemes. Single pass over the characters,
    /// tracking the three quote states, bracket depth, escapes and block
    /// comments; splits only at depth zero outside any quote.
    pub fn tokenise_line(&self, code: &str) -> Vec<String> {
        let code = space_operators(code);
        let chars: Vec<char> = code.chars().collect();
        let mut quotes = false;
        let mut squotes = false;
        let mut backticks = false;
        let mut mcomm = false;
        let mut depth: i32 = 0;
        let mut escaped = false;
        let mut out = String::new();
        let mut split = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if !quotes && !squotes && !backticks && !escaped {
                match c {
                    '[' | '{' | '(' => depth += 1,
                    ']' | '}' | ')' => depth -= 1,
                    _ => {}
                }
                if depth < 0 {
                    depth = 0;
                }
            }
            if c == '"' && !escaped && !squotes && !backticks {
                quotes = !quotes;
            } else if c == '\'' && !escaped && !quotes && !backticks {
                squotes = !squotes;
            } else if c == '`' && !escaped && !quotes && !squotes {
                backticks = !backticks;
            } else if c == '/'
                && i + 1 < chars.len()
                && chars[i + 1] == '*'
                && !quotes
                && !squotes
                && !backticks
            {
                mcomm = true;
            } else if c == '*'
                && i + 1 < chars.len()
                && chars[i + 1] == '/'
                && !quotes
                && !squotes
                && !backticks
                && mcomm
            {
                mcomm = false;
                i += 2;
                continue;
            } else if c == '\\' && !escaped {
                escaped = true;
            } else {
                escaped = false;
            }
            if !mcomm {
                out.push(c);
            }
            i += 1;
            if !quotes
                && !squotes
                && !backticks
                && depth == 0
                && !mcomm
                && i < chars.len()
                && (chars[i] == ' ' || chars[i] == ')')
            {
                split.push(std::mem::take(&mut out));
                i += 1;
            }
        }
        split.push(out);
        split
    }

    /// Splits normalised source into logical lines. A line break only splits
    /// at bracket depth zero outside strings, so a block `(\n…\n)` stays a
    /// single logical line.
    pub fn tokenise_lines(&self, code: &str) -> Vec<String> {
        let code = normalize_line_endings(code);
        let chars: Vec<char> = code.chars().collect();
        let mut quotes = false;
        let mut backticks = false;
        let mut depth: i32 = 0;
        let mut escaped = false;
        let mut out = String::new();
        let mut split = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if !quotes && !backticks && !escaped {
                match c {
                    '[' | '{' | '(' => depth += 1,
                    ']' | '}' | ')' => depth -= 1,
                    _ => {}
                }
                if depth < 0 {
                    depth = 0;
                }
            }
            if c == '"' && !escaped && !backticks {
                quotes = !quotes;
                out.push('"');
            } else if c == '`' && !escaped && !quotes {
                backticks = !backticks;
                out.push('`');
            } else if c == '\\' && !escaped {
                escaped = true;
                out.push('\\');
            } else {
                out.push(c);
                escaped = false;
            }
            i += 1;
            if !quotes
                && !backticks
                && depth == 0
                && i < chars.len()
                && (chars[i] == '\n' || chars[i] == ';')
            {
                split.push(std::mem::take(&mut out));
                i += 1;
            }
        }
        split.push(out);
        split
    }

    /// Normalises raw source into marker-annotated logical lines: `\r\n`/`\r`
    /// to `\n`, `;` to `\n`, a `/@line N` marker after every statement break,
    /// call/subscript rewrites, comment stripping and `def`/`endef` fixups.
    pub fn pre_tokenise(&self, code: &str, main: bool) -> Result<String, String> {
        let normalized = normalize_line_endings(code);
        let trimmed = normalized.trim();
        let chars: Vec<char> = trimmed.chars().collect();
        let mut out = String::new();
        let mut line = 1usize;
        if main {
            out.push_str("/@line 1\n");
        }
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            match c {
                '"' | '\'' | '`' => {
                    let opened_at = line;
                    out.push(c);
                    i += 1;
                    let mut escaped = false;
                    let mut closed = false;
                    while i < chars.len() {
                        let d = chars[i];
                        out.push(d);
                        i += 1;
                        if escaped {
                            escaped = false;
                        } else if d == '\\' {
                            escaped = true;
                        } else if d == c {
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err(format!("Line {opened_at}: unterminated string"));
                    }
                }
                '/' if i + 1 < chars.len() && chars[i + 1] == '*' => {
                    let opened_at = line;
                    i += 2;
                    let mut closed = false;
                    while i < chars.len() {
                        if chars[i] == '*' && i + 1 < chars.len() && chars[i + 1] == '/' {
                            i += 2;
                            closed = true;
                            break;
                        }
                        if chars[i] == '\n' {
                            line += 1;
                            out.push('\n');
                        }
                        i += 1;
                    }
                    if !closed {
                        return Err(format!("Line {opened_at}: unterminated block comment"));
                    }
                }
                '/' if i + 1 < chars.len()
                    && chars[i + 1] == '/'
                    && out
                        .rfind('\n')
                        .map(|p| out[p + 1..].trim().is_empty())
                        .unwrap_or_else(|| out.trim().is_empty()) =>
                {
                    // comment line: drop everything up to the line break
                    while i < chars.len() && chars[i] != '\n' {
                        i += 1;
                    }
                }
                ';' => {
                    out.push('\n');
                    i += 1;
                }
                '\n' => {
                    line += 1;
                    let mut j = i + 1;
                    while j < chars.len() && (chars[j] == ' ' || chars[j] == '\t') {
                        j += 1;
                    }
                    let next = chars.get(j).copied();
                    let prev = out.chars().rev().find(|ch| !ch.is_whitespace());
                    if next == Some('.') {
                        // leading-dot continuation joins onto the previous line
                        i = j;
                        continue;
                    }
                    if !main
                        || matches!(prev, Some(',' | '{' | '['))
                        || matches!(next, Some('}' | ']'))
                    {
                        out.push('\n');
                    } else {
                        out.push_str(&format!("\n/@line {line}\n"));
                    }
                    i += 1;
                }
                '(' => {
                    if matches!(out.chars().last(), Some(')' | ']')) {
                        out.push_str(".call(");
                    } else {
                        out.push('(');
                    }
                    i += 1;
                }
                '[' => {
                    let prev = out.chars().last();
                    let next = chars.get(i + 1).copied();
                    if matches!(prev, Some(p) if is_closing(p)) && next != Some(']') {
                        out.push_str(".[");
                    } else {
                        out.push('[');
                    }
                    i += 1;
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            }
        }

        // def headers missing their opening block get one; bare endef closes it
        let mut lines = auto_tokenise(&out, '\n');
        for logical in lines.iter_mut() {
            let t = logical.trim();
            if t == "endef" {
                *logical = ")".to_string();
            } else if t.starts_with("def ") && !t.ends_with('(') && !t.ends_with(')') {
                *logical = format!("{t} (");
            } else {
                *logical = t.to_string();
            }
        }
        Ok(lines.join("\n"))
    }

    fn generate_error(&self, at: &Token, message: &str) -> Vec<Token> {
        vec![Token {
            kind: TokenKind::Unk,
            data: TokenData::Text(format!("error: {message}")),
            source: at.source.clone(),
            line: at.line,
            parse_error: Some(message.to_string()),
            ..Token::default()
        }]
    }

    fn is_static_token(&self, token: &Token) -> bool {
        matches!(
            token.kind,
            TokenKind::Str | TokenKind::Num | TokenKind::Unk | TokenKind::Cmd | TokenKind::Raw
        )
    }

    pub fn eval_token(&mut self, cur: &str, param: bool) -> Token {
        let mut token = self.string_to_token(cur, param);
        if token.kind == TokenKind::Blk {
            token.source = "[ast BLK]".to_string();
        } else {
            token.source = cur.to_string();
        }
        token
    }

    /// Classifies one lexeme into exactly one token. Recursive for method
    /// chains, calls, subscripts, literals and template strings.
    pub fn string_to_token(&mut self, cur: &str, param: bool) -> Token {
        if cur.is_empty() {
            return Token::text(TokenKind::Unk, cur);
        }

        let chars: Vec<char> = cur.chars().collect();
        let start = chars[0];

        if cur == "/@line" {
            return Token::text(TokenKind::Unk, "/@line");
        }

        let num_str = cur.replace('_', "");
        if !num_str.is_empty() {
            if let Ok(num) = num_str.parse::<f64>() {
                if num.is_finite() {
                    return Token::new(TokenKind::Num, TokenData::Number(num));
                }
            }
        }

        if cur == "true" || cur == "false" {
            return Token::new(TokenKind::Raw, TokenData::Bool(cur == "true"));
        }

        if OPERATORS.contains(&cur) {
            return Token::text(TokenKind::Opr, cur);
        }
        if cur == "--" {
            return Token::text(TokenKind::Unk, "--");
        }
        if COMPARISONS.contains(&cur) {
            return Token::text(TokenKind::Cmp, cur);
        }
        if cur.ends_with('=') {
            return Token::text(TokenKind::Asi, cur);
        }

        if chars.len() >= 2 {
            let last = chars[chars.len() - 1];
            if start == '"' && last == '"' {
                return Token::text(TokenKind::Str, destr(cur, '"'));
            }
            if start == '\'' && last == '\'' {
                return Token::text(TokenKind::Str, destr(cur, '\''));
            }
            if start == '`' && last == '`' {
                let mut parts = Vec::new();
                for piece in parse_template(&destr(cur, '`')) {
                    if piece.is_empty() {
                        continue;
                    }
                    if piece.starts_with("${") && piece.ends_with('}') {
                        let inner = &piece[2..piece.len() - 1];
                        let ast = self.generate_ast(inner, 0, false);
                        if let Some(first) = ast.into_iter().next() {
                            parts.push(first);
                        }
                    } else {
                        parts.push(Token::text(TokenKind::Str, piece));
                    }
                }
                return Token::new(TokenKind::Tsr, TokenData::List(parts));
            }
        }

        if cur == "?" {
            return Token::text(TokenKind::Qst, cur);
        }
        if LOGIC.contains(&cur) {
            return Token::text(TokenKind::Log, cur);
        }
        if BITWISE.contains(&cur) {
            return Token::text(TokenKind::Bit, cur);
        }

        if let Some(rest) = cur.strip_prefix("...") {
            let inner = self.string_to_token(rest, false);
            return Token::new(TokenKind::Spr, TokenData::Node(Box::new(inner)));
        }

        if chars.len() > 1 && matches!(start, '!' | '-' | '+' | '@') {
            let rest: String = chars[1..].iter().collect();
            let mut token = Token::text(TokenKind::Ury, start.to_string());
            token.right = Some(Box::new(self.string_to_token(&rest, false)));
            return token;
        }

        if cur.contains('.') {
            let pieces = auto_tokenise(cur, '.');
            if pieces.len() >= 2 {
                let mut segments = Vec::new();
                for (i, piece) in pieces.iter().enumerate() {
                    segments.push(self.string_to_token(piece, i > 0));
                }
                return Token::new(TokenKind::Mtd, TokenData::List(segments));
            }
        }

        if chars.len() >= 2 {
            let last = chars[chars.len() - 1];
            if start == '[' && last == ']' {
                return self.bracket_literal(cur, param);
            }
            if start == '{' && last == '}' {
                return self.object_literal(cur);
            }
        }

        if is_identifier(cur) {
            return Token::text(TokenKind::Var, cur);
        }

        if cur == "->" {
            return Token::text(TokenKind::Inl, "->");
        }

        if cur.starts_with("(\n") && cur.ends_with(')') {
            let inner = cur[1..cur.len() - 1].trim().to_string();
            match self.generate_full_ast(&inner, false) {
                Ok(block) => return Token::new(TokenKind::Blk, TokenData::Block(block)),
                Err(message) => {
                    let mut token = Token::text(TokenKind::Unk, cur);
                    token.parse_error = Some(message);
                    return token;
                }
            }
        }

        if start == '(' && cur.ends_with(')') {
            let end = match find_matching_paren(&chars, 0) {
                Some(end) => end,
                None => {
                    let mut token = Token::text(TokenKind::Unk, cur);
                    token.parse_error = Some("Unmatched parentheses".to_string());
                    return token;
                }
            };
            let body: String = chars[1..end].iter().collect();
            let ast = self.generate_ast(body.trim(), 0, false);
            if let Some(first) = ast.into_iter().next() {
                return first;
            }
            let mut token = Token::text(TokenKind::Unk, cur);
            token.parse_error = Some("Empty parentheses expression".to_string());
            return token;
        }

        if cur.ends_with(')') && chars.len() > 1 {
            if let Some(paren) = cur.find('(') {
                if paren > 0 {
                    return self.call_form(cur, paren, param);
                }
            }
        }

        if cur == "mainloop:" {
            return Token::text(TokenKind::Cmd, "mainloop:");
        }

        if cur == ":" {
            return Token::text(TokenKind::ModIndicator, ":");
        }

        Token::text(TokenKind::Unk, cur)
    }

    /// `[…]` literal: an array in expression position, a subscript
    /// method-value named `item` in method position.
    fn bracket_literal(&mut self, cur: &str, param: bool) -> Token {
        if cur == "[]" {
            if param {
                return Token::text(TokenKind::Mtv, "item");
            }
            return Token::new(TokenKind::Arr, TokenData::List(Vec::new()));
        }

        let inner = &cur[1..cur.len() - 1];
        let mut parsed = Vec::new();
        for part in auto_tokenise(inner, ',') {
            let mut piece = part.trim().to_string();
            if piece.is_empty() {
                continue;
            }
            if piece.starts_with("/@line ") {
                piece = match piece.split_once('\n') {
                    Some((_, rest)) => rest.trim().to_string(),
                    None => continue,
                };
            }
            let ast = self.generate_ast(&piece, 0, false);
            if let Some(first) = ast.into_iter().next() {
                parsed.push(first);
            }
        }

        let all_static = !parsed.is_empty() && parsed.iter().all(|t| self.is_static_token(t));
        let static_data = if all_static {
            Some(JsonValue::Array(
                parsed.iter().map(|t| t.data_json()).collect(),
            ))
        } else {
            None
        };

        if param {
            let mut token = Token::text(TokenKind::Mtv, "item");
            token.parameters = parsed;
            token.is_static = all_static;
            token.static_data = static_data;
            return token;
        }

        let mut token = Token::new(TokenKind::Arr, TokenData::List(parsed));
        token.is_static = all_static;
        token.static_data = static_data;
        token
    }

    /// `{…}` object literal: top-level commas separate entries, the first
    /// top-level `:` separates key from value, bare identifier keys act as
    /// string keys and keys without a value repeat the key as the value.
    fn object_literal(&mut self, cur: &str) -> Token {
        if cur == "{}" {
            return Token::new(TokenKind::Obj, TokenData::Pairs(Vec::new()));
        }

        let inner = &cur[1..cur.len() - 1];
        let mut entries = Vec::new();
        for part in auto_tokenise(inner, ',') {
            if part.trim().is_empty() {
                continue;
            }
            let key_value = auto_tokenise(&part, ':');
            let mut key = key_value[0].trim().to_string();
            let value = if key_value.len() > 1 {
                key_value[1..].join(":")
            } else {
                String::new()
            };
            if key.starts_with("/@line ") {
                key = match key.split_once('\n') {
                    Some((_, rest)) => rest.trim().to_string(),
                    None => continue,
                };
            }
            if key.is_empty() {
                continue;
            }

            if value.trim().is_empty() {
                // shorthand entry: the key doubles as the value
                let ast = self.generate_ast(&key, 0, false);
                let Some(mut key_token) = ast.into_iter().next() else {
                    continue;
                };
                if key_token.kind == TokenKind::Var {
                    key_token = Token::text(TokenKind::Str, key_token.data_text().to_string());
                }
                entries.push((key_token.clone(), key_token));
                continue;
            }

            let key_ast = self.generate_ast(&key, 0, false);
            let Some(key_token) = key_ast.into_iter().next() else {
                continue;
            };
            let value_ast = self.generate_ast(value.trim(), 0, false);
            let Some(value_token) = value_ast.into_iter().next() else {
                continue;
            };
            entries.push((key_token, value_token));
        }
        Token::new(TokenKind::Obj, TokenData::Pairs(entries))
    }

    /// `name(args)`: a call (`Fnc`) in expression position, a method value
    /// (`Mtv`) inside a chain. Each argument may carry a leading type word.
    fn call_form(&mut self, cur: &str, paren: usize, param: bool) -> Token {
        let func_name = &cur[..paren];
        let kind = if param { TokenKind::Mtv } else { TokenKind::Fnc };
        let mut out = Token::text(kind, func_name);

        if cur.ends_with("()") && paren == cur.len() - 2 {
            return out;
        }

        let params_src = &cur[paren + 1..cur.len() - 1];
        let mut parsed = Vec::new();
        for piece in auto_tokenise(params_src, ',') {
            let trimmed = piece.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut ast = self.generate_ast(trimmed, 0, false);
            if ast.is_empty() {
                continue;
            }
            if ast.len() > 1 {
                // leading type word: `string x`
                let type_prefix = auto_tokenise(trimmed, ' ')
                    .first()
                    .cloned()
                    .unwrap_or_default();
                ast.remove(0);
                ast[0].set_type = type_prefix;
            }
            parsed.push(ast.remove(0));
        }
        out.parameters = parsed;
        out
    }

    /// Folds an inline-arrow marker into a function literal. A non-block body
    /// becomes a single-statement block returning the body expression.
    fn eval_ast_node(&mut self, node: Token) -> Token {
        if node.kind != TokenKind::Inl {
            return node;
        }

        let mut params = String::new();
        if let Some(left) = &node.left {
            if !left.parameters.is_empty() {
                let mut parts = Vec::new();
                for p in &left.parameters {
                    let mut spec = p.data_text().to_string();
                    if !p.set_type.is_empty() {
                        spec = format!("{spec} {}", p.set_type);
                    }
                    parts.push(spec);
                }
                params = parts.join(",");
            } else if left.kind == TokenKind::Var {
                params = left.data_text().to_string();
            }
        }

        let body = match node.right {
            Some(right) if right.kind == TokenKind::Blk => *right,
            Some(right) => {
                // wrap the expression into `( return expr )`
                let ret = Token::text(TokenKind::Cmd, "return");
                Token::new(TokenKind::Blk, TokenData::Block(vec![vec![ret, *right]]))
            }
            None => {
                let mut err = Token::text(TokenKind::Unk, node.source.clone());
                err.parse_error = Some("No body for inline function".to_string());
                err.line = node.line;
                return err;
            }
        };

        let is_anon = !node.source.starts_with("def(");
        let mut fnc = Token::text(TokenKind::Fnc, "function");
        let mut spec = Token::text(TokenKind::Str, params.clone());
        spec.source = params;
        fnc.parameters = vec![
            spec,
            body,
            Token::new(TokenKind::Unk, TokenData::Bool(is_anon)),
        ];
        fnc.line = node.line;
        fnc
    }

    /// Builds the AST for one statement line: lexes, classifies, folds the
    /// operator passes in precedence order and applies the line rewrites.
    pub fn generate_ast(&mut self, code: &str, start: i32, main: bool) -> Vec<Token> {
        let code = normalize_line_endings(code);
        let start_line = code.split('\n').next().unwrap_or_default().to_string();
        let mut handling_mods = false;

        let mut ast: Vec<Token> = Vec::new();
        for lexeme in self.tokenise_line(&code) {
            let cur = lexeme.trim();
            if cur.is_empty() {
                continue;
            }

            if cur == "->" {
                ast.push(Token::text(TokenKind::Inl, "->"));
                continue;
            }

            if handling_mods {
                let mut token = Token::text(TokenKind::Mod, cur);
                token.source = cur.to_string();
                if let Some(pivot) = cur.find('#') {
                    let name = cur[..pivot].to_string();
                    let arg = self.eval_token(&cur[pivot + 1..], false);
                    token.data = TokenData::Modifier(name, Box::new(arg));
                }
                ast.push(token);
                continue;
            }

            let token = self.eval_token(cur, false);
            if token.kind == TokenKind::ModIndicator {
                handling_mods = true;
                continue;
            }
            ast.push(token);
        }

        self.fold_operators(&mut ast, start);

        for token in &ast {
            if let Some(err) = &token.parse_error {
                let message = err.clone();
                let at = token.clone();
                return self.generate_error(&at, &message);
            }
        }

        ast = ast
            .into_iter()
            .map(|token| self.eval_ast_node(token))
            .collect();

        ast = self.rewrite_def(ast, &start_line);
        if ast.is_empty() {
            return ast;
        }

        self.rewrite_chain_statement(&mut ast, &start_line, main);
        self.fold_assignments(&mut ast, start, &start_line);

        if ast.is_empty() {
            return ast;
        }

        // trailing ++/-- on a two-token line becomes an increment assignment
        if ast.len() == 2 {
            let is_inc =
                ast[1].kind == TokenKind::Opr && ast[1].is_text("++") && ast[1].right.is_none();
            let is_dec =
                ast[1].kind == TokenKind::Unk && ast[1].is_text("--") && ast[1].right.is_none();
            if is_inc || is_dec {
                let op = ast[1].data_text().to_string();
                let target = ast.remove(0);
                ast.clear();
                ast.push(Token {
                    kind: TokenKind::Asi,
                    data: TokenData::Text(op),
                    left: Some(Box::new(target)),
                    source: code.clone(),
                    ..Token::default()
                });
            }
        }

        if main && !ast.is_empty() {
            if ast[0].kind == TokenKind::Var {
                ast[0].kind = TokenKind::Cmd;
            }
            ast[0].source = start_line.clone();
        }

        if !ast.is_empty()
            && ast[0].kind == TokenKind::Cmd
            && ast[0].is_text("switch")
            && ast.len() > 2
            && ast[2].kind == TokenKind::Blk
        {
            ast[0].cases = Some(serde_json::json!({"type": "array", "all": []}));
        }

        if !ast.is_empty() && ast[0].kind == TokenKind::Asi {
            if let Some(right) = &mut ast[0].right {
                if matches!(right.kind, TokenKind::Str | TokenKind::Num | TokenKind::Raw) {
                    right.static_assignment = true;
                }
            }
        }

        ast.retain(|t| t.kind != TokenKind::Unk || !t.data_text().starts_with("/*"));
        ast
    }

    /// The precedence passes. Binary kinds fold left-to-right; the ternary
    /// folds right-to-left so `a ? b c ? d e` nests in its else arm.
    fn fold_operators(&mut self, ast: &mut Vec<Token>, start: i32) {
        use TokenKind::*;
        // arithmetic splits into sub-passes so `*` binds tighter than `+`
        let arithmetic_high: &[&str] = &["*", "/", "//", "%", "^", "b*", "b/", "b^"];
        let arithmetic_low: &[&str] = &["+", "-", "++", "b+", "b-"];

        let passes: &[(TokenKind, Option<&[&str]>)] = &[
            (Opr, Some(arithmetic_high)),
            (Opr, Some(arithmetic_low)),
            (Opr, Some(&["??"])),
            (Cmp, None),
            (Qst, None),
            (Bit, None),
            (Log, None),
            (Inl, None),
        ];

        for (kind, symbols) in passes {
            let start_idx = if start < 0 {
                if *kind == Inl {
                    1
                } else {
                    2
                }
            } else {
                start as usize
            };

            if *kind == Qst {
                let mut i = ast.len();
                while i > start_idx {
                    i -= 1;
                    if i >= ast.len() {
                        continue;
                    }
                    if ast[i].kind != Qst || ast[i].left.is_some() {
                        continue;
                    }
                    let right2 = if i + 2 < ast.len() {
                        Some(Box::new(ast.remove(i + 2)))
                    } else {
                        None
                    };
                    let right = if i + 1 < ast.len() {
                        Some(Box::new(ast.remove(i + 1)))
                    } else {
                        None
                    };
                    let left = if i >= 1 {
                        Some(Box::new(ast.remove(i - 1)))
                    } else {
                        None
                    };
                    let cur = if left.is_some() { i - 1 } else { i };
                    ast[cur].left = left;
                    ast[cur].right = right;
                    ast[cur].right2 = right2;
                    i = cur;
                }
                continue;
            }

            let mut i = start_idx;
            while i < ast.len() {
                let matches_pass = ast[i].kind == *kind
                    && ast[i].left.is_none()
                    && symbols.map_or(true, |set| set.contains(&ast[i].data_text()));
                if matches_pass && i >= 1 && i + 1 < ast.len() {
                    let right = ast.remove(i + 1);
                    let left = ast.remove(i - 1);
                    let cur = &mut ast[i - 1];
                    let mut source = left.source.clone();
                    if !cur.source.is_empty() {
                        source.push(' ');
                        source.push_str(&cur.source);
                    }
                    if !right.source.is_empty() {
                        source.push(' ');
                        source.push_str(&right.source);
                    }
                    cur.source = source;
                    cur.left = Some(Box::new(left));
                    cur.right = Some(Box::new(right));
                    // the folded node sits at i-1; re-examine position i
                } else {
                    i += 1;
                }
            }
        }
    }

    /// `def NAME(params) returns? body` becomes `NAME = function(...)`, and
    /// the declared signature is registered for the generator.
    fn rewrite_def(&mut self, ast: Vec<Token>, start_line: &str) -> Vec<Token> {
        let is_def = ast
            .first()
            .map(|t| (t.kind == TokenKind::Var || t.kind == TokenKind::Cmd) && t.is_text("def"))
            .unwrap_or(false);
        let has_fnc = ast.len() > 1 && ast[1].kind == TokenKind::Fnc && !ast[1].is_text("function");
        if !is_def || !has_fnc {
            return ast;
        }

        let func_name = ast[1].data_text().to_string();
        let mut params = Vec::new();
        for p in &ast[1].parameters {
            let mut spec = p.data_text().to_string();
            if !p.set_type.is_empty() {
                spec = format!("{spec} {}", p.set_type);
            }
            params.push(spec);
        }
        let param_spec = params.join(",");

        let mut return_type = String::new();
        let body;
        if ast.len() > 2 && ast[2].kind == TokenKind::Var {
            return_type = ast[2].data_text().to_string();
            body = ast.into_iter().nth(3);
        } else {
            body = ast.into_iter().nth(2);
        }
        let Some(body) = body else {
            return vec![Token {
                kind: TokenKind::Unk,
                data: TokenData::Text("error: Incomplete function definition".to_string()),
                source: start_line.to_string(),
                parse_error: Some("Incomplete function definition".to_string()),
                ..Token::default()
            }];
        };

        let mut spec_token = Token::text(TokenKind::Str, param_spec.clone());
        spec_token.source = param_spec.clone();
        let mut fnc = Token::text(TokenKind::Fnc, "function");
        fnc.returns = return_type.clone();
        fnc.parameters = vec![
            spec_token,
            body,
            Token::new(TokenKind::Unk, TokenData::Bool(false)),
        ];

        let mut accepts = Vec::new();
        if !param_spec.trim().is_empty() {
            for part in param_spec.split(',') {
                let words: Vec<&str> = part.trim().split_whitespace().collect();
                if words.len() >= 2 {
                    accepts.push(words[1].to_string());
                } else {
                    accepts.push("any".to_string());
                }
            }
        }
        self.function_return_types.insert(
            func_name.clone(),
            FunctionSignature {
                accepts,
                returns: return_type,
            },
        );

        let mut target = Token::text(TokenKind::Var, func_name.clone());
        target.source = func_name;
        vec![Token {
            kind: TokenKind::Asi,
            data: TokenData::Text("=".to_string()),
            source: start_line.to_string(),
            left: Some(Box::new(target)),
            right: Some(Box::new(fnc)),
            ..Token::default()
        }]
    }

    /// A statement that is a bare method chain ending in a call gets a `=??`
    /// prefix so the generator re-emits the whole chain as the line's value.
    fn rewrite_chain_statement(&mut self, ast: &mut Vec<Token>, start_line: &str, main: bool) {
        if ast.len() != 1 || !main || ast[0].kind != TokenKind::Mtd {
            return;
        }
        let Some(segments) = ast[0].list() else {
            return;
        };
        if segments.is_empty() || segments.last().map(|t| t.kind) != Some(TokenKind::Mtv) {
            return;
        }

        let first_mtv = segments.iter().position(|t| t.kind == TokenKind::Mtv);
        let left: Vec<Token> = match first_mtv {
            Some(idx) if idx > 0 => segments[..idx].to_vec(),
            _ => vec![segments[0].clone()],
        };
        let first = if left.len() == 1 {
            left.into_iter().next().unwrap()
        } else {
            Token::new(TokenKind::Mtd, TokenData::List(left))
        };

        let mut asi = Token::text(TokenKind::Asi, "=??");
        asi.source = start_line.to_string();
        ast.insert(0, asi);
        ast.insert(0, first);
    }

    /// Folds assignments, capturing a declared target type from the word
    /// before the target and rewriting member-chain targets into `Rmt`.
    fn fold_assignments(&mut self, ast: &mut Vec<Token>, start: i32, start_line: &str) {
        let start_idx = if start < 0 { 1 } else { start as usize };
        let mut i = start_idx.max(1);
        while i < ast.len() {
            if ast[i].kind != TokenKind::Asi {
                i += 1;
                continue;
            }

            // `string x = …` — the word before the target is the declared type
            if i > 1 && ast[i].left.is_none() {
                if let TokenData::Text(word) = &ast[i - 2].data {
                    let lowered = word.to_lowercase();
                    ast[i].set_type = lowered;
                    ast.remove(i - 2);
                    i -= 1;
                }
            }

            if ast[i].left.is_none() && i >= 1 {
                if i + 1 < ast.len() {
                    let right = ast.remove(i + 1);
                    let left = ast.remove(i - 1);
                    let cur = &mut ast[i - 1];
                    cur.left = Some(Box::new(left));
                    cur.right = Some(Box::new(right));
                    i -= 1;
                } else {
                    let left = ast.remove(i - 1);
                    ast[i - 1].left = Some(Box::new(left));
                    i -= 1;
                }
            }

            // a member-chain target splits into path prefix + final segment
            if let Some(left) = &ast[i].left {
                if left.kind == TokenKind::Mtd {
                    if let Some(segments) = left.list() {
                        if !segments.is_empty() {
                            let path = segments[..segments.len() - 1].to_vec();
                            let final_seg = segments[segments.len() - 1].clone();
                            ast[i].left = Some(Box::new(Token {
                                kind: TokenKind::Rmt,
                                data: TokenData::List(path),
                                final_seg: Some(Box::new(final_seg)),
                                ..Token::default()
                            }));
                        }
                    }
                }
            }

            ast[i].source = start_line.to_string();
            i += 1;
        }
    }

    /// Parses a whole unit: normalises, lexes lines, builds each line's AST,
    /// transfers line markers, attaches blocks and validates statement shape.
    pub fn generate_full_ast(&mut self, code: &str, main: bool) -> Result<Vec<Vec<Token>>, String> {
        let code = self.pre_tokenise(code, main)?;

        let mut lines: Vec<Vec<Token>> = Vec::new();
        for line in self.tokenise_lines(&code) {
            let ast = self.generate_ast(line.trim(), -1, true);
            if !ast.is_empty() {
                lines.push(ast);
            }
        }

        // move `/@line N` markers onto the next real statement
        let mut i = 0;
        while i < lines.len() {
            let is_marker = lines[i].len() > 1
                && lines[i][0].kind == TokenKind::Unk
                && lines[i][0].is_text("/@line");
            if is_marker {
                if let TokenData::Number(n) = lines[i][1].data {
                    if i + 1 < lines.len() && !lines[i + 1].is_empty() {
                        lines[i + 1][0].line = n as usize;
                    }
                }
                lines.remove(i);
            } else {
                i += 1;
            }
        }
        lines.retain(|line| {
            !(line.len() == 1 && line[0].kind == TokenKind::Unk && line[0].is_text("/@line"))
        });

        let mut i = 0;
        while i < lines.len() {
            if lines[i].is_empty() {
                i += 1;
                continue;
            }

            let cmd_type = if lines[i][0].kind == TokenKind::Cmd {
                lines[i][0].data_text().to_string()
            } else {
                String::new()
            };

            // `local class …` marks the class itself local
            if cmd_type == "local"
                && lines[i].len() > 1
                && lines[i][1].kind == TokenKind::Cmd
                && lines[i][1].is_text("class")
            {
                let source = lines[i][0].source.clone();
                let line_no = lines[i][0].line;
                lines[i].remove(0);
                lines[i][0].kind = TokenKind::Cmd;
                lines[i][0].local = true;
                lines[i][0].source = source;
                lines[i][0].line = line_no;
                i += 1;
                continue;
            }

            if matches!(
                cmd_type.as_str(),
                "for" | "each" | "class" | "while" | "until"
            ) {
                if cmd_type == "each" {
                    if lines[i].last().map(|t| t.kind) != Some(TokenKind::Blk) {
                        let head = lines[i][0].clone();
                        lines[i] = self.generate_error(&head, "'each' loop missing body block");
                        i += 1;
                        continue;
                    }
                    let cur = &mut lines[i];
                    let block_last = (cur.len() == 4 && cur[3].kind == TokenKind::Blk)
                        || (cur.len() == 5 && cur[4].kind == TokenKind::Blk);
                    if block_last {
                        cur[0].data = TokenData::Text("loop".to_string());
                    }
                } else if cmd_type == "while" || cmd_type == "until" {
                    if lines[i].len() > 1 {
                        let cond = lines[i][1].clone();
                        let source = cond.source.clone();
                        lines[i][1] = Token {
                            kind: TokenKind::Evl,
                            data: TokenData::Node(Box::new(cond)),
                            source,
                            ..Token::default()
                        };
                    }
                } else if lines[i].len() > 1 {
                    // for/class carry their first argument as a name
                    lines[i][1].kind = TokenKind::Str;
                }
            }

            if cmd_type == "def" {
                if lines[i].len() < 3 {
                    let head = lines[i][0].clone();
                    lines[i] = self.generate_error(&head, "Incomplete function definition");
                    i += 1;
                    continue;
                }
                if lines[i].last().map(|t| t.kind) != Some(TokenKind::Blk) {
                    let head = lines[i][0].clone();
                    lines[i] =
                        self.generate_error(&head, "Function body missing. Add a block: ( ... )");
                    i += 1;
                    continue;
                }
            }

            // block-opening command with the block on the following line
            if matches!(cmd_type.as_str(), "loop" | "if" | "while" | "until" | "for")
                && (lines[i].len() == 2 || (cmd_type == "for" && lines[i].len() == 3))
                && lines[i].last().map(|t| t.kind) != Some(TokenKind::Blk)
                && i + 1 < lines.len()
            {
                let next = lines.remove(i + 1);
                let block = if next.len() == 1 && next[0].kind == TokenKind::Blk {
                    next.into_iter().next().unwrap()
                } else {
                    Token {
                        kind: TokenKind::Blk,
                        data: TokenData::Block(vec![next]),
                        source: "[ast BLK]".to_string(),
                        ..Token::default()
                    }
                };
                lines[i].push(block);
            }

            // malformed operators and ternaries poison the whole line
            for j in 0..lines[i].len() {
                let t = &lines[i][j];
                if matches!(
                    t.kind,
                    TokenKind::Opr | TokenKind::Cmp | TokenKind::Bit | TokenKind::Log
                ) && (t.left.is_none() || t.right.is_none())
                {
                    let message = if j <= 1 {
                        format!("Malformed line. Cannot use '{}' here", t.data_text())
                    } else {
                        let missing = if t.left.is_some() {
                            "right operand"
                        } else if t.right.is_some() {
                            "left operand"
                        } else {
                            "operands"
                        };
                        format!(
                            "Malformed operator '{}'. Missing {}.",
                            t.data_text(),
                            missing
                        )
                    };
                    let at = lines[i][0].clone();
                    lines[i] = self.generate_error(&at, &message);
                    break;
                }
                if t.kind == TokenKind::Qst
                    && (t.left.is_none() || t.right.is_none() || t.right2.is_none())
                {
                    let at = t.clone();
                    lines[i] = self.generate_error(
                        &at,
                        "Incomplete ternary '?'. Expected pattern: condition ? valueIfTrue valueIfFalse",
                    );
                    break;
                }
            }

            i += 1;
        }

        Ok(lines)
    }
}

pub fn is_identifier(text: &str) -> bool {
    let trimmed = text.trim_start_matches('!');
    if trimmed.is_empty() {
        return false;
    }
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// First-error-wins: returns the first diagnostic recorded anywhere in the
/// statement list, formatted with its line number.
pub fn first_error(ast: &[Vec<Token>]) -> Option<String> {
    fn walk(token: &Token) -> Option<String> {
        if let Some(err) = &token.parse_error {
            if token.line > 0 {
                return Some(format!("Line {}: {}", token.line, err));
            }
            return Some(err.clone());
        }
        for child in [&token.left, &token.right, &token.right2, &token.final_seg]
            .into_iter()
            .flatten()
        {
            if let Some(err) = walk(child) {
                return Some(err);
            }
        }
        for p in &token.parameters {
            if let Some(err) = walk(p) {
                return Some(err);
            }
        }
        match &token.data {
            TokenData::Node(inner) => walk(inner),
            TokenData::List(items) => items.iter().find_map(walk),
            TokenData::Pairs(pairs) => pairs.iter().find_map(|(k, v)| walk(k).or_else(|| walk(v))),
            TokenData::Block(block) => block.iter().flatten().find_map(walk),
            TokenData::Modifier(_, arg) => walk(arg),
            _ => None,
        }
    }
    ast.iter().flatten().find_map(walk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_line(code: &str) -> Vec<Token> {
        let mut parser = Parser::new();
        let ast = parser.generate_full_ast(code, true).expect("parse failed");
        assert_eq!(ast.len(), 1, "expected a single statement for {code:?}");
        ast.into_iter().next().unwrap()
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let mut parser = Parser::new();
        let ast = parser.generate_ast("a + b * c", 0, false);
        assert_eq!(ast.len(), 1);
        let plus = &ast[0];
        assert_eq!(plus.kind, TokenKind::Opr);
        assert!(plus.is_text("+"));
        assert!(plus.left.as_ref().unwrap().is_text("a"));
        let right = plus.right.as_ref().unwrap();
        assert_eq!(right.kind, TokenKind::Opr);
        assert!(right.is_text("*"));
    }

    #[test]
    fn comparisons_fold_before_logic() {
        let mut parser = Parser::new();
        let ast = parser.generate_ast("a == b and c == d", 0, false);
        assert_eq!(ast.len(), 1);
        let and = &ast[0];
        assert_eq!(and.kind, TokenKind::Log);
        assert_eq!(and.left.as_ref().unwrap().kind, TokenKind::Cmp);
        assert_eq!(and.right.as_ref().unwrap().kind, TokenKind::Cmp);
    }

    #[test]
    fn ternary_nests_in_its_else_arm() {
        let mut parser = Parser::new();
        let ast = parser.generate_ast("a ? b c ? d e", 0, false);
        assert_eq!(ast.len(), 1);
        let outer = &ast[0];
        assert_eq!(outer.kind, TokenKind::Qst);
        assert!(outer.left.as_ref().unwrap().is_text("a"));
        assert!(outer.right.as_ref().unwrap().is_text("b"));
        let inner = outer.right2.as_ref().unwrap();
        assert_eq!(inner.kind, TokenKind::Qst);
        assert!(inner.left.as_ref().unwrap().is_text("c"));
    }

    #[test]
    fn subscript_lowers_to_item_method_value() {
        let line = parse_line("log x[1].toStr");
        assert_eq!(line.len(), 2);
        let chain = &line[1];
        assert_eq!(chain.kind, TokenKind::Mtd);
        let segments = chain.list().unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].kind, TokenKind::Var);
        assert!(segments[0].is_text("x"));
        assert_eq!(segments[1].kind, TokenKind::Mtv);
        assert!(segments[1].is_text("item"));
        assert_eq!(segments[1].parameters.len(), 1);
        assert_eq!(segments[2].kind, TokenKind::Var);
        assert!(segments[2].is_text("toStr"));
    }

    #[test]
    fn member_assignment_target_splits_path_and_final() {
        let line = parse_line("obj.a.b = v");
        assert_eq!(line.len(), 1);
        let asi = &line[0];
        assert_eq!(asi.kind, TokenKind::Asi);
        let target = asi.left.as_ref().unwrap();
        assert_eq!(target.kind, TokenKind::Rmt);
        let path = target.list().unwrap();
        assert_eq!(path.len(), 2);
        assert!(path[0].is_text("obj"));
        assert!(path[1].is_text("a"));
        assert!(target.final_seg.as_ref().unwrap().is_text("b"));
    }

    #[test]
    fn def_rewrites_to_function_assignment() {
        let line = parse_line("def add(a, b) (\nreturn a + b\n)");
        assert_eq!(line.len(), 1);
        let asi = &line[0];
        assert_eq!(asi.kind, TokenKind::Asi);
        assert!(asi.left.as_ref().unwrap().is_text("add"));
        let fnc = asi.right.as_ref().unwrap();
        assert_eq!(fnc.kind, TokenKind::Fnc);
        assert!(fnc.is_text("function"));
        assert_eq!(fnc.parameters[0].data_text(), "a,b");
        assert_eq!(fnc.parameters[1].kind, TokenKind::Blk);
    }

    #[test]
    fn def_registers_declared_signature() {
        let mut parser = Parser::new();
        parser
            .generate_full_ast("def scale(n number) number (\nreturn n * 2\n)", true)
            .unwrap();
        let sig = parser.function_return_types.get("scale").unwrap();
        assert_eq!(sig.returns, "number");
        assert_eq!(sig.accepts, vec!["number".to_string()]);
    }

    #[test]
    fn postfix_increment_becomes_assignment() {
        let line = parse_line("x ++");
        assert_eq!(line.len(), 1);
        assert_eq!(line[0].kind, TokenKind::Asi);
        assert!(line[0].is_text("++"));
        assert!(line[0].left.as_ref().unwrap().is_text("x"));
        assert!(line[0].right.is_none());
    }

    #[test]
    fn typed_assignment_captures_set_type() {
        let line = parse_line("int x = 5");
        assert_eq!(line.len(), 1);
        assert_eq!(line[0].kind, TokenKind::Asi);
        assert_eq!(line[0].set_type, "int");
        assert!(line[0].left.as_ref().unwrap().is_text("x"));
    }

    #[test]
    fn while_condition_is_wrapped_for_reevaluation() {
        let mut parser = Parser::new();
        let ast = parser
            .generate_full_ast("while x < 10 (\nx ++\n)", true)
            .unwrap();
        assert_eq!(ast.len(), 1);
        assert_eq!(ast[0][1].kind, TokenKind::Evl);
    }

    #[test]
    fn template_string_interleaves_fragments_and_expressions() {
        let mut parser = Parser::new();
        let ast = parser.generate_ast("`a ${x} b`", 0, false);
        assert_eq!(ast.len(), 1);
        let tsr = &ast[0];
        assert_eq!(tsr.kind, TokenKind::Tsr);
        let parts = tsr.list().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].kind, TokenKind::Str);
        assert_eq!(parts[1].kind, TokenKind::Var);
        assert_eq!(parts[2].kind, TokenKind::Str);
    }

    #[test]
    fn malformed_operator_reports_first_error() {
        let mut parser = Parser::new();
        let ast = parser.generate_full_ast("x = 1 +", true).unwrap();
        let err = first_error(&ast).expect("expected a parse error");
        assert!(err.contains("Malformed"), "got {err:?}");
    }

    #[test]
    fn unterminated_string_is_a_lex_error() {
        let mut parser = Parser::new();
        let err = parser.generate_full_ast("log \"oops", true).unwrap_err();
        assert!(err.contains("unterminated string"), "got {err:?}");
    }

    #[test]
    fn line_markers_transfer_to_statements() {
        let mut parser = Parser::new();
        let ast = parser
            .generate_full_ast("x = 1\ny = 2\nz = 3", true)
            .unwrap();
        assert_eq!(ast.len(), 3);
        assert_eq!(ast[0][0].line, 1);
        assert_eq!(ast[1][0].line, 2);
        assert_eq!(ast[2][0].line, 3);
    }

    #[test]
    fn lexer_keeps_balanced_brackets_together() {
        let parser = Parser::new();
        let lexemes = parser.tokenise_line("log [1, 2, 3].sort");
        assert_eq!(lexemes, vec!["log", "[1, 2, 3].sort"]);
    }

    #[test]
    fn lexer_splits_glued_operators() {
        let parser = Parser::new();
        let lexemes = parser.tokenise_line("log a+b");
        assert!(lexemes.contains(&"+".to_string()), "got {lexemes:?}");
    }

    #[test]
    fn spaces_inside_strings_do_not_split() {
        let parser = Parser::new();
        let lexemes = parser.tokenise_line("log \"hello world\"");
        assert_eq!(lexemes, vec!["log", "\"hello world\""]);
    }

    #[test]
    fn modifiers_capture_the_line_tail() {
        let line = parse_line("square 10 10 0 : c#FF0000 chx#5");
        let mods: Vec<&Token> = line.iter().filter(|t| t.kind == TokenKind::Mod).collect();
        assert_eq!(mods.len(), 2);
        match &mods[0].data {
            TokenData::Modifier(name, arg) => {
                assert_eq!(name, "c");
                assert!(arg.is_text("FF0000"));
            }
            other => panic!("expected modifier payload, got {other:?}"),
        }
    }

    #[test]
    fn normalisation_is_idempotent_on_lf_sources() {
        let parser = Parser::new();
        let src = "x = 1\nlog x";
        let once = parser.pre_tokenise(src, false).unwrap();
        assert_eq!(once, src);
        let twice = parser.pre_tokenise(&once, false).unwrap();
        assert_eq!(twice, once);
    }

    #[test]
    fn brackets_inside_strings_do_not_affect_depth() {
        let parser = Parser::new();
        let lexemes = parser.tokenise_line("log \"a(b\" x");
        assert_eq!(lexemes, vec!["log", "\"a(b\"", "x"]);
    }

    #[test]
    fn nested_brackets_stay_one_lexeme() {
        let parser = Parser::new();
        let lexemes = parser.tokenise_line("log f(a, (b + c))");
        assert_eq!(lexemes, vec!["log", "f(a, (b + c))"]);
    }

    #[test]
    fn spread_wraps_the_inner_expression() {
        let mut parser = Parser::new();
        let ast = parser.generate_ast("...items", 0, false);
        assert_eq!(ast[0].kind, TokenKind::Spr);
        match &ast[0].data {
            TokenData::Node(inner) => assert!(inner.is_text("items")),
            other => panic!("expected wrapped node, got {other:?}"),
        }
    }
}
