use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::parser::{
    first_error, FunctionSignature, Parser, Token, TokenData, TokenKind, ValueType,
};

/// The emitted runtime owns every identifier starting with this prefix.
pub const RUNTIME_PREFIX: &str = "QL";

const FONT_URL: &str = "https://raw.githubusercontent.com/quill-lang/assets/main/fonts/quill.qjf";

const DRAWING_COMMANDS: &[&str] = &[
    "c",
    "color",
    "colour",
    "goto",
    "change",
    "change_x",
    "change_y",
    "loc",
    "square",
    "icon",
    "text",
    "centext",
    "turnright",
    "turnleft",
    "pointat",
    "direction",
];

const GO_KEYWORDS: &[&str] = &[
    "if", "else", "for", "switch", "case", "default", "break", "continue", "return", "goto",
    "defer", "go", "fallthrough",
];

fn base_imports() -> Vec<&'static str> {
    vec![
        "fmt",
        "math/rand",
        "strconv",
        "strings",
        "bytes",
        "encoding/json",
        "bufio",
        "os",
        "reflect",
        "io",
        "time",
        "math",
        "runtime",
        "sort",
        "sync",
    ]
}

fn package_source(name: &str) -> Option<&'static str> {
    match name {
        "std" => Some(include_str!("../packages/std.go")),
        "arrays" => Some(include_str!("../packages/arrays.go")),
        "objects" => Some(include_str!("../packages/objects.go")),
        "lock" => Some(include_str!("../packages/lock.go")),
        "requests" => Some(include_str!("../packages/requests.go")),
        "fs" => Some(include_str!("../packages/fs.go")),
        "sys" => Some(include_str!("../packages/sys.go")),
        "ws" => Some(include_str!("../packages/ws.go")),
        "window" => Some(include_str!("../packages/window.go")),
        "colors" => Some(include_str!("../packages/colors.go")),
        "cmd" => Some(include_str!("../packages/cmd.go")),
        _ => None,
    }
}

/// A user extension method registered on one of the six primitive types.
#[derive(Debug, Clone)]
pub struct MethodDefinition {
    pub return_type: String,
    pub token: Token,
}

/// Mutable state carried through every generator entry point.
pub struct Context<'a> {
    pub parser: &'a mut Parser,
    pub base_dir: PathBuf,

    pub declared_vars: HashSet<String>,
    pub variable_types: HashMap<String, String>,
    pub global_declared_vars: HashSet<String>,
    pub global_variable_types: HashMap<String, String>,
    pub function_signatures: HashMap<String, FunctionSignature>,

    pub self_types: HashMap<String, String>,
    pub self_used: bool,
    pub custom_commands: HashSet<String>,
    pub user_types: HashMap<String, String>,
    // (receiver primitive, method name, definition), in registration order
    pub builtin_type_methods: Vec<(String, String, MethodDefinition)>,

    pub imports: HashSet<String>,
    pub import_order: Vec<String>,
    pub import_aliases: HashMap<String, String>,

    pub indent: usize,
    pub scope_level: usize,
    pub is_init: bool,
    // true while compiling extracted declarations that land at package level
    pub top_level: bool,
    pub global_vars: String,
    pub temp_counter: usize,
}

impl<'a> Context<'a> {
    fn new(parser: &'a mut Parser, base_dir: &Path) -> Self {
        let mut imports = HashSet::new();
        let mut import_order = Vec::new();
        for pkg in base_imports() {
            imports.insert(pkg.to_string());
            import_order.push(pkg.to_string());
        }
        let mut import_aliases = HashMap::new();
        import_aliases.insert("io".to_string(), format!("{RUNTIME_PREFIX}io"));
        import_aliases.insert("math/rand".to_string(), format!("{RUNTIME_PREFIX}rand"));

        let function_signatures = parser.function_return_types.clone();

        Context {
            parser,
            base_dir: base_dir.to_path_buf(),
            declared_vars: HashSet::new(),
            variable_types: HashMap::new(),
            global_declared_vars: HashSet::new(),
            global_variable_types: HashMap::new(),
            function_signatures,
            self_types: HashMap::new(),
            self_used: false,
            custom_commands: HashSet::new(),
            user_types: HashMap::new(),
            builtin_type_methods: Vec::new(),
            imports,
            import_order,
            import_aliases,
            indent: 0,
            scope_level: 0,
            is_init: false,
            top_level: false,
            global_vars: String::new(),
            temp_counter: 0,
        }
    }

    fn fresh_iterator(&mut self) -> String {
        self.temp_counter += 1;
        format!("i_{}", self.temp_counter)
    }

    fn add_import(&mut self, path: &str) {
        if self.imports.insert(path.to_string()) {
            self.import_order.push(path.to_string());
        }
    }

    fn add_import_front(&mut self, path: &str) {
        if self.imports.insert(path.to_string()) {
            self.import_order.insert(0, path.to_string());
        }
    }

    fn builtin_method(&self, type_name: &str, method: &str) -> Option<&MethodDefinition> {
        self.builtin_type_methods
            .iter()
            .find(|(t, m, _)| t == type_name && m == method)
            .map(|(_, _, def)| def)
    }

    fn register_builtin_method(&mut self, type_name: &str, method: &str, def: MethodDefinition) {
        self.builtin_type_methods
            .retain(|(t, m, _)| !(t == type_name && m == method));
        self.builtin_type_methods
            .push((type_name.to_string(), method.to_string(), def));
    }

    fn lookup_var_type(&self, name: &str) -> Option<&String> {
        self.variable_types
            .get(name)
            .or_else(|| self.global_variable_types.get(name))
    }
}

/// Maps a source type name onto the corresponding Go type.
fn map_type(ctx: &Context, name: &str) -> String {
    match name {
        "string" => "string".to_string(),
        "int" => "int".to_string(),
        "number" => "float64".to_string(),
        "boolean" => "bool".to_string(),
        "object" => "map[string]any".to_string(),
        "array" => "[]any".to_string(),
        "any" => "any".to_string(),
        _ => {
            if let Some(inner) = name.strip_suffix("[]") {
                return format!("[]{}", map_type(ctx, inner));
            }
            if let Some(go) = ctx.user_types.get(name) {
                return go.clone();
            }
            name.to_string()
        }
    }
}

fn is_primitive_type_name(name: &str) -> bool {
    matches!(
        name,
        "string" | "int" | "number" | "boolean" | "object" | "array"
    )
}

fn primitive_name_for(vt: ValueType) -> Option<&'static str> {
    match vt {
        ValueType::Str => Some("string"),
        ValueType::Int => Some("int"),
        ValueType::Num => Some("number"),
        ValueType::Bool => Some("boolean"),
        ValueType::Obj => Some("object"),
        ValueType::Arr => Some("array"),
        ValueType::Any => None,
    }
}

fn value_type_for_go(go: &str) -> Option<ValueType> {
    match go {
        "string" => Some(ValueType::Str),
        "int" => Some(ValueType::Int),
        "float64" => Some(ValueType::Num),
        "bool" => Some(ValueType::Bool),
        "map[string]any" => Some(ValueType::Obj),
        "[]any" => Some(ValueType::Arr),
        _ => None,
    }
}

fn value_type_for_source(name: &str) -> Option<ValueType> {
    match name {
        "string" => Some(ValueType::Str),
        "int" => Some(ValueType::Int),
        "number" => Some(ValueType::Num),
        "boolean" => Some(ValueType::Bool),
        "object" => Some(ValueType::Obj),
        "array" => Some(ValueType::Arr),
        _ => None,
    }
}

fn is_number_compatible(t: Option<ValueType>) -> bool {
    matches!(t, Some(ValueType::Num) | Some(ValueType::Int))
}

/// True when the inferred type is known and definitely not `target`.
fn is_absolutely_not(t: Option<ValueType>, target: ValueType) -> bool {
    matches!(t, Some(v) if v != target && v != ValueType::Any)
}

fn json_quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("{text:?}"))
}

/// Wraps an expression in the string cast unless it is already a string.
fn cast_to_string(expr: &str, hint: Option<ValueType>) -> String {
    if hint == Some(ValueType::Str) {
        expr.to_string()
    } else {
        format!("{RUNTIME_PREFIX}toString({expr})")
    }
}

/// Floats an `Int`-typed operand up to float64 for mixed arithmetic.
fn widen_numeric(expr: String, t: Option<ValueType>) -> String {
    if t == Some(ValueType::Int) {
        format!("float64({expr})")
    } else {
        expr
    }
}

fn add_indent(text: &str, indent: usize) -> String {
    format!("{}{}", " ".repeat(indent), text)
}

/// Indents every non-empty line of an emitted body by `levels` tab stops.
fn indent_block(text: &str, levels: usize) -> String {
    let pad = "\t".repeat(levels);
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if !line.trim().is_empty() {
            out.push_str(&pad);
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

fn prefix_line_error(err: String, line: usize, source: &str) -> String {
    if err.starts_with("Line ") {
        return err;
    }
    if line > 0 {
        if source.is_empty() {
            format!("Line {line}: {err}")
        } else {
            format!("Line {line}: in '{source}': {err}")
        }
    } else {
        err
    }
}

/// Scans the unit for drawing commands or line modifiers.
pub fn has_drawing_commands(ast: &[Vec<Token>]) -> bool {
    for line in ast {
        if let Some(first) = line.first() {
            if first.kind == TokenKind::Cmd && DRAWING_COMMANDS.contains(&first.data_text()) {
                return true;
            }
        }
        for token in line {
            if token.kind == TokenKind::Mod {
                return true;
            }
        }
    }
    false
}

fn has_return_statement(block: &[Vec<Token>]) -> bool {
    for line in block {
        let Some(first) = line.first() else { continue };
        if first.kind == TokenKind::Cmd && first.is_text("return") {
            return true;
        }
        for token in line {
            if token.kind == TokenKind::Blk {
                if let Some(inner) = token.block() {
                    if has_return_statement(inner) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

fn ends_with_return(body: &str) -> bool {
    body.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().starts_with("return"))
        .unwrap_or(false)
}

/// Best-effort type of an assignment right-hand side before generation runs.
/// Literals are decisive; everything else stays dynamic.
fn literal_go_type(token: &Token) -> String {
    match token.kind {
        TokenKind::Num => "float64".to_string(),
        TokenKind::Str | TokenKind::Tsr => "string".to_string(),
        TokenKind::Raw => "bool".to_string(),
        TokenKind::Arr => "[]any".to_string(),
        TokenKind::Obj => "map[string]any".to_string(),
        _ => "any".to_string(),
    }
}

/// Records identifiers assigned inside nested blocks so their declaration can
/// be hoisted to the top of the enclosing scope. Assignments at the block's
/// own level declare themselves when they compile.
fn collect_declarations(
    block: &[Vec<Token>],
    ctx: &Context,
    depth: usize,
    seen: &mut HashSet<String>,
    out: &mut Vec<(String, String)>,
) {
    for line in block {
        if let Some(first) = line.first() {
            if first.kind == TokenKind::Asi && depth > 0 {
                if let Some(left) = &first.left {
                    if left.kind == TokenKind::Var {
                        let name = left.data_text().to_string();
                        if !name.is_empty()
                            && !seen.contains(&name)
                            && !ctx.declared_vars.contains(&name)
                            && !ctx.global_declared_vars.contains(&name)
                        {
                            let var_type = if !first.set_type.is_empty() {
                                map_type(ctx, &first.set_type)
                            } else if let Some(right) = &first.right {
                                literal_go_type(right)
                            } else {
                                "any".to_string()
                            };
                            seen.insert(name.clone());
                            out.push((name, var_type));
                        }
                    }
                }
            }
        }

        for token in line {
            if token.kind == TokenKind::Blk {
                if let Some(inner) = token.block() {
                    collect_declarations(inner, ctx, depth + 1, seen, out);
                }
            }
        }
    }
}

pub fn compile_block(block: &mut [Vec<Token>], ctx: &mut Context) -> Result<String, String> {
    let mut out = String::new();

    let mut seen = HashSet::new();
    let mut decls = Vec::new();
    collect_declarations(block, ctx, 0, &mut seen, &mut decls);

    for (name, var_type) in decls {
        if ctx.declared_vars.insert(name.clone()) {
            ctx.variable_types.insert(name.clone(), var_type.clone());
            if ctx.is_init && ctx.indent == 0 {
                ctx.global_vars
                    .push_str(&format!("var {name} {var_type}\n"));
                ctx.global_declared_vars.insert(name);
            } else {
                out.push_str(&add_indent(
                    &format!("var {name} {var_type}\n"),
                    ctx.indent * 2,
                ));
            }
        }
    }

    for line in block.iter_mut() {
        let compiled = compile_line(line, ctx)?;
        out.push_str(&add_indent(&compiled, ctx.indent * 2));
    }

    Ok(out)
}

fn compile_modifier(modifier: &Token, ctx: &mut Context) -> Result<String, String> {
    let (name, arg) = match &modifier.data {
        TokenData::Modifier(name, arg) => {
            let arg_token = if name == "c" {
                // colour modifiers carry their raw spelling
                Token {
                    kind: TokenKind::Str,
                    data: TokenData::Text(arg.source.clone()),
                    source: arg.source.clone(),
                    ..Token::default()
                }
            } else {
                (**arg).clone()
            };
            (name.clone(), Some(arg_token))
        }
        TokenData::Text(text) => match text.split_once('#') {
            Some((name, value)) => (
                name.to_string(),
                Some(Token::text(TokenKind::Str, value.to_string())),
            ),
            None => (text.clone(), None),
        },
        _ => (String::new(), None),
    };

    let full_name = match name.as_str() {
        "c" => "color",
        "chx" => "change_x",
        "chy" => "change_y",
        other => other,
    };

    let mut cmd_tokens = vec![Token::text(TokenKind::Cmd, full_name)];
    if let Some(arg) = arg {
        cmd_tokens.push(arg);
    }
    compile_cmd(&mut cmd_tokens, ctx)
}

pub fn compile_line(line: &mut Vec<Token>, ctx: &mut Context) -> Result<String, String> {
    let line_no = line.first().map(|t| t.line).unwrap_or(0);
    compile_line_inner(line, ctx).map_err(|e| prefix_line_error(e, line_no, ""))
}

fn compile_line_inner(line: &mut Vec<Token>, ctx: &mut Context) -> Result<String, String> {
    let taken = std::mem::take(line);
    let (modifiers, mut main): (Vec<Token>, Vec<Token>) =
        taken.into_iter().partition(|t| t.kind == TokenKind::Mod);

    let mut out = String::new();
    // modifiers emit before the main statement
    for modifier in &modifiers {
        out.push_str(&compile_modifier(modifier, ctx)?);
    }

    if main.is_empty() {
        out.push('\n');
        return Ok(out);
    }

    if main[0].kind == TokenKind::Cmd {
        out.push_str(&compile_cmd(&mut main, ctx)?);
        return Ok(out);
    }

    for token in main.iter_mut() {
        out.push_str(&compile_token(token, ctx)?);
    }
    out.push('\n');
    Ok(out)
}

pub fn compile_token(token: &mut Token, ctx: &mut Context) -> Result<String, String> {
    let line = token.line;
    let source = token.source.clone();
    compile_token_inner(token, ctx).map_err(|e| prefix_line_error(e, line, &source))
}

fn compile_token_inner(token: &mut Token, ctx: &mut Context) -> Result<String, String> {
    match token.kind {
        TokenKind::Asi => compile_assignment(token, ctx),
        TokenKind::Opr => compile_operator(token, ctx),
        TokenKind::Cmp => compile_comparison(token, ctx),
        TokenKind::Log => compile_logic(token, ctx),
        TokenKind::Bit => {
            let op = match token.data_text() {
                "^^" => "^".to_string(),
                other => other.to_string(),
            };
            let left = compile_child(&mut token.left, ctx)?;
            let right = compile_child(&mut token.right, ctx)?;
            let lt = token.left.as_ref().and_then(|t| t.returned_type);
            let rt = token.right.as_ref().and_then(|t| t.returned_type);
            let left = cast_to_int(left, lt);
            let right = cast_to_int(right, rt);
            token.returned_type = Some(ValueType::Int);
            Ok(format!("{left} {op} {right}"))
        }
        TokenKind::Evl => {
            let out = match &mut token.data {
                TokenData::Node(inner) => {
                    let out = compile_token(inner, ctx)?;
                    token.returned_type = inner.returned_type;
                    out
                }
                _ => String::new(),
            };
            Ok(out)
        }
        TokenKind::Str => {
            token.returned_type = Some(ValueType::Str);
            Ok(json_quote(token.data_text()))
        }
        TokenKind::Num => {
            token.returned_type = Some(ValueType::Num);
            match &token.data {
                TokenData::Number(n) => Ok(format!("{n}")),
                _ => Ok("0".to_string()),
            }
        }
        TokenKind::Raw => match &token.data {
            TokenData::Bool(b) => {
                token.returned_type = Some(ValueType::Bool);
                Ok(format!("{b}"))
            }
            TokenData::Text(s) => {
                token.returned_type = Some(ValueType::Str);
                Ok(s.clone())
            }
            _ => Ok("nil".to_string()),
        },
        TokenKind::Var => compile_var(token, ctx),
        TokenKind::Blk => {
            ctx.indent += 1;
            let body = match token.block_mut() {
                Some(block) => {
                    let mut block = std::mem::take(block);
                    let out = compile_block(&mut block, ctx)?;
                    out
                }
                None => String::new(),
            };
            ctx.indent -= 1;
            Ok(format!("{{\n{body}{}", add_indent("}", ctx.indent * 2)))
        }
        TokenKind::Arr => {
            let wrap_indent = ctx.indent;
            ctx.indent += 1;
            let out = match &mut token.data {
                TokenData::List(items) => compile_array(items, ctx, wrap_indent)?,
                _ => "[]any{}".to_string(),
            };
            ctx.indent -= 1;
            token.returned_type = Some(ValueType::Arr);
            Ok(out)
        }
        TokenKind::Obj => {
            let wrap = ctx.indent == 0;
            let wrap_indent = ctx.indent;
            ctx.indent += 1;
            let out = match &mut token.data {
                TokenData::Pairs(pairs) => compile_object(pairs, ctx, wrap, wrap_indent)?,
                _ => {
                    if wrap {
                        format!("{RUNTIME_PREFIX}newSafeMap(map[string]any{{}})")
                    } else {
                        "map[string]any{}".to_string()
                    }
                }
            };
            ctx.indent -= 1;
            token.returned_type = Some(ValueType::Obj);
            Ok(out)
        }
        TokenKind::Tsr => {
            let mut pieces = Vec::new();
            if let TokenData::List(parts) = &mut token.data {
                for part in parts.iter_mut() {
                    if part.kind == TokenKind::Str {
                        pieces.push(json_quote(part.data_text()));
                    } else {
                        let compiled = compile_token(part, ctx)?;
                        pieces.push(cast_to_string(&compiled, part.returned_type));
                    }
                }
            }
            token.returned_type = Some(ValueType::Str);
            if pieces.is_empty() {
                return Ok("\"\"".to_string());
            }
            Ok(pieces.join(" + "))
        }
        TokenKind::Rmt => {
            // read position: dynamic getter over the path's value
            let receiver = compile_rmt_receiver(token, ctx)?;
            let key = compile_rmt_key(token, ctx)?;
            Ok(format!("{RUNTIME_PREFIX}getItem({receiver}, {key})"))
        }
        TokenKind::Fnc => compile_call(token, ctx),
        TokenKind::Ury => {
            let op = token.data_text().to_string();
            let value = compile_child(&mut token.right, ctx)?;
            match op.as_str() {
                "@" => Ok(format!("&{value}")),
                "!" => {
                    token.returned_type = Some(ValueType::Bool);
                    Ok(format!("({value} != true)"))
                }
                _ => Ok(format!("{op}{value}")),
            }
        }
        TokenKind::Spr => {
            let inner = match &mut token.data {
                TokenData::Node(node) => compile_token(node, ctx)?,
                _ => String::new(),
            };
            Ok(format!("{inner}..."))
        }
        TokenKind::Mtv => {
            let name = token.data_text().to_string();
            let mut params = Vec::new();
            for p in token.parameters.iter_mut() {
                params.push(compile_token(p, ctx)?);
            }
            Ok(format!("{name}({})", params.join(", ")))
        }
        TokenKind::Mtd => compile_method_chain(token, ctx),
        TokenKind::Qst => {
            if token.left.is_none() || token.right.is_none() || token.right2.is_none() {
                return Ok("nil".to_string());
            }
            let cond = compile_child(&mut token.left, ctx)?;
            let ct = token.left.as_ref().and_then(|t| t.returned_type);
            let cond = if ct == Some(ValueType::Bool) {
                cond
            } else {
                format!("{RUNTIME_PREFIX}castBool({cond})")
            };
            let yes = compile_child(&mut token.right, ctx)?;
            let no = compile_child(&mut token.right2, ctx)?;
            Ok(format!(
                "func() any {{ if {cond} {{ return {yes} }} else {{ return {no} }} }}()"
            ))
        }
        TokenKind::Unk => match &token.data {
            TokenData::Text(data) => {
                if crate::parser::is_identifier(data) {
                    Ok(data.clone())
                } else {
                    Ok(json_quote(data))
                }
            }
            _ => Ok("nil".to_string()),
        },
        _ => Ok(String::new()),
    }
}

fn compile_child(slot: &mut Option<Box<Token>>, ctx: &mut Context) -> Result<String, String> {
    match slot {
        Some(token) => compile_token(token, ctx),
        None => Ok(String::new()),
    }
}

fn cast_to_int(expr: String, t: Option<ValueType>) -> String {
    match t {
        Some(ValueType::Int) => expr,
        Some(ValueType::Num) => format!("int({expr})"),
        _ => format!("{RUNTIME_PREFIX}castInt({expr})"),
    }
}

fn compile_var(token: &mut Token, ctx: &mut Context) -> Result<String, String> {
    let name = token.data_text().to_string();
    if name.starts_with(RUNTIME_PREFIX) {
        return Err(format!("Cannot use reserved variable name: {name}"));
    }
    match name.as_str() {
        "self" => {
            ctx.self_used = true;
            Ok(format!("{RUNTIME_PREFIX}self"))
        }
        "null" => Ok("nil".to_string()),
        "timer" => {
            token.returned_type = Some(ValueType::Num);
            Ok("timer".to_string())
        }
        "timestamp" => {
            token.returned_type = Some(ValueType::Num);
            Ok("float64(time.Now().UnixMilli())".to_string())
        }
        "performance" => {
            token.returned_type = Some(ValueType::Num);
            Ok("float64(time.Now().UnixMicro())".to_string())
        }
        _ => {
            if let Some(go_type) = ctx.lookup_var_type(&name) {
                token.returned_type = value_type_for_go(go_type);
            }
            Ok(name)
        }
    }
}

/// The cast-insertion table for a declared target type (§ assignment lowering).
fn insert_cast(ctx: &Context, source_type: &str, right: String, rt: Option<ValueType>) -> String {
    match source_type {
        "string" => {
            if rt != Some(ValueType::Str) {
                format!("{RUNTIME_PREFIX}toString({right})")
            } else {
                right
            }
        }
        "int" => {
            if rt == Some(ValueType::Int) {
                right
            } else if rt == Some(ValueType::Num) {
                if let Some(rest) = right.strip_prefix(&format!("{RUNTIME_PREFIX}castNumber(")) {
                    format!("{RUNTIME_PREFIX}castInt({rest}")
                } else {
                    format!("int({right})")
                }
            } else {
                format!("{RUNTIME_PREFIX}castInt({right})")
            }
        }
        "number" => {
            if rt != Some(ValueType::Num) {
                format!("{RUNTIME_PREFIX}castNumber({right})")
            } else {
                right
            }
        }
        "boolean" => {
            if rt != Some(ValueType::Bool) {
                format!("{RUNTIME_PREFIX}castBool({right})")
            } else {
                right
            }
        }
        "array" => {
            if rt != Some(ValueType::Arr) {
                if right.starts_with(&format!("{RUNTIME_PREFIX}getItem(")) {
                    format!("{right}.([]any)")
                } else {
                    format!("{RUNTIME_PREFIX}castArray({right})")
                }
            } else {
                right
            }
        }
        "object" => {
            if rt != Some(ValueType::Obj) {
                if right.starts_with(&format!("{RUNTIME_PREFIX}getItem(")) {
                    format!("{right}.(map[string]any)")
                } else {
                    format!("{RUNTIME_PREFIX}castObject({right})")
                }
            } else {
                right
            }
        }
        _ => {
            let _ = ctx;
            right
        }
    }
}

/// Re-align a right-hand side with an already-declared variable's Go type.
fn cast_toward(go_type: &str, right: String, rt: Option<ValueType>) -> String {
    let Some(expected) = value_type_for_go(go_type) else {
        return right;
    };
    if rt == Some(expected) {
        return right;
    }
    let get_item = right.starts_with(&format!("{RUNTIME_PREFIX}getItem("));
    match expected {
        ValueType::Str => format!("{RUNTIME_PREFIX}toString({right})"),
        ValueType::Int => {
            if rt == Some(ValueType::Num) {
                format!("int({right})")
            } else {
                format!("{RUNTIME_PREFIX}castInt({right})")
            }
        }
        ValueType::Num => {
            if rt == Some(ValueType::Int) {
                format!("float64({right})")
            } else {
                format!("{RUNTIME_PREFIX}castNumber({right})")
            }
        }
        ValueType::Bool => format!("{RUNTIME_PREFIX}castBool({right})"),
        ValueType::Arr => {
            if get_item {
                format!("{right}.([]any)")
            } else {
                format!("{RUNTIME_PREFIX}castArray({right})")
            }
        }
        ValueType::Obj => {
            if get_item {
                format!("{right}.(map[string]any)")
            } else {
                format!("{RUNTIME_PREFIX}castObject({right})")
            }
        }
        ValueType::Any => right,
    }
}

fn sniff_helper_type(right: &str) -> Option<&'static str> {
    let pairs = [
        ("toString(", "string"),
        ("castNumber(", "float64"),
        ("castInt(", "int"),
        ("castBool(", "bool"),
        ("castObject(", "map[string]any"),
        ("castArray(", "[]any"),
    ];
    for (suffix, go) in pairs {
        if right.starts_with(&format!("{RUNTIME_PREFIX}{suffix}")) {
            return Some(go);
        }
    }
    None
}

fn compile_assignment(token: &mut Token, ctx: &mut Context) -> Result<String, String> {
    let op_raw = token.data_text().to_string();

    // top-level named function
    let left_is_var = matches!(&token.left, Some(l) if l.kind == TokenKind::Var);
    let right_is_function = matches!(&token.right, Some(r) if r.kind == TokenKind::Fnc && r.is_text("function"));
    if ctx.top_level && ctx.indent == 0 && left_is_var && right_is_function {
        return compile_named_function(token, ctx);
    }

    // member-chain target
    if matches!(&token.left, Some(l) if l.kind == TokenKind::Rmt) {
        return compile_member_assignment(token, ctx, &op_raw);
    }

    let mut right_str = compile_child(&mut token.right, ctx)?;
    let rt = token.right.as_ref().and_then(|t| t.returned_type);

    let (op, forced_right) = match op_raw.as_str() {
        "@=" | "=" => ("=", None),
        ":=" => (":=", None),
        "++" => ("+=", Some("1".to_string())),
        "--" => ("-=", Some("1".to_string())),
        "++=" => ("+=", None),
        "+=" => ("+=", None),
        "-=" => ("-=", None),
        "*=" => ("*=", None),
        "/=" => ("/=", None),
        "%=" => ("%=", None),
        "=??" => return Ok(right_str),
        other => (other, None),
    };
    if let Some(forced) = forced_right {
        right_str = forced;
    }

    let var_name = match &token.left {
        Some(l) if l.kind == TokenKind::Var => l.data_text().to_string(),
        _ => String::new(),
    };

    if var_name.is_empty() {
        let left_str = compile_child(&mut token.left, ctx)?;
        return Ok(format!("{left_str} {op} {right_str}"));
    }
    if var_name.starts_with(RUNTIME_PREFIX) {
        return Err(format!("Cannot use reserved variable name: {var_name}"));
    }

    let declared = ctx.declared_vars.contains(&var_name)
        || ctx.global_declared_vars.contains(&var_name);

    if !token.set_type.is_empty() {
        let go_type = map_type(ctx, &token.set_type);
        ctx.variable_types.insert(var_name.clone(), go_type.clone());
        right_str = insert_cast(ctx, &token.set_type, right_str, rt);
        if ctx.is_init && ctx.indent == 0 && (op == "=" || op == ":=") {
            ctx.global_vars
                .push_str(&format!("var {var_name} {go_type} = {right_str}\n"));
            ctx.global_declared_vars.insert(var_name.clone());
            ctx.declared_vars.insert(var_name);
            return Ok(String::new());
        }
        if declared {
            return Ok(format!("{var_name} = {right_str}"));
        }
        ctx.declared_vars.insert(var_name.clone());
        return Ok(format!("var {var_name} {go_type} = {right_str}"));
    }

    if !declared && (op == "=" || op == ":=") {
        if let Some(go) = sniff_helper_type(&right_str) {
            ctx.variable_types.insert(var_name.clone(), go.to_string());
        } else if let Some(vt) = rt {
            ctx.variable_types
                .insert(var_name.clone(), go_type_for(vt).to_string());
        }
        if ctx.is_init && ctx.indent == 0 && (op == "=" || op == ":=") {
            ctx.global_vars
                .push_str(&format!("var {var_name} = {right_str}\n"));
            ctx.global_declared_vars.insert(var_name.clone());
            ctx.declared_vars.insert(var_name);
            return Ok(String::new());
        }
        ctx.declared_vars.insert(var_name.clone());
        return Ok(format!("var {var_name} = {right_str}"));
    }

    if op == "=" {
        if let Some(expected) = ctx.lookup_var_type(&var_name).cloned() {
            right_str = cast_toward(&expected, right_str, rt);
        }
        return Ok(format!("{var_name} = {right_str}"));
    }
    if op == ":=" {
        return Ok(format!("{var_name} = {right_str}"));
    }
    Ok(format!("{var_name} {op} {right_str}"))
}

fn go_type_for(vt: ValueType) -> &'static str {
    match vt {
        ValueType::Str => "string",
        ValueType::Int => "int",
        ValueType::Num => "float64",
        ValueType::Bool => "bool",
        ValueType::Obj => "map[string]any",
        ValueType::Arr => "[]any",
        ValueType::Any => "any",
    }
}

/// Splits a `name type,name type` parameter spec into `(name, go_type)` pairs.
fn parse_param_spec(ctx: &Context, spec: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for arg in spec.split(',') {
        let arg = arg.trim();
        if arg.is_empty() {
            continue;
        }
        let mut words = arg.split_whitespace();
        let name = words.next().unwrap_or_default().to_string();
        let go_type = words
            .next()
            .map(|t| map_type(ctx, t))
            .unwrap_or_else(|| "any".to_string());
        out.push((name, go_type));
    }
    out
}

/// Emits the body of a function literal or named function: fresh variable
/// scope, declared parameters, the self receiver alias and the return-nil
/// completion policy.
fn compile_function_body(
    fnc: &mut Token,
    ctx: &mut Context,
    self_alias: Option<&str>,
) -> Result<(String, String, String, bool), String> {
    let spec = fnc
        .parameters
        .first()
        .map(|p| p.data_text().to_string())
        .unwrap_or_default();
    let params = parse_param_spec(ctx, &spec);

    let saved_declared = std::mem::take(&mut ctx.declared_vars);
    let saved_self = ctx.self_used;
    ctx.self_used = false;
    ctx.indent += 1;
    ctx.scope_level += 1;

    let mut params_string = String::new();
    for (name, go_type) in &params {
        ctx.declared_vars.insert(name.clone());
        ctx.variable_types.insert(name.clone(), go_type.clone());
        if !params_string.is_empty() {
            params_string.push_str(", ");
        }
        params_string.push_str(&format!("{name} {go_type}"));
    }

    let mut returns = if fnc.returns.is_empty() {
        "any ".to_string()
    } else {
        format!("{} ", map_type(ctx, &fnc.returns))
    };

    let mut body = String::new();
    let mut saw_return = false;
    if fnc.parameters.len() > 1 {
        if let Some(block) = fnc.parameters[1].block_mut() {
            let mut block = std::mem::take(block);
            saw_return = has_return_statement(&block);
            body = compile_block(&mut block, ctx)?;
        }
    }

    if ctx.self_used {
        match self_alias {
            Some(alias) if !alias.is_empty() => {
                body = add_indent(&format!("{alias}\n"), ctx.indent * 2) + &body;
            }
            Some(_) => {
                // the receiver is already bound as a parameter
            }
            None => {
                // receiver comes in as an extra leading parameter
                if params_string.is_empty() {
                    params_string = format!("{RUNTIME_PREFIX}self any");
                } else {
                    params_string = format!("{RUNTIME_PREFIX}self any, {params_string}");
                }
            }
        }
        ctx.self_used = false;
    }

    if fnc.returns.is_empty() && !saw_return {
        returns = "any ".to_string();
    }
    if returns == "any " && !ends_with_return(&body) {
        body.push_str(&add_indent("return nil\n", ctx.indent * 2));
    }

    ctx.scope_level -= 1;
    ctx.indent -= 1;
    ctx.declared_vars = saved_declared;
    ctx.self_used = saved_self;

    Ok((params_string, returns, body, saw_return))
}

fn compile_named_function(token: &mut Token, ctx: &mut Context) -> Result<String, String> {
    let name = token
        .left
        .as_ref()
        .map(|l| l.data_text().to_string())
        .unwrap_or_default();
    if name.starts_with(RUNTIME_PREFIX) {
        return Err(format!("Cannot use reserved variable name: {name}"));
    }

    let fnc = token.right.as_mut().unwrap();
    let (params, returns, body, _) = compile_function_body(fnc, ctx, None)?;
    Ok(format!("func {name}({params}) {returns}{{\n{body}}}\n"))
}

fn compile_rmt_receiver(token: &mut Token, ctx: &mut Context) -> Result<String, String> {
    let path = match &mut token.data {
        TokenData::List(path) => path,
        _ => return Ok("nil".to_string()),
    };
    match path.len() {
        0 => Ok("nil".to_string()),
        1 => compile_token(&mut path[0], ctx),
        _ => {
            let mut chain = Token::new(TokenKind::Mtd, TokenData::List(std::mem::take(path)));
            let out = compile_token(&mut chain, ctx)?;
            if let TokenData::List(items) = chain.data {
                *path = items;
            }
            Ok(out)
        }
    }
}

fn compile_rmt_key(token: &mut Token, ctx: &mut Context) -> Result<String, String> {
    let Some(final_seg) = token.final_seg.as_mut() else {
        return Ok("nil".to_string());
    };
    if final_seg.kind == TokenKind::Mtv && final_seg.is_text("item") {
        if !final_seg.parameters.is_empty() {
            return compile_token(&mut final_seg.parameters[0], ctx);
        }
        return Ok("nil".to_string());
    }
    if final_seg.kind == TokenKind::Var || final_seg.kind == TokenKind::Mtv {
        return Ok(json_quote(final_seg.data_text()));
    }
    compile_token(final_seg, ctx)
}

fn compile_member_assignment(
    token: &mut Token,
    ctx: &mut Context,
    op_raw: &str,
) -> Result<String, String> {
    // `Type.method = function` defines a method instead of storing a value
    let target_type = {
        let left = token.left.as_ref().unwrap();
        match left.list() {
            Some(path) if path.len() == 1 && path[0].kind == TokenKind::Var => {
                Some(path[0].data_text().to_string())
            }
            _ => None,
        }
    };
    let final_is_var = token
        .left
        .as_ref()
        .and_then(|l| l.final_seg.as_ref())
        .map(|f| f.kind == TokenKind::Var)
        .unwrap_or(false);
    let right_is_function =
        matches!(&token.right, Some(r) if r.kind == TokenKind::Fnc && r.is_text("function"));

    if ctx.top_level && ctx.indent == 0 && final_is_var && right_is_function {
        if let Some(type_name) = target_type {
            let method_name = token
                .left
                .as_ref()
                .unwrap()
                .final_seg
                .as_ref()
                .unwrap()
                .data_text()
                .to_string();

            if is_primitive_type_name(&type_name) {
                let fnc = token.right.as_ref().unwrap();
                ctx.register_builtin_method(
                    &type_name,
                    &method_name,
                    MethodDefinition {
                        return_type: fnc.returns.clone(),
                        token: (**fnc).clone(),
                    },
                );
                let _ = op_raw;
                return Ok(String::new());
            }

            if ctx.user_types.contains_key(&type_name) {
                let receiver = ctx.user_types.get(&type_name).cloned().unwrap();
                let fnc = token.right.as_mut().unwrap();
                let (params, returns, body, _) = compile_function_body(fnc, ctx, Some(""))?;
                return Ok(format!(
                    "func ({RUNTIME_PREFIX}self {receiver}) {method_name}({params}) {returns}{{\n{body}}}\n"
                ));
            }
        }
    }

    let right_str = compile_child(&mut token.right, ctx)?;
    let left = token.left.as_mut().unwrap();
    let receiver = compile_rmt_receiver(left, ctx)?;
    let key = compile_rmt_key(left, ctx)?;
    Ok(format!(
        "{RUNTIME_PREFIX}setItem({receiver}, {key}, {right_str})"
    ))
}

fn compile_operator(token: &mut Token, ctx: &mut Context) -> Result<String, String> {
    let op = token.data_text().to_string();
    let left = compile_child(&mut token.left, ctx)?;
    let right = compile_child(&mut token.right, ctx)?;
    let lt = token.left.as_ref().and_then(|t| t.returned_type);
    let rt = token.right.as_ref().and_then(|t| t.returned_type);

    match op.as_str() {
        "??" => Ok(format!("{RUNTIME_PREFIX}nullishCoalesce({left}, {right})")),
        "+" => {
            if is_number_compatible(lt) && is_number_compatible(rt) {
                token.returned_type = Some(ValueType::Num);
                return Ok(format!(
                    "({} + {})",
                    widen_numeric(left, lt),
                    widen_numeric(right, rt)
                ));
            }
            if lt == Some(ValueType::Str) || rt == Some(ValueType::Str) {
                // `+` between strings is the print-style space join
                token.returned_type = Some(ValueType::Str);
                return Ok(format!(
                    "({} + \" \" + {})",
                    cast_to_string(&left, lt),
                    cast_to_string(&right, rt)
                ));
            }
            Ok(format!("{RUNTIME_PREFIX}add({left}, {right})"))
        }
        "-" | "*" | "/" => {
            if is_number_compatible(lt) && is_number_compatible(rt) {
                token.returned_type = Some(ValueType::Num);
                return Ok(format!(
                    "({} {} {})",
                    widen_numeric(left, lt),
                    op,
                    widen_numeric(right, rt)
                ));
            }
            let helper = match op.as_str() {
                "-" => "sub",
                "*" => "multiply",
                _ => "divide",
            };
            Ok(format!("{RUNTIME_PREFIX}{helper}({left}, {right})"))
        }
        "%" => {
            if is_number_compatible(lt) && is_number_compatible(rt) {
                token.returned_type = Some(ValueType::Num);
                return Ok(format!(
                    "math.Mod({}, {})",
                    widen_numeric(left, lt),
                    widen_numeric(right, rt)
                ));
            }
            Ok(format!("{RUNTIME_PREFIX}mod({left}, {right})"))
        }
        "^" => {
            token.returned_type = Some(ValueType::Num);
            Ok(format!(
                "math.Pow({RUNTIME_PREFIX}castNumber({left}), {RUNTIME_PREFIX}castNumber({right}))"
            ))
        }
        "//" => {
            token.returned_type = Some(ValueType::Num);
            Ok(format!(
                "math.Floor({RUNTIME_PREFIX}castNumber({left}) / {RUNTIME_PREFIX}castNumber({right}))"
            ))
        }
        "++" => {
            // join: strings concatenate, arrays append
            if is_absolutely_not(lt, ValueType::Arr) || is_absolutely_not(rt, ValueType::Arr) {
                token.returned_type = Some(ValueType::Str);
                return Ok(format!(
                    "({} + {})",
                    cast_to_string(&left, lt),
                    cast_to_string(&right, rt)
                ));
            }
            Ok(format!("{RUNTIME_PREFIX}join({left}, {right})"))
        }
        "b+" => Ok(format!("{RUNTIME_PREFIX}add({left}, {right})")),
        "b-" => Ok(format!("{RUNTIME_PREFIX}sub({left}, {right})")),
        "b*" => Ok(format!("{RUNTIME_PREFIX}multiply({left}, {right})")),
        "b/" => Ok(format!("{RUNTIME_PREFIX}divide({left}, {right})")),
        "b^" => Ok(format!(
            "math.Pow({RUNTIME_PREFIX}castNumber({left}), {RUNTIME_PREFIX}castNumber({right}))"
        )),
        _ => Ok(format!("{left} {op} {right}")),
    }
}

fn compile_comparison(token: &mut Token, ctx: &mut Context) -> Result<String, String> {
    let op = token.data_text().to_string();
    let left = compile_child(&mut token.left, ctx)?;
    let right = compile_child(&mut token.right, ctx)?;
    let lt = token.left.as_ref().and_then(|t| t.returned_type);
    let rt = token.right.as_ref().and_then(|t| t.returned_type);
    token.returned_type = Some(ValueType::Bool);

    match op.as_str() {
        "==" => Ok(format!("{RUNTIME_PREFIX}equal({left}, {right})")),
        "!=" => Ok(format!("{RUNTIME_PREFIX}notEqual({left}, {right})")),
        "===" => Ok(format!("{left} == {right}")),
        "!==" => Ok(format!("{left} != {right}")),
        ">" | "<" | ">=" | "<=" | "!>" | "!<" => {
            let op = match op.as_str() {
                "!>" => "<=",
                "!<" => ">=",
                other => other,
            };
            if is_number_compatible(lt) && is_number_compatible(rt) {
                // both sides statically numeric: no cast needed
                Ok(format!(
                    "{} {} {}",
                    widen_numeric(left, lt),
                    op,
                    widen_numeric(right, rt)
                ))
            } else {
                Ok(format!(
                    "{RUNTIME_PREFIX}castNumber({left}) {op} {RUNTIME_PREFIX}castNumber({right})"
                ))
            }
        }
        "in" => Ok(format!("{RUNTIME_PREFIX}keyIn({left}, {right})")),
        "notIn" => Ok(format!("!{RUNTIME_PREFIX}keyIn({left}, {right})")),
        _ => Ok(format!("{left} {op} {right}")),
    }
}

fn compile_logic(token: &mut Token, ctx: &mut Context) -> Result<String, String> {
    let op_name = token.data_text().to_string();
    let left_raw = compile_child(&mut token.left, ctx)?;
    let right_raw = compile_child(&mut token.right, ctx)?;
    let lt = token.left.as_ref().and_then(|t| t.returned_type);
    let rt = token.right.as_ref().and_then(|t| t.returned_type);
    token.returned_type = Some(ValueType::Bool);

    let as_bool = |expr: &str, t: Option<ValueType>| {
        if t == Some(ValueType::Bool) {
            expr.to_string()
        } else {
            format!("{RUNTIME_PREFIX}castBool({expr})")
        }
    };
    let left = as_bool(&left_raw, lt);
    let right = as_bool(&right_raw, rt);

    match op_name.as_str() {
        "and" => {
            if left == "true" {
                return Ok(right);
            }
            if right == "true" {
                return Ok(left);
            }
            if left == "false" || right == "false" {
                return Ok("false".to_string());
            }
            Ok(format!("{left} && {right}"))
        }
        "or" => {
            if left == "false" {
                return Ok(right);
            }
            if right == "false" {
                return Ok(left);
            }
            if left == "true" || right == "true" {
                return Ok("true".to_string());
            }
            Ok(format!("{left} || {right}"))
        }
        "nor" => Ok(format!("!({left} || {right})")),
        "nand" => Ok(format!("!({left} && {right})")),
        "xor" => Ok(format!("({left} != {right})")),
        "xnor" => Ok(format!("({left} == {right})")),
        _ => Ok(format!("{left} && {right}")),
    }
}

fn compile_call(token: &mut Token, ctx: &mut Context) -> Result<String, String> {
    let name = token.data_text().to_string();
    match name.as_str() {
        "function" => {
            let (params, returns, body, _) = compile_function_body(
                token,
                ctx,
                Some(&format!("{RUNTIME_PREFIX}self := {RUNTIME_PREFIX}self")),
            )?;
            let closing = add_indent("})", ctx.indent * 2);
            Ok(format!("(func({params}) {returns}{{\n{body}{closing}"))
        }
        "worker" => {
            if token.parameters.is_empty() {
                return Err("worker needs 1 parameter".to_string());
            }
            let props = compile_token(&mut token.parameters[0], ctx)?;
            Ok(format!("{RUNTIME_PREFIX}worker({props})"))
        }
        "typeof" => {
            if token.parameters.is_empty() {
                return Err("typeof needs 1 parameter".to_string());
            }
            let value = compile_token(&mut token.parameters[0], ctx)?;
            token.returned_type = Some(ValueType::Str);
            Ok(format!("{RUNTIME_PREFIX}typeof({value})"))
        }
        "delete" => {
            if token.parameters.len() < 2 {
                return Err("delete needs 2 parameters".to_string());
            }
            let target = compile_token(&mut token.parameters[0], ctx)?;
            let key = compile_token(&mut token.parameters[1], ctx)?;
            Ok(format!("{RUNTIME_PREFIX}delete({target}, {key})"))
        }
        "round" | "ceil" | "floor" => {
            if token.parameters.is_empty() {
                return Err(format!("{name} needs 1 parameter"));
            }
            let value = compile_token(&mut token.parameters[0], ctx)?;
            token.returned_type = Some(ValueType::Int);
            Ok(format!("{RUNTIME_PREFIX}{name}({value})"))
        }
        "min" | "max" => {
            if token.parameters.len() < 2 {
                return Err(format!("{name} needs 2 parameters"));
            }
            let a = compile_token(&mut token.parameters[0], ctx)?;
            let b = compile_token(&mut token.parameters[1], ctx)?;
            token.returned_type = Some(ValueType::Num);
            Ok(format!("{RUNTIME_PREFIX}{name}({a}, {b})"))
        }
        "random" => {
            if token.parameters.len() < 2 {
                return Err("random needs 2 parameters".to_string());
            }
            let a = compile_token(&mut token.parameters[0], ctx)?;
            let b = compile_token(&mut token.parameters[1], ctx)?;
            token.returned_type = Some(ValueType::Num);
            Ok(format!("{RUNTIME_PREFIX}random({a}, {b})"))
        }
        "raw" => {
            // splice the argument into the output verbatim
            let text = token
                .parameters
                .first()
                .map(|p| p.data_text().to_string())
                .unwrap_or_default();
            Ok(text)
        }
        _ => {
            if name.starts_with(RUNTIME_PREFIX) {
                return Err(format!("Cannot use reserved variable name: {name}"));
            }
            if ctx.user_types.contains_key(&name) {
                return Ok(format!("{RUNTIME_PREFIX}_new_{name}()"));
            }
            let mut params = Vec::new();
            for p in token.parameters.iter_mut() {
                params.push(compile_token(p, ctx)?);
            }
            if ctx.custom_commands.contains(&name) {
                return Ok(format!(
                    "{RUNTIME_PREFIX}CMD_{name}({})",
                    params.join(", ")
                ));
            }
            if let Some(sig) = ctx.function_signatures.get(&name) {
                token.returned_type = value_type_for_source(&sig.returns);
            }
            Ok(format!("{name}({})", params.join(", ")))
        }
    }
}

/// One row of the fixed built-in method table: maps a method name on a
/// receiver expression to a host expression and result type.
fn builtin_segment(
    name: &str,
    out: &str,
    params: &[String],
    raw_params: &[Token],
    prev_type: Option<ValueType>,
    ctx: &mut Context,
) -> Option<(String, Option<ValueType>)> {
    let p = |i: usize| params.get(i).cloned().unwrap_or_default();
    match name {
        "len" => Some((format!("{RUNTIME_PREFIX}len({out})"), Some(ValueType::Int))),
        "call" => Some((
            format!(
                "{RUNTIME_PREFIX}callFunc({out}, nil, []any{{{}}})",
                params.join(", ")
            ),
            Some(ValueType::Any),
        )),
        "toStr" => Some((
            format!("{RUNTIME_PREFIX}toString({out})"),
            Some(ValueType::Str),
        )),
        "toInt" => Some((
            format!("{RUNTIME_PREFIX}castInt({out})"),
            Some(ValueType::Int),
        )),
        "toNum" => Some((
            format!("{RUNTIME_PREFIX}castNumber({out})"),
            Some(ValueType::Num),
        )),
        "toBool" => Some((
            format!("{RUNTIME_PREFIX}castBool({out})"),
            Some(ValueType::Bool),
        )),
        "toArray" => Some((
            format!("{RUNTIME_PREFIX}castArray({out})"),
            Some(ValueType::Arr),
        )),
        "toObject" => Some((
            format!("{RUNTIME_PREFIX}castObject({out})"),
            Some(ValueType::Obj),
        )),
        "pop" => Some((format!("{RUNTIME_PREFIX}pop(&({out}))"), Some(ValueType::Any))),
        "shift" => Some((
            format!("{RUNTIME_PREFIX}shift(&({out}))"),
            Some(ValueType::Any),
        )),
        "to" if !params.is_empty() => Some((
            format!("{RUNTIME_PREFIX}to({out}, {})", p(0)),
            Some(ValueType::Arr),
        )),
        "append" if !params.is_empty() => Some((
            format!("{RUNTIME_PREFIX}append(&({out}), {})", p(0)),
            Some(ValueType::Arr),
        )),
        "prepend" if !params.is_empty() => Some((
            format!("{RUNTIME_PREFIX}prepend(&({out}), {})", p(0)),
            Some(ValueType::Arr),
        )),
        "in" if !params.is_empty() => Some((
            format!("{RUNTIME_PREFIX}keyIn({}, {out})", p(0)),
            Some(ValueType::Bool),
        )),
        "ask" => Some((
            format!("{RUNTIME_PREFIX}input({})", cast_to_string(out, prev_type)),
            Some(ValueType::Str),
        )),
        "chr" => Some((
            format!("string(rune({RUNTIME_PREFIX}castInt({out})))"),
            Some(ValueType::Str),
        )),
        "ord" => Some((
            format!("int({RUNTIME_PREFIX}toString({out})[0])"),
            Some(ValueType::Int),
        )),
        "toLower" => Some((
            format!("strings.ToLower({})", cast_to_string(out, prev_type)),
            Some(ValueType::Str),
        )),
        "toUpper" => Some((
            format!("strings.ToUpper({})", cast_to_string(out, prev_type)),
            Some(ValueType::Str),
        )),
        "isKeyDown" => Some((
            format!("window.KeyPressed({})", cast_to_string(out, prev_type)),
            Some(ValueType::Bool),
        )),
        "onKeyDown" => Some((
            format!("window.KeyJustPressed({})", cast_to_string(out, prev_type)),
            Some(ValueType::Bool),
        )),
        "getKeys" => Some((
            format!("{RUNTIME_PREFIX}getKeys({out})"),
            Some(ValueType::Arr),
        )),
        "getValues" => Some((
            format!("{RUNTIME_PREFIX}getValues({out})"),
            Some(ValueType::Arr),
        )),
        "floor" => Some((format!("{RUNTIME_PREFIX}floor({out})"), Some(ValueType::Int))),
        "ceil" => Some((format!("{RUNTIME_PREFIX}ceil({out})"), Some(ValueType::Int))),
        "round" => Some((format!("{RUNTIME_PREFIX}round({out})"), Some(ValueType::Int))),
        "startsWith" if !params.is_empty() => Some((
            format!(
                "strings.HasPrefix({}, {})",
                cast_to_string(out, prev_type),
                p(0)
            ),
            Some(ValueType::Bool),
        )),
        "endsWith" if !params.is_empty() => Some((
            format!(
                "strings.HasSuffix({}, {})",
                cast_to_string(out, prev_type),
                p(0)
            ),
            Some(ValueType::Bool),
        )),
        "contains" if !params.is_empty() => Some((
            format!("{RUNTIME_PREFIX}contains({out}, {})", p(0)),
            Some(ValueType::Bool),
        )),
        "sort" => Some((format!("{RUNTIME_PREFIX}sort({out})"), Some(ValueType::Arr))),
        "sortBy" if !params.is_empty() => Some((
            format!("{RUNTIME_PREFIX}sortBy({out}, {})", p(0)),
            Some(ValueType::Arr),
        )),
        "index" if !params.is_empty() => Some((
            format!(
                "float64(strings.Index({}, {}) + 1)",
                cast_to_string(out, prev_type),
                p(0)
            ),
            Some(ValueType::Num),
        )),
        "strip" => Some((
            format!("strings.TrimSpace({})", cast_to_string(out, prev_type)),
            Some(ValueType::Str),
        )),
        "clone" => Some((format!("{RUNTIME_PREFIX}clone({out})"), None)),
        "join" if !params.is_empty() => Some((
            format!("{RUNTIME_PREFIX}arrayJoin({out}, {})", p(0)),
            Some(ValueType::Str),
        )),
        "split" if !params.is_empty() => Some((
            format!(
                "{RUNTIME_PREFIX}split({}, {})",
                cast_to_string(out, prev_type),
                p(0)
            ),
            Some(ValueType::Arr),
        )),
        "delete" if !params.is_empty() => Some((
            format!("{RUNTIME_PREFIX}delete({out}, {})", p(0)),
            None,
        )),
        "slice" if params.len() > 1 => Some((
            format!("{RUNTIME_PREFIX}slice({out}, {}, {})", p(0), p(1)),
            Some(ValueType::Arr),
        )),
        "slice" if !params.is_empty() => Some((
            format!("{RUNTIME_PREFIX}slice({out}, {}, -1)", p(0)),
            Some(ValueType::Arr),
        )),
        "trim" if params.len() > 1 => {
            Some((format!("{RUNTIME_PREFIX}trim({out}, {}, {})", p(0), p(1)), None))
        }
        "trim" if !params.is_empty() => {
            Some((format!("{RUNTIME_PREFIX}trim({out}, {}, -1)", p(0)), None))
        }
        "trim" => Some((
            format!("strings.TrimSpace({})", cast_to_string(out, prev_type)),
            Some(ValueType::Str),
        )),
        "JsonStringify" => Some((
            format!("{RUNTIME_PREFIX}jsonStringify({out})"),
            Some(ValueType::Str),
        )),
        "JsonParse" => Some((format!("{RUNTIME_PREFIX}jsonParse({out})"), None)),
        "JsonFormat" => Some((
            format!("{RUNTIME_PREFIX}jsonFormat({out})"),
            Some(ValueType::Str),
        )),
        "stripStart" if !params.is_empty() => Some((
            format!(
                "strings.TrimPrefix({}, {})",
                cast_to_string(out, prev_type),
                p(0)
            ),
            Some(ValueType::Str),
        )),
        "stripEnd" if !params.is_empty() => Some((
            format!(
                "strings.TrimSuffix({}, {})",
                cast_to_string(out, prev_type),
                p(0)
            ),
            Some(ValueType::Str),
        )),
        "padStart" if params.len() > 1 => Some((
            format!(
                "{RUNTIME_PREFIX}padStart({}, int({RUNTIME_PREFIX}castNumber({})), {})",
                cast_to_string(out, prev_type),
                p(1),
                p(0)
            ),
            Some(ValueType::Str),
        )),
        "padEnd" if params.len() > 1 => Some((
            format!(
                "{RUNTIME_PREFIX}padEnd({}, int({RUNTIME_PREFIX}castNumber({})), {})",
                cast_to_string(out, prev_type),
                p(1),
                p(0)
            ),
            Some(ValueType::Str),
        )),
        "assert" if !params.is_empty() => {
            let type_name = raw_params
                .first()
                .map(|t| t.data_text().to_string())
                .unwrap_or_else(|| p(0).trim_matches('"').to_string());
            let go_type = map_type(ctx, &type_name);
            let returned = value_type_for_source(&type_name);
            Some((format!("{out}.({go_type})"), returned))
        }
        "item" if !params.is_empty() => {
            if prev_type == Some(ValueType::Obj) {
                Some((
                    format!("{out}[{RUNTIME_PREFIX}toString({})]", p(0)),
                    None,
                ))
            } else {
                Some((format!("{RUNTIME_PREFIX}getItem({out}, {})", p(0)), None))
            }
        }
        "sin" | "cos" | "tan" => {
            let func = match name {
                "sin" => "Sin",
                "cos" => "Cos",
                _ => "Tan",
            };
            Some((
                format!("math.{func}(({RUNTIME_PREFIX}castNumber({out}) * math.Pi) / 180)"),
                Some(ValueType::Num),
            ))
        }
        "clamp" if params.len() >= 2 => Some((
            format!("{RUNTIME_PREFIX}min({RUNTIME_PREFIX}max({out}, {}), {})", p(0), p(1)),
            Some(ValueType::Num),
        )),
        "abs" => Some((
            format!("math.Abs({RUNTIME_PREFIX}castNumber({out}))"),
            Some(ValueType::Num),
        )),
        "sqrt" => Some((
            format!("math.Sqrt({RUNTIME_PREFIX}castNumber({out}))"),
            Some(ValueType::Num),
        )),
        _ => None,
    }
}

fn compile_method_chain(token: &mut Token, ctx: &mut Context) -> Result<String, String> {
    let mut parts = match &mut token.data {
        TokenData::List(parts) => std::mem::take(parts),
        _ => return Ok(String::new()),
    };
    if parts.is_empty() {
        return Ok(String::new());
    }

    let mut out = compile_token(&mut parts[0], ctx)?;
    let mut prev_type = parts[0].returned_type;
    let mut prev_is_self = parts[0].kind == TokenKind::Var && parts[0].is_text("self");

    for idx in 1..parts.len() {
        let mut params = Vec::new();
        for p in parts[idx].parameters.iter_mut() {
            params.push(compile_token(p, ctx)?);
        }
        let name = parts[idx].data_text().to_string();
        let segment_kind = parts[idx].kind;
        let raw_params = parts[idx].parameters.clone();

        // fixed built-in table first
        if let Some((emitted, returned)) =
            builtin_segment(&name, &out, &params, &raw_params, prev_type, ctx)
        {
            out = emitted;
            parts[idx].returned_type = returned;
            prev_type = returned;
            prev_is_self = false;
            continue;
        }

        // then user-registered extensions on the receiver's primitive type
        if let Some(primitive) = prev_type.and_then(primitive_name_for) {
            if let Some(def) = ctx.builtin_method(primitive, &name) {
                let return_type = def.return_type.clone();
                let cap_type = capitalize(primitive);
                let cap_method = capitalize(&name);
                let mut call = format!("{RUNTIME_PREFIX}MET{cap_type}{cap_method}({out}");
                for p in &params {
                    call.push_str(&format!(", {p}"));
                }
                call.push(')');
                out = call;
                let returned = value_type_for_source(&return_type);
                parts[idx].returned_type = returned;
                prev_type = returned;
                prev_is_self = false;
                continue;
            }
        }

        match segment_kind {
            TokenKind::Var => {
                if prev_is_self {
                    if let Some(go_type) = ctx.self_types.get(&name) {
                        let returned = value_type_for_go(go_type);
                        out = format!("{out}.{}", record_field(&name));
                        parts[idx].returned_type = returned;
                        prev_type = returned;
                        prev_is_self = false;
                        continue;
                    }
                }
                if prev_type == Some(ValueType::Obj) {
                    out = format!("{out}[{}]", json_quote(&name));
                    parts[idx].returned_type = None;
                    prev_type = None;
                    prev_is_self = false;
                    continue;
                }
                // dynamic attribute getter
                out = format!("{RUNTIME_PREFIX}getItem({out}, {})", json_quote(&name));
                parts[idx].returned_type = None;
                prev_type = None;
                prev_is_self = false;
            }
            TokenKind::Mtv => {
                // plain dotted method call
                out = format!("{out}.{name}({})", params.join(", "));
                parts[idx].returned_type = None;
                prev_type = None;
                prev_is_self = false;
            }
            _ => {
                let compiled = compile_token(&mut parts[idx], ctx)?;
                out = format!("{out}{compiled}");
                prev_type = parts[idx].returned_type;
                prev_is_self = false;
            }
        }
    }

    token.returned_type = prev_type;
    token.data = TokenData::List(parts);
    Ok(out)
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

// record fields must be exported so the runtime's reflective getter and
// setter can reach them
fn record_field(name: &str) -> String {
    capitalize(name)
}

fn compile_object(
    pairs: &mut [(Token, Token)],
    ctx: &mut Context,
    wrap: bool,
    wrap_indent: usize,
) -> Result<String, String> {
    let mut out = if wrap {
        format!("{RUNTIME_PREFIX}newSafeMap(map[string]any{{\n")
    } else {
        String::from("map[string]any{\n")
    };
    for (key, value) in pairs.iter_mut() {
        let key_str = match key.kind {
            TokenKind::Var => json_quote(key.data_text()),
            _ => compile_token(key, ctx)?,
        };
        let value_str = compile_token(value, ctx)?;
        out.push_str(&add_indent(
            &format!("{key_str}: {value_str},\n"),
            ctx.indent * 2,
        ));
    }
    if wrap {
        out.push_str(&add_indent("})", wrap_indent * 2));
    } else {
        out.push_str(&add_indent("}", wrap_indent * 2));
    }
    Ok(out)
}

fn compile_array(
    items: &mut [Token],
    ctx: &mut Context,
    wrap_indent: usize,
) -> Result<String, String> {
    if items.is_empty() {
        return Ok("[]any{}".to_string());
    }
    let mut out = String::from("[]any{\n");
    for item in items.iter_mut() {
        let compiled = compile_token(item, ctx)?;
        out.push_str(&add_indent(&format!("{compiled},\n"), ctx.indent * 2));
    }
    out.push_str(&add_indent("}", wrap_indent * 2));
    Ok(out)
}

fn expect_block(token: &Token, what: &str) -> Result<(), String> {
    if token.kind != TokenKind::Blk {
        return Err(format!("{what} requires a block"));
    }
    Ok(())
}

fn compile_block_arg(token: &mut Token, ctx: &mut Context) -> Result<String, String> {
    ctx.indent += 1;
    let out = match token.block_mut() {
        Some(block) => {
            let mut block = std::mem::take(block);
            compile_block(&mut block, ctx)?
        }
        None => String::new(),
    };
    ctx.indent -= 1;
    Ok(out)
}

pub fn compile_cmd(cmd: &mut Vec<Token>, ctx: &mut Context) -> Result<String, String> {
    let line_no = cmd.first().map(|t| t.line).unwrap_or(0);
    let source = cmd.first().map(|t| t.source.clone()).unwrap_or_default();
    compile_cmd_inner(cmd, ctx).map_err(|e| prefix_line_error(e, line_no, &source))
}

fn compile_cmd_inner(cmd: &mut Vec<Token>, ctx: &mut Context) -> Result<String, String> {
    let head = cmd[0].data_text().to_string();
    let mut out = String::new();

    match head.as_str() {
        "//" => return Ok(String::new()),
        "if" => {
            if cmd.len() < 3 {
                return Err("If command requires at least 2 parameters".to_string());
            }
            expect_block(&cmd[2], "If command")?;
            let mut condition = compile_token(&mut cmd[1], ctx)?;
            if cmd[1].returned_type != Some(ValueType::Bool) {
                condition = format!("{RUNTIME_PREFIX}castBool({condition})");
            }
            out.push_str(&format!("if {condition} {{\n"));
            let body = compile_block_arg(&mut cmd[2], ctx)?;
            out.push_str(&body);
            out.push_str(&add_indent("}", ctx.indent * 2));

            let mut i = 3;
            while i < cmd.len() {
                if i + 3 < cmd.len() && cmd[i].is_text("else") && cmd[i + 1].is_text("if") {
                    expect_block(&cmd[i + 3], "Else if command")?;
                    let mut condition = compile_token(&mut cmd[i + 2], ctx)?;
                    if cmd[i + 2].returned_type != Some(ValueType::Bool) {
                        condition = format!("{RUNTIME_PREFIX}castBool({condition})");
                    }
                    out.push_str(&format!(" else if {condition} {{\n"));
                    let body = compile_block_arg(&mut cmd[i + 3], ctx)?;
                    out.push_str(&body);
                    out.push_str(&add_indent("}", ctx.indent * 2));
                    i += 4;
                } else if i + 1 < cmd.len() && cmd[i].is_text("else") {
                    expect_block(&cmd[i + 1], "Else command")?;
                    out.push_str(" else {\n");
                    let body = compile_block_arg(&mut cmd[i + 1], ctx)?;
                    out.push_str(&body);
                    out.push_str(&add_indent("}", ctx.indent * 2));
                    i += 2;
                    break;
                } else {
                    break;
                }
            }
        }
        "loop" => {
            if cmd.len() < 3 {
                return Err("Loop command requires at least 1 parameter".to_string());
            }
            if cmd.len() >= 4 {
                return compile_range_loop(cmd, ctx);
            }
            expect_block(&cmd[2], "Loop command")?;
            let iterator = ctx.fresh_iterator();
            let count = compile_token(&mut cmd[1], ctx)?;
            let mut count_type = cmd[1].returned_type;
            if cmd[1].kind == TokenKind::Var {
                if let Some(go) = ctx.lookup_var_type(cmd[1].data_text()) {
                    if go == "float64" {
                        count_type = Some(ValueType::Num);
                    }
                }
            }
            let condition = match count_type {
                Some(ValueType::Num) => format!("float64({iterator}) <= {count}"),
                Some(ValueType::Int) => format!("{iterator} <= {count}"),
                _ => format!("{iterator} <= {RUNTIME_PREFIX}round({count})"),
            };
            out.push_str(&format!(
                "for {iterator} := 1; {condition}; {iterator}++ {{\n"
            ));
            let body = compile_block_arg(&mut cmd[2], ctx)?;
            out.push_str(&body);
            out.push_str(&add_indent("}", ctx.indent * 2));
        }
        "for" => {
            if cmd.len() < 4 {
                return Err("For command requires at least 2 parameters".to_string());
            }
            expect_block(&cmd[3], "For command")?;
            let iterator = cmd[1].data_text().to_string();
            ctx.declared_vars.insert(iterator.clone());
            ctx.variable_types.insert(iterator.clone(), "int".to_string());
            let mut count = compile_token(&mut cmd[2], ctx)?;
            match cmd[2].returned_type {
                Some(ValueType::Num) => count = format!("int({count})"),
                Some(ValueType::Int) => {}
                _ => count = format!("{RUNTIME_PREFIX}round({count})"),
            }
            out.push_str(&format!(
                "for {iterator} := 1; {iterator} <= {count}; {iterator}++ {{\n"
            ));
            let body = compile_block_arg(&mut cmd[3], ctx)?;
            out.push_str(&body);
            out.push_str(&add_indent("}", ctx.indent * 2));
        }
        "while" | "until" => {
            if cmd.len() < 3 {
                return Err(format!(
                    "{} command requires at least 2 parameters",
                    capitalize(&head)
                ));
            }
            expect_block(&cmd[2], "While command")?;
            let mut condition = compile_token(&mut cmd[1], ctx)?;
            if cmd[1].returned_type != Some(ValueType::Bool) {
                condition = format!("{RUNTIME_PREFIX}castBool({condition})");
            }
            if head == "until" {
                condition = format!("!({condition})");
            }
            out.push_str(&format!("for {condition} {{\n"));
            let body = compile_block_arg(&mut cmd[2], ctx)?;
            out.push_str(&body);
            out.push_str(&add_indent("}", ctx.indent * 2));
        }
        "log" | "say" => {
            if cmd.len() < 2 {
                return Err("Log command requires at least 1 parameter".to_string());
            }
            out.push_str(&format!("{RUNTIME_PREFIX}logValues("));
            for i in 1..cmd.len() {
                let param = compile_token(&mut cmd[i], ctx)?;
                out.push_str(&param);
                if i < cmd.len() - 1 {
                    out.push_str(", ");
                }
            }
            out.push(')');
        }
        "window" => {
            if cmd.len() < 2 {
                return Err("Window command requires at least 1 parameter".to_string());
            }
            ctx.add_import("quill/window");
            let sub = cmd[1].data_text().to_string();
            let mut params = Vec::new();
            for i in 2..cmd.len() {
                params.push(compile_token(&mut cmd[i], ctx)?);
            }
            match sub.as_str() {
                "dimensions" => {
                    if params.len() < 2 {
                        return Err("window dimensions requires 2 parameters".to_string());
                    }
                    out.push_str(&format!("window.Resize({}, {})", params[0], params[1]));
                }
                "resizable" => {
                    if params.is_empty() {
                        return Err("window resizable requires 1 parameter".to_string());
                    }
                    out.push_str(&format!("window.SetResizable({})", params[0]));
                }
                other => {
                    out.push_str(&format!("// window {other} {}", params.join(", ")));
                }
            }
        }
        "type" => {
            return compile_type_decl(cmd, ctx);
        }
        "return" => {
            if cmd.len() < 2 {
                out.push_str("return");
            } else {
                let value = compile_token(&mut cmd[1], ctx)?;
                out.push_str(&format!("return {value}"));
            }
        }
        "wait" => {
            if cmd.len() == 2 {
                let seconds = compile_token(&mut cmd[1], ctx)?;
                out.push_str(&format!(
                    "{RUNTIME_PREFIX}wait({RUNTIME_PREFIX}castNumber({seconds}))"
                ));
            }
        }
        "switch" => {
            if cmd.len() < 3 {
                return Err("Switch command requires at least 2 parameters".to_string());
            }
            expect_block(&cmd[2], "Switch command")?;
            let subject = compile_token(&mut cmd[1], ctx)?;
            out.push_str(&format!("switch {subject} {{\n"));
            let body = compile_block_arg(&mut cmd[2], ctx)?;
            out.push_str(&body);
            out.push_str(&add_indent("}", ctx.indent * 2));
        }
        "case" => {
            if cmd.len() < 2 {
                return Err("Case command requires at least 1 parameter".to_string());
            }
            let value = compile_token(&mut cmd[1], ctx)?;
            out.push_str(&format!("case {value}:"));
        }
        "default" => {
            out.push_str("default:");
        }
        "def" => {
            return compile_def_cmd(cmd, ctx);
        }
        "import" => {
            if cmd.len() < 2 {
                return Err("Import command requires at least 1 parameter".to_string());
            }
            let path = cmd[1].data_text().to_string();
            ctx.add_import(&path);
            return Ok(String::new());
        }
        "go" | "defer" => {
            if cmd.len() < 2 {
                return Err("Go and defer commands require at least 1 parameter".to_string());
            }
            out.push_str(&head);
            out.push(' ');
            for i in 1..cmd.len() {
                let piece = compile_token(&mut cmd[i], ctx)?;
                out.push_str(&piece);
            }
        }
        "void" => {
            if cmd.len() < 2 {
                return Err("Void command requires at least 1 parameter".to_string());
            }
            for i in 1..cmd.len() {
                let piece = compile_token(&mut cmd[i], ctx)?;
                out.push_str(&piece);
            }
        }
        "c" | "color" | "colour" => {
            if cmd.len() < 2 {
                return Err("Color command requires at least 1 parameter".to_string());
            }
            let value = compile_token(&mut cmd[1], ctx)?;
            out.push_str(&format!("{RUNTIME_PREFIX}drawctx.Color({value})"));
        }
        "goto" => {
            if cmd.len() != 3 {
                return Err("Goto command requires 2 parameters".to_string());
            }
            let x = compile_token(&mut cmd[1], ctx)?;
            let y = compile_token(&mut cmd[2], ctx)?;
            out.push_str(&format!("{RUNTIME_PREFIX}drawctx.Goto({x}, {y})"));
        }
        "change_x" => {
            if cmd.len() != 2 {
                return Err("Change_x command requires 1 parameter".to_string());
            }
            let dx = compile_token(&mut cmd[1], ctx)?;
            out.push_str(&format!("{RUNTIME_PREFIX}drawctx.Change({dx}, 0)"));
        }
        "change_y" => {
            if cmd.len() != 2 {
                return Err("Change_y command requires 1 parameter".to_string());
            }
            let dy = compile_token(&mut cmd[1], ctx)?;
            out.push_str(&format!("{RUNTIME_PREFIX}drawctx.Change(0, {dy})"));
        }
        "change" => {
            if cmd.len() != 3 {
                return Err("Change command requires 2 parameters".to_string());
            }
            let dx = compile_token(&mut cmd[1], ctx)?;
            let dy = compile_token(&mut cmd[2], ctx)?;
            out.push_str(&format!("{RUNTIME_PREFIX}drawctx.Change({dx}, {dy})"));
        }
        "loc" => {
            if cmd.len() != 5 {
                return Err("Loc command requires 4 parameters".to_string());
            }
            let a = compile_token(&mut cmd[1], ctx)?;
            let b = compile_token(&mut cmd[2], ctx)?;
            let c = compile_token(&mut cmd[3], ctx)?;
            let d = compile_token(&mut cmd[4], ctx)?;
            out.push_str(&format!("{RUNTIME_PREFIX}drawctx.Loc({a}, {b}, {c}, {d})"));
        }
        "square" => {
            if cmd.len() < 3 {
                return Err("Square command requires at least 2 parameters".to_string());
            }
            let mut params = Vec::new();
            for i in 1..cmd.len() {
                params.push(compile_token(&mut cmd[i], ctx)?);
            }
            out.push_str(&format!(
                "{RUNTIME_PREFIX}drawctx.Rect({})",
                params.join(", ")
            ));
        }
        "icon" => {
            if cmd.len() != 3 {
                return Err(format!(
                    "Icon command requires 2 parameters, got: {}",
                    cmd[0].source
                ));
            }
            let icon = compile_token(&mut cmd[1], ctx)?;
            let size = compile_token(&mut cmd[2], ctx)?;
            out.push_str(&format!("{RUNTIME_PREFIX}drawctx.Icon({icon}, {size})"));
        }
        "text" => {
            if cmd.len() < 3 {
                return Err("Text command requires at least 2 parameters".to_string());
            }
            let text = compile_token(&mut cmd[1], ctx)?;
            let size = compile_token(&mut cmd[2], ctx)?;
            out.push_str(&format!("{RUNTIME_PREFIX}drawctx.Text({text}, {size})"));
        }
        "centext" => {
            if cmd.len() < 3 {
                return Err("Centext command requires at least 2 parameters".to_string());
            }
            let text = compile_token(&mut cmd[1], ctx)?;
            let size = compile_token(&mut cmd[2], ctx)?;
            out.push_str(&format!("{RUNTIME_PREFIX}drawctx.Centext({text}, {size})"));
        }
        "direction" => {
            if cmd.len() != 2 {
                return Err("Direction command requires 1 parameter".to_string());
            }
            let angle = compile_token(&mut cmd[1], ctx)?;
            out.push_str(&format!("{RUNTIME_PREFIX}drawctx.Direction({angle})"));
        }
        "turnright" => {
            if cmd.len() != 2 {
                return Err("Turnright command requires 1 parameter".to_string());
            }
            let angle = compile_token(&mut cmd[1], ctx)?;
            out.push_str(&format!("{RUNTIME_PREFIX}drawctx.Turnright({angle})"));
        }
        "turnleft" => {
            if cmd.len() != 2 {
                return Err("Turnleft command requires 1 parameter".to_string());
            }
            let angle = compile_token(&mut cmd[1], ctx)?;
            out.push_str(&format!("{RUNTIME_PREFIX}drawctx.Turnleft({angle})"));
        }
        "pointat" => {
            if cmd.len() != 3 {
                return Err("Pointat command requires 2 parameters".to_string());
            }
            let x = compile_token(&mut cmd[1], ctx)?;
            let y = compile_token(&mut cmd[2], ctx)?;
            out.push_str(&format!("{RUNTIME_PREFIX}drawctx.Pointat({x}, {y})"));
        }
        _ => {
            if ctx.custom_commands.contains(&head) {
                out.push_str(&format!("{RUNTIME_PREFIX}CMD_{head}("));
                for i in 1..cmd.len() {
                    let param = compile_token(&mut cmd[i], ctx)?;
                    out.push_str(&param);
                    if i < cmd.len() - 1 {
                        out.push_str(", ");
                    }
                }
                out.push(')');
            } else if GO_KEYWORDS.contains(&head.as_str()) {
                out.push_str(&head);
                if cmd.len() > 1 {
                    out.push(' ');
                    for i in 1..cmd.len() {
                        let piece = compile_token(&mut cmd[i], ctx)?;
                        out.push_str(&piece);
                        if i < cmd.len() - 1 {
                            out.push(' ');
                        }
                    }
                }
            } else {
                if head.starts_with(RUNTIME_PREFIX) {
                    return Err(format!("Cannot use reserved variable name: {head}"));
                }
                out.push_str(&format!("{head}("));
                for i in 1..cmd.len() {
                    let param = compile_token(&mut cmd[i], ctx)?;
                    out.push_str(&param);
                    if i < cmd.len() - 1 {
                        out.push_str(", ");
                    }
                }
                out.push(')');
            }
        }
    }

    out.push('\n');
    Ok(out)
}

/// `each`-style loops reach the generator as `loop` with a range shape:
/// `loop v coll (…)` or `loop i v coll (…)`.
fn compile_range_loop(cmd: &mut Vec<Token>, ctx: &mut Context) -> Result<String, String> {
    let mut out = String::new();
    let last = cmd.len() - 1;
    expect_block(&cmd[last], "Loop command")?;

    if cmd.len() == 4 {
        let var = cmd[1].data_text().to_string();
        let coll = compile_token(&mut cmd[2], ctx)?;
        ctx.declared_vars.insert(var.clone());
        out.push_str(&format!(
            "for _, {var} := range {RUNTIME_PREFIX}castArray({coll}) {{\n"
        ));
        let body = compile_block_arg(&mut cmd[3], ctx)?;
        out.push_str(&body);
        out.push_str(&add_indent("}", ctx.indent * 2));
    } else {
        let index = cmd[1].data_text().to_string();
        let var = cmd[2].data_text().to_string();
        let coll = compile_token(&mut cmd[3], ctx)?;
        ctx.declared_vars.insert(index.clone());
        ctx.declared_vars.insert(var.clone());
        let raw = ctx.fresh_iterator();
        out.push_str(&format!(
            "for {raw}, {var} := range {RUNTIME_PREFIX}castArray({coll}) {{\n"
        ));
        out.push_str(&add_indent(
            &format!("{index} := {raw} + 1\n"),
            (ctx.indent + 1) * 2,
        ));
        out.push_str(&add_indent(&format!("_ = {index}\n"), (ctx.indent + 1) * 2));
        let last_idx = cmd.len() - 1;
        let body = compile_block_arg(&mut cmd[last_idx], ctx)?;
        out.push_str(&body);
        out.push_str(&add_indent("}", ctx.indent * 2));
    }
    out.push('\n');
    Ok(out)
}

/// Lowers a `type NAME (…)` declaration into a record struct, a constructor
/// and deferred closure-field assignments.
fn compile_type_decl(cmd: &mut Vec<Token>, ctx: &mut Context) -> Result<String, String> {
    if cmd.len() < 3 {
        return Err("Type command requires at least 2 parameters".to_string());
    }
    let name = cmd[1].data_text().to_string();
    if name.is_empty() {
        return Err("Type command requires a name".to_string());
    }
    let go_name = format!("{RUNTIME_PREFIX}_{name}");
    ctx.user_types.insert(name.clone(), format!("*{go_name}"));

    let mut out = String::new();
    match cmd[2].kind {
        TokenKind::Var => {
            let alias = map_type(ctx, cmd[2].data_text());
            out.push_str(&format!("type {go_name} {alias}\n"));
        }
        TokenKind::Blk => {
            let mut defaults: Vec<(String, Token)> = Vec::new();
            let mut inlines: Vec<(String, Token)> = Vec::new();
            let mut self_types: HashMap<String, String> = HashMap::new();
            let mut fields = String::new();

            let block = cmd[2].block_mut().map(std::mem::take).unwrap_or_default();
            for line in block {
                let Some(stmt) = line.into_iter().next() else {
                    continue;
                };
                if stmt.kind != TokenKind::Asi {
                    continue;
                }
                let Some(left) = &stmt.left else { continue };
                if left.kind != TokenKind::Var {
                    continue;
                }
                let field = left.data_text().to_string();
                let mut field_type = stmt.set_type.clone();

                if let Some(right) = &stmt.right {
                    if right.kind == TokenKind::Fnc && right.is_text("function") {
                        // closure fields initialise inside the constructor
                        let spec = right
                            .parameters
                            .first()
                            .map(|p| p.data_text().to_string())
                            .unwrap_or_default();
                        let mut param_types = Vec::new();
                        for (_, go_type) in parse_param_spec(ctx, &spec) {
                            param_types.push(go_type);
                        }
                        let return_type = if right.returns.is_empty() {
                            "any".to_string()
                        } else {
                            map_type(ctx, &right.returns)
                        };
                        field_type = format!("func({}) {return_type}", param_types.join(", "));
                        inlines.push((field.clone(), (**right).clone()));
                        self_types.insert(field.clone(), field_type.clone());
                        fields.push_str(&add_indent(
                            &format!("{} {field_type}\n", record_field(&field)),
                            2,
                        ));
                        continue;
                    }
                    defaults.push((field.clone(), (**right).clone()));
                }

                let go_field_type = if field_type.is_empty() {
                    "any".to_string()
                } else {
                    map_type(ctx, &field_type)
                };
                self_types.insert(field.clone(), go_field_type.clone());
                fields.push_str(&add_indent(
                    &format!("{} {go_field_type}\n", record_field(&field)),
                    2,
                ));
            }

            out.push_str(&format!("type {go_name} struct {{\n{fields}}}\n"));
            out.push_str(&format!(
                "func {RUNTIME_PREFIX}_new_{name}() *{go_name} {{\n"
            ));
            out.push_str(&add_indent(
                &format!("{RUNTIME_PREFIX}self := &{go_name}{{\n"),
                2,
            ));
            for (field, mut value) in defaults {
                let compiled = compile_token(&mut value, ctx)?;
                out.push_str(&add_indent(
                    &format!("{}: {compiled},\n", record_field(&field)),
                    4,
                ));
            }
            out.push_str(&add_indent("}\n", 2));
            for (field, mut value) in inlines {
                ctx.indent += 1;
                let compiled = compile_token(&mut value, ctx)?;
                ctx.indent -= 1;
                out.push_str(&add_indent(
                    &format!(
                        "{RUNTIME_PREFIX}self.{} = {compiled}\n",
                        record_field(&field)
                    ),
                    2,
                ));
            }
            out.push_str(&add_indent(&format!("return {RUNTIME_PREFIX}self\n"), 2));
            out.push_str("}\n");
            ctx.self_types = self_types;
        }
        _ => return Err("Type command requires a name or a block".to_string()),
    }
    Ok(out)
}

/// `def` without the function-assignment rewrite: a named function block, or
/// a custom command when the name is a string literal.
fn compile_def_cmd(cmd: &mut Vec<Token>, ctx: &mut Context) -> Result<String, String> {
    if cmd.len() < 2 {
        return Err("Def command requires at least 1 parameter".to_string());
    }

    let func_name;
    if cmd[1].kind == TokenKind::Str {
        let name = cmd[1].data_text().to_string();
        func_name = format!("{RUNTIME_PREFIX}CMD_{name}");
        ctx.custom_commands.insert(name);
    } else {
        func_name = cmd[1].data_text().to_string();
        if func_name.starts_with(RUNTIME_PREFIX) {
            return Err(format!("Cannot use reserved variable name: {func_name}"));
        }
    }

    let saved_declared = std::mem::take(&mut ctx.declared_vars);
    ctx.indent += 1;
    ctx.scope_level += 1;

    // parameters sit between the name and the trailing block
    let mut params = String::new();
    let last = cmd.len() - 1;
    for i in 2..last {
        match cmd[i].kind {
            TokenKind::Var | TokenKind::Cmd => {
                let name = cmd[i].data_text().to_string();
                let go_type = if cmd[i].set_type.is_empty() {
                    "any".to_string()
                } else {
                    map_type(ctx, &cmd[i].set_type)
                };
                ctx.declared_vars.insert(name.clone());
                ctx.variable_types.insert(name.clone(), go_type.clone());
                if !params.is_empty() {
                    params.push_str(", ");
                }
                params.push_str(&format!("{name} {go_type}"));
            }
            TokenKind::Fnc | TokenKind::Mtv => {
                for p in &cmd[i].parameters {
                    let name = p.data_text().to_string();
                    let go_type = if p.set_type.is_empty() {
                        "any".to_string()
                    } else {
                        map_type(ctx, &p.set_type)
                    };
                    ctx.declared_vars.insert(name.clone());
                    ctx.variable_types.insert(name.clone(), go_type.clone());
                    if !params.is_empty() {
                        params.push_str(", ");
                    }
                    params.push_str(&format!("{name} {go_type}"));
                }
            }
            _ => {}
        }
    }

    let mut body = String::new();
    let mut saw_return = false;
    if cmd[last].kind == TokenKind::Blk {
        if let Some(block) = cmd[last].block_mut() {
            let mut block = std::mem::take(block);
            saw_return = has_return_statement(&block);
            body = compile_block(&mut block, ctx)?;
        }
    }

    let result = if saw_return { "any " } else { "" };
    if saw_return && !ends_with_return(&body) {
        body.push_str(&add_indent("return nil\n", ctx.indent * 2));
    }

    ctx.scope_level -= 1;
    ctx.indent -= 1;
    ctx.declared_vars = saved_declared;

    Ok(format!(
        "func {func_name}({params}) {result}{{\n{body}}}\n"
    ))
}

/// Downloads the bitmap font table embedded into drawing programs. A failed
/// fetch degrades to an empty table so offline builds still succeed.
fn fetch_font_map() -> String {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build();
    let fetched = client.and_then(|c| c.get(FONT_URL).send()).and_then(|r| {
        r.json::<HashMap<String, serde_json::Value>>()
    });
    match fetched {
        Ok(mut map) => {
            map.remove("origin");
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = String::from("map[string]string{\n");
            for key in keys {
                let value = map[key].as_str().map(str::to_string).unwrap_or_default();
                out.push_str(&format!("\t{}: {},\n", json_quote(key), json_quote(&value)));
            }
            out.push('}');
            out
        }
        Err(err) => {
            eprintln!("warning: font download failed ({err}); embedding an empty font table");
            "map[string]string{}".to_string()
        }
    }
}

/// Resolves the recorded imports: inlines `quill/...` runtime packages and
/// compiles `./*.ql` imports in place, collecting the Go import list.
fn process_imports(ctx: &mut Context) -> Result<(String, Vec<String>), String> {
    let mut ordered = Vec::new();
    let mut processed = HashSet::new();
    for path in ctx.import_order.clone() {
        if ctx.imports.contains(&path) && processed.insert(path.clone()) {
            ordered.push(path);
        }
    }
    let mut remaining: Vec<String> = ctx
        .imports
        .iter()
        .filter(|p| !processed.contains(*p))
        .cloned()
        .collect();
    remaining.sort();
    ordered.extend(remaining);

    let mut compiled = String::new();
    let mut go_imports = Vec::new();

    for path in ordered {
        if let Some(rel) = path.strip_prefix("./") {
            let file = ctx.base_dir.join(rel);
            let data = std::fs::read_to_string(&file)
                .map_err(|e| format!("cannot read import '{path}': {e}"))?;
            if path.ends_with(".ql") {
                let mut sub = ctx.parser.generate_full_ast(&data, true)?;
                if let Some(err) = first_error(&sub) {
                    return Err(err);
                }
                let was_top = ctx.top_level;
                ctx.top_level = true;
                let block = compile_block(&mut sub, ctx)?;
                ctx.top_level = was_top;
                compiled.push('\n');
                compiled.push_str(&block);
            } else if path.ends_with(".go") {
                compiled.push('\n');
                compiled.push_str(&data);
            }
        } else if let Some(name) = path.strip_prefix("quill/") {
            if name == "std" {
                // always part of the prologue
                continue;
            }
            let src = package_source(name)
                .ok_or_else(|| format!("unknown runtime package '{path}'"))?;
            let file = src.trim();
            for line in file.lines() {
                if let Some(requires) = line.strip_prefix("// requires: ") {
                    for part in requires.split(", ") {
                        go_imports.push(part.trim().to_string());
                    }
                }
            }
            if name == "window" {
                let font = fetch_font_map();
                compiled = format!(
                    "\n\nvar {RUNTIME_PREFIX}font = map[string]string{}\n\n{compiled}",
                    font.strip_prefix("map[string]string").unwrap_or("{}")
                );
            }
            compiled = format!("\n{file}{compiled}");
        } else {
            go_imports.push(path);
        }
    }

    Ok((compiled, go_imports))
}

fn prologue(ctx: &Context, go_imports: &[String]) -> String {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for pkg in go_imports {
        if !seen.insert(pkg.clone()) {
            continue;
        }
        if let Some((actual, alias)) = pkg.split_once(" as ") {
            unique.push(format!("{} {}", alias.trim(), json_quote(actual.trim())));
        } else if let Some(alias) = ctx.import_aliases.get(pkg) {
            unique.push(format!("{alias} {}", json_quote(pkg)));
        } else {
            unique.push(json_quote(pkg.trim()));
        }
    }

    let mut out = String::from("package main\n\nimport (\n");
    for imp in unique {
        out.push_str(&format!("\t{imp}\n"));
    }
    out.push_str(")\n\n");
    out.push_str(&format!(
        "var {RUNTIME_PREFIX}launchTime float64 = {RUNTIME_PREFIX}castNumber(time.Now().UnixMilli())\n"
    ));
    out.push_str(&format!("var {RUNTIME_PREFIX}systemOS = runtime.GOOS\n"));
    out.push_str(&format!(
        "var {RUNTIME_PREFIX}timerFn func() float64 = func() float64 {{ return float64(time.Now().Unix()) - ({RUNTIME_PREFIX}launchTime / 1000) }}\n"
    ));
    out.push_str(&format!(
        "var {RUNTIME_PREFIX}timestampFn func() int64 = func() int64 {{ return time.Now().UnixMilli() }}\n"
    ));
    out.push_str("var timer float64\n");
    out.push_str("var timestamp int64\n");
    out.push_str(&format!(
        "func {RUNTIME_PREFIX}updateTimer() {{\n\ttimer = {RUNTIME_PREFIX}timerFn()\n\ttimestamp = {RUNTIME_PREFIX}timestampFn()\n}}\n\n"
    ));
    out.push_str(package_source("std").unwrap_or_default());
    out.push('\n');
    out
}

/// Emits the lifted free functions for user extension methods registered on
/// the six primitive types.
fn compile_builtin_methods(ctx: &mut Context) -> Result<String, String> {
    let mut out = String::new();
    let registered = std::mem::take(&mut ctx.builtin_type_methods);
    for (type_name, method_name, def) in &registered {
        let go_type = map_type(ctx, type_name);
        let func_name = format!(
            "{RUNTIME_PREFIX}MET{}{}",
            capitalize(type_name),
            capitalize(method_name)
        );

        let mut fnc = def.token.clone();
        // the receiver arrives as `self`, typed with the extended primitive
        let spec = fnc
            .parameters
            .first()
            .map(|p| p.data_text().to_string())
            .unwrap_or_default();
        let saved_declared = std::mem::take(&mut ctx.declared_vars);
        let saved_self = ctx.self_used;
        ctx.self_used = false;
        ctx.indent += 1;

        let mut params_string = format!("{RUNTIME_PREFIX}self {go_type}");
        for (name, go_param) in parse_param_spec(ctx, &spec) {
            ctx.declared_vars.insert(name.clone());
            ctx.variable_types.insert(name.clone(), go_param.clone());
            params_string.push_str(&format!(", {name} {go_param}"));
        }

        let mut returns = if def.return_type.is_empty() {
            "any ".to_string()
        } else {
            format!("{} ", map_type(ctx, &def.return_type))
        };

        let mut body = String::new();
        let mut saw_return = false;
        if fnc.parameters.len() > 1 {
            if let Some(block) = fnc.parameters[1].block_mut() {
                let mut block = std::mem::take(block);
                saw_return = has_return_statement(&block);
                body = compile_block(&mut block, ctx)?;
            }
        }
        ctx.self_used = false;

        if def.return_type.is_empty() && !saw_return {
            returns = "any ".to_string();
        }
        if returns == "any " && !ends_with_return(&body) {
            body.push_str(&add_indent("return nil\n", ctx.indent * 2));
        }

        ctx.indent -= 1;
        ctx.declared_vars = saved_declared;
        ctx.self_used = saved_self;

        out.push_str(&format!(
            "func {func_name}({params_string}) {returns}{{\n{body}}}\n\n"
        ));
    }
    ctx.builtin_type_methods = registered;
    Ok(out)
}

/// Compiles a parsed unit into a complete Go source file.
pub fn compile(
    mut ast: Vec<Vec<Token>>,
    parser: &mut Parser,
    base_dir: &Path,
) -> Result<String, String> {
    if let Some(err) = first_error(&ast) {
        return Err(err);
    }

    let mut ctx = Context::new(parser, base_dir);

    let drawing = has_drawing_commands(&ast);
    if drawing {
        ctx.add_import_front("quill/window");
    }

    // split the unit at the mainloop sentinel
    let pivot = ast
        .iter()
        .position(|line| {
            line.first()
                .map(|t| t.kind == TokenKind::Cmd && t.is_text("mainloop:"))
                .unwrap_or(false)
        });
    let mut main: Vec<Vec<Token>> = match pivot {
        Some(p) => ast.split_off(p + 1),
        None => Vec::new(),
    };
    if pivot.is_some() {
        ast.pop(); // the sentinel line itself
    }
    let init = ast;

    // top-level declarations leave the start-up body
    let mut top_level: Vec<Vec<Token>> = Vec::new();
    let mut init_body: Vec<Vec<Token>> = Vec::new();
    for line in init {
        let is_top = line
            .first()
            .map(|first| match first.kind {
                TokenKind::Asi => {
                    let fn_right = matches!(&first.right, Some(r) if r.kind == TokenKind::Fnc && r.is_text("function"));
                    let var_left = matches!(&first.left, Some(l) if l.kind == TokenKind::Var);
                    let rmt_left = matches!(&first.left, Some(l) if l.kind == TokenKind::Rmt);
                    fn_right && (var_left || rmt_left)
                }
                TokenKind::Cmd => first.is_text("def") || first.is_text("type"),
                _ => false,
            })
            .unwrap_or(false);
        if is_top {
            top_level.push(line);
        } else {
            init_body.push(line);
        }
    }

    // declarations later in the unit must be visible while init compiles:
    // user types, custom commands and primitive-type extension methods
    for line in top_level.iter() {
        let first = &line[0];
        if first.kind == TokenKind::Cmd && first.is_text("type") && line.len() > 1 {
            let name = line[1].data_text().to_string();
            if !name.is_empty() {
                ctx.user_types
                    .insert(name.clone(), format!("*{RUNTIME_PREFIX}_{name}"));
            }
        }
        if first.kind == TokenKind::Cmd
            && first.is_text("def")
            && line.len() > 1
            && line[1].kind == TokenKind::Str
        {
            ctx.custom_commands.insert(line[1].data_text().to_string());
        }
        if first.kind == TokenKind::Asi {
            if let (Some(left), Some(right)) = (&first.left, &first.right) {
                if left.kind == TokenKind::Rmt
                    && right.kind == TokenKind::Fnc
                    && right.is_text("function")
                {
                    let type_name = left
                        .list()
                        .filter(|p| p.len() == 1 && p[0].kind == TokenKind::Var)
                        .map(|p| p[0].data_text().to_string());
                    let method = left
                        .final_seg
                        .as_ref()
                        .filter(|f| f.kind == TokenKind::Var)
                        .map(|f| f.data_text().to_string());
                    if let (Some(type_name), Some(method)) = (type_name, method) {
                        if is_primitive_type_name(&type_name) {
                            ctx.register_builtin_method(
                                &type_name,
                                &method,
                                MethodDefinition {
                                    return_type: right.returns.clone(),
                                    token: (**right).clone(),
                                },
                            );
                        }
                    }
                }
            }
        }
    }

    ctx.is_init = true;
    let init_compiled = compile_block(&mut init_body, &mut ctx)?;

    ctx.global_declared_vars
        .extend(ctx.declared_vars.iter().cloned());
    ctx.global_variable_types
        .extend(ctx.variable_types.clone());

    ctx.is_init = false;
    ctx.top_level = true;
    let funcs_compiled = compile_block(&mut top_level, &mut ctx)?;
    ctx.top_level = false;
    let funcs_compiled = format!("{}{}", ctx.global_vars, funcs_compiled);

    let main_compiled = compile_block(&mut main, &mut ctx)?;

    let methods_compiled = compile_builtin_methods(&mut ctx)?;

    let assembled = if drawing {
        format!(
            "{funcs_compiled}\nfunc main() {{\n\twindow.Create({RUNTIME_PREFIX}setup)\n}}\n\nfunc {RUNTIME_PREFIX}setup(window *{RUNTIME_PREFIX}Window) {{\n{}\twindow.loop = func(window *{RUNTIME_PREFIX}Window) {{\n{}\t}}\n}}\n",
            indent_block(&init_compiled, 1),
            indent_block(&main_compiled, 2)
        )
    } else {
        format!(
            "{funcs_compiled}\nfunc main() {{\n\t{RUNTIME_PREFIX}updateTimer()\n{}{}}}\n",
            indent_block(&init_compiled, 1),
            indent_block(&main_compiled, 1)
        )
    };

    let (imports_compiled, go_imports) = process_imports(&mut ctx)?;
    let prologue = prologue(&ctx, &go_imports);

    Ok(format!(
        "{prologue}{methods_compiled}{imports_compiled}{assembled}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(code: &str) -> String {
        let mut parser = Parser::new();
        let ast = parser.generate_full_ast(code, true).expect("parse failed");
        compile(ast, &mut parser, Path::new(".")).expect("compile failed")
    }

    fn emit_err(code: &str) -> String {
        let mut parser = Parser::new();
        let ast = match parser.generate_full_ast(code, true) {
            Ok(ast) => ast,
            Err(e) => return e,
        };
        compile(ast, &mut parser, Path::new(".")).expect_err("expected a compile error")
    }

    #[test]
    fn hello_world_logs_through_the_runtime() {
        let out = emit("log \"hi\"");
        assert!(out.contains("QLlogValues(\"hi\")"), "got:\n{out}");
        assert!(out.contains("func main() {"));
    }

    #[test]
    fn typed_arithmetic_elides_casts() {
        let out = emit("int x = 3\nnumber y = 2.5\nlog x + y");
        assert!(out.contains("var x int"), "got:\n{out}");
        assert!(out.contains("var y float64"), "got:\n{out}");
        assert!(out.contains("(float64(x) + y)"), "got:\n{out}");
        assert!(
            !out.contains("QLcastNumber(x)"),
            "cast should be elided:\n{out}"
        );
    }

    #[test]
    fn string_plus_joins_with_a_space() {
        let out = emit("log \"a\" + \"b\"");
        assert!(out.contains("(\"a\" + \" \" + \"b\")"), "got:\n{out}");
    }

    #[test]
    fn zero_arg_builtin_works_without_parens() {
        let out = emit("log \"ABC\".toLower");
        assert!(out.contains("strings.ToLower(\"ABC\")"), "got:\n{out}");
    }

    #[test]
    fn array_sort_goes_through_the_runtime() {
        let out = emit("log [3, 1, 2].sort");
        assert!(out.contains("QLsort("), "got:\n{out}");
    }

    #[test]
    fn subscript_read_uses_the_dynamic_getter() {
        let out = emit("x = [1, 2, 3]\nlog x[1].toStr");
        assert!(out.contains("QLtoString(QLgetItem(x, 1))"), "got:\n{out}");
    }

    #[test]
    fn ternary_emits_an_immediate_function() {
        let out = emit("log (5 > 3) ? \"y\" \"n\"");
        assert!(
            out.contains("func() any { if 5 > 3 { return \"y\" } else { return \"n\" } }()"),
            "got:\n{out}"
        );
    }

    #[test]
    fn drawing_units_get_the_window_entrypoint() {
        let out = emit("square 10 10 0");
        assert!(out.contains("window.Create(QLsetup)"), "got:\n{out}");
        assert!(out.contains("QLdrawctx.Rect(10, 10, 0)"), "got:\n{out}");
    }

    #[test]
    fn plain_units_get_the_plain_entrypoint() {
        let out = emit("log \"no drawing here\"");
        assert!(!out.contains("window.Create"), "got:\n{out}");
        assert!(out.contains("func main() {"), "got:\n{out}");
    }

    #[test]
    fn modifiers_emit_before_the_statement_as_commands() {
        let out = emit("square 10 10 0 : c#FF0000");
        let color = out.find("QLdrawctx.Color").expect("color emitted");
        let rect = out.find("QLdrawctx.Rect").expect("rect emitted");
        assert!(color < rect, "modifier must precede the statement:\n{out}");
    }

    #[test]
    fn top_level_objects_are_wrapped_in_a_safe_map() {
        let out = emit("state = {count: 0}");
        assert!(out.contains("QLnewSafeMap(map[string]any{"), "got:\n{out}");
    }

    #[test]
    fn chain_statement_folds_to_its_receiver_expression() {
        // `=??` means: emit the right-hand side verbatim, no assignment
        let out = emit("x = [1, 2]\nx.pop()");
        assert!(out.contains("QLpop(&(x))"), "got:\n{out}");
        assert!(!out.contains("=??"), "got:\n{out}");
    }

    #[test]
    fn member_assignment_routes_through_set_item() {
        let out = emit("obj = {a: 1}\nobj.a = 2");
        assert!(out.contains("QLsetItem(obj, \"a\", 2)"), "got:\n{out}");
    }

    #[test]
    fn user_type_lowers_to_struct_and_constructor() {
        let out = emit("type Point (\nx = 0\ny = 0\n)\np = Point()\np.x = 4\nlog p.x");
        assert!(out.contains("type QL_Point struct {"), "got:\n{out}");
        assert!(out.contains("func QL_new_Point() *QL_Point {"), "got:\n{out}");
        assert!(out.contains("var p = QL_new_Point()"), "got:\n{out}");
        assert!(out.contains("QLsetItem(p, \"x\", 4)"), "got:\n{out}");
    }

    #[test]
    fn custom_command_defines_and_dispatches() {
        let out = emit("def \"greet\" name (\nlog name\n)\ngreet \"world\"");
        assert!(out.contains("func QLCMD_greet(name any)"), "got:\n{out}");
        assert!(out.contains("QLCMD_greet(\"world\")"), "got:\n{out}");
    }

    #[test]
    fn primitive_extension_method_lifts_to_a_free_function() {
        let out = emit("string.shout @= def(s) -> (\nreturn s.toUpper\n)\nlog \"hi\".shout()");
        assert!(
            out.contains("func QLMETStringShout(QLself string)"),
            "got:\n{out}"
        );
        assert!(out.contains("QLMETStringShout(\"hi\")"), "got:\n{out}");
    }

    #[test]
    fn named_function_compiles_to_top_level_func() {
        let out = emit("def add(a, b) (\nreturn a + b\n)\nlog add(1, 2)");
        assert!(out.contains("func add(a any, b any) any {"), "got:\n{out}");
        assert!(out.contains("add(1, 2)"), "got:\n{out}");
    }

    #[test]
    fn function_without_return_gets_return_nil() {
        let out = emit("f = (x) -> (\nlog x\n)");
        assert!(out.contains("return nil"), "got:\n{out}");
    }

    #[test]
    fn reserved_prefix_is_rejected() {
        let err = emit_err("QLthing = 1");
        assert!(
            err.contains("reserved variable name"),
            "got error: {err:?}"
        );
    }

    #[test]
    fn icon_arity_is_a_shape_error() {
        let err = emit_err("icon \"home\"");
        assert!(err.contains("Icon command requires 2"), "got: {err:?}");
    }

    #[test]
    fn first_parse_error_aborts_compilation() {
        let err = emit_err("x = 1 +\nlog \"never\"");
        assert!(err.contains("Malformed"), "got: {err:?}");
    }

    #[test]
    fn worker_builtin_emits_runtime_call() {
        let out = emit("w = worker({oncreate: (w) -> (\nlog \"up\"\n)})");
        assert!(out.contains("QLworker("), "got:\n{out}");
    }

    #[test]
    fn while_loops_reevaluate_their_condition() {
        let out = emit("x = 0\nwhile x < 3 (\nx ++\n)");
        assert!(out.contains("for QLcastNumber(x) < QLcastNumber(3)") || out.contains("for x < 3"),
            "got:\n{out}");
        assert!(out.contains("x += 1"), "got:\n{out}");
    }

    #[test]
    fn mainloop_splits_init_from_main() {
        let out = emit("x = 1\nmainloop:\nlog x");
        assert!(out.contains("var x"), "got:\n{out}");
        let main_pos = out.find("func main() {").unwrap();
        let log_pos = out.find("QLlogValues(x)").unwrap();
        assert!(log_pos > main_pos, "main body follows init:\n{out}");
    }

    #[test]
    fn imports_are_deduplicated() {
        let out = emit("import \"quill/lock\"\nimport \"quill/lock\"\nlog \"ok\"");
        // the package body appears exactly once
        assert_eq!(out.matches("type QLlock struct").count(), 1, "got:\n{out}");
    }

    #[test]
    fn go_statement_passes_through() {
        let out = emit("def tick (\nlog \"t\"\n)\ngo tick()");
        assert!(out.contains("go tick()"), "got:\n{out}");
    }

    #[test]
    fn until_negates_its_condition() {
        let out = emit("x = 0\nuntil x > 3 (\nx ++\n)");
        assert!(out.contains("for !("), "got:\n{out}");
    }
}
