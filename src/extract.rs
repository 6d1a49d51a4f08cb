//! Ruby symbol extraction using the tree-sitter AST.
//!
//! The walk is a plain recursive descent that threads an immutable
//! [`Context`] into each call: a class or module body receives a new context
//! naming that class, and sibling subtrees always see their parent's context.

use std::cell::RefCell;
use tree_sitter::{Node, Parser, Tree};

use crate::error::IndexError;
use crate::model::{SymbolKind, SymbolRecord};

thread_local! {
    static PARSER: RefCell<Option<Parser>> = const { RefCell::new(None) };
}

#[derive(Debug)]
pub struct Extraction {
    pub records: Vec<SymbolRecord>,
    pub error: Option<IndexError>,
}

pub fn extract(source: &str, file: &str) -> Extraction {
    let Some(tree) = parse(source) else {
        return syntax_failure(file, 0);
    };
    let root = tree.root_node();
    if root.has_error() {
        return syntax_failure(file, first_error_line(root).unwrap_or(0));
    }

    let mut records = Vec::new();
    visit(root, source.as_bytes(), Context::top_level(), file, &mut records);
    Extraction {
        records,
        error: None,
    }
}

fn parse(source: &str) -> Option<Tree> {
    PARSER.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            let mut parser = Parser::new();
            parser
                .set_language(&tree_sitter_ruby::LANGUAGE.into())
                .ok()?;
            *slot = Some(parser);
        }
        slot.as_mut()?.parse(source, None)
    })
}

fn syntax_failure(file: &str, line: u32) -> Extraction {
    Extraction {
        records: Vec::new(),
        error: Some(IndexError::Syntax {
            path: file.to_string(),
            line,
        }),
    }
}

fn first_error_line(node: Node<'_>) -> Option<u32> {
    if node.is_error() || node.is_missing() {
        return Some(line_of(node));
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.has_error()
            && let Some(line) = first_error_line(child)
        {
            return Some(line);
        }
    }
    None
}

#[derive(Debug, Clone, Copy)]
struct Context<'s> {
    enclosing: Option<&'s str>,
    /// Inside `class << self`.
    singleton: bool,
}

impl<'s> Context<'s> {
    fn top_level() -> Self {
        Self {
            enclosing: None,
            singleton: false,
        }
    }

    fn within(name: &'s str) -> Self {
        Self {
            enclosing: Some(name),
            singleton: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Construct<'s> {
    Class { name: &'s str },
    Module { name: &'s str },
    SingletonClass,
    Method { name: &'s str },
    SingletonMethod { name: &'s str },
    Constant { name: &'s str },
    Scope { name: &'s str },
    Other,
}

fn classify<'s>(node: Node<'_>, src: &'s [u8]) -> Construct<'s> {
    match node.kind() {
        "class" => match field(node, "name").and_then(|n| bare_constant(n, src)) {
            Some(name) => Construct::Class { name },
            None => Construct::Other,
        },
        "module" => match field(node, "name").and_then(|n| bare_constant(n, src)) {
            Some(name) => Construct::Module { name },
            None => Construct::Other,
        },
        "singleton_class" => match field(node, "value") {
            Some(value) if value.kind() == "self" => Construct::SingletonClass,
            _ => Construct::Other,
        },
        "method" => match field(node, "name").and_then(|n| text(n, src)) {
            Some(name) => Construct::Method { name },
            None => Construct::Other,
        },
        "singleton_method" => match field(node, "name").and_then(|n| text(n, src)) {
            Some(name) => Construct::SingletonMethod { name },
            None => Construct::Other,
        },
        "assignment" | "operator_assignment" => {
            match field(node, "left").and_then(|n| constant_target(n, src)) {
                Some(name) => Construct::Constant { name },
                None => Construct::Other,
            }
        }
        "call" => match scope_name(node, src) {
            Some(name) => Construct::Scope { name },
            None => Construct::Other,
        },
        _ => Construct::Other,
    }
}

fn visit<'s>(
    node: Node<'_>,
    src: &'s [u8],
    ctx: Context<'s>,
    file: &str,
    out: &mut Vec<SymbolRecord>,
) {
    let line = line_of(node);
    let emit = |out: &mut Vec<SymbolRecord>, kind: SymbolKind, name: &str, class_level: bool| {
        out.push(SymbolRecord {
            kind,
            name: name.to_string(),
            file: file.to_string(),
            line,
            enclosing: ctx.enclosing.map(str::to_string),
            class_level,
        });
    };

    let inner = match classify(node, src) {
        Construct::Class { name } => {
            emit(out, SymbolKind::Class, name, false);
            Context::within(name)
        }
        Construct::Module { name } => {
            emit(out, SymbolKind::Module, name, false);
            Context::within(name)
        }
        Construct::SingletonClass => Context {
            singleton: true,
            ..ctx
        },
        Construct::Method { name } => {
            emit(out, SymbolKind::Method, name, ctx.singleton);
            ctx
        }
        Construct::SingletonMethod { name } => {
            emit(out, SymbolKind::Method, name, true);
            ctx
        }
        Construct::Constant { name } => {
            emit(out, SymbolKind::Constant, name, false);
            ctx
        }
        Construct::Scope { name } => {
            emit(out, SymbolKind::Scope, name, false);
            ctx
        }
        Construct::Other => ctx,
    };

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        visit(child, src, inner, file, out);
    }
}

/// `scope :name, -> { ... }` and friends. Receiver must be absent or `self`,
/// the first argument a plain symbol, and a closure must be supplied either as
/// an argument or as the call's block.
fn scope_name<'s>(node: Node<'_>, src: &'s [u8]) -> Option<&'s str> {
    if let Some(receiver) = field(node, "receiver")
        && receiver.kind() != "self"
    {
        return None;
    }
    if text(field(node, "method")?, src)? != "scope" {
        return None;
    }

    let arguments = field(node, "arguments")?;
    let mut cursor = arguments.walk();
    let args: Vec<Node<'_>> = arguments.named_children(&mut cursor).collect();

    let first = args.first()?;
    let name = symbol_name(*first, src)?;

    let has_closure = field(node, "block").is_some() || args[1..].iter().any(|a| is_closure(*a, src));
    has_closure.then_some(name)
}

/// `:name` or `:"name"`; interpolated symbols have no literal name.
fn symbol_name<'s>(node: Node<'_>, src: &'s [u8]) -> Option<&'s str> {
    match node.kind() {
        "simple_symbol" => text(node, src)?.strip_prefix(':').filter(|s| !s.is_empty()),
        "delimited_symbol" => {
            let mut cursor = node.walk();
            let mut parts = node.named_children(&mut cursor);
            let content = parts.next()?;
            if content.kind() != "string_content" || parts.next().is_some() {
                return None;
            }
            text(content, src)
        }
        _ => None,
    }
}

fn is_closure(node: Node<'_>, src: &[u8]) -> bool {
    match node.kind() {
        "lambda" => true,
        "call" => {
            field(node, "block").is_some()
                && field(node, "receiver").is_none()
                && field(node, "method")
                    .and_then(|m| text(m, src))
                    .is_some_and(|m| m == "lambda" || m == "proc")
        }
        _ => false,
    }
}

fn constant_target<'s>(node: Node<'_>, src: &'s [u8]) -> Option<&'s str> {
    match node.kind() {
        "constant" => text(node, src),
        "scope_resolution" => {
            let name = field(node, "name")?;
            (name.kind() == "constant").then(|| text(name, src)).flatten()
        }
        _ => None,
    }
}

/// Last segment of a class or module name (`Admin::User` -> `User`).
fn bare_constant<'s>(node: Node<'_>, src: &'s [u8]) -> Option<&'s str> {
    match node.kind() {
        "scope_resolution" => text(field(node, "name")?, src),
        _ => text(node, src),
    }
}

fn field<'t>(node: Node<'t>, name: &str) -> Option<Node<'t>> {
    node.child_by_field_name(name)
}

fn text<'s>(node: Node<'_>, src: &'s [u8]) -> Option<&'s str> {
    node.utf8_text(src).ok().filter(|s| !s.is_empty())
}

fn line_of(node: Node<'_>) -> u32 {
    u32::try_from(node.start_position().row)
        .unwrap_or(u32::MAX - 1)
        .saturating_add(1)
}
