// Language extractors

use tree_sitter::{Node, Parser as TreeParser, Tree};

use crate::error::ExtractionError;
use crate::index::{
    ExtractedCall, ExtractedFacts, ExtractedImport, ExtractedRef, ExtractedSymbol, Extractor,
    RefKind, SymbolKind,
};

/// Node kinds that add a decision point to a function's complexity
const DECISION_POINTS: &[&str] = &[
    "if_statement",
    "elif_clause",
    "for_statement",
    "while_statement",
    "except_clause",
    "conditional_expression",
    "boolean_operator",
    "if_clause",
    "case_clause",
];

/// Python extractor using tree-sitter
pub struct PythonExtractor;

impl PythonExtractor {
    pub fn new() -> Self {
        Self
    }

    fn parse_tree(&self, content: &str) -> Result<Tree, ExtractionError> {
        let mut parser = TreeParser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .map_err(|e| ExtractionError::new(format!("cannot load Python grammar: {}", e)))?;

        parser
            .parse(content, None)
            .ok_or_else(|| ExtractionError::new("Failed to parse Python code"))
    }
}

impl Default for PythonExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for PythonExtractor {
    fn language(&self) -> &'static str {
        "python"
    }

    fn version(&self) -> u32 {
        1
    }

    fn can_extract(&self, path: &str) -> bool {
        path.ends_with(".py") || path.ends_with(".pyi")
    }

    fn extract(&self, _path: &str, content: &str) -> Result<ExtractedFacts, ExtractionError> {
        let tree = self.parse_tree(content)?;
        let root = tree.root_node();

        if root.has_error() {
            let line = first_error_line(root).unwrap_or(1);
            return Err(ExtractionError::at_line(
                format!("syntax error near line {}", line),
                line,
            ));
        }

        let mut walker = Walker {
            content,
            facts: ExtractedFacts::default(),
        };
        walker.visit_children(root, &Scope::module());
        Ok(walker.facts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Module,
    Class,
    Function,
}

/// Where the walker currently is
#[derive(Debug, Clone)]
struct Scope {
    prefix: String,
    symbol: Option<usize>,
    kind: ScopeKind,
}

impl Scope {
    fn module() -> Self {
        Self {
            prefix: String::new(),
            symbol: None,
            kind: ScopeKind::Module,
        }
    }

    fn qualify(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    fn enter(&self, qualified_name: String, symbol: usize, kind: ScopeKind) -> Self {
        Self {
            prefix: qualified_name,
            symbol: Some(symbol),
            kind,
        }
    }
}

struct Walker<'a> {
    content: &'a str,
    facts: ExtractedFacts,
}

impl<'a> Walker<'a> {
    fn visit_children(&mut self, node: Node, scope: &Scope) {
        let mut cursor = node.walk();
        let children: Vec<Node> = node.children(&mut cursor).collect();
        for child in children {
            self.visit(child, scope);
        }
    }

    fn visit(&mut self, node: Node, scope: &Scope) {
        match node.kind() {
            "function_definition" => {
                match self.extract_function(node, scope) {
                    Some(inner) => self.visit_children(node, &inner),
                    None => self.visit_children(node, scope),
                }
                return;
            }
            "class_definition" => {
                match self.extract_class(node, scope) {
                    Some(inner) => self.visit_children(node, &inner),
                    None => self.visit_children(node, scope),
                }
                return;
            }
            "import_statement" => {
                self.extract_import(node, scope);
                return;
            }
            "import_from_statement" => {
                self.extract_import_from(node, scope);
                return;
            }
            "call" => self.extract_call(node, scope),
            "attribute" => self.extract_attribute(node, scope),
            "assignment" if scope.kind != ScopeKind::Function => {
                self.extract_variable(node, scope)
            }
            "type" => {
                let target = collapse(self.text(node));
                self.push_ref(scope, RefKind::TypeRef, target, node);
            }
            _ => {}
        }

        self.visit_children(node, scope);
    }

    fn extract_function(&mut self, node: Node, scope: &Scope) -> Option<Scope> {
        let name = self.text(node.child_by_field_name("name")?).to_string();
        let qualified_name = scope.qualify(&name);

        let params = node
            .child_by_field_name("parameters")
            .map(|p| collapse(self.text(p)))
            .unwrap_or_else(|| "()".to_string());
        let is_async = node.child(0).map(|c| c.kind() == "async").unwrap_or(false);
        let mut signature = format!(
            "{}def {}{}",
            if is_async { "async " } else { "" },
            name,
            params
        );
        if let Some(ret) = node.child_by_field_name("return_type") {
            signature.push_str(" -> ");
            signature.push_str(&collapse(self.text(ret)));
        }

        let kind = if scope.kind == ScopeKind::Class {
            SymbolKind::Method
        } else {
            SymbolKind::Function
        };

        let index = self.facts.symbols.len();
        self.facts.symbols.push(ExtractedSymbol {
            kind,
            name,
            qualified_name: qualified_name.clone(),
            parent: scope.symbol,
            signature: Some(signature),
            docstring: self.docstring(node),
            start_line: line_of(node),
            end_line: end_line_of(node),
            complexity: complexity(node),
        });

        Some(scope.enter(qualified_name, index, ScopeKind::Function))
    }

    fn extract_class(&mut self, node: Node, scope: &Scope) -> Option<Scope> {
        let name = self.text(node.child_by_field_name("name")?).to_string();
        let qualified_name = scope.qualify(&name);

        let bases = node
            .child_by_field_name("superclasses")
            .map(|b| collapse(self.text(b)))
            .unwrap_or_default();
        let signature = format!("class {}{}", name, bases);

        let index = self.facts.symbols.len();
        self.facts.symbols.push(ExtractedSymbol {
            kind: SymbolKind::Class,
            name,
            qualified_name: qualified_name.clone(),
            parent: scope.symbol,
            signature: Some(signature),
            docstring: self.docstring(node),
            start_line: line_of(node),
            end_line: end_line_of(node),
            complexity: 1,
        });

        let inner = scope.enter(qualified_name, index, ScopeKind::Class);
        if let Some(bases) = node.child_by_field_name("superclasses") {
            let mut cursor = bases.walk();
            for base in bases.named_children(&mut cursor) {
                if matches!(base.kind(), "identifier" | "attribute") {
                    let target = self.text(base).to_string();
                    self.push_ref(&inner, RefKind::TypeRef, target, base);
                }
            }
        }
        Some(inner)
    }

    /// Module- and class-level `name = value` bindings
    fn extract_variable(&mut self, node: Node, scope: &Scope) {
        let Some(left) = node.child_by_field_name("left") else {
            return;
        };
        if left.kind() != "identifier" {
            return;
        }
        let name = self.text(left).to_string();
        let qualified_name = scope.qualify(&name);
        let seen = self
            .facts
            .symbols
            .iter()
            .any(|s| s.kind == SymbolKind::Variable && s.qualified_name == qualified_name);
        if seen {
            return;
        }

        self.facts.symbols.push(ExtractedSymbol {
            kind: SymbolKind::Variable,
            name,
            qualified_name,
            parent: scope.symbol,
            signature: None,
            docstring: None,
            start_line: line_of(node),
            end_line: end_line_of(node),
            complexity: 1,
        });
    }

    fn extract_call(&mut self, node: Node, scope: &Scope) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        self.facts.calls.push(ExtractedCall {
            caller: scope.symbol,
            callee_expr: collapse(self.text(function)),
            line: line_of(node),
        });
    }

    fn extract_attribute(&mut self, node: Node, scope: &Scope) {
        if is_call_function(node) {
            return;
        }
        // Only the outermost attribute of a chain is recorded
        if let Some(parent) = node.parent() {
            if parent.kind() == "attribute"
                && parent.child_by_field_name("object") == Some(node)
                && !is_call_function(parent)
            {
                return;
            }
        }

        let kind = match node.parent() {
            Some(parent)
                if matches!(parent.kind(), "assignment" | "augmented_assignment")
                    && parent.child_by_field_name("left") == Some(node) =>
            {
                RefKind::Write
            }
            _ => RefKind::Read,
        };
        let target = collapse(self.text(node));
        self.push_ref(scope, kind, target, node);
    }

    fn extract_import(&mut self, node: Node, scope: &Scope) {
        let mut cursor = node.walk();
        let names: Vec<Node> = node.children_by_field_name("name", &mut cursor).collect();
        for name in names {
            let module = match name.kind() {
                "aliased_import" => name
                    .child_by_field_name("name")
                    .map(|n| self.text(n).to_string()),
                _ => Some(self.text(name).to_string()),
            };
            let Some(module) = module else {
                continue;
            };
            self.push_ref(scope, RefKind::Import, module.clone(), node);
            self.facts.imports.push(ExtractedImport {
                module,
                names: Vec::new(),
                line: line_of(node),
            });
        }
    }

    fn extract_import_from(&mut self, node: Node, scope: &Scope) {
        let Some(module_node) = node.child_by_field_name("module_name") else {
            return;
        };
        let module = self.text(module_node).to_string();

        let mut names = Vec::new();
        let mut cursor = node.walk();
        for name in node.children_by_field_name("name", &mut cursor) {
            let imported = match name.kind() {
                "aliased_import" => name.child_by_field_name("name").map(|n| self.text(n)),
                _ => Some(self.text(name)),
            };
            if let Some(imported) = imported {
                names.push(imported.to_string());
            }
        }
        let mut cursor = node.walk();
        if node
            .children(&mut cursor)
            .any(|c| c.kind() == "wildcard_import")
        {
            names.push("*".to_string());
        }

        for name in &names {
            let separator = if module.ends_with('.') { "" } else { "." };
            let target = format!("{}{}{}", module, separator, name);
            self.push_ref(scope, RefKind::Import, target, node);
        }
        self.facts.imports.push(ExtractedImport {
            module,
            names,
            line: line_of(node),
        });
    }

    fn push_ref(&mut self, scope: &Scope, kind: RefKind, target: String, node: Node) {
        if target.is_empty() {
            return;
        }
        self.facts.refs.push(ExtractedRef {
            symbol: scope.symbol,
            kind,
            target,
            line: line_of(node),
        });
    }

    /// First string statement of a function or class body
    fn docstring(&self, node: Node) -> Option<String> {
        let body = node.child_by_field_name("body")?;
        let first = body.named_child(0)?;
        if first.kind() != "expression_statement" {
            return None;
        }
        let string = first.named_child(0)?;
        if string.kind() != "string" {
            return None;
        }
        let text = strip_quotes(self.text(string));
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    fn text(&self, node: Node) -> &'a str {
        &self.content[node.byte_range()]
    }
}

fn is_call_function(node: Node) -> bool {
    node.parent()
        .map(|p| p.kind() == "call" && p.child_by_field_name("function") == Some(node))
        .unwrap_or(false)
}

/// 1 + decision points in the body, not counting nested definitions
fn complexity(node: Node) -> u32 {
    let mut score = 1;
    let Some(body) = node.child_by_field_name("body") else {
        return score;
    };
    let mut stack = vec![body];
    while let Some(current) = stack.pop() {
        if DECISION_POINTS.contains(&current.kind()) {
            score += 1;
        }
        let mut cursor = current.walk();
        for child in current.children(&mut cursor) {
            if !matches!(
                child.kind(),
                "function_definition" | "class_definition" | "lambda"
            ) {
                stack.push(child);
            }
        }
    }
    score
}

fn first_error_line(root: Node) -> Option<usize> {
    let mut stack = vec![root];
    let mut first: Option<usize> = None;
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            let line = line_of(node);
            first = Some(first.map_or(line, |f| f.min(line)));
            continue;
        }
        if node.has_error() {
            let mut cursor = node.walk();
            stack.extend(node.children(&mut cursor));
        }
    }
    first
}

fn line_of(node: Node) -> usize {
    node.start_position().row + 1
}

fn end_line_of(node: Node) -> usize {
    node.end_position().row + 1
}

/// Collapse runs of whitespace (including newlines) into one space
fn collapse(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, part) in text.split_whitespace().enumerate() {
        if i > 0 && !(out.ends_with('(') || part.starts_with(')')) {
            out.push(' ');
        }
        out.push_str(part);
    }
    out
}

fn strip_quotes(literal: &str) -> String {
    let body = literal.trim_start_matches(|c: char| "rRbBuUfF".contains(c));
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if body.len() >= 2 * quote.len() && body.starts_with(quote) && body.ends_with(quote) {
            return body[quote.len()..body.len() - quote.len()].trim().to_string();
        }
    }
    body.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(source: &str) -> ExtractedFacts {
        PythonExtractor::new().extract("test.py", source).unwrap()
    }

    fn symbol<'f>(facts: &'f ExtractedFacts, qualified_name: &str) -> &'f ExtractedSymbol {
        facts
            .symbols
            .iter()
            .find(|s| s.qualified_name == qualified_name)
            .unwrap_or_else(|| panic!("no symbol {}", qualified_name))
    }

    #[test]
    fn test_can_extract() {
        let extractor = PythonExtractor::new();
        assert!(extractor.can_extract("pkg/mod.py"));
        assert!(extractor.can_extract("stubs/mod.pyi"));
        assert!(!extractor.can_extract("main.rs"));
    }

    #[test]
    fn test_function_with_call() {
        let facts = extract("def f():\n    return g()\n");

        let f = symbol(&facts, "f");
        assert_eq!(f.kind, SymbolKind::Function);
        assert_eq!(f.start_line, 1);
        assert_eq!(f.end_line, 2);
        assert_eq!(f.signature.as_deref(), Some("def f()"));

        assert_eq!(facts.calls.len(), 1);
        assert_eq!(facts.calls[0].callee_expr, "g");
        assert_eq!(facts.calls[0].caller, Some(0));
        assert_eq!(facts.calls[0].line, 2);
    }

    #[test]
    fn test_class_methods_and_docstrings() {
        let source = r#"
class Parser(Base):
    """Parses things."""

    def parse(self, text: str) -> Node:
        '''Parse one document.'''
        return self.build(text)
"#;
        let facts = extract(source);

        let class = symbol(&facts, "Parser");
        assert_eq!(class.kind, SymbolKind::Class);
        assert_eq!(class.docstring.as_deref(), Some("Parses things."));
        assert_eq!(class.signature.as_deref(), Some("class Parser(Base)"));

        let method = symbol(&facts, "Parser.parse");
        assert_eq!(method.kind, SymbolKind::Method);
        assert_eq!(method.parent, Some(0));
        assert_eq!(
            method.signature.as_deref(),
            Some("def parse(self, text: str) -> Node")
        );
        assert_eq!(method.docstring.as_deref(), Some("Parse one document."));

        let call = facts
            .calls
            .iter()
            .find(|c| c.callee_expr == "self.build")
            .unwrap();
        assert_eq!(call.caller, Some(1));

        let type_refs: Vec<&str> = facts
            .refs
            .iter()
            .filter(|r| r.kind == RefKind::TypeRef)
            .map(|r| r.target.as_str())
            .collect();
        assert!(type_refs.contains(&"Base"));
        assert!(type_refs.contains(&"str"));
        assert!(type_refs.contains(&"Node"));
    }

    #[test]
    fn test_nested_qualified_names() {
        let facts = extract("class A:\n    class B:\n        def m(self):\n            pass\n");
        assert_eq!(symbol(&facts, "A.B").kind, SymbolKind::Class);
        assert_eq!(symbol(&facts, "A.B.m").kind, SymbolKind::Method);
    }

    #[test]
    fn test_complexity() {
        let source = r#"
def check(x, y):
    if x and y:
        return 1
    elif x:
        return 2
    for i in range(3):
        while i:
            i -= 1
    try:
        pass
    except ValueError:
        pass
    return 0
"#;
        let facts = extract(source);
        // if, and, elif, for, while, except
        assert_eq!(symbol(&facts, "check").complexity, 7);
    }

    #[test]
    fn test_nested_function_not_counted_in_outer_complexity() {
        let source = "def outer():\n    def inner(x):\n        if x:\n            pass\n    return inner\n";
        let facts = extract(source);
        assert_eq!(symbol(&facts, "outer").complexity, 1);
        assert_eq!(symbol(&facts, "outer.inner").complexity, 2);
    }

    #[test]
    fn test_imports() {
        let source = r#"
import os
import numpy as np
from scipy import stats, optimize as opt
from .util import helper
from .. import core
from pkg.mod import *
"#;
        let facts = extract(source);
        let modules: Vec<(&str, Vec<&str>, usize)> = facts
            .imports
            .iter()
            .map(|i| {
                (
                    i.module.as_str(),
                    i.names.iter().map(|n| n.as_str()).collect(),
                    i.line,
                )
            })
            .collect();

        assert_eq!(
            modules,
            vec![
                ("os", vec![], 2),
                ("numpy", vec![], 3),
                ("scipy", vec!["stats", "optimize"], 4),
                (".util", vec!["helper"], 5),
                ("..", vec!["core"], 6),
                ("pkg.mod", vec!["*"], 7),
            ]
        );

        let import_refs: Vec<&str> = facts
            .refs
            .iter()
            .filter(|r| r.kind == RefKind::Import)
            .map(|r| r.target.as_str())
            .collect();
        assert!(import_refs.contains(&"scipy.stats"));
        assert!(import_refs.contains(&"..core"));
    }

    #[test]
    fn test_attribute_refs() {
        let source = "class C:\n    def m(self):\n        self.count = self.limit.value\n        self.items.append(1)\n";
        let facts = extract(source);

        let refs: Vec<(RefKind, &str)> = facts
            .refs
            .iter()
            .map(|r| (r.kind, r.target.as_str()))
            .collect();
        assert!(refs.contains(&(RefKind::Write, "self.count")));
        assert!(refs.contains(&(RefKind::Read, "self.limit.value")));
        assert!(refs.contains(&(RefKind::Read, "self.items")));
        assert!(!refs.iter().any(|(_, t)| *t == "self.limit"));
        assert!(!refs.iter().any(|(_, t)| *t == "self.items.append"));
    }

    #[test]
    fn test_module_variables() {
        let facts = extract("LIMIT = 10\nLIMIT = 20\n\ndef f():\n    local = 1\n");
        let variables: Vec<&str> = facts
            .symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Variable)
            .map(|s| s.qualified_name.as_str())
            .collect();
        assert_eq!(variables, vec!["LIMIT"]);
    }

    #[test]
    fn test_syntax_error() {
        let err = PythonExtractor::new()
            .extract("bad.py", "def f(:\n    pass\n")
            .unwrap_err();
        assert_eq!(err.line, Some(1));
        assert!(err.message.contains("syntax error"));
    }

    #[test]
    fn test_collapse_and_strip() {
        assert_eq!(collapse("(a,\n     b)"), "(a, b)");
        assert_eq!(strip_quotes("r\"\"\" doc \"\"\""), "doc");
        assert_eq!(strip_quotes("'x'"), "x");
    }
}
