// Index storage, schema and the extraction contract

pub mod db;
pub mod records;
pub mod schema;

use serde::{Deserialize, Serialize};

use crate::error::ExtractionError;

/// Symbol kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Method,
    Class,
    Interface,
    Enum,
    Module,
    Variable,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Function => "function",
            SymbolKind::Method => "method",
            SymbolKind::Class => "class",
            SymbolKind::Interface => "interface",
            SymbolKind::Enum => "enum",
            SymbolKind::Module => "module",
            SymbolKind::Variable => "variable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(SymbolKind::Function),
            "method" => Some(SymbolKind::Method),
            "class" => Some(SymbolKind::Class),
            "interface" => Some(SymbolKind::Interface),
            "enum" => Some(SymbolKind::Enum),
            "module" => Some(SymbolKind::Module),
            "variable" => Some(SymbolKind::Variable),
            _ => None,
        }
    }

    /// Kinds a call expression can land on
    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            SymbolKind::Function | SymbolKind::Method | SymbolKind::Class
        )
    }
}

/// Reference kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Read,
    Write,
    Import,
    TypeRef,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Read => "read",
            RefKind::Write => "write",
            RefKind::Import => "import",
            RefKind::TypeRef => "type_ref",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(RefKind::Read),
            "write" => Some(RefKind::Write),
            "import" => Some(RefKind::Import),
            "type_ref" => Some(RefKind::TypeRef),
            _ => None,
        }
    }
}

/// A symbol as produced by an extractor, before it has a stored identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedSymbol {
    pub kind: SymbolKind,
    pub name: String,
    pub qualified_name: String,
    /// Index of the enclosing symbol in `ExtractedFacts::symbols`
    pub parent: Option<usize>,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub complexity: u32,
}

/// A call site; `caller` indexes into `ExtractedFacts::symbols`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedCall {
    pub caller: Option<usize>,
    pub callee_expr: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRef {
    pub symbol: Option<usize>,
    pub kind: RefKind,
    pub target: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedImport {
    pub module: String,
    pub names: Vec<String>,
    pub line: usize,
}

/// Everything an extractor knows about one file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFacts {
    pub symbols: Vec<ExtractedSymbol>,
    pub calls: Vec<ExtractedCall>,
    pub refs: Vec<ExtractedRef>,
    pub imports: Vec<ExtractedImport>,
}

/// Language-specific producer of structural facts from source text
pub trait Extractor: Send + Sync {
    fn language(&self) -> &'static str;

    /// Bumped whenever the facts produced for the same input change
    fn version(&self) -> u32;

    fn can_extract(&self, path: &str) -> bool;

    fn extract(&self, path: &str, content: &str) -> Result<ExtractedFacts, ExtractionError>;
}

/// Set of extractors, looked up by file path
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn empty() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        self.extractors.push(extractor);
    }

    pub fn for_path(&self, path: &str) -> Option<&dyn Extractor> {
        self.extractors
            .iter()
            .find(|e| e.can_extract(path))
            .map(|e| e.as_ref())
    }

    pub fn for_language(&self, language: &str) -> Option<&dyn Extractor> {
        self.extractors
            .iter()
            .find(|e| e.language() == language)
            .map(|e| e.as_ref())
    }

    /// Extract with the adapter registered for `language`
    pub fn extract(
        &self,
        path: &str,
        content: &str,
        language: &str,
    ) -> Result<ExtractedFacts, ExtractionError> {
        let extractor = self
            .for_language(language)
            .ok_or_else(|| ExtractionError::new(format!("no extractor for language {}", language)))?;
        extractor.extract(path, content)
    }

    /// Combined version tag stored in the index, e.g. `python:1`
    pub fn version_tag(&self) -> String {
        let mut parts: Vec<String> = self
            .extractors
            .iter()
            .map(|e| format!("{}:{}", e.language(), e.version()))
            .collect();
        parts.sort();
        parts.join(",")
    }

    pub fn languages(&self) -> Vec<&'static str> {
        self.extractors.iter().map(|e| e.language()).collect()
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(crate::indexer::parser::PythonExtractor::new()));
        registry
    }
}

/// One file handed to the updater by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Project-relative path with `/` separators
    pub path: String,
    pub content: String,
    /// Set when the file exists but could not be read; its stored facts are kept
    pub read_error: Option<String>,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into().replace('\\', "/"),
            content: content.into(),
            read_error: None,
        }
    }

    pub fn unreadable(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            read_error: Some(message.into()),
            ..Self::new(path, String::new())
        }
    }
}

/// Content hash stored per file
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_string()
}

/// Dotted module name for a project-relative path.
///
/// `pkg/util.py` -> `pkg.util`, `pkg/__init__.py` -> `pkg`; a leading `src/`
/// is dropped.
pub fn module_name(path: &str) -> String {
    let path = path.strip_prefix("./").unwrap_or(path);
    let path = path.strip_prefix("src/").unwrap_or(path);
    let stem = match path.rfind('.') {
        Some(dot) if !path[dot..].contains('/') => &path[..dot],
        _ => path,
    };
    let mut module = stem.replace('/', ".");
    if module == "__init__" {
        module.clear();
    } else if let Some(pkg) = module.strip_suffix(".__init__") {
        module = pkg.to_string();
    }
    module
}

/// Directory part of a project-relative path ("" at the root)
pub fn package_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(slash) => &path[..slash],
        None => "",
    }
}
