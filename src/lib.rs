// codelens: persistent structural index of a codebase
//
// The library owns the store and every operation on it. The `codelens`
// binary is a thin command-line layer over `CodeIndex`.

pub mod config;
pub mod conventions;
pub mod engine;
pub mod error;
pub mod index;
pub mod indexer;
pub mod query;
pub mod rules;
pub mod session;

pub use config::Config;
pub use engine::CodeIndex;
pub use error::{Error, ExtractionError, QueryError, Result};
pub use index::{ExtractorRegistry, SourceFile, SymbolKind};
pub use indexer::{IndexMode, IndexReport};
