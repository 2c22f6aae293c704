// Read-side queries over the index

pub mod engine;
pub mod impact;

pub use engine::{
    FileSummary, ImportGraph, QueryEngine, SearchFilters, SearchHit, SymbolContext,
};
pub use impact::{get_impact, AffectedSymbol, ImpactReport};
