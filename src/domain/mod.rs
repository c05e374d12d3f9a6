//! Canonical entities shared by every engine. Cross-entity back-references
//! (User<->Account<->Portfolio<->Holding) are store queries, not in-memory
//! object graphs — ownership is strictly one-way per §9.

pub mod entities;

pub use entities::*;
