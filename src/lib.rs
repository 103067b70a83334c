//! Evolves trading strategy programs.
//!
//! A language model proposes patches to a strategy's source, the patch is
//! applied to named evolve blocks (or replaces the whole program), an
//! external evaluator scores the child, and every scored variant is kept in
//! a SQLite archive that ranks them into a hall of fame.

pub mod archive;
pub mod blocks;
pub mod config;
pub mod error;
pub mod external;
pub mod logging;
pub mod orchestrator;
pub mod patch;
pub mod selection;
