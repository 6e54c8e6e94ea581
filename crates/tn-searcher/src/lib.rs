//! # tn-searcher
//!
//! The searcher side of the operation protocol: the [`Searcher`] trait the
//! experiment controller drives, the parameter sampling strategies, and
//! [`SearchRunner`], the stock searcher built from an experiment config.

mod runner;
mod search;
mod searcher;

pub use runner::SearchRunner;
pub use search::{GridSearch, RandomSearch, SearchStrategy};
pub use searcher::{Searcher, SearcherResult};
