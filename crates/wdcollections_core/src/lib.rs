pub mod cache;
pub mod collection;
pub mod config;
pub mod entity;
pub mod error;
pub mod geo;
pub mod harvest;
pub mod lookup;
pub mod query;
pub mod reconcile;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod wikibase;
pub mod wikipages;
pub mod wikitext;
pub mod writeback;

#[cfg(test)]
mod testing;
