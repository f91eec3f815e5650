#![allow(unused_doc_comments)]

#[macro_use(debug, trace)]
extern crate tracing;

pub mod content;
pub mod dfa;
pub mod engine;
pub mod eval;
pub mod filter;
pub mod intern;
pub mod latency;
pub mod options;
pub mod packet;
pub mod pattern;
pub mod rules;
pub mod tree;
pub mod trie;
