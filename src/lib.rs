//! Prepares a previously preserved dataset for its next release: keeps a
//! verified local cache of serialized head bags, works out the latest known
//! version of a dataset, and rebuilds an editable metadata bag from the
//! latest head bag or, failing that, the published NERDm record.

pub mod bag;
pub mod bagname;
pub mod cache;
pub mod config;
pub mod distrib;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod nerdm;
pub mod output;
pub mod prepper;
pub mod resolver;
pub mod rmm;
pub mod transform;
