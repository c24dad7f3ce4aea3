pub mod config;
pub mod crawl;
pub mod error;
pub mod ledger;
pub mod mediawiki;
pub mod mirror;
pub mod platform;
pub mod publish;
pub mod purge;
pub mod redirect;
pub mod resolve;
pub mod rewrite;
pub mod runtime;
pub mod site;
pub mod transform;
pub mod upload;
