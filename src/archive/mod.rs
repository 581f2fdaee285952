pub mod aws_sigv4;
pub mod bus;
pub mod canonical_json;
pub mod config;
pub mod contracts;
pub mod governance;
pub mod ledger;
pub mod observability;
pub mod reconciliation;
pub mod store;
pub mod util;
pub mod worker;
