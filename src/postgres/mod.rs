// ABOUTME: PostgreSQL connectivity shared by the warehouse, the index store, and sources
// ABOUTME: Re-exports connection helpers and table privilege utilities

pub mod connection;
pub mod privileges;

pub use connection::{connect, connect_with_retry};
pub use privileges::{check_table_owner, parse_table_acl, replay_grants, TableGrant};
