//! Activity logging: JSONL writer plus a non-blocking logger thread.

pub mod activity;
pub mod jsonl;
