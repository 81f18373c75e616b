pub mod protocols;
pub mod engine;
pub mod multi_engine;
pub mod password_queue;
pub mod targets;
pub mod wordlist;
pub mod resume;
pub mod tracker;
pub mod stats;
pub mod diag;
