// Core modules implementing the store, chunked reads, persistence, and errors.
pub mod error;
pub mod export;
pub mod reader;
pub mod record;
pub mod store;
pub mod table;
pub mod writer;
