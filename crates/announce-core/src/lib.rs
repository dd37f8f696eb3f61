pub mod announcement;
pub mod backend;
pub mod config;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod gemini;
mod http;
pub mod ingest;
pub mod merge;
pub mod openai;
pub mod paginate;
pub mod record;

#[cfg(test)]
mod testing;
