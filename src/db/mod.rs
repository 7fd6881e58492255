pub mod cache;
pub mod kv;
pub mod pool;
pub mod schema;
pub mod tokens;
