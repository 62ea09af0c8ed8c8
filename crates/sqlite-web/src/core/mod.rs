pub mod cancel;
pub mod connection;
pub mod export;
pub mod ident;
pub mod import;
pub mod info;
pub mod limits;
pub mod query;
pub mod readonly;
pub mod schema;
pub mod sql;
pub mod types;
pub mod value;
