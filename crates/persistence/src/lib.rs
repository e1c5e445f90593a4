pub mod compressor;
pub mod dao;
pub mod records;
pub mod schema;
pub mod session_manager;

pub use compressor::Compressor;
pub use dao::Dao;
pub use session_manager::{PartialIdLookup, SessionManager};
