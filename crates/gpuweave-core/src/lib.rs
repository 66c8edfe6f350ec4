pub mod config;
pub mod error;
pub mod handle_table;

pub use config::GpuweaveConfig;
pub use error::CoreError;
pub use handle_table::HandleTable;
