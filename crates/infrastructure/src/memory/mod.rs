//! 嵌入式内存后端

pub mod master_store;
pub mod transport;

pub use master_store::InMemoryMasterStore;
pub use transport::InMemoryTransport;
