pub mod manager;
pub mod reassembly;
pub mod types;

pub use manager::FileTransferManager;
pub use reassembly::ReorderBuffer;
pub use types::{FileTransfer, TransferInput, next_state};
