use thiserror::Error as ThisError;
use vm_memory::VolatileMemoryError;
use vm_memory::mmap::MmapRegionError;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("guest mapping failed: {0}")]
    Mmap(#[from] MmapRegionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("elf parse error: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("guest memory access error: {0}")]
    GuestAccess(#[from] VolatileMemoryError),

    #[error("kvm error: {0}")]
    Kvm(#[from] kvm_ioctls::Error),

    #[error("guest triple fault")]
    TripleFault,
}

pub type Result<T> = std::result::Result<T, Error>;
