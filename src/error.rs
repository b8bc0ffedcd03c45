use crate::event::{Command, EventId};
use crate::address::Addr;

/// Fatal protocol violations and configuration errors.
///
/// Every variant here corresponds to a condition the original directory
/// controller treats as a programmer/configuration bug rather than a
/// transient network condition: these abort the run instead of being
/// retried. Backpressure (MSHR full) is never represented here; it is
/// signaled to the peer with a NACK event instead.
#[derive(thiserror::Error, Debug)]
pub enum DirectoryError {
    #[error("address {addr:#x} is outside the controller's address range")]
    AddressOutOfRange { addr: Addr },

    #[error("received {cmd:?} for {addr:#x} while entry was in unexpected state {state:?}")]
    UnexpectedState { cmd: Command, addr: Addr, state: crate::entry::State },

    #[error("writeback for {addr:#x} from {from} but owner is {owner:?}")]
    NotOwner { addr: Addr, from: String, owner: Option<String> },

    #[error("no directory entry for {addr:#x} where one was required")]
    MissingEntry { addr: Addr },

    #[error("payload size {got} does not match cache line size {expected} for {addr:#x}")]
    BadPayloadSize { addr: Addr, got: usize, expected: usize },

    #[error("dir-entry fetch restore saw state {state:?}, which is not one of I_d/S_d/M_d")]
    InvalidDirEntryFetchState { state: crate::entry::State },

    #[error("unrecognized command {cmd:?} reached the protocol engine")]
    UnrecognizedCommand { cmd: Command },

    #[error("unknown peer node name {0:?}")]
    UnknownNode(String),

    #[error("noncacheable response {0:?} had no matching outstanding request")]
    UnexpectedNoncacheableResponse(EventId),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration validation failures, surfaced before the controller ever
/// processes an event.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("interleave_step ({step}) must be >= interleave_size ({size})")]
    InterleaveStepTooSmall { step: u64, size: u64 },

    #[error("addr_range_end ({end:#x}) must be greater than addr_range_start ({start:#x})")]
    InvalidAddressRange { start: Addr, end: Addr },

    #[error("net_memory_name is required when direct_mem_link is false")]
    MissingNetMemoryName,

    #[error("cache_line_size must be a nonzero power of two, got {0}")]
    InvalidCacheLineSize(u64),
}
