use crate::address::Addr;
use crate::entry::State;

/// Unique id pair identifying one event, stable across NACK/retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    pub epoch: u64,
    pub seq: u32,
}

/// The full command set this controller exchanges with peer caches and
/// memory. Requests, directory-initiated messages, cache-side responses,
/// and the memory-facing subset all share one tag space, matching how the
/// original's `Command` enum is used across every direction of traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // requests from caches
    GetS,
    GetX,
    GetSEx,
    PutS,
    PutE,
    PutM,
    PutX,
    // directory -> cache
    Inv,
    FetchInv,
    FetchInvX,
    GetSResp,
    GetXResp,
    Nack,
    // cache -> directory responses
    FetchResp,
    FetchXResp,
}

bitflags::bitflags! {
    /// Out-of-band event flags. `NONCACHEABLE` routes an event around the
    /// coherence protocol entirely (see `controller::handle_noncacheable`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u8 {
        const NONCACHEABLE = 0b0000_0001;
    }
}

/// One message on the wire between this controller and a peer cache or the
/// backing memory. A shared header plus an optional payload is the
/// idiomatic rendition of the tagged-variant-over-command-set design note:
/// every command uses the same struct, unused fields stay `None`/empty.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub cmd: Command,
    pub base_addr: Addr,
    pub addr: Addr,
    pub size: usize,
    pub src: String,
    pub dst: String,
    pub delivery_time: u64,
    pub response_to: Option<EventId>,
    pub nacked_event: Option<Box<Event>>,
    pub flags: EventFlags,
    /// Data payload, present only for data-carrying commands; must be
    /// exactly `cache_line_size` bytes when present.
    pub payload: Option<Vec<u8>>,
    /// Coherence state granted to the requester on a `GetSResp`/`GetXResp`,
    /// carried out-of-band from the response's `Cmd` so a `GetS` can still
    /// be answered with `GetSResp` while granting `State::M` (MESI
    /// exclusive) instead of retagging the response as a `GetXResp` it was
    /// never asked for.
    pub granted_state: Option<State>,
}

impl Event {
    pub fn is_noncacheable(&self) -> bool {
        self.flags.contains(EventFlags::NONCACHEABLE)
    }

    pub fn is_dirty_writeback(&self) -> bool {
        matches!(self.cmd, Command::PutM | Command::FetchResp | Command::FetchXResp) && self.payload.is_some()
    }
}
