use crate::address::{Addr, AddressMap};
use crate::config::Config;
use crate::directory::DirectoryMap;
use crate::error::DirectoryError;
use crate::event::{Command, Event, EventId};
use crate::io::IoGateway;
use crate::mshr::Mshr;
use crate::registry::NodeRegistry;
use crate::stats::Stats;
use std::collections::{HashMap, VecDeque};

/// Outbound delivery to peer caches. A simulator harness supplies the
/// concrete implementation; this crate only ever calls `send`.
pub trait Transport {
    fn send(&mut self, ev: Event);
}

/// Outbound delivery to the backing memory, used in place of `Transport`
/// when `direct_mem_link` is set.
pub trait MemoryLink {
    fn send(&mut self, ev: Event);
}

/// The result of the shared request preamble (spec §4.1): whether the
/// caller should proceed with its state-machine transition now, or whether
/// the event has been parked and the caller has nothing left to do.
pub(crate) enum PreambleOutcome {
    Proceed,
    Stalled,
    Nacked,
}

/// The directory coherence controller for one contiguous address range.
///
/// Two entry points drive it: [`DirectoryController::on_event`] for inbound
/// traffic and [`DirectoryController::tick`] once per cycle. Neither blocks;
/// a request that cannot complete synchronously is parked in the MSHR and
/// resumed when its response arrives.
pub struct DirectoryController<N, M> {
    pub(crate) config: Config,
    pub(crate) address_map: AddressMap,
    pub(crate) registry: NodeRegistry,
    pub(crate) directory: DirectoryMap,
    pub(crate) mshr: Mshr,
    pub(crate) stats: Stats,

    pub(crate) net: N,
    pub(crate) mem: M,

    pub(crate) timestamp: u64,
    pub(crate) next_seq: u32,

    pub(crate) work_queue: VecDeque<Event>,
    io: IoGateway,

    /// Outstanding data reads issued to memory, id -> base address.
    pub(crate) mem_reqs: HashMap<EventId, Addr>,
    /// Outstanding directory-entry fetches issued to memory, id -> base address.
    pub(crate) dir_entry_miss: HashMap<EventId, Addr>,
    /// Noncacheable passthrough bookkeeping: id -> (base_addr, addr), both global.
    pub(crate) noncache_reqs: HashMap<EventId, (Addr, Addr)>,

    pub(crate) own_name: String,
}

impl<N: Transport, M: MemoryLink> DirectoryController<N, M> {
    pub fn new(own_name: impl Into<String>, config: Config, net: N, mem: M) -> Result<Self, DirectoryError> {
        config.validate()?;
        let address_map = AddressMap::new(&config);
        let entry_cache_size = config.entry_cache_size;
        let mshr_capacity = config.mshr_num_entries;
        Ok(Self {
            config,
            address_map,
            registry: NodeRegistry::new(),
            directory: DirectoryMap::new(entry_cache_size),
            mshr: Mshr::new(mshr_capacity),
            stats: Stats::new(),
            net,
            mem,
            timestamp: 0,
            next_seq: 0,
            work_queue: VecDeque::new(),
            io: IoGateway::new(),
            mem_reqs: HashMap::new(),
            dir_entry_miss: HashMap::new(),
            noncache_reqs: HashMap::new(),
            own_name: own_name.into(),
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub(crate) fn next_event_id(&mut self) -> EventId {
        let id = EventId {
            epoch: self.timestamp,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        id
    }

    /// Schedule `ev` for delivery to the network at `timestamp + latency`.
    pub(crate) fn schedule_net(&mut self, mut ev: Event, latency: u64) {
        let deliver_at = self.timestamp + latency;
        ev.delivery_time = deliver_at;
        self.io.send_net(deliver_at, ev);
    }

    /// Schedule `ev` for delivery to memory at `timestamp + latency`.
    pub(crate) fn schedule_mem(&mut self, mut ev: Event, latency: u64) {
        let deliver_at = self.timestamp + latency;
        ev.delivery_time = deliver_at;
        self.io.send_mem(deliver_at, ev);
    }

    pub(crate) fn route_to_memory_collaborator(&mut self, ev: Event, latency: u64) {
        if self.config.direct_mem_link {
            self.schedule_mem(ev, latency);
        } else {
            self.schedule_net(ev, latency);
        }
    }

    /// Inbound entry point: called by the transport whenever an event
    /// arrives. Noncacheable traffic and memory responses are handled
    /// inline; everything else is queued for the next `tick`.
    pub fn on_event(&mut self, ev: Event) -> Result<(), DirectoryError> {
        log::trace!("on_event: {:?} {:#x} from {}", ev.cmd, ev.base_addr, ev.src);
        if ev.is_noncacheable() {
            return self.handle_noncacheable(ev);
        }
        if matches!(ev.cmd, Command::GetSResp | Command::GetXResp) {
            return self.handle_memory_response(ev);
        }
        self.work_queue.push_back(ev);
        Ok(())
    }

    /// Cycle entry point: drains matured scheduled sends, then drains the
    /// entire work queue through the protocol engine.
    pub fn tick(&mut self, cycle: u64) -> Result<(), DirectoryError> {
        self.timestamp = cycle;
        log::trace!("tick {cycle}: {} packets queued", self.work_queue.len());

        let (ready_net, ready_mem) = self.io.drain_ready(self.timestamp);
        for ev in ready_net {
            self.net.send(ev);
        }
        for ev in ready_mem {
            self.mem.send(ev);
        }

        while let Some(ev) = self.work_queue.pop_front() {
            self.process_packet(ev)?;
        }
        Ok(())
    }

    pub(crate) fn process_packet(&mut self, ev: Event) -> Result<(), DirectoryError> {
        match ev.cmd {
            Command::GetS => self.handle_gets(ev),
            Command::GetX | Command::GetSEx => self.handle_getx(ev),
            Command::PutS => self.handle_puts(ev),
            Command::PutE => self.handle_pute(ev),
            Command::PutM => self.handle_putm(ev),
            Command::PutX => self.handle_putx(ev),
            Command::FetchResp => self.handle_fetch_resp(ev),
            Command::FetchXResp => self.handle_fetch_xresp(ev),
            Command::Nack => self.handle_nack(ev),
            other => Err(DirectoryError::UnrecognizedCommand { cmd: other }),
        }
    }

    fn handle_memory_response(&mut self, ev: Event) -> Result<(), DirectoryError> {
        let response_to = ev.response_to;
        if let Some(addr) = response_to.and_then(|id| self.mem_reqs.remove(&id)) {
            return self.handle_data_response(addr, ev);
        }
        if let Some(addr) = response_to.and_then(|id| self.dir_entry_miss.remove(&id)) {
            return self.handle_dir_entry_memory_response(addr, ev);
        }
        log::warn!("memory response {:?} matched neither mem_reqs nor dir_entry_miss", response_to);
        Err(DirectoryError::MissingEntry {
            addr: ev.base_addr,
        })
    }

    /// Noncacheable traffic bypasses the coherence protocol entirely: the
    /// request is recorded in a side-map, forwarded to memory with local
    /// addresses, and the response's global addresses are restored before
    /// forwarding back to the requester.
    fn handle_noncacheable(&mut self, ev: Event) -> Result<(), DirectoryError> {
        if matches!(ev.cmd, Command::GetSResp | Command::GetXResp) {
            let Some(id) = ev.response_to else {
                return Err(DirectoryError::UnexpectedNoncacheableResponse(ev.id));
            };
            let Some((base_addr, addr)) = self.noncache_reqs.remove(&id) else {
                return Err(DirectoryError::UnexpectedNoncacheableResponse(id));
            };
            let mut resp = ev;
            resp.base_addr = base_addr;
            resp.addr = addr;
            let dst = resp.dst.clone();
            resp.dst = resp.src.clone();
            resp.src = dst;
            self.schedule_net(resp, self.config.access_latency_cycles);
            return Ok(());
        }

        self.noncache_reqs.insert(ev.id, (ev.base_addr, ev.addr));
        let mut fwd = ev;
        fwd.base_addr = self.address_map.to_local(fwd.base_addr);
        fwd.addr = self.address_map.to_local(fwd.addr);
        self.route_to_memory_collaborator(fwd, self.config.access_latency_cycles);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::entry::State;
    use crate::event::EventFlags;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<Event>,
    }

    impl Transport for Recorder {
        fn send(&mut self, ev: Event) {
            self.sent.push(ev);
        }
    }

    impl MemoryLink for Recorder {
        fn send(&mut self, ev: Event) {
            self.sent.push(ev);
        }
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn controller(cfg: Config) -> DirectoryController<Recorder, Recorder> {
        DirectoryController::new("dir0", cfg, Recorder::default(), Recorder::default()).unwrap()
    }

    fn req(seq: u32, cmd: Command, addr: Addr, src: &str) -> Event {
        Event {
            id: EventId { epoch: 0, seq },
            cmd,
            base_addr: addr,
            addr,
            size: 64,
            src: src.to_string(),
            dst: "dir0".to_string(),
            delivery_time: 0,
            response_to: None,
            nacked_event: None,
            flags: EventFlags::empty(),
            payload: None,
            granted_state: None,
        }
    }

    fn memory_data_response(mem_req: &Event) -> Event {
        Event {
            id: EventId { epoch: 0, seq: 999 },
            cmd: Command::GetSResp,
            base_addr: mem_req.base_addr,
            addr: mem_req.addr,
            size: mem_req.size,
            src: "memory".into(),
            dst: "dir0".into(),
            delivery_time: 0,
            response_to: Some(mem_req.id),
            nacked_event: None,
            flags: EventFlags::empty(),
            payload: Some(vec![0u8; mem_req.size]),
            granted_state: None,
        }
    }

    #[test]
    fn single_reader_load_round_trip() {
        init_logging();
        let mut dc = controller(Config::default());
        dc.on_event(req(1, Command::GetS, 0x40, "cache0")).unwrap();
        dc.tick(1).unwrap();
        dc.tick(2).unwrap();
        assert_eq!(dc.mem.sent.len(), 1);
        assert_eq!(dc.mem.sent[0].cmd, Command::GetS);

        let resp = memory_data_response(&dc.mem.sent[0]);
        dc.on_event(resp).unwrap();
        dc.tick(3).unwrap();

        assert_eq!(dc.net.sent.len(), 1);
        assert_eq!(dc.net.sent[0].dst, "cache0");
        assert_eq!(dc.directory.get(0x40).unwrap().state, State::M);
    }

    #[test]
    fn write_then_evict_round_trip() {
        let mut dc = controller(Config::default());
        dc.on_event(req(1, Command::GetX, 0x40, "cache0")).unwrap();
        dc.tick(1).unwrap();
        dc.tick(2).unwrap();
        let resp = memory_data_response(&dc.mem.sent[0]);
        dc.on_event(resp).unwrap();
        dc.tick(3).unwrap();
        assert_eq!(dc.directory.get(0x40).unwrap().state, State::M);

        let mut putm = req(2, Command::PutM, 0x40, "cache0");
        putm.payload = Some(vec![0u8; 64]);
        dc.on_event(putm).unwrap();
        dc.tick(4).unwrap();

        assert!(!dc.directory.contains(0x40));
    }

    #[test]
    fn mshr_full_nacks_second_request() {
        let mut cfg = Config::default();
        cfg.mshr_num_entries = Some(1);
        let mut dc = controller(cfg);

        dc.on_event(req(1, Command::GetS, 0x40, "cache0")).unwrap();
        dc.on_event(req(2, Command::GetS, 0x80, "cache1")).unwrap();
        dc.tick(1).unwrap();
        dc.tick(2).unwrap();

        let nacks: Vec<_> = dc.net.sent.iter().filter(|e| e.cmd == Command::Nack).collect();
        assert_eq!(nacks.len(), 1);
        assert_eq!(nacks[0].dst, "cache1");
    }

    #[test]
    fn single_slot_entry_cache_spills_on_second_address() {
        let mut cfg = Config::default();
        cfg.entry_cache_size = 1;
        let mut dc = controller(cfg);

        dc.on_event(req(1, Command::GetS, 0x40, "cache0")).unwrap();
        dc.tick(1).unwrap();
        dc.tick(2).unwrap();
        let resp = memory_data_response(&dc.mem.sent[0]);
        dc.on_event(resp).unwrap();
        dc.tick(3).unwrap();
        assert!(dc.directory.get(0x40).unwrap().cached);

        dc.mem.sent.clear();
        dc.on_event(req(2, Command::GetS, 0x2000, "cache1")).unwrap();
        dc.tick(4).unwrap();
        dc.tick(5).unwrap();
        let mem_req2 = dc.mem.sent.iter().find(|e| e.cmd == Command::GetS).unwrap().clone();
        dc.on_event(memory_data_response(&mem_req2)).unwrap();
        dc.tick(6).unwrap();

        assert!(!dc.directory.get(0x40).unwrap().cached);
        assert!(dc.mem.sent.iter().any(|e| e.cmd == Command::PutE));
    }
}
