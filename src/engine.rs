use crate::address::Addr;
use crate::controller::{DirectoryController, MemoryLink, PreambleOutcome, Transport};
use crate::entry::State;
use crate::error::DirectoryError;
use crate::event::{Command, Event, EventFlags};
use itertools::Itertools;

impl<N: Transport, M: MemoryLink> DirectoryController<N, M> {
    fn entry_size(&self) -> usize {
        (self.registry.target_count() + 1) / 8 + 1
    }

    /// Shared preamble for every request command (spec §4.1): validates the
    /// address, lazily creates the entry, and either stalls the event
    /// behind in-flight work or lets the caller proceed.
    pub(crate) fn request_preamble(&mut self, ev: &Event) -> Result<PreambleOutcome, DirectoryError> {
        if !self.address_map.is_request_address_valid(ev.base_addr) {
            return Err(DirectoryError::AddressOutOfRange { addr: ev.base_addr });
        }

        let cached = self.directory.get_or_create(ev.base_addr).cached;
        if cached {
            self.stats.num_cache_hits += 1;
        }

        let joins_pending = self.mshr.is_hit(ev.base_addr);
        if !self.mshr.insert(ev.base_addr, ev.clone()) {
            self.send_nack(ev);
            return Ok(PreambleOutcome::Nacked);
        }
        if joins_pending {
            self.stats.mshr_hits += 1;
        }

        if !cached {
            if self.mshr.queue_len(ev.base_addr) == 1 {
                self.issue_dir_entry_fetch(ev.base_addr)?;
            }
            return Ok(PreambleOutcome::Stalled);
        }

        if !self.mshr.element_is_hit(ev.base_addr, ev.id) {
            return Ok(PreambleOutcome::Stalled);
        }

        Ok(PreambleOutcome::Proceed)
    }

    fn issue_dir_entry_fetch(&mut self, addr: Addr) -> Result<(), DirectoryError> {
        self.directory.begin_entry_fetch(addr)?;
        let id = self.next_event_id();
        self.dir_entry_miss.insert(id, addr);
        let size = self.entry_size();
        let ev = Event {
            id,
            cmd: Command::GetS,
            base_addr: 0,
            addr: 0,
            size,
            src: self.own_name.clone(),
            dst: "memory".into(),
            delivery_time: 0,
            response_to: None,
            nacked_event: None,
            flags: EventFlags::empty(),
            payload: None,
            granted_state: None,
        };
        self.route_to_memory_collaborator(ev, self.config.access_latency_cycles);
        Ok(())
    }

    fn send_nack(&mut self, ev: &Event) {
        log::debug!("MSHR full, NACKing {:?} for {:#x} from {}", ev.cmd, ev.base_addr, ev.src);
        self.stats.nack_sent += 1;
        let id = self.next_event_id();
        let nack = Event {
            id,
            cmd: Command::Nack,
            base_addr: ev.base_addr,
            addr: ev.addr,
            size: 0,
            src: self.own_name.clone(),
            dst: ev.src.clone(),
            delivery_time: 0,
            response_to: Some(ev.id),
            nacked_event: Some(Box::new(ev.clone())),
            flags: EventFlags::empty(),
            payload: None,
            granted_state: None,
        };
        self.schedule_net(nack, 1);
    }

    fn issue_memory_read(&mut self, addr: Addr) -> Result<(), DirectoryError> {
        self.stats.data_reads += 1;
        let id = self.next_event_id();
        self.mem_reqs.insert(id, addr);
        if let Some(entry) = self.directory.get_mut(addr) {
            entry.last_request = Some(id);
        }
        let ev = Event {
            id,
            cmd: Command::GetS,
            base_addr: addr,
            addr,
            size: self.config.cache_line_size as usize,
            src: self.own_name.clone(),
            dst: "memory".into(),
            delivery_time: 0,
            response_to: None,
            nacked_event: None,
            flags: EventFlags::empty(),
            payload: None,
            granted_state: None,
        };
        self.route_to_memory_collaborator(ev, self.config.access_latency_cycles);
        Ok(())
    }

    fn issue_fetch(&mut self, addr: Addr, owner: crate::registry::NodeId, cmd: Command) -> Result<(), DirectoryError> {
        let owner_name = self
            .registry
            .node_name(owner)
            .ok_or_else(|| DirectoryError::UnknownNode(format!("node#{owner}")))?
            .to_string();
        let id = self.next_event_id();
        if let Some(entry) = self.directory.get_mut(addr) {
            entry.last_request = Some(id);
        }
        match cmd {
            Command::FetchInv => self.stats.fetch_inv_sent += 1,
            Command::FetchInvX => self.stats.fetch_invx_sent += 1,
            _ => {}
        }
        let ev = Event {
            id,
            cmd,
            base_addr: addr,
            addr,
            size: 0,
            src: self.own_name.clone(),
            dst: owner_name,
            delivery_time: 0,
            response_to: None,
            nacked_event: None,
            flags: EventFlags::empty(),
            payload: None,
            granted_state: None,
        };
        self.schedule_net(ev, self.config.access_latency_cycles);
        Ok(())
    }

    /// Broadcasts `Inv` to every sharer but the requester, returning the
    /// number sent (the new `waitingAcks` count).
    fn issue_invalidates(&mut self, addr: Addr, requester: crate::registry::NodeId) -> Result<u32, DirectoryError> {
        // Sorted so invalidates go out in a deterministic node order
        // regardless of the sharer set's hash iteration order; the spec
        // only requires every non-requester sharer be invalidated, but a
        // stable order keeps simulation traces reproducible.
        let sharers = self
            .directory
            .get(addr)
            .ok_or(DirectoryError::MissingEntry { addr })?
            .sharers
            .iter()
            .copied()
            .sorted()
            .collect::<Vec<_>>();

        let mut sent = 0u32;
        for sharer in sharers {
            if sharer == requester {
                continue;
            }
            let Some(name) = self.registry.node_name(sharer).map(str::to_string) else {
                continue;
            };
            self.stats.inv_sent += 1;
            let id = self.next_event_id();
            let ev = Event {
                id,
                cmd: Command::Inv,
                base_addr: addr,
                addr,
                size: 0,
                src: self.own_name.clone(),
                dst: name,
                delivery_time: 0,
                response_to: None,
                nacked_event: None,
                flags: EventFlags::empty(),
                payload: None,
                granted_state: None,
            };
            self.schedule_net(ev, self.config.access_latency_cycles);
            sent += 1;
        }
        if let Some(entry) = self.directory.get_mut(addr) {
            entry.last_request = crate::entry::NO_LAST_REQUEST;
        }
        Ok(sent)
    }

    fn writeback_data(&mut self, addr: Addr, payload: Vec<u8>) -> Result<(), DirectoryError> {
        let expected = self.config.cache_line_size as usize;
        if payload.len() != expected {
            return Err(DirectoryError::BadPayloadSize { addr, got: payload.len(), expected });
        }
        self.stats.data_writes += 1;
        let id = self.next_event_id();
        let ev = Event {
            id,
            cmd: Command::PutM,
            base_addr: addr,
            addr,
            size: payload.len(),
            src: self.own_name.clone(),
            dst: "memory".into(),
            delivery_time: 0,
            response_to: None,
            nacked_event: None,
            flags: EventFlags::empty(),
            payload: Some(payload),
            granted_state: None,
        };
        self.route_to_memory_collaborator(ev, self.config.access_latency_cycles);
        Ok(())
    }

    /// Stub write modeling the directory entry's own spill to the backing
    /// store; the entry object itself still lives in `DirectoryMap`, only
    /// the simulated timing changes.
    pub(crate) fn send_entry_to_memory(&mut self, _spilled_addr: Addr) {
        let size = self.entry_size();
        self.stats.dir_entry_writes += 1;
        let id = self.next_event_id();
        let ev = Event {
            id,
            cmd: Command::PutE,
            base_addr: 0,
            addr: 0,
            size,
            src: self.own_name.clone(),
            dst: "memory".into(),
            delivery_time: 0,
            response_to: None,
            nacked_event: None,
            flags: EventFlags::empty(),
            payload: Some(vec![0u8; size]),
            granted_state: None,
        };
        self.route_to_memory_collaborator(ev, self.config.access_latency_cycles);
    }

    fn grant_requester(
        &mut self,
        addr: Addr,
        requester_ev: &Event,
        cmd: Command,
        payload: Option<Vec<u8>>,
        granted_state: Option<State>,
    ) -> Result<(), DirectoryError> {
        self.mshr.remove_front(addr);
        match cmd {
            Command::GetSResp => self.stats.gets_resp_sent += 1,
            Command::GetXResp => self.stats.getx_resp_sent += 1,
            _ => {}
        }
        let id = self.next_event_id();
        let size = payload.as_ref().map_or(0, Vec::len);
        let resp = Event {
            id,
            cmd,
            base_addr: addr,
            addr,
            size,
            src: self.own_name.clone(),
            dst: requester_ev.src.clone(),
            delivery_time: 0,
            response_to: Some(requester_ev.id),
            nacked_event: None,
            flags: EventFlags::empty(),
            payload,
            granted_state,
        };
        self.schedule_net(resp, self.config.mshr_latency_cycles);
        self.complete_transaction(addr)
    }

    fn complete_transaction(&mut self, addr: Addr) -> Result<(), DirectoryError> {
        self.post_request_processing(addr)?;
        self.replay_waiting_events(addr)
    }

    /// Bumps the processed-request counter and settles the entry's cache
    /// state, without replaying queued MSHR traffic. `handlePutS`'s `S`/
    /// `S_D` branches in the original call exactly this much; only the
    /// terminating branches additionally replay.
    fn post_request_processing(&mut self, addr: Addr) -> Result<(), DirectoryError> {
        self.stats.num_reqs_processed += 1;
        self.finalize_transition(addr)
    }

    fn finalize_transition(&mut self, addr: Addr) -> Result<(), DirectoryError> {
        if let Some(entry) = self.directory.get_mut(addr) {
            entry.set_to_steady_state();
        }
        let spilled = self.directory.update_cache(addr, &self.mshr);
        for spilled_addr in spilled {
            self.send_entry_to_memory(spilled_addr);
        }
        Ok(())
    }

    /// After a terminating transition, every MSHR-queued event for `addr`
    /// reruns through the work queue, oldest first.
    fn replay_waiting_events(&mut self, addr: Addr) -> Result<(), DirectoryError> {
        let drained = self.mshr.remove_all(addr);
        for ev in drained.into_iter().rev() {
            self.work_queue.push_front(ev);
        }
        Ok(())
    }

    pub(crate) fn handle_gets(&mut self, ev: Event) -> Result<(), DirectoryError> {
        self.stats.gets_req_received += 1;
        if !matches!(self.request_preamble(&ev)?, PreambleOutcome::Proceed) {
            return Ok(());
        }
        let addr = ev.base_addr;
        let state = self.directory.get(addr).ok_or(DirectoryError::MissingEntry { addr })?.state;
        log::debug!("GetS {:#x} from {} in state {:?}", addr, ev.src, state);
        match state {
            State::I => {
                self.directory.get_mut(addr).unwrap().state = State::IS;
                self.issue_memory_read(addr)?;
            }
            State::S => {
                self.directory.get_mut(addr).unwrap().state = State::SD;
                self.issue_memory_read(addr)?;
            }
            State::M => {
                let owner = self
                    .directory
                    .get(addr)
                    .unwrap()
                    .owner
                    .ok_or(DirectoryError::MissingEntry { addr })?;
                self.directory.get_mut(addr).unwrap().state = State::MInvX;
                self.issue_fetch(addr, owner, Command::FetchInvX)?;
            }
            other => return Err(DirectoryError::UnexpectedState { cmd: Command::GetS, addr, state: other }),
        }
        Ok(())
    }

    pub(crate) fn handle_getx(&mut self, ev: Event) -> Result<(), DirectoryError> {
        match ev.cmd {
            Command::GetX => self.stats.getx_req_received += 1,
            Command::GetSEx => self.stats.getsex_req_received += 1,
            _ => {}
        }
        if !matches!(self.request_preamble(&ev)?, PreambleOutcome::Proceed) {
            return Ok(());
        }
        let addr = ev.base_addr;
        let requester = self.registry.node_id(&ev.src);
        let state = self.directory.get(addr).ok_or(DirectoryError::MissingEntry { addr })?.state;
        log::debug!("{:?} {:#x} from {} in state {:?}", ev.cmd, addr, ev.src, state);
        match state {
            State::I => {
                self.directory.get_mut(addr).unwrap().state = State::IM;
                self.issue_memory_read(addr)?;
            }
            State::S => {
                let sharers = self.directory.get(addr).unwrap().sharers.clone();
                if sharers.len() == 1 && sharers.contains(&requester) {
                    self.directory.get_mut(addr).unwrap().state = State::SM;
                    self.issue_memory_read(addr)?;
                } else {
                    self.directory.get_mut(addr).unwrap().state = State::SInv;
                    let acks = self.issue_invalidates(addr, requester)?;
                    self.directory.get_mut(addr).unwrap().waiting_acks = acks;
                }
            }
            State::M => {
                let owner = self
                    .directory
                    .get(addr)
                    .unwrap()
                    .owner
                    .ok_or(DirectoryError::MissingEntry { addr })?;
                self.directory.get_mut(addr).unwrap().state = State::MInv;
                self.issue_fetch(addr, owner, Command::FetchInv)?;
            }
            other => return Err(DirectoryError::UnexpectedState { cmd: ev.cmd, addr, state: other }),
        }
        Ok(())
    }

    pub(crate) fn handle_puts(&mut self, ev: Event) -> Result<(), DirectoryError> {
        self.stats.puts_req_received += 1;
        let addr = ev.base_addr;
        let sender = self.registry.node_name_to_id(&ev.src)?;

        let (state, waiting_acks) = {
            let entry = self.directory.get_mut(addr).ok_or(DirectoryError::MissingEntry { addr })?;
            entry.sharers.remove(&sender);
            (entry.state, entry.waiting_acks)
        };

        match state {
            // The original's `case S` settles the entry unconditionally,
            // whether or not this PutS emptied the sharer set.
            State::S => {
                let sharers_empty = self.directory.get(addr).unwrap().sharers.is_empty();
                if sharers_empty {
                    self.directory.get_mut(addr).unwrap().state = State::I;
                }
                self.post_request_processing(addr)?;
            }
            State::SD => {
                self.post_request_processing(addr)?;
            }
            State::SInv => {
                let remaining = waiting_acks.saturating_sub(1);
                let entry = self.directory.get_mut(addr).unwrap();
                entry.waiting_acks = remaining;
                if remaining == 0 {
                    entry.state = State::I;
                    // The terminating ack only replays the queued GetX; the
                    // entry settles once that replay itself completes, so no
                    // post_request_processing here.
                    self.replay_waiting_events(addr)?;
                }
            }
            other => return Err(DirectoryError::UnexpectedState { cmd: Command::PutS, addr, state: other }),
        }
        Ok(())
    }

    pub(crate) fn handle_pute(&mut self, ev: Event) -> Result<(), DirectoryError> {
        self.stats.pute_req_received += 1;
        let addr = ev.base_addr;
        let sender = self.registry.node_name_to_id(&ev.src)?;
        self.validate_owner(addr, sender, &ev.src)?;
        self.directory.get_mut(addr).unwrap().owner = None;

        let state = self.directory.get(addr).unwrap().state;
        match state {
            State::M => {
                self.directory.get_mut(addr).unwrap().state = State::I;
                self.complete_transaction(addr)?;
            }
            State::MInv => {
                self.directory.get_mut(addr).unwrap().state = State::IM;
                self.issue_memory_read(addr)?;
            }
            State::MInvX => {
                self.directory.get_mut(addr).unwrap().state = State::IS;
                self.issue_memory_read(addr)?;
            }
            other => return Err(DirectoryError::UnexpectedState { cmd: Command::PutE, addr, state: other }),
        }
        Ok(())
    }

    pub(crate) fn handle_putm(&mut self, ev: Event) -> Result<(), DirectoryError> {
        self.stats.putm_req_received += 1;
        let addr = ev.base_addr;
        let sender = self.registry.node_name_to_id(&ev.src)?;
        self.validate_owner(addr, sender, &ev.src)?;
        let state = self.directory.get(addr).unwrap().state;

        match state {
            State::M => {
                let expected = self.config.cache_line_size as usize;
                let payload = ev
                    .payload
                    .clone()
                    .ok_or(DirectoryError::BadPayloadSize { addr, got: 0, expected })?;
                self.writeback_data(addr, payload)?;
                {
                    let entry = self.directory.get_mut(addr).unwrap();
                    entry.owner = None;
                    entry.state = State::I;
                }
                self.complete_transaction(addr)?;
            }
            State::MInv => self.handle_fetch_resp(ev)?,
            State::MInvX => self.handle_fetch_xresp(ev)?,
            other => return Err(DirectoryError::UnexpectedState { cmd: Command::PutM, addr, state: other }),
        }
        Ok(())
    }

    pub(crate) fn handle_putx(&mut self, ev: Event) -> Result<(), DirectoryError> {
        self.stats.putx_req_received += 1;
        let addr = ev.base_addr;
        let sender = self.registry.node_name_to_id(&ev.src)?;
        self.validate_owner(addr, sender, &ev.src)?;
        let state = self.directory.get(addr).unwrap().state;

        match state {
            State::M => {
                let expected = self.config.cache_line_size as usize;
                let payload = ev
                    .payload
                    .clone()
                    .ok_or(DirectoryError::BadPayloadSize { addr, got: 0, expected })?;
                self.writeback_data(addr, payload)?;
                {
                    let entry = self.directory.get_mut(addr).unwrap();
                    entry.owner = None;
                    entry.sharers.insert(sender);
                    entry.state = State::S;
                }
                self.complete_transaction(addr)?;
            }
            State::MInvX => self.handle_fetch_xresp(ev)?,
            other => return Err(DirectoryError::UnexpectedState { cmd: Command::PutX, addr, state: other }),
        }
        Ok(())
    }

    pub(crate) fn handle_fetch_resp(&mut self, ev: Event) -> Result<(), DirectoryError> {
        self.stats.fetch_resp_received += 1;
        let addr = ev.base_addr;
        let sender = self.registry.node_name_to_id(&ev.src)?;
        self.validate_owner(addr, sender, &ev.src)?;

        let payload = ev.payload.clone();
        if let Some(p) = payload.clone() {
            self.writeback_data(addr, p)?;
        }
        self.directory.get_mut(addr).unwrap().owner = None;
        let state = self.directory.get(addr).unwrap().state;

        match state {
            State::MInv => {
                let head = self
                    .mshr
                    .lookup_front(addr)
                    .cloned()
                    .ok_or(DirectoryError::MissingEntry { addr })?;
                let requester = self.registry.node_id(&head.src);
                {
                    let entry = self.directory.get_mut(addr).unwrap();
                    entry.owner = Some(requester);
                    entry.state = State::M;
                }
                self.grant_requester(addr, &head, Command::GetXResp, payload, Some(State::M))?;
            }
            State::MInvX => self.resolve_invx(addr, payload)?,
            other => return Err(DirectoryError::UnexpectedState { cmd: Command::FetchResp, addr, state: other }),
        }
        Ok(())
    }

    pub(crate) fn handle_fetch_xresp(&mut self, ev: Event) -> Result<(), DirectoryError> {
        self.stats.fetch_respx_received += 1;
        let addr = ev.base_addr;
        let sender = self.registry.node_name_to_id(&ev.src)?;
        self.validate_owner(addr, sender, &ev.src)?;

        let payload = ev.payload.clone();
        if let Some(p) = payload.clone() {
            self.writeback_data(addr, p)?;
        }
        self.directory.get_mut(addr).unwrap().owner = None;
        let state = self.directory.get(addr).unwrap().state;

        match state {
            State::MInvX => self.resolve_invx(addr, payload)?,
            other => return Err(DirectoryError::UnexpectedState { cmd: Command::FetchXResp, addr, state: other }),
        }
        Ok(())
    }

    /// Shared M_InvX resolution used by both `FetchResp` and `FetchXResp`:
    /// MESI with no remaining sharers grants exclusive and sets ownership,
    /// otherwise the requester is added as a plain sharer.
    fn resolve_invx(&mut self, addr: Addr, payload: Option<Vec<u8>>) -> Result<(), DirectoryError> {
        let head = self
            .mshr
            .lookup_front(addr)
            .cloned()
            .ok_or(DirectoryError::MissingEntry { addr })?;
        let requester = self.registry.node_id(&head.src);
        let mesi = self.config.coherence_protocol.is_mesi();
        let sharers_empty = self.directory.get(addr).unwrap().sharers.is_empty();

        let granted = if mesi && sharers_empty {
            let entry = self.directory.get_mut(addr).unwrap();
            entry.owner = Some(requester);
            entry.state = State::M;
            State::M
        } else {
            let entry = self.directory.get_mut(addr).unwrap();
            entry.sharers.insert(requester);
            entry.state = State::S;
            State::S
        };
        // M_InvX is only ever entered from a GetS (see handle_gets), so the
        // response always mirrors GetS -> GetSResp; the granted state (S vs
        // M, MESI exclusive) rides out-of-band in `granted_state`.
        self.grant_requester(addr, &head, Command::GetSResp, payload, Some(granted))
    }

    pub(crate) fn handle_nack(&mut self, ev: Event) -> Result<(), DirectoryError> {
        self.stats.nack_received += 1;
        let Some(nacked) = ev.nacked_event else {
            return Ok(());
        };
        let addr = ev.base_addr;
        let last_request = self.directory.get(addr).and_then(|e| e.last_request);
        let should_retry = last_request == Some(nacked.id) || nacked.cmd == Command::Inv;
        if should_retry {
            let mut retry = *nacked;
            retry.delivery_time = 0;
            self.schedule_net(retry, self.config.mshr_latency_cycles);
        }
        Ok(())
    }

    pub(crate) fn handle_data_response(&mut self, addr: Addr, ev: Event) -> Result<(), DirectoryError> {
        let head = self
            .mshr
            .lookup_front(addr)
            .cloned()
            .ok_or(DirectoryError::MissingEntry { addr })?;
        let requester = self.registry.node_id(&head.src);
        let state = self.directory.get(addr).ok_or(DirectoryError::MissingEntry { addr })?.state;
        let mesi = self.config.coherence_protocol.is_mesi();
        let payload = ev.payload.clone();

        match state {
            State::IS | State::SD => {
                let sharers_empty = self.directory.get(addr).unwrap().sharers.is_empty();
                // IS/S_D is only ever entered from a GetS (see handle_gets),
                // so the response always mirrors GetS -> GetSResp regardless
                // of which state ends up granted.
                if mesi && sharers_empty {
                    {
                        let entry = self.directory.get_mut(addr).unwrap();
                        entry.owner = Some(requester);
                        entry.state = State::M;
                    }
                    self.grant_requester(addr, &head, Command::GetSResp, payload, Some(State::M))?;
                } else {
                    {
                        let entry = self.directory.get_mut(addr).unwrap();
                        entry.sharers.insert(requester);
                        entry.state = State::S;
                    }
                    self.grant_requester(addr, &head, Command::GetSResp, payload, Some(State::S))?;
                }
            }
            State::IM | State::SM => {
                {
                    let entry = self.directory.get_mut(addr).unwrap();
                    entry.sharers.clear();
                    entry.owner = Some(requester);
                    entry.state = State::M;
                }
                self.grant_requester(addr, &head, Command::GetXResp, payload, Some(State::M))?;
            }
            other => return Err(DirectoryError::UnexpectedState { cmd: ev.cmd, addr, state: other }),
        }
        Ok(())
    }

    pub(crate) fn handle_dir_entry_memory_response(&mut self, addr: Addr, _ev: Event) -> Result<(), DirectoryError> {
        self.stats.dir_entry_reads += 1;
        self.directory.complete_entry_fetch(addr)?;
        if let Some(head) = self.mshr.lookup_front(addr).cloned() {
            self.process_packet(head)?;
        }
        Ok(())
    }

    fn validate_owner(&mut self, addr: Addr, sender: crate::registry::NodeId, src: &str) -> Result<(), DirectoryError> {
        let owner = self.directory.get(addr).ok_or(DirectoryError::MissingEntry { addr })?.owner;
        if owner != Some(sender) {
            return Err(DirectoryError::NotOwner {
                addr,
                from: src.to_string(),
                owner: owner.and_then(|o| self.registry.node_name(o).map(str::to_string)),
            });
        }
        Ok(())
    }
}
