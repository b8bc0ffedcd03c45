/// Counters reported at simulation finish. Field names mirror the
/// original's statistics registrations so a harness translating between
/// the two can map them one-to-one.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub num_reqs_processed: u64,
    pub gets_req_received: u64,
    pub getx_req_received: u64,
    pub getsex_req_received: u64,
    pub puts_req_received: u64,
    pub pute_req_received: u64,
    pub putm_req_received: u64,
    pub putx_req_received: u64,
    pub nack_received: u64,
    pub fetch_resp_received: u64,
    pub fetch_respx_received: u64,

    pub inv_sent: u64,
    pub fetch_inv_sent: u64,
    pub fetch_invx_sent: u64,
    pub gets_resp_sent: u64,
    pub getx_resp_sent: u64,
    pub nack_sent: u64,

    pub data_reads: u64,
    pub data_writes: u64,
    pub dir_entry_reads: u64,
    pub dir_entry_writes: u64,

    pub num_cache_hits: u64,
    pub mshr_hits: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits the finish-time summary via the `log` facade, at info level,
    /// the way the original prints it through the simulator's statistics
    /// output sink.
    pub fn report(&self) {
        log::info!("directory controller statistics:");
        log::info!("  requests processed:      {}", self.num_reqs_processed);
        log::info!("  GetS received:            {}", self.gets_req_received);
        log::info!("  GetX received:            {}", self.getx_req_received);
        log::info!("  GetSEx received:          {}", self.getsex_req_received);
        log::info!("  PutS received:            {}", self.puts_req_received);
        log::info!("  PutE received:            {}", self.pute_req_received);
        log::info!("  PutM received:            {}", self.putm_req_received);
        log::info!("  NACK received:            {}", self.nack_received);
        log::info!("  FetchResp received:       {}", self.fetch_resp_received);
        log::info!("  FetchXResp received:      {}", self.fetch_respx_received);
        log::info!("  Inv sent:                 {}", self.inv_sent);
        log::info!("  FetchInv sent:            {}", self.fetch_inv_sent);
        log::info!("  FetchInvX sent:           {}", self.fetch_invx_sent);
        log::info!("  NACK sent:                {}", self.nack_sent);
        log::info!("  data reads:               {}", self.data_reads);
        log::info!("  data writes:              {}", self.data_writes);
        log::info!("  dir entry reads:          {}", self.dir_entry_reads);
        log::info!("  dir entry writes:         {}", self.dir_entry_writes);
        log::info!("  MSHR hits:                {}", self.mshr_hits);
        log::info!("  entry-cache hits:         {}", self.num_cache_hits);
    }
}
