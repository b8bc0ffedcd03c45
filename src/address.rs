use crate::config::Config;

pub type Addr = u64;

/// Validity checking and global/local address translation for the
/// controller's owned range.
///
/// When `interleave_size == 0` the range is contiguous and translation is a
/// plain offset; otherwise the range is interleaved in `interleave_step`
/// sized strides of which only the first `interleave_size` bytes belong to
/// this controller.
#[derive(Debug, Clone)]
pub struct AddressMap {
    range_start: Addr,
    range_end: Addr,
    interleave_size: u64,
    interleave_step: u64,
}

impl AddressMap {
    pub fn new(config: &Config) -> Self {
        Self {
            range_start: config.addr_range_start,
            range_end: config.addr_range_end,
            interleave_size: config.interleave_size,
            interleave_step: config.interleave_step,
        }
    }

    fn has_upper_bound(&self) -> bool {
        self.range_end != 0
    }

    pub fn is_request_address_valid(&self, addr: Addr) -> bool {
        if addr < self.range_start {
            return false;
        }
        if self.has_upper_bound() && addr >= self.range_end {
            return false;
        }
        if self.interleave_size > 0 {
            let offset = (addr - self.range_start) % self.interleave_step;
            if offset >= self.interleave_size {
                return false;
            }
        }
        true
    }

    /// Global address -> local (controller-relative) address.
    pub fn to_local(&self, addr: Addr) -> Addr {
        if self.interleave_size == 0 {
            return addr - self.range_start;
        }
        let rel = addr - self.range_start;
        let stride_index = rel / self.interleave_step;
        let stride_offset = rel % self.interleave_step;
        stride_index * self.interleave_size + stride_offset
    }

    /// Local (controller-relative) address -> global address.
    pub fn from_local(&self, local: Addr) -> Addr {
        if self.interleave_size == 0 {
            return local + self.range_start;
        }
        let stride_index = local / self.interleave_size;
        let stride_offset = local % self.interleave_size;
        self.range_start + stride_index * self.interleave_step + stride_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut c = Config::default();
        c.addr_range_start = 0x1000;
        c.addr_range_end = 0x2000;
        c
    }

    #[test]
    fn validates_contiguous_range() {
        let map = AddressMap::new(&cfg());
        assert!(map.is_request_address_valid(0x1000));
        assert!(map.is_request_address_valid(0x1fff));
        assert!(!map.is_request_address_valid(0x2000));
        assert!(!map.is_request_address_valid(0x0fff));
    }

    #[test]
    fn contiguous_round_trips() {
        let map = AddressMap::new(&cfg());
        let global = 0x1500;
        let local = map.to_local(global);
        assert_eq!(map.from_local(local), global);
    }

    #[test]
    fn interleaved_round_trips_and_validates() {
        let mut c = cfg();
        c.addr_range_end = 0; // unbounded upper
        c.interleave_size = 64;
        c.interleave_step = 256;
        let map = AddressMap::new(&c);

        // first 64 bytes of every 256-byte stride belong to us
        assert!(map.is_request_address_valid(0x1000));
        assert!(map.is_request_address_valid(0x103f));
        assert!(!map.is_request_address_valid(0x1040));
        assert!(!map.is_request_address_valid(0x10ff));

        let global = 0x1020;
        let local = map.to_local(global);
        assert_eq!(map.from_local(local), global);
    }

    #[test]
    fn unbounded_range_accepts_any_high_address() {
        let mut c = cfg();
        c.addr_range_end = 0;
        let map = AddressMap::new(&c);
        assert!(map.is_request_address_valid(u64::MAX - 1));
    }
}
