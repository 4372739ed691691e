//! Write options and on-disk format identity.

/// Magic bytes at the start of every table file (and of its footer echo).
pub(crate) const MAGIC: [u8; 4] = *b"REFT";

/// Block size used when a table does not declare one.
pub(crate) const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Identifier of the hash function whose values a table stores, an ASCII
/// four-byte constant stored in the v2 header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashId(pub [u8; 4]);

impl HashId {
    pub const SHA1: HashId = HashId(*b"sha1");
    pub const SHA256: HashId = HashId(*b"s256");
    /// A zeroed hash id is accepted on read and means sha1.
    pub const NULL: HashId = HashId([0; 4]);

    /// The size of a hash value in bytes.
    pub fn size(self) -> usize {
        match self {
            HashId::NULL | HashId::SHA1 => 20,
            HashId::SHA256 => 32,
            _ => panic!("unknown hash id {:?}", self.0),
        }
    }

    /// Format version implied by this hash id.
    pub fn version(self) -> u32 {
        match self {
            HashId::NULL | HashId::SHA1 => 1,
            HashId::SHA256 => 2,
            _ => panic!("unknown hash id {:?}", self.0),
        }
    }
}

/// Size of the file header for the given format version.
pub(crate) fn header_size(version: u32) -> usize {
    match version {
        1 => 24,
        2 => 28,
        _ => panic!("unsupported version {version}"),
    }
}

/// Size of the file footer for the given format version.
pub(crate) fn footer_size(version: u32) -> usize {
    match version {
        1 => 68,
        2 => 72,
        _ => panic!("unsupported version {version}"),
    }
}

/// Write options for reftables.
#[derive(Debug, Clone)]
pub struct Config {
    /// If set, do not pad blocks to the block size.
    pub unaligned: bool,

    /// The block size; 0 means the 4096 default. Must stay below 2^24.
    pub block_size: u32,

    /// Suppress the object index section.
    pub skip_index_objects: bool,

    /// Interval between uncompressed restart keys; 0 means the default of 16.
    pub restart_interval: usize,

    /// Hash identifier. `HashId::NULL` means sha1.
    pub hash_id: HashId,

    /// Allow dir/file conflicts and illegal ref names.
    pub skip_name_check: bool,

    /// If set, store reflog messages exactly. If unset, only a single line
    /// is allowed, and a trailing '\n' is added when missing.
    pub exact_log_message: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            unaligned: false,
            block_size: DEFAULT_BLOCK_SIZE,
            skip_index_objects: false,
            restart_interval: 16,
            hash_id: HashId::SHA1,
            skip_name_check: false,
            exact_log_message: false,
        }
    }
}

impl Config {
    /// Set the target block size.
    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }

    /// Omit inter-block padding.
    pub fn unaligned(mut self, unaligned: bool) -> Self {
        self.unaligned = unaligned;
        self
    }

    /// Set the hash identifier.
    pub fn hash_id(mut self, hash_id: HashId) -> Self {
        self.hash_id = hash_id;
        self
    }

    /// Set the restart interval.
    pub fn restart_interval(mut self, interval: usize) -> Self {
        self.restart_interval = interval;
        self
    }

    /// Suppress the object index.
    pub fn skip_index_objects(mut self, skip: bool) -> Self {
        self.skip_index_objects = skip;
        self
    }

    /// Allow illegal ref names and dir/file conflicts.
    pub fn skip_name_check(mut self, skip: bool) -> Self {
        self.skip_name_check = skip;
        self
    }

    /// Store reflog messages exactly as given.
    pub fn exact_log_message(mut self, exact: bool) -> Self {
        self.exact_log_message = exact;
        self
    }

    pub(crate) fn normalized(&self) -> Config {
        let mut cfg = self.clone();
        if cfg.block_size == 0 {
            cfg.block_size = DEFAULT_BLOCK_SIZE;
        }
        if cfg.restart_interval == 0 {
            cfg.restart_interval = 16;
        }
        if cfg.hash_id == HashId::NULL {
            cfg.hash_id = HashId::SHA1;
        }
        cfg
    }
}

/// Which log records an explicit compaction drops.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogExpirationConfig {
    /// Drop log entries whose time is older than this, when non-zero.
    pub time: u64,
    /// Drop log entries above this update index, when non-zero.
    pub max_update_index: u64,
    /// Drop log entries below this update index, when non-zero.
    pub min_update_index: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_sizes() {
        assert_eq!(HashId::SHA1.size(), 20);
        assert_eq!(HashId::NULL.size(), 20);
        assert_eq!(HashId::SHA256.size(), 32);
        assert_eq!(HashId::SHA1.version(), 1);
        assert_eq!(HashId::SHA256.version(), 2);
    }

    #[test]
    fn test_header_footer_sizes() {
        assert_eq!(header_size(1), 24);
        assert_eq!(footer_size(1), 68);
        assert_eq!(header_size(2), 28);
        assert_eq!(footer_size(2), 72);
    }

    #[test]
    fn test_config_builder() {
        let cfg = Config::default()
            .block_size(512)
            .unaligned(true)
            .hash_id(HashId::SHA256)
            .restart_interval(4);
        assert_eq!(cfg.block_size, 512);
        assert!(cfg.unaligned);
        assert_eq!(cfg.hash_id, HashId::SHA256);
        assert_eq!(cfg.restart_interval, 4);
    }

    #[test]
    fn test_normalized_defaults() {
        let cfg = Config {
            block_size: 0,
            restart_interval: 0,
            hash_id: HashId::NULL,
            ..Config::default()
        }
        .normalized();
        assert_eq!(cfg.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(cfg.restart_interval, 16);
        assert_eq!(cfg.hash_id, HashId::SHA1);
    }
}
