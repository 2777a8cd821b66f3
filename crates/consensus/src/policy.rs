//! Tunable node policy. The values here are defaults; every one of them
//! can be overridden from the command line or by the embedding code.

#[derive(Clone, Debug)]
pub struct Policy {
    /// Combined ban score above which a peer is banned.
    pub max_banscore: u32,
    /// How long a banned peer stays banned, in seconds.
    pub ban_duration_secs: u64,
    /// Seconds for ten points of transient ban score to decay.
    pub transient_decay_secs: u64,
    /// Seconds an inflight block request entry lives before expiring.
    pub inflight_ttl_secs: u64,
    /// Seconds an orphan block is retained before the sweeper evicts it.
    pub orphan_ttl_secs: u64,
    /// Upper bound on mempool memory, in bytes.
    pub mempool_max_bytes: usize,
    /// Soft cap on the serialized size of blocks we relay.
    pub blocksize_soft_limit: usize,
    /// Hard cap on a single framed network message.
    pub max_message_size: usize,
    /// Nullifiers held in memory for fast double-spend checks.
    pub max_nullifiers: usize,
    /// Historical txo roots accepted as proof anchors.
    pub max_txo_roots: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_banscore: 100,
            ban_duration_secs: 24 * 60 * 60,
            transient_decay_secs: 60,
            inflight_ttl_secs: 5 * 60,
            orphan_ttl_secs: 10 * 60,
            mempool_max_bytes: 300 * 1024 * 1024,
            blocksize_soft_limit: 1024 * 1024,
            max_message_size: 1 << 23,
            max_nullifiers: 100_000,
            max_txo_roots: 500,
        }
    }
}
