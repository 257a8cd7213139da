use fwbus_proto::csr::SPLIT_TIMEOUT_LO_DEFAULT;
use fwbus_proto::NodeId;

/// Per-host policy knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Consecutive invalid Self-ID streams answered with another bus reset before the host
    /// publishes a best-effort topology.
    pub max_selfid_retries: u32,
    /// Self-ID quadlets accepted per reset; extra quadlets are dropped.
    pub max_selfids: usize,
    /// Bus id reported in `NODE_IDS` until software assigns one.
    pub local_bus: u16,
    /// Initial `SPLIT_TIMEOUT_HI`/`SPLIT_TIMEOUT_LO` register values.
    pub split_timeout_hi: u32,
    pub split_timeout_lo: u32,
    /// Whether the `make_*` request constructors wait for a free transaction label instead of
    /// failing.
    pub blocking_tlabels: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_selfid_retries: 20,
            max_selfids: 252,
            local_bus: NodeId::LOCAL_BUS,
            split_timeout_hi: 0,
            split_timeout_lo: SPLIT_TIMEOUT_LO_DEFAULT,
            blocking_tlabels: true,
        }
    }
}
