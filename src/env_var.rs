use std::sync::OnceLock;

use serde::Deserialize;

use crate::rendezvous::RdvProtocol;

fn default_backend() -> String {
    "loopback".to_owned()
}

fn default_packet_size() -> usize {
    8192
}

fn default_server_num_pkts() -> usize {
    1024
}

fn default_server_max_recvs() -> usize {
    256
}

fn default_server_max_cqes() -> usize {
    64
}

fn default_max_endpoints() -> usize {
    8
}

fn default_packet_return_threshold() -> usize {
    1024
}

fn default_rdv_protocol() -> RdvProtocol {
    RdvProtocol::WriteImm
}

fn default_archive_bits() -> u32 {
    10
}

fn default_matchtable_bits() -> u32 {
    12
}

fn default_max_packet_pools() -> usize {
    272
}

fn default_max_msg_size() -> usize {
    1 << 30
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// The fabric backend to use
    /// loopback -- every rank lives in this process, default
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Size in bytes of every packet, bounds medium messages and control messages, default: 8192
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,

    /// Number of packets created per device, default: 1024
    #[serde(default = "default_server_num_pkts")]
    pub server_num_pkts: usize,

    /// Number of receives the device keeps posted, default: 256
    #[serde(default = "default_server_max_recvs")]
    pub server_max_recvs: usize,

    /// Maximum number of completions handled per progress call, default: 64
    #[serde(default = "default_server_max_cqes")]
    pub server_max_cqes: usize,

    /// Capacity of completion queues allocated through a device, default: 2 * server_num_pkts
    pub default_queue_length: Option<usize>,

    /// Maximum number of endpoints per device (at most 4096), default: 8
    #[serde(default = "default_max_endpoints")]
    pub max_endpoints: usize,

    /// Medium sends larger than this return their packet to the sender's pool, default: 1024
    #[serde(default = "default_packet_return_threshold")]
    pub packet_return_threshold: usize,

    /// The rendezvous strategy used when receiving long messages
    /// writeimm -- a single write carrying an immediate word, default
    /// write -- plain writes followed by a FIN message
    #[serde(default = "default_rdv_protocol")]
    pub rdv_protocol: RdvProtocol,

    /// log2 of the context archive capacity (at most 16), default: 10
    #[serde(default = "default_archive_bits")]
    pub archive_bits: u32,

    /// log2 of the number of matching table buckets, default: 12
    #[serde(default = "default_matchtable_bits")]
    pub matchtable_bits: u32,

    /// Maximum number of threads that can use one device's packet pool, default: 272
    #[serde(default = "default_max_packet_pools")]
    pub max_packet_pools: usize,

    /// Largest single write the loopback fabric accepts, default: 1 GiB
    #[serde(default = "default_max_msg_size")]
    pub max_msg_size: usize,

    /// Core the dedicated progress thread is pinned to, default: unpinned
    pub progress_core: Option<usize>,

    /// flag used to print warnings when posted receives run low. Default: true
    pub deadlock_warning: Option<bool>,

    /// flag used to print warnings when a device is dropped with queued posts. Default: true
    pub backlog_warning: Option<bool>,
}

impl Config {
    pub fn default_queue_length(&self) -> usize {
        self.default_queue_length
            .unwrap_or(2 * self.server_num_pkts)
    }
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("LCI_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_env() {
        let vars: Vec<(String, String)> = Vec::new();
        let config: Config = envy::prefixed("LCI_").from_iter(vars).unwrap();
        assert_eq!(config.backend, "loopback");
        assert_eq!(config.packet_size, 8192);
        assert_eq!(config.default_queue_length(), 2048);
        assert_eq!(config.rdv_protocol, RdvProtocol::WriteImm);
        assert_eq!(config.progress_core, None);
    }

    #[test]
    fn prefixed_overrides() {
        let vars = vec![
            ("LCI_RDV_PROTOCOL".to_owned(), "write".to_owned()),
            ("LCI_SERVER_NUM_PKTS".to_owned(), "16".to_owned()),
            ("LCI_DEADLOCK_WARNING".to_owned(), "false".to_owned()),
            ("OTHER_PACKET_SIZE".to_owned(), "1".to_owned()),
        ];
        let config: Config = envy::prefixed("LCI_").from_iter(vars).unwrap();
        assert_eq!(config.rdv_protocol, RdvProtocol::Write);
        assert_eq!(config.server_num_pkts, 16);
        assert_eq!(config.default_queue_length(), 32);
        assert_eq!(config.deadlock_warning, Some(false));
        assert_eq!(config.packet_size, 8192);
    }
}
