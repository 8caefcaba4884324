use lci::{Device, DeviceBuilder, RdvProtocol};
use serial_test::serial;

// the configuration is read once per process, every test here sets the same
// variables before touching it
fn set_env() {
    std::env::set_var("LCI_RDV_PROTOCOL", "write");
    std::env::set_var("LCI_SERVER_NUM_PKTS", "48");
    std::env::set_var("LCI_SERVER_MAX_RECVS", "12");
    std::env::set_var("LCI_PACKET_SIZE", "2048");
}

#[test]
#[serial]
fn environment_sets_device_defaults() {
    set_env();
    let config = lci::config();
    assert_eq!(config.rdv_protocol, RdvProtocol::Write);
    assert_eq!(config.server_num_pkts, 48);
    assert_eq!(config.default_queue_length(), 96);

    let device = Device::new().unwrap();
    assert_eq!(device.rdv_protocol(), RdvProtocol::Write);
    assert_eq!(device.packet_size(), 2048);
    assert_eq!(device.posted_recvs(), 12);
    assert_eq!(device.available_packets(), 36);
    assert_eq!(device.alloc_queue().capacity(), 96);
}

#[test]
#[serial]
fn builder_overrides_environment() {
    set_env();
    let device = DeviceBuilder::new()
        .with_rdv_protocol(RdvProtocol::WriteImm)
        .with_num_packets(20)
        .with_max_recvs(4)
        .build()
        .unwrap();
    assert_eq!(device.rdv_protocol(), RdvProtocol::WriteImm);
    assert_eq!(device.packet_size(), 2048);
    assert_eq!(device.posted_recvs(), 4);
    assert_eq!(device.available_packets(), 16);
    assert_eq!(device.alloc_queue().capacity(), 40);
    assert_eq!(device.nranks(), 1);
}
