/// D-Bus service name for the COSMIC RDP Server daemon.
pub const SERVICE_NAME: &str = "com.system76.CosmicRdpServer";

/// D-Bus object path for the COSMIC RDP Server daemon.
pub const OBJECT_PATH: &str = "/com/system76/CosmicRdpServer";

/// D-Bus service name for the COSMIC RDP Broker daemon.
pub const BROKER_SERVICE_NAME: &str = "io.github.olafkfreund.CosmicExtRdpBroker";

/// D-Bus object path for the COSMIC RDP Broker daemon.
pub const BROKER_OBJECT_PATH: &str = "/io/github/olafkfreund/CosmicExtRdpBroker";
