use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub database_path: PathBuf,
    pub recordings_path: PathBuf,
    /// Start VMs flagged `auto_start` when the server comes up.
    pub auto_start_vms: bool,
    /// How often VM metadata and thumbnails are refreshed for list viewers.
    pub vm_info_update_frequency: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 6004).into(),
            database_path: PathBuf::from("./collab-vm.db"),
            recordings_path: PathBuf::from("./recordings"),
            auto_start_vms: true,
            vm_info_update_frequency: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.listen_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid LISTEN_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("RECORDINGS_PATH") {
            config.recordings_path = PathBuf::from(path);
        }

        if let Ok(val) = std::env::var("AUTO_START_VMS") {
            config.auto_start_vms = val != "false" && val != "0";
        }

        if let Ok(val) = std::env::var("VM_INFO_UPDATE_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.vm_info_update_frequency = Duration::from_secs(secs.max(1));
            } else {
                tracing::warn!(value = %val, "Invalid VM_INFO_UPDATE_SECS, using default");
            }
        }

        config
    }
}
