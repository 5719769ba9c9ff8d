/// Local port allowlist for NEW stream requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortAllowlist {
    ports: Vec<u16>,
}

impl PortAllowlist {
    /// Create an allowlist from port numbers
    ///
    /// An empty list allows every port.
    pub fn new(ports: Vec<u16>) -> Self {
        let mut ports = ports;
        ports.sort_unstable();
        ports.dedup();
        Self { ports }
    }

    /// Allowlist that accepts every port
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Check if a local port may be opened on behalf of the proxy
    pub fn is_port_allowed(&self, port: u16) -> bool {
        // Empty allowlist means allow all ports
        if self.ports.is_empty() {
            return true;
        }

        self.ports.binary_search(&port).is_ok()
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}

impl From<Option<Vec<u16>>> for PortAllowlist {
    fn from(ports: Option<Vec<u16>>) -> Self {
        ports.map(Self::new).unwrap_or_default()
    }
}
