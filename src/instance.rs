use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use tracing::debug;

use crate::error::InstanceError;

pub const INSTANCE_PORT: u16 = 47652;

/// Held for the lifetime of a `run`; a second process fails to bind.
#[derive(Debug)]
pub struct InstanceLock {
    listener: TcpListener,
}

impl InstanceLock {
    pub fn acquire() -> Result<Self, InstanceError> {
        Self::acquire_on(INSTANCE_PORT)
    }

    pub fn acquire_on(port: u16) -> Result<Self, InstanceError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr).map_err(|source| InstanceError { port, source })?;
        debug!(%addr, "instance lock acquired");
        Ok(Self { listener })
    }

    pub fn port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_port_fails() {
        let first = InstanceLock::acquire_on(0).unwrap();
        let port = first.port();
        assert_ne!(port, 0);

        let err = InstanceLock::acquire_on(port).unwrap_err();
        assert_eq!(err.port, port);

        drop(first);
        InstanceLock::acquire_on(port).unwrap();
    }
}
