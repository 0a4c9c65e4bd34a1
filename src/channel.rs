//! Bus channel: the single open handle to a CAN interface.
//!
//! A [`BusInterface`] resolves an interface name to a [`CanChannel`]. The
//! channel is a pair of frame pipes; whatever drives the physical (or
//! simulated) interface holds the other end as a [`ChannelPeer`].

use crate::error::ChannelError;
use crate::frame::CanFrame;
use arrayvec::ArrayString;
use tokio::sync::mpsc;

/// Linux limits interface names to IFNAMSIZ - 1 bytes.
pub const MAX_INTERFACE_NAME: usize = 15;

pub type InterfaceName = ArrayString<MAX_INTERFACE_NAME>;

pub fn parse_interface_name(name: &str) -> Result<InterfaceName, ChannelError> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(ChannelError::InvalidName(name.to_string()));
    }
    InterfaceName::from(name).map_err(|_| ChannelError::InvalidName(name.to_string()))
}

/// Something that can open a channel on a named CAN interface.
pub trait BusInterface: Send + Sync {
    fn open(&self, name: &str) -> Result<CanChannel, ChannelError>;
}

#[derive(Debug)]
pub struct CanChannel {
    interface: InterfaceName,
    tx: mpsc::UnboundedSender<CanFrame>,
    rx: mpsc::UnboundedReceiver<CanFrame>,
    open: bool,
}

/// The driver side of a [`CanChannel`].
#[derive(Debug)]
pub struct ChannelPeer {
    pub to_master: mpsc::UnboundedSender<CanFrame>,
    pub from_master: mpsc::UnboundedReceiver<CanFrame>,
}

impl CanChannel {
    pub fn pair(interface: InterfaceName) -> (CanChannel, ChannelPeer) {
        let (master_tx, peer_rx) = mpsc::unbounded_channel();
        let (peer_tx, master_rx) = mpsc::unbounded_channel();

        let channel = CanChannel {
            interface,
            tx: master_tx,
            rx: master_rx,
            open: true,
        };
        let peer = ChannelPeer {
            to_master: peer_tx,
            from_master: peer_rx,
        };
        (channel, peer)
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn send(&mut self, frame: CanFrame) -> Result<(), ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        self.tx.send(frame).map_err(|_| {
            self.open = false;
            ChannelError::Closed
        })
    }

    /// Cancel safe.
    pub async fn recv(&mut self) -> Result<CanFrame, ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        match self.rx.recv().await {
            Some(frame) => Ok(frame),
            None => {
                self.open = false;
                Err(ChannelError::Closed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_name_validation() {
        assert!(parse_interface_name("can0").is_ok());
        assert!(parse_interface_name("vcan_master_01").is_ok());
        assert!(parse_interface_name("").is_err());
        assert!(parse_interface_name("can 0").is_err());
        assert!(parse_interface_name("a_very_long_interface").is_err());
    }

    #[test]
    fn test_send_fails_once_peer_is_gone() {
        let (mut channel, peer) = CanChannel::pair(parse_interface_name("vcan0").unwrap());
        let frame = CanFrame::new(0x000, &[0x82, 0x00]).unwrap();
        assert!(channel.send(frame.clone()).is_ok());

        drop(peer);
        assert_eq!(channel.send(frame), Err(ChannelError::Closed));
        assert!(!channel.is_open());
    }
}
