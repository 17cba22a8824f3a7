//! Transport addresses and directory records
//!
//! Addresses are libp2p multiaddrs, e.g. `/ip4/10.0.0.1/tcp/10006`. A
//! relay-backed address names the relay transport, the relay's peer id and
//! the `p2p-circuit` marker:
//! `/ip4/1.2.3.4/tcp/10004/p2p/<relay>/p2p-circuit`.

use crate::error::{Error, Result};
use crate::peer::PeerId;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

pub use multiaddr::{Multiaddr, Protocol};

/// Tunnel views of a [`Multiaddr`]
pub trait MultiaddrExt: Sized {
    /// `/ip4/<ip>/tcp/<port>` or `/ip6/<ip>/tcp/<port>`
    fn from_socket_addr(addr: SocketAddr) -> Self;

    /// `<relay transport>/p2p/<relay>/p2p-circuit`
    fn circuit_via(relay_addr: &Self, relay: PeerId) -> Result<Self>;

    /// The socket address if the address starts with an IP and TCP port
    fn socket_addr(&self) -> Option<SocketAddr>;

    /// Whether the address goes through a circuit relay
    fn is_relayed(&self) -> bool;

    /// Trailing peer id, if any
    fn trailing_peer(&self) -> Option<PeerId>;

    /// The address with a trailing peer id removed
    fn without_trailing_peer(&self) -> Self;

    /// For a relayed address, the relay's own address and peer id
    fn relay(&self) -> Option<(Self, PeerId)>;
}

impl MultiaddrExt for Multiaddr {
    fn from_socket_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        };
        Multiaddr::empty().with(ip).with(Protocol::Tcp(addr.port()))
    }

    fn circuit_via(relay_addr: &Self, relay: PeerId) -> Result<Self> {
        Ok(relay_addr
            .without_trailing_peer()
            .with(Protocol::P2p(relay.to_libp2p()?))
            .with(Protocol::P2pCircuit))
    }

    fn socket_addr(&self) -> Option<SocketAddr> {
        let mut iter = self.iter();
        let ip: IpAddr = match iter.next()? {
            Protocol::Ip4(ip) => ip.into(),
            Protocol::Ip6(ip) => ip.into(),
            _ => return None,
        };
        match iter.next()? {
            Protocol::Tcp(port) => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    fn is_relayed(&self) -> bool {
        self.iter().any(|p| matches!(p, Protocol::P2pCircuit))
    }

    fn trailing_peer(&self) -> Option<PeerId> {
        match self.iter().last()? {
            Protocol::P2p(id) => PeerId::from_libp2p(&id).ok(),
            _ => None,
        }
    }

    fn without_trailing_peer(&self) -> Self {
        let mut addr = self.clone();
        if matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
            addr.pop();
        }
        addr
    }

    fn relay(&self) -> Option<(Self, PeerId)> {
        let components: Vec<Protocol<'_>> = self.iter().collect();
        let pos = components
            .iter()
            .position(|p| matches!(p, Protocol::P2pCircuit))?;
        let (last, transport) = components[..pos].split_last()?;
        let Protocol::P2p(relay) = last else {
            return None;
        };
        if transport.is_empty() {
            return None;
        }
        let relay = PeerId::from_libp2p(relay).ok()?;
        Some((transport.iter().cloned().collect(), relay))
    }
}

/// A peer and the transport addresses it can be reached at
///
/// Addresses are stored without the trailing `/p2p/<id>` of the owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddrInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerAddrInfo {
    pub fn new(id: PeerId, addrs: impl IntoIterator<Item = Multiaddr>) -> Self {
        let addrs = addrs
            .into_iter()
            .map(|addr| {
                if addr.trailing_peer() == Some(id) {
                    addr.without_trailing_peer()
                } else {
                    addr
                }
            })
            .collect();
        Self { id, addrs }
    }

    /// Addresses that do not go through a relay
    pub fn direct_addrs(&self) -> impl Iterator<Item = &Multiaddr> {
        self.addrs.iter().filter(|a| !a.is_relayed())
    }

    /// Relay-circuit addresses
    pub fn relayed_addrs(&self) -> impl Iterator<Item = &Multiaddr> {
        self.addrs.iter().filter(|a| a.is_relayed())
    }

    /// Directory record: every address suffixed with `/p2p/<id>`, concatenated
    ///
    /// Fails for addresses the record could not give back unchanged: empty
    /// ones, and ones holding a `p2p` component that is not a relay hop.
    pub fn to_record(&self) -> Result<Vec<u8>> {
        let owner = Protocol::P2p(self.id.to_libp2p()?);
        let mut out = Vec::new();
        for addr in &self.addrs {
            check_record_addr(addr)?;
            out.extend_from_slice(&addr.clone().with(owner.clone()).to_vec());
        }
        Ok(out)
    }

    /// Split a directory record back into its addresses
    ///
    /// An address ends at every `p2p` component that is not followed by
    /// `p2p-circuit`. All addresses must name the same owner.
    pub fn from_record(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::EmptyRecord);
        }
        let full = Multiaddr::try_from(bytes.to_vec()).map_err(|e| Error::InvalidAddress(e.to_string()))?;

        let mut owner: Option<PeerId> = None;
        let mut addrs = Vec::new();
        let mut current = Multiaddr::empty();
        let mut iter = full.iter().peekable();

        while let Some(component) = iter.next() {
            match component {
                Protocol::P2p(id) if !matches!(iter.peek(), Some(Protocol::P2pCircuit)) => {
                    let id = PeerId::from_libp2p(&id)?;
                    match owner {
                        None => owner = Some(id),
                        Some(expected) if expected != id => {
                            return Err(Error::PeerIdMismatch {
                                expected: expected.to_string(),
                                found: id.to_string(),
                            });
                        }
                        Some(_) => {}
                    }
                    let addr = std::mem::replace(&mut current, Multiaddr::empty());
                    if !addr.is_empty() {
                        addrs.push(addr);
                    }
                }
                other => current.push(other),
            }
        }

        if !current.is_empty() {
            return Err(Error::MissingPeerId(current.to_string()));
        }

        let id = owner.ok_or(Error::EmptyRecord)?;
        Ok(Self { id, addrs })
    }
}

fn check_record_addr(addr: &Multiaddr) -> Result<()> {
    if addr.is_empty() {
        return Err(Error::EmptyAddress);
    }
    let components: Vec<Protocol<'_>> = addr.iter().collect();
    let splits = components.iter().enumerate().any(|(i, p)| {
        matches!(p, Protocol::P2p(_)) && !matches!(components.get(i + 1), Some(Protocol::P2pCircuit))
    });
    if splits {
        return Err(Error::UnrecordableAddress(addr.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: u8) -> PeerId {
        PeerId([b; 32])
    }

    #[test]
    fn test_text_roundtrip_with_circuit() {
        let text = format!(
            "/ip4/1.2.3.4/tcp/10004/p2p/{}/p2p-circuit/p2p/{}",
            peer(1),
            peer(2)
        );
        let addr: Multiaddr = text.parse().unwrap();
        assert_eq!(addr.len(), 5);
        assert!(addr.is_relayed());
        assert_eq!(addr.to_string(), text);
        assert_eq!(addr.trailing_peer(), Some(peer(2)));
    }

    #[test]
    fn test_ip4_tcp_encoding_is_stable() {
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/10004".parse().unwrap();
        assert_eq!(addr.to_vec(), vec![0x04, 1, 2, 3, 4, 0x06, 0x27, 0x14]);
        assert_eq!(
            Multiaddr::from_socket_addr("1.2.3.4:10004".parse().unwrap()),
            addr
        );
    }

    #[test]
    fn test_socket_addr_and_relay_parts() {
        let relay_addr: Multiaddr = "/ip4/10.0.0.1/tcp/10004".parse().unwrap();
        let circuit = Multiaddr::circuit_via(&relay_addr, peer(3)).unwrap();
        assert_eq!(circuit.socket_addr(), Some("10.0.0.1:10004".parse().unwrap()));
        assert_eq!(circuit.relay(), Some((relay_addr.clone(), peer(3))));
        assert_eq!(relay_addr.relay(), None);
        assert!(!relay_addr.is_relayed());

        let v6: Multiaddr = "/ip6/::1/tcp/10006".parse().unwrap();
        assert_eq!(v6.socket_addr(), Some("[::1]:10006".parse().unwrap()));
    }

    #[test]
    fn test_record_roundtrip_mixed_addresses() {
        let direct: Multiaddr = "/ip4/192.168.1.5/tcp/10006".parse().unwrap();
        let relayed = Multiaddr::circuit_via(&"/ip4/1.2.3.4/tcp/10004".parse().unwrap(), peer(1)).unwrap();
        let info = PeerAddrInfo::new(peer(2), vec![direct.clone(), relayed.clone()]);

        let decoded = PeerAddrInfo::from_record(&info.to_record().unwrap()).unwrap();
        assert_eq!(decoded.id, peer(2));
        assert_eq!(decoded.addrs, vec![direct, relayed.clone()]);
        assert_eq!(decoded.relayed_addrs().collect::<Vec<_>>(), vec![&relayed]);
    }

    #[test]
    fn test_record_strips_existing_owner_suffix() {
        let addr: Multiaddr = format!("/ip4/1.2.3.4/tcp/10004/p2p/{}", peer(5)).parse().unwrap();
        let info = PeerAddrInfo::new(peer(5), vec![addr]);
        assert_eq!(info.addrs[0].to_string(), "/ip4/1.2.3.4/tcp/10004");

        let full = Multiaddr::try_from(info.to_record().unwrap()).unwrap();
        assert_eq!(full.to_string(), format!("/ip4/1.2.3.4/tcp/10004/p2p/{}", peer(5)));
    }

    #[test]
    fn test_record_rejects_addresses_it_cannot_return() {
        let foreign: Multiaddr = format!("/ip4/10.0.0.5/tcp/10006/p2p/{}", peer(2)).parse().unwrap();
        let info = PeerAddrInfo::new(peer(1), vec![foreign]);
        assert!(matches!(info.to_record(), Err(Error::UnrecordableAddress(_))));

        let info = PeerAddrInfo::new(peer(1), vec![Multiaddr::empty()]);
        assert_eq!(info.to_record(), Err(Error::EmptyAddress));
    }

    #[test]
    fn test_record_rejects_mixed_owners_and_missing_suffix() {
        let a = PeerAddrInfo::new(peer(1), vec!["/ip4/1.1.1.1/tcp/1".parse().unwrap()]);
        let b = PeerAddrInfo::new(peer(2), vec!["/ip4/2.2.2.2/tcp/2".parse().unwrap()]);
        let mut bytes = a.to_record().unwrap();
        bytes.extend(b.to_record().unwrap());
        assert!(matches!(
            PeerAddrInfo::from_record(&bytes),
            Err(Error::PeerIdMismatch { .. })
        ));

        let bare: Multiaddr = "/ip4/1.1.1.1/tcp/1".parse().unwrap();
        assert!(matches!(
            PeerAddrInfo::from_record(&bare.to_vec()),
            Err(Error::MissingPeerId(_))
        ));
        assert_eq!(PeerAddrInfo::from_record(&[]), Err(Error::EmptyRecord));
        assert!(matches!(
            PeerAddrInfo::from_record(&[0x04, 1, 2]),
            Err(Error::InvalidAddress(_))
        ));
    }
}
