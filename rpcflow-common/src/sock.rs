use crate::{
    pipeline::Discard,
    reader::{AddressSpace, BoundedReader},
    CaptureConfig,
};

/// IPv4 destination of a socket, host byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: u32,
    pub port: u16,
}

/// Read the destination out of `struct sock`.
///
/// Fails with [`Discard::UnsupportedFamily`] for anything but the configured
/// family, and with [`Discard::ReadFault`] if a field cannot be read.
#[inline(always)]
pub fn extract_endpoint<R: BoundedReader>(
    reader: &R,
    sk: u64,
    cfg: &CaptureConfig,
) -> Result<Endpoint, Discard> {
    if sk == 0 {
        return Err(Discard::ReadFault);
    }
    let layout = &cfg.layout;
    let family = reader
        .read_u16(AddressSpace::Kernel, sk + layout.sk_family as u64)
        .map_err(|_| Discard::ReadFault)?;
    if family != cfg.family {
        return Err(Discard::UnsupportedFamily);
    }

    // Both fields are stored in network byte order.
    let daddr = reader
        .read_u32(AddressSpace::Kernel, sk + layout.sk_daddr as u64)
        .map_err(|_| Discard::ReadFault)?;
    let dport = reader
        .read_u16(AddressSpace::Kernel, sk + layout.sk_dport as u64)
        .map_err(|_| Discard::ReadFault)?;

    Ok(Endpoint {
        addr: u32::from_be(daddr),
        port: u16::from_be(dport),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHost, SockSpec};

    #[test]
    fn test_ipv4_endpoint() {
        let mut host = FakeHost::new(b"node");
        let sk = host.add_sock(SockSpec::ipv4([93, 184, 216, 34], 443));
        let ep = extract_endpoint(&host, sk, &CaptureConfig::DEFAULT).unwrap();
        assert_eq!(ep.addr, u32::from_be_bytes([93, 184, 216, 34]));
        assert_eq!(ep.port, 443);
    }

    #[test]
    fn test_ipv6_rejected() {
        let mut host = FakeHost::new(b"node");
        let sk = host.add_sock(SockSpec {
            family: 10,
            ..SockSpec::ipv4([0, 0, 0, 0], 443)
        });
        assert_eq!(
            extract_endpoint(&host, sk, &CaptureConfig::DEFAULT),
            Err(Discard::UnsupportedFamily)
        );
    }

    #[test]
    fn test_unmapped_sock() {
        let host = FakeHost::new(b"node");
        assert_eq!(
            extract_endpoint(&host, 0xdead_0000, &CaptureConfig::DEFAULT),
            Err(Discard::ReadFault)
        );
        assert_eq!(
            extract_endpoint(&host, 0, &CaptureConfig::DEFAULT),
            Err(Discard::ReadFault)
        );
    }
}
