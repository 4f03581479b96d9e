use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use anyhow::bail;

pub struct RudpConfig {
    pub self_addr: SocketAddr,

    /// This is the payload size inside UDP packets that RUDP assumes. Since RUDP never
    ///  fragments packets, this payload size (and the implied packet size) must be supported by
    ///  all network connections between nodes. It is also the capacity of pooled buffers.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6.
    ///
    /// Choosing this value too big causes packets to be dropped. Choosing it too small wastes
    ///  bandwidth.
    pub payload_size_inside_udp: usize,

    /// number of buffers allocated up front
    pub buffer_pool_warm_up: usize,
    /// This is the number of buffers that will be pooled at a given time - buffers in excess of this
    ///  number are discarded when they are returned.
    pub buffer_pool_size: usize,

    /// This is the maximum number of reliable *packets* (not bytes) per peer that are stored on
    ///  the sender side pending an ack message. Sending more fails until acks arrive.
    pub send_window_size: u32,
    /// number of packets per peer the receiver buffers for reordering. This must be at least
    ///  the send window size.
    pub receive_window_size: u32,

    /// interval of the per-peer sweep for packets due for resend
    pub resend_interval: Duration,
    /// a reliable packet is resent if it was not acknowledged for this long - configure to
    ///  somewhat more than the round trip time
    pub resend_timeout: Duration,

    /// upper bound for the number of datagrams a single `tick()` processes
    pub max_receives_per_tick: usize,

    pub handshake_interval: Duration,
    /// a connection attempt fails if it is not accepted in this time
    pub handshake_timeout: Duration,

    /// request encryption when connecting, and agree to it when accepting
    pub encryption: bool,
    pub rsa_key_bits: usize,
}

impl RudpConfig {
    /// ipv4 with end-to-end full Ethernet MTU - without optional headers - listening on an
    ///  ephemeral port
    pub fn default_ipv4() -> RudpConfig {
        RudpConfig {
            self_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            payload_size_inside_udp: 1472,
            buffer_pool_warm_up: 64,
            buffer_pool_size: 4096,
            send_window_size: 256,
            receive_window_size: 256,
            resend_interval: Duration::from_millis(15),
            resend_timeout: Duration::from_millis(100),
            max_receives_per_tick: 256,
            handshake_interval: Duration::from_millis(200),
            handshake_timeout: Duration::from_secs(5),
            encryption: true,
            rsa_key_bits: 2048,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.payload_size_inside_udp < 100 {
            bail!("Payload size is too small");
        }
        if self.payload_size_inside_udp > 65507 {
            bail!("Payload size exceeds the maximum UDP payload");
        }
        if self.buffer_pool_warm_up > self.buffer_pool_size {
            bail!("buffer pool warm-up must not exceed the pool size");
        }
        if self.send_window_size == 0 {
            bail!("send window size must be positive");
        }
        if self.receive_window_size < self.send_window_size {
            bail!("receive window ({}) must be at least as big as the send window ({})", self.receive_window_size, self.send_window_size);
        }
        if self.resend_interval.is_zero() || self.resend_timeout.is_zero() {
            bail!("resend interval and timeout must be positive");
        }
        if self.max_receives_per_tick == 0 {
            bail!("max receives per tick must be positive");
        }
        if self.handshake_interval.is_zero() || self.handshake_interval >= self.handshake_timeout {
            bail!("handshake interval must be positive and shorter than the handshake timeout");
        }
        if self.encryption && self.rsa_key_bits < 1024 {
            bail!("RSA keys need at least 1024 bits");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(RudpConfig::default_ipv4().validate().is_ok());
    }

    #[rstest]
    #[case::payload_too_small(|c: &mut RudpConfig| c.payload_size_inside_udp = 99)]
    #[case::payload_too_big(|c: &mut RudpConfig| c.payload_size_inside_udp = 65508)]
    #[case::warm_up(|c: &mut RudpConfig| c.buffer_pool_warm_up = c.buffer_pool_size + 1)]
    #[case::send_window(|c: &mut RudpConfig| c.send_window_size = 0)]
    #[case::receive_window(|c: &mut RudpConfig| c.receive_window_size = c.send_window_size - 1)]
    #[case::resend_interval(|c: &mut RudpConfig| c.resend_interval = Duration::ZERO)]
    #[case::max_receives(|c: &mut RudpConfig| c.max_receives_per_tick = 0)]
    #[case::handshake(|c: &mut RudpConfig| c.handshake_interval = c.handshake_timeout)]
    #[case::rsa_bits(|c: &mut RudpConfig| c.rsa_key_bits = 512)]
    fn test_invalid(#[case] modification: fn(&mut RudpConfig)) {
        let mut config = RudpConfig::default_ipv4();
        modification(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rsa_bits_irrelevant_without_encryption() {
        let mut config = RudpConfig::default_ipv4();
        config.encryption = false;
        config.rsa_key_bits = 0;
        assert!(config.validate().is_ok());
    }
}
