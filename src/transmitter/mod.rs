use crate::{
    transport::{
        dns::{IpRecord, ResolutionList, ResolutionPolicy},
        registry::ConnectionRegistry,
        sip_addr::SipAddr,
    },
    Error, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use rsip::transport::Transport;
use std::sync::Arc;
use tracing::{debug, info, warn};


/// Where the resolution process of one send attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    Undefined,
    Resolving,
    Resolved,
    Unresolved,
}

/// The external resolver. The transmitter never issues DNS queries itself;
/// it names what it needs and the source pushes the structured answers into
/// the list, possibly in several batches.
#[async_trait]
pub trait DnsSource: Send + Sync {
    /// Top-level lookup for a bare domain: NAPTR answers select transports
    /// and replacement names.
    async fn feed_uri(&self, domain: &str, list: &mut ResolutionList) -> Result<()>;

    /// Service lookup for a replacement name with a known transport: SRV or
    /// host answers.
    async fn feed_service(
        &self,
        name: &str,
        transport: Transport,
        list: &mut ResolutionList,
    ) -> Result<()>;

    /// Address lookup for a concrete host name: IP answers.
    async fn feed_address(
        &self,
        host: &str,
        port: u16,
        transport: Transport,
        list: &mut ResolutionList,
    ) -> Result<()>;
}

/// Where encoded messages go. Production wires this to the connection
/// registry; tests substitute failure scripts.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, dest: &SipAddr, data: Bytes) -> Result<u64>;
}

#[async_trait]
impl Outbound for ConnectionRegistry {
    async fn send(&self, dest: &SipAddr, data: Bytes) -> Result<u64> {
        let connection = self.get_or_create(dest).await?;
        connection.acquire();
        let result = connection.send_raw(data).await;
        connection.release();
        result
    }
}

/// Drives one logical send: consume resolution candidates in order, hand the
/// message to the right connection, fall back to the next candidate on
/// failure, give up when the list is exhausted.
pub struct Transmitter {
    dns: Arc<dyn DnsSource>,
    outbound: Arc<dyn Outbound>,
    list: ResolutionList,
    state: ResolutionState,
    /// Transport settled at the NAPTR stage, applied to SRV pops that carry
    /// none of their own.
    chosen_transport: Option<Transport>,
    /// Pre-discovered destination; resolution is skipped while it holds.
    pinned: Option<SipAddr>,
    /// Destination and exact bytes of the last fully handed-over message.
    last_sent: Option<(SipAddr, Bytes)>,
    attempts: u32,
}

impl Transmitter {
    pub fn new(dns: Arc<dyn DnsSource>, outbound: Arc<dyn Outbound>, policy: ResolutionPolicy) -> Self {
        Self {
            dns,
            outbound,
            list: ResolutionList::new(policy),
            state: ResolutionState::Undefined,
            chosen_transport: None,
            pinned: None,
            last_sent: None,
            attempts: 0,
        }
    }

    /// Pin a pre-discovered address: `send_to` goes straight to sending and
    /// only falls back into resolution if that send fails.
    pub fn set_pinned(&mut self, dest: SipAddr) {
        self.pinned = Some(dest);
    }

    pub fn state(&self) -> ResolutionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn list(&self) -> &ResolutionList {
        &self.list
    }

    /// The list is populated externally too (answer batches may keep
    /// arriving while candidates are being consumed).
    pub fn list_mut(&mut self) -> &mut ResolutionList {
        &mut self.list
    }

    /// Send `message` toward `target`, trying resolution candidates in
    /// order until one connection takes the message or the list runs out.
    pub async fn send_to(&mut self, target: &rsip::Uri, message: Bytes) -> Result<SipAddr> {
        if let Some(dest) = self.pinned.clone() {
            debug!("sending to pre-discovered address {}", dest);
            self.attempts += 1;
            match self.outbound.send(&dest, message.clone()).await {
                Ok(_) => {
                    self.last_sent = Some((dest.clone(), message));
                    self.state = ResolutionState::Resolved;
                    return Ok(dest);
                }
                Err(e) => {
                    warn!("send to pinned {} failed: {}, resolving further", dest, e);
                    self.pinned = None;
                }
            }
        }

        if self.state == ResolutionState::Undefined {
            self.seed(target).await?;
            self.state = ResolutionState::Resolving;
        }

        loop {
            let candidate = match self.next_address().await? {
                Some(candidate) => candidate,
                None => {
                    info!(
                        "no candidate left for {} after {} attempts",
                        target, self.attempts
                    );
                    self.state = ResolutionState::Unresolved;
                    return Err(Error::SendExhausted(self.attempts));
                }
            };
            let dest = address_of(&candidate);
            self.attempts += 1;
            debug!("attempt {}: sending to {}", self.attempts, dest);
            match self.outbound.send(&dest, message.clone()).await {
                Ok(_) => {
                    self.state = ResolutionState::Resolved;
                    self.pinned = Some(dest.clone());
                    self.last_sent = Some((dest.clone(), message));
                    return Ok(dest);
                }
                Err(e) => {
                    self.report_candidate_failure(&dest, &e);
                }
            }
        }
    }

    /// Re-send the last fully handed-over message, bit-identical to the
    /// original transmission.
    pub async fn retransmit(&self) -> Result<()> {
        match &self.last_sent {
            Some((dest, data)) => {
                debug!("retransmitting {} bytes to {}", data.len(), dest);
                self.outbound.send(dest, data.clone()).await.map(|_| ())
            }
            None => Err(Error::IllegalState("no message to retransmit".into())),
        }
    }

    /// Fork the resolution for an independent attempt: the clone shares no
    /// mutable state with this transmitter, both sides consume their lists
    /// separately.
    pub fn continue_with_new_dns(&self) -> Transmitter {
        Transmitter {
            dns: self.dns.clone(),
            outbound: self.outbound.clone(),
            list: self.list.clone(),
            state: if self.state == ResolutionState::Undefined {
                ResolutionState::Undefined
            } else {
                ResolutionState::Resolving
            },
            chosen_transport: self.chosen_transport,
            pinned: None,
            last_sent: None,
            attempts: 0,
        }
    }

    /// Initial population of the list from the target URI. An IP literal
    /// skips every DNS tier; a known transport skips NAPTR; an explicit
    /// port skips SRV and goes straight to address resolution.
    async fn seed(&mut self, target: &rsip::Uri) -> Result<()> {
        let hint = transport_hint(target);
        let explicit_port = target.host_with_port.port.as_ref().map(|p| *p.value());
        match &target.host_with_port.host {
            rsip::host_with_port::Host::IpAddr(ip) => {
                let transport = hint.unwrap_or(Transport::Tcp);
                let port = explicit_port.unwrap_or(default_port(transport));
                self.chosen_transport = Some(transport);
                self.list.push_ip(IpRecord {
                    transport,
                    port,
                    address: *ip,
                })?;
            }
            rsip::host_with_port::Host::Domain(domain) => {
                let name = domain.to_string();
                match hint {
                    Some(transport) => {
                        self.chosen_transport = Some(transport);
                        if let Some(port) = explicit_port {
                            self.dns
                                .feed_address(&name, port, transport, &mut self.list)
                                .await?;
                        } else {
                            self.dns
                                .feed_service(&name, transport, &mut self.list)
                                .await?;
                        }
                    }
                    None => {
                        self.dns.feed_uri(&name, &mut self.list).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Produce the next concrete candidate, cascading through the tiers:
    /// IP entries are handed out first; an empty IP tier is refilled from
    /// the next host or SRV record; an empty SRV tier from the next NAPTR
    /// record. `None` means the whole list is exhausted.
    async fn next_address(&mut self) -> Result<Option<IpRecord>> {
        loop {
            if let Some(ip) = self.list.pop_ip() {
                return Ok(Some(ip));
            }
            if let Some(host) = self.list.pop_host() {
                self.list.record_used_host(&host);
                self.dns
                    .feed_address(&host.name, host.port, host.transport, &mut self.list)
                    .await?;
                continue;
            }
            if let Some(srv) = self.list.pop_srv() {
                self.list.record_used_srv(&srv);
                let transport = self.chosen_transport.unwrap_or(Transport::Tcp);
                self.dns
                    .feed_address(&srv.target, srv.port, transport, &mut self.list)
                    .await?;
                continue;
            }
            if let Some(naptr) = self.list.pop_naptr() {
                self.chosen_transport = Some(naptr.service);
                self.dns
                    .feed_service(&naptr.replacement, naptr.service, &mut self.list)
                    .await?;
                continue;
            }
            return Ok(None);
        }
    }

    /// Name the record behind a failed candidate, so the failure report
    /// points at the exact DNS entry.
    fn report_candidate_failure(&self, dest: &SipAddr, error: &Error) {
        match (self.list.used_host(), self.list.used_srv()) {
            (Some(host), _) => warn!(
                "send to {} failed: {} (host record {})",
                dest, error, host.name
            ),
            (None, Some(srv)) => warn!(
                "send to {} failed: {} (srv record {})",
                dest, error, srv.target
            ),
            (None, None) => warn!("send to {} failed: {}", dest, error),
        }
    }
}

fn address_of(record: &IpRecord) -> SipAddr {
    SipAddr {
        r#type: Some(record.transport),
        addr: rsip::HostWithPort {
            host: record.address.into(),
            port: Some(record.port.into()),
        },
    }
}

fn default_port(transport: Transport) -> u16 {
    match transport {
        Transport::Tls => 5061,
        _ => 5060,
    }
}

/// Transport requested by the URI itself: a transport parameter wins, a
/// sips scheme forces TLS, anything else leaves the decision to NAPTR.
fn transport_hint(uri: &rsip::Uri) -> Option<Transport> {
    let mut hint = match uri.scheme {
        Some(rsip::Scheme::Sips) => Some(Transport::Tls),
        _ => None,
    };
    uri.params.iter().for_each(|param| {
        if let rsip::common::uri::Param::Transport(transport) = param {
            hint = Some(transport.clone());
        }
    });
    hint
}
