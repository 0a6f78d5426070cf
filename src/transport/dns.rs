use crate::{Error, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rsip::transport::Transport;
use std::{collections::VecDeque, fmt, net::IpAddr};
use tracing::debug;

/// One NAPTR answer: the service tag selects the transport, the replacement
/// is the domain the resolution continues with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaptrRecord {
    pub order: u16,
    pub preference: u16,
    pub service: Transport,
    pub replacement: String,
}

/// One SRV answer (RFC 2782). The transport is not part of the record, it is
/// implied by the query that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u32,
    pub port: u16,
    pub target: String,
}

/// A host name that is already bound to a transport and port, waiting for
/// address resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub priority: u16,
    pub weight: u32,
    pub port: u16,
    pub transport: Transport,
    pub name: String,
}

/// A fully resolved next hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRecord {
    pub transport: Transport,
    pub port: u16,
    pub address: IpAddr,
}

/// A single DNS answer of any kind, as pushed in by the external resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressRecord {
    Naptr(NaptrRecord),
    Srv(SrvRecord),
    Host(HostRecord),
    Ip(IpRecord),
}

impl fmt::Display for AddressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressRecord::Naptr(r) => write!(
                f,
                "NAPTR {} {} {} {}",
                r.order, r.preference, r.service, r.replacement
            ),
            AddressRecord::Srv(r) => {
                write!(f, "SRV {} {} {} {}", r.priority, r.weight, r.port, r.target)
            }
            AddressRecord::Host(r) => write!(
                f,
                "HOST {} {} {}:{} {}",
                r.priority, r.weight, r.name, r.port, r.transport
            ),
            AddressRecord::Ip(r) => write!(f, "IP {}:{} {}", r.address, r.port, r.transport),
        }
    }
}

/// Limits and transport constraints applied while a list is populated.
///
/// Records for a transport no local address supports, and non-TLS records
/// when only secure results are acceptable, are dropped on insertion: the
/// transmitter must never select a transport it cannot use.
#[derive(Debug, Clone)]
pub struct ResolutionPolicy {
    /// Maximum number of elements kept per tier.
    pub max_elements: usize,
    /// Transports a local address is configured for.
    pub supported: Vec<Transport>,
    /// Accept only TLS results (sips target).
    pub secure_only: bool,
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self {
            max_elements: 16,
            supported: vec![Transport::Tcp, Transport::Tls],
            secure_only: false,
        }
    }
}

/// The ordered candidate set gathered while resolving one destination.
///
/// Four tiers are filled incrementally as DNS answers arrive: NAPTR records
/// sorted by `(order, preference)`, SRV and host records grouped by priority
/// with weighted random placement inside a group, and IP records in arrival
/// order. Candidates are consumed by popping the head of each tier.
#[derive(Clone)]
pub struct ResolutionList {
    policy: ResolutionPolicy,
    naptr: VecDeque<NaptrRecord>,
    srv: VecDeque<SrvRecord>,
    host: VecDeque<HostRecord>,
    ip: VecDeque<IpRecord>,
    used_srv: Option<SrvRecord>,
    used_host: Option<HostRecord>,
    enum_result: Option<String>,
    rng: StdRng,
}

impl fmt::Debug for ResolutionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionList")
            .field("naptr", &self.naptr.len())
            .field("srv", &self.srv.len())
            .field("host", &self.host.len())
            .field("ip", &self.ip.len())
            .finish()
    }
}

impl ResolutionList {
    pub fn new(policy: ResolutionPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// A list with a deterministic weighted-placement draw, for tests.
    pub fn with_seed(policy: ResolutionPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: ResolutionPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            naptr: VecDeque::new(),
            srv: VecDeque::new(),
            host: VecDeque::new(),
            ip: VecDeque::new(),
            used_srv: None,
            used_host: None,
            enum_result: None,
            rng,
        }
    }

    pub fn policy(&self) -> &ResolutionPolicy {
        &self.policy
    }

    fn transport_usable(&self, transport: Transport) -> bool {
        if self.policy.secure_only && transport != Transport::Tls {
            return false;
        }
        self.policy.supported.contains(&transport)
    }

    /// Dispatch a record to the tier it belongs to.
    pub fn push(&mut self, record: AddressRecord) -> Result<()> {
        match record {
            AddressRecord::Naptr(r) => self.push_naptr(r),
            AddressRecord::Srv(r) => self.push_srv(r),
            AddressRecord::Host(r) => self.push_host(r),
            AddressRecord::Ip(r) => self.push_ip(r),
        }
    }

    /// Insert a NAPTR record keeping the tier sorted ascending by
    /// `(order, preference)`. A record whose service cannot be used locally
    /// is dropped without error.
    pub fn push_naptr(&mut self, record: NaptrRecord) -> Result<()> {
        if !self.transport_usable(record.service) {
            debug!(
                "dropping NAPTR {} ord={} pref={}: transport {} not usable",
                record.replacement, record.order, record.preference, record.service
            );
            return Ok(());
        }
        if self.naptr.len() >= self.policy.max_elements {
            return Err(Error::CapacityExceeded(self.policy.max_elements));
        }
        debug!(
            "adding NAPTR {} proto={} ord={} pref={}",
            record.replacement, record.service, record.order, record.preference
        );
        // First record that is strictly less important goes after the new
        // one; equal (order, preference) keeps arrival order.
        let at = self
            .naptr
            .iter()
            .position(|e| {
                e.order > record.order
                    || (e.order == record.order && e.preference > record.preference)
            })
            .unwrap_or(self.naptr.len());
        self.naptr.insert(at, record);
        Ok(())
    }

    /// Insert an SRV record: ascending priority groups, weighted random
    /// placement inside the group of equal priority.
    pub fn push_srv(&mut self, record: SrvRecord) -> Result<()> {
        if self.srv.len() >= self.policy.max_elements {
            return Err(Error::CapacityExceeded(self.policy.max_elements));
        }
        debug!(
            "adding SRV {} port={} prio={} weight={}",
            record.target, record.port, record.priority, record.weight
        );
        let at = weighted_position(
            &mut self.rng,
            self.srv.iter().map(|e| (e.priority, e.weight)),
            record.priority,
            record.weight,
        );
        self.srv.insert(at, record);
        Ok(())
    }

    /// Insert a host record, same placement rules as [`push_srv`]. Records
    /// for transports unusable under the policy are dropped.
    ///
    /// [`push_srv`]: ResolutionList::push_srv
    pub fn push_host(&mut self, record: HostRecord) -> Result<()> {
        if !self.transport_usable(record.transport) {
            debug!(
                "dropping host {}: transport {} not usable",
                record.name, record.transport
            );
            return Ok(());
        }
        if self.host.len() >= self.policy.max_elements {
            return Err(Error::CapacityExceeded(self.policy.max_elements));
        }
        debug!(
            "adding host {} proto={} port={} prio={} weight={}",
            record.name, record.transport, record.port, record.priority, record.weight
        );
        let at = weighted_position(
            &mut self.rng,
            self.host.iter().map(|e| (e.priority, e.weight)),
            record.priority,
            record.weight,
        );
        self.host.insert(at, record);
        Ok(())
    }

    /// Append a resolved address. IP answers are consumed in arrival order,
    /// IPv4 and IPv6 may interleave.
    pub fn push_ip(&mut self, record: IpRecord) -> Result<()> {
        if !self.transport_usable(record.transport) {
            debug!(
                "dropping IP {}:{}: transport {} not usable",
                record.address, record.port, record.transport
            );
            return Ok(());
        }
        if self.ip.len() >= self.policy.max_elements {
            return Err(Error::CapacityExceeded(self.policy.max_elements));
        }
        debug!(
            "adding IP {}:{} proto={}",
            record.address, record.port, record.transport
        );
        self.ip.push_back(record);
        Ok(())
    }

    pub fn pop_naptr(&mut self) -> Option<NaptrRecord> {
        self.naptr.pop_front()
    }

    pub fn pop_srv(&mut self) -> Option<SrvRecord> {
        self.srv.pop_front()
    }

    pub fn pop_host(&mut self) -> Option<HostRecord> {
        self.host.pop_front()
    }

    pub fn pop_ip(&mut self) -> Option<IpRecord> {
        self.ip.pop_front()
    }

    /// Remember the SRV record that produced the IP entries currently being
    /// tried, so a failure can be reported against the exact record.
    pub fn record_used_srv(&mut self, record: &SrvRecord) {
        self.used_srv = Some(record.clone());
    }

    pub fn record_used_host(&mut self, record: &HostRecord) {
        self.used_host = Some(record.clone());
    }

    pub fn used_srv(&self) -> Option<&SrvRecord> {
        self.used_srv.as_ref()
    }

    pub fn used_host(&self) -> Option<&HostRecord> {
        self.used_host.as_ref()
    }

    /// The single ENUM/NAPTR regexp answer, orthogonal to the ordered tiers.
    pub fn set_enum_result(&mut self, regexp: &str) {
        debug!("setting enum result to {}", regexp);
        self.enum_result = Some(regexp.to_owned());
    }

    pub fn enum_result(&self) -> Option<&str> {
        self.enum_result.as_deref()
    }

    /// Number of elements per tier as `(srv, host, ip)`.
    pub fn entry_counts(&self) -> (usize, usize, usize) {
        (self.srv.len(), self.host.len(), self.ip.len())
    }

    /// Whether any candidate is left to try.
    pub fn can_continue(&self) -> bool {
        !self.naptr.is_empty() || !self.srv.is_empty() || !self.host.is_empty() || !self.ip.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.can_continue()
    }
}

/// Position for a new record in a priority/weight ordered tier.
///
/// Scan for the group of equal priority. Ahead of it (first element with a
/// bigger priority) the new record goes before that element. Inside the
/// group, draw uniformly from `[0, elem.weight + new.weight)` at each
/// position; a draw below the new weight places the record there, higher
/// weights therefore tend toward the front of the group. Past the group the
/// record is appended.
fn weighted_position<I>(rng: &mut StdRng, existing: I, priority: u16, weight: u32) -> usize
where
    I: Iterator<Item = (u16, u32)>,
{
    let mut len = 0;
    for (idx, (elem_priority, elem_weight)) in existing.enumerate() {
        len = idx + 1;
        if elem_priority > priority {
            return idx;
        }
        if elem_priority == priority {
            let span = u64::from(elem_weight) + u64::from(weight);
            let draw = if span == 0 { 0 } else { rng.gen_range(0..span) };
            if span != 0 && draw < u64::from(weight) {
                return idx;
            }
        }
    }
    len
}
