use crate::transport::dns::{
    AddressRecord, HostRecord, IpRecord, NaptrRecord, ResolutionList, ResolutionPolicy, SrvRecord,
};
use crate::Error;
use rsip::transport::Transport;

fn naptr(order: u16, preference: u16, replacement: &str) -> NaptrRecord {
    NaptrRecord {
        order,
        preference,
        service: Transport::Tcp,
        replacement: replacement.to_string(),
    }
}

fn srv(priority: u16, weight: u32, target: &str) -> SrvRecord {
    SrvRecord {
        priority,
        weight,
        port: 5060,
        target: target.to_string(),
    }
}

fn ip(last_octet: u8) -> IpRecord {
    IpRecord {
        transport: Transport::Tcp,
        port: 5060,
        address: format!("10.0.0.{}", last_octet).parse().unwrap(),
    }
}

#[test]
fn test_naptr_strict_order() {
    let mut list = ResolutionList::with_seed(ResolutionPolicy::default(), 7);
    for (order, pref) in [(20, 1), (10, 5), (10, 1), (30, 0), (10, 5), (20, 0)] {
        list.push_naptr(naptr(order, pref, "host.example.com"))
            .expect("push naptr");
    }

    let mut last = (0u16, 0u16);
    while let Some(record) = list.pop_naptr() {
        let current = (record.order, record.preference);
        assert!(
            current >= last,
            "NAPTR order violated: {:?} after {:?}",
            current,
            last
        );
        last = current;
    }
}

#[test]
fn test_naptr_scenario_pop_order() {
    let mut list = ResolutionList::with_seed(ResolutionPolicy::default(), 1);
    list.push_naptr(naptr(10, 1, "x")).expect("push x");
    list.push_naptr(naptr(5, 9, "y")).expect("push y");

    assert_eq!(list.pop_naptr().expect("first").replacement, "y");
    assert_eq!(list.pop_naptr().expect("second").replacement, "x");
    assert!(list.pop_naptr().is_none());
}

#[test]
fn test_srv_priority_scenario_pop_order() {
    let mut list = ResolutionList::with_seed(ResolutionPolicy::default(), 1);
    list.push_srv(srv(10, 0, "a")).expect("push a");
    list.push_srv(srv(5, 0, "b")).expect("push b");

    assert_eq!(list.pop_srv().expect("first").target, "b");
    assert_eq!(list.pop_srv().expect("second").target, "a");
    assert!(list.pop_srv().is_none());
}

#[test]
fn test_srv_lower_priority_group_always_first() {
    for seed in 0..64 {
        let mut list = ResolutionList::with_seed(ResolutionPolicy::default(), seed);
        list.push_srv(srv(20, 100, "low1")).expect("push");
        list.push_srv(srv(5, 1, "high")).expect("push");
        list.push_srv(srv(20, 100, "low2")).expect("push");
        assert_eq!(list.pop_srv().expect("head").target, "high");
    }
}

/// Repeated draws at the same priority approximate weight-proportional
/// head placement, per RFC 2782 semantics.
#[test]
fn test_srv_weighted_head_distribution() {
    let rounds = 2000u32;
    let mut heavy_first = 0u32;
    for seed in 0..rounds {
        let mut list = ResolutionList::with_seed(ResolutionPolicy::default(), seed as u64);
        list.push_srv(srv(1, 1, "light")).expect("push light");
        list.push_srv(srv(1, 3, "heavy")).expect("push heavy");
        if list.pop_srv().expect("head").target == "heavy" {
            heavy_first += 1;
        }
    }
    // expectation is 3/4; allow a generous band for 2000 samples
    let ratio = f64::from(heavy_first) / f64::from(rounds);
    assert!(
        (0.70..0.80).contains(&ratio),
        "heavy-first ratio {} out of expected band",
        ratio
    );
}

#[test]
fn test_zero_weight_keeps_arrival_order_within_group() {
    let mut list = ResolutionList::with_seed(ResolutionPolicy::default(), 3);
    list.push_srv(srv(1, 0, "first")).expect("push");
    list.push_srv(srv(1, 0, "second")).expect("push");
    assert_eq!(list.pop_srv().expect("head").target, "first");
    assert_eq!(list.pop_srv().expect("next").target, "second");
}

#[test]
fn test_capacity_cap_per_tier() {
    let policy = ResolutionPolicy {
        max_elements: 4,
        ..Default::default()
    };
    let mut list = ResolutionList::with_seed(policy, 2);
    for i in 0..4 {
        list.push_ip(ip(i)).expect("push within cap");
    }
    assert_eq!(
        list.push_ip(ip(9)),
        Err(Error::CapacityExceeded(4)),
        "push past the cap must fail"
    );
    assert_eq!(list.entry_counts(), (0, 0, 4));

    // the srv tier has its own cap
    for i in 0..4 {
        list.push_srv(srv(1, 0, &format!("t{}", i))).expect("push");
    }
    assert_eq!(list.push_srv(srv(1, 0, "t9")), Err(Error::CapacityExceeded(4)));
    assert_eq!(list.entry_counts(), (4, 0, 4));
}

#[test]
fn test_clone_is_independent() {
    let mut list = ResolutionList::with_seed(ResolutionPolicy::default(), 5);
    list.push_naptr(naptr(1, 1, "n")).expect("push");
    list.push_srv(srv(1, 0, "s")).expect("push");
    list.push_host(HostRecord {
        priority: 1,
        weight: 0,
        port: 5060,
        transport: Transport::Tcp,
        name: "h".into(),
    })
    .expect("push");
    list.push_ip(ip(1)).expect("push");
    list.push_ip(ip(2)).expect("push");

    let mut clone = list.clone();
    while clone.pop_ip().is_some() {}
    while clone.pop_srv().is_some() {}
    while clone.pop_host().is_some() {}
    while clone.pop_naptr().is_some() {}
    assert!(!clone.can_continue());

    assert_eq!(list.entry_counts(), (1, 1, 2));
    assert!(list.can_continue());
    assert_eq!(list.pop_naptr().expect("naptr intact").replacement, "n");
}

#[test]
fn test_unsupported_transport_is_dropped_silently() {
    let mut list = ResolutionList::with_seed(ResolutionPolicy::default(), 1);
    let record = NaptrRecord {
        order: 1,
        preference: 1,
        service: Transport::Udp,
        replacement: "udp-only.example.com".into(),
    };
    // supported transports are TCP and TLS; UDP is not an error, just gone
    list.push_naptr(record).expect("drop is not an error");
    assert!(list.pop_naptr().is_none());
}

#[test]
fn test_secure_only_drops_plain_records() {
    let policy = ResolutionPolicy {
        secure_only: true,
        ..Default::default()
    };
    let mut list = ResolutionList::with_seed(policy, 1);
    list.push_host(HostRecord {
        priority: 1,
        weight: 0,
        port: 5060,
        transport: Transport::Tcp,
        name: "plain.example.com".into(),
    })
    .expect("drop is not an error");
    list.push_host(HostRecord {
        priority: 1,
        weight: 0,
        port: 5061,
        transport: Transport::Tls,
        name: "secure.example.com".into(),
    })
    .expect("push tls");

    assert_eq!(list.entry_counts(), (0, 1, 0));
    assert_eq!(list.pop_host().expect("head").name, "secure.example.com");
}

#[test]
fn test_ip_tier_keeps_arrival_order() {
    let mut list = ResolutionList::with_seed(ResolutionPolicy::default(), 1);
    list.push_ip(ip(3)).expect("push");
    list.push_ip(IpRecord {
        transport: Transport::Tcp,
        port: 5060,
        address: "2001:db8::1".parse().unwrap(),
    })
    .expect("push v6");
    list.push_ip(ip(1)).expect("push");

    assert_eq!(list.pop_ip().expect("1st").address.to_string(), "10.0.0.3");
    assert_eq!(
        list.pop_ip().expect("2nd").address.to_string(),
        "2001:db8::1"
    );
    assert_eq!(list.pop_ip().expect("3rd").address.to_string(), "10.0.0.1");
}

#[test]
fn test_used_records_and_enum_result() {
    let mut list = ResolutionList::with_seed(ResolutionPolicy::default(), 1);
    assert!(list.used_srv().is_none());
    assert!(list.enum_result().is_none());

    let record = srv(1, 0, "sip.example.com");
    list.record_used_srv(&record);
    assert_eq!(list.used_srv().expect("memo").target, "sip.example.com");

    list.set_enum_result("!^.*$!sip:info@example.com!");
    assert_eq!(
        list.enum_result().expect("enum"),
        "!^.*$!sip:info@example.com!"
    );
}

#[test]
fn test_push_dispatch_by_variant() {
    let mut list = ResolutionList::with_seed(ResolutionPolicy::default(), 1);
    list.push(AddressRecord::Srv(srv(1, 0, "a"))).expect("push");
    list.push(AddressRecord::Ip(ip(1))).expect("push");
    assert_eq!(list.entry_counts(), (1, 0, 1));
}
