//! Per-interface address pool and lease table.
//!
//! The pool owns both lease indexes (by hardware address and by IP) and
//! keeps them in agreement: every lease is present in both maps under
//! both of its keys, and no two leases share either key. Expired leases
//! are dropped lazily, on the lookup paths that would hand their address
//! out again.

use std::collections::HashMap;

use chrono::Utc;

use crate::addr::{HwAddr, Ipv4};
use crate::config::InterfaceConfig;

/// One address binding. `start_time == 0` marks a nonexistent lease in
/// the on-disk format and is never stored in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// Unix seconds at which the lease was (re)issued.
    pub start_time: i64,
    pub hw: HwAddr,
    pub ip: Ipv4,
}

impl Lease {
    pub fn is_valid(&self) -> bool {
        self.start_time != 0
    }
}

/// Netmask for a prefix length, host order.
pub fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    }
}

pub struct NetworkPool {
    network: u32,
    prefix: u8,
    router: Ipv4,
    server_id: Ipv4,
    first: Ipv4,
    last: Ipv4,
    dns_servers: Vec<Ipv4>,
    lease_time: u32,
    renewal_time: u32,
    rebinding_time: u32,
    reservation_by_hw: HashMap<HwAddr, Ipv4>,
    reservation_by_ip: HashMap<Ipv4, HwAddr>,
    by_hw: HashMap<HwAddr, Lease>,
    by_ip: HashMap<Ipv4, Lease>,
}

impl NetworkPool {
    /// Builds a pool from an interface configuration and previously
    /// persisted leases. Seed entries with a zero start time or an IP
    /// outside the currently allowed range are dropped.
    pub fn new(config: &InterfaceConfig, seed: &[Lease]) -> Self {
        let mut reservation_by_hw = HashMap::new();
        let mut reservation_by_ip = HashMap::new();
        for (&hw, &ip) in &config.reservations {
            reservation_by_hw.insert(hw, ip);
            reservation_by_ip.insert(ip, hw);
        }

        let mut pool = Self {
            network: config.network.0,
            prefix: config.prefix,
            router: config.routers,
            server_id: config.server_id,
            first: config.dhcp_first,
            last: config.dhcp_last,
            dns_servers: config.dns_servers.clone(),
            lease_time: config.lease_time,
            renewal_time: config.renewal_time,
            rebinding_time: config.rebinding_time,
            reservation_by_hw,
            reservation_by_ip,
            by_hw: HashMap::new(),
            by_ip: HashMap::new(),
        };

        for lease in seed {
            if lease.is_valid() && pool.is_admissible(lease.ip) {
                pool.by_hw.insert(lease.hw, *lease);
                pool.by_ip.insert(lease.ip, *lease);
            }
        }

        pool
    }

    pub fn server_id(&self) -> Ipv4 {
        self.server_id
    }

    pub fn router(&self) -> Ipv4 {
        self.router
    }

    pub fn dns_servers(&self) -> &[Ipv4] {
        &self.dns_servers
    }

    pub fn lease_time(&self) -> u32 {
        self.lease_time
    }

    pub fn renewal_time(&self) -> u32 {
        self.renewal_time
    }

    pub fn rebinding_time(&self) -> u32 {
        self.rebinding_time
    }

    pub fn subnet_mask(&self) -> Ipv4 {
        Ipv4(prefix_mask(self.prefix))
    }

    fn network_address(&self) -> u32 {
        self.network & prefix_mask(self.prefix)
    }

    pub fn broadcast(&self) -> Ipv4 {
        Ipv4(self.network_address() | !prefix_mask(self.prefix))
    }

    /// An IP is admissible when it is inside the CIDR, is neither the
    /// network nor the broadcast address, and lies within the configured
    /// allocation range.
    pub fn is_admissible(&self, ip: Ipv4) -> bool {
        let mask = prefix_mask(self.prefix);
        (ip.0 & mask) == self.network_address()
            && ip.0 != self.network_address()
            && ip != self.broadcast()
            && ip >= self.first
            && ip <= self.last
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    pub fn is_expired(&self, lease: &Lease) -> bool {
        if !lease.is_valid() {
            return true;
        }
        Self::now() - lease.start_time > i64::from(self.lease_time)
    }

    fn reserved_for_other(&self, ip: Ipv4, hw: HwAddr) -> bool {
        self.reservation_by_ip
            .get(&ip)
            .is_some_and(|&owner| owner != hw)
    }

    pub fn lookup_by_hw(&self, hw: HwAddr) -> Option<&Lease> {
        self.by_hw.get(&hw)
    }

    pub fn lookup_by_ip(&self, ip: Ipv4) -> Option<&Lease> {
        self.by_ip.get(&ip)
    }

    /// Snapshot of the current lease set, for persistence.
    pub fn all_leases(&self) -> Vec<Lease> {
        self.by_hw.values().copied().collect()
    }

    /// The address the pool would offer `hw` with no preference.
    pub fn available(&mut self, hw: HwAddr) -> Option<Ipv4> {
        self.available_with(hw, Ipv4::UNSPECIFIED)
    }

    /// The address the pool would offer `hw`, honoring `preferred` when
    /// possible. An existing valid lease for `hw` wins over the
    /// preference; a reservation for `hw` wins over the free scan.
    pub fn available_with(&mut self, hw: HwAddr, mut preferred: Ipv4) -> Option<Ipv4> {
        if !preferred.is_unspecified() {
            if !self.is_admissible(preferred) || self.reserved_for_other(preferred, hw) {
                preferred = Ipv4::UNSPECIFIED;
            } else if let Some(lease) = self.by_ip.get(&preferred).copied()
                && self.is_expired(&lease)
            {
                self.remove_by_ip(preferred);
            }
        }

        if let Some(lease) = self.by_hw.get(&hw).copied() {
            if self.is_expired(&lease) {
                self.remove_by_hw(hw);
            } else {
                return Some(lease.ip);
            }
        }

        if !preferred.is_unspecified() && !self.by_ip.contains_key(&preferred) {
            return Some(preferred);
        }

        if let Some(&reserved) = self.reservation_by_hw.get(&hw) {
            let held_by_other = self
                .by_ip
                .get(&reserved)
                .is_some_and(|lease| lease.hw != hw && !self.is_expired(lease));
            if !held_by_other {
                return Some(reserved);
            }
        }

        for candidate in self.first.0..=self.last.0 {
            let ip = Ipv4(candidate);
            if !self.is_admissible(ip) || self.reserved_for_other(ip, hw) {
                continue;
            }
            match self.by_ip.get(&ip) {
                None => return Some(ip),
                Some(lease) if self.is_expired(lease) => return Some(ip),
                Some(_) => {}
            }
        }

        None
    }

    /// Commits an allocation. Fails on an inadmissible address, an
    /// address reserved to someone else, or an unexpired lease held by a
    /// different client. A prior lease of `hw` on another address is
    /// removed, so the client never holds two.
    pub fn reserve(&mut self, hw: HwAddr, ip: Ipv4) -> bool {
        if !self.is_admissible(ip) || self.reserved_for_other(ip, hw) {
            return false;
        }

        if let Some(lease) = self.by_ip.get(&ip)
            && !self.is_expired(lease)
            && lease.hw != hw
        {
            return false;
        }

        if let Some(lease) = self.by_hw.get(&hw).copied()
            && lease.ip != ip
        {
            self.remove_by_hw(hw);
        }

        // An expired lease on this address by another client goes away
        // with both of its keys before the overwrite.
        if let Some(old) = self.by_ip.get(&ip).copied()
            && old.hw != hw
        {
            self.remove_by_ip(ip);
        }

        let lease = Lease {
            start_time: Self::now(),
            hw,
            ip,
        };
        self.by_hw.insert(hw, lease);
        self.by_ip.insert(ip, lease);
        true
    }

    /// Removes any lease on `ip`. Idempotent.
    pub fn release(&mut self, ip: Ipv4) {
        self.remove_by_ip(ip);
    }

    fn remove_by_hw(&mut self, hw: HwAddr) {
        if let Some(lease) = self.by_hw.remove(&hw) {
            self.by_ip.remove(&lease.ip);
        }
    }

    fn remove_by_ip(&mut self, ip: Ipv4) {
        if let Some(lease) = self.by_ip.remove(&ip) {
            self.by_hw.remove(&lease.hw);
        }
    }
}
