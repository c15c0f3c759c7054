// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Longest-prefix-match routing from IP networks to peers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};

/// A pair of binary radix tries, one per address family, keyed on
/// network-order prefix bits. Terminal nodes carry the bound value.
pub struct AllowedIps<D> {
    v4: Option<Box<Node<D>>>,
    v6: Option<Box<Node<D>>>,
}

struct Node<D> {
    data: Option<D>,
    child: [Option<Box<Node<D>>>; 2],
}

impl<D> Node<D> {
    fn new() -> Box<Node<D>> {
        Box::new(Node {
            data: None,
            child: [None, None],
        })
    }
}

/// Address bits left-aligned in a u128, plus the family's bit width.
fn key(ip: IpAddr) -> (u128, u8) {
    match ip {
        IpAddr::V4(ip) => ((ip.to_bits() as u128) << 96, 32),
        IpAddr::V6(ip) => (ip.to_bits(), 128),
    }
}

impl<D> AllowedIps<D> {
    pub fn new() -> AllowedIps<D> {
        AllowedIps { v4: None, v6: None }
    }

    fn root(&mut self, ip: IpAddr) -> &mut Option<Box<Node<D>>> {
        match ip {
            IpAddr::V4(_) => &mut self.v4,
            IpAddr::V6(_) => &mut self.v6,
        }
    }

    /// Bind `ip/cidr` to `data`. Re-inserting an existing prefix rebinds it.
    pub fn insert(&mut self, ip: IpAddr, cidr: u8, data: D) {
        let (bits, width) = key(ip);
        debug_assert!(cidr <= width);

        let mut node = self.root(ip).get_or_insert_with(Node::new);
        for i in 0..cidr.min(width) {
            let bit = (bits >> (127 - i)) & 1;
            node = node.child[bit as usize].get_or_insert_with(Node::new);
        }
        node.data = Some(data);
    }

    /// The value bound to the longest prefix covering `ip`, if any.
    pub fn find(&self, ip: IpAddr) -> Option<&D> {
        let (bits, width) = key(ip);
        let mut node = match ip {
            IpAddr::V4(_) => self.v4.as_deref()?,
            IpAddr::V6(_) => self.v6.as_deref()?,
        };

        let mut best = node.data.as_ref();
        for i in 0..width {
            let bit = (bits >> (127 - i)) & 1;
            match node.child[bit as usize].as_deref() {
                Some(next) => {
                    node = next;
                    best = node.data.as_ref().or(best);
                }
                None => break,
            }
        }
        best
    }

    /// Strip every binding matching `pred`, pruning emptied subtrees.
    pub fn remove(&mut self, pred: &impl Fn(&D) -> bool) {
        prune(&mut self.v4, pred);
        prune(&mut self.v6, pred);
    }

    pub fn clear(&mut self) {
        self.v4 = None;
        self.v6 = None;
    }

    /// Every binding together with the network it is bound at.
    pub fn iter(&self) -> impl Iterator<Item = (&D, IpNetwork)> {
        let mut out = Vec::new();
        collect(&self.v4, 0, 0, false, &mut out);
        collect(&self.v6, 0, 0, true, &mut out);
        out.into_iter()
    }
}

impl<D> Default for AllowedIps<D> {
    fn default() -> Self {
        AllowedIps::new()
    }
}

fn prune<D>(slot: &mut Option<Box<Node<D>>>, pred: &impl Fn(&D) -> bool) {
    if let Some(node) = slot {
        if node.data.as_ref().is_some_and(pred) {
            node.data = None;
        }
        for child in &mut node.child {
            prune(child, pred);
        }
        if node.data.is_none() && node.child.iter().all(Option::is_none) {
            *slot = None;
        }
    }
}

fn collect<'a, D>(
    slot: &'a Option<Box<Node<D>>>,
    bits: u128,
    depth: u8,
    v6: bool,
    out: &mut Vec<(&'a D, IpNetwork)>,
) {
    let Some(node) = slot else { return };

    if let Some(data) = &node.data {
        let network = if v6 {
            IpNetwork::V6(
                Ipv6Network::new(Ipv6Addr::from(bits), depth).expect("prefix within bounds"),
            )
        } else {
            IpNetwork::V4(
                Ipv4Network::new(Ipv4Addr::from((bits >> 96) as u32), depth)
                    .expect("prefix within bounds"),
            )
        };
        out.push((data, network));
    }

    for (bit, child) in node.child.iter().enumerate() {
        if child.is_some() {
            collect(
                child,
                bits | (bit as u128) << (127 - depth),
                depth + 1,
                v6,
                out,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().expect("address")
    }

    #[test]
    fn longest_prefix_wins() {
        let mut table = AllowedIps::new();
        table.insert(v4("10.0.0.0"), 8, "a");
        table.insert(v4("10.0.1.0"), 24, "b");

        assert_eq!(table.find(v4("10.0.1.5")), Some(&"b"));
        assert_eq!(table.find(v4("10.0.2.5")), Some(&"a"));
        assert_eq!(table.find(v4("11.0.0.1")), None);
    }

    #[test]
    fn overlapping_host_route_beats_subnet() {
        let mut table = AllowedIps::new();
        table.insert(v4("10.0.0.0"), 24, "subnet");
        table.insert(v4("10.0.0.7"), 32, "host");

        assert_eq!(table.find(v4("10.0.0.7")), Some(&"host"));
        assert_eq!(table.find(v4("10.0.0.8")), Some(&"subnet"));
    }

    #[test]
    fn reinsert_rebinds() {
        let mut table = AllowedIps::new();
        table.insert(v4("10.0.0.0"), 24, "first");
        table.insert(v4("10.0.0.0"), 24, "second");

        assert_eq!(table.find(v4("10.0.0.1")), Some(&"second"));
        assert_eq!(table.iter().count(), 1);
    }

    #[test]
    fn default_route_matches_everything() {
        let mut table = AllowedIps::new();
        table.insert(v4("0.0.0.0"), 0, "default");
        assert_eq!(table.find(v4("203.0.113.9")), Some(&"default"));
        assert_eq!(
            table.find("2001:db8::1".parse().expect("address")),
            None,
            "families do not leak into each other"
        );
    }

    #[test]
    fn remove_is_idempotent_and_prunes() {
        let mut table = AllowedIps::new();
        table.insert(v4("10.0.0.0"), 8, "a");
        table.insert(v4("10.0.1.0"), 24, "b");

        table.remove(&|d| *d == "b");
        assert_eq!(table.find(v4("10.0.1.5")), Some(&"a"));
        assert_eq!(table.iter().count(), 1);

        // removing again changes nothing
        table.remove(&|d| *d == "b");
        assert_eq!(table.iter().count(), 1);

        table.remove(&|d| *d == "a");
        assert_eq!(table.find(v4("10.0.0.1")), None);
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn iter_reconstructs_networks() {
        let mut table = AllowedIps::new();
        table.insert(v4("10.0.1.0"), 24, "b");
        table.insert("2001:db8::".parse().expect("address"), 32, "c");

        let nets: Vec<String> = table.iter().map(|(_, n)| n.to_string()).collect();
        assert!(nets.contains(&"10.0.1.0/24".to_owned()));
        assert!(nets.contains(&"2001:db8::/32".to_owned()));
    }

    #[test]
    fn v6_lookup() {
        let mut table = AllowedIps::new();
        table.insert("fd00::".parse().expect("address"), 8, "ula");
        table.insert("fd00:1234::".parse().expect("address"), 32, "site");

        assert_eq!(
            table.find("fd00:1234::17".parse().expect("address")),
            Some(&"site")
        );
        assert_eq!(
            table.find("fd00:9::1".parse().expect("address")),
            Some(&"ula")
        );

        // full-width host route
        table.insert("fd00:1234::17".parse().expect("address"), 128, "host");
        assert_eq!(
            table.find("fd00:1234::17".parse().expect("address")),
            Some(&"host")
        );
        let nets: Vec<String> = table.iter().map(|(_, n)| n.to_string()).collect();
        assert!(nets.contains(&"fd00:1234::17/128".to_owned()));
    }
}
