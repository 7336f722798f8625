use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::prefix::Prefix;

/// Computes the union of `input`, collapsing adjacent prefixes into a
/// shorter one and dropping prefixes already covered by another. IPv6
/// results are returned before IPv4 ones; within a family results are in
/// ascending address order.
pub fn summarise(input: &[Prefix]) -> Vec<Prefix> {
    let mut out = summarise_family(input, true);
    out.extend(summarise_family(input, false));
    out
}

/// A point in the address space of one family, with an overflow bit standing
/// for "one past the top of the address space" — the sentinel needed so the
/// all-ones prefix (`0.0.0.0/0`, `::/0`) has a representable upper bound.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Bound {
    value: u128,
    overflow: bool,
}

impl PartialOrd for Bound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Bound {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.overflow, other.overflow) {
            (false, false) => self.value.cmp(&other.value),
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
        }
    }
}

impl Bound {
    fn lower(addr: u128, len: u8, width: u8) -> Self {
        Bound { value: mask_value(addr, len, width), overflow: false }
    }

    fn upper(addr: u128, len: u8, width: u8) -> Self {
        let base = mask_value(addr, len, width);
        let host_bits = width - len;
        let span: u128 = if host_bits == 0 { 0 } else { (1u128 << host_bits) - 1 };
        let top = base | span;
        let full: u128 = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
        if top == full {
            Bound { value: 0, overflow: true }
        } else {
            Bound { value: top + 1, overflow: false }
        }
    }
}

fn mask_value(addr: u128, len: u8, width: u8) -> u128 {
    if len == 0 {
        0
    } else if len >= width {
        addr
    } else {
        let shift = width - len;
        (addr >> shift) << shift
    }
}

struct Marker {
    bound: Bound,
    is_upper: bool,
}

fn summarise_family(input: &[Prefix], ipv6: bool) -> Vec<Prefix> {
    let width: u8 = if ipv6 { 128 } else { 32 };

    let mut markers: Vec<Marker> = Vec::new();
    for p in input {
        if p.is_ipv6() != ipv6 {
            continue;
        }
        let addr = to_value(p.address());
        markers.push(Marker { bound: Bound::lower(addr, p.len(), width), is_upper: false });
        markers.push(Marker { bound: Bound::upper(addr, p.len(), width), is_upper: true });
    }

    markers.sort_by(|a, b| match a.bound.cmp(&b.bound) {
        Ordering::Equal => a.is_upper.cmp(&b.is_upper),
        other => other,
    });

    let mut results = Vec::new();
    let mut depth: i32 = 0;
    let mut start = Bound { value: 0, overflow: false };
    for m in &markers {
        if depth == 0 {
            start = m.bound;
        }
        depth += if m.is_upper { -1 } else { 1 };
        if depth == 0 {
            split_run(start, m.bound, width, ipv6, &mut results);
        }
    }
    results
}

/// Splits the half-open range `[start, stop)` into the fewest aligned
/// prefixes that cover it exactly, picking the broadest (shortest) prefix
/// that fits at each step.
fn split_run(mut start: Bound, stop: Bound, width: u8, ipv6: bool, out: &mut Vec<Prefix>) {
    loop {
        if start >= stop {
            break;
        }
        let mut advanced = false;
        for len in 0..=width {
            let lower = Bound::lower(start.value, len, width);
            let upper = Bound::upper(start.value, len, width);
            if lower == start && upper <= stop {
                out.push(Prefix::new(from_value(lower.value, ipv6), len).expect("len <= width"));
                start = upper;
                advanced = true;
                break;
            }
        }
        debug_assert!(advanced, "no aligned prefix fit the remaining range");
        if !advanced {
            break;
        }
    }
}

fn to_value(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(a) as u128,
        IpAddr::V6(a) => u128::from(a),
    }
}

fn from_value(value: u128, ipv6: bool) -> IpAddr {
    if ipv6 {
        IpAddr::V6(Ipv6Addr::from(value))
    } else {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    #[test]
    fn collapses_adjacent_prefixes() {
        let input = [
            p("192.168.1.0/24"),
            p("192.168.2.0/24"),
            p("192.168.3.0/24"),
            p("192.168.4.0/24"),
            p("2001:db8:0:1::/64"),
            p("2001:db8:0:2::/64"),
            p("2001:db8:0:3::/64"),
            p("2001:db8:0:4::/64"),
        ];

        let expected = [
            p("2001:db8:0:1::/64"),
            p("2001:db8:0:2::/63"),
            p("2001:db8:0:4::/64"),
            p("192.168.1.0/24"),
            p("192.168.2.0/23"),
            p("192.168.4.0/24"),
        ];

        assert_eq!(summarise(&input), expected);
    }

    #[test]
    fn drops_prefixes_covered_by_a_broader_one() {
        let input = [
            p("192.168.1.0/16"),
            p("192.168.2.0/24"),
            p("192.168.3.0/24"),
            p("192.168.4.0/24"),
            p("2001:db8:0:1::/48"),
            p("2001:db8:0:2::/64"),
            p("2001:db8:0:3::/64"),
            p("2001:db8:0:4::/64"),
        ];

        let expected = [p("2001:db8::/48"), p("192.168.0.0/16")];

        assert_eq!(summarise(&input), expected);
    }

    #[test]
    fn full_address_space_round_trips_to_the_default_route() {
        let input = [
            p("128.0.0.1/1"),
            p("0.0.0.0/1"),
            p("4000::/2"),
            p("::/2"),
            p("4000::/1"),
            p("8000::/2"),
            p("c000::/2"),
        ];

        let expected = [p("::/0"), p("0.0.0.0/0")];

        assert_eq!(summarise(&input), expected);
    }

    #[test]
    fn ipv4_mapped_ipv6_never_merges_with_ipv4() {
        let input = [
            p("192.168.0.0/16"),
            p("::ffff:192.168.0.0/120"),
            p("::ffff:192.168.1.0/120"),
        ];

        let expected = [p("::ffff:192.168.0.0/119"), p("192.168.0.0/16")];

        assert_eq!(summarise(&input), expected);
    }

    #[test]
    fn single_host_prefixes_summarise_without_looping() {
        let input = [p("10.0.0.1/32"), p("10.0.0.2/32")];
        let expected = [p("10.0.0.1/32"), p("10.0.0.2/32")];
        assert_eq!(summarise(&input), expected);

        let adjacent = [p("10.0.0.0/32"), p("10.0.0.1/32")];
        assert_eq!(summarise(&adjacent), [p("10.0.0.0/31")]);
    }

    #[test]
    fn empty_input_summarises_to_nothing() {
        assert!(summarise(&[]).is_empty());
    }

    #[test]
    fn summarise_is_idempotent() {
        let input = [p("10.0.0.0/24"), p("10.0.1.0/24"), p("2001:db8::/32")];
        let once = summarise(&input);
        let twice = summarise(&once);
        assert_eq!(once, twice);
    }

    /// `(addr, len)` pairs into the IPv4 half-open range they denote.
    fn v4_range(addr: u32, len: u8) -> (u64, u64) {
        let len = len.min(32);
        let host_bits = 32 - len;
        let base = if len == 0 { 0 } else { (addr >> host_bits) << host_bits };
        let span: u64 = if host_bits == 0 { 0 } else { (1u64 << host_bits) - 1 };
        (base as u64, base as u64 + span + 1)
    }

    fn merge(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
        ranges.sort_unstable();
        let mut out: Vec<(u64, u64)> = Vec::new();
        for (lo, hi) in ranges {
            match out.last_mut() {
                Some(last) if lo <= last.1 => last.1 = last.1.max(hi),
                _ => out.push((lo, hi)),
            }
        }
        out
    }

    #[test]
    fn summarise_preserves_coverage_and_is_non_overlapping() {
        bolero::check!().with_type().cloned().for_each(|raw: Vec<(u32, u8)>| {
            let input: Vec<Prefix> = raw
                .iter()
                .map(|(addr, len)| Prefix::new(IpAddr::V4(Ipv4Addr::from(*addr)), len % 33).unwrap())
                .collect();
            if input.is_empty() {
                return;
            }

            let output: Vec<Prefix> =
                summarise(&input).into_iter().filter(|p| !p.is_ipv6()).collect();

            for (i, a) in output.iter().enumerate() {
                let a_range = v4_range(match a.address() {
                    IpAddr::V4(addr) => addr.into(),
                    IpAddr::V6(_) => unreachable!(),
                }, a.len());
                for b in &output[i + 1..] {
                    let b_range = v4_range(match b.address() {
                        IpAddr::V4(addr) => addr.into(),
                        IpAddr::V6(_) => unreachable!(),
                    }, b.len());
                    assert!(
                        a_range.1 <= b_range.0 || b_range.1 <= a_range.0,
                        "{a} and {b} overlap"
                    );
                }
            }

            let input_ranges: Vec<(u64, u64)> = input
                .iter()
                .map(|p| match p.address() {
                    IpAddr::V4(addr) => v4_range(addr.into(), p.len()),
                    IpAddr::V6(_) => unreachable!(),
                })
                .collect();
            let output_ranges: Vec<(u64, u64)> = output
                .iter()
                .map(|p| match p.address() {
                    IpAddr::V4(addr) => v4_range(addr.into(), p.len()),
                    IpAddr::V6(_) => unreachable!(),
                })
                .collect();
            assert_eq!(merge(input_ranges), merge(output_ranges));
        });
    }
}
