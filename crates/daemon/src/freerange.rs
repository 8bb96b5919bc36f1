/// Free-range detection
///
/// Scans the local routing table for private IPv4 ranges already in use
/// and returns one that does not collide, in CIDR form, or an empty string
/// on exhaustion. Hosts call this before configuring the tun interface.

use std::net::Ipv4Addr;
use tracing::debug;

/// Candidate /16 ranges tried in order
fn candidates() -> Vec<(Ipv4Addr, u8)> {
    let mut ranges = Vec::new();
    for second in (0u16..=255).step_by(16) {
        ranges.push((Ipv4Addr::new(10, second as u8, 0, 1), 16));
    }
    for second in 16u8..=31 {
        ranges.push((Ipv4Addr::new(172, second, 0, 1), 16));
    }
    ranges.push((Ipv4Addr::new(192, 168, 0, 1), 24));
    ranges
}

/// Pick a private IPv4 range not colliding with current routes
pub fn detect_free_range() -> String {
    let used = read_route_networks("/proc/net/route");
    detect_free_range_from(&used)
}

fn detect_free_range_from(used: &[(u32, u32)]) -> String {
    for (base, prefix) in candidates() {
        let base_value: u32 = base.into();
        let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let network = base_value & mask;

        let collides = used.iter().any(|(dest, dest_mask)| {
            let common = mask & *dest_mask;
            network & common == dest & common
        });
        if !collides {
            return format!("{}/{}", base, prefix);
        }
    }
    String::new()
}

/// Parse destination networks out of the kernel route table
fn read_route_networks(path: &str) -> Vec<(u32, u32)> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        debug!(path, "route table unreadable, assuming empty");
        return Vec::new();
    };

    let mut networks = Vec::new();
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        // /proc/net/route stores little-endian hex
        let Ok(dest) = u32::from_str_radix(fields[1], 16) else {
            continue;
        };
        let Ok(mask) = u32::from_str_radix(fields[7], 16) else {
            continue;
        };
        if mask == 0 {
            // default route matches everything, skip it
            continue;
        }
        networks.push((dest.swap_bytes(), mask.swap_bytes()));
    }
    networks
}
