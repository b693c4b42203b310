//! # Subdomain Allocator
//!
//! Produces short, opaque, collision-free subdomains for newly-registered
//! tunnels.

use rand::Rng;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Fixed subdomain length. 12 lowercase-alphanumeric characters give
/// negligible collision probability at the concurrent-tunnel counts this
/// system is expected to run at.
pub const SUBDOMAIN_LEN: usize = 12;

fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..SUBDOMAIN_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Generates a fresh subdomain, retrying for as long as `exists` reports
/// the candidate is already live in the registry.
pub fn allocate(exists: impl Fn(&str) -> bool) -> String {
    loop {
        let candidate = generate();
        if !exists(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashSet;

    #[test]
    fn generates_correct_length_and_alphabet() {
        let s = generate();
        assert_eq!(s.len(), SUBDOMAIN_LEN);
        assert!(s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn retries_on_collision() {
        let forced_once = Cell::new(false);
        let sub = allocate(|_| {
            if !forced_once.get() {
                forced_once.set(true);
                true
            } else {
                false
            }
        });
        assert_eq!(sub.len(), SUBDOMAIN_LEN);
        assert!(forced_once.get());
    }

    #[test]
    fn many_allocations_are_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let sub = allocate(|s| seen.contains(s));
            seen.insert(sub);
        }
        assert_eq!(seen.len(), 200);
    }
}
