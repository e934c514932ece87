//! Membership indices for new nodes of a cluster, and hostname indices for
//! infrastructure hosts.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{AllocationError, AllocationResult};

/// Hands out unused membership indices of one cluster.
///
/// A probe pass takes indices with [`probe_next`](Self::probe_next) and then
/// forgets them with [`reset_probe`](Self::reset_probe), so a dry run hands
/// out the same indices as the real allocation that follows it.
#[derive(Debug, Clone)]
pub struct NodeIndices {
    used: BTreeSet<u32>,
    last: Option<u32>,
    probe: Option<u32>,
}

impl NodeIndices {
    /// Indices already taken by any node of the cluster, in any state.
    pub fn new(used: impl IntoIterator<Item = u32>) -> Self {
        Self {
            used: used.into_iter().collect(),
            last: None,
            probe: None,
        }
    }

    /// The next free index, without committing it.
    pub fn probe_next(&mut self) -> u32 {
        let start = self.probe.or(self.last).map_or(0, |i| i + 1);
        let next = self.first_free_from(start);
        self.probe = Some(next);
        next
    }

    /// Forget probed indices.
    pub fn reset_probe(&mut self) {
        self.probe = None;
    }

    /// The next free index. Fails while probed indices are outstanding.
    pub fn next(&mut self) -> AllocationResult<u32> {
        if self.probe.is_some() {
            return Err(AllocationError::IllegalRequest(
                "must commit or reset probed indices before taking the next index".to_string(),
            ));
        }
        let next = self.first_free_from(self.last.map_or(0, |i| i + 1));
        self.last = Some(next);
        Ok(next)
    }

    fn first_free_from(&self, mut index: u32) -> u32 {
        while self.used.contains(&index) {
            index += 1;
        }
        index
    }
}

static HOST_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]+(\d+)[a-z-]*\.").expect("host index pattern"));

/// The numeric index in an infrastructure hostname like `cfg3.example.com`.
pub fn host_index(hostname: &str) -> Option<u32> {
    HOST_INDEX
        .captures(hostname)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Up to `count` indices for new infrastructure hosts, filling gaps in
/// `existing_hostnames` starting at 1.
///
/// The index of `own_hostname` is dropped from the result, so a host that is
/// still bootstrapping never provisions itself. The result is then one short.
pub fn next_host_indices<'a>(
    existing_hostnames: impl IntoIterator<Item = &'a str>,
    own_hostname: Option<&str>,
    count: usize,
) -> Vec<u32> {
    let used: BTreeSet<u32> = existing_hostnames.into_iter().filter_map(host_index).collect();
    let own = own_hostname.and_then(host_index);
    (1..)
        .filter(|i| !used.contains(i))
        .take(count)
        .filter(|i| Some(*i) != own)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_skips_used_indices() {
        let mut indices = NodeIndices::new([0, 1, 3]);
        assert_eq!(indices.next().unwrap(), 2);
        assert_eq!(indices.next().unwrap(), 4);
        assert_eq!(indices.next().unwrap(), 5);
    }

    #[test]
    fn probe_then_reset_hands_out_same_indices() {
        let mut indices = NodeIndices::new([0]);
        assert_eq!(indices.probe_next(), 1);
        assert_eq!(indices.probe_next(), 2);
        indices.reset_probe();
        assert_eq!(indices.next().unwrap(), 1);
        assert_eq!(indices.next().unwrap(), 2);
    }

    #[test]
    fn next_fails_with_outstanding_probe() {
        let mut indices = NodeIndices::new(std::iter::empty());
        indices.probe_next();
        assert!(indices.next().is_err());
    }

    #[test]
    fn host_indices_fill_gaps() {
        assert_eq!(host_index("cfg12.example.com"), Some(12));
        assert_eq!(host_index("proxy3-ext.example.com"), Some(3));
        assert_eq!(host_index("no-digits.example.com"), None);

        let existing = ["cfg1.example.com", "cfg3.example.com", "cfg4.example.com"];
        assert_eq!(next_host_indices(existing, None, 3), vec![2, 5, 6]);
        assert_eq!(next_host_indices(existing, Some("cfg9.example.com"), 2), vec![2, 5]);
    }

    #[test]
    fn own_host_index_is_never_handed_out() {
        let existing = ["cfg2.example.com", "cfg3.example.com"];
        assert!(next_host_indices(existing, Some("cfg1.example.com"), 1).is_empty());
        assert_eq!(next_host_indices(existing, Some("cfg1.example.com"), 2), vec![4]);
        assert_eq!(next_host_indices([], Some("cfg2.example.com"), 3), vec![1, 3]);
    }
}
