//! Steal ring construction
//!
//! Every scheduler probes its peers in a fixed order when its own run queue
//! is empty. The order is a ring that starts with its neighbour and ends
//! with the scheduler itself; the neighbour is also the peer whose wake
//! descriptor it sleeps on.
//!
//! Without topology information scheduler `i` of `n` gets
//! `i+1, ..., n-1, 0, ..., i`. With a [`Topology`] the CPUs to use are
//! picked primary hyperthreads first, and each ring prefers peers on the
//! same socket before crossing to the next one.

use std::collections::{HashMap, VecDeque};

use crate::topology::Topology;

/// CPU assignment and steal ring for each scheduler of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealPlan {
    cpus: Vec<usize>,
    rings: Vec<Vec<usize>>,
}

impl StealPlan {
    /// Plain rotation order, scheduler `i` on CPU `i % num_cpus`.
    pub fn round_robin(num: usize, num_cpus: usize) -> Self {
        let num_cpus = num_cpus.max(1);
        Self {
            cpus: (0..num).map(|i| i % num_cpus).collect(),
            rings: (0..num).map(|i| rotated_ring(i, num)).collect(),
        }
    }

    /// Socket-aware order. Returns `None` if the topology has fewer CPUs
    /// than schedulers.
    pub fn from_topology(num: usize, topology: &Topology) -> Option<Self> {
        let sockets: Vec<Vec<usize>> = topology
            .by_socket()
            .into_iter()
            .map(|cpus| primaries_first(cpus, topology))
            .collect();

        let cpus = procs_to_use(num, &sockets)?;
        if cpus.len() < num {
            return None;
        }
        let sockets: Vec<Vec<usize>> = sockets
            .into_iter()
            .map(|socket| constrain_to(socket, &cpus))
            .filter(|socket| !socket.is_empty())
            .collect();

        let scheduler_of: HashMap<usize, usize> =
            cpus.iter().enumerate().map(|(i, &cpu)| (cpu, i)).collect();
        let rings = cpus
            .iter()
            .map(|&cpu| {
                let mut ring: Vec<usize> = steal_order(cpu, &sockets)?
                    .iter()
                    .filter_map(|c| scheduler_of.get(c).copied())
                    .collect();
                // The order starts with the scheduler itself; the ring ends with it.
                ring.rotate_left(1);
                Some(ring)
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Self { cpus, rings })
    }

    /// Number of schedulers planned for.
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    /// Whether the plan is for zero schedulers.
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// CPU scheduler `index` should be bound to.
    pub fn cpu(&self, index: usize) -> usize {
        self.cpus[index]
    }

    /// Steal ring of scheduler `index`, as scheduler indices.
    pub fn ring(&self, index: usize) -> &[usize] {
        &self.rings[index]
    }
}

/// `index+1, ..., n-1, 0, ..., index`.
pub fn rotated_ring(index: usize, n: usize) -> Vec<usize> {
    (index + 1..n).chain(0..=index.min(n.saturating_sub(1))).collect()
}

/// Reorder the CPUs of one socket so that hyperthread siblings come after
/// every primary thread.
fn primaries_first(cpus: Vec<usize>, topology: &Topology) -> Vec<usize> {
    let mut remaining: VecDeque<usize> = cpus.into();
    let mut primaries = Vec::new();
    let mut secondaries = Vec::new();
    while let Some(cpu) = remaining.pop_front() {
        primaries.push(cpu);
        for sibling in topology.siblings(cpu) {
            if let Some(pos) = remaining.iter().position(|&c| c == sibling) {
                remaining.remove(pos);
                secondaries.push(sibling);
            }
        }
    }
    primaries.extend(secondaries);
    primaries
}

/// The order in which the scheduler on `cpu` probes CPUs, starting with
/// `cpu` itself.
///
/// Every socket list is rotated by `cpu`'s position within its own socket
/// so peers at the same offset line up. The last CPU of a socket probes one
/// CPU of the next socket before the rest of its own, which spreads
/// cross-socket traffic over the socket's members.
fn steal_order(cpu: usize, sockets: &[Vec<usize>]) -> Option<Vec<usize>> {
    let (socket, pos) = sockets.iter().enumerate().find_map(|(s, cpus)| {
        cpus.iter().position(|&c| c == cpu).map(|p| (s, p))
    })?;
    let cross_socket_first = pos + 1 == sockets[socket].len();

    let mut lists: Vec<VecDeque<usize>> = sockets[socket..]
        .iter()
        .chain(&sockets[..socket])
        .map(|cpus| {
            let mut list: VecDeque<usize> = cpus.iter().copied().collect();
            if !list.is_empty() {
                let shift = pos % list.len();
                list.rotate_left(shift);
            }
            list
        })
        .collect();

    let mut order = Vec::new();
    if cross_socket_first {
        order.extend(lists[0].pop_front());
        if let Some(next) = lists.get_mut(1) {
            let pick = if next.len() > 1 { 1 } else { 0 };
            order.extend(next.remove(pick));
        }
    }
    for list in lists {
        order.extend(list);
    }
    Some(order)
}

/// The first `num` CPUs of the steal order of the machine's first CPU.
fn procs_to_use(num: usize, sockets: &[Vec<usize>]) -> Option<Vec<usize>> {
    let first = *sockets.first()?.first()?;
    let mut order = steal_order(first, sockets)?;
    order.truncate(num);
    Some(order)
}

fn constrain_to(cpus: Vec<usize>, keep: &[usize]) -> Vec<usize> {
    cpus.into_iter().filter(|c| keep.contains(c)).collect()
}
