//! Traffic class, queue and socket-priority allocation for one interface.
//!
//! Every scheduled stream gets three resources: a socket priority the
//! application stamps on its traffic, a traffic class whose gate the
//! schedule opens, and a hardware Tx queue feeding that class. Traffic class
//! 0 on queue 0 stays behind as the shared best-effort class and collects
//! every socket priority no scheduled stream claimed.
//!
//! Like the scheduler, [`Mapping::assign`] is pure: the caller gets back the
//! mapping as it would look with the allocation made and commits it only
//! after the system configuration succeeded.

use serde::Serialize;

use crate::AdmissionError;
use crate::scheduler::BEST_EFFORT_TC;

/// Lowest socket priority handed to scheduled streams.
///
/// Priorities below stay mapped to the best-effort class, so an application
/// that never asked for a slot cannot accidentally select a gated queue.
pub const SCHEDULED_PRIORITY_FLOOR: u8 = 7;

/// Linux socket priorities covered by the qdisc priority map.
pub const PRIORITY_MAP_LEN: usize = 16;

/// Traffic classes the queueing discipline can distinguish.
pub const MAX_TRAFFIC_CLASSES: u8 = 16;

/// The resources handed to one admitted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allocation {
    /// Assigned traffic class
    pub tc: u8,
    /// Hardware Tx queue feeding the class
    pub queue: u8,
    /// Socket priority the application uses
    pub socket_priority: u8,
    /// PCP stamped on frames sent with that priority
    pub pcp: u8,
}

/// Resource state of one interface.
///
/// # Examples
///
/// ```rust
/// use detd::Mapping;
///
/// let mapping = Mapping::new(8);
/// let (mapping, allocation) = mapping.assign(6).unwrap();
/// assert_eq!(allocation.tc, 1);
/// assert_eq!(allocation.queue, 7);
/// assert_eq!(allocation.socket_priority, 7);
/// assert_eq!(mapping.prio_to_tc()[7], 1);
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Mapping {
    num_queues: u8,
    /// Free traffic classes, ascending from 1
    free_tcs: Vec<u8>,
    /// Free Tx queues, descending so high-index queues carry scheduled traffic
    free_queues: Vec<u8>,
    /// Free socket priorities, ascending from the scheduled floor
    free_priorities: Vec<u8>,
    assigned: Vec<Allocation>,
}

impl Mapping {
    /// A fresh mapping for a device with `num_queues` Tx queues.
    pub fn new(num_queues: u8) -> Self {
        Mapping {
            num_queues,
            free_tcs: (BEST_EFFORT_TC + 1..MAX_TRAFFIC_CLASSES).collect(),
            free_queues: (0..num_queues).rev().collect(),
            free_priorities: (SCHEDULED_PRIORITY_FLOOR..PRIORITY_MAP_LEN as u8).collect(),
            assigned: Vec::new(),
        }
    }

    /// Allocates `(tc, queue, socket_priority)` for a new scheduled stream
    /// with the given PCP.
    ///
    /// Returns the mapping as it would look after the allocation together
    /// with the allocation itself; `self` is untouched.
    ///
    /// # Errors
    ///
    /// [`AdmissionError::NoCapacity`] naming whichever resource ran out
    /// first.
    pub fn assign(&self, pcp: u8) -> Result<(Mapping, Allocation), AdmissionError> {
        let mut next = self.clone();
        let tc = take_first(&mut next.free_tcs, "traffic classes")?;
        let queue = take_first(&mut next.free_queues, "tx queues")?;
        let socket_priority = take_first(&mut next.free_priorities, "socket priorities")?;
        let allocation = Allocation {
            tc,
            queue,
            socket_priority,
            pcp,
        };
        next.assigned.push(allocation);
        Ok((next, allocation))
    }

    /// Number of traffic classes the qdisc must be configured with.
    pub fn num_tc(&self) -> u8 {
        self.assigned
            .iter()
            .map(|a| a.tc + 1)
            .max()
            .unwrap_or(BEST_EFFORT_TC + 1)
    }

    /// The 16-entry socket-priority to traffic-class map.
    ///
    /// Total by construction: every priority not claimed by a scheduled
    /// stream maps to the best-effort class.
    pub fn prio_to_tc(&self) -> [u8; PRIORITY_MAP_LEN] {
        let mut map = [BEST_EFFORT_TC; PRIORITY_MAP_LEN];
        for allocation in &self.assigned {
            map[allocation.socket_priority as usize] = allocation.tc;
        }
        map
    }

    /// Per-class queue assignment as `(count, offset)` pairs, one entry per
    /// traffic class in class order.
    pub fn queues(&self) -> Vec<(u8, u8)> {
        (0..self.num_tc())
            .map(|tc| {
                let queue = if tc == BEST_EFFORT_TC {
                    0
                } else {
                    self.assigned
                        .iter()
                        .find(|a| a.tc == tc)
                        .map(|a| a.queue)
                        .unwrap_or(0)
                };
                (1, queue)
            })
            .collect()
    }

    /// The VLAN egress `socket_priority:pcp` map of the scheduled streams.
    pub fn egress_qos_map(&self) -> Vec<(u8, u8)> {
        self.assigned
            .iter()
            .map(|a| (a.socket_priority, a.pcp))
            .collect()
    }

    /// PCP stamped on frames sent with the given socket priority.
    pub fn pcp_egress(&self, socket_priority: u8) -> u8 {
        self.assigned
            .iter()
            .find(|a| a.socket_priority == socket_priority)
            .map(|a| a.pcp)
            .unwrap_or(0)
    }

    /// Allocations made so far, in admission order.
    pub fn assigned(&self) -> &[Allocation] {
        &self.assigned
    }
}

fn take_first(pool: &mut Vec<u8>, resource: &str) -> Result<u8, AdmissionError> {
    if pool.is_empty() {
        return Err(AdmissionError::NoCapacity {
            resource: resource.to_string(),
        });
    }
    Ok(pool.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_takes_tc1_high_queue_priority7() {
        let (mapping, allocation) = Mapping::new(8).assign(6).unwrap();
        assert_eq!(
            allocation,
            Allocation {
                tc: 1,
                queue: 7,
                socket_priority: 7,
                pcp: 6
            }
        );
        assert_eq!(mapping.num_tc(), 2);

        let mut expected = [0u8; 16];
        expected[7] = 1;
        assert_eq!(mapping.prio_to_tc(), expected);
        assert_eq!(mapping.queues(), vec![(1, 0), (1, 7)]);
        assert_eq!(mapping.egress_qos_map(), vec![(7, 6)]);
        assert_eq!(mapping.pcp_egress(7), 6);
        assert_eq!(mapping.pcp_egress(0), 0);
    }

    #[test]
    fn allocations_descend_queues_and_ascend_classes() {
        let mapping = Mapping::new(8);
        let (mapping, a1) = mapping.assign(6).unwrap();
        let (mapping, a2) = mapping.assign(5).unwrap();
        let (mapping, a3) = mapping.assign(4).unwrap();

        assert_eq!((a1.tc, a1.queue, a1.socket_priority), (1, 7, 7));
        assert_eq!((a2.tc, a2.queue, a2.socket_priority), (2, 6, 8));
        assert_eq!((a3.tc, a3.queue, a3.socket_priority), (3, 5, 9));
        assert_eq!(mapping.num_tc(), 4);
        assert_eq!(mapping.queues(), vec![(1, 0), (1, 7), (1, 6), (1, 5)]);

        // Scheduled classes sit on pairwise distinct queues
        let queues: Vec<u8> = mapping.assigned().iter().map(|a| a.queue).collect();
        let mut deduped = queues.clone();
        deduped.dedup();
        assert_eq!(queues, deduped);
    }

    #[test]
    fn priority_map_stays_total() {
        let mut mapping = Mapping::new(8);
        for pcp in [6, 5, 4] {
            let (next, _) = mapping.assign(pcp).unwrap();
            mapping = next;
        }
        let map = mapping.prio_to_tc();
        assert_eq!(map.len(), PRIORITY_MAP_LEN);
        // Unclaimed priorities fall through to best effort
        for prio in 0..7 {
            assert_eq!(map[prio], BEST_EFFORT_TC);
        }
        assert_eq!(&map[7..10], &[1, 2, 3]);
    }

    #[test]
    fn ninth_allocation_on_eight_queues_fails() {
        let mut mapping = Mapping::new(8);
        for i in 0..8 {
            let (next, allocation) = mapping.assign(6).expect("allocation within capacity");
            assert_eq!(allocation.queue, 7 - i);
            mapping = next;
        }
        let err = mapping.assign(6).unwrap_err();
        assert_eq!(
            err,
            AdmissionError::NoCapacity {
                resource: "tx queues".to_string()
            }
        );
        // The failed call did not disturb the committed state
        assert_eq!(mapping.assigned().len(), 8);
    }

    #[test]
    fn four_queue_device_exhausts_earlier() {
        let mut mapping = Mapping::new(4);
        for _ in 0..4 {
            let (next, _) = mapping.assign(6).unwrap();
            mapping = next;
        }
        assert!(matches!(
            mapping.assign(6),
            Err(AdmissionError::NoCapacity { .. })
        ));
    }

    #[test]
    fn assign_leaves_the_original_untouched() {
        let mapping = Mapping::new(8);
        let _ = mapping.assign(6).unwrap();
        assert!(mapping.assigned().is_empty());
        assert_eq!(mapping.num_tc(), 1);
    }
}
