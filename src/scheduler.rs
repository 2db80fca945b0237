//! Merged gate-control-list computation for one interface.
//!
//! The scheduler keeps the set of admitted scheduled streams and, for each
//! new candidate, recomputes the unified schedule over the least common
//! multiple of all intervals. Every stream occurrence gets one exclusive
//! slot; the time nobody claimed stays open for best-effort traffic.
//!
//! [`Scheduler::with_stream`] is pure: it returns a *new* scheduler plus the
//! merged [`Schedule`] and leaves `self` untouched. The interface context
//! commits the returned value only after the system configuration applied
//! cleanly, which makes rejection and rollback a matter of dropping the
//! tentative value.

use serde::Serialize;

use crate::AdmissionError;

/// Traffic class reserved for unscheduled traffic.
pub const BEST_EFFORT_TC: u8 = 0;

/// One `(gate_mask, duration)` line of the gate-control list.
///
/// Bit *i* of the mask opens the gate of traffic class *i* for the entry's
/// duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateEntry {
    pub gate_mask: u16,
    pub duration_ns: u64,
}

impl GateEntry {
    /// An entry opening only the best-effort gate.
    pub fn best_effort(duration_ns: u64) -> Self {
        GateEntry {
            gate_mask: 1 << BEST_EFFORT_TC,
            duration_ns,
        }
    }

    /// An entry opening exactly one scheduled traffic class.
    pub fn exclusive(tc: u8, duration_ns: u64) -> Self {
        GateEntry {
            gate_mask: 1 << tc,
            duration_ns,
        }
    }
}

/// The complete gate-control list over one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    /// Cycle length, the least common multiple of all admitted intervals
    pub cycle_ns: u64,
    /// Gate entries in transmission order, durations summing to the cycle
    pub entries: Vec<GateEntry>,
}

impl Schedule {
    /// Sum of all entry durations. Equal to `cycle_ns` by construction.
    pub fn total_ns(&self) -> u64 {
        self.entries.iter().map(|e| e.duration_ns).sum()
    }

    /// Qdisc base time: two full cycles after `now_ns`, giving the kernel
    /// lead time to install the schedule.
    pub fn base_time_from(&self, now_ns: u64) -> u64 {
        now_ns.saturating_add(2 * self.cycle_ns)
    }
}

/// One admitted stream as the scheduler sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmittedStream {
    /// Traffic class assigned by the mapping
    pub tc: u8,
    /// Stream cycle interval
    pub interval_ns: u64,
    /// Transmission offset within each interval occurrence
    pub txoffset_ns: u64,
    /// Transmission duration per occurrence
    pub duration_ns: u64,
}

/// An occurrence of a stream inside the merged cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    start_ns: u64,
    end_ns: u64,
    tc: u8,
}

/// The admitted scheduled streams of one interface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Scheduler {
    admitted: Vec<AdmittedStream>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler::default()
    }

    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.admitted.len()
    }

    /// Merges one more stream into the schedule.
    ///
    /// Returns the scheduler as it would look with the stream admitted and
    /// the canonical schedule over the new cycle. `self` is not modified;
    /// the caller commits the returned scheduler once the configuration is
    /// applied.
    ///
    /// # Errors
    ///
    /// [`AdmissionError::ScheduleConflict`] when any occurrence of the new
    /// stream overlaps an already admitted slot, and
    /// [`AdmissionError::InvalidRequest`] when the merged cycle overflows.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use detd::scheduler::{AdmittedStream, Scheduler};
    ///
    /// let stream = AdmittedStream {
    ///     tc: 1,
    ///     interval_ns: 2_000_000,
    ///     txoffset_ns: 250_000,
    ///     duration_ns: 12_176,
    /// };
    /// let (scheduler, schedule) = Scheduler::new().with_stream(stream).unwrap();
    /// assert_eq!(scheduler.len(), 1);
    /// assert_eq!(schedule.total_ns(), schedule.cycle_ns);
    /// ```
    pub fn with_stream(
        &self,
        stream: AdmittedStream,
    ) -> Result<(Scheduler, Schedule), AdmissionError> {
        let mut admitted = self.admitted.clone();
        admitted.push(stream);

        let cycle_ns = merged_cycle(&admitted)?;
        let mut slots = expand_slots(&admitted, cycle_ns);
        // Equal start times order by TC ascending so re-computation is
        // deterministic across admissions.
        slots.sort_by(|a, b| (a.start_ns, a.tc).cmp(&(b.start_ns, b.tc)));

        for pair in slots.windows(2) {
            if pair[1].start_ns < pair[0].end_ns {
                return Err(AdmissionError::ScheduleConflict {
                    txoffset_ns: stream.txoffset_ns,
                    interval_ns: stream.interval_ns,
                });
            }
        }

        let schedule = emit_canonical(cycle_ns, &slots);
        Ok((Scheduler { admitted }, schedule))
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// LCM of all admitted intervals, the merged cycle.
fn merged_cycle(admitted: &[AdmittedStream]) -> Result<u64, AdmissionError> {
    let mut cycle: u64 = 1;
    for stream in admitted {
        let g = gcd(cycle, stream.interval_ns);
        cycle = (cycle / g).checked_mul(stream.interval_ns).ok_or_else(|| {
            AdmissionError::invalid(format!(
                "merged cycle overflows with interval {} ns",
                stream.interval_ns
            ))
        })?;
    }
    Ok(cycle)
}

/// Expands each stream to its `cycle / interval` occurrences.
fn expand_slots(admitted: &[AdmittedStream], cycle_ns: u64) -> Vec<Slot> {
    let mut slots = Vec::new();
    for stream in admitted {
        let repeats = cycle_ns / stream.interval_ns;
        for k in 0..repeats {
            let start_ns = k * stream.interval_ns + stream.txoffset_ns;
            slots.push(Slot {
                start_ns,
                end_ns: start_ns + stream.duration_ns,
                tc: stream.tc,
            });
        }
    }
    slots
}

/// Builds the canonical entry list: scheduled slots in time order with
/// best-effort fillers covering every gap, starting at cycle offset 0 and
/// closing exactly at cycle end.
fn emit_canonical(cycle_ns: u64, slots: &[Slot]) -> Schedule {
    let mut entries = Vec::with_capacity(slots.len() * 2 + 1);
    let mut cursor_ns = 0;
    for slot in slots {
        if slot.start_ns > cursor_ns {
            entries.push(GateEntry::best_effort(slot.start_ns - cursor_ns));
        }
        entries.push(GateEntry::exclusive(slot.tc, slot.end_ns - slot.start_ns));
        cursor_ns = slot.end_ns;
    }
    if cursor_ns < cycle_ns {
        entries.push(GateEntry::best_effort(cycle_ns - cursor_ns));
    }
    Schedule { cycle_ns, entries }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(tc: u8, interval_ns: u64, txoffset_ns: u64, duration_ns: u64) -> AdmittedStream {
        AdmittedStream {
            tc,
            interval_ns,
            txoffset_ns,
            duration_ns,
        }
    }

    /// The per-stream slot of `tc` must sit at the stream's offset in every
    /// occurrence and be at least as long as its transmission duration.
    fn assert_offset_preserved(schedule: &Schedule, s: &AdmittedStream) {
        let mut cursor = 0;
        let mut found = 0;
        for entry in &schedule.entries {
            if entry.gate_mask == 1 << s.tc {
                assert_eq!(cursor % s.interval_ns, s.txoffset_ns);
                assert!(entry.duration_ns >= s.duration_ns);
                found += 1;
            }
            cursor += entry.duration_ns;
        }
        assert_eq!(found as u64, schedule.cycle_ns / s.interval_ns);
    }

    #[test]
    fn single_stream_produces_reference_gate_list() {
        let s = stream(1, 2_000_000, 250_000, 12_176);
        let (_, schedule) = Scheduler::new().with_stream(s).unwrap();

        assert_eq!(schedule.cycle_ns, 2_000_000);
        assert_eq!(
            schedule.entries,
            vec![
                GateEntry {
                    gate_mask: 0x01,
                    duration_ns: 250_000
                },
                GateEntry {
                    gate_mask: 0x02,
                    duration_ns: 12_176
                },
                GateEntry {
                    gate_mask: 0x01,
                    duration_ns: 1_737_824
                },
            ]
        );
        assert_eq!(schedule.total_ns(), schedule.cycle_ns);
        assert_offset_preserved(&schedule, &s);
    }

    #[test]
    fn stream_at_offset_zero_needs_no_leading_filler() {
        let (_, schedule) = Scheduler::new()
            .with_stream(stream(1, 1_000_000, 0, 8_000))
            .unwrap();
        assert_eq!(schedule.entries[0], GateEntry::exclusive(1, 8_000));
        assert_eq!(schedule.entries[1], GateEntry::best_effort(992_000));
        assert_eq!(schedule.entries.len(), 2);
    }

    #[test]
    fn same_period_streams_coexist() {
        let first = stream(1, 2_000_000, 250_000, 12_176);
        let second = stream(2, 2_000_000, 1_000_000, 4_096);
        let (scheduler, _) = Scheduler::new().with_stream(first).unwrap();
        let (scheduler, schedule) = scheduler.with_stream(second).unwrap();

        assert_eq!(scheduler.len(), 2);
        assert_eq!(schedule.cycle_ns, 2_000_000);
        assert_eq!(
            schedule.entries,
            vec![
                GateEntry {
                    gate_mask: 0x01,
                    duration_ns: 250_000
                },
                GateEntry {
                    gate_mask: 0x02,
                    duration_ns: 12_176
                },
                GateEntry {
                    gate_mask: 0x01,
                    duration_ns: 737_824
                },
                GateEntry {
                    gate_mask: 0x04,
                    duration_ns: 4_096
                },
                GateEntry {
                    gate_mask: 0x01,
                    duration_ns: 995_904
                },
            ]
        );
        assert_eq!(schedule.total_ns(), 2_000_000);
        assert_offset_preserved(&schedule, &first);
        assert_offset_preserved(&schedule, &second);
    }

    #[test]
    fn coprime_periods_extend_the_cycle() {
        let first = stream(1, 1_000_000, 0, 8_000);
        let second = stream(2, 1_500_000, 100_000, 4_000);
        let (scheduler, _) = Scheduler::new().with_stream(first).unwrap();
        let (_, schedule) = scheduler.with_stream(second).unwrap();

        assert_eq!(schedule.cycle_ns, 3_000_000);
        let first_slots = schedule
            .entries
            .iter()
            .filter(|e| e.gate_mask == 0x02)
            .count();
        let second_slots = schedule
            .entries
            .iter()
            .filter(|e| e.gate_mask == 0x04)
            .count();
        assert_eq!(first_slots, 3);
        assert_eq!(second_slots, 2);
        assert_eq!(schedule.total_ns(), 3_000_000);
        assert_offset_preserved(&schedule, &first);
        assert_offset_preserved(&schedule, &second);
    }

    #[test]
    fn overlapping_slot_is_a_schedule_conflict() {
        let (scheduler, _) = Scheduler::new()
            .with_stream(stream(1, 2_000_000, 250_000, 12_176))
            .unwrap();
        let err = scheduler
            .with_stream(stream(2, 2_000_000, 250_000, 4_096))
            .unwrap_err();
        assert_eq!(
            err,
            AdmissionError::ScheduleConflict {
                txoffset_ns: 250_000,
                interval_ns: 2_000_000,
            }
        );
    }

    #[test]
    fn partial_overlap_at_slot_tail_is_detected() {
        let (scheduler, _) = Scheduler::new()
            .with_stream(stream(1, 1_000_000, 0, 10_000))
            .unwrap();
        // Starts inside the first stream's slot
        assert!(
            scheduler
                .with_stream(stream(2, 1_000_000, 9_999, 100))
                .is_err()
        );
        // Back-to-back is fine
        let (_, schedule) = scheduler
            .with_stream(stream(2, 1_000_000, 10_000, 100))
            .unwrap();
        assert_eq!(schedule.entries[0], GateEntry::exclusive(1, 10_000));
        assert_eq!(schedule.entries[1], GateEntry::exclusive(2, 100));
    }

    #[test]
    fn overlap_across_occurrences_is_detected() {
        // 1 ms stream at offset 0; a 2 ms stream at offset 1 ms collides
        // with the first stream's second occurrence.
        let (scheduler, _) = Scheduler::new()
            .with_stream(stream(1, 1_000_000, 0, 10_000))
            .unwrap();
        assert!(
            scheduler
                .with_stream(stream(2, 2_000_000, 1_000_000, 5_000))
                .is_err()
        );
    }

    #[test]
    fn equal_start_times_order_by_tc() {
        // Zero-duration occurrences cannot happen through admission, but the
        // sort must still be deterministic for identical starts.
        let (scheduler, _) = Scheduler::new()
            .with_stream(stream(2, 1_000_000, 500_000, 0))
            .unwrap();
        let (_, schedule) = scheduler
            .with_stream(stream(1, 1_000_000, 500_000, 0))
            .unwrap();
        let masks: Vec<u16> = schedule
            .entries
            .iter()
            .filter(|e| e.gate_mask != 0x01)
            .map(|e| e.gate_mask)
            .collect();
        assert_eq!(masks, vec![0x02, 0x04]);
    }

    #[test]
    fn with_stream_leaves_the_original_untouched() {
        let scheduler = Scheduler::new();
        let _ = scheduler
            .with_stream(stream(1, 1_000_000, 0, 1_000))
            .unwrap();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn merged_cycle_overflow_is_rejected() {
        // Two large co-prime intervals whose LCM exceeds u64
        let (scheduler, _) = Scheduler::new()
            .with_stream(stream(1, (1 << 62) + 1, 0, 1))
            .unwrap();
        let err = scheduler.with_stream(stream(2, 1 << 62, 1_000, 1)).unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidRequest { .. }));
    }

    #[test]
    fn base_time_gives_two_cycles_of_lead() {
        let schedule = Schedule {
            cycle_ns: 2_000_000,
            entries: vec![GateEntry::best_effort(2_000_000)],
        };
        assert_eq!(schedule.base_time_from(1_000), 4_001_000);
    }
}
