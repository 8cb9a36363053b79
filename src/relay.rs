//! Distribution operations on a relay handle.
//!
//! Every operation here is a collective: all members of `comm` must call the
//! same operation with matching arguments, or the call blocks forever.
//!
//! # Example
//!
//! ```
//! use vdi_relay::{local, BufferRole, Capacities, Collective, ExchangeDescriptor, LocalRuntime,
//!                 RelayResources, TruncationPolicy};
//!
//! let views = local::run_group(2, |comm| {
//!     let mut resources = RelayResources::initialize(
//!         LocalRuntime::already_active(),
//!         Capacities::new(8, 8, 8),
//!         TruncationPolicy::Truncate,
//!     )
//!     .unwrap();
//!     let rank = comm.rank() as u8;
//!     let local = [rank; 8];
//!     let received = resources.distribute_counts(&comm, &[4, 4]).unwrap();
//!     let descriptor = ExchangeDescriptor::from_counts(vec![4, 4], received).unwrap();
//!     resources
//!         .distribute(&comm, BufferRole::Color, &local, &descriptor)
//!         .unwrap()
//!         .to_vec()
//! });
//! assert_eq!(views[0], [0, 0, 0, 0, 1, 1, 1, 1]);
//! ```

use tracing::{debug, warn};

use crate::buffer::{BufferRole, RegionView};
use crate::collective::{Collective, Runtime};
use crate::descriptor::{fit_table, ExchangeDescriptor};
use crate::error::{Error, Result};
use crate::resources::RelayResources;

/// Number of participants in `comm`.
pub fn group_size<C: Collective>(comm: &C) -> i32 {
    comm.size()
}

/// Rank of the caller in `comm`.
pub fn group_rank<C: Collective>(comm: &C) -> i32 {
    comm.rank()
}

/// Check a caller-supplied group size against the communicator.
///
/// # Errors
///
/// Returns [`Error::GroupSizeMismatch`] if the two disagree.
pub fn check_group_size<C: Collective>(comm: &C, given: i32) -> Result<()> {
    let actual = comm.size();
    if given == actual {
        Ok(())
    } else {
        Err(Error::GroupSizeMismatch { given, actual })
    }
}

fn participants<C: Collective>(comm: &C) -> Result<usize> {
    let size = comm.size();
    usize::try_from(size)
        .ok()
        .filter(|&n| n > 0)
        .ok_or(Error::InvalidGroupSize(size))
}

impl<R: Runtime> RelayResources<R> {
    /// Exchange one count per participant.
    ///
    /// Entry *j* of `local_counts` is sent to participant *j*; entry *i* of
    /// the result is what participant *i* addressed to the caller.
    pub fn distribute_counts<C: Collective>(&self, comm: &C, local_counts: &[i32]) -> Result<Vec<i32>> {
        let group = participants(comm)?;
        let send = fit_table("local counts", local_counts, group, self.policy())?;
        let mut received = vec![0i32; group];
        comm.alltoall(send, &mut received)?;
        debug!(rank = comm.rank(), ?received, "distributed counts");
        Ok(received)
    }

    /// Variable-size exchange of `local` into the region of `role`.
    ///
    /// The returned view covers `min(sum(recv_counts), capacity)` bytes. Under
    /// [`TruncationPolicy::Truncate`] a receive that would overrun the region
    /// lands in a staging buffer first and only the leading `capacity` bytes
    /// are kept; under [`TruncationPolicy::Strict`] it is rejected before the
    /// exchange starts.
    ///
    /// [`TruncationPolicy::Truncate`]: crate::TruncationPolicy::Truncate
    /// [`TruncationPolicy::Strict`]: crate::TruncationPolicy::Strict
    ///
    /// # Errors
    ///
    /// Besides the policy-dependent errors, negative table entries and send
    /// windows reaching past `local` are always rejected.
    pub fn distribute<C: Collective>(
        &mut self,
        comm: &C,
        role: BufferRole,
        local: &[u8],
        descriptor: &ExchangeDescriptor,
    ) -> Result<RegionView<'_>> {
        let group = participants(comm)?;
        let policy = self.policy();
        let tables = descriptor.fit(group, policy)?;

        let send_extent = tables.send_extent();
        if send_extent > local.len() {
            return Err(Error::SendWindowOutOfBounds {
                end: send_extent,
                len: local.len(),
            });
        }

        let total = tables.total_received();
        let extent = tables.recv_extent();
        let region = self.region_mut(role);
        let capacity = region.capacity();

        if extent > capacity {
            if policy.is_strict() {
                return Err(Error::CapacityExceeded {
                    role,
                    required: extent,
                    capacity,
                });
            }
            warn!(%role, required = extent, capacity, "receive exceeds region, truncating");
            let mut staging = vec![0u8; extent];
            comm.alltoallv(
                local,
                tables.send_counts,
                tables.send_displs,
                &mut staging,
                tables.recv_counts,
                tables.recv_displs,
            )?;
            region.as_mut_slice().copy_from_slice(&staging[..capacity]);
        } else {
            comm.alltoallv(
                local,
                tables.send_counts,
                tables.send_displs,
                region.as_mut_slice(),
                tables.recv_counts,
                tables.recv_displs,
            )?;
        }

        debug!(%role, rank = comm.rank(), received = total, capacity, "distributed");
        Ok(region.view(total))
    }

    /// [`distribute`](Self::distribute) into the color region.
    pub fn distribute_color<C: Collective>(
        &mut self,
        comm: &C,
        local: &[u8],
        descriptor: &ExchangeDescriptor,
    ) -> Result<RegionView<'_>> {
        self.distribute(comm, BufferRole::Color, local, descriptor)
    }

    /// [`distribute`](Self::distribute) into the depth region.
    pub fn distribute_depth<C: Collective>(
        &mut self,
        comm: &C,
        local: &[u8],
        descriptor: &ExchangeDescriptor,
    ) -> Result<RegionView<'_>> {
        self.distribute(comm, BufferRole::Depth, local, descriptor)
    }

    /// Exchange supersegment counts, then the supersegments themselves.
    ///
    /// `local` holds this participant's supersegments for `role`, grouped by
    /// destination in rank order; `supersegment_counts[j]` of them go to
    /// participant *j*.
    pub fn distribute_supersegments<C: Collective>(
        &mut self,
        comm: &C,
        role: BufferRole,
        local: &[u8],
        supersegment_counts: &[i32],
    ) -> Result<RegionView<'_>> {
        let bytes_per_supersegment = role
            .bytes_per_supersegment()
            .ok_or(Error::NoSupersegmentLayout(role))?;
        let group = participants(comm)?;
        let send = fit_table("supersegment counts", supersegment_counts, group, self.policy())?;
        let received = self.distribute_counts(comm, send)?;
        let descriptor = ExchangeDescriptor::for_supersegments(send, &received, bytes_per_supersegment)?;
        self.distribute(comm, role, local, &descriptor)
    }

    /// Fixed-size exchange of `local` into the prefix region.
    ///
    /// `local` is split into one equal share per participant. Under
    /// [`TruncationPolicy::Truncate`](crate::TruncationPolicy::Truncate) the
    /// trailing `len % group` bytes are not sent and a receive larger than the
    /// region is cut to the capacity.
    pub fn distribute_prefix<C: Collective>(&mut self, comm: &C, local: &[u8]) -> Result<RegionView<'_>> {
        let group = participants(comm)?;
        let policy = self.policy();

        let remainder = local.len() % group;
        if remainder != 0 {
            if policy.is_strict() {
                return Err(Error::UnevenSplit {
                    len: local.len(),
                    group,
                });
            }
            warn!(len = local.len(), group, dropped = remainder, "prefix does not split evenly");
        }
        let exchanged = local.len() - remainder;
        let send = &local[..exchanged];

        let region = self.region_mut(BufferRole::Prefix);
        let capacity = region.capacity();
        if exchanged > capacity {
            if policy.is_strict() {
                return Err(Error::CapacityExceeded {
                    role: BufferRole::Prefix,
                    required: exchanged,
                    capacity,
                });
            }
            warn!(required = exchanged, capacity, "prefix exceeds region, truncating");
            let mut staging = vec![0u8; exchanged];
            comm.alltoall(send, &mut staging)?;
            region.as_mut_slice().copy_from_slice(&staging[..capacity]);
        } else {
            comm.alltoall(send, &mut region.as_mut_slice()[..exchanged])?;
        }

        debug!(rank = comm.rank(), received = exchanged, capacity, "distributed prefix");
        Ok(region.view(exchanged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Capacities;
    use crate::config::TruncationPolicy;
    use crate::local::{run_group, LocalComm, LocalRuntime};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn resources(capacities: Capacities, policy: TruncationPolicy) -> RelayResources<LocalRuntime> {
        RelayResources::initialize(LocalRuntime::already_active(), capacities, policy).unwrap()
    }

    /// Descriptor where `rank` sends `sends[j]` bytes to `j` and receives
    /// `sends_to_me[i]` bytes from `i`.
    fn descriptor(sends: &[i32], sends_to_me: &[i32]) -> ExchangeDescriptor {
        ExchangeDescriptor::from_counts(sends.to_vec(), sends_to_me.to_vec()).unwrap()
    }

    /// Local buffer with the bytes for peer `j` set to `fill(j)`.
    fn patterned(counts: &[i32], fill: impl Fn(usize) -> u8) -> Vec<u8> {
        counts
            .iter()
            .enumerate()
            .flat_map(|(peer, &count)| std::iter::repeat(fill(peer)).take(count as usize))
            .collect()
    }

    #[test]
    fn group_queries() {
        let comms = LocalComm::group(3);
        assert_eq!(group_size(&comms[2]), 3);
        assert_eq!(group_rank(&comms[2]), 2);
        assert!(check_group_size(&comms[0], 3).is_ok());
        assert!(matches!(
            check_group_size(&comms[0], 2),
            Err(Error::GroupSizeMismatch { given: 2, actual: 3 })
        ));
    }

    #[test]
    fn counts_are_transposed_for_every_group_size() {
        for group in 1..=6usize {
            let mut rng = StdRng::seed_from_u64(group as u64);
            // matrix[i][j]: count participant i addresses to participant j
            let matrix: Vec<Vec<i32>> = (0..group)
                .map(|_| (0..group).map(|_| rng.gen_range(0..10_000)).collect())
                .collect();

            let received = run_group(group, |comm| {
                let rank = comm.rank() as usize;
                let res = resources(Capacities::default(), TruncationPolicy::Truncate);
                res.distribute_counts(&comm, &matrix[rank]).unwrap()
            });

            for (i, row) in received.iter().enumerate() {
                let expected: Vec<i32> = (0..group).map(|j| matrix[j][i]).collect();
                assert_eq!(row, &expected, "group {group}, participant {i}");
            }
        }
    }

    #[test]
    fn patterned_payloads_arrive_in_rank_order() {
        let group = 5;
        // participant s sends s + d + 1 bytes to participant d
        let count = |s: usize, d: usize| (s + d + 1) as i32;

        let results = run_group(group, |comm| {
            let rank = comm.rank() as usize;
            let sends: Vec<i32> = (0..group).map(|d| count(rank, d)).collect();
            let receives: Vec<i32> = (0..group).map(|s| count(s, rank)).collect();
            let local = patterned(&sends, |_| rank as u8);

            let mut res = resources(Capacities::new(256, 0, 0), TruncationPolicy::Strict);
            let view = res
                .distribute(&comm, BufferRole::Color, &local, &descriptor(&sends, &receives))
                .unwrap();
            (receives, view.to_vec())
        });

        for (receives, bytes) in results {
            assert_eq!(bytes.len() as i32, receives.iter().sum::<i32>());
            let mut offset = 0;
            for (src, &n) in receives.iter().enumerate() {
                let slice = &bytes[offset..offset + n as usize];
                assert!(slice.iter().all(|&b| b == src as u8), "slice {src} is {slice:?}");
                offset += n as usize;
            }
        }
    }

    #[test]
    fn four_ranks_sixteen_bytes_each() {
        let results = run_group(4, |comm| {
            let rank = comm.rank() as u8;
            let local = vec![rank; 64];
            let uniform = [16; 4];
            let mut res = resources(Capacities::new(64, 64, 0), TruncationPolicy::Truncate);
            let view = res
                .distribute_color(&comm, &local, &descriptor(&uniform, &uniform))
                .unwrap();
            view.to_vec()
        });

        for bytes in results {
            assert_eq!(bytes.len(), 64);
            for (k, block) in bytes.chunks(16).enumerate() {
                assert!(block.iter().all(|&b| b == k as u8));
            }
        }
    }

    #[test]
    fn overflowing_receive_is_truncated_to_capacity() {
        let results = run_group(3, |comm| {
            let rank = comm.rank() as u8;
            let counts = [8; 3];
            let local = patterned(&counts, |_| rank);
            let mut res = resources(Capacities::new(0, 20, 0), TruncationPolicy::Truncate);
            let view = res
                .distribute_depth(&comm, &local, &descriptor(&counts, &counts))
                .unwrap();
            view.to_vec()
        });

        let mut full = vec![0u8; 8];
        full.extend([1u8; 8]);
        full.extend([2u8; 8]);
        for bytes in results {
            assert_eq!(bytes.len(), 20);
            assert_eq!(bytes, full[..20]);
        }
    }

    #[test]
    fn overflowing_receive_is_rejected_when_strict() {
        let comm = LocalComm::solo();
        let mut res = resources(Capacities::new(4, 0, 0), TruncationPolicy::Strict);
        let err = res
            .distribute(&comm, BufferRole::Color, &[9; 8], &descriptor(&[8], &[8]))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded { role: BufferRole::Color, required: 8, capacity: 4 }
        ));
        assert!(res.region(BufferRole::Color).as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn nothing_sent_to_self_is_an_empty_slice() {
        let group = 3;
        let results = run_group(group, |comm| {
            let rank = comm.rank() as usize;
            let sends: Vec<i32> = (0..group).map(|d| if d == rank { 0 } else { 4 }).collect();
            let local = patterned(&sends, |_| rank as u8 + 1);
            let mut res = resources(Capacities::new(16, 0, 0), TruncationPolicy::Strict);
            let view = res
                .distribute(&comm, BufferRole::Color, &local, &descriptor(&sends, &sends))
                .unwrap();
            view.to_vec()
        });

        assert_eq!(results[0], [2, 2, 2, 2, 3, 3, 3, 3]);
        assert_eq!(results[1], [1, 1, 1, 1, 3, 3, 3, 3]);
        assert_eq!(results[2], [1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn send_window_past_local_buffer_is_rejected() {
        let comm = LocalComm::solo();
        let mut res = resources(Capacities::new(16, 0, 0), TruncationPolicy::Truncate);
        let err = res
            .distribute(&comm, BufferRole::Color, &[1; 4], &descriptor(&[8], &[8]))
            .unwrap_err();
        assert!(matches!(err, Error::SendWindowOutOfBounds { end: 8, len: 4 }));
    }

    #[test]
    fn depth_exchange_leaves_color_untouched() {
        let comm = LocalComm::solo();
        let mut res = resources(Capacities::new(8, 8, 0), TruncationPolicy::Truncate);
        let view = res
            .distribute(&comm, BufferRole::Depth, &[7; 8], &descriptor(&[8], &[8]))
            .unwrap();
        assert_eq!(&*view, &[7; 8]);
        assert!(res.region(BufferRole::Color).as_slice().iter().all(|&b| b == 0));
        assert_eq!(res.region(BufferRole::Depth).as_slice(), &[7; 8]);
    }

    #[test]
    fn long_count_tables_depend_on_policy() {
        let comm = LocalComm::solo();
        let mut res = resources(Capacities::default(), TruncationPolicy::Truncate);
        assert_eq!(res.distribute_counts(&comm, &[5, 6, 7]).unwrap(), [5]);

        res.set_policy(TruncationPolicy::Strict);
        assert!(matches!(
            res.distribute_counts(&comm, &[5, 6, 7]),
            Err(Error::DescriptorLength { table: "local counts", expected: 1, actual: 3 })
        ));
    }

    #[test]
    fn short_count_tables_are_always_rejected() {
        let results = run_group(2, |comm| {
            let res = resources(Capacities::default(), TruncationPolicy::Truncate);
            res.distribute_counts(&comm, &[1]).unwrap_err()
        });
        assert!(results
            .iter()
            .all(|err| matches!(err, Error::DescriptorLength { expected: 2, actual: 1, .. })));
    }

    #[test]
    fn supersegments_are_scaled_by_role() {
        let group = 2;
        let results = run_group(group, |comm| {
            let rank = comm.rank() as usize;
            // participant s sends s + 1 supersegments to participant 0 and 2 to participant 1
            let segments = [rank as i32 + 1, 2];
            let bytes: Vec<i32> = segments.iter().map(|s| s * 16).collect();
            let local = patterned(&bytes, |peer| (10 * rank + peer) as u8);

            let mut res = resources(Capacities::new(128, 0, 0), TruncationPolicy::Strict);
            let view = res
                .distribute_supersegments(&comm, BufferRole::Color, &local, &segments)
                .unwrap();
            view.to_vec()
        });

        // participant 0 receives 1 segment from 0 and 2 from 1
        let mut expected0 = vec![0u8; 16];
        expected0.extend([10u8; 32]);
        assert_eq!(results[0], expected0);

        // participant 1 receives 2 segments from each
        let mut expected1 = vec![1u8; 32];
        expected1.extend([11u8; 32]);
        assert_eq!(results[1], expected1);
    }

    #[test]
    fn depth_supersegments_use_eight_bytes() {
        let comm = LocalComm::solo();
        let mut res = resources(Capacities::new(0, 64, 0), TruncationPolicy::Strict);
        let view = res
            .distribute_supersegments(&comm, BufferRole::Depth, &[3; 24], &[3])
            .unwrap();
        assert_eq!(view.len(), 24);
    }

    #[test]
    fn prefix_has_no_supersegment_layout() {
        let comm = LocalComm::solo();
        let mut res = resources(Capacities::new(0, 0, 8), TruncationPolicy::Truncate);
        let err = res
            .distribute_supersegments(&comm, BufferRole::Prefix, &[0; 8], &[1])
            .unwrap_err();
        assert!(matches!(err, Error::NoSupersegmentLayout(BufferRole::Prefix)));
    }

    #[test]
    fn prefix_shares_are_exchanged() {
        let results = run_group(4, |comm| {
            let rank = comm.rank() as u8;
            // share j is addressed to participant j
            let local: Vec<u8> = (0..4u8).flat_map(|j| [rank * 16 + j; 8]).collect();
            let mut res = resources(Capacities::new(0, 0, 64), TruncationPolicy::Strict);
            res.distribute_prefix(&comm, &local).unwrap().to_vec()
        });

        for (rank, bytes) in results.iter().enumerate() {
            assert_eq!(bytes.len(), 32);
            for (src, share) in bytes.chunks(8).enumerate() {
                assert!(share.iter().all(|&b| b == (src * 16 + rank) as u8));
            }
        }
    }

    #[test]
    fn uneven_prefix_drops_trailing_bytes() {
        let results = run_group(2, |comm| {
            let rank = comm.rank() as u8;
            let mut local = vec![rank; 8];
            local.push(0xEE);
            let mut res = resources(Capacities::new(0, 0, 16), TruncationPolicy::Truncate);
            res.distribute_prefix(&comm, &local).unwrap().to_vec()
        });
        for bytes in results {
            assert_eq!(bytes, [0, 0, 0, 0, 1, 1, 1, 1]);
        }
    }

    #[test]
    fn uneven_prefix_is_rejected_when_strict() {
        let results = run_group(2, |comm| {
            let mut res = resources(Capacities::new(0, 0, 16), TruncationPolicy::Strict);
            res.distribute_prefix(&comm, &[0; 9]).unwrap_err()
        });
        assert!(results
            .iter()
            .all(|err| matches!(err, Error::UnevenSplit { len: 9, group: 2 })));
    }

    #[test]
    fn oversized_prefix_is_truncated() {
        let results = run_group(2, |comm| {
            let rank = comm.rank() as u8;
            let mut res = resources(Capacities::new(0, 0, 6), TruncationPolicy::Truncate);
            res.distribute_prefix(&comm, &[rank; 8]).unwrap().to_vec()
        });
        for bytes in results {
            assert_eq!(bytes, [0, 0, 0, 0, 1, 1]);
        }
    }

    #[test]
    fn repeated_exchanges_reuse_the_region() {
        let comm = LocalComm::solo();
        let mut res = resources(Capacities::new(8, 0, 0), TruncationPolicy::Truncate);
        res.distribute_color(&comm, &[1; 8], &descriptor(&[8], &[8]))
            .unwrap();
        let view = res
            .distribute_color(&comm, &[2; 4], &descriptor(&[4], &[4]))
            .unwrap();
        assert_eq!(&*view, &[2; 4]);
        // bytes past the latest receive keep their old contents
        assert_eq!(res.region(BufferRole::Color).as_slice(), &[2, 2, 2, 2, 1, 1, 1, 1]);
    }
}
