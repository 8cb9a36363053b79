//! Count and displacement tables for variable-size exchanges.

use tracing::warn;

use crate::config::TruncationPolicy;
use crate::error::{Error, Result};

const SEND_COUNTS: &str = "send counts";
const SEND_DISPLS: &str = "send displacements";
const RECV_COUNTS: &str = "receive counts";
const RECV_DISPLS: &str = "receive displacements";

/// The four per-participant tables of an all-to-all-variable exchange.
///
/// Entry *i* of each table concerns participant *i*. Displacements are byte
/// offsets and are expected to be the running sums of their counts; callers
/// with only counts at hand use [`from_counts`](Self::from_counts).
///
/// # Example
///
/// ```
/// use vdi_relay::ExchangeDescriptor;
///
/// let descriptor = ExchangeDescriptor::from_counts(vec![4, 0, 8], vec![2, 2, 2]).unwrap();
/// assert_eq!(descriptor.send_displacements(), &[0, 4, 4]);
/// assert_eq!(descriptor.recv_displacements(), &[0, 2, 4]);
/// assert_eq!(descriptor.total_received(), 6);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeDescriptor {
    send_counts: Vec<i32>,
    send_displs: Vec<i32>,
    recv_counts: Vec<i32>,
    recv_displs: Vec<i32>,
}

impl ExchangeDescriptor {
    /// Wrap caller-prepared tables as they are. Nothing is checked until the
    /// descriptor is used in an exchange.
    pub fn new(
        send_counts: Vec<i32>,
        send_displs: Vec<i32>,
        recv_counts: Vec<i32>,
        recv_displs: Vec<i32>,
    ) -> Self {
        ExchangeDescriptor {
            send_counts,
            send_displs,
            recv_counts,
            recv_displs,
        }
    }

    /// Build the displacement tables as running sums of the counts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCount`] for a negative count or a sum that
    /// overflows `i32`.
    pub fn from_counts(send_counts: Vec<i32>, recv_counts: Vec<i32>) -> Result<Self> {
        let send_displs = displacements(&send_counts)?;
        let recv_displs = displacements(&recv_counts)?;
        Ok(ExchangeDescriptor {
            send_counts,
            send_displs,
            recv_counts,
            recv_displs,
        })
    }

    /// Build byte tables from supersegment counts.
    ///
    /// Every count is multiplied by `bytes_per_supersegment` before the
    /// displacements are summed.
    pub fn for_supersegments(
        send_supersegments: &[i32],
        recv_supersegments: &[i32],
        bytes_per_supersegment: usize,
    ) -> Result<Self> {
        let scale = |counts: &[i32]| -> Result<Vec<i32>> {
            counts
                .iter()
                .map(|&count| {
                    i64::from(count)
                        .checked_mul(bytes_per_supersegment as i64)
                        .and_then(|bytes| i32::try_from(bytes).ok())
                        .ok_or(Error::InvalidCount(count.into()))
                })
                .collect()
        };
        Self::from_counts(scale(send_supersegments)?, scale(recv_supersegments)?)
    }

    /// Bytes sent to each participant.
    pub fn send_counts(&self) -> &[i32] {
        &self.send_counts
    }

    /// Offset in the local buffer of each participant's outgoing bytes.
    pub fn send_displacements(&self) -> &[i32] {
        &self.send_displs
    }

    /// Bytes received from each participant.
    pub fn recv_counts(&self) -> &[i32] {
        &self.recv_counts
    }

    /// Offset in the receive region of each participant's incoming bytes.
    pub fn recv_displacements(&self) -> &[i32] {
        &self.recv_displs
    }

    /// Sum of the receive counts. May be negative for malformed tables.
    pub fn total_received(&self) -> i64 {
        self.recv_counts.iter().map(|&c| i64::from(c)).sum()
    }

    /// Cut the tables to `group` entries and validate them under `policy`.
    pub(crate) fn fit(&self, group: usize, policy: TruncationPolicy) -> Result<Tables<'_>> {
        let tables = Tables {
            send_counts: fit_table(SEND_COUNTS, &self.send_counts, group, policy)?,
            send_displs: fit_table(SEND_DISPLS, &self.send_displs, group, policy)?,
            recv_counts: fit_table(RECV_COUNTS, &self.recv_counts, group, policy)?,
            recv_displs: fit_table(RECV_DISPLS, &self.recv_displs, group, policy)?,
        };
        for table in [tables.send_counts, tables.send_displs, tables.recv_counts, tables.recv_displs] {
            if let Some(&bad) = table.iter().find(|&&v| v < 0) {
                return Err(Error::InvalidCount(bad.into()));
            }
        }
        if policy == TruncationPolicy::Strict {
            check_prefix_sums(SEND_DISPLS, tables.send_counts, tables.send_displs)?;
            check_prefix_sums(RECV_DISPLS, tables.recv_counts, tables.recv_displs)?;
        }
        Ok(tables)
    }
}

/// Running sums of `counts`, starting at zero.
///
/// # Errors
///
/// Returns [`Error::InvalidCount`] for a negative count or an overflowing sum.
pub fn displacements(counts: &[i32]) -> Result<Vec<i32>> {
    let mut sum: i32 = 0;
    counts
        .iter()
        .map(|&count| {
            if count < 0 {
                return Err(Error::InvalidCount(count.into()));
            }
            let displacement = sum;
            sum = sum
                .checked_add(count)
                .ok_or(Error::InvalidCount(i64::from(sum) + i64::from(count)))?;
            Ok(displacement)
        })
        .collect()
}

/// Tables cut to the group size, all entries non-negative.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tables<'a> {
    pub send_counts: &'a [i32],
    pub send_displs: &'a [i32],
    pub recv_counts: &'a [i32],
    pub recv_displs: &'a [i32],
}

impl Tables<'_> {
    /// One past the furthest byte read from the local buffer.
    pub fn send_extent(&self) -> usize {
        extent(self.send_counts, self.send_displs)
    }

    /// One past the furthest byte written into the receive region.
    pub fn recv_extent(&self) -> usize {
        extent(self.recv_counts, self.recv_displs)
    }

    /// Sum of the receive counts.
    pub fn total_received(&self) -> usize {
        self.recv_counts.iter().map(|&c| c as usize).sum()
    }
}

fn extent(counts: &[i32], displs: &[i32]) -> usize {
    counts
        .iter()
        .zip(displs)
        .filter(|(count, _)| **count > 0)
        .map(|(&count, &displ)| displ as usize + count as usize)
        .max()
        .unwrap_or(0)
}

/// Cut `table` to `group` entries, or reject it.
///
/// Short tables are always an error. Long tables are an error under
/// [`TruncationPolicy::Strict`] and silently cut otherwise.
pub(crate) fn fit_table<'a>(
    name: &'static str,
    table: &'a [i32],
    group: usize,
    policy: TruncationPolicy,
) -> Result<&'a [i32]> {
    let mismatch = Error::DescriptorLength {
        table: name,
        expected: group,
        actual: table.len(),
    };
    if table.len() < group {
        return Err(mismatch);
    }
    if table.len() > group {
        if policy == TruncationPolicy::Strict {
            return Err(mismatch);
        }
        warn!(table = name, len = table.len(), group, "ignoring descriptor entries beyond the group size");
    }
    Ok(&table[..group])
}

fn check_prefix_sums(name: &'static str, counts: &[i32], displs: &[i32]) -> Result<()> {
    let mut expected: i64 = 0;
    for (&count, &displ) in counts.iter().zip(displs) {
        if i64::from(displ) != expected {
            return Err(Error::InconsistentDisplacements { table: name });
        }
        expected += i64::from(count);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displacements_are_running_sums() {
        assert_eq!(displacements(&[3, 0, 5, 1]).unwrap(), [0, 3, 3, 8]);
        assert!(displacements(&[]).unwrap().is_empty());
    }

    #[test]
    fn displacements_reject_negative_and_overflow() {
        assert!(matches!(displacements(&[1, -2]), Err(Error::InvalidCount(-2))));
        assert!(matches!(
            displacements(&[i32::MAX, 1, 1]),
            Err(Error::InvalidCount(_))
        ));
    }

    #[test]
    fn supersegments_scale_to_bytes() {
        let descriptor = ExchangeDescriptor::for_supersegments(&[10, 20], &[10, 5], 16).unwrap();
        assert_eq!(descriptor.send_counts(), &[160, 320]);
        assert_eq!(descriptor.send_displacements(), &[0, 160]);
        assert_eq!(descriptor.recv_counts(), &[160, 80]);
        assert_eq!(descriptor.recv_displacements(), &[0, 160]);
        assert_eq!(descriptor.total_received(), 240);
    }

    #[test]
    fn supersegment_overflow_is_rejected() {
        let err = ExchangeDescriptor::for_supersegments(&[i32::MAX / 2], &[1], 16).unwrap_err();
        assert!(matches!(err, Error::InvalidCount(_)));
    }

    #[test]
    fn fit_cuts_long_tables_when_truncating() {
        let descriptor = ExchangeDescriptor::new(vec![1, 2, 99], vec![0, 1, 3], vec![2, 2], vec![0, 2]);
        let tables = descriptor.fit(2, TruncationPolicy::Truncate).unwrap();
        assert_eq!(tables.send_counts, &[1, 2]);
        assert_eq!(tables.send_extent(), 3);
        assert_eq!(tables.recv_extent(), 4);
        assert_eq!(tables.total_received(), 4);
    }

    #[test]
    fn fit_rejects_long_tables_when_strict() {
        let descriptor = ExchangeDescriptor::new(vec![1, 2, 99], vec![0, 1, 3], vec![2, 2], vec![0, 2]);
        match descriptor.fit(2, TruncationPolicy::Strict) {
            Err(Error::DescriptorLength { table, expected, actual }) => {
                assert_eq!(table, "send counts");
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn fit_rejects_short_tables_under_any_policy() {
        let descriptor = ExchangeDescriptor::from_counts(vec![1], vec![1]).unwrap();
        for policy in [TruncationPolicy::Truncate, TruncationPolicy::Strict] {
            assert!(matches!(
                descriptor.fit(2, policy),
                Err(Error::DescriptorLength { expected: 2, actual: 1, .. })
            ));
        }
    }

    #[test]
    fn fit_rejects_negative_entries() {
        let descriptor = ExchangeDescriptor::new(vec![1, 1], vec![0, -1], vec![1, 1], vec![0, 1]);
        assert!(matches!(
            descriptor.fit(2, TruncationPolicy::Truncate),
            Err(Error::InvalidCount(-1))
        ));
    }

    #[test]
    fn strict_fit_checks_prefix_sums() {
        // receive windows overlap: displacement 1 instead of 2
        let descriptor = ExchangeDescriptor::new(vec![2, 2], vec![0, 2], vec![2, 2], vec![0, 1]);
        assert!(descriptor.fit(2, TruncationPolicy::Truncate).is_ok());
        assert!(matches!(
            descriptor.fit(2, TruncationPolicy::Strict),
            Err(Error::InconsistentDisplacements { table: "receive displacements" })
        ));
    }

    #[test]
    fn extent_ignores_empty_windows() {
        let descriptor = ExchangeDescriptor::new(vec![4, 0], vec![0, 100], vec![0, 0], vec![0, 0]);
        let tables = descriptor.fit(2, TruncationPolicy::Truncate).unwrap();
        assert_eq!(tables.send_extent(), 4);
        assert_eq!(tables.recv_extent(), 0);
        assert_eq!(tables.total_received(), 0);
    }
}
