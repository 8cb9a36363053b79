//! In-process collective backend.
//!
//! Each participant of a [`LocalComm`] group is a thread of the same process.
//! Participants deposit one message per peer into a shared mailbox matrix,
//! meet at a barrier, collect what was addressed to them, and meet again so
//! the mailboxes can be reused by the next collective. The blocking contract
//! is the same as MPI's: every member must enter every collective.
//!
//! # Example
//!
//! ```
//! use vdi_relay::{local, Collective};
//!
//! let received = local::run_group(3, |comm| {
//!     let send = vec![comm.rank(); 3];
//!     let mut recv = vec![0; 3];
//!     comm.alltoall(&send, &mut recv).unwrap();
//!     recv
//! });
//! assert!(received.iter().all(|r| r == &[0, 1, 2]));
//! ```

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use parking_lot::Mutex;
use tracing::trace;

use crate::collective::{Collective, Runtime};
use crate::datatype::RelayDatatype;
use crate::error::{Error, Result};

/// Mailbox matrix shared by the members of one group.
struct Exchange {
    size: usize,
    /// Slot `src * size + dst` holds the message from `src` to `dst`.
    slots: Mutex<Vec<Option<Vec<u8>>>>,
    barrier: Barrier,
}

/// One participant's endpoint into an in-process group.
pub struct LocalComm {
    rank: usize,
    shared: Arc<Exchange>,
}

impl LocalComm {
    /// Create the endpoints of a new group of `size` participants.
    ///
    /// Endpoint *i* has rank *i*. Each endpoint is meant to be moved to its
    /// own thread.
    pub fn group(size: usize) -> Vec<LocalComm> {
        let shared = Arc::new(Exchange {
            size,
            slots: Mutex::new(vec![None; size * size]),
            barrier: Barrier::new(size),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// A single-member group, useful for hosts that run without peers.
    pub fn solo() -> LocalComm {
        let mut group = Self::group(1);
        group.remove(0)
    }

    /// Post one message per peer and collect the ones addressed to us.
    fn exchange(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        let n = self.shared.size;
        {
            let mut slots = self.shared.slots.lock();
            for (dst, message) in outgoing.into_iter().enumerate() {
                slots[self.rank * n + dst] = Some(message);
            }
        }
        self.shared.barrier.wait();

        let incoming = {
            let mut slots = self.shared.slots.lock();
            (0..n)
                .map(|src| {
                    slots[src * n + self.rank].take().ok_or_else(|| {
                        Error::Transport(format!(
                            "rank {} got no message from rank {src}",
                            self.rank
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()
        };
        // Nobody may post the next round before everyone has drained this one.
        self.shared.barrier.wait();
        trace!(rank = self.rank, peers = n, "local exchange complete");
        incoming
    }

    /// Run the exchange even when our own arguments were rejected so that the
    /// peers are not left waiting at the barrier.
    fn exchange_or_skip(&self, prepared: Result<Vec<Vec<u8>>>) -> Result<Vec<Vec<u8>>> {
        match prepared {
            Ok(outgoing) => self.exchange(outgoing),
            Err(err) => {
                let _ = self.exchange(vec![Vec::new(); self.shared.size]);
                Err(err)
            }
        }
    }

    fn prepare_fixed<T: RelayDatatype>(&self, send: &[T], recv_len: usize) -> Result<Vec<Vec<u8>>> {
        let n = self.shared.size;
        if send.len() != recv_len || send.len() % n != 0 {
            return Err(Error::InvalidBuffer);
        }
        let block = send.len() / n;
        Ok((0..n)
            .map(|dst| {
                let mut bytes = Vec::with_capacity(block * T::SIZE);
                T::encode(&send[dst * block..(dst + 1) * block], &mut bytes);
                bytes
            })
            .collect())
    }

    fn prepare_variable<T: RelayDatatype>(
        &self,
        send: &[T],
        send_counts: &[i32],
        send_displs: &[i32],
    ) -> Result<Vec<Vec<u8>>> {
        let n = self.shared.size;
        check_tables(n, &[send_counts, send_displs])?;
        (0..n)
            .map(|dst| {
                let range = window(send_counts, send_displs, dst, send.len())?;
                let mut bytes = Vec::with_capacity(range.len() * T::SIZE);
                T::encode(&send[range], &mut bytes);
                Ok(bytes)
            })
            .collect()
    }
}

impl Collective for LocalComm {
    fn rank(&self) -> i32 {
        self.rank as i32
    }

    fn size(&self) -> i32 {
        self.shared.size as i32
    }

    fn alltoall<T: RelayDatatype>(&self, send: &[T], recv: &mut [T]) -> Result<()> {
        let incoming = self.exchange_or_skip(self.prepare_fixed(send, recv.len()))?;
        let block = recv.len() / self.shared.size;
        for (src, bytes) in incoming.iter().enumerate() {
            if bytes.len() != block * T::SIZE {
                return Err(Error::Transport(format!(
                    "rank {src} sent {} bytes, expected {}",
                    bytes.len(),
                    block * T::SIZE
                )));
            }
            T::decode(bytes, &mut recv[src * block..(src + 1) * block]);
        }
        Ok(())
    }

    fn alltoallv<T: RelayDatatype>(
        &self,
        send: &[T],
        send_counts: &[i32],
        send_displs: &[i32],
        recv: &mut [T],
        recv_counts: &[i32],
        recv_displs: &[i32],
    ) -> Result<()> {
        let n = self.shared.size;
        let prepared = self
            .prepare_variable(send, send_counts, send_displs)
            .and_then(|outgoing| {
                check_tables(n, &[recv_counts, recv_displs])?;
                for src in 0..n {
                    window(recv_counts, recv_displs, src, recv.len())?;
                }
                Ok(outgoing)
            });
        let incoming = self.exchange_or_skip(prepared)?;

        for (src, bytes) in incoming.iter().enumerate() {
            let range = window(recv_counts, recv_displs, src, recv.len())?;
            let elements = bytes.len() / T::SIZE;
            if elements > range.len() {
                return Err(Error::Transport(format!(
                    "message from rank {src} truncated: {elements} elements into a window of {}",
                    range.len()
                )));
            }
            T::decode(bytes, &mut recv[range.start..range.start + elements]);
        }
        Ok(())
    }
}

fn check_tables(n: usize, tables: &[&[i32]]) -> Result<()> {
    if tables.iter().all(|table| table.len() == n) {
        Ok(())
    } else {
        Err(Error::InvalidBuffer)
    }
}

fn window(counts: &[i32], displs: &[i32], peer: usize, len: usize) -> Result<Range<usize>> {
    let count = usize::try_from(counts[peer]).map_err(|_| Error::InvalidCount(counts[peer].into()))?;
    let start = usize::try_from(displs[peer]).map_err(|_| Error::InvalidCount(displs[peer].into()))?;
    let end = start
        .checked_add(count)
        .filter(|&end| end <= len)
        .ok_or(Error::InvalidBuffer)?;
    Ok(start..end)
}

/// Run `body` once per participant of a fresh group, each on its own thread.
///
/// Results are returned in rank order. A panicking participant is re-raised
/// on the calling thread; its peers may be left blocked in a collective, so
/// this is intended for tests and tools rather than long-lived services.
pub fn run_group<T, F>(size: usize, body: F) -> Vec<T>
where
    F: Fn(LocalComm) -> T + Sync,
    T: Send,
{
    let body = &body;
    std::thread::scope(|scope| {
        let handles: Vec<_> = LocalComm::group(size)
            .into_iter()
            .map(|comm| scope.spawn(move || body(comm)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    })
}

#[derive(Debug, Default)]
struct RuntimeState {
    active: AtomicBool,
    starts: AtomicUsize,
    shutdowns: AtomicUsize,
}

/// In-process stand-in for the collective runtime.
///
/// Clones share state, so a test can hand one clone to the relay and keep
/// another to observe how often the runtime was started and shut down.
#[derive(Debug, Clone, Default)]
pub struct LocalRuntime {
    state: Arc<RuntimeState>,
}

impl LocalRuntime {
    /// A runtime that has not been started.
    pub fn new() -> Self {
        Self::default()
    }

    /// A runtime someone else already started.
    pub fn already_active() -> Self {
        let runtime = Self::default();
        runtime.state.active.store(true, Ordering::SeqCst);
        runtime
    }

    /// Number of successful `start` calls.
    pub fn starts(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    /// Number of `shutdown` calls that actually stopped the runtime.
    pub fn shutdowns(&self) -> usize {
        self.state.shutdowns.load(Ordering::SeqCst)
    }
}

impl Runtime for LocalRuntime {
    fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    fn start(&self) -> Result<()> {
        if self.state.active.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        if self.state.active.swap(false, Ordering::SeqCst) {
            self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
