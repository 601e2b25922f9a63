//! Communicator abstraction for distributed construction.
//!
//! The distributed builder only needs a handful of primitives: rank and
//! size, point-to-point byte transfer, and the collectives derived from
//! them (allgather of counts, allreduce sum, alltoallv of payload bytes).
//! Production deployments adapt their transport behind [`Communicator`];
//! [`LocalCluster`] provides an in-process implementation over channels,
//! one thread per rank, used by tests and single-node builds.
//!
//! Counts exchanged through collectives are bounded to the 32-bit range so
//! that adapters backed by MPI-style interfaces cannot overflow.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use std::time::Duration;

use crate::errors::{IndexError, IndexResult};

/// How long a rank waits for a peer message before declaring the build
/// dead.
const RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Fails with [`IndexError::CountOverflow`] when `count` does not fit the
/// 32-bit range used by collective primitives.
pub fn assert_count_is_safe(count: u64) -> IndexResult<()> {
    if count > i32::MAX as u64 {
        return Err(IndexError::CountOverflow(count));
    }
    Ok(())
}

/// The primitives distributed construction requires from its host.
///
/// All collectives must be entered by every rank of the communicator; any
/// failure is fatal to the running build.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Queues `payload` for delivery to `to`. Must not block indefinitely.
    fn send(&self, to: usize, payload: Vec<u8>) -> IndexResult<()>;

    /// Receives the next payload from `from`, in per-peer FIFO order.
    fn recv(&self, from: usize) -> IndexResult<Vec<u8>>;

    /// Gathers one payload per rank, in rank order.
    fn allgather_bytes(&self, payload: &[u8]) -> IndexResult<Vec<Vec<u8>>> {
        for peer in 0..self.size() {
            if peer != self.rank() {
                self.send(peer, payload.to_vec())?;
            }
        }
        let mut gathered = Vec::with_capacity(self.size());
        for peer in 0..self.size() {
            if peer == self.rank() {
                gathered.push(payload.to_vec());
            } else {
                gathered.push(self.recv(peer)?);
            }
        }
        Ok(gathered)
    }

    /// Gathers every rank's element count, in rank order.
    fn allgather_counts(&self, count: usize) -> IndexResult<Vec<usize>> {
        assert_count_is_safe(count as u64)?;
        let gathered = self.allgather_bytes(&(count as u64).to_le_bytes())?;
        gathered
            .into_iter()
            .map(|bytes| decode_u64(&bytes).map(|v| v as usize))
            .collect()
    }

    fn allreduce_sum(&self, value: u64) -> IndexResult<u64> {
        let gathered = self.allgather_bytes(&value.to_le_bytes())?;
        let mut sum = 0u64;
        for bytes in gathered {
            sum += decode_u64(&bytes)?;
        }
        Ok(sum)
    }

    /// Sends `payloads[i]` to rank `i` and returns the payloads received,
    /// indexed by source rank.
    fn alltoallv(&self, payloads: Vec<Vec<u8>>) -> IndexResult<Vec<Vec<u8>>> {
        if payloads.len() != self.size() {
            return Err(IndexError::InvalidArgument(format!(
                "alltoallv expects one payload per rank, got {} for {} ranks",
                payloads.len(),
                self.size()
            )));
        }
        for payload in &payloads {
            assert_count_is_safe(payload.len() as u64)?;
        }

        let mut own = Vec::new();
        for (peer, payload) in payloads.into_iter().enumerate() {
            if peer == self.rank() {
                own = payload;
            } else {
                self.send(peer, payload)?;
            }
        }

        let mut received = Vec::with_capacity(self.size());
        for peer in 0..self.size() {
            if peer == self.rank() {
                received.push(std::mem::take(&mut own));
            } else {
                received.push(self.recv(peer)?);
            }
        }
        Ok(received)
    }
}

fn decode_u64(bytes: &[u8]) -> IndexResult<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| IndexError::Comm("truncated count message".into()))?;
    Ok(u64::from_le_bytes(array))
}

struct RankMessage {
    from: usize,
    payload: Vec<u8>,
}

/// One endpoint of an in-process communicator: every rank owns its inbox
/// and a sender for every peer.
pub struct LocalComm {
    rank: usize,
    peers: Vec<Sender<RankMessage>>,
    inbox: Receiver<RankMessage>,
    pending: RefCell<Vec<VecDeque<Vec<u8>>>>,
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, to: usize, payload: Vec<u8>) -> IndexResult<()> {
        let sender = self.peers.get(to).ok_or_else(|| {
            IndexError::Comm(format!("rank {} out of range for send", to))
        })?;
        sender
            .send(RankMessage {
                from: self.rank,
                payload,
            })
            .map_err(|_| IndexError::Comm(format!("rank {} is gone", to)))
    }

    fn recv(&self, from: usize) -> IndexResult<Vec<u8>> {
        if from >= self.size() {
            return Err(IndexError::Comm(format!(
                "rank {} out of range for recv",
                from
            )));
        }

        if let Some(payload) = self.pending.borrow_mut()[from].pop_front() {
            return Ok(payload);
        }

        loop {
            let message = self
                .inbox
                .recv_timeout(RECV_TIMEOUT)
                .map_err(IndexError::comm)?;
            if message.from == from {
                return Ok(message.payload);
            }
            self.pending.borrow_mut()[message.from].push_back(message.payload);
        }
    }
}

/// Runs one closure per rank on its own thread, wired up through channels.
pub struct LocalCluster;

impl LocalCluster {
    /// Spawns `n_ranks` threads, each receiving its own [`LocalComm`], and
    /// returns the per-rank results in rank order. A panicking rank
    /// surfaces as a [`IndexError::Comm`].
    pub fn run<R, F>(n_ranks: usize, f: F) -> IndexResult<Vec<R>>
    where
        F: Fn(&LocalComm) -> IndexResult<R> + Send + Sync,
        R: Send,
    {
        if n_ranks == 0 {
            return Err(IndexError::InvalidArgument(
                "a cluster needs at least one rank".into(),
            ));
        }

        let mut senders = Vec::with_capacity(n_ranks);
        let mut inboxes = Vec::with_capacity(n_ranks);
        for _ in 0..n_ranks {
            let (tx, rx) = channel();
            senders.push(tx);
            inboxes.push(rx);
        }

        let f = &f;
        let outcomes: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = inboxes
                .into_iter()
                .enumerate()
                .map(|(rank, inbox)| {
                    let comm = LocalComm {
                        rank,
                        peers: senders.clone(),
                        inbox,
                        pending: RefCell::new(vec![VecDeque::new(); n_ranks]),
                    };
                    scope.spawn(move || f(&comm))
                })
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });

        outcomes
            .into_iter()
            .enumerate()
            .map(|(rank, outcome)| match outcome {
                Ok(result) => result,
                Err(_) => Err(IndexError::Comm(format!("rank {} panicked", rank))),
            })
            .collect()
    }
}

/// A communicator over the subset of `parent` ranks sharing this rank's
/// color, with ranks renumbered by parent rank order.
pub struct SubComm<'a, C: Communicator + ?Sized> {
    parent: &'a C,
    members: Vec<usize>,
    sub_rank: usize,
}

impl<C: Communicator + ?Sized> Communicator for SubComm<'_, C> {
    fn rank(&self) -> usize {
        self.sub_rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn send(&self, to: usize, payload: Vec<u8>) -> IndexResult<()> {
        let global = *self.members.get(to).ok_or_else(|| {
            IndexError::Comm(format!("sub-rank {} out of range for send", to))
        })?;
        self.parent.send(global, payload)
    }

    fn recv(&self, from: usize) -> IndexResult<Vec<u8>> {
        let global = *self.members.get(from).ok_or_else(|| {
            IndexError::Comm(format!("sub-rank {} out of range for recv", from))
        })?;
        self.parent.recv(global)
    }
}

/// Splits `comm` by color. Collective: every rank must call this; ranks
/// passing `None` do not join any sub-communicator and get `None` back.
pub fn split<C: Communicator + ?Sized>(
    comm: &C,
    color: Option<u64>,
) -> IndexResult<Option<SubComm<'_, C>>> {
    // No color is encoded as u64::MAX, which is never a valid color.
    let encoded = color.unwrap_or(u64::MAX);
    if encoded == u64::MAX && color.is_some() {
        return Err(IndexError::InvalidArgument(
            "u64::MAX is reserved to mean no color".into(),
        ));
    }

    let gathered = comm.allgather_bytes(&encoded.to_le_bytes())?;
    let Some(my_color) = color else {
        return Ok(None);
    };

    let mut members = Vec::new();
    for (rank, bytes) in gathered.iter().enumerate() {
        if decode_u64(bytes)? == my_color {
            members.push(rank);
        }
    }
    let sub_rank = members
        .iter()
        .position(|&r| r == comm.rank())
        .ok_or_else(|| IndexError::Comm("rank missing from its own color group".into()))?;

    Ok(Some(SubComm {
        parent: comm,
        members,
        sub_rank,
    }))
}

/// Restricts `comm` to its first `n_ranks` ranks; the remaining ranks get
/// `None`. Collective.
pub fn shrink<C: Communicator + ?Sized>(
    comm: &C,
    n_ranks: usize,
) -> IndexResult<Option<SubComm<'_, C>>> {
    let color = (comm.rank() < n_ranks).then_some(0);
    split(comm, color)
}
