//! Process group abstraction and its in-process, thread-per-rank implementation.
//!
//! Every controller operation is a blocking collective over a
//! [`ProcessGroup`]. [`LocalProcessGroup`] runs each rank on its own thread
//! and moves byte payloads over `std::sync::mpsc` channels.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use search::Particle;

use crate::error::DomainError;
use crate::transport::{ParticleDatatype, VERIFY_SENTINEL};

/// Message kinds. A receive only matches a message with the same source and tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    /// Startup layout check
    Verify,
    /// Domain boxes after the tree is built
    Boxes,
    /// Initial particle distribution
    InitialParticles,
    /// Load balancing samples
    WorkSamples,
    /// Rebalanced boxes
    Rebalance,
    /// Ownership transfer batch
    Transfer,
    /// Interaction boxes gathered before the ghost exchange
    InteractionBoxes,
    /// Ghost copies
    Ghosts,
    /// Barrier arrival
    Barrier,
    /// Barrier release
    BarrierRelease,
}

/// Communication layer used by the domain controller.
pub trait ProcessGroup: Send {
    /// Number of ranks.
    fn size(&self) -> usize;

    /// This rank.
    fn rank(&self) -> usize;

    /// Host this rank runs on.
    fn hostname(&self) -> &str;

    /// Queue `payload` for `dest`. Never blocks on the receiver.
    fn send(&self, dest: usize, tag: MessageTag, payload: Vec<u8>) -> Result<(), DomainError>;

    /// Block until a message with `tag` arrives from `source`.
    fn recv(&mut self, source: usize, tag: MessageTag) -> Result<Vec<u8>, DomainError>;

    /// Root sends `payload` to every other rank; everyone returns the root's payload.
    fn broadcast(
        &mut self,
        root: usize,
        tag: MessageTag,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, DomainError> {
        if self.rank() == root {
            for dest in (0..self.size()).filter(|&dest| dest != root) {
                self.send(dest, tag, payload.clone())?;
            }
            Ok(payload)
        } else {
            self.recv(root, tag)
        }
    }

    /// Every rank sends `payload` to every other rank; everyone returns all
    /// payloads indexed by rank, its own included.
    fn allgather(&mut self, tag: MessageTag, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, DomainError> {
        let (rank, size) = (self.rank(), self.size());
        for dest in (0..size).filter(|&dest| dest != rank) {
            self.send(dest, tag, payload.clone())?;
        }
        let mut gathered = Vec::with_capacity(size);
        for source in 0..size {
            if source == rank {
                gathered.push(payload.clone());
            } else {
                gathered.push(self.recv(source, tag)?);
            }
        }
        Ok(gathered)
    }

    /// Block until every rank has arrived.
    fn barrier(&mut self) -> Result<(), DomainError>;

    /// Mark the whole group as failed. Blocked and future calls on every
    /// rank return [`DomainError::Aborted`].
    fn abort(&self, reason: &str);
}

struct Envelope {
    source: usize,
    tag: MessageTag,
    payload: Vec<u8>,
}

/// How often a blocked receive checks the abort flag.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One rank of a group whose ranks are threads of this process.
pub struct LocalProcessGroup {
    rank: usize,
    hostname: String,
    senders: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    pending: VecDeque<Envelope>,
    aborted: Arc<AtomicBool>,
    recv_timeout: Option<Duration>,
}

impl LocalProcessGroup {
    /// Create the handles of a `size`-rank group, indexed by rank. Move each
    /// handle to its own thread.
    pub fn create(size: usize) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::channel()).unzip();
        let aborted = Arc::new(AtomicBool::new(false));
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Self {
                rank,
                hostname: hostname.clone(),
                senders: senders.clone(),
                inbox,
                pending: VecDeque::new(),
                aborted: Arc::clone(&aborted),
                recv_timeout: None,
            })
            .collect()
    }

    /// Give up on a blocking receive after `timeout`. Receives otherwise
    /// wait until the message arrives or the group aborts.
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    fn check_aborted(&self) -> Result<(), DomainError> {
        if self.aborted.load(Ordering::SeqCst) {
            Err(DomainError::Aborted)
        } else {
            Ok(())
        }
    }

    fn take_pending(&mut self, source: usize, tag: MessageTag) -> Option<Vec<u8>> {
        let position = self
            .pending
            .iter()
            .position(|m| m.source == source && m.tag == tag)?;
        self.pending.remove(position).map(|m| m.payload)
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn size(&self) -> usize {
        self.senders.len()
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn send(&self, dest: usize, tag: MessageTag, payload: Vec<u8>) -> Result<(), DomainError> {
        self.check_aborted()?;
        let sender = self.senders.get(dest).ok_or_else(|| DomainError::Communication {
            rank: dest,
            reason: format!("no such rank in a group of {}", self.size()),
        })?;
        sender
            .send(Envelope {
                source: self.rank,
                tag,
                payload,
            })
            .map_err(|_| DomainError::Communication {
                rank: dest,
                reason: "receiver hung up".to_string(),
            })
    }

    fn recv(&mut self, source: usize, tag: MessageTag) -> Result<Vec<u8>, DomainError> {
        if source >= self.size() {
            return Err(DomainError::Communication {
                rank: source,
                reason: format!("no such rank in a group of {}", self.size()),
            });
        }
        if let Some(payload) = self.take_pending(source, tag) {
            return Ok(payload);
        }

        let deadline = self.recv_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            self.check_aborted()?;
            match self.inbox.recv_timeout(POLL_INTERVAL) {
                Ok(message) if message.source == source && message.tag == tag => {
                    return Ok(message.payload);
                }
                Ok(message) => self.pending.push_back(message),
                Err(RecvTimeoutError::Timeout) => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Err(DomainError::Communication {
                            rank: source,
                            reason: format!("timed out waiting for {:?}", tag),
                        });
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DomainError::Communication {
                        rank: source,
                        reason: "group channels closed".to_string(),
                    });
                }
            }
        }
    }

    fn barrier(&mut self) -> Result<(), DomainError> {
        // Gather on rank 0, then release everyone.
        if self.rank == 0 {
            for source in 1..self.size() {
                self.recv(source, MessageTag::Barrier)?;
            }
            for dest in 1..self.size() {
                self.send(dest, MessageTag::BarrierRelease, Vec::new())?;
            }
            Ok(())
        } else {
            self.send(0, MessageTag::Barrier, Vec::new())?;
            self.recv(0, MessageTag::BarrierRelease).map(|_| ())
        }
    }

    fn abort(&self, reason: &str) {
        tracing::error!("Rank {} aborting process group: {}", self.rank, reason);
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// A started process: the group plus the committed particle layout.
pub struct ProcessContext {
    group: Box<dyn ProcessGroup>,
    datatype: ParticleDatatype,
}

impl ProcessContext {
    /// Start up on `group` for `D`-dimensional particles. With
    /// `verify_transport`, rank 0 sends rank 1 a record with its last field
    /// set and rank 1 checks that it arrived intact.
    pub fn initialise<const D: usize>(
        mut group: Box<dyn ProcessGroup>,
        verify_transport: bool,
    ) -> Result<Self, DomainError> {
        let size = group.size();
        let rank = group.rank();
        if size == 0 || rank >= size {
            return Err(DomainError::Config(format!(
                "invalid process group: rank {rank} of {size}"
            )));
        }

        let datatype = ParticleDatatype::commit::<D>()?;

        if rank == 0 {
            tracing::info!(
                "Process group ready: {} ranks, rank {} on {} ({}D, {} byte particle records)",
                size,
                rank,
                group.hostname(),
                datatype.dimensions(),
                datatype.record_size()
            );
        } else {
            tracing::debug!("Rank {} running on {}", rank, group.hostname());
        }

        if verify_transport && size > 1 {
            verify_particle_layout::<D>(group.as_mut(), &datatype)?;
        }

        Ok(Self { group, datatype })
    }

    /// This rank.
    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.group.size()
    }

    /// Committed particle record layout.
    pub fn datatype(&self) -> &ParticleDatatype {
        &self.datatype
    }

    /// The underlying process group.
    pub fn group(&self) -> &dyn ProcessGroup {
        self.group.as_ref()
    }

    /// The underlying process group, for sends and receives.
    pub fn group_mut(&mut self) -> &mut dyn ProcessGroup {
        self.group.as_mut()
    }

    /// Release the datatype registration and hand back the group.
    pub fn finalize(self) -> Box<dyn ProcessGroup> {
        tracing::debug!("Rank {} finalised", self.group.rank());
        self.group
    }
}

fn verify_particle_layout<const D: usize>(
    group: &mut dyn ProcessGroup,
    datatype: &ParticleDatatype,
) -> Result<(), DomainError> {
    match group.rank() {
        0 => {
            let particle = Particle::<D> {
                iorig: VERIFY_SENTINEL,
                ..Particle::default()
            };
            group.send(1, MessageTag::Verify, datatype.encode_particles(&[particle]))
        }
        1 => {
            let payload = group.recv(0, MessageTag::Verify)?;
            let received = datatype.decode_particles::<D>(&payload)?;
            match received.as_slice() {
                [particle] if particle.iorig == VERIFY_SENTINEL => {
                    tracing::debug!("Particle record layout verified");
                    Ok(())
                }
                _ => Err(DomainError::Transport(
                    "the last particle field was not received correctly".to_string(),
                )),
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ParticleRecord;
    use std::thread;

    const RECORD_SIZE: usize = std::mem::size_of::<ParticleRecord>();

    #[test]
    fn out_of_order_messages_are_held() {
        let mut groups = LocalProcessGroup::create(2);
        let mut rank1 = groups.pop().unwrap();
        let rank0 = groups.pop().unwrap();

        rank0.send(1, MessageTag::Ghosts, vec![2]).unwrap();
        rank0.send(1, MessageTag::Transfer, vec![1]).unwrap();

        assert_eq!(rank1.recv(0, MessageTag::Transfer).unwrap(), vec![1]);
        assert_eq!(rank1.recv(0, MessageTag::Ghosts).unwrap(), vec![2]);
    }

    #[test]
    fn broadcast_and_barrier_across_threads() {
        let groups = LocalProcessGroup::create(3);
        let results: Vec<Vec<u8>> = thread::scope(|s| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|mut group| {
                    s.spawn(move || {
                        let payload = if group.rank() == 0 { vec![7, 8, 9] } else { Vec::new() };
                        let received = group.broadcast(0, MessageTag::Boxes, payload).unwrap();
                        group.barrier().unwrap();
                        received
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results.iter().all(|r| r == &vec![7, 8, 9]));
    }

    #[test]
    fn abort_wakes_blocked_receivers() {
        let mut groups = LocalProcessGroup::create(2);
        let rank1 = groups.pop().unwrap();
        let mut rank0 = groups.pop().unwrap();

        rank1.abort("test");
        assert!(matches!(rank0.recv(1, MessageTag::Transfer), Err(DomainError::Aborted)));
        assert!(matches!(rank0.send(1, MessageTag::Transfer, Vec::new()), Err(DomainError::Aborted)));
    }

    #[test]
    fn default_recv_waits_past_slow_senders() {
        let mut groups = LocalProcessGroup::create(2);
        let rank1 = groups.pop().unwrap();
        let mut rank0 = groups.pop().unwrap();
        assert_eq!(rank0.recv_timeout, None);

        let received = thread::scope(|s| {
            s.spawn(move || {
                thread::sleep(Duration::from_millis(300));
                rank1.send(0, MessageTag::Rebalance, vec![5]).unwrap();
            });
            rank0.recv(1, MessageTag::Rebalance)
        });
        assert_eq!(received.unwrap(), vec![5]);
    }

    #[test]
    fn allgather_collects_every_rank_in_order() {
        let groups = LocalProcessGroup::create(3);
        let results: Vec<Vec<Vec<u8>>> = thread::scope(|s| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|mut group| {
                    s.spawn(move || {
                        let payload = vec![group.rank() as u8; group.rank() + 1];
                        group.allgather(MessageTag::InteractionBoxes, payload).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let expected = vec![vec![0], vec![1, 1], vec![2, 2, 2]];
        assert!(results.iter().all(|r| r == &expected));
    }

    #[test]
    fn recv_times_out() {
        let mut groups = LocalProcessGroup::create(2);
        groups.truncate(1);
        let mut rank0 = groups.pop().unwrap().with_recv_timeout(Duration::from_millis(50));
        assert!(matches!(
            rank0.recv(1, MessageTag::Boxes),
            Err(DomainError::Communication { rank: 1, .. })
        ));
    }

    #[test]
    fn initialise_rejects_bad_dimensionality() {
        let group = LocalProcessGroup::create(1).pop().unwrap();
        assert!(ProcessContext::initialise::<4>(Box::new(group), false).is_err());
    }

    #[test]
    fn transport_verification_between_first_two_ranks() {
        let groups = LocalProcessGroup::create(3);
        let outcomes: Vec<bool> = thread::scope(|s| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    s.spawn(move || {
                        ProcessContext::initialise::<3>(Box::new(group), true)
                            .map(|ctx| ctx.datatype().record_size() == RECORD_SIZE)
                            .unwrap_or(false)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(outcomes, vec![true, true, true]);
    }
}
