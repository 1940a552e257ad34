use std::collections::VecDeque;
use std::sync::mpsc::channel;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::thread;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::transport::CollectiveCommunicator;
use super::transport::Completion;
use super::transport::Envelope;
use super::transport::WorldCommunicator;
use super::DataByRank;
use super::Rank;
use super::SizedCommunicator;
use super::Tag;
use crate::perf::WorkReduce;

/// Tag used for the collective operations implemented over
/// point-to-point below. Negative, so it can never collide with an
/// encoded message tag.
const COLLECTIVE_TAG: Tag = -1;

pub(super) struct Message {
    tag: Tag,
    bytes: Vec<u8>,
}

/// An in-process stand-in for the MPI transport. Every pair of ranks
/// is connected by a channel per direction; messages that have arrived
/// but not yet been matched wait in a per-source stash, preserving
/// their arrival order per (source, tag).
pub struct LocalWorld {
    rank: Rank,
    size: usize,
    senders: DataByRank<Sender<Message>>,
    receivers: DataByRank<Receiver<Message>>,
    stash: DataByRank<VecDeque<Message>>,
}

pub enum LocalRequest {
    Send,
    Ready(Vec<u8>),
    Waiting { source: Rank, tag: Tag },
}

/// Create the fully connected channel mesh for `num_ranks` in-process
/// ranks. Each returned world is moved onto its own thread by tests.
pub fn get_local_worlds(num_ranks: usize) -> Vec<LocalWorld> {
    let mut senders_by_owner: Vec<DataByRank<Sender<Message>>> =
        (0..num_ranks).map(|_| DataByRank::empty()).collect();
    let mut receivers_by_owner: Vec<DataByRank<Receiver<Message>>> =
        (0..num_ranks).map(|_| DataByRank::empty()).collect();
    for sender in 0..num_ranks {
        for receiver in 0..num_ranks {
            if sender == receiver {
                continue;
            }
            let (tx, rx) = channel();
            senders_by_owner[sender].insert(receiver as Rank, tx);
            receivers_by_owner[receiver].insert(sender as Rank, rx);
        }
    }
    senders_by_owner
        .into_iter()
        .zip(receivers_by_owner)
        .enumerate()
        .map(|(rank, (senders, receivers))| LocalWorld {
            rank: rank as Rank,
            size: num_ranks,
            senders,
            receivers,
            stash: DataByRank::from_size_and_rank(num_ranks, rank as Rank),
        })
        .collect()
}

impl LocalWorld {
    /// Move everything that has arrived into the stash.
    fn pump(&mut self) {
        for rank in self.other_ranks() {
            while let Ok(message) = self.receivers[rank].try_recv() {
                self.stash[rank].push_back(message);
            }
        }
    }

    /// Take the first stashed message from `source` with the given
    /// tag, if one arrived already.
    fn take_matching(&mut self, source: Rank, tag: Tag) -> Option<Vec<u8>> {
        let queue = &mut self.stash[source];
        let pos = queue.iter().position(|message| message.tag == tag)?;
        Some(queue.remove(pos).unwrap().bytes)
    }

    fn blocking_receive(&mut self, source: Rank, tag: Tag) -> Vec<u8> {
        loop {
            self.pump();
            if let Some(bytes) = self.take_matching(source, tag) {
                return bytes;
            }
            thread::yield_now();
        }
    }

    fn send_to(&mut self, dest: Rank, tag: Tag, bytes: Vec<u8>) {
        self.senders[dest]
            .send(Message { tag, bytes })
            .expect("peer rank hung up");
    }

    fn all_gather_serialized<T: Serialize + DeserializeOwned>(&mut self, send: &T) -> Vec<T> {
        let bytes = bincode::serialize(send).unwrap();
        self.all_gather_bytes(&bytes)
            .iter()
            .map(|bytes| bincode::deserialize(bytes).unwrap())
            .collect()
    }
}

impl WorldCommunicator for LocalWorld {
    type Request = LocalRequest;

    fn post_send(&mut self, dest: Rank, tag: Tag, data: Vec<u8>) -> LocalRequest {
        self.send_to(dest, tag, data);
        LocalRequest::Send
    }

    fn post_recv(&mut self, source: Rank, tag: Tag, _len: usize) -> LocalRequest {
        self.pump();
        match self.take_matching(source, tag) {
            Some(bytes) => LocalRequest::Ready(bytes),
            None => LocalRequest::Waiting { source, tag },
        }
    }

    fn test(&mut self, request: LocalRequest) -> Result<Completion, LocalRequest> {
        match request {
            LocalRequest::Send => Ok(Completion::Send),
            LocalRequest::Ready(bytes) => Ok(Completion::Recv(bytes)),
            LocalRequest::Waiting { source, tag } => {
                self.pump();
                match self.take_matching(source, tag) {
                    Some(bytes) => Ok(Completion::Recv(bytes)),
                    None => Err(LocalRequest::Waiting { source, tag }),
                }
            }
        }
    }

    fn wait(&mut self, request: LocalRequest) -> Completion {
        match request {
            LocalRequest::Send => Completion::Send,
            LocalRequest::Ready(bytes) => Completion::Recv(bytes),
            LocalRequest::Waiting { source, tag } => {
                Completion::Recv(self.blocking_receive(source, tag))
            }
        }
    }

    fn probe(&mut self) -> Envelope {
        loop {
            if let Some(envelope) = self.try_probe() {
                return envelope;
            }
            thread::yield_now();
        }
    }

    fn try_probe(&mut self) -> Option<Envelope> {
        self.pump();
        for rank in self.other_ranks() {
            if let Some(message) = self.stash[rank].front() {
                return Some(Envelope {
                    source: rank,
                    tag: message.tag,
                    len: message.bytes.len(),
                });
            }
        }
        None
    }

    fn send_receive(&mut self, partner: Rank, tag: Tag, data: &[u64]) -> Vec<u64> {
        let bytes = bincode::serialize(&data.to_vec()).unwrap();
        self.send_to(partner, tag, bytes);
        let received = self.blocking_receive(partner, tag);
        bincode::deserialize(&received).unwrap()
    }
}

impl CollectiveCommunicator for LocalWorld {
    fn barrier(&mut self) {
        self.all_gather_bytes(&[]);
    }

    fn all_reduce_work(&mut self, work: &WorkReduce) -> WorkReduce {
        let mut result = WorkReduce::identity();
        for other in self.all_gather_serialized(work) {
            result.combine(&other);
        }
        result
    }

    fn all_reduce_max(&mut self, value: u64) -> u64 {
        self.all_gather_serialized(&value)
            .into_iter()
            .max()
            .unwrap()
    }

    fn all_gather_indices(&mut self, send: &[i64]) -> Vec<i64> {
        self.all_gather_serialized(&send.to_vec())
            .into_iter()
            .flatten()
            .collect()
    }

    fn all_gather_bytes(&mut self, send: &[u8]) -> Vec<Vec<u8>> {
        for rank in self.other_ranks() {
            self.send_to(rank, COLLECTIVE_TAG, send.to_vec());
        }
        self.all_ranks()
            .into_iter()
            .map(|rank| {
                if rank == self.rank {
                    send.to_vec()
                } else {
                    self.blocking_receive(rank, COLLECTIVE_TAG)
                }
            })
            .collect()
    }

    fn gather_bytes(&mut self, root: Rank, send: &[u8]) -> Option<Vec<Vec<u8>>> {
        if self.rank == root {
            Some(
                self.all_ranks()
                    .into_iter()
                    .map(|rank| {
                        if rank == self.rank {
                            send.to_vec()
                        } else {
                            self.blocking_receive(rank, COLLECTIVE_TAG)
                        }
                    })
                    .collect(),
            )
        } else {
            self.send_to(root, COLLECTIVE_TAG, send.to_vec());
            None
        }
    }

    fn broadcast_bytes(&mut self, root: Rank, send: Option<&[u8]>) -> Vec<u8> {
        if self.rank == root {
            let send = send.expect("broadcast root must supply a payload");
            for rank in self.other_ranks() {
                self.send_to(rank, COLLECTIVE_TAG, send.to_vec());
            }
            send.to_vec()
        } else {
            self.blocking_receive(root, COLLECTIVE_TAG)
        }
    }

    // Ties between equal keys are broken by world rank, like
    // MPI_Comm_split does.
    fn split_order_by_key(&mut self, key: i64) -> Vec<Rank> {
        let mut entries = self.all_gather_serialized(&(key, self.rank));
        entries.sort();
        entries.into_iter().map(|(_, rank)| rank).collect()
    }
}

impl SizedCommunicator for LocalWorld {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::get_local_worlds;
    use crate::communication::Completion;
    use crate::communication::SizedCommunicator;
    use crate::communication::WorldCommunicator;

    #[test]
    fn local_world_send_recv() {
        let mut worlds = get_local_worlds(2);
        let mut world1 = worlds.remove(1);
        let mut world0 = worlds.remove(0);
        let handle = thread::spawn(move || {
            let request = world1.post_recv(0, 17, 3);
            world1.wait(request).into_bytes()
        });
        let request = world0.post_send(1, 17, vec![1, 2, 3]);
        assert!(matches!(world0.wait(request), Completion::Send));
        assert_eq!(handle.join().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn local_world_probe_matches_tag_order() {
        let mut worlds = get_local_worlds(2);
        let mut world1 = worlds.remove(1);
        let mut world0 = worlds.remove(0);
        world0.post_send(1, 5, vec![10]);
        world0.post_send(1, 6, vec![20]);
        let env = world1.probe();
        assert_eq!(env.source, 0);
        assert_eq!(env.tag, 5);
        assert_eq!(env.len, 1);
        // Matching by tag skips past the earlier message with tag 5.
        let request = world1.post_recv(0, 6, 1);
        assert_eq!(world1.wait(request).into_bytes(), vec![20]);
        let request = world1.post_recv(0, 5, 1);
        assert_eq!(world1.wait(request).into_bytes(), vec![10]);
    }

    #[test]
    fn local_world_collectives() {
        use crate::communication::CollectiveCommunicator;
        let worlds = get_local_worlds(3);
        let threads: Vec<_> = worlds
            .into_iter()
            .map(|mut world| {
                thread::spawn(move || {
                    let rank = world.rank();
                    let gathered = world.all_gather_bytes(&[rank as u8]);
                    assert_eq!(gathered, vec![vec![0], vec![1], vec![2]]);
                    let max = world.all_reduce_max(rank as u64 * 10);
                    assert_eq!(max, 20);
                    let order = world.split_order_by_key(-(rank as i64));
                    assert_eq!(order, vec![2, 1, 0]);
                    let root_data = world.gather_bytes(1, &[rank as u8 + 1]);
                    if rank == 1 {
                        assert_eq!(root_data.unwrap(), vec![vec![1], vec![2], vec![3]]);
                    } else {
                        assert!(root_data.is_none());
                    }
                    let payload = if rank == 2 { Some(&[42u8][..]) } else { None };
                    assert_eq!(world.broadcast_bytes(2, payload), vec![42]);
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
    }
}
