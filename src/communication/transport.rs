use super::Rank;
use super::Tag;
use crate::perf::WorkReduce;

/// Source, tag and byte count of a message discovered by a wildcard
/// probe, before any buffer for it exists.
#[derive(Clone, Copy, Debug)]
pub struct Envelope {
    pub source: Rank,
    pub tag: Tag,
    pub len: usize,
}

/// What a finished request hands back. Receives yield the filled
/// buffer; the buffer of a send is released by the transport.
pub enum Completion {
    Send,
    Recv(Vec<u8>),
}

impl Completion {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Completion::Send => panic!("send completion carries no payload"),
            Completion::Recv(bytes) => bytes,
        }
    }
}

/// Non-blocking point-to-point messaging with opaque request handles.
/// A request owns its buffer while in flight; the buffer is released
/// (or handed back, for receives) only when completion is observed via
/// `test` or `wait`.
pub trait WorldCommunicator {
    type Request;

    fn post_send(&mut self, dest: Rank, tag: Tag, data: Vec<u8>) -> Self::Request;
    fn post_recv(&mut self, source: Rank, tag: Tag, len: usize) -> Self::Request;
    /// Consumes the request if it finished, returns it otherwise.
    fn test(&mut self, request: Self::Request) -> Result<Completion, Self::Request>;
    fn wait(&mut self, request: Self::Request) -> Completion;
    /// Blocking probe with source and tag wildcards.
    fn probe(&mut self) -> Envelope;
    /// Non-blocking probe; `None` when nothing has arrived.
    fn try_probe(&mut self) -> Option<Envelope>;
    /// Paired exchange with one partner on one tag.
    fn send_receive(&mut self, partner: Rank, tag: Tag, data: &[u64]) -> Vec<u64>;
}

/// The collective operations the runtime needs between phases. Results
/// that aggregate per-rank contributions are always in rank order.
pub trait CollectiveCommunicator {
    fn barrier(&mut self);
    /// Elementwise `(total, max, min, max_local_tasks)` reduction.
    fn all_reduce_work(&mut self, work: &WorkReduce) -> WorkReduce;
    fn all_reduce_max(&mut self, value: u64) -> u64;
    /// All-gather of equally sized index blocks, concatenated in rank
    /// order.
    fn all_gather_indices(&mut self, send: &[i64]) -> Vec<i64>;
    fn all_gather_bytes(&mut self, send: &[u8]) -> Vec<Vec<u8>>;
    /// Returns `Some` with the per-rank payloads on `root`, `None`
    /// elsewhere.
    fn gather_bytes(&mut self, root: Rank, send: &[u8]) -> Option<Vec<Vec<u8>>>;
    /// `send` must be `Some` exactly on `root`.
    fn broadcast_bytes(&mut self, root: Rank, send: Option<&[u8]>) -> Vec<u8>;
    /// Comm-split with a single color: returns the world ranks of the
    /// split communicator in split order, so this rank's position in
    /// the result is its split rank.
    fn split_order_by_key(&mut self, key: i64) -> Vec<Rank>;
}
