use std::mem;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::Mutex;

use lazy_static::lazy_static;
use mpi::datatype::PartitionMut;
use mpi::environment::Universe;
use mpi::request::scope;
use mpi::request::Request;
use mpi::request::StaticScope;
use mpi::request::WaitGuard;
use mpi::topology::Color;
use mpi::topology::SystemCommunicator;
use mpi::traits::Communicator;
use mpi::traits::CommunicatorCollectives;
use mpi::traits::Destination;
use mpi::traits::Equivalence;
use mpi::traits::MatchedReceiveVec;
use mpi::traits::Root;
use mpi::traits::Source;
use mpi::Count;
use mpi::Threading;

use super::transport::CollectiveCommunicator;
use super::transport::Completion;
use super::transport::Envelope;
use super::transport::WorldCommunicator;
use super::Rank;
use super::SizedCommunicator;
use super::Tag;
use crate::perf::WorkReduce;

/// A wrapper around universe which contains the universe in an
/// Option. This allows calling .take at program completion so that
/// the Universe is dropped which will call MPI_FINALIZE.  This is
/// necessary because anything in a lazy_static will never be dropped.
pub struct StaticUniverse(Arc<Mutex<Option<Universe>>>);

impl StaticUniverse {
    pub fn world(&self) -> SystemCommunicator {
        self.0.lock().unwrap().as_ref().unwrap().world()
    }

    pub fn drop(&self) {
        let _ = self.0.lock().unwrap().take();
    }
}

lazy_static! {
    pub static ref MPI_UNIVERSE: StaticUniverse = {
        let threading = Threading::Single;
        let (universe, threading_initialized) =
            mpi::initialize_with_threading(threading).unwrap();
        assert_eq!(
            threading, threading_initialized,
            "Could not initialize MPI with the requested threading level"
        );
        StaticUniverse(Arc::new(Mutex::new(Some(universe))))
    };
}

#[derive(Clone, Copy)]
enum RequestKind {
    Send,
    Recv,
}

/// An in-flight point-to-point transfer. The buffer is leaked for the
/// lifetime of the request and reclaimed when completion is observed.
pub struct MpiRequest {
    request: Request<'static, [u8], StaticScope>,
    buffer: *mut [u8],
    kind: RequestKind,
}

fn reclaim(buffer: *mut [u8], kind: RequestKind) -> Completion {
    let data = unsafe { Box::from_raw(buffer) };
    match kind {
        RequestKind::Send => Completion::Send,
        RequestKind::Recv => Completion::Recv(data.into_vec()),
    }
}

#[derive(Clone)]
pub struct MpiWorld {
    world: SystemCommunicator,
}

impl MpiWorld {
    pub fn new() -> Self {
        Self {
            world: MPI_UNIVERSE.world(),
        }
    }
}

impl Default for MpiWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldCommunicator for MpiWorld {
    type Request = MpiRequest;

    fn post_send(&mut self, dest: Rank, tag: Tag, data: Vec<u8>) -> MpiRequest {
        let buffer: &'static mut [u8] = Box::leak(data.into_boxed_slice());
        let ptr = buffer as *mut [u8];
        let buffer: &'static [u8] = buffer;
        let request = self
            .world
            .process_at_rank(dest)
            .immediate_send_with_tag(StaticScope, buffer, tag);
        MpiRequest {
            request,
            buffer: ptr,
            kind: RequestKind::Send,
        }
    }

    fn post_recv(&mut self, source: Rank, tag: Tag, len: usize) -> MpiRequest {
        let buffer: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        let ptr = buffer as *mut [u8];
        let request = self
            .world
            .process_at_rank(source)
            .immediate_receive_into_with_tag(StaticScope, buffer, tag);
        MpiRequest {
            request,
            buffer: ptr,
            kind: RequestKind::Recv,
        }
    }

    fn test(&mut self, request: MpiRequest) -> Result<Completion, MpiRequest> {
        let MpiRequest {
            request,
            buffer,
            kind,
        } = request;
        match request.test() {
            Ok(_status) => Ok(reclaim(buffer, kind)),
            Err(request) => Err(MpiRequest {
                request,
                buffer,
                kind,
            }),
        }
    }

    fn wait(&mut self, request: MpiRequest) -> Completion {
        let MpiRequest {
            request,
            buffer,
            kind,
        } = request;
        request.wait();
        reclaim(buffer, kind)
    }

    fn probe(&mut self) -> Envelope {
        envelope_from_status(self.world.any_process().probe())
    }

    fn try_probe(&mut self) -> Option<Envelope> {
        self.world
            .any_process()
            .immediate_probe()
            .map(envelope_from_status)
    }

    fn send_receive(&mut self, partner: Rank, tag: Tag, data: &[u64]) -> Vec<u64> {
        let process = self.world.process_at_rank(partner);
        scope(|scope| {
            let _guard = WaitGuard::from(process.immediate_send_with_tag(scope, data, tag));
            let (received, _) = process.matched_probe_with_tag(tag).matched_receive_vec();
            received
        })
    }
}

impl CollectiveCommunicator for MpiWorld {
    fn barrier(&mut self) {
        self.world.barrier();
    }

    // An all-gather followed by a local fold of the associative
    // combine. Good enough as an all-reduce replacement; the tuple is
    // tiny and the fold is rank-order deterministic.
    fn all_reduce_work(&mut self, work: &WorkReduce) -> WorkReduce {
        let all = unchecked_all_gather(self.world, work);
        let mut result = WorkReduce::identity();
        for other in all {
            result.combine(&other);
        }
        result
    }

    fn all_reduce_max(&mut self, value: u64) -> u64 {
        unchecked_all_gather(self.world, &value)
            .into_iter()
            .max()
            .unwrap()
    }

    fn all_gather_indices(&mut self, send: &[i64]) -> Vec<i64> {
        let world_size = self.world.size() as usize;
        let mut result = unsafe { get_buffer::<i64>(world_size * send.len()) };
        self.world.all_gather_into(send, &mut result[..]);
        result
    }

    fn all_gather_bytes(&mut self, send: &[u8]) -> Vec<Vec<u8>> {
        let counts: Vec<Count> = {
            let mut counts = unsafe { get_buffer::<Count>(self.world.size() as usize) };
            self.world
                .all_gather_into(&(send.len() as Count), &mut counts[..]);
            counts
        };
        let total = counts.iter().map(|x| *x as usize).sum();
        let mut result_buffer: Vec<u8> = unsafe { get_buffer(total) };
        let displacements = displacements_from_counts(&counts);
        {
            let mut partition =
                PartitionMut::new(&mut result_buffer[..], &counts[..], &displacements[..]);
            self.world.all_gather_varcount_into(send, &mut partition);
        }
        split_by_counts(result_buffer, &counts)
    }

    fn gather_bytes(&mut self, root: Rank, send: &[u8]) -> Option<Vec<Vec<u8>>> {
        let process = self.world.process_at_rank(root);
        let count = send.len() as Count;
        if self.world.rank() == root {
            let mut counts = unsafe { get_buffer::<Count>(self.world.size() as usize) };
            process.gather_into_root(&count, &mut counts[..]);
            let total = counts.iter().map(|x| *x as usize).sum();
            let mut result_buffer: Vec<u8> = unsafe { get_buffer(total) };
            let displacements = displacements_from_counts(&counts);
            {
                let mut partition =
                    PartitionMut::new(&mut result_buffer[..], &counts[..], &displacements[..]);
                process.gather_varcount_into_root(send, &mut partition);
            }
            Some(split_by_counts(result_buffer, &counts))
        } else {
            process.gather_into(&count);
            process.gather_varcount_into(send);
            None
        }
    }

    fn broadcast_bytes(&mut self, root: Rank, send: Option<&[u8]>) -> Vec<u8> {
        let process = self.world.process_at_rank(root);
        let mut len = send.map(|s| s.len() as Count).unwrap_or(0);
        process.broadcast_into(&mut len);
        let mut buffer = match send {
            Some(send) => send.to_vec(),
            None => vec![0u8; len as usize],
        };
        process.broadcast_into(&mut buffer[..]);
        buffer
    }

    fn split_order_by_key(&mut self, key: i64) -> Vec<Rank> {
        let split = self
            .world
            .split_by_color_with_key(Color::with_value(0), key as i32)
            .unwrap();
        let mut world_ranks = unsafe { get_buffer::<Rank>(split.size() as usize) };
        split.all_gather_into(&self.world.rank(), &mut world_ranks[..]);
        world_ranks
    }
}

impl SizedCommunicator for MpiWorld {
    fn rank(&self) -> Rank {
        self.world.rank()
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }
}

fn envelope_from_status(status: mpi::point_to_point::Status) -> Envelope {
    Envelope {
        source: status.source_rank(),
        tag: status.tag(),
        len: status.count(u8::equivalent_datatype()) as usize,
    }
}

fn displacements_from_counts(counts: &[Count]) -> Vec<Count> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

fn split_by_counts(buffer: Vec<u8>, counts: &[Count]) -> Vec<Vec<u8>> {
    let mut result = Vec::with_capacity(counts.len());
    let mut offset = 0;
    for count in counts {
        let count = *count as usize;
        result.push(buffer[offset..offset + count].to_vec());
        offset += count;
    }
    result
}

unsafe fn get_buffer<T>(num_elements: usize) -> Vec<T> {
    let mut buffer: Vec<MaybeUninit<T>> = Vec::with_capacity(num_elements);
    unsafe {
        buffer.set_len(num_elements);
        mem::transmute(buffer)
    }
}

fn unchecked_all_gather<T: Equivalence>(world: SystemCommunicator, send: &T) -> Vec<T> {
    let mut result_buffer = unsafe { get_buffer(world.size() as usize) };
    world.all_gather_into(send, &mut result_buffer[..]);
    result_buffer
}
