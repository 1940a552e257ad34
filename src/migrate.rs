use log::debug;

use crate::communication::Communicator;
use crate::communication::Rank;
use crate::communication::Tag;

const REBALANCE_INFO_TAG: Tag = 444;
const REBALANCE_DATA_TAG: Tag = 445;

const NUM_INFO_FIELDS: usize = 3;
const INFO_BYTES: usize = NUM_INFO_FIELDS * std::mem::size_of::<i32>();

/// One element leaving this rank: its destination, its global index,
/// the rank it calls home for interop, and its packed state.
pub(crate) struct MigrationOut {
    pub rank: Rank,
    pub index: usize,
    pub mpi_parent: Rank,
    pub bytes: Vec<u8>,
}

/// One element that arrived, reassembled from the meta and payload
/// messages of its sender.
pub(crate) struct MigrationIn {
    pub index: usize,
    pub mpi_parent: Rank,
    pub bytes: Vec<u8>,
}

fn encode_info(size: usize, index: usize, mpi_parent: Rank) -> Vec<u8> {
    let mut info = Vec::with_capacity(INFO_BYTES);
    info.extend((size as i32).to_le_bytes());
    info.extend((index as i32).to_le_bytes());
    info.extend(mpi_parent.to_le_bytes());
    info
}

fn decode_info(bytes: &[u8]) -> (usize, usize, Rank) {
    debug_assert_eq!(bytes.len(), INFO_BYTES);
    let field = |i: usize| i32::from_le_bytes(bytes[4 * i..4 * i + 4].try_into().unwrap());
    (field(0) as usize, field(1) as usize, field(2))
}

/// Move serialized element state to new owners: a fixed-size meta
/// message `(size, index, mpi_parent)` per element first, then the
/// payload sized by it. All meta transfers complete before any payload
/// buffer is allocated.
pub(crate) fn migrate<C: Communicator>(
    comm: &mut C,
    to_send: Vec<MigrationOut>,
    to_recv: &[Rank],
) -> Vec<MigrationIn> {
    let mut send_info_requests = Vec::with_capacity(to_send.len());
    let mut send_data_requests = Vec::with_capacity(to_send.len());
    for out in to_send {
        debug!(
            "sending element {} (home rank {}) to rank {}",
            out.index, out.mpi_parent, out.rank
        );
        let info = encode_info(out.bytes.len(), out.index, out.mpi_parent);
        send_info_requests.push(comm.post_send(out.rank, REBALANCE_INFO_TAG, info));
        send_data_requests.push(comm.post_send(out.rank, REBALANCE_DATA_TAG, out.bytes));
    }

    let recv_info_requests: Vec<_> = to_recv
        .iter()
        .map(|source| comm.post_recv(*source, REBALANCE_INFO_TAG, INFO_BYTES))
        .collect();
    let infos: Vec<(usize, usize, Rank)> = recv_info_requests
        .into_iter()
        .map(|request| {
            let bytes = comm.wait(request).into_bytes();
            decode_info(&bytes)
        })
        .collect();
    for request in send_info_requests {
        comm.wait(request);
    }

    let recv_data_requests: Vec<_> = infos
        .iter()
        .zip(to_recv)
        .map(|((size, _, _), source)| comm.post_recv(*source, REBALANCE_DATA_TAG, *size))
        .collect();
    let received = infos
        .into_iter()
        .zip(recv_data_requests)
        .map(|((_, index, mpi_parent), request)| {
            let bytes = comm.wait(request).into_bytes();
            debug!("received element {} from home rank {}", index, mpi_parent);
            MigrationIn {
                index,
                mpi_parent,
                bytes,
            }
        })
        .collect();
    for request in send_data_requests {
        comm.wait(request);
    }
    received
}
