use log::debug;

use super::Runtime;
use crate::communication::Communicator;
use crate::communication::Completion;
use crate::listener::Listener;
use crate::perf::task_clock;
use crate::request::ListenerSlot;
use crate::request::RequestId;
use crate::tag::decode_tag;

impl<C: Communicator> Runtime<C> {
    /// Resolve every registered receive whose size is still unknown:
    /// probe for whatever arrived, size a buffer from the probe, post
    /// the receive and hand the slot to the matching receiver. Active
    /// messages have no pre-registered receiver; their tag names a
    /// generator that fabricates one on the spot.
    ///
    /// Messages that already arrived are drained without touching the
    /// probe budget first, so active messages cannot starve the
    /// registered receives of their probes.
    pub(crate) fn create_pending_recvs(&mut self) {
        while let Some(envelope) = self.comm.try_probe() {
            let fields = decode_tag(envelope.tag);
            let registered = self
                .pending_recvs
                .contains_key(&(envelope.source, envelope.tag));
            if fields.task_id == 0 && !registered {
                // not addressed to any receiver we know about yet
                break;
            }
            self.admit(envelope);
        }
        while self.num_pending_probes > 0 {
            let envelope = self.comm.probe();
            self.admit(envelope);
        }
    }

    /// Allocate the exactly-sized buffer for a probed message, post
    /// its receive, and connect it to the matching receiver.
    fn admit(&mut self, envelope: crate::communication::Envelope) {
        let fields = decode_tag(envelope.tag);
        let request_id = if fields.task_id != 0 {
            let generator = self
                .generators
                .get(fields.task_id as usize)
                .and_then(|generator| generator.clone())
                .unwrap_or_else(|| {
                    panic!(
                        "no receive generator registered for task id {}",
                        fields.task_id
                    )
                });
            generator(self, fields.dst_id, fields.coll_id)
        } else {
            let key = (envelope.source, envelope.tag);
            let queue = self.pending_recvs.get_mut(&key).unwrap_or_else(|| {
                panic!(
                    "unable to find tag {} from rank {}",
                    envelope.tag, envelope.source
                )
            });
            let id = queue.pop_front().unwrap();
            if queue.is_empty() {
                self.pending_recvs.remove(&key);
            }
            debug_assert!(self.num_pending_probes > 0);
            self.num_pending_probes -= 1;
            id
        };
        let request = self
            .comm
            .post_recv(envelope.source, envelope.tag, envelope.len);
        self.requests.set_request(request_id, request);
    }

    /// One test pass over the request table, informing the listener of
    /// every completed slot.
    pub(crate) fn progress_dependencies(&mut self) {
        self.create_pending_recvs();
        let mut completed = vec![];
        for id in 0..self.requests.len() {
            if let Some(request) = self.requests.take_request(id) {
                match self.comm.test(request) {
                    Ok(completion) => completed.push((id, completion)),
                    Err(request) => self.requests.put_back(id, request),
                }
            }
        }
        for (id, completion) in completed.into_iter().rev() {
            self.inform_listener(id, completion);
        }
        self.requests.shrink();
    }

    fn inform_listener(&mut self, id: RequestId, completion: Completion) {
        match self.requests.take_slot(id) {
            ListenerSlot::Vacant => {
                // completed before anyone registered; leave the marker
                // for register_dependency
                self.requests.mark_cleared(id);
            }
            ListenerSlot::Active(Listener::Task(entry)) => {
                if entry.decrement_join_counter() == 0 && !entry.is_queued() {
                    entry.set_queued();
                    self.task_queue.push_back(entry);
                }
                self.requests.release(id);
            }
            ListenerSlot::Active(Listener::PendingSend) => {
                // the buffer died with the request
                self.requests.release(id);
            }
            ListenerSlot::Active(Listener::PendingRecv(pending)) => {
                if pending.decrement_join_counter() == 0 {
                    pending.finalize(completion.into_bytes());
                }
                self.requests.release(id);
            }
            ListenerSlot::Free | ListenerSlot::Cleared => {
                panic!("listener slot {} in an unexpected state", id)
            }
        }
    }

    /// Run ready tasks from the head of the queue, charging each run
    /// to its element's counter.
    pub(crate) fn progress_tasks(&mut self) {
        while let Some(entry) = self.task_queue.front() {
            if entry.join_counter() != 0 {
                return;
            }
            let entry = self.task_queue.pop_front().unwrap();
            let body = entry.take_body();
            let t_start = task_clock();
            if let Some(body) = body {
                body(self);
            }
            let t_stop = task_clock();
            entry.add_counter(t_stop - t_start);
        }
    }

    /// One step of the engine: finish what the transport has, then run
    /// whatever became ready.
    pub fn progress_engine(&mut self) {
        self.progress_dependencies();
        self.progress_tasks();
    }

    /// Drive the engine until the task queue drains. This is the
    /// synchronization point between phases, before interop and before
    /// any collective.
    pub fn clear_tasks(&mut self) {
        while !self.task_queue.is_empty() {
            self.progress_dependencies();
            self.progress_tasks();
        }
    }

    /// Wait out every outstanding transfer and drop the whole table.
    pub fn clear_dependencies(&mut self) {
        self.create_pending_recvs();
        let mut completed = vec![];
        for id in 0..self.requests.len() {
            if let Some(request) = self.requests.take_request(id) {
                completed.push((id, self.comm.wait(request)));
            }
        }
        let num_completed = completed.len();
        for (id, completion) in completed {
            self.inform_listener(id, completion);
        }
        if num_completed > 0 {
            debug!("cleared {} outstanding requests", num_completed);
        }
        self.requests.clear();
        self.pending_recvs.clear();
    }
}
