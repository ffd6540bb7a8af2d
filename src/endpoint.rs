// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The shared-memory endpoint: owns an optional listening region, the
// source address, the control channel, the address table, and the
// operation queues. Ties together bitmap allocators, rings, the control
// channel, and the progress engine into the public send/receive/RMA API.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use log::{debug, trace, warn};

use crate::address::{Address, AddressHandle, AddressOrigin, AddressRecord, AddressStatus, AddressTable};
use crate::config::{fd_ceiling, EndpointOptions};
use crate::control::{endpoint_dir, ControlChannel};
use crate::error::{Error, Result};
use crate::header::{CommandHeader, CommandKind, MessageHeader, MessageKind};
use crate::notify::Notifier;
use crate::operation::{CompletionResult, OpKind, OpQueue, Operation, SpinDeque};
use crate::region::{SharedRegion, BUFFER_SLOT_LEN};
use crate::rma::{self, MemoryHandle, TransferOutcome};

fn process_instance_counter() -> &'static AtomicU8 {
    static COUNTER: OnceLock<AtomicU8> = OnceLock::new();
    COUNTER.get_or_init(|| AtomicU8::new(0))
}

/// Payload already copied out of a released buffer slot, parked until a
/// matching receive is posted.
struct UnexpectedInfo {
    source: Option<AddressHandle>,
    tag: u32,
    data: Vec<u8>,
}

struct ExpectedParked {
    peer: AddressHandle,
    tag: u32,
    op: *const Operation,
}
unsafe impl Send for ExpectedParked {}

struct RetryEntry {
    dest: Address,
    op: *const Operation,
    payload: Vec<u8>,
    tag: u32,
    kind: MessageKind,
}
unsafe impl Send for RetryEntry {}

fn shm_region_name(prefix: &str, user: &str, pid: u32, instance: u8) -> String {
    crate::shm_name::make_shm_name(&format!("{prefix}_{user}-{pid}-{instance}"))
}

/// Select which of a queue pair's two rings this endpoint writes into
/// (`for_write = true`) or drains from, given the address's origin.
///
/// Rings are named from the region owner's perspective (rx = owner's
/// incoming, tx = owner's outgoing). A loopback pair (the endpoint
/// talking to itself) has no "other side" and uses `rx` for both
/// directions. Otherwise: an Expected-origin address means we are an
/// external sender into someone else's region (write rx, read tx); an
/// Unexpected-origin address means we are that region's owner replying
/// through a pair a peer reserved on us (write tx, read rx).
fn select_ring<'a>(
    pair: &'a crate::region::QueuePair,
    origin: AddressOrigin,
    is_loopback: bool,
    for_write: bool,
) -> &'a crate::region::MessageRing {
    if is_loopback {
        return &pair.rx;
    }
    let expected_writes_rx = origin == AddressOrigin::Expected;
    if for_write == expected_writes_rx {
        &pair.rx
    } else {
        &pair.tx
    }
}

/// The shared-memory endpoint.
pub struct Endpoint {
    options: EndpointOptions,
    pub source: Address,
    region: Option<Arc<SharedRegion>>,
    control: ControlChannel,
    control_dir: PathBuf,
    user: String,
    addresses: AddressTable,
    unexpected_messages: SpinDeque<UnexpectedInfo>,
    unexpected_ops: OpQueue,
    expected_ops: SpinDeque<ExpectedParked>,
    retry: SpinDeque<RetryEntry>,
    tx_notify: Option<Notifier>,
    open_fds: AtomicUsize,
    fd_ceiling: u64,
    loopback_pair: Option<usize>,
    loopback_handle: OnceLock<AddressHandle>,
}

fn current_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "user".to_string())
}

impl Endpoint {
    /// Open an endpoint. `listen = true` creates and maps this process's
    /// own shared region so peers can resolve it.
    pub fn open(listen: bool, options: EndpointOptions) -> Result<Self> {
        options.validate()?;
        let pid = std::process::id();
        let instance = process_instance_counter().fetch_add(1, Ordering::AcqRel);
        let user = current_user();
        let tmp = std::env::temp_dir();
        let control_dir = endpoint_dir(&tmp, &options.shm_prefix, &user, pid, instance);

        let control = if listen {
            ControlChannel::bind(&control_dir.join("sock")).map_err(Error::from)?
        } else {
            ControlChannel::unbound().map_err(Error::from)?
        };

        let mut region = None;
        let mut loopback_pair = None;
        if listen {
            let name = shm_region_name(&options.shm_prefix, &user, pid, instance);
            let r = Arc::new(SharedRegion::open(&name).map_err(Error::from)?);
            loopback_pair = Some(r.pair_bitmap().reserve()?);
            region = Some(r);
        }

        let tx_notify = if options.no_wait { None } else { Some(Notifier::create().map_err(Error::from)?) };

        let fd_ceiling_val = fd_ceiling().unwrap_or(u64::MAX);

        let ep = Self {
            options,
            source: Address { pid, instance },
            region,
            control,
            control_dir,
            user,
            addresses: AddressTable::new(),
            unexpected_messages: SpinDeque::new(),
            unexpected_ops: OpQueue::new(),
            expected_ops: SpinDeque::new(),
            retry: SpinDeque::new(),
            tx_notify,
            open_fds: AtomicUsize::new(0),
            fd_ceiling: fd_ceiling_val,
            loopback_pair,
            loopback_handle: OnceLock::new(),
        };
        debug!("endpoint opened: {} (listening={})", ep.source.to_wire(), listen);
        Ok(ep)
    }

    pub fn is_listening(&self) -> bool {
        self.region.is_some()
    }

    fn region_name_for(&self, addr: Address) -> String {
        shm_region_name(&self.options.shm_prefix, &self.user, addr.pid, addr.instance)
    }

    fn control_path_for(&self, addr: Address) -> PathBuf {
        endpoint_dir(&std::env::temp_dir(), &self.options.shm_prefix, &self.user, addr.pid, addr.instance)
            .join("sock")
    }

    /// Resolve (or create) the address record for `addr`. On `Again`, the
    /// caller is expected to park the pending send on the retry queue.
    fn resolve(&self, addr: Address) -> Result<AddressHandle> {
        if addr == self.source {
            let pair = self.loopback_pair.ok_or(Error::BadArgument)?;
            // The loopback handle must be linked into the poll list exactly
            // once, the first time this endpoint addresses itself — unlike
            // the general path below, there's no control-channel round trip
            // to hang that registration off, so a `OnceLock` marks it done.
            let handle = *self.loopback_handle.get_or_init(|| {
                let handle = self.addresses.get_or_insert_with(addr, || {
                    let mut record = AddressRecord::new(addr, AddressOrigin::Expected);
                    record.region = self.region.clone();
                    record.pair_index = Some(pair);
                    record.status = AddressStatus::RESOLVED;
                    record
                });
                self.addresses.link_poll_list(handle);
                handle
            });
            return Ok(handle);
        }

        let handle = self.addresses.get_or_insert_with(addr, || AddressRecord::new(addr, AddressOrigin::Expected));
        let already_resolved = self.addresses.with_record(handle, |r| r.is_resolved()).unwrap_or(false);
        if already_resolved {
            return Ok(handle);
        }

        let region_name = self.region_name_for(addr);
        let region = Arc::new(SharedRegion::open(&region_name).map_err(Error::from)?);
        let pair = region.pair_bitmap().reserve()?;

        let header = CommandHeader {
            origin_pid: self.source.pid,
            origin_instance: self.source.instance,
            pair_index: pair as u8,
            kind: CommandKind::Reserved,
        };

        // Step 3: announce the reservation through the peer's own
        // in-region command queue — the channel that survives `no_wait`
        // mode, where there is no control socket message at all. Gated
        // on CMD_PUSHED so a caller that re-resolves an in-flight handle
        // never pushes the announcement twice.
        let already_pushed = self.addresses.with_record(handle, |r| r.status.contains(AddressStatus::CMD_PUSHED)).unwrap_or(false);
        if !already_pushed {
            if !region.command_queue().push(header.encode()) {
                region.pair_bitmap().release(pair);
                return Err(Error::Again);
            }
            self.mutate_record(handle, |record| {
                record.status |= AddressStatus::CMD_PUSHED;
            });
        }

        let mut fds = Vec::new();
        let (tx_notify, rx_notify) = if self.options.no_wait {
            (None, None)
        } else {
            let tx = Notifier::create().map_err(Error::from)?;
            let rx = Notifier::create().map_err(Error::from)?;
            use std::os::unix::io::AsRawFd;
            fds.push(tx.as_raw_fd());
            fds.push(rx.as_raw_fd());
            (Some(tx), Some(rx))
        };

        // Step 4: when polling is enabled, also hand the notifier fds to
        // the peer over the control socket (shared memory alone cannot
        // carry descriptors).
        let dest_path = self.control_path_for(addr);
        if let Err(e) = self.control.send(&dest_path, header, &fds) {
            region.pair_bitmap().release(pair);
            return Err(e);
        }
        if !fds.is_empty() {
            self.open_fds.fetch_add(fds.len(), Ordering::AcqRel);
        }

        self.mutate_record(handle, |record| {
            record.region = Some(region);
            record.pair_index = Some(pair);
            record.tx_notify = tx_notify;
            record.rx_notify = rx_notify;
            record.status |= AddressStatus::RESOLVED;
        });
        self.addresses.link_poll_list(handle);
        Ok(handle)
    }

    /// Mutate a record in place under the address table's write lock,
    /// excluding concurrent readers (e.g. `drain_one_ring`) and other
    /// resolvers for the duration of `f`.
    fn mutate_record(&self, handle: AddressHandle, f: impl FnOnce(&mut AddressRecord)) {
        self.addresses.with_record_mut(handle, f);
    }

    // ---------------------------------------------------------------
    // Send path
    // ---------------------------------------------------------------

    fn send_common(&self, dest: Address, payload: &[u8], tag: u32, kind: MessageKind, op: &Operation) -> Result<()> {
        if payload.len() > BUFFER_SLOT_LEN {
            return Err(Error::MessageSize);
        }
        let handle = match self.resolve(dest) {
            Ok(h) => h,
            Err(Error::Again) => {
                self.retry.push_back(RetryEntry {
                    dest,
                    op: op as *const _,
                    payload: payload.to_vec(),
                    tag,
                    kind,
                });
                unsafe { (*(op as *const Operation)).mark_queued() };
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.deliver(handle, payload, tag, kind, op)
    }

    /// Deposit `payload` in the destination's rx ring and wake it, or
    /// park on the retry queue if the copy-buffer pool is saturated.
    fn deliver(&self, handle: AddressHandle, payload: &[u8], tag: u32, kind: MessageKind, op: &Operation) -> Result<()> {
        let dest_addr = self.addresses.with_record(handle, |r| r.addr).ok_or(Error::BadAddress)?;
        let region = self
            .addresses
            .with_record(handle, |r| r.region.clone())
            .flatten()
            .ok_or(Error::BadAddress)?;
        let pair_index = self.addresses.with_record(handle, |r| r.pair_index).flatten().ok_or(Error::BadAddress)?;
        let origin = self.addresses.with_record(handle, |r| r.origin).ok_or(Error::BadAddress)?;

        let slot = match region.buffer_bitmap().reserve() {
            Ok(s) => s,
            Err(Error::Again) => {
                self.retry.push_back(RetryEntry {
                    dest: dest_addr,
                    op: op as *const _,
                    payload: payload.to_vec(),
                    tag,
                    kind,
                });
                unsafe { (*(op as *const Operation)).mark_queued() };
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        region.write_buffer(slot, payload);
        let header = MessageHeader {
            tag,
            len: payload.len() as u16,
            slot: slot as u8,
            kind,
        };
        let is_loopback = dest_addr == self.source;
        let write_ring = select_ring(region.pair(pair_index), origin, is_loopback, true);
        if !write_ring.push(header.encode()) {
            region.buffer_bitmap().release(slot);
            return Err(Error::Protocol("destination ring full".to_string()));
        }

        self.addresses.with_record(handle, |r| {
            if let Some(n) = &r.tx_notify {
                let _ = n.signal();
            }
        });

        trace!("delivered {} bytes tag={} to {}", payload.len(), tag, dest_addr.to_wire());
        unsafe {
            let op_mut = op as *const Operation as *mut Operation;
            (*op_mut).peer = Some(handle);
            (*op_mut).complete(CompletionResult::Ok);
        }
        Ok(())
    }

    pub fn send_unexpected(&self, dest: Address, payload: &[u8], tag: u32, op: &Operation) -> Result<()> {
        self.send_common(dest, payload, tag, MessageKind::UnexpectedSend, op)
    }

    pub fn send_expected(&self, dest: Address, payload: &[u8], tag: u32, op: &Operation) -> Result<()> {
        self.send_common(dest, payload, tag, MessageKind::ExpectedSend, op)
    }

    // ---------------------------------------------------------------
    // Receive path
    // ---------------------------------------------------------------

    /// Post an unexpected receive. Completes immediately if a message is
    /// already held.
    pub fn recv_unexpected(&self, op: &Operation) {
        if let Some(held) = self.unexpected_messages.pop_front() {
            self.fill_recv(op, held.source, held.tag, &held.data);
            return;
        }
        self.unexpected_ops.push(op as *const _);
    }

    /// Post an expected receive, keyed by (source, tag). Always parks;
    /// expected messages must be pre-posted.
    pub fn recv_expected(&self, source: Address, tag: u32, op: &Operation) {
        let peer = self.addresses.get_or_insert_with(source, || AddressRecord::new(source, AddressOrigin::Expected));
        unsafe { (*(op as *const Operation)).mark_queued() };
        self.expected_ops.push_back(ExpectedParked { peer, tag, op: op as *const _ });
    }

    fn fill_recv(&self, op: &Operation, source: Option<AddressHandle>, tag: u32, data: &[u8]) {
        let op_ptr = op as *const Operation as *mut Operation;
        unsafe {
            let n = data.len().min((*op_ptr).buf_len);
            if !(*op_ptr).buf_ptr.is_null() {
                std::ptr::copy_nonoverlapping(data.as_ptr(), (*op_ptr).buf_ptr, n);
            }
            (*op_ptr).actual_len = n;
            (*op_ptr).tag = tag;
            (*op_ptr).peer = source;
        }
        if let Some(h) = source {
            self.mutate_record(h, |r| {
                r.add_ref();
            });
        }
        op.complete(CompletionResult::Ok);
    }

    // ---------------------------------------------------------------
    // RMA
    // ---------------------------------------------------------------

    /// One-sided put: copy from `local` into `remote`, synchronously, via
    /// a single cross-process copy syscall. Completes `op` before
    /// returning; RMA has no retry/parking path and cannot be canceled.
    pub fn rma_put(
        &self,
        local: &MemoryHandle,
        local_offset: usize,
        remote: &MemoryHandle,
        remote_offset: usize,
        len: usize,
        remote_pid: u32,
        op: &Operation,
    ) -> Result<TransferOutcome> {
        match rma::put(local, local_offset, remote, remote_offset, len, remote_pid) {
            Ok(outcome) => {
                unsafe {
                    let op_ptr = op as *const Operation as *mut Operation;
                    (*op_ptr).actual_len = outcome.bytes;
                }
                op.complete(CompletionResult::Ok);
                Ok(outcome)
            }
            Err(e) => {
                op.complete(CompletionResult::Error);
                Err(e)
            }
        }
    }

    /// One-sided get: copy from `remote` into `local`, synchronously.
    pub fn rma_get(
        &self,
        local: &MemoryHandle,
        local_offset: usize,
        remote: &MemoryHandle,
        remote_offset: usize,
        len: usize,
        remote_pid: u32,
        op: &Operation,
    ) -> Result<TransferOutcome> {
        match rma::get(local, local_offset, remote, remote_offset, len, remote_pid) {
            Ok(outcome) => {
                unsafe {
                    let op_ptr = op as *const Operation as *mut Operation;
                    (*op_ptr).actual_len = outcome.bytes;
                }
                op.complete(CompletionResult::Ok);
                Ok(outcome)
            }
            Err(e) => {
                op.complete(CompletionResult::Error);
                Err(e)
            }
        }
    }

    // ---------------------------------------------------------------
    // Cancellation
    // ---------------------------------------------------------------

    /// Cancel a pending operation. Removes it from whichever parking
    /// queue it sits in, if it hasn't already completed.
    pub fn cancel(&self, op: &Operation) {
        if !op.cancel() {
            return;
        }
        let ptr = op as *const Operation;
        if self.unexpected_ops.remove(ptr) {
            op.complete(CompletionResult::Canceled);
            return;
        }
        if self.expected_ops.remove_first(|e| e.op == ptr).is_some() {
            op.complete(CompletionResult::Canceled);
            return;
        }
        self.retry.remove_first(|e| e.op == ptr);
        // If none of the above matched, the operation wasn't parked
        // anywhere we track (e.g. RMA, which is synchronous and excluded
        // from cancellation) and the CANCELED bit is simply latched for
        // the in-flight completion to observe.
    }

    // ---------------------------------------------------------------
    // Progress engine
    // ---------------------------------------------------------------

    /// Drain whatever is immediately available without blocking.
    pub fn progress_nonblocking(&self) -> Result<bool> {
        let mut did_work = false;
        if self.is_listening() {
            while let Some(cmd) = self.control.try_recv()? {
                self.dispatch_command(cmd);
                did_work = true;
            }
            if let Some(region) = &self.region {
                while let Some(packed) = region.command_queue().pop() {
                    if let Some(header) = CommandHeader::decode(packed) {
                        self.dispatch_command(crate::control::ReceivedCommand { header, fds: Vec::new() });
                        did_work = true;
                    }
                }
            }
        }
        for handle in self.addresses.poll_list_snapshot() {
            while self.drain_one_ring(handle)? {
                did_work = true;
            }
        }
        if self.drain_retry() {
            did_work = true;
        }
        Ok(did_work)
    }

    /// Block on the poll set up to `timeout_ms`, dispatch whatever fired,
    /// then run the retry loop. Reports `Error::Timeout` if nothing
    /// became ready in time.
    pub fn progress_blocking(&self, timeout_ms: i32) -> Result<()> {
        if self.options.no_wait {
            return if self.progress_nonblocking()? { Ok(()) } else { Err(Error::Timeout) };
        }

        let mut fds = Vec::new();
        if self.is_listening() {
            fds.push(self.control.as_raw_fd());
        }
        if let Some(n) = &self.tx_notify {
            use std::os::unix::io::AsRawFd;
            fds.push(n.as_raw_fd());
        }
        let poll_list = self.addresses.poll_list_snapshot();
        let fd_to_handle: HashMap<i32, AddressHandle> = poll_list
            .iter()
            .filter_map(|&h| {
                self.addresses
                    .with_record(h, |r| r.rx_notify.as_ref().map(|n| {
                        use std::os::unix::io::AsRawFd;
                        n.as_raw_fd()
                    }))
                    .flatten()
                    .map(|fd| (fd, h))
            })
            .collect();
        for fd in fd_to_handle.keys() {
            fds.push(*fd);
        }

        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|&fd| libc::pollfd { fd, events: libc::POLLIN, revents: 0 })
            .collect();

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(Error::from(err));
        }
        if rc == 0 {
            if self.drain_retry() {
                return Ok(());
            }
            return Err(Error::Timeout);
        }

        for pfd in &pollfds {
            if pfd.revents & libc::POLLIN == 0 {
                continue;
            }
            if self.is_listening() && pfd.fd == self.control.as_raw_fd() {
                while let Some(cmd) = self.control.try_recv()? {
                    self.dispatch_command(cmd);
                }
            } else if Some(pfd.fd) == self.tx_notify.as_ref().map(|n| {
                use std::os::unix::io::AsRawFd;
                n.as_raw_fd()
            }) {
                if let Some(n) = &self.tx_notify {
                    let _ = n.drain();
                }
            } else if let Some(&handle) = fd_to_handle.get(&pfd.fd) {
                self.addresses.with_record(handle, |r| {
                    if let Some(n) = &r.rx_notify {
                        let _ = n.drain();
                    }
                });
                while self.drain_one_ring(handle)? {}
            }
        }

        self.drain_retry();
        Ok(())
    }

    fn drain_one_ring(&self, handle: AddressHandle) -> Result<bool> {
        let (region, pair_index, origin) = match self
            .addresses
            .with_record(handle, |r| (r.region.clone(), r.pair_index, r.origin))
        {
            Some((Some(region), Some(pair_index), origin)) => (region, pair_index, origin),
            _ => return Ok(false),
        };
        let this_addr = self.addresses.with_record(handle, |r| r.addr).ok_or(Error::BadAddress)?;
        let is_loopback = this_addr == self.source;
        let read_ring = select_ring(region.pair(pair_index), origin, is_loopback, false);
        let packed = match read_ring.pop() {
            Some(p) => p,
            None => return Ok(false),
        };
        let header = match MessageHeader::decode(packed) {
            Some(h) => h,
            None => return Ok(true),
        };

        let mut buf = vec![0u8; header.len as usize];
        region.read_buffer(header.slot as usize, header.len as usize, &mut buf);
        region.buffer_bitmap().release(header.slot as usize);

        match header.kind {
            MessageKind::UnexpectedSend => {
                if let Some(op) = self.unexpected_ops.pop_front() {
                    self.fill_recv(unsafe { &*op }, Some(handle), header.tag, &buf);
                } else {
                    self.unexpected_messages.push_back(UnexpectedInfo {
                        source: Some(handle),
                        tag: header.tag,
                        data: buf,
                    });
                }
            }
            MessageKind::ExpectedSend => {
                match self.expected_ops.remove_first(|e| e.peer == handle && e.tag == header.tag) {
                    Some(parked) => self.fill_recv(unsafe { &*parked.op }, Some(handle), header.tag, &buf),
                    None => warn!("unmatched expected-send tag={} from handle={}", header.tag, handle),
                }
            }
        }
        Ok(true)
    }

    fn drain_retry(&self) -> bool {
        let mut did_work = false;
        loop {
            let entry = match self.retry.pop_front() {
                Some(e) => e,
                None => break,
            };
            let op = unsafe { &*entry.op };
            if op.is_canceled() {
                op.complete(CompletionResult::Canceled);
                did_work = true;
                continue;
            }
            match self.send_common(entry.dest, &entry.payload, entry.tag, entry.kind, op) {
                Ok(()) => {
                    did_work = true;
                }
                Err(Error::Again) => {
                    self.retry.push_back(entry);
                    break;
                }
                Err(_) => {
                    op.complete(CompletionResult::Error);
                    did_work = true;
                }
            }
        }
        did_work
    }

    fn dispatch_command(&self, cmd: crate::control::ReceivedCommand) {
        match cmd.header.kind {
            CommandKind::Reserved => {
                let addr = Address { pid: cmd.header.origin_pid, instance: cmd.header.origin_instance };
                // A `recv_expected(source = addr, ...)` posted before this
                // command arrived may already have created a placeholder
                // record for `addr` via get_or_insert_with; reuse it here
                // rather than inserting a second, disjoint record that
                // `by_key` and the poll list would disagree about.
                let handle = self.addresses.get_or_insert_with(addr, || AddressRecord::new(addr, AddressOrigin::Unexpected));
                let (rx_notify, tx_notify) = if cmd.fds.len() == 2 {
                    use std::os::unix::io::FromRawFd;
                    // Peer's tx is our rx-side notifier source; peer's rx
                    // is the handle we signal when we send to it.
                    self.open_fds.fetch_add(2, Ordering::AcqRel);
                    (Some(unsafe { Notifier::from_raw_fd(cmd.fds[0]) }), Some(unsafe { Notifier::from_raw_fd(cmd.fds[1]) }))
                } else {
                    (None, None)
                };
                self.mutate_record(handle, |record| {
                    record.origin = AddressOrigin::Unexpected;
                    record.region = self.region.clone();
                    record.pair_index = Some(cmd.header.pair_index as usize);
                    // A command-queue-sourced dispatch carries no fds; don't
                    // let it clobber notifiers a control-socket dispatch of
                    // the same RESERVED already installed (or vice versa,
                    // whichever arrives second).
                    if rx_notify.is_some() || tx_notify.is_some() {
                        record.rx_notify = rx_notify;
                        record.tx_notify = tx_notify;
                    }
                    record.status |= AddressStatus::RESOLVED;
                });
                self.addresses.ensure_poll_linked(handle);
                debug!("peer reserved pair {} from {}", cmd.header.pair_index, addr.to_wire());
            }
            CommandKind::Released => {
                let addr = Address { pid: cmd.header.origin_pid, instance: cmd.header.origin_instance };
                if let Some(handle) =
                    self.addresses.find_by_pair(addr.pid, addr.instance, cmd.header.pair_index as usize)
                {
                    let remaining = self.addresses.with_record(handle, |r| r.release_ref()).unwrap_or(0);
                    if remaining == 0 {
                        if let Some(record) = self.addresses.remove(handle) {
                            // Only the side that originally reserved the pair
                            // (origin == Expected) releases the bitmap slot.
                            // The peer already released its own copy of the
                            // same physical bit before sending Released, so
                            // releasing here too would double-free it.
                            if record.origin == AddressOrigin::Expected {
                                if let Some(region) = &record.region {
                                    if let Some(pair) = record.pair_index {
                                        region.pair_bitmap().release(pair);
                                    }
                                }
                            }
                            if record.tx_notify.is_some() {
                                self.open_fds.fetch_sub(1, Ordering::AcqRel);
                            }
                            if record.rx_notify.is_some() {
                                self.open_fds.fetch_sub(1, Ordering::AcqRel);
                            }
                        }
                        debug!("address {} disconnected and cleaned up", addr.to_wire());
                    }
                }
            }
        }
    }

    /// Release an address: best-effort RELEASED command to the peer, then
    /// drop the local record. Errors are swallowed (cleanup is best-effort,
    /// matching this crate's other teardown paths).
    pub fn address_free(&self, handle: AddressHandle) {
        let info = self.addresses.with_record(handle, |r| (r.addr, r.pair_index));
        if let Some((addr, Some(pair_index))) = info {
            let header = CommandHeader {
                origin_pid: self.source.pid,
                origin_instance: self.source.instance,
                pair_index: pair_index as u8,
                kind: CommandKind::Released,
            };
            let path = self.control_path_for(addr);
            let _ = self.control.send_header(&path, header);
        }
        if let Some(record) = self.addresses.remove(handle) {
            if let Some(region) = &record.region {
                if let Some(pair) = record.pair_index {
                    if record.origin == AddressOrigin::Expected {
                        region.pair_bitmap().release(pair);
                    }
                }
            }
            if record.tx_notify.is_some() {
                self.open_fds.fetch_sub(1, Ordering::AcqRel);
            }
            if record.rx_notify.is_some() {
                self.open_fds.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    pub fn open_fd_count(&self) -> usize {
        self.open_fds.load(Ordering::Acquire)
    }

    pub fn fd_ceiling(&self) -> u64 {
        self.fd_ceiling
    }

    /// Close the endpoint. Refuses (returns `Error::Busy`) while any
    /// queue still holds work, mirroring §7's close-refusal semantics.
    pub fn close(self) -> Result<()> {
        if !self.unexpected_ops.is_empty() || !self.expected_ops.is_empty() || !self.retry.is_empty() {
            return Err(Error::Busy);
        }
        if let Some(region) = &self.region {
            region.unlink();
        }
        let _ = std::fs::remove_dir_all(&self.control_dir);
        Ok(())
    }
}
