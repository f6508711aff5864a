//! The connection fleet: per-connection sender/receiver thread pairs, a
//! synchronized startup, and failure-isolated result collection.

use std::fs::File;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use eyre::{bail, Result, WrapErr};
use tracing::{debug, warn};

use crate::connect::{connect_tcp, AddrFamily, ConnectOpts};
use crate::monotonic_ns;
use crate::sync::{Gate, LaunchBarrier};
use crate::xfer::{recv_full, send_file};

/// Upper bound on the connection count; keeps the barrier participant count
/// (2N + 1) well inside its range.
pub const MAX_CONNECTIONS: usize = (u32::MAX / 2) as usize - 1;

/// Workers mostly block on I/O and many may run at once; the deepest stack
/// user is the resolver inside `connect_tcp`.
const WORKER_STACK: usize = 64 * 1024;

const RECV_BUF: usize = 32 * 1024;

/// Benchmark parameters for one fleet run.
#[derive(Clone, Debug)]
pub struct FleetConfig {
    /// Request payload; every connection opens its own read-only handle.
    pub input_path: String,
    /// Response file template: the 1-based connection index replaces the
    /// first `{}`, or is appended as `.N` when there is no placeholder.
    pub output_template: String,
    pub host: String,
    /// Numeric port or service name.
    pub port: String,
    pub connections: usize,
    /// Half-close the socket once the full payload is sent.
    pub half_close: bool,
    /// Skip response files entirely; received bytes are still counted.
    pub discard_responses: bool,
    /// Forwarded to the connector as a TCP fast-open hint.
    pub fast_open: bool,
}

/// Timings and totals of one successful connection. Timestamps are
/// nanoseconds on the same arbitrary monotonic epoch as [`monotonic_ns`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnStats {
    pub total_sent: u64,
    pub total_received: u64,
    pub connect_start_ns: u64,
    pub connect_end_ns: u64,
    pub send_start_ns: u64,
    pub send_end_ns: u64,
    pub receive_start_ns: u64,
    pub receive_end_ns: u64,
}

struct SenderReport {
    connect_start_ns: u64,
    connect_end_ns: u64,
    send_start_ns: u64,
    send_end_ns: u64,
}

struct ReceiverReport {
    receive_start_ns: u64,
    receive_end_ns: u64,
    total_received: u64,
}

/// State shared between one connection's sender and receiver.
struct ConnShared {
    gate: Gate,
    /// Populated by the sender once connected; duplicated by the receiver
    /// for draining and used by the orchestrator to unblock stragglers.
    socket: Mutex<Option<TcpStream>>,
}

struct ConnSlot {
    shared: Arc<ConnShared>,
    sender: Option<JoinHandle<Result<SenderReport, String>>>,
    receiver: Option<JoinHandle<Result<ReceiverReport, String>>>,
}

impl ConnSlot {
    /// Best-effort unblock of a worker parked in a blocking socket call.
    fn shutdown_socket(&self) {
        let socket = self
            .shared
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(s) = socket.as_ref() {
            let _ = s.shutdown(Shutdown::Both);
        }
    }

    fn join_quietly(&mut self) {
        if let Some(h) = self.sender.take() {
            let _ = h.join();
        }
        if let Some(h) = self.receiver.take() {
            let _ = h.join();
        }
    }
}

/// A constructed fleet whose workers are parked on the launch barrier.
/// Dropping it, run or not, wakes and joins every worker and releases
/// every file and socket exactly once.
pub struct Fleet {
    barrier: Arc<LaunchBarrier>,
    slots: Vec<ConnSlot>,
    payload_len: u64,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("connections", &self.slots.len())
            .field("payload_len", &self.payload_len)
            .finish()
    }
}

impl Fleet {
    /// Open all files, build the synchronization primitives, and start every
    /// worker pair. Any failure tears down everything created so far and
    /// reports a single diagnostic; partially constructed fleets never run.
    pub fn create(cfg: &FleetConfig) -> Result<Fleet> {
        if cfg.connections == 0 || cfg.connections > MAX_CONNECTIONS {
            bail!(
                "number of connections must be between 1 and {MAX_CONNECTIONS}, got {}",
                cfg.connections
            );
        }
        let mut fleet = Fleet {
            barrier: Arc::new(LaunchBarrier::new(cfg.connections * 2 + 1)),
            slots: Vec::with_capacity(cfg.connections),
            payload_len: 0,
        };
        for index in 1..=cfg.connections {
            // teardown of already-started pairs happens in Drop
            fleet.add_conn(cfg, index)?;
        }
        debug!(
            connections = cfg.connections,
            payload_len = fleet.payload_len,
            "fleet ready, workers parked on the launch barrier"
        );
        Ok(fleet)
    }

    fn add_conn(&mut self, cfg: &FleetConfig, index: usize) -> Result<()> {
        let input = File::open(&cfg.input_path)
            .wrap_err_with(|| format!("cannot open input file '{}'", cfg.input_path))?;
        if index == 1 {
            // the first handle fixes the payload length for the whole fleet
            self.payload_len = input
                .metadata()
                .wrap_err_with(|| format!("cannot stat input file '{}'", cfg.input_path))?
                .len();
        }
        let output = if cfg.discard_responses {
            None
        } else {
            let path = format_output_path(&cfg.output_template, index);
            let file = File::create(&path)
                .wrap_err_with(|| format!("cannot open output file '{path}'"))?;
            Some((file, path))
        };

        let shared = Arc::new(ConnShared {
            gate: Gate::new(),
            socket: Mutex::new(None),
        });

        let sender_job = SenderJob {
            shared: shared.clone(),
            barrier: self.barrier.clone(),
            host: cfg.host.clone(),
            port: cfg.port.clone(),
            input,
            payload_len: self.payload_len,
            half_close: cfg.half_close,
            fast_open: cfg.fast_open,
        };
        let sender = thread::Builder::new()
            .name(format!("sender-{index}"))
            .stack_size(WORKER_STACK)
            .spawn(move || sender_main(sender_job))
            .wrap_err_with(|| format!("failed to start sender thread #{index}"))?;

        let mut slot = ConnSlot {
            shared: shared.clone(),
            sender: Some(sender),
            receiver: None,
        };
        let receiver_job = ReceiverJob {
            shared,
            barrier: self.barrier.clone(),
            output,
        };
        match thread::Builder::new()
            .name(format!("receiver-{index}"))
            .stack_size(WORKER_STACK)
            .spawn(move || receiver_main(receiver_job))
        {
            Ok(receiver) => {
                slot.receiver = Some(receiver);
                self.slots.push(slot);
                Ok(())
            }
            Err(e) => {
                // keep the half-built slot so Drop joins the lone sender
                self.slots.push(slot);
                Err(e).wrap_err_with(|| format!("failed to start receiver thread #{index}"))
            }
        }
    }

    /// Release the launch barrier and collect one outcome per connection, in
    /// creation order. A connection whose sender failed reports the sender's
    /// diagnostic; its receiver may be parked on a socket that will never
    /// see more data, so it is unblocked by shutting the socket down rather
    /// than waited on for a result.
    pub fn run(mut self) -> Vec<Result<ConnStats, String>> {
        debug!("releasing launch barrier");
        // the orchestrator is the final participant; this wait is the release
        let _ = self.barrier.wait();

        let payload_len = self.payload_len;
        let mut results = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter_mut().enumerate() {
            results.push(collect_conn(slot, payload_len, i + 1));
        }
        results
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        // uniform teardown for full, partial, and never-run fleets
        self.barrier.cancel();
        for slot in &mut self.slots {
            slot.shutdown_socket();
            slot.join_quietly();
        }
    }
}

/// Create and immediately run a fleet. Returns a setup diagnostic, or one
/// outcome per connection in creation order.
pub fn run_fleet(cfg: &FleetConfig) -> Result<Vec<Result<ConnStats, String>>> {
    Ok(Fleet::create(cfg)?.run())
}

fn collect_conn(
    slot: &mut ConnSlot,
    payload_len: u64,
    index: usize,
) -> Result<ConnStats, String> {
    let sender_report = match slot.sender.take() {
        Some(handle) => join_worker(handle),
        None => Err("sender thread was never started".to_string()),
    };
    let sender_report = match sender_report {
        Ok(report) => report,
        Err(diag) => {
            // the receiver may be draining a socket that will never see an
            // orderly close; shut the socket down to unpark it
            warn!(connection = index, error = %diag, "sender failed, unblocking receiver");
            slot.shutdown_socket();
            if let Some(h) = slot.receiver.take() {
                let _ = h.join();
            }
            return Err(diag);
        }
    };

    let receiver_report = match slot.receiver.take() {
        Some(handle) => join_worker(handle)?,
        None => return Err("receiver thread was never started".to_string()),
    };

    Ok(ConnStats {
        total_sent: payload_len,
        total_received: receiver_report.total_received,
        connect_start_ns: sender_report.connect_start_ns,
        connect_end_ns: sender_report.connect_end_ns,
        send_start_ns: sender_report.send_start_ns,
        send_end_ns: sender_report.send_end_ns,
        receive_start_ns: receiver_report.receive_start_ns,
        receive_end_ns: receiver_report.receive_end_ns,
    })
}

fn join_worker<T>(handle: JoinHandle<Result<T, String>>) -> Result<T, String> {
    match handle.join() {
        Ok(outcome) => outcome,
        Err(_) => Err("worker thread panicked".to_string()),
    }
}

struct SenderJob {
    shared: Arc<ConnShared>,
    barrier: Arc<LaunchBarrier>,
    host: String,
    port: String,
    input: File,
    payload_len: u64,
    half_close: bool,
    fast_open: bool,
}

fn sender_main(job: SenderJob) -> Result<SenderReport, String> {
    if job.barrier.wait().is_err() {
        job.shared.gate.open();
        return Err("fleet startup was aborted".to_string());
    }

    let connect_start_ns = monotonic_ns();
    let connected = connect_tcp(
        AddrFamily::Unspec,
        &job.host,
        &job.port,
        &ConnectOpts {
            fast_open: job.fast_open,
            ..ConnectOpts::default()
        },
    );
    let connect_end_ns = monotonic_ns();

    let connected = connected
        .map_err(|e| format!("cannot open TCP connection to {}:{}: {e}", job.host, job.port))
        .and_then(|stream| {
            let dup = stream
                .try_clone()
                .map_err(|e| format!("cannot duplicate socket handle: {e}"))?;
            *job.shared
                .socket
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(dup);
            Ok(stream)
        });
    // the receiver is parked on the gate; it must be released no matter how
    // the connect went
    job.shared.gate.open();
    let stream = connected?;

    let send_start_ns = monotonic_ns();
    send_file(&stream, &job.input, job.payload_len).map_err(|e| format!("sendfile failed: {e}"))?;
    if job.half_close {
        // end-of-output for the peer; the socket stays readable
        let _ = stream.shutdown(Shutdown::Write);
    }
    let send_end_ns = monotonic_ns();

    Ok(SenderReport {
        connect_start_ns,
        connect_end_ns,
        send_start_ns,
        send_end_ns,
    })
}

struct ReceiverJob {
    shared: Arc<ConnShared>,
    barrier: Arc<LaunchBarrier>,
    /// Response file and its path for diagnostics; `None` discards.
    output: Option<(File, String)>,
}

fn receiver_main(job: ReceiverJob) -> Result<ReceiverReport, String> {
    let ReceiverJob {
        shared,
        barrier,
        mut output,
    } = job;
    if barrier.wait().is_err() {
        return Err("fleet startup was aborted".to_string());
    }

    // rendezvous with the sender: the gate opens once the socket slot holds
    // a connected stream, or once the connect has definitively failed
    shared.gate.wait();
    let stream = {
        let slot = shared.socket.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(s) => s
                .try_clone()
                .map_err(|e| format!("cannot duplicate socket handle: {e}"))?,
            None => return Err("connection was never established".to_string()),
        }
    };

    let receive_start_ns = monotonic_ns();
    let mut buf = vec![0u8; RECV_BUF];
    let mut total_received = 0u64;
    let receive_end_ns = loop {
        let n = recv_full(&stream, &mut buf).map_err(|e| format!("recv failed: {e}"))?;
        if n == 0 {
            // orderly shutdown by the peer
            break monotonic_ns();
        }
        total_received += n as u64;
        if let Some((file, path)) = output.as_mut() {
            // write_all retries short writes; no silent data loss
            file.write_all(&buf[..n])
                .map_err(|e| format!("cannot write to output file '{path}': {e}"))?;
        }
    };

    Ok(ReceiverReport {
        receive_start_ns,
        receive_end_ns,
        total_received,
    })
}

/// Response file path for a 1-based connection index.
fn format_output_path(template: &str, index: usize) -> String {
    if template.contains("{}") {
        template.replacen("{}", &index.to_string(), 1)
    } else {
        format!("{template}.{index}")
    }
}
