//! Multi-process test for the shared-memory multi-writer queue.
//!
//! The test binary re-invokes itself with a role in the environment:
//!
//! ```text
//! [orchestrator] --open queue, reader_at(0)------------[drain + verify]--[unlink]
//!                     |                                   ^   ^
//!                     v                                   |   |
//! [writer 0]     ----open---[put seq 0..N]----------------+   |
//! [writer 1]     ----open---[put seq 0..N]--------------------+
//! [tail reader]  ----attach (read-only)---[take until quiet]
//! ```
//!
//! Every writer process reserves space in the same segment, so the
//! orchestrator must see both sequences complete and in order.
//!
//! ```bash
//! cargo test -p strata-icc --test e2e_shm -- --nocapture
//! ```

use std::env;
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use strata_icc::{AdmissionPolicy, MultiWriterQueue, ReadError, RecordReader, SegmentSpec};

/// Writes to stderr with immediate flush to bypass test output capture.
macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const ENV_ROLE: &str = "STRATA_E2E_ROLE";
const ENV_NAME: &str = "STRATA_E2E_NAME";
const ENV_WRITER_ID: &str = "STRATA_E2E_WRITER";

const ROLE_WRITER: &str = "writer";
const ROLE_TAIL: &str = "tail";

const WRITERS: u8 = 2;
const RECORDS_PER_WRITER: u64 = 50_000;

/// Large enough that the orchestrator never gets lapped.
const QUEUE_CAPACITY: usize = 8 << 20;

const WRITER_BATCH_SIZE: u64 = 1_000;
const WRITER_BATCH_DELAY_US: u64 = 100;

const TEST_NAME: &str = "e2e_multi_process_queue";

fn segment(name: &str) -> SegmentSpec {
    SegmentSpec::new(name).in_dir(env::temp_dir())
}

/// `[writer id][seq: u64 le][filler]`, filler length varies with seq.
fn encode(writer: u8, seq: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + 16);
    out.push(writer);
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend(std::iter::repeat_n(writer.wrapping_add(seq as u8), (seq % 17) as usize));
    out
}

fn decode(payload: &[u8]) -> (u8, u64) {
    assert!(payload.len() >= 9, "short record: {} bytes", payload.len());
    let writer = payload[0];
    let seq = u64::from_le_bytes(payload[1..9].try_into().unwrap());
    assert_eq!(payload.len(), 9 + (seq % 17) as usize, "bad length for {writer}/{seq}");
    let fill = writer.wrapping_add(seq as u8);
    assert!(payload[9..].iter().all(|&b| b == fill), "corrupt filler for {writer}/{seq}");
    (writer, seq)
}

fn run_writer(name: &str, id: u8) {
    log!("[WRITER {id}] opening {name}");
    let queue = MultiWriterQueue::open(&segment(name), QUEUE_CAPACITY, AdmissionPolicy::BestEffort)
        .expect("writer: failed to open queue");

    let start = Instant::now();
    for seq in 0..RECORDS_PER_WRITER {
        queue.put(&encode(id, seq)).expect("writer: put failed");
        if (seq + 1) % WRITER_BATCH_SIZE == 0 {
            std::thread::sleep(Duration::from_micros(WRITER_BATCH_DELAY_US));
        }
    }
    let elapsed = start.elapsed();
    let rate = RECORDS_PER_WRITER as f64 / elapsed.as_secs_f64();
    log!("[WRITER {id}] done: {RECORDS_PER_WRITER} records in {elapsed:?} ({rate:.0} rec/s)");
}

/// Read-only attach in tail-follow mode; per-writer sequences must increase.
fn run_tail(name: &str) {
    let open_deadline = Instant::now() + Duration::from_secs(5);
    let mut reader = loop {
        match RecordReader::attach(&segment(name), QUEUE_CAPACITY) {
            Ok(r) => break r,
            Err(_) if Instant::now() < open_deadline => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("[TAIL] failed to attach: {e}"),
        }
    };
    log!("[TAIL] attached at position {}", reader.position());

    let mut last = [None::<u64>; WRITERS as usize];
    let mut read = 0u64;
    let mut quiet = Instant::now();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut buf = Vec::new();
    while Instant::now() < deadline {
        match reader.read_into(&mut buf) {
            Ok(_) => {
                let (w, seq) = decode(&buf);
                let slot = &mut last[w as usize];
                assert!(slot.is_none_or(|prev| seq > prev), "writer {w} went backwards at {seq}");
                *slot = Some(seq);
                read += 1;
                quiet = Instant::now();
            }
            Err(ReadError::Again) => {
                if read > 0 && quiet.elapsed() > Duration::from_millis(200) {
                    break;
                }
                std::hint::spin_loop();
            }
            Err(e) => {
                log!("[TAIL] {e}, resyncing");
                reader.sync_pos();
            }
        }
    }
    log!("[TAIL] read {read} records, {} resyncs", reader.resyncs());
}

fn spawn_role(exe: &std::path::Path, name: &str, role: &str, writer: Option<u8>) -> Child {
    let mut cmd = Command::new(exe);
    cmd.arg("--exact")
        .arg(TEST_NAME)
        .env(ENV_ROLE, role)
        .env(ENV_NAME, name)
        .stderr(Stdio::inherit());
    if let Some(id) = writer {
        cmd.env(ENV_WRITER_ID, id.to_string());
    }
    cmd.spawn().expect("failed to spawn child process")
}

#[test]
fn e2e_multi_process_queue() {
    if let Ok(role) = env::var(ENV_ROLE) {
        let name = env::var(ENV_NAME).expect("STRATA_E2E_NAME not set");
        match role.as_str() {
            ROLE_WRITER => {
                let id = env::var(ENV_WRITER_ID).expect("writer id").parse().expect("writer id");
                run_writer(&name, id);
            }
            ROLE_TAIL => run_tail(&name),
            other => panic!("Unknown role: {other}"),
        }
        return;
    }

    let name = format!("strata_e2e_{}", std::process::id());
    let spec = segment(&name);
    let exe = env::current_exe().expect("Failed to get current executable path");

    let queue = MultiWriterQueue::open(&spec, QUEUE_CAPACITY, AdmissionPolicy::BestEffort)
        .expect("orchestrator: failed to create queue");
    let mut reader = queue.reader_at(0);
    log!("[ORCHESTRATOR] queue {name} at {}", spec.path().display());

    let mut tail = spawn_role(&exe, &name, ROLE_TAIL, None);
    let writers: Vec<_> = (0..WRITERS)
        .map(|id| spawn_role(&exe, &name, ROLE_WRITER, Some(id)))
        .collect();

    let total = WRITERS as u64 * RECORDS_PER_WRITER;
    let mut next = [0u64; WRITERS as usize];
    let mut received = 0u64;
    let mut buf = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(30);
    while received < total && Instant::now() < deadline {
        match reader.read_into(&mut buf) {
            Ok(_) => {
                let (w, seq) = decode(&buf);
                assert_eq!(seq, next[w as usize], "writer {w} out of order");
                next[w as usize] += 1;
                received += 1;
            }
            Err(ReadError::Again) => std::hint::spin_loop(),
            Err(e) => panic!("[ORCHESTRATOR] lost data: {e}"),
        }
    }

    let statuses: Vec<_> = writers
        .into_iter()
        .map(|mut child| child.wait().expect("Failed to wait for writer"))
        .collect();
    let tail_status = tail.wait().expect("Failed to wait for tail reader");

    let _ = strata_shm::unlink(&spec);

    for status in &statuses {
        assert!(status.success(), "writer process failed: {status}");
    }
    assert!(tail_status.success(), "tail reader failed: {tail_status}");
    assert_eq!(received, total);
    assert_eq!(next, [RECORDS_PER_WRITER; WRITERS as usize]);

    let c = queue.counters();
    assert!(c.is_consistent());
    assert_eq!(c.in_flight(), 0);
    log!("[ORCHESTRATOR] {received} records verified across {WRITERS} writer processes");
}
