//! Tests for the driver seam types and the in-memory driver.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use test_case::test_case;

use crate::{
    Command, IoQueue, MemDriver, MemQueue, NamespaceInfo, NvmeDriver, Opcode, Payload,
    ProbeError, Status, SubmitResult, Token,
};

const BLOCK: u64 = 512;

fn queue_with_blocks(block_count: u64) -> Arc<MemQueue> {
    let driver = MemDriver::new();
    driver.add_device("mem0", BLOCK, block_count);
    driver.queue("mem0").unwrap()
}

fn poll_one(queue: &MemQueue) -> crate::Completion {
    let mut out = Vec::new();
    let n = queue.poll(&mut out, 32, Duration::from_secs(1));
    assert_eq!(n, 1, "expected exactly one completion");
    out.remove(0)
}

// ============================================================================
// Seam Types
// ============================================================================

#[test]
fn token_preserves_value_and_order() {
    let a = Token::new(7);
    let b = Token::new(9);
    assert_eq!(a.get(), 7);
    assert!(a < b);
    assert_eq!(a.to_string(), "7");
}

#[test]
fn namespace_capacity_in_bytes() {
    let info = NamespaceInfo {
        nsid: 1,
        block_size: 4096,
        block_count: 1024,
    };
    assert_eq!(info.size_bytes(), 4 * 1024 * 1024);
}

#[test_case(Status::Success => false; "success")]
#[test_case(Status::WriteFault => false; "write fault")]
#[test_case(Status::UnrecoveredRead => false; "unrecovered read")]
#[test_case(Status::LbaOutOfRange => false; "lba out of range")]
#[test_case(Status::Aborted => false; "aborted")]
#[test_case(Status::InternalError => true; "internal error")]
fn only_internal_error_is_fatal(status: Status) -> bool {
    status.is_fatal()
}

#[test]
fn status_classification() {
    assert!(Status::Success.is_ok());
    assert!(!Status::WriteFault.is_ok());
    assert_eq!(Status::UnrecoveredRead.to_string(), "unrecovered read error");
}

#[test]
fn command_constructors_set_opcode_and_payload() {
    let read = Command::read(Token::new(1), 4, 2, BytesMut::with_capacity(1024));
    assert_eq!(read.opcode, Opcode::Read);
    assert_eq!(read.lba, 4);
    assert_eq!(read.nblocks, 2);
    assert!(matches!(read.payload, Payload::Read(_)));

    let write = Command::write(Token::new(2), 0, 1, Bytes::from(vec![0xAA; 512]));
    assert_eq!(write.opcode, Opcode::Write);
    assert_eq!(write.payload.len(), 512);

    let zero = Command::write_zeroes(Token::new(3), 8, 4);
    assert_eq!(zero.opcode, Opcode::WriteZeroes);
    assert!(zero.payload.is_empty());

    let flush = Command::flush(Token::new(4));
    assert_eq!(flush.opcode, Opcode::Flush);
    assert_eq!(flush.nblocks, 0);
}

#[test]
fn payload_into_read_returns_buffer_only_for_reads() {
    let mut buf = BytesMut::with_capacity(8);
    buf.extend_from_slice(b"abc");
    assert_eq!(Payload::Read(buf).into_read().unwrap().as_ref(), b"abc");
    assert!(Payload::None.into_read().is_none());
    assert!(Payload::Write(Bytes::from_static(b"x")).into_read().is_none());
}

// ============================================================================
// MemDriver: Probe and Claim
// ============================================================================

#[test]
fn probe_unknown_path_fails() {
    let driver = MemDriver::new();
    assert!(matches!(
        driver.probe("mem9"),
        Err(ProbeError::NotFound { .. })
    ));
}

#[test]
fn probe_claims_exclusively() {
    let driver = MemDriver::new();
    driver.add_device("mem0", BLOCK, 16);

    let controller = driver.probe("mem0").unwrap();
    assert!(matches!(
        driver.probe("mem0"),
        Err(ProbeError::Busy { .. })
    ));

    drop(controller);
    assert!(driver.probe("mem0").is_ok());
}

#[test]
fn controller_reports_registered_geometry() {
    let driver = MemDriver::new();
    driver.add_device("mem0", 4096, 256);

    let controller = driver.probe("mem0").unwrap();
    let info = controller.namespace();
    assert_eq!(info.block_size, 4096);
    assert_eq!(info.block_count, 256);
    assert_eq!(info.size_bytes(), 1024 * 1024);
}

// ============================================================================
// MemQueue: Command Execution
// ============================================================================

#[test]
fn write_then_read_round_trip() {
    let queue = queue_with_blocks(16);
    let data = Bytes::from(vec![0xC3; 2 * BLOCK as usize]);

    let result = queue.submit(Command::write(Token::new(1), 4, 2, data.clone()));
    assert!(matches!(result, SubmitResult::Ok));
    let completion = poll_one(&queue);
    assert_eq!(completion.token, Token::new(1));
    assert_eq!(completion.status, Status::Success);

    let buf = BytesMut::with_capacity(2 * BLOCK as usize);
    queue.submit(Command::read(Token::new(2), 4, 2, buf));
    let completion = poll_one(&queue);
    assert_eq!(completion.status, Status::Success);
    let read_back = completion.payload.into_read().unwrap();
    assert_eq!(read_back.as_ref(), data.as_ref());
}

#[test]
fn write_zeroes_clears_blocks() {
    let queue = queue_with_blocks(8);

    queue.submit(Command::write(
        Token::new(1),
        0,
        2,
        Bytes::from(vec![0xFF; 2 * BLOCK as usize]),
    ));
    poll_one(&queue);

    queue.submit(Command::write_zeroes(Token::new(2), 0, 1));
    assert_eq!(poll_one(&queue).status, Status::Success);

    queue.submit(Command::read(
        Token::new(3),
        0,
        2,
        BytesMut::with_capacity(2 * BLOCK as usize),
    ));
    let read_back = poll_one(&queue).payload.into_read().unwrap();
    assert!(read_back[..BLOCK as usize].iter().all(|&b| b == 0));
    assert!(read_back[BLOCK as usize..].iter().all(|&b| b == 0xFF));
}

#[test]
fn flush_completes_successfully() {
    let queue = queue_with_blocks(8);
    queue.submit(Command::flush(Token::new(1)));
    let completion = poll_one(&queue);
    assert_eq!(completion.status, Status::Success);
    assert!(matches!(completion.payload, Payload::None));
}

#[test]
fn full_queue_returns_command() {
    let driver = MemDriver::new();
    driver.add_device_with_depth("mem0", BLOCK, 16, 2);
    let queue = driver.queue("mem0").unwrap();
    assert_eq!(queue.depth(), 2);

    assert!(matches!(
        queue.submit(Command::flush(Token::new(1))),
        SubmitResult::Ok
    ));
    assert!(matches!(
        queue.submit(Command::flush(Token::new(2))),
        SubmitResult::Ok
    ));
    match queue.submit(Command::flush(Token::new(3))) {
        SubmitResult::Saturated(cmd) => assert_eq!(cmd.token, Token::new(3)),
        SubmitResult::Ok => panic!("queue should be full"),
    }
    assert_eq!(queue.queued(), 2);
}

#[test]
fn injected_status_fails_one_command() {
    let queue = queue_with_blocks(8);
    queue.inject_status(Status::WriteFault);

    queue.submit(Command::write(
        Token::new(1),
        0,
        1,
        Bytes::from(vec![0xEE; BLOCK as usize]),
    ));
    assert_eq!(poll_one(&queue).status, Status::WriteFault);

    // Failed command must not have touched the media.
    queue.submit(Command::read(
        Token::new(2),
        0,
        1,
        BytesMut::with_capacity(BLOCK as usize),
    ));
    let completion = poll_one(&queue);
    assert_eq!(completion.status, Status::Success);
    let read_back = completion.payload.into_read().unwrap();
    assert!(read_back.iter().all(|&b| b == 0));
}

#[test]
fn paused_queue_holds_completions_until_resume() {
    let queue = queue_with_blocks(8);
    queue.pause();
    queue.submit(Command::flush(Token::new(1)));

    let mut out = Vec::new();
    assert_eq!(queue.poll(&mut out, 32, Duration::from_millis(10)), 0);
    assert_eq!(queue.queued(), 1);

    queue.resume();
    assert_eq!(queue.poll(&mut out, 32, Duration::from_secs(1)), 1);
    assert_eq!(out[0].token, Token::new(1));
}

#[test]
fn reversed_batches_complete_out_of_submission_order() {
    let queue = queue_with_blocks(8);
    queue.reverse_completions(true);
    queue.pause();
    for t in 1..=3 {
        queue.submit(Command::flush(Token::new(t)));
    }
    queue.resume();

    let mut out = Vec::new();
    let mut got = Vec::new();
    while got.len() < 3 {
        queue.poll(&mut out, 32, Duration::from_secs(1));
        got.extend(out.drain(..).map(|c| c.token.get()));
    }
    assert_eq!(got, vec![3, 2, 1]);
}

#[test]
fn poll_times_out_on_empty_queue() {
    let queue = queue_with_blocks(8);
    let mut out = Vec::new();
    let started = std::time::Instant::now();
    assert_eq!(queue.poll(&mut out, 32, Duration::from_millis(20)), 0);
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test]
fn zero_wait_poll_does_not_sleep() {
    let queue = queue_with_blocks(8);
    let mut out = Vec::new();
    assert_eq!(queue.poll(&mut out, 32, Duration::ZERO), 0);

    queue.submit(Command::flush(Token::new(1)));
    assert_eq!(queue.poll(&mut out, 32, Duration::ZERO), 1);
}

#[test]
fn poll_respects_batch_limit() {
    let queue = queue_with_blocks(8);
    queue.pause();
    for t in 1..=5 {
        queue.submit(Command::flush(Token::new(t)));
    }
    queue.resume();

    let mut out = Vec::new();
    let n = queue.poll(&mut out, 2, Duration::from_secs(1));
    assert_eq!(n, 2);
    assert_eq!(queue.queued(), 3);
}

// ============================================================================
// Property-Based Tests
// ============================================================================

use proptest::prelude::*;

proptest! {
    /// Property: any in-bounds write reads back intact, wherever it lands.
    #[test]
    fn prop_write_read_round_trip(
        lba in 0u64..32,
        nblocks in 1u32..4,
        fill in any::<u8>(),
    ) {
        prop_assume!(lba + u64::from(nblocks) <= 32);
        let queue = queue_with_blocks(32);
        let len = nblocks as usize * BLOCK as usize;

        queue.submit(Command::write(Token::new(1), lba, nblocks, Bytes::from(vec![fill; len])));
        let mut out = Vec::new();
        queue.poll(&mut out, 32, Duration::from_secs(1));
        prop_assert_eq!(out.remove(0).status, Status::Success);

        queue.submit(Command::read(Token::new(2), lba, nblocks, BytesMut::with_capacity(len)));
        queue.poll(&mut out, 32, Duration::from_secs(1));
        let completion = out.remove(0);
        prop_assert_eq!(completion.status, Status::Success);
        let read_back = completion.payload.into_read().unwrap();
        prop_assert_eq!(read_back.len(), len);
        prop_assert!(read_back.iter().all(|&b| b == fill));
    }
}
