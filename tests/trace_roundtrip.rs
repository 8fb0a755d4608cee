//! End-to-end capture tests: a scripted gdbstub plays a deterministic
//! execution, the writer records it over the wire protocol, and the reader
//! must materialise exactly the states the script produced.

use calvados::gdb::{RemoteTarget, Stream};
use calvados::registers::Register;
use calvados::trace::diff::BytesPatch;
use calvados::trace::reader::TraceReader;
use calvados::trace::writer::{
    CaptureOptions, MemoryProbe, Probe, RegisterSetProbe, StopReason, TraceWriter,
};
use calvados::trace::{ComponentState, TraceFile};
use rand::{rng, RngCore};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

const ROM_BASE: u32 = 0;
const RAM_BASE: u32 = 0x2000_0000;
const RAM_SIZE: usize = 64;
const ROM: [u8; 8] = [0x42, 0x23, 0x01, 0x31, 0x01, 0x31, 0xfe, 0xe7];

/// Deterministic toy machine driven by the protocol script.
struct Sim {
    steps: u64,
    max_steps: u64,
}

impl Sim {
    fn new(max_steps: u64) -> Self {
        Self { steps: 0, max_steps }
    }

    fn step(&mut self) {
        if self.steps < self.max_steps {
            self.steps += 1;
        }
    }

    fn pc(&self) -> u32 {
        ROM_BASE + 2 * self.steps.min(self.max_steps) as u32
    }

    fn reg(&self, index: usize) -> u32 {
        match index {
            0 => self.steps as u32,
            1 => 0xdeadbeef,
            15 => self.pc(),
            _ => 0,
        }
    }

    fn psr(&self) -> u32 {
        if self.steps % 2 == 0 {
            0x2000_0000
        } else {
            0x8000_0000
        }
    }

    fn ram(&self) -> Vec<u8> {
        let mut ram = vec![0u8; RAM_SIZE];
        for step in 1..=self.steps {
            ram[(step as usize * 4) % RAM_SIZE] = step as u8;
        }
        ram
    }

    fn read_memory(&self, address: u32, length: u32) -> Vec<u8> {
        let (base, backing) = if address >= RAM_BASE {
            (RAM_BASE, self.ram())
        } else {
            (ROM_BASE, ROM.to_vec())
        };
        let offset = (address - base) as usize;
        backing[offset..offset + length as usize].to_vec()
    }
}

fn reply_for(sim: &mut Sim, command: &str) -> Option<Vec<u8>> {
    if command.starts_with("vCont") {
        sim.step();
        return Some(b"S05".to_vec());
    }
    if command == "g" {
        let mut dump = String::new();
        for index in 0..42usize {
            let value = match index {
                0..=15 => sim.reg(index),
                41 => sim.psr(),
                _ => 0,
            };
            dump.push_str(&hex::encode(value.to_le_bytes()));
        }
        return Some(dump.into_bytes());
    }
    if let Some(rest) = command.strip_prefix('m') {
        let (addr, len) = rest.split_once(',').expect("m command shape");
        let addr = u32::from_str_radix(addr, 16).unwrap();
        let len = u32::from_str_radix(len, 16).unwrap();
        return Some(hex::encode(sim.read_memory(addr, len)).into_bytes());
    }
    if command == "k" {
        return None;
    }
    Some(Vec::new())
}

/// Serves the protocol on one socket until the peer kills or disconnects.
fn serve(mut sock: UnixStream, mut sim: Sim) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match sock.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buffer.extend_from_slice(&chunk[..n]);
        loop {
            let Some(dollar) = buffer.iter().position(|&b| b == b'$') else {
                buffer.clear();
                break;
            };
            let Some(hash) = buffer[dollar..].iter().position(|&b| b == b'#') else {
                break;
            };
            let hash = dollar + hash;
            if buffer.len() < hash + 3 {
                break;
            }
            let command = String::from_utf8_lossy(&buffer[dollar + 1..hash]).into_owned();
            buffer.drain(..hash + 3);
            match reply_for(&mut sim, &command) {
                Some(payload) => {
                    let checksum = payload.iter().fold(0u8, |a, &b| a.wrapping_add(b));
                    let mut frame = b"+$".to_vec();
                    frame.extend_from_slice(&payload);
                    frame.extend_from_slice(format!("#{:02x}", checksum).as_bytes());
                    sock.write_all(&frame).unwrap();
                }
                None => return,
            }
        }
    }
}

fn capture(max_steps: u64, options: CaptureOptions) -> (TraceFile, StopReason) {
    let (client, server) = UnixStream::pair().unwrap();
    let peer = std::thread::spawn(move || serve(server, Sim::new(max_steps)));

    let mut writer = TraceWriter::new(vec![
        Box::new(RegisterSetProbe) as Box<dyn Probe>,
        Box::new(MemoryProbe::new("rom", ROM_BASE, ROM.len() as u32, true)),
        Box::new(MemoryProbe::new("ram", RAM_BASE, RAM_SIZE as u32, false)),
    ]);
    let mut target = RemoteTarget::new(Stream::Unix(client)).unwrap();
    let reason = writer.run(&mut target, &options).unwrap();
    let _ = target.kill_request();
    target.close();
    peer.join().unwrap();
    (
        writer.finish(ROM_BASE, RAM_BASE, RAM_SIZE as u32, "t2sim", ROM.to_vec()),
        reason,
    )
}

fn check_states(executed: u64, states: &[ComponentState]) {
    let expected = Sim {
        steps: executed,
        max_steps: u64::MAX,
    };
    match &states[0] {
        ComponentState::Registers(regs) => {
            assert_eq!(regs.get(Register::R0), executed as u32, "r0 at {}", executed);
            assert_eq!(regs.get(Register::R1), 0xdeadbeef);
            assert_eq!(regs.psr(), expected.psr());
        }
        other => panic!("component 0 should be registers, got {:?}", other),
    }
    match &states[1] {
        ComponentState::Memory(rom) => assert_eq!(rom.as_slice(), ROM.as_slice()),
        other => panic!("component 1 should be the ROM, got {:?}", other),
    }
    match &states[2] {
        ComponentState::Memory(ram) => assert_eq!(ram, &expected.ram(), "ram at {}", executed),
        other => panic!("component 2 should be the RAM, got {:?}", other),
    }
}

#[test]
fn test_capture_and_replay_every_step() {
    let (file, reason) = capture(6, CaptureOptions::default());
    assert_eq!(reason, StopReason::FixedPoint);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.trace");
    file.write_file(&path).unwrap();
    let reader = TraceReader::open(&path).unwrap();

    // Pre-step point, six steps, and the final fixed-point snapshot.
    let points: Vec<_> = reader.iter().map(|p| p.unwrap()).collect();
    assert_eq!(points[0].0, 0);
    assert_eq!(points.len(), 8);
    for (executed, states) in &points[..7] {
        check_states(*executed, states);
    }
    // The fixed-point step repeats the last state under a bumped counter.
    assert_eq!(points[7].0, 7);
    assert_eq!(points[7].1, points[6].1);
}

#[test]
fn test_budget_stop() {
    let options = CaptureOptions {
        decimation: 1,
        max_insn_count: 3,
    };
    let (file, reason) = capture(100, options);
    assert_eq!(reason, StopReason::Budget);
    let reader = TraceReader::new(file);
    let last = reader.iter().last().unwrap().unwrap();
    assert_eq!(last.0, 3);
}

#[test]
fn test_decimated_capture_reconstructs_exactly() {
    let options = CaptureOptions {
        decimation: 3,
        max_insn_count: 0,
    };
    let (file, reason) = capture(10, options);
    assert_eq!(reason, StopReason::FixedPoint);
    let reader = TraceReader::new(file);
    let points: Vec<_> = reader.iter().map(|p| p.unwrap()).collect();
    // Recorded at 0, 3, 6, 9 and the final snapshot at 11.
    let counters: Vec<u64> = points.iter().map(|(n, _)| *n).collect();
    assert_eq!(counters, vec![0, 3, 6, 9, 11]);
    for (executed, states) in &points {
        // 11 is the fixed-point repeat of step 10.
        let effective = (*executed).min(10);
        check_states(effective, states);
    }
}

#[test]
fn test_trace_write_read_equality() {
    let (file, _) = capture(5, CaptureOptions::default());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.trace");
    file.write_file(&path).unwrap();
    assert_eq!(TraceFile::read_file(&path).unwrap(), file);
}

/// Byte patches over large random buffers reproduce the target buffer.
#[test]
fn test_byte_patch_on_random_buffers() {
    let mut rng = rng();
    let mut q1 = vec![0u8; 10_000];
    let mut q2 = vec![0u8; 10_000];
    rng.fill_bytes(&mut q1);
    rng.fill_bytes(&mut q2);
    let patch = BytesPatch::diff(&q1, &q2);
    let mut patched = q1.clone();
    patch.apply(&mut patched).unwrap();
    assert_eq!(patched, q2);
    assert!(BytesPatch::diff(&q1, &q1).is_empty());
}
