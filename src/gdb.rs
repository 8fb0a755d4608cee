//! GDB remote serial protocol client.
//!
//! Drives a target emulator (QEMU's gdbstub or a reference simulator) over a
//! stream socket, exercising the minimal command subset the tracer needs:
//! single-step (`vCont`), register snapshot (`g`), memory read (`m`) and kill
//! (`k`).
//!
//! Outbound frames are `+$<payload>#XX` with the 8-bit payload sum as checksum;
//! the leading `+` greedily acknowledges the previous response instead of
//! running a separate acknowledgment turn, which QEMU tolerates. A background
//! thread reads the socket with a short timeout (so the stop flag is observed),
//! appends to a lock-guarded buffer, tokenizes completed messages and queues
//! them; command methods send one frame and dequeue exactly one response within
//! a one second deadline.

use crate::registers::{Register, RegisterFile};
use log::debug;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Socket read timeout of the receive thread; bounds stop-flag latency.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Deadline for the single response each command expects.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Largest memory read issued in one `m` command.
const MAX_MEMREQUEST_CHUNK: u32 = 2048;
/// Capacity of the response queue between the receive thread and commands.
const RESPONSE_QUEUE_DEPTH: usize = 64;
/// Word index of the PSR in a `g` response (ARM FPA-extended register layout).
const PSR_WORD_INDEX: usize = 41;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
    #[error("peer disconnected")]
    Disconnected,
    #[error("no response within {:?}", RESPONSE_TIMEOUT)]
    CommandTimeout,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One tokenized inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `+$<payload>#XX` success frame.
    Payload(Vec<u8>),
    /// `-` negative acknowledgment.
    Nak,
    /// Any other single byte.
    Unknown(u8),
}

/// 8-bit additive checksum over the payload bytes.
fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Builds the outbound frame for a command, acknowledgment prefix included.
fn frame_command(command: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(command.len() + 6);
    frame.extend_from_slice(b"+$");
    frame.extend_from_slice(command.as_bytes());
    frame.extend_from_slice(format!("#{:02x}", checksum(command.as_bytes())).as_bytes());
    frame
}

/// Drains all complete messages from the front of the buffer, leaving partial
/// frames for the next read.
fn tokenize(buffer: &mut Vec<u8>) -> Vec<Response> {
    let mut messages = Vec::new();
    loop {
        match buffer.first() {
            None => break,
            Some(b'+') => {
                let hash = buffer.iter().position(|&b| b == b'#');
                let complete = buffer.len() >= 5
                    && buffer.get(1) == Some(&b'$')
                    && hash.is_some_and(|h| buffer.len() >= h + 3);
                if !complete {
                    // Wait for the rest of the frame.
                    break;
                }
                let hash = hash.expect("checked above");
                messages.push(Response::Payload(buffer[2..hash].to_vec()));
                buffer.drain(..hash + 3);
            }
            Some(b'-') => {
                buffer.remove(0);
                messages.push(Response::Nak);
            }
            Some(&other) => {
                buffer.remove(0);
                messages.push(Response::Unknown(other));
            }
        }
    }
    messages
}

/// Stream socket to the target, Unix or TCP.
pub enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn try_clone(&self) -> io::Result<Stream> {
        Ok(match self {
            Stream::Unix(s) => Stream::Unix(s.try_clone()?),
            Stream::Tcp(s) => Stream::Tcp(s.try_clone()?),
        })
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.set_read_timeout(timeout),
            Stream::Tcp(s) => s.set_read_timeout(timeout),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Stream::Unix(s) => s.shutdown(std::net::Shutdown::Both),
            Stream::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
        };
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

fn receive_loop(
    mut stream: Stream,
    buffer: Arc<Mutex<Vec<u8>>>,
    queue: SyncSender<Response>,
    stop: Arc<AtomicBool>,
    disconnected: Arc<AtomicBool>,
) {
    let mut chunk = [0u8; 8192];
    while !stop.load(Ordering::Relaxed) {
        match stream.read(&mut chunk) {
            Ok(0) => {
                disconnected.store(true, Ordering::Relaxed);
                break;
            }
            Ok(n) => {
                let messages = {
                    let mut buffer = buffer.lock().expect("receiver owns the buffer");
                    buffer.extend_from_slice(&chunk[..n]);
                    tokenize(&mut buffer)
                };
                for message in messages {
                    if queue.send(message).is_err() {
                        // Session dropped the receiving end.
                        return;
                    }
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(_) => {
                disconnected.store(true, Ordering::Relaxed);
                break;
            }
        }
    }
}

/// A connected remote-debug session.
///
/// Closing the session (explicitly or on drop) stops and joins the receive
/// thread and shuts the socket down.
pub struct RemoteTarget {
    stream: Stream,
    responses: Receiver<Response>,
    stop: Arc<AtomicBool>,
    disconnected: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl RemoteTarget {
    /// Starts a session on a connected stream.
    pub fn new(stream: Stream) -> Result<Self, TargetError> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let reader = stream.try_clone()?;
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::sync_channel(RESPONSE_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let disconnected = Arc::new(AtomicBool::new(false));
        let receiver = std::thread::spawn({
            let stop = stop.clone();
            let disconnected = disconnected.clone();
            move || receive_loop(reader, buffer, tx, stop, disconnected)
        });
        Ok(Self {
            stream,
            responses: rx,
            stop,
            disconnected,
            receiver: Some(receiver),
        })
    }

    /// Binds a Unix socket, waits for the emulator to connect, and starts the
    /// session on the accepted connection.
    pub fn listen_unix<P: AsRef<Path>>(path: P) -> Result<Self, TargetError> {
        let listener = UnixListener::bind(path)?;
        let (conn, _) = listener.accept()?;
        Self::new(Stream::Unix(conn))
    }

    /// Connects to a TCP gdbstub.
    pub fn connect_tcp<A: ToSocketAddrs>(addr: A) -> Result<Self, TargetError> {
        Self::new(Stream::Tcp(TcpStream::connect(addr)?))
    }

    /// Sends one command and dequeues its response.
    pub fn send_cmd(&mut self, command: &str) -> Result<Response, TargetError> {
        if self.disconnected.load(Ordering::Relaxed) {
            return Err(TargetError::Disconnected);
        }
        debug!("-> {}", command);
        self.stream.write_all(&frame_command(command))?;
        match self.responses.recv_timeout(RESPONSE_TIMEOUT) {
            Ok(response) => {
                debug!("<- {:?}", response);
                Ok(response)
            }
            Err(RecvTimeoutError::Timeout) => {
                if self.disconnected.load(Ordering::Relaxed) {
                    Err(TargetError::Disconnected)
                } else {
                    Err(TargetError::CommandTimeout)
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(TargetError::Disconnected),
        }
    }

    fn expect_payload(response: Response) -> Result<Vec<u8>, TargetError> {
        match response {
            Response::Payload(payload) => Ok(payload),
            Response::Nak => Err(TargetError::Protocol("negative acknowledgment".into())),
            Response::Unknown(byte) => Err(TargetError::Protocol(format!(
                "unknown response byte 0x{:02x}",
                byte
            ))),
        }
    }

    /// Executes exactly one instruction on the target.
    pub fn singlestep(&mut self) -> Result<(), TargetError> {
        self.send_cmd("vCont;s:1;c")?;
        Ok(())
    }

    /// Reads the full register snapshot.
    pub fn get_regs(&mut self) -> Result<RegisterFile, TargetError> {
        let payload = Self::expect_payload(self.send_cmd("g")?)?;
        let text = std::str::from_utf8(&payload)
            .map_err(|_| TargetError::Protocol("register dump is not ASCII".into()))?;
        let words: Vec<u32> = text
            .as_bytes()
            .chunks_exact(8)
            .map(|chunk| {
                let chunk = std::str::from_utf8(chunk).expect("subslice of checked ASCII");
                // Each register is the hex dump of its little-endian bytes.
                u32::from_str_radix(chunk, 16)
                    .map(u32::swap_bytes)
                    .map_err(|_| TargetError::Protocol(format!("bad register word {:?}", chunk)))
            })
            .collect::<Result<_, _>>()?;
        if words.len() <= PSR_WORD_INDEX {
            return Err(TargetError::Protocol(format!(
                "register dump has {} words, expected at least {}",
                words.len(),
                PSR_WORD_INDEX + 1
            )));
        }
        let mut regs = RegisterFile::default();
        for (index, register) in Register::all().take(16).enumerate() {
            regs.set(register, words[index]);
        }
        regs.set(Register::Psr, words[PSR_WORD_INDEX]);
        Ok(regs)
    }

    /// Reads a memory range, chunking requests to the protocol limit.
    pub fn read_memory(&mut self, address: u32, length: u32) -> Result<Vec<u8>, TargetError> {
        if length == 0 || u64::from(address) + u64::from(length) > 1 << 32 {
            return Err(TargetError::Protocol(format!(
                "invalid memory range 0x{:x}+0x{:x}",
                address, length
            )));
        }
        let mut result = Vec::with_capacity(length as usize);
        let mut offset = 0;
        while offset < length {
            let chunk_length = (length - offset).min(MAX_MEMREQUEST_CHUNK);
            let payload = Self::expect_payload(
                self.send_cmd(&format!("m{:x},{:x}", address + offset, chunk_length))?,
            )?;
            let bytes = hex::decode(&payload)
                .map_err(|_| TargetError::Protocol("memory read reply is not hex".into()))?;
            if bytes.len() != chunk_length as usize {
                return Err(TargetError::Protocol(format!(
                    "memory read returned {} bytes, requested {}",
                    bytes.len(),
                    chunk_length
                )));
            }
            result.extend_from_slice(&bytes);
            offset += chunk_length;
        }
        Ok(result)
    }

    /// Asks the peer to terminate, so profiled emulators can flush and exit
    /// cleanly. The peer usually dies without replying.
    pub fn kill_request(&mut self) -> Result<(), TargetError> {
        self.stream.write_all(&frame_command("k"))?;
        Ok(())
    }

    fn shutdown_session(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
        self.stream.shutdown();
    }

    /// Ends the session, joining the receive thread and closing the socket.
    pub fn close(mut self) {
        self.shutdown_session();
    }
}

impl Drop for RemoteTarget {
    fn drop(&mut self) {
        self.shutdown_session();
    }
}

#[cfg(test)]
mod tests {
    use super::{checksum, frame_command, tokenize, RemoteTarget, Response, Stream, TargetError};
    use crate::registers::Register;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_checksum_and_framing() {
        // "g" is 0x67.
        assert_eq!(checksum(b"g"), 0x67);
        assert_eq!(frame_command("g"), b"+$g#67".to_vec());
        let frame = frame_command("m0,800");
        assert!(frame.starts_with(b"+$m0,800#"));
    }

    #[test]
    fn test_tokenize_complete_frame() {
        let mut buffer = b"+$abc#26".to_vec();
        let messages = tokenize(&mut buffer);
        assert_eq!(messages, vec![Response::Payload(b"abc".to_vec())]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_tokenize_partial_frames() {
        // Feed a frame byte by byte; only the final byte completes it.
        let frame = b"+$vCont#0a";
        let mut buffer = Vec::new();
        for &byte in &frame[..frame.len() - 1] {
            buffer.push(byte);
            assert!(tokenize(&mut buffer).is_empty());
        }
        buffer.push(frame[frame.len() - 1]);
        assert_eq!(tokenize(&mut buffer).len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_tokenize_mixed_stream() {
        let mut buffer = b"-x+$OK#9a+$".to_vec();
        let messages = tokenize(&mut buffer);
        assert_eq!(
            messages,
            vec![
                Response::Nak,
                Response::Unknown(b'x'),
                Response::Payload(b"OK".to_vec()),
            ]
        );
        // The trailing partial frame stays buffered.
        assert_eq!(buffer, b"+$".to_vec());
    }

    /// Fake peer answering every inbound frame with canned payloads.
    fn fake_peer(mut sock: UnixStream, replies: Vec<Vec<u8>>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let mut pending = replies.into_iter();
            let mut seen = Vec::new();
            let mut chunk = [0u8; 4096];
            while let Ok(n) = sock.read(&mut chunk) {
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&chunk[..n]);
                while let Some(pos) = seen.iter().position(|&b| b == b'#') {
                    if seen.len() < pos + 3 {
                        break;
                    }
                    seen.drain(..pos + 3);
                    let Some(payload) = pending.next() else {
                        return;
                    };
                    let mut frame = b"+$".to_vec();
                    frame.extend_from_slice(&payload);
                    frame.extend_from_slice(
                        format!("#{:02x}", super::checksum(&payload)).as_bytes(),
                    );
                    sock.write_all(&frame).unwrap();
                }
            }
        })
    }

    #[test]
    fn test_get_regs_against_fake_peer() {
        let (client, server) = UnixStream::pair().unwrap();
        // 42 little-endian words: r0..r15 = 0x11111111 * i, filler, psr last.
        let mut dump = String::new();
        for i in 0..42u32 {
            let value: u32 = if i < 16 {
                0x01010101u32.wrapping_mul(i)
            } else if i as usize == super::PSR_WORD_INDEX {
                0x60000000
            } else {
                0
            };
            dump.push_str(&hex::encode(value.to_le_bytes()));
        }
        let peer = fake_peer(server, vec![dump.into_bytes()]);
        let mut target = RemoteTarget::new(Stream::Unix(client)).unwrap();
        let regs = target.get_regs().unwrap();
        assert_eq!(regs.get(Register::R0), 0);
        assert_eq!(regs.get(Register::R3), 0x03030303);
        assert_eq!(regs.pc(), 0x0f0f0f0f);
        assert_eq!(regs.psr(), 0x60000000);
        target.close();
        peer.join().unwrap();
    }

    #[test]
    fn test_read_memory_chunks() {
        let (client, server) = UnixStream::pair().unwrap();
        // 0x900 bytes need a 0x800 chunk and a 0x100 chunk.
        let first = hex::encode(vec![0xabu8; 0x800]).into_bytes();
        let second = hex::encode(vec![0xcdu8; 0x100]).into_bytes();
        let peer = fake_peer(server, vec![first, second]);
        let mut target = RemoteTarget::new(Stream::Unix(client)).unwrap();
        let memory = target.read_memory(0x20000000, 0x900).unwrap();
        assert_eq!(memory.len(), 0x900);
        assert_eq!(memory[0], 0xab);
        assert_eq!(memory[0x8ff], 0xcd);
        target.close();
        peer.join().unwrap();
    }

    #[test]
    fn test_disconnect_is_fatal() {
        let (client, server) = UnixStream::pair().unwrap();
        drop(server);
        let mut target = RemoteTarget::new(Stream::Unix(client)).unwrap();
        // The receiver notices the hangup; the command surfaces it immediately
        // or after draining the queue deadline.
        std::thread::sleep(std::time::Duration::from_millis(50));
        match target.singlestep() {
            Err(TargetError::Disconnected) | Err(TargetError::Transport(_)) => {}
            other => panic!("expected a fatal transport error, got {:?}", other),
        }
    }
}
