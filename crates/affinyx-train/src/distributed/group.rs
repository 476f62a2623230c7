//! Process groups: the collective operations data-parallel training needs.
//!
//! [`TcpGroup`] is a star: rank 0 accepts one connection per worker and
//! performs every reduction itself. Frames are a one-byte op tag, a `u32`
//! element count and that many little-endian `f32`s, written and read as one
//! byte slice. All ranks must issue the same sequence of collectives; a tag
//! mismatch is reported as an error.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Result, TrainError};

pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    /// Block until every rank has reached the barrier.
    fn barrier(&self) -> Result<()>;
    /// Element-wise sum across ranks, written back on every rank.
    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<()>;
    /// Overwrite `data` on every rank with rank 0's copy.
    fn broadcast(&self, data: &mut [f32]) -> Result<()>;

    fn is_main(&self) -> bool {
        self.rank() == 0
    }
}

/// Single-process group; every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalGroup;

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_reduce_sum(&self, _data: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _data: &mut [f32]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Op {
    Hello = 1,
    Barrier = 2,
    Reduce = 3,
    Broadcast = 4,
}

impl Op {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            1 => Ok(Op::Hello),
            2 => Ok(Op::Barrier),
            3 => Ok(Op::Reduce),
            4 => Ok(Op::Broadcast),
            other => Err(TrainError::Group(format!("unknown op tag {other}"))),
        }
    }
}

struct Conn {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Conn {
    fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { reader: BufReader::new(stream.try_clone()?), writer: BufWriter::new(stream) })
    }

    fn send(&mut self, op: Op, data: &[f32]) -> Result<()> {
        self.writer.write_all(&[op as u8])?;
        self.writer.write_all(&(data.len() as u32).to_le_bytes())?;
        write_f32s(&mut self.writer, data)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read a frame header, returning the payload length.
    fn recv_header(&mut self, expected: Op) -> Result<usize> {
        let mut tag = [0u8; 1];
        self.reader.read_exact(&mut tag)?;
        let op = Op::from_u8(tag[0])?;
        if op != expected {
            return Err(TrainError::Group(format!("expected {expected:?}, peer sent {op:?}")));
        }
        let mut len = [0u8; 4];
        self.reader.read_exact(&mut len)?;
        Ok(u32::from_le_bytes(len) as usize)
    }

    fn recv(&mut self, expected: Op) -> Result<Vec<f32>> {
        let len = self.recv_header(expected)?;
        let mut data = vec![0f32; len];
        read_f32s(&mut self.reader, &mut data)?;
        Ok(data)
    }

    /// Receive into `data`, which must have the same length as the payload.
    fn recv_into(&mut self, expected: Op, data: &mut [f32]) -> Result<()> {
        let len = self.recv_header(expected)?;
        if len != data.len() {
            return Err(TrainError::Group(format!(
                "{expected:?} length mismatch: local {}, peer {len}",
                data.len()
            )));
        }
        read_f32s(&mut self.reader, data)
    }
}

#[cfg(target_endian = "little")]
fn write_f32s(w: &mut impl Write, data: &[f32]) -> Result<()> {
    w.write_all(bytemuck::cast_slice(data))?;
    Ok(())
}

#[cfg(target_endian = "big")]
fn write_f32s(w: &mut impl Write, data: &[f32]) -> Result<()> {
    let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    w.write_all(&bytes)?;
    Ok(())
}

#[cfg(target_endian = "little")]
fn read_f32s(r: &mut impl Read, data: &mut [f32]) -> Result<()> {
    r.read_exact(bytemuck::cast_slice_mut(data))?;
    Ok(())
}

#[cfg(target_endian = "big")]
fn read_f32s(r: &mut impl Read, data: &mut [f32]) -> Result<()> {
    let mut buf = vec![0u8; data.len() * 4];
    r.read_exact(&mut buf)?;
    for (dst, b) in data.iter_mut().zip(buf.chunks_exact(4)) {
        *dst = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    }
    Ok(())
}

enum Role {
    /// Connections to ranks `1..world`, in rank order.
    Coordinator(Vec<Conn>),
    Worker(Conn),
}

pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    role: Mutex<Role>,
}

impl TcpGroup {
    /// Join the group: rank 0 listens on `port`, the others connect to
    /// `coordinator:port`, retrying for up to `timeout`.
    pub fn init(rank: usize, world_size: usize, coordinator: &str, port: u16, timeout: Duration) -> Result<Self> {
        if rank == 0 {
            let listener = TcpListener::bind(("0.0.0.0", port))?;
            Self::coordinator(listener, world_size)
        } else {
            Self::worker(rank, world_size, coordinator, port, timeout)
        }
    }

    /// Accept `world_size - 1` workers on an already bound listener.
    pub fn coordinator(listener: TcpListener, world_size: usize) -> Result<Self> {
        info!("Waiting for {} workers on {}", world_size.saturating_sub(1), listener.local_addr()?);
        let mut slots: Vec<Option<Conn>> = (1..world_size).map(|_| None).collect();
        while slots.iter().any(Option::is_none) {
            let (stream, peer) = listener.accept()?;
            let mut conn = Conn::new(stream)?;
            let hello = conn.recv(Op::Hello)?;
            let peer_rank = match hello.as_slice() {
                [r, w] if *w as usize == world_size => *r as usize,
                _ => return Err(TrainError::Group(format!("bad handshake from {peer}: {hello:?}"))),
            };
            let slot = slots
                .get_mut(peer_rank.wrapping_sub(1))
                .ok_or_else(|| TrainError::Group(format!("rank {peer_rank} out of range")))?;
            if slot.is_some() {
                return Err(TrainError::Group(format!("rank {peer_rank} connected twice")));
            }
            debug!("rank {peer_rank} joined from {peer}");
            *slot = Some(conn);
        }
        let conns = slots.into_iter().flatten().collect();
        Ok(Self { rank: 0, world_size, role: Mutex::new(Role::Coordinator(conns)) })
    }

    pub fn worker(rank: usize, world_size: usize, coordinator: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = (coordinator, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TrainError::Group(format!("cannot resolve {coordinator}")))?;
        let deadline = Instant::now() + timeout;
        let stream = loop {
            match TcpStream::connect(addr) {
                Ok(s) => break s,
                Err(e) if Instant::now() < deadline => {
                    debug!("rank {rank}: coordinator {addr} not ready ({e}), retrying");
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(e) => return Err(TrainError::Group(format!("rank {rank} could not reach {addr}: {e}"))),
            }
        };
        let mut conn = Conn::new(stream)?;
        conn.send(Op::Hello, &[rank as f32, world_size as f32])?;
        Ok(Self { rank, world_size, role: Mutex::new(Role::Worker(conn)) })
    }

    fn role(&self) -> Result<std::sync::MutexGuard<'_, Role>> {
        self.role.lock().map_err(|_| TrainError::Group("process group lock poisoned".into()))
    }

    fn reduce(&self, op: Op, data: &mut [f32]) -> Result<()> {
        match &mut *self.role()? {
            Role::Coordinator(conns) => {
                let mut part = vec![0f32; data.len()];
                for conn in conns.iter_mut() {
                    conn.recv_into(op, &mut part)?;
                    for (acc, v) in data.iter_mut().zip(&part) {
                        *acc += v;
                    }
                }
                for conn in conns.iter_mut() {
                    conn.send(op, data)?;
                }
            }
            Role::Worker(conn) => {
                conn.send(op, data)?;
                conn.recv_into(op, data)?;
            }
        }
        Ok(())
    }
}

impl ProcessGroup for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.reduce(Op::Barrier, &mut [])
    }

    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<()> {
        self.reduce(Op::Reduce, data)
    }

    fn broadcast(&self, data: &mut [f32]) -> Result<()> {
        match &mut *self.role()? {
            Role::Coordinator(conns) => {
                for conn in conns.iter_mut() {
                    conn.send(Op::Broadcast, data)?;
                }
            }
            Role::Worker(conn) => conn.recv_into(Op::Broadcast, data)?,
        }
        Ok(())
    }
}
