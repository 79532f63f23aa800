use bytes::Bytes;
use mfdbg::breakpoint::{BreakpointDef, BreakpointFlags};
use mfdbg::engine::{CapabilityCategory, CapabilityFlags, ExecutionConditions, PingFlags};
use mfdbg::process::DataType;
use mfdbg::transport::{duplex, MemoryTransport, Transport};
use mfdbg::wire::packet::crc32;
use mfdbg::wire::{Command, Endian, Frame, Packet, PacketAssembler, PacketFlags};
use mfdbg::wire::{PayloadReader, PayloadWriter};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

pub const FLASH_BASE: u32 = 0x0800_0000;

#[derive(Clone, Debug)]
pub struct StackFrame {
    pub md: u32,
    pub ip: u32,
}

#[derive(Clone, Debug)]
pub struct SectorDesc {
    pub start: u32,
    pub length: u32,
    pub usage: u32,
}

/// Everything the simulated device knows and everything it has seen.
#[derive(Debug)]
pub struct SimState {
    /// Ignore every command, reply to nothing.
    pub silent: bool,
    pub ping_flags: PingFlags,
    pub capabilities: CapabilityFlags,
    pub conditions: ExecutionConditions,
    pub threads: Vec<u32>,
    pub assemblies: Vec<(u32, String)>,
    pub app_domains: Vec<(u32, String, Vec<u32>)>,
    /// Bottom frame first, `(app-domain, frames)`.
    pub stacks: HashMap<u32, (u32, Vec<StackFrame>)>,
    pub hits: VecDeque<BreakpointDef>,
    pub accept_messaging: bool,
    /// Answer rpc calls with their own arguments.
    pub echo_calls: bool,
    /// Answer rpc calls with a fault `(type name, message)`, wins over `echo_calls`.
    pub fault_calls: Option<(String, String)>,
    pub sectors: Vec<SectorDesc>,
    pub flash: Vec<u8>,
    pub next_vpid: u32,
    /// `I4` content of every scratch pad slot.
    pub scratch_value: Option<i32>,
    pub reject_resize: bool,
    /// Answer breakpoint status with a truncated definition.
    pub garbled_status: bool,
    /// `I4` locals by `(pid, depth, index)`.
    pub locals: HashMap<(u32, u32, u32), i32>,

    /// Commands received, replies excluded.
    pub received: Vec<Command>,
    /// Every breakpoint list the host sent.
    pub breakpoint_lists: Vec<Vec<BreakpointDef>>,
    pub erased: Vec<u32>,
    pub written: usize,
    pub resumes: usize,
    /// Requested scratch pad capacities, rejected ones included.
    pub resizes: Vec<u32>,
    /// `(virtual thread, thread it runs over)` of every evaluation.
    pub spawned: Vec<(u32, u32)>,
    /// Payloads of `MESSAGING_REPLY` the host sent.
    pub replies: Vec<Bytes>,
    /// Unsolicited commands to send after the current reply.
    pub(crate) outbox: Vec<(Command, Bytes)>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            silent: false,
            ping_flags: PingFlags::empty(),
            capabilities: CapabilityFlags::SOURCE_LEVEL_DEBUGGING | CapabilityFlags::APP_DOMAINS,
            conditions: ExecutionConditions::STATE_PROGRAM_RUNNING,
            threads: vec![],
            assemblies: vec![],
            app_domains: vec![],
            stacks: HashMap::new(),
            hits: VecDeque::new(),
            accept_messaging: true,
            echo_calls: false,
            fault_calls: None,
            sectors: vec![],
            flash: vec![],
            next_vpid: 100,
            scratch_value: None,
            reject_resize: false,
            garbled_status: false,
            locals: HashMap::new(),
            received: vec![],
            breakpoint_lists: vec![],
            erased: vec![],
            written: 0,
            resumes: 0,
            resizes: vec![],
            spawned: vec![],
            replies: vec![],
            outbox: vec![],
        }
    }
}

impl SimState {
    pub fn count(&self, cmd: Command) -> usize {
        self.received.iter().filter(|c| **c == cmd).count()
    }

    pub fn last_breakpoints(&self) -> Vec<BreakpointDef> {
        self.breakpoint_lists.last().cloned().unwrap_or_default()
    }

    /// Lay out deployment sectors of `length` bytes one after another, flash is erased.
    pub fn with_flash(mut self, sectors: usize, length: u32) -> Self {
        self.sectors = (0..sectors as u32)
            .map(|i| SectorDesc {
                start: FLASH_BASE + i * length,
                length,
                usage: 0x50,
            })
            .collect();
        self.flash = vec![0xFF; sectors * length as usize];
        self
    }

    fn flash_range(&self, address: u32, length: u32) -> std::ops::Range<usize> {
        let start = (address - FLASH_BASE) as usize;
        start..start + length as usize
    }
}

pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
    link: Arc<Mutex<MemoryTransport>>,
    seq: Arc<AtomicU16>,
    halt: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SimDevice {
    /// Start device thread, return it with the host end of the link.
    pub fn start(state: SimState) -> (Self, MemoryTransport) {
        let (host, device) = duplex("sim");
        let state = Arc::new(Mutex::new(state));
        let link = Arc::new(Mutex::new(device.clone()));
        let seq = Arc::new(AtomicU16::new(1));
        let halt = Arc::new(AtomicBool::new(false));

        let worker = {
            let state = state.clone();
            let link = link.clone();
            let seq = seq.clone();
            let halt = halt.clone();
            std::thread::Builder::new()
                .name("sim-device".to_string())
                .spawn(move || serve(device, state, link, seq, halt))
                .unwrap()
        };

        (
            SimDevice {
                state,
                link,
                seq,
                halt,
                worker: Some(worker),
            },
            host,
        )
    }

    pub fn state(&self) -> MutexGuard<SimState> {
        self.state.lock().unwrap()
    }

    /// Send an unsolicited command to the host.
    pub fn send(&self, cmd: Command, payload: Bytes) {
        let packet = Packet::new(
            cmd,
            self.seq.fetch_add(1, Ordering::SeqCst),
            PacketFlags::NON_CRITICAL,
            payload,
        );
        self.link.lock().unwrap().write(&packet.encode()).unwrap();
    }

    /// Write bytes outside of any packet.
    pub fn send_raw(&self, data: &[u8]) {
        self.link.lock().unwrap().write(data).unwrap();
    }

    /// Stop the device, queue hits and notify the host.
    pub fn hit(&self, hits: impl IntoIterator<Item = BreakpointDef>, mark_last: bool) {
        {
            let mut state = self.state();
            state.conditions |= ExecutionConditions::STOPPED;
            state.hits.extend(hits);
            if mark_last {
                if let Some(last) = state.hits.back_mut() {
                    last.flags |= BreakpointFlags::LAST_BREAKPOINT;
                }
            }
        }
        self.send(Command::EXECUTION_BREAKPOINT_HIT, Bytes::new());
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.halt.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            _ = worker.join();
        }
    }
}

fn serve(
    device: MemoryTransport,
    state: Arc<Mutex<SimState>>,
    link: Arc<Mutex<MemoryTransport>>,
    seq: Arc<AtomicU16>,
    halt: Arc<AtomicBool>,
) {
    let mut assembler = PacketAssembler::new();
    let mut buf = [0u8; 4096];
    while !halt.load(Ordering::SeqCst) {
        let n = match device.read_timeout(&mut buf, Duration::from_millis(10)) {
            Ok(n) => n,
            Err(_) => break,
        };
        assembler.push(&buf[..n]);
        while let Some(frame) = assembler.next_frame() {
            let Frame::Packet(packet) = frame else {
                continue;
            };
            if packet.is_reply() {
                continue;
            }
            let (reply, outbox) = {
                let mut state = state.lock().unwrap();
                state.received.push(packet.cmd());
                if state.silent {
                    continue;
                }
                let reply = handle(&mut state, &packet);
                (reply, std::mem::take(&mut state.outbox))
            };

            let mut link = link.lock().unwrap();
            if let Some((flags, payload)) = reply {
                let reply = Packet::reply_to(
                    &packet.header,
                    seq.fetch_add(1, Ordering::SeqCst),
                    flags,
                    payload,
                );
                if link.write(&reply.encode()).is_err() {
                    return;
                }
            }
            for (cmd, payload) in outbox {
                let packet = Packet::new(
                    cmd,
                    seq.fetch_add(1, Ordering::SeqCst),
                    PacketFlags::NON_CRITICAL,
                    payload,
                );
                if link.write(&packet.encode()).is_err() {
                    return;
                }
            }
        }
    }
}

fn writer() -> PayloadWriter {
    PayloadWriter::new(Endian::Little)
}

fn list(writer: PayloadWriter, items: &[u32]) -> PayloadWriter {
    items
        .iter()
        .fold(writer.u32(items.len() as u32), |w, item| w.u32(*item))
}

fn ack(payload: Bytes) -> Option<(PacketFlags, Bytes)> {
    Some((PacketFlags::empty(), payload))
}

fn nack() -> Option<(PacketFlags, Bytes)> {
    Some((PacketFlags::NACK, Bytes::new()))
}

pub fn local_reference(pid: u32, depth: u32, index: u32) -> u32 {
    (pid << 16) | (depth << 8) | index
}

fn i4_record(reference: u32, value: i32) -> Bytes {
    writer()
        .u32(reference)
        .u32(DataType::I4.raw())
        .u32(0)
        .u32(0)
        .blob(&writer().i32(value).finish())
        .finish()
}

fn version(writer: PayloadWriter) -> PayloadWriter {
    writer.u16(1).u16(0).u16(0).u16(0)
}

fn handle(state: &mut SimState, packet: &Packet) -> Option<(PacketFlags, Bytes)> {
    let mut reader = PayloadReader::new(packet.payload.clone(), Endian::Little, "sim");
    match packet.cmd() {
        Command::PING => ack(writer().u32(0).u32(state.ping_flags.bits()).finish()),
        Command::EXECUTION_QUERY_CAPABILITIES => {
            let category = CapabilityCategory::from_raw(reader.u32().ok()?)?;
            let payload = match category {
                CapabilityCategory::Flags => writer().u32(state.capabilities.bits()),
                CapabilityCategory::Lcd => writer().u32(320).u32(240).u32(16),
                CapabilityCategory::SoftwareVersion => {
                    writer().string("2026-01-01").string("sim").u32(1)
                }
                CapabilityCategory::HalSystemInfo => {
                    version(writer()).string("ACME").u8(1).u8(2).u16(3)
                }
                CapabilityCategory::ClrInfo => version(version(writer())),
                CapabilityCategory::SolutionReleaseInfo => version(writer()).string("ACME"),
            };
            ack(payload.finish())
        }
        Command::EXECUTION_CHANGE_CONDITIONS => {
            let set = ExecutionConditions::from_bits_retain(reader.u32().ok()?);
            let reset = ExecutionConditions::from_bits_retain(reader.u32().ok()?);
            if reset.contains(ExecutionConditions::STOPPED)
                && state.conditions.contains(ExecutionConditions::STOPPED)
            {
                state.resumes += 1;
            }
            state.conditions = (state.conditions | set) - reset;
            ack(writer().u32(state.conditions.bits()).finish())
        }
        Command::EXECUTION_BREAKPOINTS => {
            let count = reader.u32().ok()?;
            let defs = (0..count)
                .map(|_| BreakpointDef::read(&mut reader))
                .collect::<Result<Vec<_>, _>>()
                .ok()?;
            state.breakpoint_lists.push(defs);
            ack(Bytes::new())
        }
        Command::EXECUTION_BREAKPOINT_STATUS if state.garbled_status => {
            ack(writer().u16(1).finish())
        }
        Command::EXECUTION_BREAKPOINT_STATUS => {
            let hit = state.hits.pop_front().unwrap_or_default();
            ack(hit.write(writer()).finish())
        }
        Command::THREAD_LIST => ack(list(writer(), &state.threads).finish()),
        Command::THREAD_STACK => {
            let pid = reader.u32().ok()?;
            let Some((app_domain, frames)) = state.stacks.get(&pid) else {
                return nack();
            };
            let payload = frames.iter().fold(
                writer().u32(0).u32(*app_domain).u32(frames.len() as u32),
                |w, f| w.u32(f.md).u32(f.ip).u32(*app_domain).u32(0),
            );
            ack(payload.finish())
        }
        Command::THREAD_CREATE_EX => {
            let (_method, _slot, active) =
                (reader.u32().ok()?, reader.u32().ok()?, reader.u32().ok()?);
            let vpid = state.next_vpid;
            state.next_vpid += 1;
            state.spawned.push((vpid, active));
            ack(writer().u32(vpid).finish())
        }
        Command::THREAD_KILL | Command::THREAD_SUSPEND | Command::THREAD_RESUME => {
            ack(Bytes::new())
        }
        Command::TYPE_SYS_ASSEMBLIES => {
            let idxs: Vec<u32> = state.assemblies.iter().map(|(idx, _)| *idx).collect();
            ack(list(writer(), &idxs).finish())
        }
        Command::RESOLVE_ASSEMBLY => {
            let idx = reader.u32().ok()?;
            let Some((_, name)) = state.assemblies.iter().find(|(i, _)| *i == idx) else {
                return nack();
            };
            ack(version(writer().u32(0).string(name)).finish())
        }
        Command::TYPE_SYS_APP_DOMAINS => {
            let ids: Vec<u32> = state.app_domains.iter().map(|(id, _, _)| *id).collect();
            ack(list(writer(), &ids).finish())
        }
        Command::RESOLVE_APP_DOMAIN => {
            let id = reader.u32().ok()?;
            let Some((_, name, assemblies)) = state.app_domains.iter().find(|d| d.0 == id) else {
                return nack();
            };
            ack(list(writer().u32(0).string(name), assemblies).finish())
        }
        Command::VALUE_RESIZE_SCRATCH_PAD => {
            state.resizes.push(reader.u32().ok()?);
            if state.reject_resize {
                nack()
            } else {
                ack(Bytes::new())
            }
        }
        Command::VALUE_GET_SCRATCH_PAD => ack(i4_record(0, state.scratch_value?)),
        Command::VALUE_GET_STACK => {
            let (pid, depth, kind, index) = (
                reader.u32().ok()?,
                reader.u32().ok()?,
                reader.u32().ok()?,
                reader.u32().ok()?,
            );
            // locals only
            match state.locals.get(&(pid, depth, index)) {
                Some(value) if kind == 1 => {
                    ack(i4_record(local_reference(pid, depth, index), *value))
                }
                _ => nack(),
            }
        }
        Command::VALUE_SET_BLOCK => {
            let reference = reader.u32().ok()?;
            let _data_type = reader.u32().ok()?;
            let data = reader.blob().ok()?;
            let key = (reference >> 16, (reference >> 8) & 0xFF, reference & 0xFF);
            let value = PayloadReader::new(data, Endian::Little, "sim").i32().ok()?;
            match state.locals.get_mut(&key) {
                Some(local) => {
                    *local = value;
                    ack(Bytes::new())
                }
                None => nack(),
            }
        }
        Command::FLASH_SECTOR_MAP => {
            let payload = state.sectors.iter().fold(writer(), |w, s| {
                w.u32(s.start).u32(s.length).u32(s.usage)
            });
            ack(payload.finish())
        }
        Command::CHECK_MEMORY => {
            let range = state.flash_range(reader.u32().ok()?, reader.u32().ok()?);
            let crc = crc32(state.flash.get(range)?);
            ack(writer().u32(crc).finish())
        }
        Command::ERASE_MEMORY => {
            let address = reader.u32().ok()?;
            let range = state.flash_range(address, reader.u32().ok()?);
            state.flash.get_mut(range)?.fill(0xFF);
            state.erased.push(address);
            ack(Bytes::new())
        }
        Command::WRITE_MEMORY => {
            let address = reader.u32().ok()?;
            let length = reader.u32().ok()?;
            let data = reader.bytes(length as usize).ok()?;
            let range = state.flash_range(address, length);
            state.flash.get_mut(range)?.copy_from_slice(&data);
            state.written += data.len();
            ack(Bytes::new())
        }
        Command::MESSAGING_QUERY => ack(writer().u32(state.accept_messaging as u32).finish()),
        Command::MESSAGING_SEND => {
            if state.echo_calls || state.fault_calls.is_some() {
                // address: seq and two endpoints
                let address = reader.bytes(20).ok()?;
                let call: serde_json::Value = serde_json::from_slice(&reader.blob().ok()?).ok()?;
                let body = match &state.fault_calls {
                    Some((type_name, message)) => serde_json::json!({
                        "Fault": { "type_name": type_name, "message": message }
                    }),
                    None => serde_json::json!({ "Ok": call["args"] }),
                };
                let payload = writer().bytes(&address).blob(body.to_string().as_bytes()).finish();
                state.outbox.push((Command::MESSAGING_REPLY, payload));
            }
            None
        }
        // posted without acknowledge
        Command::MESSAGING_REPLY => {
            state.replies.push(packet.payload.clone());
            None
        }
        Command::REBOOT => None,
        _ => nack(),
    }
}
