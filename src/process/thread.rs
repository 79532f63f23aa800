use crate::error::Error;
use crate::process::assembly::{unpack_index, Assembly, TokenKind};
use crate::process::value::RuntimeValue;
use crate::process::Process;
use crate::wire::{Command, PayloadReader};
use crate::weak_error;
use indexmap::IndexMap;
use log::debug;
use once_cell::sync::OnceCell;

/// Frame runs internal (native) code.
const FRAME_INTERNAL: u32 = 0x0001;

/// Resolved method of a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub assembly: u32,
    /// Assembly-local device index.
    pub index: u32,
    pub clr_token: u32,
    pub name: Option<String>,
    pub user_code: bool,
}

impl Function {
    fn resolve(md: u32, assemblies: &IndexMap<u32, Assembly>) -> Option<Self> {
        let (assembly_idx, index) = unpack_index(md);
        let assembly = assemblies.get(&assembly_idx)?;
        let clr_token = weak_error!(assembly.to_clr(TokenKind::MethodDef, index), "frame function:")?;
        let symbols = assembly.method_symbols(clr_token);
        Some(Function {
            assembly: assembly_idx,
            index,
            clr_token,
            name: symbols.map(|m| m.name.clone()).filter(|n| !n.is_empty()),
            user_code: assembly.is_user_code(clr_token),
        })
    }
}

/// Stack frame of a device thread, depth counts from the bottom of the thread stack.
#[derive(Debug)]
pub struct Frame {
    pub pid: u32,
    pub depth: u32,
    /// Packed device index of the method.
    pub md: u32,
    /// Device IL offset.
    pub ip: u32,
    pub app_domain: u32,
    pub internal: bool,
    function: OnceCell<Option<Function>>,
    clr_ip: OnceCell<u32>,
}

impl Frame {
    fn read(pid: u32, depth: u32, reader: &mut PayloadReader) -> Result<Self, Error> {
        let md = reader.u32()?;
        let ip = reader.u32()?;
        let app_domain = reader.u32()?;
        let flags = reader.u32()?;
        Ok(Frame {
            pid,
            depth,
            md,
            ip,
            app_domain,
            internal: flags & FRAME_INTERNAL != 0,
            function: OnceCell::new(),
            clr_ip: OnceCell::new(),
        })
    }

    /// Resolved on first access, cached afterwards.
    pub fn function(&self, assemblies: &IndexMap<u32, Assembly>) -> Option<&Function> {
        self.function
            .get_or_init(|| Function::resolve(self.md, assemblies))
            .as_ref()
    }

    /// CLR IL offset, resolved on first access.
    pub fn clr_ip(&self, assemblies: &IndexMap<u32, Assembly>) -> u32 {
        *self.clr_ip.get_or_init(|| {
            let Some(function) = self.function(assemblies) else {
                return self.ip;
            };
            assemblies
                .get(&function.assembly)
                .map(|asm| asm.il_to_clr(function.clr_token, self.ip))
                .unwrap_or(self.ip)
        })
    }
}

/// Frames of a thread as of a particular device stop.
#[derive(Debug)]
pub struct Chain {
    /// Stop epoch, chain is stale when process epoch moves.
    epoch: u64,
    pub status: u32,
    pub app_domain: u32,
    /// Bottom frame first.
    frames: Vec<Frame>,
}

impl Chain {
    /// Parse `THREAD_STACK` reply.
    pub(crate) fn read(pid: u32, epoch: u64, reader: &mut PayloadReader) -> Result<Self, Error> {
        let status = reader.u32()?;
        let app_domain = reader.u32()?;
        let mut depth = 0;
        let frames = reader.list(|r| {
            let frame = Frame::read(pid, depth, r);
            depth += 1;
            frame
        })?;
        Ok(Chain {
            epoch,
            status,
            app_domain,
            frames,
        })
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }
}

#[derive(Debug)]
pub struct Thread {
    pub pid: u32,
    pub(crate) suspended: bool,
    /// Real thread of a virtual (evaluation) thread.
    pub(crate) owner: Option<u32>,
    /// Evaluation threads started on this real thread, the last one is active.
    pub(crate) virtual_threads: Vec<u32>,
    pub(crate) chain: Option<Chain>,
}

impl Thread {
    pub(crate) fn new(pid: u32) -> Self {
        Self {
            pid,
            suspended: false,
            owner: None,
            virtual_threads: vec![],
            chain: None,
        }
    }

    pub(crate) fn new_virtual(pid: u32, owner: u32) -> Self {
        Self {
            owner: Some(owner),
            ..Self::new(pid)
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.owner.is_some()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Thread that currently runs code on behalf of this real thread.
    pub fn active(&self) -> u32 {
        self.virtual_threads.last().copied().unwrap_or(self.pid)
    }

    pub(crate) fn chain_at(&self, epoch: u64) -> Option<&Chain> {
        self.chain.as_ref().filter(|c| c.epoch == epoch)
    }
}

/// Host-facing snapshot of a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub pid: u32,
    /// Depth within own thread.
    pub depth: u32,
    /// Depth within the whole chain of real and virtual threads.
    pub clr_depth: u32,
    pub md: u32,
    pub ip: u32,
    pub clr_ip: u32,
    pub internal: bool,
    pub function: Option<Function>,
}

impl Process {
    pub(crate) fn real_thread(&self, pid: u32) -> Result<u32, Error> {
        let state = self.state.lock().unwrap();
        let thread = state.threads.get(&pid).ok_or(Error::ThreadNotFound(pid))?;
        Ok(thread.owner.unwrap_or(pid))
    }

    /// Load thread chain if it is missing or stale.
    fn ensure_chain(&self, pid: u32) -> Result<(), Error> {
        let epoch = {
            let state = self.state.lock().unwrap();
            let thread = state.threads.get(&pid).ok_or(Error::ThreadNotFound(pid))?;
            if thread.chain_at(state.epoch).is_some() {
                return Ok(());
            }
            state.epoch
        };

        debug!(target: "process", "load stack of thread {pid}");
        let payload = self.engine().writer().u32(pid).finish();
        let Some(mut reader) = self
            .engine()
            .request_reader(Command::THREAD_STACK, payload, "thread stack")?
        else {
            return Err(Error::ThreadNotFound(pid));
        };
        let chain = Chain::read(pid, epoch, &mut reader)?;

        let mut state = self.state.lock().unwrap();
        if let Some(thread) = state.threads.get_mut(&pid) {
            thread.chain = Some(chain);
        }
        Ok(())
    }

    /// App-domain the thread currently executes in.
    pub(crate) fn thread_app_domain(&self, pid: u32) -> Result<Option<u32>, Error> {
        if !self.state.lock().unwrap().threads.contains_key(&pid) {
            // hit reported before thread list refresh
            self.refresh_threads()?;
        }
        self.ensure_chain(pid)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .threads
            .get(&pid)
            .and_then(|t| t.chain_at(state.epoch))
            .map(|c| c.app_domain))
    }

    /// Call stack of a thread, top frame first. A virtual thread stack continues
    /// with frames of the threads it was started on.
    pub fn backtrace(&self, pid: u32) -> Result<Vec<FrameInfo>, Error> {
        self.ensure_stopped()?;
        let real = self.real_thread(pid)?;
        let mut lineage = vec![real];
        {
            let state = self.state.lock().unwrap();
            let thread = state.threads.get(&real).ok_or(Error::ThreadNotFound(real))?;
            lineage.extend(&thread.virtual_threads);
        }
        let position = lineage
            .iter()
            .position(|p| *p == pid)
            .ok_or(Error::ThreadNotFound(pid))?;
        lineage.truncate(position + 1);

        for pid in &lineage {
            self.ensure_chain(*pid)?;
        }

        let state = self.state.lock().unwrap();
        let mut frames = vec![];
        let mut base = 0;
        for pid in lineage {
            let Some(chain) = state
                .threads
                .get(&pid)
                .and_then(|t| t.chain_at(state.epoch))
            else {
                // stop epoch moved while loading, device resumed
                return Err(Error::ProcessNotStopped);
            };
            for frame in chain.frames() {
                frames.push(FrameInfo {
                    pid,
                    depth: frame.depth,
                    clr_depth: base + frame.depth,
                    md: frame.md,
                    ip: frame.ip,
                    clr_ip: frame.clr_ip(&state.assemblies),
                    internal: frame.internal,
                    function: frame.function(&state.assemblies).cloned(),
                });
            }
            base += chain.frames().len() as u32;
        }
        frames.reverse();
        Ok(frames)
    }

    /// Frame of a thread by device depth.
    pub fn frame(&self, pid: u32, depth: u32) -> Result<FrameInfo, Error> {
        self.backtrace(pid)?
            .into_iter()
            .find(|f| f.pid == pid && f.depth == depth)
            .ok_or(Error::FrameNotFound(depth))
    }

    pub fn suspend_thread(&self, pid: u32) -> Result<bool, Error> {
        self.toggle_thread(pid, true)
    }

    pub fn resume_thread(&self, pid: u32) -> Result<bool, Error> {
        self.toggle_thread(pid, false)
    }

    /// Device is asked only when suspension state actually changes.
    fn toggle_thread(&self, pid: u32, suspend: bool) -> Result<bool, Error> {
        self.ensure_alive()?;
        {
            let state = self.state.lock().unwrap();
            let thread = state.threads.get(&pid).ok_or(Error::ThreadNotFound(pid))?;
            if thread.suspended == suspend {
                return Ok(true);
            }
        }

        let cmd = if suspend {
            Command::THREAD_SUSPEND
        } else {
            Command::THREAD_RESUME
        };
        let payload = self.engine().writer().u32(pid).finish();
        if !self.engine().request_ack(cmd, payload)? {
            return Ok(false);
        }
        if let Some(thread) = self.state.lock().unwrap().threads.get_mut(&pid) {
            thread.suspended = suspend;
        }
        Ok(true)
    }

    pub fn is_thread_suspended(&self, pid: u32) -> Result<bool, Error> {
        let state = self.state.lock().unwrap();
        let thread = state.threads.get(&pid).ok_or(Error::ThreadNotFound(pid))?;
        Ok(thread.suspended)
    }

    pub fn kill_thread(&self, pid: u32) -> Result<bool, Error> {
        self.ensure_alive()?;
        let payload = self.engine().writer().u32(pid).finish();
        self.engine().request_ack(Command::THREAD_KILL, payload)
    }

    /// Exception currently thrown on a thread.
    pub fn thread_exception(&self, pid: u32) -> Result<Option<RuntimeValue>, Error> {
        self.ensure_stopped()?;
        let payload = self.engine().writer().u32(pid).finish();
        let engine = self.engine();
        let Some(mut reader) =
            engine.request_reader(Command::THREAD_GET_EXCEPTION, payload, "thread exception")?
        else {
            return Ok(None);
        };
        let value = RuntimeValue::read(&mut reader, engine.endian())?;
        Ok((!value.is_null()).then_some(value))
    }
}
