//! VM execution tracing hooks.
//!
//! The machine is parameterized over a [`VmTracer`]; with the default
//! [`NoopTracer`] every hook monomorphizes to nothing, so tracing costs
//! nothing unless a real tracer is plugged in.

use crate::op::OpId;

/// One recorded execution event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An opcode was dispatched.
    Instruction {
        pos: usize,
        opcode: OpId,
        stack_depth: usize,
    },
    /// A user-function call pushed a frame.
    Call { func_index: u32, depth: usize },
    /// A return popped a frame.
    Return { depth: usize },
}

/// Hook points at key execution events. Every method has a no-op default,
/// so implementations override only what they care about.
pub trait VmTracer {
    /// Called before each opcode dispatch; the hottest hook.
    #[inline(always)]
    fn on_instruction(&mut self, _pos: usize, _opcode: OpId, _stack_depth: usize) {}

    /// Called after a `CallFunc` pushed its frame.
    #[inline(always)]
    fn on_call(&mut self, _func_index: u32, _depth: usize) {}

    /// Called after a `Return` popped its frame.
    #[inline(always)]
    fn on_return(&mut self, _depth: usize) {}
}

/// Zero-cost no-op tracer, the production default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Human-readable execution log on stderr.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, pos: usize, opcode: OpId, stack_depth: usize) {
        let mnemonic: &'static str = opcode.into();
        eprintln!("{pos:03} | {mnemonic:<18} | stack={stack_depth}");
    }

    fn on_call(&mut self, func_index: u32, depth: usize) {
        eprintln!("    -> call #{func_index} (depth {depth})");
    }

    fn on_return(&mut self, depth: usize) {
        eprintln!("    <- return (depth {depth})");
    }
}

/// Records every event for post-mortem inspection.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }
}

impl VmTracer for RecordingTracer {
    fn on_instruction(&mut self, pos: usize, opcode: OpId, stack_depth: usize) {
        self.events.push(TraceEvent::Instruction {
            pos,
            opcode,
            stack_depth,
        });
    }

    fn on_call(&mut self, func_index: u32, depth: usize) {
        self.events.push(TraceEvent::Call { func_index, depth });
    }

    fn on_return(&mut self, depth: usize) {
        self.events.push(TraceEvent::Return { depth });
    }
}
