//! The stack virtual machine.
//!
//! A [`Machine`] executes a loaded [`Image`]: an operand stack of runtime
//! values, a call-frame stack, a global variable array initialized to
//! Number 0, and a cursor into the opcode array. The RNG behind `rand()`
//! and the cooperative halt flag are owned by the machine instance rather
//! than the process, so embedders and tests control both.

use std::{
    borrow::Cow,
    mem,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use rand::{Rng, SeedableRng, rngs::StdRng};
use smallvec::SmallVec;
use strum::IntoStaticStr;

use crate::{
    ast::Operator,
    builtins::Builtin,
    heap::{ArrayHeap, ArrayId},
    image::Image,
    io::{PrintWriter, StdPrint},
    num,
    op::{JumpTarget, Op, OpId, VarAccess},
    tracer::{NoopTracer, VmTracer},
    value::{RtStr, Value},
};

/// Runtime error categories. Execution halts at the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeError {
    StackUnderflow,
    TypeMismatch,
    UnknownOpcode,
    UnknownOperator,
    UnknownBuiltInFunc,
    UnknownUserFunc,
    DivisionByZero,
    NotInUserFunc,
    ArrayInvalidSize,
    ArrayOutOfBounds,
    NotArray,
}

impl RuntimeError {
    pub fn message(self) -> &'static str {
        match self {
            Self::StackUnderflow => "Stack underflow: attempted to pop from an empty stack",
            Self::TypeMismatch => "Type mismatch: operation applied to incompatible types",
            Self::UnknownOpcode => "Unknown opcode encountered during execution",
            Self::UnknownOperator => "Unknown operator encountered during expression evaluation",
            Self::UnknownBuiltInFunc => "Attempted to call an undefined built-in function",
            Self::UnknownUserFunc => "Attempted to call an undefined user function",
            Self::DivisionByZero => "Division by zero is not allowed",
            Self::NotInUserFunc => "Return statement encountered outside of a function context",
            Self::ArrayInvalidSize => "Invalid array size specified during allocation",
            Self::ArrayOutOfBounds => "Array index out of bounds",
            Self::NotArray => "Attempted to perform array operation on a non-array value",
        }
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// A runtime error with the opcode it was raised against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeErrorReport {
    pub error: RuntimeError,
    /// Index of the failing opcode.
    pub pos: usize,
    pub opcode: OpId,
    /// The operator, when the failing opcode is an operator dispatch.
    pub operator: Option<Operator>,
}

impl std::fmt::Display for RuntimeErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mnemonic: &'static str = self.opcode.into();
        write!(f, "[OpCode {:03}] {mnemonic}", self.pos)?;
        if let Some(operator) = self.operator {
            let name: &'static str = operator.into();
            write!(f, " {name}")?;
        }
        write!(f, ": {}", self.error.message())
    }
}

impl std::error::Error for RuntimeErrorReport {}

/// One user-function activation.
struct CallFrame {
    /// Opcode index of the `CallFunc` that entered this frame.
    return_pos: usize,
    locals: SmallVec<[Value; 8]>,
}

/// What the cursor does after an opcode.
enum Flow {
    Next,
    Jump(usize),
    Stop,
}

type ExecResult<T> = Result<T, RuntimeError>;

fn jump_target(target: JumpTarget) -> ExecResult<usize> {
    match target {
        JumpTarget::Pos(pos) => Ok(pos as usize),
        // a slot parameter can only appear in an image that skipped label
        // resolution; treat it like a malformed instruction
        JumpTarget::Slot(_) => Err(RuntimeError::UnknownOpcode),
    }
}

/// The virtual machine.
pub struct Machine<'img, P = StdPrint, Tr = NoopTracer> {
    image: &'img Image,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Vec<Value>,
    heap: ArrayHeap,
    rng: StdRng,
    halt: Arc<AtomicBool>,
    exit_value: i32,
    print: P,
    tracer: Tr,
}

impl<'img> Machine<'img> {
    /// Creates a machine over a loaded image, printing to stdout.
    pub fn new(image: &'img Image) -> Self {
        Machine {
            image,
            stack: Vec::new(),
            frames: Vec::new(),
            globals: vec![Value::Number(0.0); image.num_globals as usize],
            heap: ArrayHeap::new(),
            rng: StdRng::from_entropy(),
            halt: Arc::new(AtomicBool::new(false)),
            exit_value: 0,
            print: StdPrint,
            tracer: NoopTracer,
        }
    }
}

impl<'img, P: PrintWriter, Tr: VmTracer> Machine<'img, P, Tr> {
    /// Replaces the print writer.
    pub fn with_print<P2: PrintWriter>(self, print: P2) -> Machine<'img, P2, Tr> {
        Machine {
            image: self.image,
            stack: self.stack,
            frames: self.frames,
            globals: self.globals,
            heap: self.heap,
            rng: self.rng,
            halt: self.halt,
            exit_value: self.exit_value,
            print,
            tracer: self.tracer,
        }
    }

    /// Replaces the tracer.
    pub fn with_tracer<T2: VmTracer>(self, tracer: T2) -> Machine<'img, P, T2> {
        Machine {
            image: self.image,
            stack: self.stack,
            frames: self.frames,
            globals: self.globals,
            heap: self.heap,
            rng: self.rng,
            halt: self.halt,
            exit_value: self.exit_value,
            print: self.print,
            tracer,
        }
    }

    /// Seeds the RNG behind `rand()`, for reproducible runs.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Shared flag an embedder may set to stop execution at the next opcode
    /// boundary. Halting leaves every owned value reachable; teardown of the
    /// machine releases them as usual.
    pub fn halt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.halt)
    }

    /// Exit value recorded by the last executed `Stop`.
    pub fn exit_value(&self) -> i32 {
        self.exit_value
    }

    /// Read access to a global variable slot.
    pub fn global(&self, index: usize) -> Option<&Value> {
        self.globals.get(index)
    }

    /// Stringifies a global with the language's display rules.
    pub fn stringify_global(&self, index: usize) -> Option<String> {
        self.globals
            .get(index)
            .map(|value| self.stringify(value).into_owned())
    }

    /// The print writer, e.g. to read collected output back out.
    pub fn print_writer(&self) -> &P {
        &self.print
    }

    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    // -----------------------------------------------------------------
    // Value helpers
    // -----------------------------------------------------------------

    fn str_content<'a>(&'a self, text: &'a RtStr) -> &'a str {
        match text {
            RtStr::Owned(owned) => owned,
            RtStr::Pool(offset) => self.image.pool_str(*offset),
        }
    }

    /// Stringification rules observable through `p`, `&` and embedders.
    pub fn stringify<'a>(&'a self, value: &'a Value) -> Cow<'a, str> {
        match value {
            Value::Nil => Cow::Borrowed("![nil]"),
            Value::Number(number) => Cow::Owned(num::format_number(*number)),
            Value::Str(text) => Cow::Borrowed(self.str_content(text)),
            Value::Array(_) => Cow::Borrowed("![array]"),
            Value::ArrayRef(_) => Cow::Borrowed("![arrayRef]"),
        }
    }

    fn truthy(&self, value: &Value) -> bool {
        match value {
            Value::Nil => false,
            Value::Number(number) => *number as i64 != 0,
            Value::Str(text) => !self.str_content(text).is_empty(),
            Value::Array(_) | Value::ArrayRef(_) => true,
        }
    }

    fn values_equal(&self, left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::Nil, Value::Nil) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => self.str_content(a) == self.str_content(b),
            _ => false,
        }
    }

    /// The reference flavor pushed when a variable or element is read:
    /// numbers copy, strings share their buffer, arrays degrade to refs.
    fn ref_flavor(&self, value: &Value) -> Value {
        match value {
            Value::Nil => Value::Number(0.0),
            Value::Number(number) => Value::Number(*number),
            Value::Str(text) => Value::Str(text.clone()),
            Value::Array(id) | Value::ArrayRef(id) => Value::ArrayRef(*id),
        }
    }

    /// Releases a value that held ownership: freeing an owning array handle
    /// frees its body and, recursively, anything the elements owned.
    fn release_value(&mut self, value: Value) {
        if let Value::Array(id) = value {
            if let Some(body) = self.heap.free(id) {
                for element in body.elements {
                    self.release_value(element);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Dispatch helpers
    // -----------------------------------------------------------------

    fn pop(&mut self) -> ExecResult<Value> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn pop_number(&mut self) -> ExecResult<f64> {
        let value = self.pop()?;
        value.as_number().ok_or(RuntimeError::TypeMismatch)
    }

    fn var_slot(&mut self, access: VarAccess) -> ExecResult<&mut Value> {
        let index = access.index as usize;
        if access.is_local {
            let frame = self.frames.last_mut().ok_or(RuntimeError::NotInUserFunc)?;
            frame
                .locals
                .get_mut(index)
                .ok_or(RuntimeError::UnknownOpcode)
        } else {
            self.globals
                .get_mut(index)
                .ok_or(RuntimeError::UnknownOpcode)
        }
    }

    /// The array id held by a variable slot, following either flavor.
    fn array_in_slot(&mut self, access: VarAccess) -> ExecResult<ArrayId> {
        match self.var_slot(access)? {
            Value::Array(id) | Value::ArrayRef(id) => Ok(*id),
            _ => Err(RuntimeError::NotArray),
        }
    }

    fn push_var(&mut self, access: VarAccess) -> ExecResult<()> {
        let current = self.var_slot(access)?.clone();
        let pushed = self.ref_flavor(&current);
        self.stack.push(pushed);
        Ok(())
    }

    fn set_var(&mut self, access: VarAccess) -> ExecResult<()> {
        let value = self.pop()?;
        let slot = self.var_slot(access)?;
        let old = mem::replace(slot, value);
        self.release_value(old);
        Ok(())
    }

    fn set_var_as_array(&mut self, access: VarAccess) -> ExecResult<()> {
        let size = self.pop_number()? as i64;
        if size <= 0 {
            return Err(RuntimeError::ArrayInvalidSize);
        }
        let id = self.heap.alloc(size as usize);
        let slot = self.var_slot(access)?;
        let old = mem::replace(slot, Value::Array(id));
        self.release_value(old);
        Ok(())
    }

    fn arr_get(&mut self, access: VarAccess) -> ExecResult<()> {
        let id = self.array_in_slot(access)?;
        let subscript = self.pop_number()? as i64;
        let body = self.heap.get(id).ok_or(RuntimeError::NotArray)?;
        if subscript < 0 || subscript as usize >= body.elements.len() {
            return Err(RuntimeError::ArrayOutOfBounds);
        }
        let element = body.elements[subscript as usize].clone();
        let pushed = self.ref_flavor(&element);
        self.stack.push(pushed);
        Ok(())
    }

    fn arr_set(&mut self, access: VarAccess) -> ExecResult<()> {
        let id = self.array_in_slot(access)?;
        let value = self.pop()?;
        let subscript = self.pop_number()? as i64;
        let size = self.heap.get(id).ok_or(RuntimeError::NotArray)?.elements.len();
        if subscript < 0 || subscript as usize >= size {
            return Err(RuntimeError::ArrayOutOfBounds);
        }
        let body = self.heap.get_mut(id).ok_or(RuntimeError::NotArray)?;
        let old = mem::replace(&mut body.elements[subscript as usize], value);
        self.release_value(old);
        Ok(())
    }

    fn binary_op(&mut self, raw_id: u32) -> ExecResult<()> {
        let op = Operator::from_repr(raw_id).ok_or(RuntimeError::UnknownOperator)?;
        let right = self.pop()?;
        let left = self.pop()?;

        let result = match op {
            Operator::Concat => {
                let mut text = self.stringify(&left).into_owned();
                text.push_str(&self.stringify(&right));
                Value::owned_str(text)
            }
            Operator::Add | Operator::Sub | Operator::Mul | Operator::Div | Operator::Pow
            | Operator::IntDiv | Operator::Mod | Operator::Gt | Operator::Lt | Operator::Gteq
            | Operator::Lteq | Operator::ApproxEq => {
                let a = left.as_number().ok_or(RuntimeError::TypeMismatch)?;
                let b = right.as_number().ok_or(RuntimeError::TypeMismatch)?;
                let number = match op {
                    Operator::Add => a + b,
                    Operator::Sub => a - b,
                    Operator::Mul => a * b,
                    Operator::Div => {
                        if b == 0.0 {
                            return Err(RuntimeError::DivisionByZero);
                        }
                        a / b
                    }
                    Operator::IntDiv => {
                        if b == 0.0 {
                            return Err(RuntimeError::DivisionByZero);
                        }
                        (a / b).trunc()
                    }
                    Operator::Mod => {
                        let divisor = b.trunc() as i64;
                        if divisor == 0 {
                            return Err(RuntimeError::DivisionByZero);
                        }
                        ((a.trunc() as i64) % divisor) as f64
                    }
                    Operator::Pow => a.powf(b),
                    Operator::Gt => f64::from(a > b),
                    Operator::Lt => f64::from(a < b),
                    Operator::Gteq => f64::from(a >= b),
                    Operator::Lteq => f64::from(a <= b),
                    Operator::ApproxEq => f64::from(num::approx_eq(a, b)),
                    _ => unreachable!("arm covers numeric operators only"),
                };
                Value::Number(number)
            }
            Operator::And => Value::Number(f64::from(self.truthy(&left) && self.truthy(&right))),
            Operator::Or => Value::Number(f64::from(self.truthy(&left) || self.truthy(&right))),
            Operator::Equal => Value::Number(f64::from(self.values_equal(&left, &right))),
            Operator::Neq => Value::Number(f64::from(!self.values_equal(&left, &right))),
            Operator::Neg | Operator::Not => return Err(RuntimeError::UnknownOperator),
        };

        self.stack.push(result);
        Ok(())
    }

    fn unary_op(&mut self, raw_id: u32) -> ExecResult<()> {
        let op = Operator::from_repr(raw_id).ok_or(RuntimeError::UnknownOperator)?;
        let operand = self.pop()?;
        let result = match op {
            Operator::Neg => {
                let number = operand.as_number().ok_or(RuntimeError::TypeMismatch)?;
                Value::Number(-number)
            }
            Operator::Not => Value::Number(f64::from(!self.truthy(&operand))),
            _ => return Err(RuntimeError::UnknownOperator),
        };
        self.stack.push(result);
        Ok(())
    }

    fn call_builtin(&mut self, raw_id: u32) -> ExecResult<()> {
        let builtin = Builtin::from_repr(raw_id).ok_or(RuntimeError::UnknownBuiltInFunc)?;
        match builtin {
            Builtin::P => {
                let value = self.pop()?;
                let text = self.stringify(&value).into_owned();
                self.print.write_value(Cow::Owned(text));
                self.stack.push(Value::Number(0.0));
            }
            Builtin::Sin => self.call_math(f64::sin)?,
            Builtin::Cos => self.call_math(f64::cos)?,
            Builtin::Tan => self.call_math(f64::tan)?,
            Builtin::Sqrt => self.call_math(f64::sqrt)?,
            Builtin::Exp => self.call_math(f64::exp)?,
            Builtin::Abs => self.call_math(f64::abs)?,
            Builtin::Log => self.call_math(f64::ln)?,
            Builtin::Floor => self.call_math(f64::floor)?,
            Builtin::Ceil => self.call_math(f64::ceil)?,
            Builtin::Rand => {
                let number = self.rng.gen_range(0.0..1.0);
                self.stack.push(Value::Number(number));
            }
            Builtin::Len => {
                let value = self.pop()?;
                let length = match &value {
                    Value::Str(text) => self.str_content(text).len(),
                    Value::Array(id) | Value::ArrayRef(id) => self
                        .heap
                        .get(*id)
                        .ok_or(RuntimeError::NotArray)?
                        .elements
                        .len(),
                    _ => return Err(RuntimeError::TypeMismatch),
                };
                self.stack.push(Value::Number(length as f64));
            }
            Builtin::Val => {
                let value = self.pop()?;
                let Value::Str(text) = &value else {
                    return Err(RuntimeError::TypeMismatch);
                };
                let number = num::parse_number(self.str_content(text));
                self.stack.push(Value::Number(number));
            }
            Builtin::Chr => {
                let code = self.pop_number()? as u32;
                let text = match code {
                    0 => String::new(),
                    _ => char::from_u32(code).map_or_else(String::new, String::from),
                };
                self.stack.push(Value::owned_str(text));
            }
            Builtin::Asc => {
                let value = self.pop()?;
                let Value::Str(text) = &value else {
                    return Err(RuntimeError::TypeMismatch);
                };
                let code = self.str_content(text).bytes().next().unwrap_or(0);
                self.stack.push(Value::Number(f64::from(code)));
            }
        }
        Ok(())
    }

    fn call_math(&mut self, func: fn(f64) -> f64) -> ExecResult<()> {
        let number = self.pop_number()?;
        self.stack.push(Value::Number(func(number)));
        Ok(())
    }

    fn call_func(&mut self, index: u32, pos: usize) -> ExecResult<Flow> {
        let func = self
            .image
            .funcs
            .get(index as usize)
            .ok_or(RuntimeError::UnknownUserFunc)?;
        let num_params = func.num_params as usize;
        let entry = func.opcode_start as usize;

        let mut locals: SmallVec<[Value; 8]> =
            SmallVec::from_elem(Value::Number(0.0), func.num_locals as usize);
        // parameters were pushed left to right, so they pop off in reverse
        for slot in (0..num_params).rev() {
            locals[slot] = self.pop()?;
        }
        self.frames.push(CallFrame {
            return_pos: pos,
            locals,
        });
        self.tracer.on_call(index, self.frames.len());
        Ok(Flow::Jump(entry))
    }

    fn func_return(&mut self) -> ExecResult<Flow> {
        let frame = self.frames.pop().ok_or(RuntimeError::NotInUserFunc)?;
        // parameters were transferred in from the caller, remaining locals
        // belong to the frame itself; both are released here
        for local in frame.locals {
            self.release_value(local);
        }
        self.tracer.on_return(self.frames.len());
        Ok(Flow::Jump(frame.return_pos + 1))
    }

    fn step(&mut self, op: Op, pos: usize) -> ExecResult<Flow> {
        match op {
            Op::Nul => Err(RuntimeError::UnknownOpcode),
            Op::PushNum(number) => {
                self.stack.push(Value::Number(number));
                Ok(Flow::Next)
            }
            Op::PushStr(offset) => {
                self.stack.push(Value::pool_str(offset));
                Ok(Flow::Next)
            }
            Op::PushVar(access) => self.push_var(access).map(|()| Flow::Next),
            Op::SetVar(access) => self.set_var(access).map(|()| Flow::Next),
            Op::SetVarAsArray(access) => self.set_var_as_array(access).map(|()| Flow::Next),
            Op::ArrGet(access) => self.arr_get(access).map(|()| Flow::Next),
            Op::ArrSet(access) => self.arr_set(access).map(|()| Flow::Next),
            Op::Pop => {
                let value = self.pop()?;
                self.release_value(value);
                Ok(Flow::Next)
            }
            Op::UnaryOp(raw) => self.unary_op(raw).map(|()| Flow::Next),
            Op::BinaryOp(raw) => self.binary_op(raw).map(|()| Flow::Next),
            Op::CallBuiltIn(raw) => self.call_builtin(raw).map(|()| Flow::Next),
            Op::CallFunc(index) => self.call_func(index, pos),
            Op::Goto(target) => jump_target(target).map(Flow::Jump),
            Op::IfGoto(target) => {
                let value = self.pop()?;
                if self.truthy(&value) {
                    jump_target(target).map(Flow::Jump)
                } else {
                    Ok(Flow::Next)
                }
            }
            Op::UnlessGoto(target) => {
                let value = self.pop()?;
                if self.truthy(&value) {
                    Ok(Flow::Next)
                } else {
                    jump_target(target).map(Flow::Jump)
                }
            }
            Op::Return => self.func_return(),
            Op::Stop => {
                let value = self.pop_number()?;
                self.exit_value = value as i32;
                Ok(Flow::Stop)
            }
        }
    }

    // -----------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------

    /// Executes from the first opcode. See [`execute_from`](Self::execute_from).
    pub fn execute(&mut self) -> Result<i32, RuntimeErrorReport> {
        self.execute_from(0)
    }

    /// Executes from the given opcode position until `Stop`, the end of the
    /// opcode array, or the halt flag. Returns the exit value.
    pub fn execute_from(&mut self, start: usize) -> Result<i32, RuntimeErrorReport> {
        let mut pos = start;
        self.exit_value = 0;

        while pos < self.image.ops.len() {
            if self.halt.load(Ordering::Relaxed) {
                break;
            }
            let op = self.image.ops[pos];
            self.tracer.on_instruction(pos, op.id(), self.stack.len());

            match self.step(op, pos) {
                Ok(Flow::Next) => pos += 1,
                Ok(Flow::Jump(target)) => pos = target,
                Ok(Flow::Stop) => return Ok(self.exit_value),
                Err(error) => {
                    let operator = match op {
                        Op::UnaryOp(raw) | Op::BinaryOp(raw) => Operator::from_repr(raw),
                        _ => None,
                    };
                    return Err(RuntimeErrorReport {
                        error,
                        pos,
                        opcode: op.id(),
                        operator,
                    });
                }
            }
        }
        Ok(self.exit_value)
    }
}
