//! Binary image serialization and loading.
//!
//! Layout: header, function table, extension-function table, opcode array,
//! string pool padded to a 16-byte multiple. All fixed-size fields are
//! 32-bit words in the producing machine's byte order; the header records
//! that order and the loader byte-swaps when it disagrees with the host.
//! The resulting buffer is position-independent and consumed read-only.

use crate::{
    compile::{CompiledProgram, ExtFunction, FuncInfo},
    intern,
    op::{JumpTarget, Op, OpId, VarAccess},
};

/// `"KBC1"`.
pub const HEADER_MAGIC: [u8; 4] = *b"KBC1";

/// Fixed-length name / extension-id field width (15 bytes + NUL).
pub const NAME_FIELD_LEN: usize = 16;

const HEADER_SIZE: usize = 64;
const FUNC_RECORD_SIZE: usize = 28;
const EXT_RECORD_SIZE: usize = 24;
const OP_RECORD_SIZE: usize = 12;
const STRING_ALIGN: usize = 16;

/// Errors raised while loading an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    TooShort,
    BadMagic([u8; 4]),
    Truncated(&'static str),
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort => write!(f, "image shorter than the fixed header"),
            Self::BadMagic(magic) => write!(f, "bad header magic {magic:02x?}"),
            Self::Truncated(region) => write!(f, "image truncated in the {region} block"),
        }
    }
}

impl std::error::Error for ImageError {}

fn is_host_little_endian() -> bool {
    cfg!(target_endian = "little")
}

fn push_u32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_ne_bytes());
}

fn push_name(buffer: &mut Vec<u8>, name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(NAME_FIELD_LEN - 1);
    buffer.extend_from_slice(&bytes[..len]);
    buffer.extend(std::iter::repeat_n(0u8, NAME_FIELD_LEN - len));
}

fn op_payload(op: &Op) -> (u32, u32) {
    match op {
        Op::Nul | Op::Pop | Op::Return | Op::Stop => (0, 0),
        Op::PushNum(value) => {
            let bits = value.to_bits();
            (bits as u32, (bits >> 32) as u32)
        }
        Op::PushStr(offset) => (*offset, 0),
        Op::PushVar(access)
        | Op::SetVar(access)
        | Op::SetVarAsArray(access)
        | Op::ArrGet(access)
        | Op::ArrSet(access) => (u32::from(access.is_local), access.index),
        Op::UnaryOp(id) | Op::BinaryOp(id) | Op::CallBuiltIn(id) | Op::CallFunc(id) => (*id, 0),
        Op::Goto(target) | Op::IfGoto(target) | Op::UnlessGoto(target) => (target.pos(), 0),
    }
}

fn op_from_record(id: u32, payload0: u32, payload1: u32) -> Op {
    let access = VarAccess {
        is_local: payload0 != 0,
        index: payload1,
    };
    match OpId::from_repr(id) {
        // unknown ids fault at dispatch, not at load
        None | Some(OpId::Nul) => Op::Nul,
        Some(OpId::PushNum) => {
            let bits = u64::from(payload0) | (u64::from(payload1) << 32);
            Op::PushNum(f64::from_bits(bits))
        }
        Some(OpId::PushStr) => Op::PushStr(payload0),
        Some(OpId::PushVar) => Op::PushVar(access),
        Some(OpId::SetVar) => Op::SetVar(access),
        Some(OpId::SetVarAsArray) => Op::SetVarAsArray(access),
        Some(OpId::ArrGet) => Op::ArrGet(access),
        Some(OpId::ArrSet) => Op::ArrSet(access),
        Some(OpId::Pop) => Op::Pop,
        Some(OpId::UnaryOp) => Op::UnaryOp(payload0),
        Some(OpId::BinaryOp) => Op::BinaryOp(payload0),
        Some(OpId::CallBuiltIn) => Op::CallBuiltIn(payload0),
        Some(OpId::CallFunc) => Op::CallFunc(payload0),
        Some(OpId::Goto) => Op::Goto(JumpTarget::Pos(payload0)),
        Some(OpId::IfGoto) => Op::IfGoto(JumpTarget::Pos(payload0)),
        Some(OpId::UnlessGoto) => Op::UnlessGoto(JumpTarget::Pos(payload0)),
        Some(OpId::Return) => Op::Return,
        Some(OpId::Stop) => Op::Stop,
    }
}

/// Serializes a compiled program into its binary image.
///
/// Every jump in `program.ops` must already hold a resolved position;
/// [`compile`](crate::compile::compile) guarantees that.
pub fn serialize(program: &CompiledProgram) -> Vec<u8> {
    let func_block_start = HEADER_SIZE;
    let ext_block_start = func_block_start + program.funcs.len() * FUNC_RECORD_SIZE;
    let opcode_block_start = ext_block_start + program.ext_funcs.len() * EXT_RECORD_SIZE;
    let string_pool_start = opcode_block_start + program.ops.len() * OP_RECORD_SIZE;
    let string_length = program.pool.len();
    let string_aligned = string_length.div_ceil(STRING_ALIGN) * STRING_ALIGN;
    let total = string_pool_start + string_aligned;

    let mut buffer = Vec::with_capacity(total);

    buffer.extend_from_slice(&HEADER_MAGIC);
    push_u32(&mut buffer, u32::from(is_host_little_endian()));
    push_name(&mut buffer, &program.extension_id);
    push_u32(&mut buffer, program.num_globals);
    push_u32(&mut buffer, func_block_start as u32);
    push_u32(&mut buffer, program.funcs.len() as u32);
    push_u32(&mut buffer, ext_block_start as u32);
    push_u32(&mut buffer, program.ext_funcs.len() as u32);
    push_u32(&mut buffer, opcode_block_start as u32);
    push_u32(&mut buffer, program.ops.len() as u32);
    push_u32(&mut buffer, string_pool_start as u32);
    push_u32(&mut buffer, string_length as u32);
    push_u32(&mut buffer, string_aligned as u32);
    debug_assert_eq!(buffer.len(), HEADER_SIZE);

    for func in &program.funcs {
        push_u32(&mut buffer, func.num_params);
        push_u32(&mut buffer, func.num_locals);
        push_u32(&mut buffer, func.opcode_start);
        push_name(&mut buffer, &func.name);
    }

    for ext in &program.ext_funcs {
        push_u32(&mut buffer, ext.call_id);
        push_u32(&mut buffer, ext.num_params);
        push_name(&mut buffer, &ext.name);
    }

    for op in &program.ops {
        let (payload0, payload1) = op_payload(op);
        push_u32(&mut buffer, op.id() as u32);
        push_u32(&mut buffer, payload0);
        push_u32(&mut buffer, payload1);
    }

    buffer.extend_from_slice(&program.pool);
    buffer.extend(std::iter::repeat_n(0u8, string_aligned - string_length));

    buffer
}

/// Bounds-checked reader over the raw image bytes, byte-swapping fields
/// when the image and host disagree on byte order.
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
    swap: bool,
}

impl<'a> Reader<'a> {
    fn seek(&mut self, offset: usize) {
        self.offset = offset;
    }

    fn read_u32(&mut self, region: &'static str) -> Result<u32, ImageError> {
        let end = self.offset.checked_add(4).ok_or(ImageError::Truncated(region))?;
        let chunk = self
            .bytes
            .get(self.offset..end)
            .ok_or(ImageError::Truncated(region))?;
        self.offset = end;
        let word = u32::from_ne_bytes(chunk.try_into().expect("four-byte slice"));
        Ok(if self.swap { word.swap_bytes() } else { word })
    }

    fn read_name(&mut self, region: &'static str) -> Result<String, ImageError> {
        let end = self
            .offset
            .checked_add(NAME_FIELD_LEN)
            .ok_or(ImageError::Truncated(region))?;
        let field = self
            .bytes
            .get(self.offset..end)
            .ok_or(ImageError::Truncated(region))?;
        self.offset = end;
        let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        Ok(String::from_utf8_lossy(&field[..len]).into_owned())
    }
}

/// A loaded binary image: the VM's read-only input.
#[derive(Debug, PartialEq)]
pub struct Image {
    pub little_endian: bool,
    pub extension_id: String,
    pub num_globals: u32,
    pub funcs: Vec<FuncInfo>,
    pub ext_funcs: Vec<ExtFunction>,
    pub ops: Vec<Op>,
    pool: Vec<u8>,
}

impl Image {
    /// Loads and validates an image buffer.
    pub fn load(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ImageError::TooShort);
        }
        let magic: [u8; 4] = bytes[..4].try_into().expect("four-byte slice");
        if magic != HEADER_MAGIC {
            return Err(ImageError::BadMagic(magic));
        }

        // the endian flag is 0 or 1, so it reads the same either way
        let little_endian =
            u32::from_le_bytes(bytes[4..8].try_into().expect("four-byte slice")) == 1;
        let mut reader = Reader {
            bytes,
            offset: 8,
            swap: little_endian != is_host_little_endian(),
        };

        let extension_id = reader.read_name("header")?;
        let num_globals = reader.read_u32("header")?;
        let func_block_start = reader.read_u32("header")?;
        let num_funcs = reader.read_u32("header")?;
        let ext_block_start = reader.read_u32("header")?;
        let num_ext_funcs = reader.read_u32("header")?;
        let opcode_block_start = reader.read_u32("header")?;
        let num_ops = reader.read_u32("header")?;
        let string_pool_start = reader.read_u32("header")?;
        let string_length = reader.read_u32("header")?;
        let _string_aligned = reader.read_u32("header")?;

        reader.seek(func_block_start as usize);
        let mut funcs = Vec::with_capacity(num_funcs as usize);
        for _ in 0..num_funcs {
            let num_params = reader.read_u32("function table")?;
            let num_locals = reader.read_u32("function table")?;
            let opcode_start = reader.read_u32("function table")?;
            let name = reader.read_name("function table")?;
            funcs.push(FuncInfo {
                name,
                num_params,
                num_locals,
                opcode_start,
            });
        }

        reader.seek(ext_block_start as usize);
        let mut ext_funcs = Vec::with_capacity(num_ext_funcs as usize);
        for _ in 0..num_ext_funcs {
            let call_id = reader.read_u32("extension table")?;
            let num_params = reader.read_u32("extension table")?;
            let name = reader.read_name("extension table")?;
            ext_funcs.push(ExtFunction {
                call_id,
                name,
                num_params,
            });
        }

        reader.seek(opcode_block_start as usize);
        let mut ops = Vec::with_capacity(num_ops as usize);
        for _ in 0..num_ops {
            let id = reader.read_u32("opcode array")?;
            let payload0 = reader.read_u32("opcode array")?;
            let payload1 = reader.read_u32("opcode array")?;
            ops.push(op_from_record(id, payload0, payload1));
        }

        let pool_start = string_pool_start as usize;
        let pool_end = pool_start
            .checked_add(string_length as usize)
            .ok_or(ImageError::Truncated("string pool"))?;
        let pool = bytes
            .get(pool_start..pool_end)
            .ok_or(ImageError::Truncated("string pool"))?
            .to_vec();

        Ok(Self {
            little_endian,
            extension_id,
            num_globals,
            funcs,
            ext_funcs,
            ops,
            pool,
        })
    }

    /// The NUL-terminated pool string at `offset`.
    pub fn pool_str(&self, offset: u32) -> &str {
        intern::pool_str(&self.pool, offset)
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }
}
