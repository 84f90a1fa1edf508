//! Binary image layout properties: block offsets, resolved jumps, string
//! pool monotonicity, and cross-endian loading.

use khronicler::{HEADER_MAGIC, Image, JumpTarget, Machine, NoPrint, Op, build};
use pretty_assertions::assert_eq;

const HEADER_SIZE: usize = 64;
const FUNC_RECORD_SIZE: usize = 28;
const EXT_RECORD_SIZE: usize = 24;
const OP_RECORD_SIZE: usize = 12;

const SAMPLE: &str = "func square(x)\n\
                      return x * x\n\
                      end func\n\
                      dim msg = \"total: \"\n\
                      dim total = 0\n\
                      for i = 1 to 4\n\
                      total = total + square(i)\n\
                      next\n\
                      p(msg & total)\n\
                      exit total\n";

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

#[test]
fn header_describes_the_blocks() {
    let bytes = build(SAMPLE).unwrap();
    assert_eq!(&bytes[..4], &HEADER_MAGIC);

    let num_globals = read_u32(&bytes, 24);
    let func_block_start = read_u32(&bytes, 28);
    let num_funcs = read_u32(&bytes, 32);
    let ext_block_start = read_u32(&bytes, 36);
    let num_ext = read_u32(&bytes, 40);
    let opcode_block_start = read_u32(&bytes, 44);
    let num_ops = read_u32(&bytes, 48);
    let string_pool_start = read_u32(&bytes, 52);
    let string_length = read_u32(&bytes, 56);
    let string_aligned = read_u32(&bytes, 60);

    // msg, total, and the implicitly declared loop variable
    assert_eq!(num_globals, 3);
    assert_eq!(num_funcs, 1);
    assert_eq!(num_ext, 0);
    assert_eq!(func_block_start as usize, HEADER_SIZE);
    assert_eq!(
        ext_block_start as usize,
        HEADER_SIZE + FUNC_RECORD_SIZE * num_funcs as usize
    );
    assert_eq!(
        opcode_block_start as usize,
        ext_block_start as usize + EXT_RECORD_SIZE * num_ext as usize
    );
    assert_eq!(
        string_pool_start as usize,
        opcode_block_start as usize + OP_RECORD_SIZE * num_ops as usize
    );
    assert_eq!(string_aligned % 16, 0);
    assert!(string_aligned >= string_length);
    assert_eq!(bytes.len(), string_pool_start as usize + string_aligned as usize);
}

#[test]
fn every_jump_parameter_is_a_resolved_position() {
    let bytes = build(SAMPLE).unwrap();
    let image = Image::load(&bytes).unwrap();
    let count = image.ops.len() as u32;
    for op in &image.ops {
        if let Op::Goto(target) | Op::IfGoto(target) | Op::UnlessGoto(target) = op {
            match target {
                JumpTarget::Pos(pos) => assert!(*pos <= count),
                JumpTarget::Slot(slot) => panic!("unresolved label slot {slot}"),
            }
        }
    }
}

#[test]
fn push_str_offsets_are_monotonic_and_in_bounds() {
    let source = "dim a = \"one\"\n\
                  dim b = \"two\"\n\
                  dim c = \"three\"\n\
                  exit 0\n";
    let bytes = build(source).unwrap();
    let image = Image::load(&bytes).unwrap();

    let mut last = 0;
    for op in &image.ops {
        if let Op::PushStr(offset) = op {
            assert!(*offset >= last, "offsets must not decrease");
            assert!((*offset as usize) < image.pool_len());
            last = *offset;
        }
    }
    assert_eq!(image.pool_str(0), "one");
}

#[test]
fn cross_endian_image_loads_identically() {
    let bytes = build(SAMPLE).unwrap();
    let native = Image::load(&bytes).unwrap();

    // forge the same image as produced on an opposite-endian machine:
    // flip the endian flag and byte-swap every fixed-size field
    let mut foreign = bytes.clone();
    let claims_little = read_u32(&bytes, 4) == 1;
    foreign[4..8].copy_from_slice(if claims_little {
        &[0, 0, 0, 0]
    } else {
        &[1, 0, 0, 0]
    });

    let swap_at = |buffer: &mut Vec<u8>, offset: usize| {
        buffer[offset..offset + 4].reverse();
    };
    for offset in (24..HEADER_SIZE).step_by(4) {
        swap_at(&mut foreign, offset);
    }
    let func_block_start = read_u32(&bytes, 28) as usize;
    let num_funcs = read_u32(&bytes, 32) as usize;
    for record in 0..num_funcs {
        let base = func_block_start + record * FUNC_RECORD_SIZE;
        for field in 0..3 {
            swap_at(&mut foreign, base + field * 4);
        }
    }
    let opcode_block_start = read_u32(&bytes, 44) as usize;
    let num_ops = read_u32(&bytes, 48) as usize;
    for record in 0..num_ops {
        let base = opcode_block_start + record * OP_RECORD_SIZE;
        for field in 0..3 {
            swap_at(&mut foreign, base + field * 4);
        }
    }

    let swapped = Image::load(&foreign).unwrap();
    assert_eq!(swapped.little_endian, !native.little_endian);
    assert_eq!(swapped.num_globals, native.num_globals);
    assert_eq!(swapped.funcs, native.funcs);
    assert_eq!(swapped.ops, native.ops);
    assert_eq!(swapped.extension_id, native.extension_id);

    // and it executes to the same result
    let mut machine = Machine::new(&swapped).with_print(NoPrint);
    assert_eq!(machine.execute().unwrap(), 30);
}

#[test]
fn round_trip_execution_matches() {
    let bytes = build(SAMPLE).unwrap();
    let image = Image::load(&bytes).unwrap();
    let mut machine = Machine::new(&image).with_print(NoPrint);
    // 1 + 4 + 9 + 16
    assert_eq!(machine.execute().unwrap(), 30);
    assert_eq!(machine.stringify_global(0).unwrap(), "total: ");
    assert_eq!(machine.stringify_global(1).unwrap(), "30");
}
