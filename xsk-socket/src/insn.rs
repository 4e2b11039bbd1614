//! # Redirect Program Instructions
//!
//! The redirect program is small enough to be assembled directly into eBPF
//! instructions, so no object file or compiler toolchain is involved.
//!
//! Both variants look up the receiving queue in an `XSKMAP` and call
//! `bpf_redirect_map`. The low bits of the helper's flags argument give the
//! action returned when the map has no entry for the queue, which is how an
//! empty slot passes packets to the stack instead of dropping them.

// opcode classes
const BPF_LD: u8 = 0x00;
const BPF_LDX: u8 = 0x01;
const BPF_ALU64: u8 = 0x07;
const BPF_JMP: u8 = 0x05;
// sizes
const BPF_W: u8 = 0x00;
const BPF_H: u8 = 0x08;
const BPF_DW: u8 = 0x18;
// modes
const BPF_IMM: u8 = 0x00;
const BPF_MEM: u8 = 0x60;
// alu / jmp operations
const BPF_ADD: u8 = 0x00;
const BPF_MOV: u8 = 0xb0;
const BPF_JGT: u8 = 0x20;
const BPF_JNE: u8 = 0x50;
const BPF_CALL: u8 = 0x80;
const BPF_EXIT: u8 = 0x90;
// operand source
const BPF_K: u8 = 0x00;
const BPF_X: u8 = 0x08;

const BPF_PSEUDO_MAP_FD: u8 = 1;
const BPF_FUNC_REDIRECT_MAP: i32 = 51;

/// `struct xdp_md` field offsets.
const XDP_MD_DATA: i16 = 0;
const XDP_MD_DATA_END: i16 = 4;
const XDP_MD_RX_QUEUE_INDEX: i16 = 16;

const ETH_HLEN: i32 = 14;
const ETH_TYPE_OFFSET: i16 = 12;

/// XDP verdicts.
pub const XDP_ABORTED: u32 = 0;
pub const XDP_DROP: u32 = 1;
pub const XDP_PASS: u32 = 2;
pub const XDP_REDIRECT: u32 = 4;

/// One eBPF instruction; layout of `struct bpf_insn`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub code: u8,
    /// `src_reg << 4 | dst_reg`.
    pub regs: u8,
    pub off: i16,
    pub imm: i32,
}

static_assertions::assert_eq_size!(Insn, libbpf_sys::bpf_insn);

impl Insn {
    const fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        Insn {
            code,
            regs: (src << 4) | (dst & 0x0f),
            off,
            imm,
        }
    }

    pub fn dst(&self) -> u8 {
        self.regs & 0x0f
    }

    pub fn src(&self) -> u8 {
        self.regs >> 4
    }
}

fn mov_reg(dst: u8, src: u8) -> Insn {
    Insn::new(BPF_ALU64 | BPF_MOV | BPF_X, dst, src, 0, 0)
}

fn mov_imm(dst: u8, imm: i32) -> Insn {
    Insn::new(BPF_ALU64 | BPF_MOV | BPF_K, dst, 0, 0, imm)
}

fn add_imm(dst: u8, imm: i32) -> Insn {
    Insn::new(BPF_ALU64 | BPF_ADD | BPF_K, dst, 0, 0, imm)
}

fn load_w(dst: u8, src: u8, off: i16) -> Insn {
    Insn::new(BPF_LDX | BPF_MEM | BPF_W, dst, src, off, 0)
}

fn load_h(dst: u8, src: u8, off: i16) -> Insn {
    Insn::new(BPF_LDX | BPF_MEM | BPF_H, dst, src, off, 0)
}

/// `dst = map` as the two-slot wide load the loader patches with the map.
fn load_map_fd(dst: u8, map_fd: i32) -> [Insn; 2] {
    [
        Insn::new(BPF_LD | BPF_IMM | BPF_DW, dst, BPF_PSEUDO_MAP_FD, 0, map_fd),
        Insn::new(0, 0, 0, 0, 0),
    ]
}

fn jgt_reg(dst: u8, src: u8, off: i16) -> Insn {
    Insn::new(BPF_JMP | BPF_JGT | BPF_X, dst, src, off, 0)
}

fn jne_imm(dst: u8, imm: i32, off: i16) -> Insn {
    Insn::new(BPF_JMP | BPF_JNE | BPF_K, dst, 0, off, imm)
}

fn call(helper: i32) -> Insn {
    Insn::new(BPF_JMP | BPF_CALL, 0, 0, 0, helper)
}

fn exit() -> Insn {
    Insn::new(BPF_JMP | BPF_EXIT, 0, 0, 0, 0)
}

/// Redirects every packet to the socket registered for its RX queue.
///
/// ```text
/// r2 = ctx->rx_queue_index
/// r1 = map
/// r3 = fallback
/// return bpf_redirect_map(r1, r2, r3)
/// ```
pub fn redirect_all(map_fd: i32, fallback: u32) -> Vec<Insn> {
    let mut prog = vec![load_w(2, 1, XDP_MD_RX_QUEUE_INDEX)];
    prog.extend(load_map_fd(1, map_fd));
    prog.extend([mov_imm(3, fallback as i32), call(BPF_FUNC_REDIRECT_MAP), exit()]);
    prog
}

/// Redirects frames whose EtherType equals `ethertype`; everything else,
/// including frames too short for an Ethernet header, gets `fallback`.
///
/// ```text
///  0: r6 = r1
///  1: r2 = ctx->data
///  2: r3 = ctx->data_end
///  3: r4 = r2
///  4: r4 += 14
///  5: if r4 > r3 goto 14
///  6: r4 = *(u16 *)(r2 + 12)
///  7: if r4 != ethertype goto 14
///  8: r2 = ctx->rx_queue_index
///  9: r1 = map (two slots)
/// 11: r3 = fallback
/// 12: call bpf_redirect_map
/// 13: exit
/// 14: r0 = fallback
/// 15: exit
/// ```
pub fn redirect_ethertype(map_fd: i32, ethertype: u16, fallback: u32) -> Vec<Insn> {
    // the half-word load reads network byte order into a host integer
    let wire = u16::from_ne_bytes(ethertype.to_be_bytes()) as i32;
    let mut prog = vec![
        mov_reg(6, 1),
        load_w(2, 1, XDP_MD_DATA),
        load_w(3, 1, XDP_MD_DATA_END),
        mov_reg(4, 2),
        add_imm(4, ETH_HLEN),
        jgt_reg(4, 3, 8),
        load_h(4, 2, ETH_TYPE_OFFSET),
        jne_imm(4, wire, 6),
        load_w(2, 6, XDP_MD_RX_QUEUE_INDEX),
    ];
    prog.extend(load_map_fd(1, map_fd));
    prog.extend([
        mov_imm(3, fallback as i32),
        call(BPF_FUNC_REDIRECT_MAP),
        exit(),
        mov_imm(0, fallback as i32),
        exit(),
    ]);
    prog
}

#[cfg(test)]
mod test {
    use super::*;

    fn is_jump(insn: &Insn) -> bool {
        insn.code & 0x07 == BPF_JMP && !matches!(insn.code & 0xf0, BPF_CALL | BPF_EXIT)
    }

    #[test]
    fn register_packing() {
        let insn = Insn::new(BPF_LD | BPF_IMM | BPF_DW, 1, BPF_PSEUDO_MAP_FD, 0, 7);
        assert_eq!(insn.dst(), 1);
        assert_eq!(insn.src(), BPF_PSEUDO_MAP_FD);
        assert_eq!(insn.regs, 0x11);
    }

    #[test]
    fn all_queues_shape() {
        let prog = redirect_all(5, XDP_PASS);
        assert_eq!(prog.len(), 6);
        assert_eq!(prog[0].code, BPF_LDX | BPF_MEM | BPF_W);
        assert_eq!(prog[0].off, XDP_MD_RX_QUEUE_INDEX);
        assert_eq!(prog[1].imm, 5);
        assert_eq!(prog[3].imm, XDP_PASS as i32);
        assert_eq!(prog[4].imm, BPF_FUNC_REDIRECT_MAP);
        assert_eq!(prog[5].code, BPF_JMP | BPF_EXIT);
    }

    #[test]
    fn ethertype_jumps_land_on_fallback() {
        let prog = redirect_ethertype(5, 0x88b5, XDP_DROP);
        assert_eq!(prog.len(), 16);
        let fallback = prog.len() - 2;
        assert_eq!(prog[fallback], mov_imm(0, XDP_DROP as i32));
        for (pc, insn) in prog.iter().enumerate().filter(|(_, i)| is_jump(i)) {
            let target = pc as i64 + 1 + insn.off as i64;
            assert_eq!(target, fallback as i64, "jump at {pc}");
        }
        assert_eq!(prog.iter().filter(|i| is_jump(i)).count(), 2);
    }

    #[test]
    fn ethertype_compares_wire_order() {
        let prog = redirect_ethertype(5, 0x0800, XDP_PASS);
        let wire = u16::from_ne_bytes([0x08, 0x00]) as i32;
        assert_eq!(prog[7].imm, wire);
    }
}
