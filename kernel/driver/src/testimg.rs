//! Fabricated driver images for loader tests.
//!
//! Builds a complete, minimal ET_DYN image in memory: ELF header, three
//! program headers (LOAD, DYNAMIC, INTERP), a dynamic table with one PLT
//! import (`KernelPrint`), a `.driver.info` record, and a symbol table
//! exporting the four lifecycle hooks. All offsets are fixed so tests can
//! assert on specific slots after the real loader has run.

use alloc::vec;
use alloc::vec::Vec;

/// Fixed layout of the fabricated image (file offset == vaddr).
const EHDR_OFF: usize = 0x000;
const PHDR_OFF: usize = 0x040;
const INTERP_OFF: usize = 0x100;
const DYNSTR_OFF: usize = 0x140;
const DYNSYM_OFF: usize = 0x160;
const RELA_DYN_OFF: usize = 0x200;
const RELA_PLT_OFF: usize = 0x260;
const DYNAMIC_OFF: usize = 0x300;
const INFO_OFF: usize = 0x400;
const NAME_OFF: usize = 0x500;
const DESC_OFF: usize = 0x510;
const AUTHOR_OFF: usize = 0x530;
const LICENSE_OFF: usize = 0x540;
const SYMTAB_OFF: usize = 0x600;
const STRTAB_OFF: usize = 0x680;
const GOT_OFF: usize = 0x720;
const SHSTRTAB_OFF: usize = 0x800;
const SHDR_OFF: usize = 0x900;
const FILE_LEN: usize = 0xA40;

/// The load span declared by PT_LOAD (`memsz`); the code stubs live in the
/// zero-filled tail beyond the file contents.
const LOAD_MEMSZ: usize = 0x1100;

pub(crate) struct ImageBuilder {
    interpreter: Vec<u8>,
    /// (r_offset, r_type, r_addend) entries for `.rela.dyn`; at most 4.
    rela_dyn: Vec<(u64, u32, i64)>,
}

impl ImageBuilder {
    /// `e_entry` (`_start`).
    pub const ENTRY_VADDR: usize = 0x1000;
    /// `DriverEntry` symbol value.
    pub const DRIVER_ENTRY_VADDR: usize = 0x1010;
    /// Scratch slot targeted by relocation tests.
    pub const DATA_VADDR: usize = 0x700;
    /// GOT slot filled by the `KernelPrint` PLT import.
    pub const PLT_SLOT_VADDR: usize = 0x738;

    pub fn new() -> Self {
        ImageBuilder {
            interpreter: crate::elf::KERNEL_INTERPRETER.to_vec(),
            rela_dyn: Vec::new(),
        }
    }

    /// Replace the PT_INTERP contents.
    pub fn with_interpreter(mut self, interp: &[u8]) -> Self {
        self.interpreter = interp.to_vec();
        self
    }

    /// Append a `.rela.dyn` entry.
    pub fn with_rela(mut self, offset: u64, rtype: u32, addend: i64) -> Self {
        assert!(self.rela_dyn.len() < 4, "rela.dyn area holds 4 entries");
        self.rela_dyn.push((offset, rtype, addend));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut img = vec![0u8; FILE_LEN];

        // ELF identification: 64-bit, little-endian, SysV ABI version 0.
        img[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        img[4] = 2; // ELFCLASS64
        img[5] = 1; // ELFDATA2LSB
        img[6] = 1; // EV_CURRENT
        img[7] = 0; // ELFOSABI_SYSV
        img[8] = 0; // ABI version

        put_u16(&mut img, EHDR_OFF + 0x10, 3); // e_type = ET_DYN
        put_u16(&mut img, EHDR_OFF + 0x12, 62); // e_machine = EM_X86_64
        put_u32(&mut img, EHDR_OFF + 0x14, 1); // e_version
        put_u64(&mut img, EHDR_OFF + 0x18, Self::ENTRY_VADDR as u64); // e_entry
        put_u64(&mut img, EHDR_OFF + 0x20, PHDR_OFF as u64); // e_phoff
        put_u64(&mut img, EHDR_OFF + 0x28, SHDR_OFF as u64); // e_shoff
        put_u16(&mut img, EHDR_OFF + 0x34, 64); // e_ehsize
        put_u16(&mut img, EHDR_OFF + 0x36, 56); // e_phentsize
        put_u16(&mut img, EHDR_OFF + 0x38, 3); // e_phnum
        put_u16(&mut img, EHDR_OFF + 0x3A, 64); // e_shentsize
        put_u16(&mut img, EHDR_OFF + 0x3C, 5); // e_shnum
        put_u16(&mut img, EHDR_OFF + 0x3E, 1); // e_shstrndx = .shstrtab

        // Program headers.
        put_phdr(&mut img, PHDR_OFF, 1, 0x7, 0, 0, FILE_LEN as u64, LOAD_MEMSZ as u64, 0x1000);
        put_phdr(
            &mut img,
            PHDR_OFF + 56,
            2,
            0x6,
            DYNAMIC_OFF as u64,
            DYNAMIC_OFF as u64,
            0x90,
            0x90,
            8,
        );
        put_phdr(
            &mut img,
            PHDR_OFF + 112,
            3,
            0x4,
            INTERP_OFF as u64,
            INTERP_OFF as u64,
            self.interpreter.len() as u64,
            self.interpreter.len() as u64,
            1,
        );

        img[INTERP_OFF..INTERP_OFF + self.interpreter.len()].copy_from_slice(&self.interpreter);

        // Dynamic string and symbol tables (one import: KernelPrint).
        img[DYNSTR_OFF..DYNSTR_OFF + 13].copy_from_slice(b"\0KernelPrint\0");
        let dynsym1 = DYNSYM_OFF + 24;
        put_u32(&mut img, dynsym1, 1); // st_name -> "KernelPrint"
        img[dynsym1 + 4] = 0x12; // GLOBAL FUNC
        // st_shndx = SHN_UNDEF, st_value = 0: an import.

        // .rela.dyn
        for (i, &(offset, rtype, addend)) in self.rela_dyn.iter().enumerate() {
            let at = RELA_DYN_OFF + i * 24;
            put_u64(&mut img, at, offset);
            put_u64(&mut img, at + 8, rtype as u64); // symbol index 0
            put_u64(&mut img, at + 16, addend as u64);
        }

        // .rela.plt: one R_X86_64_JUMP_SLOT against dynsym[1].
        put_u64(&mut img, RELA_PLT_OFF, Self::PLT_SLOT_VADDR as u64);
        put_u64(&mut img, RELA_PLT_OFF + 8, (1u64 << 32) | 7);
        put_u64(&mut img, RELA_PLT_OFF + 16, 0);

        // Dynamic tag array (9 entries incl. the terminator = 0x90 bytes,
        // matching the PT_DYNAMIC size above).
        let tags: [(u64, u64); 9] = [
            (3, GOT_OFF as u64),                    // DT_PLTGOT
            (2, 24),                                // DT_PLTRELSZ
            (20, 7),                                // DT_PLTREL = DT_RELA
            (7, RELA_DYN_OFF as u64),               // DT_RELA
            (8, (self.rela_dyn.len() * 24) as u64), // DT_RELASZ
            (23, RELA_PLT_OFF as u64),              // DT_JMPREL
            (6, DYNSYM_OFF as u64),                 // DT_SYMTAB
            (5, DYNSTR_OFF as u64),                 // DT_STRTAB
            (0, 0),                                 // DT_NULL
        ];
        for (i, &(tag, value)) in tags.iter().enumerate() {
            put_u64(&mut img, DYNAMIC_OFF + i * 16, tag);
            put_u64(&mut img, DYNAMIC_OFF + i * 16 + 8, value);
        }

        // .driver.info record.
        put_u64(&mut img, INFO_OFF, NAME_OFF as u64);
        put_u64(&mut img, INFO_OFF + 8, DESC_OFF as u64);
        put_u64(&mut img, INFO_OFF + 16, AUTHOR_OFF as u64);
        put_u64(&mut img, INFO_OFF + 24, LICENSE_OFF as u64);
        put_u32(&mut img, INFO_OFF + 32, 1); // major
        put_u32(&mut img, INFO_OFF + 36, 2); // minor
        put_u32(&mut img, INFO_OFF + 40, 3); // patch
        put_u32(&mut img, INFO_OFF + 44, 1); // api_version

        img[NAME_OFF..NAME_OFF + 8].copy_from_slice(b"testdrv\0");
        img[DESC_OFF..DESC_OFF + 12].copy_from_slice(b"test driver\0");
        img[AUTHOR_OFF..AUTHOR_OFF + 7].copy_from_slice(b"nobody\0");
        img[LICENSE_OFF..LICENSE_OFF + 4].copy_from_slice(b"MIT\0");

        // Symbol table exporting the lifecycle hooks.
        let strtab = b"\0DriverEntry\0DriverFinal\0DriverPanic\0DriverProbe\0";
        img[STRTAB_OFF..STRTAB_OFF + strtab.len()].copy_from_slice(strtab);
        let hooks: [(u32, u64); 4] = [
            (1, Self::DRIVER_ENTRY_VADDR as u64), // DriverEntry
            (13, 0x1020),                         // DriverFinal
            (25, 0x1030),                         // DriverPanic
            (37, 0x1040),                         // DriverProbe
        ];
        for (i, &(name, value)) in hooks.iter().enumerate() {
            let at = SYMTAB_OFF + (i + 1) * 24;
            put_u32(&mut img, at, name);
            img[at + 4] = 0x12; // GLOBAL FUNC
            put_u16(&mut img, at + 6, 1); // st_shndx: defined
            put_u64(&mut img, at + 8, value);
            put_u64(&mut img, at + 16, 8); // st_size
        }

        // Section name strings and section headers.
        let shstrtab = b"\0.shstrtab\0.driver.info\0.symtab\0.strtab\0";
        img[SHSTRTAB_OFF..SHSTRTAB_OFF + shstrtab.len()].copy_from_slice(shstrtab);

        // [1] .shstrtab
        put_shdr(&mut img, SHDR_OFF + 64, 1, 3, 0, SHSTRTAB_OFF, shstrtab.len(), 0, 0, 1, 0);
        // [2] .driver.info
        put_shdr(&mut img, SHDR_OFF + 128, 11, 1, INFO_OFF, INFO_OFF, 48, 0, 0, 8, 0);
        // [3] .symtab (5 entries, strings in section 4)
        put_shdr(&mut img, SHDR_OFF + 192, 24, 2, 0, SYMTAB_OFF, 5 * 24, 4, 1, 8, 24);
        // [4] .strtab
        put_shdr(&mut img, SHDR_OFF + 256, 32, 3, 0, STRTAB_OFF, strtab.len(), 0, 0, 1, 0);

        img
    }
}

fn put_u16(img: &mut [u8], off: usize, value: u16) {
    img[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(img: &mut [u8], off: usize, value: u32) {
    img[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(img: &mut [u8], off: usize, value: u64) {
    img[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

#[allow(clippy::too_many_arguments)]
fn put_phdr(
    img: &mut [u8],
    off: usize,
    ptype: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
) {
    put_u32(img, off, ptype);
    put_u32(img, off + 4, flags);
    put_u64(img, off + 8, offset);
    put_u64(img, off + 16, vaddr);
    put_u64(img, off + 24, vaddr); // p_paddr
    put_u64(img, off + 32, filesz);
    put_u64(img, off + 40, memsz);
    put_u64(img, off + 48, align);
}

#[allow(clippy::too_many_arguments)]
fn put_shdr(
    img: &mut [u8],
    off: usize,
    name: u32,
    shtype: u32,
    addr: usize,
    offset: usize,
    size: usize,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
) {
    put_u32(img, off, name);
    put_u32(img, off + 4, shtype);
    put_u64(img, off + 8, if shtype == 1 { 0x2 } else { 0 }); // SHF_ALLOC on PROGBITS
    put_u64(img, off + 16, addr as u64);
    put_u64(img, off + 24, offset as u64);
    put_u64(img, off + 32, size as u64);
    put_u32(img, off + 40, link);
    put_u32(img, off + 44, info);
    put_u64(img, off + 48, align);
    put_u64(img, off + 56, entsize);
}
