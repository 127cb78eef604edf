//! Relocatable driver image loading.
//!
//! Drivers are position-independent ET_DYN images linked against the
//! kernel interpreter path. Loading is eager: segments are copied into an
//! anonymous RWX VMA, the GOT resolver slots are zeroed and every
//! relocation is applied up front, with PLT imports resolved against the
//! kernel symbol table for the image's declared API version. Nothing in a
//! driver image is trusted; every offset is bounds-checked against the
//! reserved span before it is dereferenced.

use crate::info::{DriverInfo, RawDriverInfo, DRIVER_INFO_SECTION};
use crate::symbols;
use crate::DriverError;
use alloc::string::String;
use mm::{pages_for, VirtualMemoryArea, PAGE_SIZE};
use xmas_elf::header::{Class, Data, Machine, Type as ElfType};
use xmas_elf::program::Type as PhType;
use xmas_elf::sections::{SectionData, ShType};
use xmas_elf::symbol_table::Entry as SymEntry;
use xmas_elf::ElfFile;

/// Interpreter path a driver image must request, compared byte-identically
/// (including the terminating NUL).
pub const KERNEL_INTERPRETER: &[u8] = b"/boot/kestrel.elf\0";

/// Image validation and relocation errors; all of them abort the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    NotElf,
    WrongClass,
    NotLittleEndian,
    WrongAbi,
    WrongAbiVersion,
    WrongMachine,
    NotDynamicObject,
    NoEntryPoint,
    NoSectionStrings,
    WrongInterpreter,
    NoLoadableSegments,
    MissingDriverInfo,
    MissingSymbol(&'static str),
    MalformedDynamic(&'static str),
    OutOfBounds,
    /// A PLT import did not resolve under the image's API version.
    UnresolvedImport,
}

/// A fully loaded and relocated image.
#[derive(Debug)]
pub(crate) struct LoadedImage {
    pub base: usize,
    pub span_bytes: usize,
    /// Absolute `_start` address (base + e_entry).
    pub entry_point: usize,
    pub info: DriverInfo,
    /// Absolute lifecycle hook addresses.
    pub probe: usize,
    pub entry: usize,
    pub final_: usize,
    pub panic: usize,
}

const EI_OSABI: usize = 7;
const EI_ABIVERSION: usize = 8;
const ELFOSABI_SYSV: u8 = 0;

const DT_NULL: i64 = 0;
const DT_PLTRELSZ: i64 = 2;
const DT_PLTGOT: i64 = 3;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_PLTREL: i64 = 20;
const DT_JMPREL: i64 = 23;

const R_X86_64_64: u32 = 1;
const R_X86_64_GLOB_DAT: u32 = 6;
const R_X86_64_JUMP_SLOT: u32 = 7;
const R_X86_64_RELATIVE: u32 = 8;

/// Elf64_Rela and Elf64_Sym entry sizes.
const RELA_SIZE: usize = 24;
const SYM_SIZE: usize = 24;

/// Upper bound on in-image C strings (names, metadata).
const MAX_CSTR: usize = 256;

/// Load `image` into a fresh region of `vma`.
pub(crate) fn load_image(
    image: &[u8],
    vma: &VirtualMemoryArea,
) -> Result<LoadedImage, DriverError> {
    let elf = ElfFile::new(image).map_err(|_| DriverError::Image(ImageError::NotElf))?;
    validate_header(&elf, image).map_err(DriverError::Image)?;

    let span = scan_segments(&elf, image).map_err(DriverError::Image)?;

    let pages = pages_for(span) + 1;
    let base = vma
        .request_pages(pages)
        .map_err(|_| DriverError::ResourceExhausted)? as usize;
    let span_bytes = pages * PAGE_SIZE;

    populate(&elf, image, base, span_bytes).map_err(DriverError::Image)
}

/// Header checks: 64-bit little-endian SysV ABI version 0, dynamic shared
/// object for this machine, non-zero entry, valid section-name table.
fn validate_header(elf: &ElfFile, image: &[u8]) -> Result<(), ImageError> {
    let hdr = &elf.header;

    if hdr.pt1.magic != [0x7F, b'E', b'L', b'F'] {
        return Err(ImageError::NotElf);
    }
    match hdr.pt1.class() {
        Class::SixtyFour => {}
        _ => return Err(ImageError::WrongClass),
    }
    match hdr.pt1.data() {
        Data::LittleEndian => {}
        _ => return Err(ImageError::NotLittleEndian),
    }
    if image.get(EI_OSABI).copied() != Some(ELFOSABI_SYSV) {
        return Err(ImageError::WrongAbi);
    }
    if image.get(EI_ABIVERSION).copied() != Some(0) {
        return Err(ImageError::WrongAbiVersion);
    }
    if hdr.pt2.machine().as_machine() != Machine::X86_64 {
        return Err(ImageError::WrongMachine);
    }
    if hdr.pt2.type_().as_type() != ElfType::SharedObject {
        return Err(ImageError::NotDynamicObject);
    }
    if hdr.pt2.entry_point() == 0 {
        return Err(ImageError::NoEntryPoint);
    }
    if hdr.pt2.sh_str_index() == 0 {
        return Err(ImageError::NoSectionStrings);
    }
    Ok(())
}

/// Total load span over PT_LOAD/PT_DYNAMIC, and the interpreter check.
fn scan_segments(elf: &ElfFile, image: &[u8]) -> Result<usize, ImageError> {
    let mut span: usize = 0;
    for ph in elf.program_iter() {
        match ph.get_type() {
            Ok(PhType::Load) | Ok(PhType::Dynamic) => {
                let end = ph
                    .virtual_addr()
                    .checked_add(ph.mem_size())
                    .ok_or(ImageError::OutOfBounds)? as usize;
                if end > span {
                    span = end;
                }
            }
            Ok(PhType::Interp) => {
                let off = ph.offset() as usize;
                let len = ph.file_size() as usize;
                let content = image
                    .get(off..off.checked_add(len).ok_or(ImageError::OutOfBounds)?)
                    .ok_or(ImageError::OutOfBounds)?;
                if content != KERNEL_INTERPRETER {
                    klog!(Error, "driver: image requests a foreign interpreter");
                    return Err(ImageError::WrongInterpreter);
                }
            }
            _ => {}
        }
    }
    if span == 0 {
        return Err(ImageError::NoLoadableSegments);
    }
    Ok(span)
}

/// Copy segments, resolve metadata and symbols, apply relocations.
fn populate(
    elf: &ElfFile,
    image: &[u8],
    base: usize,
    span_bytes: usize,
) -> Result<LoadedImage, ImageError> {
    // Module-info record, pointers still image-relative.
    let raw_info = match elf.find_section_by_name(DRIVER_INFO_SECTION) {
        Some(section) => RawDriverInfo::parse(section.raw_data(elf))
            .ok_or(ImageError::MissingDriverInfo)?,
        None => return Err(ImageError::MissingDriverInfo),
    };

    // Lifecycle hooks from the symbol table.
    let mut probe: Option<usize> = None;
    let mut entry: Option<usize> = None;
    let mut final_: Option<usize> = None;
    let mut panic_: Option<usize> = None;
    for section in elf.section_iter() {
        if section.get_type() != Ok(ShType::SymTab) {
            continue;
        }
        if let Ok(SectionData::SymbolTable64(entries)) = section.get_data(elf) {
            for sym in entries {
                if sym.name() == 0 || sym.shndx() == 0 {
                    continue;
                }
                let resolved = base + sym.value() as usize;
                match sym.get_name(elf) {
                    Ok("DriverEntry") => entry = Some(resolved),
                    Ok("DriverFinal") => final_ = Some(resolved),
                    Ok("DriverPanic") => panic_ = Some(resolved),
                    Ok("DriverProbe") => probe = Some(resolved),
                    _ => {}
                }
            }
        }
    }
    let entry = entry.ok_or(ImageError::MissingSymbol("DriverEntry"))?;
    let final_ = final_.ok_or(ImageError::MissingSymbol("DriverFinal"))?;
    let panic_ = panic_.ok_or(ImageError::MissingSymbol("DriverPanic"))?;
    let probe = probe.ok_or(ImageError::MissingSymbol("DriverProbe"))?;

    // Segment copy with BSS zeroing.
    let mut dynamic: Option<(usize, usize)> = None;
    for ph in elf.program_iter() {
        let ptype = ph.get_type();
        if !matches!(ptype, Ok(PhType::Load) | Ok(PhType::Dynamic)) {
            continue;
        }
        let memsz = ph.mem_size() as usize;
        if memsz == 0 {
            continue;
        }
        let vaddr = ph.virtual_addr() as usize;
        let filesz = ph.file_size() as usize;
        let offset = ph.offset() as usize;

        if filesz > memsz {
            return Err(ImageError::OutOfBounds);
        }
        let seg_end = vaddr.checked_add(memsz).ok_or(ImageError::OutOfBounds)?;
        if seg_end > span_bytes {
            return Err(ImageError::OutOfBounds);
        }
        let src = image
            .get(offset..offset.checked_add(filesz).ok_or(ImageError::OutOfBounds)?)
            .ok_or(ImageError::OutOfBounds)?;

        // Safety: destination range was bounds-checked against the span of
        // the freshly reserved VMA region.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), (base + vaddr) as *mut u8, filesz);
            core::ptr::write_bytes((base + vaddr + filesz) as *mut u8, 0, memsz - filesz);
        }

        if matches!(ptype, Ok(PhType::Dynamic)) {
            dynamic = Some((vaddr, memsz));
        }
    }

    if let Some((dyn_vaddr, dyn_len)) = dynamic {
        apply_dynamic(base, span_bytes, dyn_vaddr, dyn_len, raw_info.api_version)?;
    }

    // Metadata strings now live in the mapped image; rebase and copy them
    // out. The name is mandatory, the rest degrade to empty.
    let info = DriverInfo {
        name: read_cstr(base, span_bytes, raw_info.name_ptr as usize)
            .map_err(|_| ImageError::MissingDriverInfo)?,
        description: read_cstr(base, span_bytes, raw_info.description_ptr as usize)
            .unwrap_or_default(),
        author: read_cstr(base, span_bytes, raw_info.author_ptr as usize).unwrap_or_default(),
        license: read_cstr(base, span_bytes, raw_info.license_ptr as usize).unwrap_or_default(),
        version: raw_info.version,
        api_version: raw_info.api_version,
    };
    if info.name.is_empty() {
        return Err(ImageError::MissingDriverInfo);
    }

    Ok(LoadedImage {
        base,
        span_bytes,
        entry_point: base + elf.header.pt2.entry_point() as usize,
        info,
        probe,
        entry,
        final_,
        panic: panic_,
    })
}

/// Walk the dynamic tag array twice: first to collect sizes and zero the
/// GOT resolver slots, then to apply relocations.
fn apply_dynamic(
    base: usize,
    span_bytes: usize,
    dyn_vaddr: usize,
    dyn_len: usize,
    api_version: u32,
) -> Result<(), ImageError> {
    let max_entries = dyn_len / 16;

    let mut pltrelsz: Option<usize> = None;
    let mut relasz: Option<usize> = None;
    let mut rela: Option<usize> = None;
    let mut jmprel: Option<usize> = None;
    let mut symtab: Option<usize> = None;
    let mut strtab: Option<usize> = None;
    let mut pltgot: Option<usize> = None;

    let mut index = 0;
    loop {
        if index >= max_entries {
            return Err(ImageError::MalformedDynamic("unterminated tag array"));
        }
        let tag = read_u64(base, span_bytes, dyn_vaddr + index * 16)? as i64;
        let value = read_u64(base, span_bytes, dyn_vaddr + index * 16 + 8)?;
        match tag {
            DT_NULL => break,
            DT_PLTRELSZ => pltrelsz = Some(value as usize),
            DT_PLTGOT => pltgot = Some(value as usize),
            DT_RELASZ => relasz = Some(value as usize),
            DT_RELA => rela = Some(value as usize),
            DT_JMPREL => jmprel = Some(value as usize),
            DT_SYMTAB => symtab = Some(value as usize),
            DT_STRTAB => strtab = Some(value as usize),
            DT_PLTREL => {
                if value as i64 != DT_RELA {
                    return Err(ImageError::MalformedDynamic("DT_PLTREL is not DT_RELA"));
                }
            }
            _ => {}
        }
        index += 1;
    }

    if let Some(got) = pltgot {
        // GOT[1]/GOT[2] are the link-map and lazy-resolver slots; binding
        // is eager, so both are cleared.
        write_u64(base, span_bytes, got + 8, 0)?;
        write_u64(base, span_bytes, got + 16, 0)?;
    }

    // .rela.dyn
    if let Some(rela_off) = rela {
        let size = relasz.ok_or(ImageError::MalformedDynamic("DT_RELA without DT_RELASZ"))?;
        for i in 0..size / RELA_SIZE {
            let (r_offset, r_info, r_addend) = read_rela(base, span_bytes, rela_off + i * RELA_SIZE)?;
            let target = match r_info as u32 {
                R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => base as u64,
                R_X86_64_RELATIVE | R_X86_64_64 => (base as i64).wrapping_add(r_addend) as u64,
                other => {
                    klog!(Warn, "driver: unhandled relocation type {:#x}, left untouched", other);
                    continue;
                }
            };
            write_u64(base, span_bytes, r_offset as usize, target)?;
        }
    }

    // .rela.plt: imports resolved against the kernel symbol table.
    if let Some(plt_off) = jmprel {
        let size = pltrelsz.ok_or(ImageError::MalformedDynamic("DT_JMPREL without DT_PLTRELSZ"))?;
        let symtab = symtab.ok_or(ImageError::MalformedDynamic("missing DT_SYMTAB"))?;
        let strtab = strtab.ok_or(ImageError::MalformedDynamic("missing DT_STRTAB"))?;

        for i in 0..size / RELA_SIZE {
            let (r_offset, r_info, _) = read_rela(base, span_bytes, plt_off + i * RELA_SIZE)?;
            let rtype = r_info as u32;
            if rtype != R_X86_64_JUMP_SLOT {
                klog!(Warn, "driver: unhandled PLT relocation type {:#x}, left untouched", rtype);
                continue;
            }
            let sym_index = (r_info >> 32) as usize;
            let st_name = read_u32(base, span_bytes, symtab + sym_index * SYM_SIZE)?;
            let name = read_cstr(base, span_bytes, strtab + st_name as usize)?;
            let address = symbols::get_symbol_by_name(&name, api_version).map_err(|e| {
                klog!(
                    Error,
                    "driver: cannot resolve import {} (api {}): {:?}",
                    name,
                    api_version,
                    e
                );
                ImageError::UnresolvedImport
            })?;
            write_u64(base, span_bytes, r_offset as usize, address as u64)?;
        }
    }

    Ok(())
}

#[inline]
fn check_range(span_bytes: usize, offset: usize, len: usize) -> Result<(), ImageError> {
    match offset.checked_add(len) {
        Some(end) if end <= span_bytes => Ok(()),
        _ => Err(ImageError::OutOfBounds),
    }
}

fn read_u64(base: usize, span_bytes: usize, offset: usize) -> Result<u64, ImageError> {
    check_range(span_bytes, offset, 8)?;
    // Safety: bounds-checked against the reserved span.
    Ok(unsafe { core::ptr::read_unaligned((base + offset) as *const u64) })
}

fn read_u32(base: usize, span_bytes: usize, offset: usize) -> Result<u32, ImageError> {
    check_range(span_bytes, offset, 4)?;
    // Safety: bounds-checked against the reserved span.
    Ok(unsafe { core::ptr::read_unaligned((base + offset) as *const u32) })
}

fn write_u64(base: usize, span_bytes: usize, offset: usize, value: u64) -> Result<(), ImageError> {
    check_range(span_bytes, offset, 8)?;
    // Safety: bounds-checked against the reserved span.
    unsafe { core::ptr::write_unaligned((base + offset) as *mut u64, value) };
    Ok(())
}

fn read_rela(
    base: usize,
    span_bytes: usize,
    offset: usize,
) -> Result<(u64, u64, i64), ImageError> {
    let r_offset = read_u64(base, span_bytes, offset)?;
    let r_info = read_u64(base, span_bytes, offset + 8)?;
    let r_addend = read_u64(base, span_bytes, offset + 16)? as i64;
    Ok((r_offset, r_info, r_addend))
}

/// Read a NUL-terminated string out of the mapped image.
fn read_cstr(base: usize, span_bytes: usize, offset: usize) -> Result<String, ImageError> {
    let mut bytes = alloc::vec::Vec::new();
    let mut at = offset;
    loop {
        check_range(span_bytes, at, 1)?;
        // Safety: bounds-checked against the reserved span.
        let byte = unsafe { core::ptr::read((base + at) as *const u8) };
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        at += 1;
        if bytes.len() > MAX_CSTR {
            return Err(ImageError::OutOfBounds);
        }
    }
    String::from_utf8(bytes).map_err(|_| ImageError::OutOfBounds)
}
