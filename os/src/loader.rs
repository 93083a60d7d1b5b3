//! ELF executable loader
//!
//! Maps every `PT_LOAD` segment of a RISC-V ELF64 executable into the active
//! space and returns its entry point.

use alloc::vec;
use alloc::vec::Vec;

use xmas_elf::header::{self, Class, Data};
use xmas_elf::program::{self, ProgramHeader};
use xmas_elf::ElfFile;

use crate::config::{PAGE_SIZE, USER_END_VMA, USER_START_VMA};
use crate::error::{Error, Result};
use crate::io::{read_full, seek, Io, Ioctl};
use crate::mm::{round_down, round_up, MemoryManager, Mmu, PTEFlags};

const EM_RISCV: u16 = 0xF3;
/// Offset of `e_machine` in the ELF header.
const E_MACHINE: usize = 18;
const EHDR_SIZE: usize = 64;
const E_PHOFF: usize = 32;
const E_PHENTSIZE: usize = 54;
const E_PHNUM: usize = 56;

/// Reads the executable behind `io` and maps it into the active space.
///
/// Only the ELF and program headers are buffered; segment contents go
/// straight from `io` into the mapped pages a page at a time. A failed load
/// may leave some segments mapped.
pub fn load<M: Mmu>(io: &mut dyn Io, mm: &mut MemoryManager<M>) -> Result<usize> {
    let len = io.ioctl(Ioctl::GetLen)?;
    let headers = read_headers(io, len)?;
    let elf = ElfFile::new(&headers).map_err(|e| {
        debug!("loader: {}", e);
        Error::BadFormat
    })?;
    check_header(&elf, &headers)?;

    let entry = elf.header.pt2.entry_point() as usize;
    let mut loads = Vec::new();
    for ph in elf.program_iter() {
        if ph.get_type() != Ok(program::Type::Load) {
            continue;
        }
        map_segment(mm, io, len, &ph)?;
        loads.push(ph);
    }
    if loads.is_empty() {
        return Err(Error::BadFormat);
    }
    for ph in loads {
        let va = ph.virtual_addr() as usize;
        mm.set_range_flags(va, ph.mem_size() as usize, final_flags(&ph));
    }
    info!("loader: entry {:#x}", entry);
    Ok(entry)
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_exact_at(io: &mut dyn Io, pos: u64, buf: &mut [u8]) -> Result<()> {
    seek(io, pos)?;
    if read_full(io, buf)? != buf.len() {
        return Err(Error::Io);
    }
    Ok(())
}

/// Reads the ELF header through the end of the program header table, which
/// must sit within the first page of an image of `len` bytes.
fn read_headers(io: &mut dyn Io, len: u64) -> Result<Vec<u8>> {
    if len < EHDR_SIZE as u64 {
        return Err(Error::BadFormat);
    }
    let mut ehdr = [0u8; EHDR_SIZE];
    read_exact_at(io, 0, &mut ehdr)?;
    let mut phoff = [0u8; 8];
    phoff.copy_from_slice(&ehdr[E_PHOFF..E_PHOFF + 8]);
    let phoff = u64::from_le_bytes(phoff);
    let phsize = get_u16(&ehdr, E_PHENTSIZE) as u64 * get_u16(&ehdr, E_PHNUM) as u64;
    let end = phoff
        .checked_add(phsize)
        .filter(|&end| end <= len && end <= PAGE_SIZE as u64)
        .ok_or(Error::BadFormat)?
        .max(EHDR_SIZE as u64);
    let mut headers = vec![0u8; end as usize];
    read_exact_at(io, 0, &mut headers)?;
    Ok(headers)
}

fn check_header(elf: &ElfFile, headers: &[u8]) -> Result<()> {
    let pt1 = &elf.header.pt1;
    if pt1.magic != header::MAGIC || pt1.class() != Class::SixtyFour {
        return Err(Error::BadFormat);
    }
    if pt1.data() != Data::LittleEndian {
        return Err(Error::BadFormat);
    }
    if elf.header.pt2.type_().as_type() != header::Type::Executable {
        return Err(Error::BadFormat);
    }
    if get_u16(headers, E_MACHINE) != EM_RISCV || elf.header.pt2.entry_point() == 0 {
        return Err(Error::BadFormat);
    }
    Ok(())
}

fn map_segment<M: Mmu>(
    mm: &mut MemoryManager<M>,
    io: &mut dyn Io,
    len: u64,
    ph: &ProgramHeader,
) -> Result<()> {
    let va = ph.virtual_addr() as usize;
    let memsz = ph.mem_size() as usize;
    let filesz = ph.file_size() as usize;
    let offset = ph.offset();
    let end = va.checked_add(memsz).ok_or(Error::BadFormat)?;
    if va < USER_START_VMA || end > USER_END_VMA || filesz > memsz {
        return Err(Error::BadFormat);
    }
    match offset.checked_add(filesz as u64) {
        Some(last) if last <= len => {}
        _ => return Err(Error::BadFormat),
    }
    trace!("loader: segment {:#x}..{:#x}, {} file bytes", va, end, filesz);

    let rw = PTEFlags::R | PTEFlags::W | PTEFlags::U;
    for page in (round_down(va, PAGE_SIZE)..round_up(end, PAGE_SIZE)).step_by(PAGE_SIZE) {
        // a page shared with an earlier segment keeps its contents
        if mm.translate(page).is_none() {
            mm.alloc_and_map_page(page, rw);
        }
    }

    seek(io, offset)?;
    let mut chunk = vec![0u8; PAGE_SIZE];
    let mut done = 0;
    while done < filesz {
        let n = (filesz - done).min(PAGE_SIZE);
        if read_full(io, &mut chunk[..n])? != n {
            return Err(Error::Io);
        }
        mm.copy_to_user(va + done, &chunk[..n], rw)?;
        done += n;
    }
    Ok(())
}

fn final_flags(ph: &ProgramHeader) -> PTEFlags {
    let pf = ph.flags();
    let mut flags = PTEFlags::U;
    if pf.is_read() {
        flags |= PTEFlags::R;
    }
    if pf.is_write() {
        flags |= PTEFlags::W;
    }
    if pf.is_execute() {
        flags |= PTEFlags::X;
    }
    flags
}
