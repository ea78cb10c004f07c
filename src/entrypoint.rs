//! File offset of the executable entry point for `entrypoint`.
//!
//! PE images map `AddressOfEntryPoint` through the section table; ELF
//! images map `e_entry` through the `PT_LOAD` segment containing it.
//! Headers are parsed with `goblin`; anything it rejects has no entry point.

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use goblin::pe::PE;
use tracing::trace;

/// Entry point file offset, or `None` when `data` is not a well-formed PE
/// or ELF image or its entry point lies outside the file.
pub fn entry_point_offset(data: &[u8]) -> Option<u64> {
    let offset = if data.starts_with(b"MZ") {
        pe_entry_point(data)?
    } else if data.starts_with(b"\x7fELF") {
        elf_entry_point(data)?
    } else {
        return None;
    };
    (offset < data.len() as u64).then_some(offset)
}

fn pe_entry_point(data: &[u8]) -> Option<u64> {
    let pe = PE::parse(data)
        .map_err(|e| trace!(error = %e, "not a PE image"))
        .ok()?;
    // Without an optional header there is no AddressOfEntryPoint.
    if pe.header.optional_header.is_none() {
        return None;
    }
    let entry = u64::try_from(pe.entry).ok()?;

    for section in &pe.sections {
        let start = u64::from(section.virtual_address);
        let span = section.virtual_size.max(section.size_of_raw_data);
        if entry >= start && entry < start + u64::from(span) {
            return Some(entry - start + u64::from(section.pointer_to_raw_data));
        }
    }
    // Outside every section: headers are mapped 1:1.
    Some(entry)
}

fn elf_entry_point(data: &[u8]) -> Option<u64> {
    let elf = Elf::parse(data)
        .map_err(|e| trace!(error = %e, "not an ELF image"))
        .ok()?;
    let entry = elf.entry;
    elf.program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .find(|ph| entry >= ph.p_vaddr && entry < ph.p_vaddr.saturating_add(ph.p_memsz))
        .map(|ph| entry - ph.p_vaddr + ph.p_offset)
}
