//! Static PE32 patcher: appends an executable section containing a
//! startup shim and redirects the entry point to it.
//!
//! The shim preserves registers and flags, resolves `MessageBoxA` out of
//! `user32.dll` through the image's own kernel32 IAT slots for
//! `LoadLibraryA` and `GetProcAddress`, shows a fixed message, restores
//! state and jumps to the original entry point. Code generation is
//! two-phase: emission records named fixup sites, and absolute addresses
//! are resolved once the section's final placement is known.
//!
//! Base relocations are not processed for the patched image; the shim's
//! absolute addresses assume the image loads at its preferred base.

use log::{debug, info};

use crate::error::{ProtectError, Result};
use crate::pe::{
    align_up, read_u32, write_u16, write_u32, PeImage, ORDINAL_FLAG32, SECTION_CNT_CODE,
    SECTION_HEADER_SIZE, SECTION_MEM_EXECUTE, SECTION_MEM_READ,
};

const SECTION_NAME: &[u8; 8] = b".notice\0";
const TARGET_MODULE: &[u8] = b"user32.dll\0";
const TARGET_SYMBOL: &[u8] = b"MessageBoxA\0";
const MESSAGE_TEXT: &[u8] = b"Hello\0";

/// Handle to a 4-byte fixup site recorded during emission.
#[derive(Debug, Clone, Copy)]
pub struct SiteId(usize);

struct FixupSite {
    name: &'static str,
    offset: usize,
    resolved: bool,
}

/// Emits machine code with named placeholder sites, resolved in a second
/// pass once final absolute addresses are known.
pub struct CodeBuilder {
    code: Vec<u8>,
    sites: Vec<FixupSite>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        CodeBuilder {
            code: Vec::new(),
            sites: Vec::new(),
        }
    }

    pub fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Emits a 4-byte placeholder and records it under `name`.
    pub fn emit_site(&mut self, name: &'static str) -> SiteId {
        let id = SiteId(self.sites.len());
        self.sites.push(FixupSite {
            name,
            offset: self.code.len(),
            resolved: false,
        });
        self.code.extend_from_slice(&[0, 0, 0, 0]);
        id
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn resolve(&mut self, id: SiteId, value: u32) {
        let site = &mut self.sites[id.0];
        write_u32(&mut self.code, site.offset, value);
        site.resolved = true;
    }

    /// Finishes emission; an unresolved site is a programming error in the
    /// caller and reported as corruption rather than silently emitted.
    pub fn finish(self) -> Result<Vec<u8>> {
        if let Some(site) = self.sites.iter().find(|s| !s.resolved) {
            debug!("unresolved fixup site: {}", site.name);
            return Err(ProtectError::Format("unresolved fixup site in shim"));
        }
        Ok(self.code)
    }
}

impl Default for CodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// IAT slot RVAs of the two loader primitives the shim calls through.
struct LoaderImports {
    load_library_iat_rva: u32,
    get_proc_address_iat_rva: u32,
}

fn find_loader_imports(pe: &PeImage) -> Result<LoaderImports> {
    let descriptors = pe.import_descriptors()?;
    if descriptors.is_empty() {
        return Err(ProtectError::Format("image has no import directory"));
    }

    let mut load_library = None;
    let mut get_proc_address = None;
    for desc in &descriptors {
        let dll = pe.c_string_at_rva(desc.name_rva)?;
        if !dll.to_ascii_uppercase().contains("KERNEL32") {
            continue;
        }
        let thunk_rva = if desc.original_first_thunk != 0 {
            desc.original_first_thunk
        } else {
            desc.first_thunk
        };
        let mut index = 0u32;
        loop {
            let offset = pe.rva_to_offset(thunk_rva + index * 4)?;
            let entry = read_u32(pe.data, offset)?;
            if entry == 0 {
                break;
            }
            if entry & ORDINAL_FLAG32 == 0 {
                // Hint/name entry: two hint bytes, then the symbol name.
                let name = pe.c_string_at_rva(entry + 2)?;
                let slot = desc.first_thunk + index * 4;
                if name == "LoadLibraryA" {
                    load_library = Some(slot);
                } else if name == "GetProcAddress" {
                    get_proc_address = Some(slot);
                }
            }
            index += 1;
        }
    }

    match (load_library, get_proc_address) {
        (Some(ll), Some(gpa)) => Ok(LoaderImports {
            load_library_iat_rva: ll,
            get_proc_address_iat_rva: gpa,
        }),
        // Without both primitives the shim has no way to reach the
        // module's symbol table at runtime.
        _ => Err(ProtectError::Format(
            "required loader imports not present (LoadLibraryA / GetProcAddress)",
        )),
    }
}

/// Patches a PE32 image: injects the startup shim into a new (or, when no
/// header slot is free, extended last) executable section and redirects
/// `AddressOfEntryPoint` to it. Returns the rewritten file image.
pub fn patch(input: &[u8]) -> Result<Vec<u8>> {
    let pe = PeImage::parse(input)?;
    let imports = find_loader_imports(&pe)?;

    let image_base = pe.optional.image_base;
    let original_entry_rva = pe.optional.address_of_entry_point;
    let file_align = pe.optional.file_alignment;
    let section_align = pe.optional.section_alignment;

    // Placement: raw data right after the last section's raw data,
    // virtual address right after its mapped extent.
    let last = pe
        .sections
        .last()
        .ok_or(ProtectError::Format("image declares no sections"))?;
    let new_raw_ptr = align_up(last.pointer_to_raw_data + last.size_of_raw_data, file_align);
    let new_va = align_up(
        last.virtual_address + last.virtual_size.max(last.size_of_raw_data),
        section_align,
    );

    let header_end = pe.section_table_offset + pe.sections.len() * SECTION_HEADER_SIZE;
    let can_add_section =
        header_end + SECTION_HEADER_SIZE <= pe.sections[0].pointer_to_raw_data as usize;

    // Phase one: emit the shim with placeholder sites.
    let mut builder = CodeBuilder::new();
    builder.emit(&[0x60]); // pushad
    builder.emit(&[0x9C]); // pushfd

    builder.emit(&[0x68]); // push <module name>
    let module_site = builder.emit_site("module name");
    builder.emit(&[0xFF, 0x15]); // call [<load primitive slot>]
    let load_site = builder.emit_site("load primitive");

    builder.emit(&[0x68]); // push <symbol name>
    let symbol_site = builder.emit_site("symbol name");
    builder.emit(&[0x50]); // push eax (module handle)
    builder.emit(&[0xFF, 0x15]); // call [<resolve primitive slot>]
    let resolve_site = builder.emit_site("resolve primitive");

    builder.emit(&[0x6A, 0x00]); // push 0 (uType)
    builder.emit(&[0x68]); // push <caption>
    let caption_site = builder.emit_site("caption");
    builder.emit(&[0x68]); // push <text>
    let text_site = builder.emit_site("text");
    builder.emit(&[0x6A, 0x00]); // push 0 (hWnd)
    builder.emit(&[0xFF, 0xD0]); // call eax

    builder.emit(&[0x9D]); // popfd
    builder.emit(&[0x61]); // popad

    builder.emit(&[0xB8]); // mov eax, <original entry>
    let entry_site = builder.emit_site("original entry");
    builder.emit(&[0xFF, 0xE0]); // jmp eax

    // Section layout: code, then the string pool.
    let code_len = builder.len() as u32;
    let module_off = code_len;
    let symbol_off = module_off + TARGET_MODULE.len() as u32;
    let text_off = symbol_off + TARGET_SYMBOL.len() as u32;
    let total_len = text_off + MESSAGE_TEXT.len() as u32;

    // Phase two: backpatch absolute addresses against the final layout.
    let section_base = image_base + new_va;
    builder.resolve(module_site, section_base + module_off);
    builder.resolve(load_site, image_base + imports.load_library_iat_rva);
    builder.resolve(symbol_site, section_base + symbol_off);
    builder.resolve(resolve_site, image_base + imports.get_proc_address_iat_rva);
    builder.resolve(caption_site, section_base + text_off);
    builder.resolve(text_site, section_base + text_off);
    builder.resolve(entry_site, image_base + original_entry_rva);
    let code = builder.finish()?;

    let raw_size = align_up(total_len, file_align);
    let virtual_span = align_up(total_len, section_align);

    let mut section_data = vec![0u8; raw_size as usize];
    section_data[..code.len()].copy_from_slice(&code);
    section_data[module_off as usize..symbol_off as usize].copy_from_slice(TARGET_MODULE);
    section_data[symbol_off as usize..text_off as usize].copy_from_slice(TARGET_SYMBOL);
    section_data[text_off as usize..total_len as usize].copy_from_slice(MESSAGE_TEXT);

    // Assemble the output image.
    let mut out = input.to_vec();
    let required = new_raw_ptr as usize + raw_size as usize;
    if out.len() < required {
        out.resize(required, 0);
    }
    out[new_raw_ptr as usize..required].copy_from_slice(&section_data);

    let optional_offset = pe.nt_offset + 4 + 20;
    if can_add_section {
        debug!("adding section {:?}", String::from_utf8_lossy(SECTION_NAME));
        let h = header_end;
        out[h..h + 8].copy_from_slice(SECTION_NAME);
        write_u32(&mut out, h + 8, total_len); // VirtualSize
        write_u32(&mut out, h + 12, new_va);
        write_u32(&mut out, h + 16, raw_size);
        write_u32(&mut out, h + 20, new_raw_ptr);
        write_u32(&mut out, h + 24, 0);
        write_u32(&mut out, h + 28, 0);
        write_u32(&mut out, h + 32, 0);
        write_u32(
            &mut out,
            h + 36,
            SECTION_CNT_CODE | SECTION_MEM_EXECUTE | SECTION_MEM_READ,
        );
        write_u16(
            &mut out,
            pe.nt_offset + 6,
            pe.file.number_of_sections + 1,
        );
    } else {
        // No spare header slot before the first section's raw data: grow
        // the last section in place and mark it executable.
        debug!("no free section-header slot, extending last section");
        let h = pe.section_table_offset + (pe.sections.len() - 1) * SECTION_HEADER_SIZE;
        let grown_virtual = align_up(new_va - last.virtual_address + virtual_span, section_align);
        let grown_raw = new_raw_ptr - last.pointer_to_raw_data + raw_size;
        write_u32(&mut out, h + 8, grown_virtual);
        write_u32(&mut out, h + 16, grown_raw);
        let characteristics =
            last.characteristics | SECTION_CNT_CODE | SECTION_MEM_EXECUTE | SECTION_MEM_READ;
        write_u32(&mut out, h + 36, characteristics);
    }

    write_u32(&mut out, optional_offset + 16, new_va); // AddressOfEntryPoint
    let size_of_image = align_up(new_va + virtual_span, section_align);
    write_u32(&mut out, optional_offset + 56, size_of_image);

    info!(
        "entry point moved {:#x} -> {:#x}, image size {:#x}",
        original_entry_rva, new_va, size_of_image
    );
    Ok(out)
}

/// Reads back the original entry RVA a patched image will fall through
/// to: the absolute operand of the shim's final `mov eax, imm32`.
pub fn original_entry_of_patched(patched: &[u8]) -> Result<u32> {
    let pe = PeImage::parse(patched)?;
    let entry_offset = pe.rva_to_offset(pe.optional.address_of_entry_point)?;
    // The `mov eax` operand sits 7 bytes from the end of the shim code.
    let code = &patched[entry_offset..];
    let mov_pos = code
        .windows(7)
        .rposition(|w| w[0] == 0xB8 && w[5] == 0xFF && w[6] == 0xE0)
        .ok_or(ProtectError::Format("shim epilogue not found"))?;
    let absolute = read_u32(code, mov_pos + 1)?;
    Ok(absolute - pe.optional.image_base)
}
