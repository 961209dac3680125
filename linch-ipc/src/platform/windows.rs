// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Windows named pipe endpoint: instance creation with a restrictive
//! security descriptor, and client PID acquisition.
//!
//! A named pipe instance serves one client at a time, so the daemon keeps a
//! pool of pre-created instances; this module only knows how to create one
//! instance with the right flags and DACL.

use std::ffi::{CStr, CString};
use std::io;
use std::os::windows::io::AsRawHandle;
use std::ptr::null_mut;

use tokio::net::windows::named_pipe::{NamedPipeServer, PipeMode, ServerOptions};
use tracing::warn;
use winapi::shared::minwindef::DWORD;
use winapi::shared::ntdef::PVOID;
use winapi::shared::sddl::{
    ConvertSidToStringSidA, ConvertStringSecurityDescriptorToSecurityDescriptorA, SDDL_REVISION_1,
};
use winapi::shared::winerror::{ERROR_ACCESS_DENIED, ERROR_INSUFFICIENT_BUFFER};
use winapi::um::handleapi::CloseHandle;
use winapi::um::minwinbase::SECURITY_ATTRIBUTES;
use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
use winapi::um::securitybaseapi::GetTokenInformation;
use winapi::um::winbase::LocalFree;
use winapi::um::winnt::{TokenUser, HANDLE, TOKEN_QUERY, TOKEN_USER};
use windows_sys::Win32::System::Pipes::GetNamedPipeClientProcessId;
use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

use super::{PeerCredentials, PidConfidence, PidSource};

pub const PIPE_PATH: &str = r"\\.\pipe\";
pub const PIPE_BUFFER_SIZE: u32 = 65536;

/// Default pipe name, one per daemon process.
pub fn default_pipe_name() -> String {
    format!("linch-mind-{}", std::process::id())
}

/// Expands a bare pipe name to its full `\\.\pipe\` form; names already in
/// full form pass through unchanged.
pub fn full_pipe_name(name: &str) -> String {
    if name.starts_with(PIPE_PATH) {
        name.to_string()
    } else {
        format!("{PIPE_PATH}{name}")
    }
}

/// A security descriptor handed to every pipe instance of the pool.
///
/// The DACL grants full control to the current user SID, read/write to
/// Administrators, and carries an explicit deny ACE for Everyone. If the
/// rich descriptor cannot be built, the fallback allows only the current
/// user SID.
pub struct PipeSecurityAttributes {
    descriptor: PVOID,
    attributes: SECURITY_ATTRIBUTES,
}

// The descriptor is an owned LocalAlloc'd blob; nothing in it is tied to the
// creating thread.
unsafe impl Send for PipeSecurityAttributes {}

impl PipeSecurityAttributes {
    pub fn for_current_user() -> io::Result<Self> {
        let sid = current_user_sid()?;
        let rich = format!("D:P(A;;GA;;;{sid})(A;;GRGW;;;BA)(D;;GA;;;WD)");
        match Self::from_sddl(&rich) {
            Ok(attrs) => Ok(attrs),
            Err(e) => {
                warn!(
                    "could not build pipe security descriptor, falling back to owner-only: {}",
                    e
                );
                Self::from_sddl(&format!("D:P(A;;GA;;;{sid})"))
            }
        }
    }

    fn from_sddl(sddl: &str) -> io::Result<Self> {
        let c_sddl =
            CString::new(sddl).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut descriptor: PVOID = null_mut();
        let converted = unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorA(
                c_sddl.as_ptr(),
                SDDL_REVISION_1 as DWORD,
                &mut descriptor,
                null_mut(),
            )
        };
        if converted == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(PipeSecurityAttributes {
            descriptor,
            attributes: SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD,
                lpSecurityDescriptor: descriptor,
                bInheritHandle: 0,
            },
        })
    }

    pub fn as_mut_ptr(&mut self) -> *mut SECURITY_ATTRIBUTES {
        &mut self.attributes
    }
}

impl Drop for PipeSecurityAttributes {
    fn drop(&mut self) {
        unsafe {
            LocalFree(self.descriptor as HANDLE);
        }
    }
}

/// String SID of the user this process runs as.
pub fn current_user_sid() -> io::Result<String> {
    unsafe {
        let mut access_token = null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut access_token) == 0 {
            return Err(io::Error::last_os_error());
        }

        let mut info_buffer_size = 0;
        if GetTokenInformation(
            access_token,
            TokenUser,
            null_mut(),
            0,
            &mut info_buffer_size,
        ) == 0
        {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(ERROR_INSUFFICIENT_BUFFER as i32) {
                CloseHandle(access_token);
                return Err(err);
            }
        }

        let user_token_mem = vec![0u8; info_buffer_size as usize];
        let user_token = user_token_mem.as_ptr() as *const TOKEN_USER;
        if GetTokenInformation(
            access_token,
            TokenUser,
            user_token as *mut _,
            info_buffer_size,
            &mut info_buffer_size,
        ) == 0
        {
            let err = io::Error::last_os_error();
            CloseHandle(access_token);
            return Err(err);
        }

        let mut string_sid = null_mut();
        let converted = ConvertSidToStringSidA((*user_token).User.Sid, &mut string_sid);
        CloseHandle(access_token);
        if converted == 0 {
            return Err(io::Error::last_os_error());
        }

        let sid = String::from_utf8_lossy(CStr::from_ptr(string_sid).to_bytes()).to_string();
        LocalFree(string_sid as HANDLE);
        Ok(sid)
    }
}

/// Creates one pipe instance in message mode with overlapped I/O, duplex
/// access and 64 KiB buffers. The first instance of a name additionally
/// claims `FILE_FLAG_FIRST_PIPE_INSTANCE` so a squatting process surfaces as
/// an address-in-use failure instead of silently sharing the name.
pub fn create_pipe_instance(
    name: &str,
    first: bool,
    security: Option<&mut PipeSecurityAttributes>,
) -> io::Result<NamedPipeServer> {
    let mut options = ServerOptions::new();
    options
        .access_inbound(true)
        .access_outbound(true)
        .pipe_mode(PipeMode::Message)
        .reject_remote_clients(true)
        .in_buffer_size(PIPE_BUFFER_SIZE)
        .out_buffer_size(PIPE_BUFFER_SIZE)
        .first_pipe_instance(first);

    let result = match security {
        Some(attrs) => unsafe {
            options.create_with_security_attributes_raw(name, attrs.as_mut_ptr().cast())
        },
        None => options.create(name),
    };

    result.map_err(|e| {
        if first && e.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32) {
            io::Error::new(io::ErrorKind::AddrInUse, e)
        } else {
            e
        }
    })
}

/// Client PID of a connected pipe instance. The pipe ACL has already
/// filtered by user SID, so the PID is only corroborating evidence; its
/// confidence tag is `medium`.
pub fn peer_credentials(pipe: &NamedPipeServer) -> PeerCredentials {
    let mut pid: u32 = 0;
    let ok = unsafe {
        GetNamedPipeClientProcessId(pipe.as_raw_handle() as _, &mut pid)
    };
    if ok != 0 && pid != 0 {
        PeerCredentials {
            pid: Some(pid as i32),
            uid: None,
            gid: None,
            source: PidSource::PipeClient,
            confidence: PidConfidence::Medium,
        }
    } else {
        PeerCredentials::unavailable()
    }
}

/// Liveness probe used by the handshake verifier. Access denied still means
/// the process exists.
pub fn pid_alive(pid: u32) -> bool {
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle != 0 {
            windows_sys::Win32::Foundation::CloseHandle(handle);
            true
        } else {
            windows_sys::Win32::Foundation::GetLastError()
                == windows_sys::Win32::Foundation::ERROR_ACCESS_DENIED
        }
    }
}
