// Copyright 2024 WinMux Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Builds a security descriptor that grants full control to the calling
//! user's own SID and nobody else, for the named pipe the daemon listens
//! on. Unlike a Unix domain socket's `0600` permission bits (what
//! `libshpool` relies on), Windows named pipes need an explicit ACL, built
//! from the current process token's user SID via `GetTokenInformation`.

use std::mem;

use thiserror::Error;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Memory::{LocalFree, HLOCAL};
use windows::Win32::Security::Authorization::{
    BuildExplicitAccessWithSidW, SetEntriesInAclW, EXPLICIT_ACCESS_W, NO_INHERITANCE,
    SET_ACCESS, TRUSTEE_IS_SID, TRUSTEE_IS_USER,
};
use windows::Win32::Security::{
    GetTokenInformation, InitializeSecurityDescriptor, SetSecurityDescriptorDacl, ACL,
    PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES, SECURITY_DESCRIPTOR,
    TOKEN_QUERY, TOKEN_USER, TokenUser,
};
use windows::Win32::Storage::FileSystem::GENERIC_ALL;
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Win32 call failed: {0}")]
    Win32(#[from] windows::core::Error),
}

/// An owned `SECURITY_ATTRIBUTES` plus the buffers it points into. Must
/// stay alive for as long as the pipe handle created from it is open.
pub struct PipeSecurity {
    #[allow(dead_code)] // kept alive for its Drop impl only
    descriptor: Box<SECURITY_DESCRIPTOR>,
    #[allow(dead_code)]
    acl: AclGuard,
    pub attributes: SECURITY_ATTRIBUTES,
}

struct AclGuard(*mut ACL);

impl Drop for AclGuard {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                let _ = LocalFree(HLOCAL(self.0 as *mut _));
            }
        }
    }
}

/// Build a security descriptor granting `GENERIC_ALL` to the SID of the
/// user running this process, and nothing to anyone else.
pub fn current_user_only() -> Result<PipeSecurity, SecurityError> {
    let sid = current_user_sid()?;

    let mut explicit_access = EXPLICIT_ACCESS_W::default();
    unsafe {
        BuildExplicitAccessWithSidW(
            &mut explicit_access,
            sid.as_psid(),
            GENERIC_ALL.0,
            SET_ACCESS,
            NO_INHERITANCE,
        );
        explicit_access.Trustee.TrusteeForm = TRUSTEE_IS_SID;
        explicit_access.Trustee.TrusteeType = TRUSTEE_IS_USER;
    }

    let mut acl_ptr: *mut ACL = std::ptr::null_mut();
    unsafe {
        SetEntriesInAclW(Some(&[explicit_access]), None, &mut acl_ptr)
            .ok()
            .map_err(SecurityError::Win32)?;
    }
    let acl_guard = AclGuard(acl_ptr);

    let mut descriptor = Box::new(SECURITY_DESCRIPTOR::default());
    unsafe {
        InitializeSecurityDescriptor(
            PSECURITY_DESCRIPTOR(&mut *descriptor as *mut _ as *mut _),
            1, // SECURITY_DESCRIPTOR_REVISION
        )?;
        SetSecurityDescriptorDacl(
            PSECURITY_DESCRIPTOR(&mut *descriptor as *mut _ as *mut _),
            true,
            Some(acl_ptr),
            false,
        )?;
    }

    let attributes = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: &mut *descriptor as *mut _ as *mut _,
        bInheritHandle: false.into(),
    };

    Ok(PipeSecurity { descriptor, acl: acl_guard, attributes })
}

struct OwnedSid(Vec<u8>);

impl OwnedSid {
    fn as_psid(&self) -> windows::Win32::Security::PSID {
        windows::Win32::Security::PSID(self.0.as_ptr() as *mut _)
    }
}

fn current_user_sid() -> Result<OwnedSid, SecurityError> {
    unsafe {
        let mut token = HANDLE::default();
        OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token)?;

        let mut needed = 0u32;
        let _ = GetTokenInformation(token, TokenUser, None, 0, &mut needed);

        let mut buf = vec![0u8; needed as usize];
        let result = GetTokenInformation(
            token,
            TokenUser,
            Some(buf.as_mut_ptr() as *mut _),
            needed,
            &mut needed,
        );
        let _ = CloseHandle(token);
        result?;

        let token_user = &*(buf.as_ptr() as *const TOKEN_USER);
        let sid_len =
            windows::Win32::Security::GetLengthSid(token_user.User.Sid) as usize;
        let sid_bytes =
            std::slice::from_raw_parts(token_user.User.Sid.0 as *const u8, sid_len).to_vec();
        Ok(OwnedSid(sid_bytes))
    }
}
